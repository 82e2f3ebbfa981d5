pub mod fallback;
pub mod keys;
pub mod services;
pub mod status;
