pub mod account; // accounts, tiers, and the tier resolver
pub mod auth; // credential gate middleware
pub mod clock;
pub mod config; // gateway config file
pub mod credential; // API credentials and the credential store
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod ledger; // usage ledger
pub mod observability; // logging setup and HTTP tracing
pub mod quota; // the quota decision
pub mod rate_limit; // flat per-class rate limiting
pub mod store; // memory and redis backing stores
