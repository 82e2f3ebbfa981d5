pub mod memory;
pub mod redis;

use std::sync::Arc;

use secrecy::SecretString;

use crate::account::AccountStore;
use crate::config::RedisConfig;
use crate::credential::CredentialStore;
use crate::error::Error;
use crate::ledger::UsageLedger;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// The three stores a quota decision reads and writes.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl Stores {
    pub fn memory(store: MemoryStore) -> Self {
        Self {
            credentials: Arc::new(store.clone()),
            accounts: Arc::new(store.clone()),
            ledger: Arc::new(store),
            backend: StoreBackend::Memory,
        }
    }

    pub async fn redis(url: &SecretString, config: &RedisConfig) -> Result<Self, Error> {
        let store = RedisStore::connect(url, config).await?;
        store.ping().await?;
        Ok(Self {
            credentials: Arc::new(store.clone()),
            accounts: Arc::new(store.clone()),
            ledger: Arc::new(store),
            backend: StoreBackend::Redis,
        })
    }
}
