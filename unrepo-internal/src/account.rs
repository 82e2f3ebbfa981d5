use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::config::AccountsConfig;
use crate::error::Error;

/// The way an account proved its identity. An account uses at most one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ExternalIdentity {
    Wallet { address: String },
    Github { github_id: String, username: String },
    Email { address: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub identity: Option<ExternalIdentity>,
    #[serde(default)]
    pub payment_verified: bool,
    #[serde(default)]
    pub is_token_holder: bool,
    #[serde(default)]
    pub token_balance: f64,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identity: None,
            payment_verified: false,
            is_token_holder: false,
            token_balance: 0.0,
        }
    }

    pub fn with_identity(mut self, identity: ExternalIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn tier(&self) -> Tier {
        if is_premium(self) {
            Tier::Premium
        } else {
            Tier::Free
        }
    }
}

/// Pure: premium iff payment is verified or the account holds the token.
pub fn is_premium(account: &Account) -> bool {
    account.payment_verified || account.is_token_holder
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<Account>, Error>;

    async fn upsert(&self, account: Account) -> Result<(), Error>;

    /// Returns false if the account does not exist.
    async fn set_payment_verified(&self, account_id: &str, verified: bool) -> Result<bool, Error>;

    /// Returns false if the account does not exist. `balance` is left untouched when `None`.
    async fn set_token_holder(
        &self,
        account_id: &str,
        is_holder: bool,
        balance: Option<f64>,
    ) -> Result<bool, Error>;
}

#[derive(Debug, Default)]
pub struct TierCacheMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

/// Reads accounts for tier decisions.
///
/// With a zero TTL every lookup goes to the store. Otherwise results may be stale
/// by at most the TTL; flag changes made through this resolver invalidate the entry
/// immediately.
#[derive(Clone)]
pub struct TierResolver {
    store: Arc<dyn AccountStore>,
    cache: Option<Cache<String, Account>>,
    metrics: Arc<TierCacheMetrics>,
}

impl TierResolver {
    pub fn new(store: Arc<dyn AccountStore>, config: &AccountsConfig) -> Self {
        let cache = (config.tier_cache_ttl_ms > 0).then(|| {
            Cache::builder()
                .max_capacity(config.tier_cache_capacity)
                .time_to_live(Duration::from_millis(config.tier_cache_ttl_ms))
                .build()
        });
        Self {
            store,
            cache,
            metrics: Arc::new(TierCacheMetrics::default()),
        }
    }

    pub fn uncached(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            cache: None,
            metrics: Arc::new(TierCacheMetrics::default()),
        }
    }

    pub async fn account(&self, account_id: &str) -> Result<Option<Account>, Error> {
        let Some(cache) = &self.cache else {
            return self.store.get(account_id).await;
        };
        if let Some(account) = cache.get(account_id).await {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(account));
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        let account = self.store.get(account_id).await?;
        if let Some(account) = &account {
            cache.insert(account_id.to_string(), account.clone()).await;
        }
        Ok(account)
    }

    pub async fn upsert(&self, account: Account) -> Result<(), Error> {
        let account_id = account.id.clone();
        self.store.upsert(account).await?;
        self.invalidate(&account_id).await;
        Ok(())
    }

    pub async fn set_payment_verified(
        &self,
        account_id: &str,
        verified: bool,
    ) -> Result<bool, Error> {
        let updated = self.store.set_payment_verified(account_id, verified).await?;
        self.invalidate(account_id).await;
        Ok(updated)
    }

    pub async fn set_token_holder(
        &self,
        account_id: &str,
        is_holder: bool,
        balance: Option<f64>,
    ) -> Result<bool, Error> {
        let updated = self
            .store
            .set_token_holder(account_id, is_holder, balance)
            .await?;
        self.invalidate(account_id).await;
        Ok(updated)
    }

    pub async fn invalidate(&self, account_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(account_id).await;
        }
    }

    pub fn metrics(&self) -> &TierCacheMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_is_premium() {
        let mut account = Account::new("a");
        assert!(!is_premium(&account));
        assert_eq!(account.tier(), Tier::Free);

        account.is_token_holder = true;
        assert!(is_premium(&account));

        account.is_token_holder = false;
        account.payment_verified = true;
        assert_eq!(account.tier(), Tier::Premium);
    }

    #[test]
    fn test_identity_serialization() {
        let account = Account::new("a").with_identity(ExternalIdentity::Wallet {
            address: "0xabc".to_string(),
        });
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["identity"]["method"], "wallet");
        assert_eq!(json["identity"]["address"], "0xabc");

        let parsed: Account = serde_json::from_str(r#"{"id":"b"}"#).unwrap();
        assert_eq!(parsed, Account::new("b"));
    }

    async fn tier_of(resolver: &TierResolver, account_id: &str) -> Option<Tier> {
        resolver
            .account(account_id)
            .await
            .unwrap()
            .map(|account| account.tier())
    }

    #[tokio::test]
    async fn test_uncached_resolver_sees_flag_flip() {
        let store = MemoryStore::default();
        store.upsert(Account::new("acct")).await.unwrap();
        let resolver = TierResolver::uncached(Arc::new(store.clone()));

        assert_eq!(tier_of(&resolver, "acct").await, Some(Tier::Free));
        store.set_payment_verified("acct", true).await.unwrap();
        assert_eq!(tier_of(&resolver, "acct").await, Some(Tier::Premium));
        assert_eq!(tier_of(&resolver, "missing").await, None);
    }

    #[tokio::test]
    async fn test_cached_resolver_invalidates_on_flag_change() {
        let store = MemoryStore::default();
        store.upsert(Account::new("acct")).await.unwrap();
        let config = AccountsConfig {
            tier_cache_ttl_ms: 60_000,
            tier_cache_capacity: 100,
        };
        let resolver = TierResolver::new(Arc::new(store.clone()), &config);

        assert_eq!(tier_of(&resolver, "acct").await, Some(Tier::Free));
        assert_eq!(tier_of(&resolver, "acct").await, Some(Tier::Free));
        assert_eq!(resolver.metrics().cache_hits.load(Ordering::Relaxed), 1);

        assert!(resolver.set_token_holder("acct", true, Some(12.5)).await.unwrap());
        assert_eq!(tier_of(&resolver, "acct").await, Some(Tier::Premium));
        let account = resolver.account("acct").await.unwrap().unwrap();
        assert_eq!(account.token_balance, 12.5);

        assert!(!resolver.set_payment_verified("missing", true).await.unwrap());
    }
}
