#![cfg(feature = "redis_tests")]
//! Requires a reachable Redis at `UNREPO_REDIS_URL`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use unrepo_internal::account::{Account, AccountStore, Tier};
use unrepo_internal::clock::ManualClock;
use unrepo_internal::config::{Config, RedisConfig};
use unrepo_internal::credential::{CredentialStore, NewCredential, ServiceClass};
use unrepo_internal::ledger::{UsageLedger, UsageRecord, WindowAdmission};
use unrepo_internal::quota::{DenialReason, QuotaEngine};
use unrepo_internal::rate_limit::Remaining;
use unrepo_internal::store::{RedisStore, Stores};
use uuid::Uuid;

fn redis_url() -> SecretString {
    SecretString::from(
        std::env::var("UNREPO_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
    )
}

fn redis_config() -> RedisConfig {
    RedisConfig { timeout_ms: 1000 }
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn unique_account() -> String {
    format!("test_{}", Uuid::now_v7().simple())
}

#[tokio::test]
async fn test_redis_credential_roundtrip_and_idempotent_create() {
    let store = RedisStore::connect(&redis_url(), &redis_config()).await.unwrap();
    let account = unique_account();

    let first = store
        .create(NewCredential::new(&account, ServiceClass::Chat, "bot"), start())
        .await
        .unwrap();
    let second = store
        .create(NewCredential::new(&account, ServiceClass::Chat, "bot"), start())
        .await
        .unwrap();
    assert!(first.was_created());
    assert!(!second.was_created());
    assert_eq!(first.credential().token, second.credential().token);

    let found = store
        .find_by_token_hash(&first.credential().token_hash())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.credential().id);
    assert_eq!(found.account_id, account);

    assert!(!store
        .deactivate(&found.id, "someone_else")
        .await
        .unwrap());
    assert!(store.deactivate(&found.id, &account).await.unwrap());
    let listed = store.list_for_account(&account).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_redis_try_record_use_is_atomic() {
    let store = RedisStore::connect(&redis_url(), &redis_config()).await.unwrap();
    let account = unique_account();
    let credential = store
        .create(NewCredential::new(&account, ServiceClass::Analysis, "x"), start())
        .await
        .unwrap()
        .into_credential();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            let id = credential.id.clone();
            tokio::spawn(async move { store.try_record_use(&id, 5, start()).await.unwrap() })
        })
        .collect();
    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap().is_some() {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);
    let stored = CredentialStore::get(&store, &credential.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.usage_count, 5);
}

#[tokio::test]
async fn test_redis_append_within_window_counts_one_tier() {
    let store = RedisStore::connect(&redis_url(), &redis_config()).await.unwrap();
    let credential_id = format!("cred_{}", Uuid::now_v7().simple());
    let record = |tier: Tier, at: DateTime<Utc>| {
        UsageRecord::new(&credential_id, "acct", "/v1/research", tier, at)
    };

    store.append(record(Tier::Free, start())).await.unwrap();
    let since = start() - Duration::hours(1);
    for expected_before in 0..2 {
        let admission = store
            .append_within_window(record(Tier::Premium, start()), since, 2)
            .await
            .unwrap();
        assert!(matches!(
            admission,
            WindowAdmission::Admitted { count_before, .. } if count_before == expected_before
        ));
    }
    assert!(matches!(
        store
            .append_within_window(record(Tier::Premium, start()), since, 2)
            .await
            .unwrap(),
        WindowAdmission::Full { count: 2, .. }
    ));
    assert_eq!(store.count_since(&credential_id, since, None).await.unwrap(), 3);
    assert_eq!(
        store
            .count_since(&credential_id, since, Some(Tier::Premium))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_redis_engine_free_then_premium() {
    let stores = Stores::redis(&redis_url(), &redis_config()).await.unwrap();
    let account = unique_account();
    stores.accounts.upsert(Account::new(&account)).await.unwrap();
    let credential = stores
        .credentials
        .create(NewCredential::new(&account, ServiceClass::Analysis, "x"), start())
        .await
        .unwrap()
        .into_credential();
    let engine = QuotaEngine::new(
        &stores,
        &Config::default(),
        Arc::new(ManualClock::new(start())),
    );

    for expected in [4, 3, 2, 1, 0] {
        let verdict = engine
            .check_and_record(&credential.token, ServiceClass::Analysis, "analyze")
            .await
            .unwrap();
        assert_eq!(verdict.remaining, Remaining::Count(expected));
    }
    let verdict = engine
        .check_and_record(&credential.token, ServiceClass::Analysis, "analyze")
        .await
        .unwrap();
    assert_eq!(verdict.reason, Some(DenialReason::FreeTierExhausted));

    assert!(stores
        .accounts
        .set_token_holder(&account, true, Some(10.0))
        .await
        .unwrap());
    let verdict = engine
        .check_and_record(&credential.token, ServiceClass::Analysis, "analyze")
        .await
        .unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.remaining, Remaining::Count(99));
}
