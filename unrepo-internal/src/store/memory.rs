use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::account::{Account, AccountStore, Tier};
use crate::credential::{
    CreateOutcome, Credential, CredentialStore, NewCredential, ServiceClass,
};
use crate::error::{Error, ErrorDetails};
use crate::ledger::{UsageLedger, UsageRecord, UsageSummary, WindowAdmission};

/// Process-local backing store for credentials, accounts and the usage ledger.
///
/// Each conditional operation runs while holding the shard lock of the entry it
/// touches, which makes it atomic with respect to every other caller in the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    credentials: DashMap<String, Credential>,
    token_index: DashMap<String, String>,
    active_index: DashMap<(String, ServiceClass), String>,
    accounts: DashMap<String, Account>,
    /// Per credential, sorted by timestamp.
    ledger: DashMap<String, Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_credential(&self, credential: Credential) {
        self.inner
            .token_index
            .insert(credential.token_hash(), credential.id.clone());
        self.inner
            .credentials
            .insert(credential.id.clone(), credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Credential>, Error> {
        let Some(id) = self
            .inner
            .token_index
            .get(token_hash)
            .map(|id| id.value().clone())
        else {
            return Ok(None);
        };
        CredentialStore::get(self, &id).await
    }

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, Error> {
        Ok(self
            .inner
            .credentials
            .get(credential_id)
            .map(|credential| credential.value().clone()))
    }

    async fn create(&self, new: NewCredential, now: DateTime<Utc>) -> Result<CreateOutcome, Error> {
        let key = (new.account_id.clone(), new.service_class);
        match self.inner.active_index.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = self
                    .inner
                    .credentials
                    .get(entry.get())
                    .map(|credential| credential.value().clone());
                match existing {
                    Some(existing) if existing.is_usable(now) => {
                        Ok(CreateOutcome::Existing(existing))
                    }
                    _ => {
                        let credential = new.into_credential(now);
                        entry.insert(credential.id.clone());
                        self.insert_credential(credential.clone());
                        Ok(CreateOutcome::Created(credential))
                    }
                }
            }
            Entry::Vacant(entry) => {
                let credential = new.into_credential(now);
                entry.insert(credential.id.clone());
                self.insert_credential(credential.clone());
                Ok(CreateOutcome::Created(credential))
            }
        }
    }

    async fn record_use(&self, credential_id: &str, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut credential = self
            .inner
            .credentials
            .get_mut(credential_id)
            .ok_or_else(|| {
                Error::new(ErrorDetails::CredentialNotFound {
                    credential_id: credential_id.to_string(),
                })
            })?;
        credential.usage_count += 1;
        credential.last_used_at = Some(now);
        Ok(credential.usage_count)
    }

    async fn try_record_use(
        &self,
        credential_id: &str,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, Error> {
        let mut credential = self
            .inner
            .credentials
            .get_mut(credential_id)
            .ok_or_else(|| {
                Error::new(ErrorDetails::CredentialNotFound {
                    credential_id: credential_id.to_string(),
                })
            })?;
        if credential.usage_count >= cap {
            return Ok(None);
        }
        credential.usage_count += 1;
        credential.last_used_at = Some(now);
        Ok(Some(credential.usage_count))
    }

    async fn deactivate(&self, credential_id: &str, account_id: &str) -> Result<bool, Error> {
        let service_class = {
            let Some(mut credential) = self.inner.credentials.get_mut(credential_id) else {
                return Ok(false);
            };
            if credential.account_id != account_id {
                return Ok(false);
            }
            credential.is_active = false;
            credential.service_class
        };
        // The credential guard is released before touching the index; `create`
        // takes the locks in the opposite order.
        self.inner
            .active_index
            .remove_if(&(account_id.to_string(), service_class), |_, id| {
                id == credential_id
            });
        Ok(true)
    }

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<Credential>, Error> {
        let mut credentials: Vec<Credential> = self
            .inner
            .credentials
            .iter()
            .filter(|credential| credential.account_id == account_id)
            .map(|credential| credential.value().clone())
            .collect();
        credentials.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(credentials)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, account_id: &str) -> Result<Option<Account>, Error> {
        Ok(self
            .inner
            .accounts
            .get(account_id)
            .map(|account| account.value().clone()))
    }

    async fn upsert(&self, account: Account) -> Result<(), Error> {
        self.inner.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn set_payment_verified(&self, account_id: &str, verified: bool) -> Result<bool, Error> {
        Ok(match self.inner.accounts.get_mut(account_id) {
            Some(mut account) => {
                account.payment_verified = verified;
                true
            }
            None => false,
        })
    }

    async fn set_token_holder(
        &self,
        account_id: &str,
        is_holder: bool,
        balance: Option<f64>,
    ) -> Result<bool, Error> {
        Ok(match self.inner.accounts.get_mut(account_id) {
            Some(mut account) => {
                account.is_token_holder = is_holder;
                if let Some(balance) = balance {
                    account.token_balance = balance;
                }
                true
            }
            None => false,
        })
    }
}

fn insert_sorted(records: &mut Vec<UsageRecord>, record: UsageRecord) {
    let position = records.partition_point(|existing| existing.timestamp <= record.timestamp);
    records.insert(position, record);
}

/// Records with `timestamp >= since`, oldest first.
fn window_slice(records: &[UsageRecord], since: DateTime<Utc>) -> &[UsageRecord] {
    let start = records.partition_point(|record| record.timestamp < since);
    &records[start..]
}

#[async_trait]
impl UsageLedger for MemoryStore {
    async fn append(&self, record: UsageRecord) -> Result<(), Error> {
        let mut records = self
            .inner
            .ledger
            .entry(record.credential_id.clone())
            .or_default();
        insert_sorted(&mut records, record);
        Ok(())
    }

    async fn count_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
        tier: Option<Tier>,
    ) -> Result<u64, Error> {
        let Some(records) = self.inner.ledger.get(credential_id) else {
            return Ok(0);
        };
        let window = window_slice(&records, since);
        let count = match tier {
            None => window.len(),
            Some(tier) => window.iter().filter(|record| record.tier == tier).count(),
        };
        Ok(count as u64)
    }

    async fn append_within_window(
        &self,
        record: UsageRecord,
        since: DateTime<Utc>,
        cap: u64,
    ) -> Result<WindowAdmission, Error> {
        let mut records = self
            .inner
            .ledger
            .entry(record.credential_id.clone())
            .or_default();
        let (count, oldest) = window_slice(&records, since)
            .iter()
            .filter(|existing| existing.tier == record.tier)
            .fold((0u64, None), |(count, oldest), existing| {
                (count + 1, oldest.or(Some(existing.timestamp)))
            });
        if count >= cap {
            return Ok(WindowAdmission::Full { count, oldest });
        }
        let oldest = oldest.map_or(record.timestamp, |oldest: DateTime<Utc>| {
            oldest.min(record.timestamp)
        });
        insert_sorted(&mut records, record);
        Ok(WindowAdmission::Admitted {
            count_before: count,
            oldest,
        })
    }

    async fn summarize(
        &self,
        credential_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<UsageSummary, Error> {
        let mut records = Vec::new();
        for credential_id in credential_ids {
            if let Some(entry) = self.inner.ledger.get(credential_id) {
                records.extend(entry.value().iter().cloned());
            }
        }
        Ok(UsageSummary::from_records(&records, since))
    }
}
