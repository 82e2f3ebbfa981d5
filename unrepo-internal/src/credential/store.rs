use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{hash_token, parse_token, Credential, NewCredential};
use crate::error::Error;

/// Result of resolving a presented token.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Found(Credential),
    NotFound,
    /// The token failed the format check; no store lookup was made.
    InvalidFormat,
}

/// Result of [`CredentialStore::create`]. Creation is idempotent per
/// (account, service class): an existing active credential is returned instead.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Credential),
    Existing(Credential),
}

impl CreateOutcome {
    pub fn credential(&self) -> &Credential {
        match self {
            CreateOutcome::Created(credential) | CreateOutcome::Existing(credential) => credential,
        }
    }

    pub fn into_credential(self) -> Credential {
        match self {
            CreateOutcome::Created(credential) | CreateOutcome::Existing(credential) => credential,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Durable mapping from token to credential record.
///
/// `try_record_use` is the only operation that gates a request; it must be a single
/// atomic conditional increment in every implementation.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Credential>, Error>;

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, Error>;

    /// Returns the account's active credential for the class if one exists,
    /// otherwise stores a fresh one. Atomic per (account, class).
    async fn create(&self, new: NewCredential, now: DateTime<Utc>) -> Result<CreateOutcome, Error>;

    /// Unconditionally increments the usage counter and returns the new value.
    async fn record_use(&self, credential_id: &str, now: DateTime<Utc>) -> Result<u64, Error>;

    /// Increments the usage counter only if it is below `cap`.
    /// Returns the new value, or `None` when the cap was already reached.
    async fn try_record_use(
        &self,
        credential_id: &str,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, Error>;

    /// Soft-deletes the credential. Returns false if it does not exist or is owned
    /// by another account.
    async fn deactivate(&self, credential_id: &str, account_id: &str) -> Result<bool, Error>;

    /// All credentials of the account, active or not, newest first.
    async fn list_for_account(&self, account_id: &str) -> Result<Vec<Credential>, Error>;

    async fn resolve(&self, token: &str) -> Result<Resolved, Error> {
        if parse_token(token).is_none() {
            return Ok(Resolved::InvalidFormat);
        }
        Ok(match self.find_by_token_hash(&hash_token(token)).await? {
            Some(credential) => Resolved::Found(credential),
            None => Resolved::NotFound,
        })
    }
}
