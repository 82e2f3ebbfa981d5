//! API credentials: bearer tokens scoped to exactly one service class.
//!
//! A token has the form `unrepo_<class>_<64 lowercase hex chars>`. Stores index
//! credentials by the SHA-256 of the token so lookups are a single point read.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod store;

pub use store::{CreateOutcome, CredentialStore, Resolved};

pub const TOKEN_PREFIX: &str = "unrepo";
const TOKEN_SECRET_BYTES: usize = 32;
const TOKEN_SECRET_HEX_LEN: usize = TOKEN_SECRET_BYTES * 2;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceClass {
    Analysis,
    Chat,
}

impl ServiceClass {
    pub const ALL: [ServiceClass; 2] = [ServiceClass::Analysis, ServiceClass::Chat];

    /// The segment that appears inside a token of this class.
    pub fn token_marker(self) -> &'static str {
        match self {
            ServiceClass::Analysis => "analysis",
            ServiceClass::Chat => "chat",
        }
    }

    fn from_token_marker(marker: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|class| class.token_marker() == marker)
    }
}

/// Checks the token shape and returns the class its prefix names.
/// `None` means the token is malformed and must never reach a store.
pub fn parse_token(token: &str) -> Option<ServiceClass> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?.strip_prefix('_')?;
    let (marker, secret) = rest.split_once('_')?;
    let class = ServiceClass::from_token_marker(marker)?;
    let well_formed = secret.len() == TOKEN_SECRET_HEX_LEN
        && secret
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    well_formed.then_some(class)
}

pub fn generate_token(service_class: ServiceClass) -> String {
    let secret: [u8; TOKEN_SECRET_BYTES] = rand::random();
    format!(
        "{TOKEN_PREFIX}_{}_{}",
        service_class.token_marker(),
        hex::encode(secret)
    )
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Input to [`CredentialStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewCredential {
    pub account_id: String,
    pub service_class: ServiceClass,
    pub name: String,
    pub expires_in_days: Option<u32>,
}

impl NewCredential {
    pub fn new(
        account_id: impl Into<String>,
        service_class: ServiceClass,
        name: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            service_class,
            name: name.into(),
            expires_in_days: None,
        }
    }

    pub fn with_expiry_days(mut self, days: u32) -> Self {
        self.expires_in_days = Some(days);
        self
    }

    pub fn into_credential(self, now: DateTime<Utc>) -> Credential {
        Credential {
            id: Uuid::now_v7().to_string(),
            token: generate_token(self.service_class),
            account_id: self.account_id,
            service_class: self.service_class,
            name: self.name,
            is_active: true,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            expires_at: self
                .expires_in_days
                .map(|days| now + Duration::days(i64::from(days))),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub token: String,
    pub account_id: String,
    pub service_class: ServiceClass,
    pub name: String,
    pub is_active: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn token_hash(&self) -> String {
        hash_token(&self.token)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Active and not past its expiry.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Enough of the token to recognise it in a listing, never enough to use it.
    pub fn masked_token(&self) -> String {
        let secret_start = TOKEN_PREFIX.len() + self.service_class.token_marker().len() + 2;
        match (
            self.token.get(..secret_start + 4),
            self.token.get(self.token.len().saturating_sub(4)..),
        ) {
            (Some(head), Some(tail)) if self.token.len() > secret_start + 8 => {
                format!("{head}...{tail}")
            }
            _ => "****".to_string(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token", &self.masked_token())
            .field("account_id", &self.account_id)
            .field("service_class", &self.service_class)
            .field("name", &self.name)
            .field("is_active", &self.is_active)
            .field("usage_count", &self.usage_count)
            .field("last_used_at", &self.last_used_at)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
