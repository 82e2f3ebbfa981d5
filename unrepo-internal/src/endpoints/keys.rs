//! Key management for the account named by the session layer.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{Account, Tier};
use crate::auth::AccountId;
use crate::credential::{Credential, NewCredential, ServiceClass};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, StructuredJson};
use crate::ledger::RouteUsage;

const MAX_KEY_NAME_LEN: usize = 100;
const USAGE_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateKeyRequest {
    #[serde(rename = "type")]
    pub key_type: String,
    pub name: String,
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

impl CreateKeyRequest {
    fn validate(&self) -> Result<(ServiceClass, String), Error> {
        let service_class = ServiceClass::from_str(self.key_type.trim()).map_err(|_| {
            Error::new_without_logging(ErrorDetails::InvalidRequest {
                message: "Invalid key type. Must be ANALYSIS or CHAT".to_string(),
            })
        })?;
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::new_without_logging(ErrorDetails::InvalidRequest {
                message: "Key name is required".to_string(),
            }));
        }
        if name.chars().count() > MAX_KEY_NAME_LEN {
            return Err(Error::new_without_logging(ErrorDetails::InvalidRequest {
                message: format!("Key name must be at most {MAX_KEY_NAME_LEN} characters"),
            }));
        }
        if self.expires_in_days == Some(0) {
            return Err(Error::new_without_logging(ErrorDetails::InvalidRequest {
                message: "`expires_in_days` must be positive".to_string(),
            }));
        }
        Ok((service_class, name.to_string()))
    }
}

/// A freshly created (or re-issued) key. The only response that carries the full token.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedKey {
    pub id: String,
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: ServiceClass,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeySummary {
    pub id: String,
    pub masked_key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: ServiceClass,
    pub is_active: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Credential> for KeySummary {
    fn from(credential: &Credential) -> Self {
        Self {
            id: credential.id.clone(),
            masked_key: credential.masked_token(),
            name: credential.name.clone(),
            key_type: credential.service_class,
            is_active: credential.is_active,
            usage_count: credential.usage_count,
            last_used_at: credential.last_used_at,
            created_at: credential.created_at,
            expires_at: credential.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountStatus {
    pub tier: Tier,
    pub payment_verified: bool,
    pub is_token_holder: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListKeysResponse {
    pub keys: Vec<KeySummary>,
    pub account: AccountStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub total_requests: u64,
    pub requests_last_24h: u64,
    pub active_keys: usize,
    pub by_route: Vec<RouteUsage>,
}

/// POST /v1/keys
///
/// Returns the account's usable key for the class when one exists (200), otherwise
/// issues a new one (201). Accounts are registered on first use.
pub async fn create_key_handler(
    State(app_state): AppState,
    AccountId(account_id): AccountId,
    StructuredJson(request): StructuredJson<CreateKeyRequest>,
) -> Result<Response, Error> {
    let (service_class, name) = request.validate()?;
    let engine = &app_state.engine;
    let now = engine.clock().now();

    if engine.tiers().account(&account_id).await?.is_none() {
        tracing::info!(account_id = %account_id, "registering account on first key request");
        engine.tiers().upsert(Account::new(account_id.as_str())).await?;
    }

    let mut new = NewCredential::new(account_id.as_str(), service_class, name);
    new.expires_in_days = request.expires_in_days;
    let outcome = app_state.stores.credentials.create(new, now).await?;

    let created = outcome.was_created();
    let credential = outcome.into_credential();
    tracing::info!(
        account_id = %account_id,
        credential_id = %credential.id,
        service_class = %service_class,
        created,
        "issued API key"
    );

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let body = CreatedKey {
        id: credential.id,
        key: credential.token,
        name: credential.name,
        key_type: credential.service_class,
        created_at: credential.created_at,
        expires_at: credential.expires_at,
        created,
    };
    Ok((status, Json(body)).into_response())
}

/// GET /v1/keys
pub async fn list_keys_handler(
    State(app_state): AppState,
    AccountId(account_id): AccountId,
) -> Result<Json<ListKeysResponse>, Error> {
    let credentials = app_state
        .stores
        .credentials
        .list_for_account(&account_id)
        .await?;
    let account = app_state
        .engine
        .tiers()
        .account(&account_id)
        .await?
        .unwrap_or_else(|| Account::new(account_id.as_str()));

    Ok(Json(ListKeysResponse {
        keys: credentials.iter().map(KeySummary::from).collect(),
        account: AccountStatus {
            tier: account.tier(),
            payment_verified: account.payment_verified,
            is_token_holder: account.is_token_holder,
        },
    }))
}

/// DELETE /v1/keys/{key_id}
pub async fn revoke_key_handler(
    State(app_state): AppState,
    AccountId(account_id): AccountId,
    Path(key_id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let revoked = app_state
        .stores
        .credentials
        .deactivate(&key_id, &account_id)
        .await?;
    if !revoked {
        return Err(Error::new(ErrorDetails::CredentialNotFound {
            credential_id: key_id,
        }));
    }
    tracing::info!(account_id = %account_id, credential_id = %key_id, "revoked API key");
    Ok(Json(serde_json::json!({
        "id": key_id,
        "revoked": true,
    })))
}

/// GET /v1/keys/usage
pub async fn usage_handler(
    State(app_state): AppState,
    AccountId(account_id): AccountId,
) -> Result<Json<UsageResponse>, Error> {
    let now = app_state.engine.clock().now();
    let since = now - Duration::hours(USAGE_LOOKBACK_HOURS);

    let credentials = app_state
        .stores
        .credentials
        .list_for_account(&account_id)
        .await?;
    let ids: Vec<String> = credentials.iter().map(|c| c.id.clone()).collect();
    let summary = app_state.stores.ledger.summarize(&ids, since).await?;

    Ok(Json(UsageResponse {
        total_requests: summary.total,
        requests_last_24h: summary.since_count,
        active_keys: credentials.iter().filter(|c| c.is_usable(now)).count(),
        by_route: summary.by_route,
    }))
}
