//! The single authorization decision made for every gated request.
//!
//! `QuotaEngine::check_and_record` resolves the presented token, checks its
//! service class, resolves the owner's tier, applies the flat limiter for that
//! class and tier, and reserves one unit of quota. Denials are ordinary verdicts. Store failures
//! and timeouts are errors, so a caller can never mistake them for a grant.

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;

use crate::account::{Tier, TierResolver};
use crate::clock::Clock;
use crate::config::Config;
use crate::credential::{Credential, CredentialStore, Resolved, ServiceClass};
use crate::error::{Error, ErrorDetails};
use crate::ledger::{UsageLedger, UsageRecord, WindowAdmission};
use crate::rate_limit::limiter::seconds_until;
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders, WindowedRateLimiter};
use crate::store::Stores;

pub use self::config::QuotaConfig;
pub use crate::rate_limit::Remaining;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DenialReason {
    InvalidFormat,
    InvalidCredential,
    WrongCredentialClass,
    FreeTierExhausted,
    RateLimited,
}

impl DenialReason {
    pub fn status_code(self) -> StatusCode {
        match self {
            DenialReason::InvalidFormat | DenialReason::InvalidCredential => {
                StatusCode::UNAUTHORIZED
            }
            DenialReason::WrongCredentialClass => StatusCode::FORBIDDEN,
            DenialReason::FreeTierExhausted => StatusCode::PAYMENT_REQUIRED,
            DenialReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            DenialReason::InvalidFormat => "Invalid API key format",
            DenialReason::InvalidCredential => "Invalid, inactive, or expired API key",
            DenialReason::WrongCredentialClass => "This API key is not valid for this service",
            DenialReason::FreeTierExhausted => "Free tier limit reached. Upgrade to continue",
            DenialReason::RateLimited => "Rate limit exceeded. Try again later",
        }
    }

    pub fn error_type(self) -> &'static str {
        match self {
            DenialReason::InvalidFormat
            | DenialReason::InvalidCredential
            | DenialReason::WrongCredentialClass => "invalid_request_error",
            DenialReason::FreeTierExhausted => "insufficient_quota",
            DenialReason::RateLimited => "rate_limit_error",
        }
    }
}

/// Identity attached to an allowed verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub credential_id: String,
    pub account_id: String,
    pub service_class: ServiceClass,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaVerdict {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    pub limit: Option<u64>,
    pub remaining: Remaining,
    /// `None` for limits that never reset (the free lifetime cap) and for
    /// denials that happen before any limit applies.
    pub reset_at: Option<DateTime<Utc>>,
    pub grant: Option<Grant>,
}

impl QuotaVerdict {
    fn allowed(
        grant: Grant,
        limit: Option<u64>,
        remaining: Remaining,
        reset_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            allowed: true,
            reason: None,
            limit,
            remaining,
            reset_at,
            grant: Some(grant),
        }
    }

    fn denied(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            limit: None,
            remaining: Remaining::Count(0),
            reset_at: None,
            grant: None,
        }
    }

    fn with_limit(mut self, limit: u64, reset_at: Option<DateTime<Utc>>) -> Self {
        self.limit = Some(limit);
        self.reset_at = reset_at;
        self
    }

    /// Headers for the response. `now` is used to compute `Retry-After` on rate limits.
    pub fn headers(&self, now: DateTime<Utc>) -> RateLimitHeaders {
        let retry_after = match (self.reason, self.reset_at) {
            (Some(DenialReason::RateLimited), Some(reset_at)) => {
                Some(seconds_until(now, reset_at))
            }
            _ => None,
        };
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_at.map(|reset_at| reset_at.timestamp()),
            retry_after,
        }
    }
}

/// Name of the counter incremented once per decision, labelled by `reason`.
pub const QUOTA_DECISIONS_METRIC: &str = "quota_decisions";

fn record_decision(reason: &'static str) {
    counter!(QUOTA_DECISIONS_METRIC, "reason" => reason).increment(1);
}

pub struct QuotaEngine {
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn UsageLedger>,
    tiers: TierResolver,
    rate_limiter: WindowedRateLimiter,
    config: QuotaConfig,
    decision_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl QuotaEngine {
    pub fn new(stores: &Stores, config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            credentials: stores.credentials.clone(),
            ledger: stores.ledger.clone(),
            tiers: TierResolver::new(stores.accounts.clone(), &config.accounts),
            rate_limiter: WindowedRateLimiter::new(
                stores.ledger.clone(),
                config.rate_limit.clone(),
            ),
            config: config.quota.clone(),
            decision_timeout: config.gateway.decision_timeout(),
            clock,
        }
    }

    pub fn tiers(&self) -> &TierResolver {
        &self.tiers
    }

    pub fn rate_limiter(&self) -> &WindowedRateLimiter {
        &self.rate_limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Decides whether one call on `route` may proceed and, if so, counts it.
    ///
    /// Every allowed verdict corresponds to exactly one usage increment or ledger
    /// append. Nothing is counted for a denial. The whole decision is bounded by
    /// the configured timeout; on expiry the caller gets an error, never a grant.
    pub async fn check_and_record(
        &self,
        token: &str,
        required_class: ServiceClass,
        route: &str,
    ) -> Result<QuotaVerdict, Error> {
        self.check_and_record_with_metadata(token, required_class, route, None)
            .await
    }

    /// Like [`QuotaEngine::check_and_record`], storing `metadata` on the usage
    /// record of an allowed call. It never influences the verdict.
    pub async fn check_and_record_with_metadata(
        &self,
        token: &str,
        required_class: ServiceClass,
        route: &str,
        metadata: Option<Value>,
    ) -> Result<QuotaVerdict, Error> {
        let decision = self.decide(token, required_class, route, metadata);
        match tokio::time::timeout(self.decision_timeout, decision).await {
            Ok(Ok(verdict)) => {
                record_decision(verdict.reason.map_or("allowed", Into::into));
                Ok(verdict)
            }
            Ok(Err(e)) => {
                record_decision("system_error");
                Err(e)
            }
            Err(_) => {
                record_decision("decision_timeout");
                Err(Error::new(ErrorDetails::DecisionTimeout {
                    timeout_ms: u64::try_from(self.decision_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                }))
            }
        }
    }

    async fn decide(
        &self,
        token: &str,
        required_class: ServiceClass,
        route: &str,
        metadata: Option<Value>,
    ) -> Result<QuotaVerdict, Error> {
        let now = self.clock.now();

        let credential = match self.credentials.resolve(token).await? {
            Resolved::InvalidFormat => {
                return Ok(QuotaVerdict::denied(DenialReason::InvalidFormat))
            }
            Resolved::NotFound => {
                return Ok(QuotaVerdict::denied(DenialReason::InvalidCredential))
            }
            Resolved::Found(credential) if !credential.is_usable(now) => {
                tracing::debug!(
                    credential_id = %credential.id,
                    is_active = credential.is_active,
                    "rejecting unusable credential"
                );
                return Ok(QuotaVerdict::denied(DenialReason::InvalidCredential));
            }
            Resolved::Found(credential) => credential,
        };

        if credential.service_class != required_class {
            return Ok(QuotaVerdict::denied(DenialReason::WrongCredentialClass));
        }

        let Some(account) = self.tiers.account(&credential.account_id).await? else {
            tracing::warn!(
                credential_id = %credential.id,
                account_id = %credential.account_id,
                "credential references a missing account"
            );
            return Ok(QuotaVerdict::denied(DenialReason::InvalidCredential));
        };
        let tier = account.tier();

        if let Some(window) = self.rate_limiter.window_for(required_class, tier) {
            if let RateLimitDecision::Deny(headers) =
                self.rate_limiter.check(&credential.id, window, now).await?
            {
                let reset_at = headers.reset.and_then(|reset| DateTime::from_timestamp(reset, 0));
                return Ok(QuotaVerdict::denied(DenialReason::RateLimited)
                    .with_limit(window.max_requests, reset_at));
            }
        }

        let grant = Grant {
            credential_id: credential.id.clone(),
            account_id: credential.account_id.clone(),
            service_class: required_class,
            tier,
        };
        let record = UsageRecord::new(&credential.id, &credential.account_id, route, tier, now)
            .with_metadata(metadata);

        match tier {
            Tier::Free => self.reserve_free(&credential, grant, record, now).await,
            Tier::Premium => self.reserve_premium(&credential, grant, record, now).await,
        }
    }

    async fn reserve_free(
        &self,
        credential: &Credential,
        grant: Grant,
        record: UsageRecord,
        now: DateTime<Utc>,
    ) -> Result<QuotaVerdict, Error> {
        let cap = self.config.free_lifetime_cap;
        let Some(used) = self
            .credentials
            .try_record_use(&credential.id, cap, now)
            .await?
        else {
            return Ok(
                QuotaVerdict::denied(DenialReason::FreeTierExhausted).with_limit(cap, None)
            );
        };
        self.ledger.append(record).await?;
        Ok(QuotaVerdict::allowed(
            grant,
            Some(cap),
            Remaining::Count(cap.saturating_sub(used)),
            None,
        ))
    }

    async fn reserve_premium(
        &self,
        credential: &Credential,
        grant: Grant,
        record: UsageRecord,
        now: DateTime<Utc>,
    ) -> Result<QuotaVerdict, Error> {
        let Some(cap) = self.config.premium_cap(credential.service_class) else {
            self.ledger.append(record).await?;
            self.credentials.record_use(&credential.id, now).await?;
            return Ok(QuotaVerdict::allowed(grant, None, Remaining::Unbounded, None));
        };

        let window = self.config.premium_window();
        let since = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reset_after = |oldest: DateTime<Utc>| oldest.checked_add_signed(window);

        match self.ledger.append_within_window(record, since, cap).await? {
            WindowAdmission::Admitted {
                count_before,
                oldest,
            } => {
                self.credentials.record_use(&credential.id, now).await?;
                Ok(QuotaVerdict::allowed(
                    grant,
                    Some(cap),
                    Remaining::Count(cap.saturating_sub(count_before + 1)),
                    reset_after(oldest),
                ))
            }
            WindowAdmission::Full { oldest, .. } => {
                let reset_at = oldest.and_then(reset_after).or_else(|| reset_after(now));
                Ok(QuotaVerdict::denied(DenialReason::RateLimited).with_limit(cap, reset_at))
            }
        }
    }
}
