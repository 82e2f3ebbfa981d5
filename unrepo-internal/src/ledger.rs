//! Append-only log of authorized calls.
//!
//! Records are tagged with the tier the account had when the call was admitted.
//! The premium sliding window counts only premium-tier records, so calls made
//! while an account was on the free tier do not eat into its premium allowance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::account::Tier;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub credential_id: String,
    pub account_id: String,
    pub route: String,
    pub tier: Tier,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UsageRecord {
    pub fn new(
        credential_id: impl Into<String>,
        account_id: impl Into<String>,
        route: impl Into<String>,
        tier: Tier,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            credential_id: credential_id.into(),
            account_id: account_id.into(),
            route: route.into(),
            tier,
            timestamp,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The HTTP method recorded in `metadata`, if any.
    pub fn method(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("method")?.as_str()
    }
}

/// Outcome of [`UsageLedger::append_within_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdmission {
    /// The record was appended. `count_before` excludes it; `oldest` is the oldest
    /// counted record including the new one.
    Admitted {
        count_before: u64,
        oldest: DateTime<Utc>,
    },
    /// The window already holds `count` records; nothing was appended.
    Full {
        count: u64,
        oldest: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteUsage {
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total: u64,
    pub since_count: u64,
    pub by_route: Vec<RouteUsage>,
}

impl UsageSummary {
    /// Folds records into a summary. `by_route` has one entry per route and
    /// method, sorted by route then method.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a UsageRecord>,
        since: DateTime<Utc>,
    ) -> Self {
        let mut summary = UsageSummary::default();
        let mut by_route: std::collections::BTreeMap<(&str, Option<&str>), RouteUsage> =
            Default::default();
        for record in records {
            summary.total += 1;
            if record.timestamp >= since {
                summary.since_count += 1;
            }
            let method = record.method();
            let entry = by_route
                .entry((record.route.as_str(), method))
                .or_insert_with(|| RouteUsage {
                    route: record.route.clone(),
                    method: method.map(str::to_string),
                    count: 0,
                    last_used_at: None,
                });
            entry.count += 1;
            entry.last_used_at = entry.last_used_at.max(Some(record.timestamp));
        }
        summary.by_route = by_route.into_values().collect();
        summary
    }
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<(), Error>;

    /// Records for the credential with `timestamp >= since`, optionally of one tier only.
    async fn count_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
        tier: Option<Tier>,
    ) -> Result<u64, Error>;

    /// Atomically counts records of `record.tier` with `timestamp >= since` and
    /// appends `record` only if that count is below `cap`.
    async fn append_within_window(
        &self,
        record: UsageRecord,
        since: DateTime<Utc>,
        cap: u64,
    ) -> Result<WindowAdmission, Error>;

    async fn summarize(
        &self,
        credential_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<UsageSummary, Error>;
}
