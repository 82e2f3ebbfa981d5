use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{
    RateLimitConfig, RateLimitDecision, RateLimitHeaders, RateLimiterMetrics, Remaining,
    WindowConfig,
};
use crate::account::Tier;
use crate::credential::ServiceClass;
use crate::error::Error;
use crate::ledger::UsageLedger;

/// Fixed-window limiter aligned to the epoch, counted from the usage ledger.
///
/// The count is a read; it does not reserve a slot. Two concurrent calls at the
/// boundary can both pass, so the flat limit may be overshot by the number of
/// in-flight calls. The quota engine's reservations are the exact bound.
pub struct WindowedRateLimiter {
    ledger: Arc<dyn UsageLedger>,
    config: RateLimitConfig,
    metrics: Arc<RateLimiterMetrics>,
}

impl WindowedRateLimiter {
    pub fn new(ledger: Arc<dyn UsageLedger>, config: RateLimitConfig) -> Self {
        Self {
            ledger,
            config,
            metrics: Arc::new(RateLimiterMetrics::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The flat window for a credential of `service_class` whose owner is on
    /// `tier`, or `None` when the limiter is disabled.
    pub fn window_for(&self, service_class: ServiceClass, tier: Tier) -> Option<&WindowConfig> {
        self.config
            .enabled
            .then(|| self.config.window(service_class, tier))
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    /// Counts all of the credential's ledger records in the current window.
    /// `remaining` assumes the call being checked will be recorded.
    pub async fn check(
        &self,
        credential_id: &str,
        window: &WindowConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, Error> {
        self.metrics.record_check();
        let (window_start, reset) = window_bounds(now, window.window_secs);
        let count = self
            .ledger
            .count_since(credential_id, window_start, None)
            .await
            .inspect_err(|_| self.metrics.record_store_error())?;

        if count >= window.max_requests {
            self.metrics.record_rate_limit_exceeded();
            tracing::debug!(
                credential_id,
                count,
                limit = window.max_requests,
                "flat rate limit exceeded"
            );
            return Ok(RateLimitDecision::Deny(RateLimitHeaders {
                limit: Some(window.max_requests),
                remaining: Remaining::Count(0),
                reset: Some(reset.timestamp()),
                retry_after: Some(seconds_until(now, reset)),
            }));
        }

        Ok(RateLimitDecision::Allow(RateLimitHeaders {
            limit: Some(window.max_requests),
            remaining: Remaining::Count(window.max_requests - count - 1),
            reset: Some(reset.timestamp()),
            retry_after: None,
        }))
    }
}

/// Start and end of the epoch-aligned window containing `now`.
pub fn window_bounds(now: DateTime<Utc>, window_secs: u64) -> (DateTime<Utc>, DateTime<Utc>) {
    let window_secs = i64::try_from(window_secs.max(1)).unwrap_or(i64::MAX);
    let now_secs = now.timestamp();
    let start_secs = now_secs - now_secs.rem_euclid(window_secs);
    let start = DateTime::from_timestamp(start_secs, 0).unwrap_or(now);
    let end = DateTime::from_timestamp(start_secs.saturating_add(window_secs), 0)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (start, end)
}

/// Whole seconds from `now` until `then`, rounded up, at least 1.
pub fn seconds_until(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    let millis = (then - now).num_milliseconds().max(0);
    u64::try_from((millis + 999) / 1000).unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::UsageRecord;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_window_bounds_are_epoch_aligned() {
        let (start, end) = window_bounds(at(7_250), 3600);
        assert_eq!(start, at(7_200));
        assert_eq!(end, at(10_800));

        let (start, end) = window_bounds(at(7_200), 3600);
        assert_eq!(start, at(7_200));
        assert_eq!(end, at(10_800));
    }

    #[test]
    fn test_seconds_until_rounds_up() {
        let now = at(100);
        assert_eq!(seconds_until(now, at(160)), 60);
        assert_eq!(seconds_until(now, now + Duration::milliseconds(1)), 1);
        assert_eq!(seconds_until(now, at(50)), 1);
    }

    #[tokio::test]
    async fn test_check_counts_current_window_only() {
        let store = MemoryStore::default();
        let limiter = WindowedRateLimiter::new(
            Arc::new(store.clone()),
            RateLimitConfig::default(),
        );
        let window = WindowConfig {
            max_requests: 2,
            window_secs: 60,
        };

        // Previous window.
        store
            .append(UsageRecord::new("c", "a", "/r", Tier::Free, at(119)))
            .await
            .unwrap();

        let decision = limiter.check("c", &window, at(130)).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.headers().remaining, Remaining::Count(1));
        assert_eq!(decision.headers().reset, Some(180));

        for secs in [120, 125] {
            store
                .append(UsageRecord::new("c", "a", "/r", Tier::Premium, at(secs)))
                .await
                .unwrap();
        }

        let decision = limiter.check("c", &window, at(130)).await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.headers().retry_after, Some(50));
        let exceeded = &limiter.metrics().rate_limit_exceeded;
        assert_eq!(exceeded.load(std::sync::atomic::Ordering::Relaxed), 1);

        let decision = limiter.check("c", &window, at(180)).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_disabled_limiter_has_no_windows() {
        let limiter = WindowedRateLimiter::new(
            Arc::new(MemoryStore::default()),
            RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        );
        assert!(!limiter.is_enabled());
        assert!(limiter.window_for(ServiceClass::Chat, Tier::Free).is_none());
        assert!(limiter
            .window_for(ServiceClass::Chat, Tier::Premium)
            .is_none());
    }
}
