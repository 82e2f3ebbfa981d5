pub mod limiter;

pub use limiter::WindowedRateLimiter;

use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::account::Tier;
use crate::credential::ServiceClass;

/// Calls left before a limit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Count(u64),
    /// No cap applies to this credential.
    Unbounded,
}

impl std::fmt::Display for Remaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remaining::Count(count) => write!(f, "{count}"),
            Remaining::Unbounded => write!(f, "unlimited"),
        }
    }
}

impl Serialize for Remaining {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Remaining::Count(count) => serializer.serialize_u64(*count),
            Remaining::Unbounded => serializer.serialize_str("unlimited"),
        }
    }
}

/// Headers returned with rate limit information
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u64>,
    pub remaining: Remaining,
    /// Unix timestamp (seconds). `None` for limits that never reset.
    pub reset: Option<i64>,
    /// Seconds
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(limit) = self.limit {
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Some(reset) = self.reset {
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset));
        }

        if let Some(retry_after) = self.retry_after {
            headers.insert("Retry-After", HeaderValue::from(retry_after));
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    Allow(RateLimitHeaders),
    Deny(RateLimitHeaders),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn headers(&self) -> &RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny(h) => h,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-tier credentials of the analysis class.
    #[serde(default = "default_analysis_window")]
    pub analysis: WindowConfig,
    /// Free-tier credentials of the chat class.
    #[serde(default = "default_chat_window")]
    pub chat: WindowConfig,
    /// Premium credentials of either class.
    #[serde(default = "default_premium_window")]
    pub premium: WindowConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_analysis_window() -> WindowConfig {
    WindowConfig {
        max_requests: 100,
        window_secs: 3600,
    }
}

fn default_chat_window() -> WindowConfig {
    WindowConfig {
        max_requests: 200,
        window_secs: 3600,
    }
}

fn default_premium_window() -> WindowConfig {
    WindowConfig {
        max_requests: 500,
        window_secs: 3600,
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            analysis: default_analysis_window(),
            chat: default_chat_window(),
            premium: default_premium_window(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self, service_class: ServiceClass, tier: Tier) -> &WindowConfig {
        match (tier, service_class) {
            (Tier::Premium, _) => &self.premium,
            (Tier::Free, ServiceClass::Analysis) => &self.analysis,
            (Tier::Free, ServiceClass::Chat) => &self.chat,
        }
    }
}

/// Metrics for rate limiter monitoring
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub checks: AtomicU64,
    pub rate_limit_exceeded: AtomicU64,
    pub store_errors: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_exceeded(&self) {
        self.rate_limit_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_headers() {
        let headers = RateLimitHeaders {
            limit: Some(100),
            remaining: Remaining::Count(45),
            reset: Some(1234567890),
            retry_after: None,
        };

        let header_map = headers.to_header_map();

        assert_eq!(header_map.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(header_map.get("X-RateLimit-Remaining").unwrap(), "45");
        assert_eq!(header_map.get("X-RateLimit-Reset").unwrap(), "1234567890");
        assert!(!header_map.contains_key("Retry-After"));
    }

    #[test]
    fn test_rate_limit_headers_with_retry_after() {
        let headers = RateLimitHeaders {
            limit: Some(100),
            remaining: Remaining::Count(0),
            reset: Some(1234567890),
            retry_after: Some(60),
        };

        let header_map = headers.to_header_map();

        assert_eq!(header_map.get("Retry-After").unwrap(), "60");
    }

    #[test]
    fn test_unbounded_lifetime_headers() {
        let headers = RateLimitHeaders {
            limit: None,
            remaining: Remaining::Unbounded,
            reset: None,
            retry_after: None,
        };

        let header_map = headers.to_header_map();

        assert!(!header_map.contains_key("X-RateLimit-Limit"));
        assert_eq!(header_map.get("X-RateLimit-Remaining").unwrap(), "unlimited");
        assert!(!header_map.contains_key("X-RateLimit-Reset"));
    }

    #[test]
    fn test_rate_limit_decision_deny() {
        let headers = RateLimitHeaders {
            limit: Some(100),
            remaining: Remaining::Count(0),
            reset: Some(1234567890),
            retry_after: Some(60),
        };

        let decision = RateLimitDecision::Deny(headers);

        assert!(!decision.is_allowed());
        assert_eq!(decision.headers().remaining, Remaining::Count(0));
        assert_eq!(decision.headers().retry_after, Some(60));
    }

    #[test]
    fn test_windows_are_picked_by_tier() {
        let config = RateLimitConfig::default();
        assert_eq!(config.window(ServiceClass::Analysis, Tier::Free).max_requests, 100);
        assert_eq!(config.window(ServiceClass::Chat, Tier::Free).max_requests, 200);
        assert_eq!(config.window(ServiceClass::Analysis, Tier::Premium).max_requests, 500);
        assert_eq!(config.window(ServiceClass::Chat, Tier::Premium).max_requests, 500);

        let config: RateLimitConfig =
            toml::from_str("[premium]\nmax_requests = 50\nwindow_secs = 60\n").unwrap();
        assert_eq!(config.premium.window_secs, 60);
        assert_eq!(config.analysis, default_analysis_window());
    }

    #[test]
    fn test_remaining_serialization() {
        assert_eq!(serde_json::to_value(Remaining::Count(3)).unwrap(), 3);
        assert_eq!(
            serde_json::to_value(Remaining::Unbounded).unwrap(),
            "unlimited"
        );
    }
}
