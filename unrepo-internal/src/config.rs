use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::ServiceClass;
use crate::error::{Error, ErrorDetails};
use crate::quota::config::QuotaConfig;
use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub upstreams: UpstreamsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    /// Upper bound on a single authorization decision. Exceeding it fails closed.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_decision_timeout_ms() -> u64 {
    250
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            decision_timeout_ms: default_decision_timeout_ms(),
            debug: false,
        }
    }
}

impl GatewayConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AccountsConfig {
    /// 0 disables caching: every decision reads the account fresh.
    #[serde(default)]
    pub tier_cache_ttl_ms: u64,
    #[serde(default = "default_tier_cache_capacity")]
    pub tier_cache_capacity: u64,
}

fn default_tier_cache_capacity() -> u64 {
    10_000
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            tier_cache_ttl_ms: 0,
            tier_cache_capacity: default_tier_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_timeout_ms() -> u64 {
    100
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamsConfig {
    pub analysis: Option<Url>,
    pub chat: Option<Url>,
}

impl UpstreamsConfig {
    pub fn for_class(&self, service_class: ServiceClass) -> Option<&Url> {
        match service_class {
            ServiceClass::Analysis => self.analysis.as_ref(),
            ServiceClass::Chat => self.chat.as_ref(),
        }
    }
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::from_toml_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Config, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Err(Error::new(ErrorDetails::Config { message }));

        if self.gateway.decision_timeout_ms == 0 {
            return invalid("`gateway.decision_timeout_ms` must be greater than 0".to_string());
        }
        if self.redis.timeout_ms == 0 {
            return invalid("`redis.timeout_ms` must be greater than 0".to_string());
        }
        if self.quota.free_lifetime_cap == 0 {
            return invalid("`quota.free_lifetime_cap` must be greater than 0".to_string());
        }
        if self.quota.premium_window_secs == 0 {
            return invalid("`quota.premium_window_secs` must be greater than 0".to_string());
        }
        for class in ServiceClass::ALL {
            if self.quota.premium_window_caps.for_class(class) == Some(0) {
                return invalid(format!(
                    "`quota.premium_window_caps.{}` must be greater than 0; omit it for no cap",
                    class.token_marker()
                ));
            }
        }
        let windows = [
            ("analysis", &self.rate_limit.analysis),
            ("chat", &self.rate_limit.chat),
            ("premium", &self.rate_limit.premium),
        ];
        for (name, window) in windows {
            if window.window_secs == 0 {
                return invalid(format!(
                    "`rate_limit.{name}.window_secs` must be greater than 0"
                ));
            }
            if window.max_requests == 0 {
                return invalid(format!(
                    "`rate_limit.{name}.max_requests` must be greater than 0"
                ));
            }
        }
        if self.gateway.decision_timeout_ms < self.redis.timeout_ms {
            tracing::warn!(
                "`gateway.decision_timeout_ms` ({}) is shorter than `redis.timeout_ms` ({}); slow store calls will surface as decision timeouts",
                self.gateway.decision_timeout_ms,
                self.redis.timeout_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateway.decision_timeout_ms, 250);
        assert_eq!(config.quota.free_lifetime_cap, 5);
        assert_eq!(config.quota.premium_window_secs, 3600);
        assert_eq!(
            config.quota.premium_window_caps.for_class(ServiceClass::Analysis),
            Some(100)
        );
        assert_eq!(
            config.quota.premium_window_caps.for_class(ServiceClass::Chat),
            Some(200)
        );
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.chat.max_requests, 200);
        assert_eq!(config.rate_limit.premium.max_requests, 500);
        assert_eq!(config.accounts.tier_cache_ttl_ms, 0);
        assert_eq!(config.redis.timeout_ms, 100);
        assert!(config.upstreams.analysis.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            [gateway]
            bind_address = "127.0.0.1:4000"
            decision_timeout_ms = 500
            debug = true

            [quota]
            free_lifetime_cap = 10
            premium_window_secs = 60
            [quota.premium_window_caps]
            analysis = 3

            [rate_limit]
            enabled = false
            [rate_limit.analysis]
            max_requests = 7
            window_secs = 30

            [accounts]
            tier_cache_ttl_ms = 1000

            [upstreams]
            chat = "http://chat.internal/v1/chatbot"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.gateway.bind_address,
            Some("127.0.0.1:4000".parse().unwrap())
        );
        assert_eq!(config.quota.free_lifetime_cap, 10);
        assert_eq!(
            config.quota.premium_window_caps.for_class(ServiceClass::Analysis),
            Some(3)
        );
        // Omitted inside a present table means no cap.
        assert_eq!(
            config.quota.premium_window_caps.for_class(ServiceClass::Chat),
            None
        );
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.analysis.max_requests, 7);
        assert_eq!(config.rate_limit.chat.max_requests, 200);
        assert_eq!(
            config
                .upstreams
                .for_class(ServiceClass::Chat)
                .map(Url::as_str),
            Some("http://chat.internal/v1/chatbot")
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::from_toml_str("[quota]\nfree_cap = 5\n").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.quota.free_lifetime_cap = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.decision_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.chat.window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.premium.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.quota.premium_window_secs = 0;
        assert!(config.validate().is_err());

        let config = Config::from_toml_str("[quota.premium_window_caps]\nchat = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[quota]\nfree_lifetime_cap = 3").unwrap();
        let config = Config::load_and_verify_from_path(file.path()).await.unwrap();
        assert_eq!(config.quota.free_lifetime_cap, 3);

        let missing =
            Config::load_and_verify_from_path(Path::new("/nonexistent/unrepo.toml")).await;
        assert!(missing.is_err());
    }
}
