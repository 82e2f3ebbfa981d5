use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::credential::ServiceClass;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Lifetime calls a free-tier credential may make.
    #[serde(default = "default_free_lifetime_cap")]
    pub free_lifetime_cap: u64,
    #[serde(default = "default_premium_window_secs")]
    pub premium_window_secs: u64,
    #[serde(default)]
    pub premium_window_caps: PremiumWindowCaps,
}

fn default_free_lifetime_cap() -> u64 {
    5
}

fn default_premium_window_secs() -> u64 {
    3600
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_lifetime_cap: default_free_lifetime_cap(),
            premium_window_secs: default_premium_window_secs(),
            premium_window_caps: PremiumWindowCaps::default(),
        }
    }
}

impl QuotaConfig {
    pub fn premium_window(&self) -> Duration {
        i64::try_from(self.premium_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    pub fn premium_cap(&self, service_class: ServiceClass) -> Option<u64> {
        self.premium_window_caps.for_class(service_class)
    }
}

/// Per-class premium caps. A class left out of a present table is unbounded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PremiumWindowCaps {
    pub analysis: Option<u64>,
    pub chat: Option<u64>,
}

impl Default for PremiumWindowCaps {
    fn default() -> Self {
        Self {
            analysis: Some(100),
            chat: Some(200),
        }
    }
}

impl PremiumWindowCaps {
    pub fn for_class(&self, service_class: ServiceClass) -> Option<u64> {
        match service_class {
            ServiceClass::Analysis => self.analysis,
            ServiceClass::Chat => self.chat,
        }
    }
}
