//! Lifecycle controller configuration.
//!
//! Loadable from JSON; every field is optional.
//!
//! ```
//! use wasession::lifecycle::LifecycleConfig;
//!
//! let config =
//!     LifecycleConfig::from_json(r#"{ "disable_login_auto_reconnect": true }"#).unwrap();
//! assert!(config.disable_login_auto_reconnect);
//! assert_eq!(config.min_pre_key_count, 5);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default minimum number of pre-keys kept on the server.
pub const DEFAULT_MIN_PRE_KEY_COUNT: u32 = 5;

/// Default deadline for a rotating credential refresh, in seconds.
pub const DEFAULT_CAT_REFRESH_TIMEOUT_SECS: u64 = 30;

/// Configuration for the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Don't reconnect automatically after a 515 stream error; emit
    /// `ManualLoginReconnect` instead.
    pub disable_login_auto_reconnect: bool,
    /// Deadline for a rotating credential refresh, in seconds.
    pub cat_refresh_timeout_secs: u64,
    /// Upload fresh pre-keys when either side has fewer than this.
    pub min_pre_key_count: u32,
}

impl LifecycleConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Deadline for a rotating credential refresh.
    pub fn cat_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.cat_refresh_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            disable_login_auto_reconnect: false,
            cat_refresh_timeout_secs: DEFAULT_CAT_REFRESH_TIMEOUT_SECS,
            min_pre_key_count: DEFAULT_MIN_PRE_KEY_COUNT,
        }
    }
}
