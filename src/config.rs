//! Client settings.
//!
//! Every option has a default, so a settings document only needs the keys
//! it changes:
//!
//! ```
//! use hprose_client::Settings;
//!
//! let settings = Settings::from_json(r#"{"timeout": 5000, "idempotent": true}"#).unwrap();
//! assert_eq!(settings.timeout, 5000);
//! assert_eq!(settings.retry, 10);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default retry budget of idempotent calls.
pub const DEFAULT_RETRY: u32 = 10;

/// Default socket pool size.
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Default idle time before a pooled connection is closed, in milliseconds.
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 30_000;

/// Client-wide defaults and transport options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Exchange byte strings instead of host strings.
    pub binary: bool,
    /// Ask the server to echo mutated arguments.
    pub byref: bool,
    /// Disable reference tracking.
    pub simple: bool,
    /// Call timeout in milliseconds, 0 disables it.
    pub timeout: u64,
    /// Retry budget for idempotent calls.
    pub retry: u32,
    /// Whether calls may be sent again after a transport failure.
    pub idempotent: bool,
    /// Rotate to the next endpoint after a transport failure.
    pub failswitch: bool,
    /// Keep connections open between calls.
    pub keep_alive: bool,
    /// Decode maps as ordered key/value maps instead of records.
    pub use_harmony_map: bool,
    /// Disable Nagle's algorithm on socket connections.
    pub no_delay: bool,
    /// Multiplex requests over socket connections by correlation id.
    pub full_duplex: bool,
    /// Upper bound on pooled socket connections.
    pub max_pool_size: usize,
    /// Idle time in milliseconds before a pooled connection is closed.
    pub pool_timeout: u64,
    /// Extra HTTP request headers.
    pub headers: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binary: false,
            byref: false,
            simple: false,
            timeout: DEFAULT_TIMEOUT_MS,
            retry: DEFAULT_RETRY,
            idempotent: false,
            failswitch: false,
            keep_alive: true,
            use_harmony_map: false,
            no_delay: true,
            full_duplex: false,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            pool_timeout: DEFAULT_POOL_TIMEOUT_MS,
            headers: HashMap::new(),
        }
    }
}

impl Settings {
    /// Parse settings from a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        Ok(settings.normalized())
    }

    /// Replace out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.max_pool_size < 1 {
            self.max_pool_size = DEFAULT_MAX_POOL_SIZE;
        }
        self
    }

    /// Call timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        millis(self.timeout)
    }

    /// Idle time of pooled connections, `None` when disabled.
    pub fn pool_timeout(&self) -> Option<Duration> {
        millis(self.pool_timeout)
    }
}

pub(crate) fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.timeout, 30_000);
        assert_eq!(settings.retry, 10);
        assert!(settings.keep_alive);
        assert!(settings.no_delay);
        assert!(!settings.full_duplex);
        assert_eq!(settings.max_pool_size, 10);
    }

    #[test]
    fn test_from_json_camel_case() {
        let settings = Settings::from_json(
            r#"{"useHarmonyMap": true, "fullDuplex": true, "poolTimeout": 0,
                "headers": {"X-Token": "abc"}}"#,
        )
        .unwrap();
        assert!(settings.use_harmony_map);
        assert!(settings.full_duplex);
        assert_eq!(settings.pool_timeout(), None);
        assert_eq!(settings.headers.get("X-Token").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_pool_size_below_one_uses_default() {
        let settings = Settings::from_json(r#"{"maxPoolSize": 0}"#).unwrap();
        assert_eq!(settings.max_pool_size, DEFAULT_MAX_POOL_SIZE);
    }

    #[test]
    fn test_invalid_json() {
        assert!(Settings::from_json("{timeout").is_err());
    }
}
