//! Environment-driven settings shared by both binaries.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG`-driven fmt subscriber, `info` when unset.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse `key` into `T`; unset or unparsable falls back to `default`.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Unset and blank both mean "not configured".
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Request channel capacity of each `AsyncClient`.
    pub capacity: usize,
}

impl MqttSettings {
    pub fn from_env() -> Self {
        Self {
            host: env_or("MQTT_HOST", "127.0.0.1"),
            port: env_parse("MQTT_PORT", 1883),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(env_parse("MQTT_CONNECT_TIMEOUT_S", 10)),
            capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub url: String,
    pub timeout: Duration,
}

impl BackendSettings {
    pub fn from_env() -> Self {
        Self {
            url: env_or("BACKEND_URL", "http://127.0.0.1:5000"),
            timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_S", 10)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names so parallel tests don't collide.

    #[test]
    fn env_parse_falls_back_when_unset() {
        env::remove_var("IRR_TEST_UNSET_PORT");
        assert_eq!(env_parse("IRR_TEST_UNSET_PORT", 1883u16), 1883);
    }

    #[test]
    fn env_parse_reads_value() {
        env::set_var("IRR_TEST_PORT", " 2883 ");
        assert_eq!(env_parse("IRR_TEST_PORT", 1883u16), 2883);
    }

    #[test]
    fn env_parse_garbage_falls_back() {
        env::set_var("IRR_TEST_BAD_PORT", "not-a-port");
        assert_eq!(env_parse("IRR_TEST_BAD_PORT", 1883u16), 1883);
    }

    #[test]
    fn env_flag_variants() {
        for (raw, want) in [("1", true), ("TRUE", true), ("yes", true), ("0", false), ("off", false)] {
            env::set_var("IRR_TEST_FLAG", raw);
            assert_eq!(env_flag("IRR_TEST_FLAG", !want), want, "{raw}");
        }
        env::remove_var("IRR_TEST_FLAG");
        assert!(env_flag("IRR_TEST_FLAG", true));
    }

    #[test]
    fn env_opt_blank_is_none() {
        env::set_var("IRR_TEST_KEY", "   ");
        assert_eq!(env_opt("IRR_TEST_KEY"), None);
        env::set_var("IRR_TEST_KEY", "abc");
        assert_eq!(env_opt("IRR_TEST_KEY"), Some("abc".to_string()));
    }
}
