//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default overload threshold in assigned tasks per declared thread.
pub const DEFAULT_OVERLOAD_THRESHOLD: f64 = 10.0;

/// Router process configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Port for the worker websocket listener.
    pub ws_port: u16,
    /// Port for the internal stats API (bound to loopback).
    pub internal_port: u16,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// How often the backlog poller reads pending tasks.
    pub poll_interval: Duration,
    /// Heartbeat period for every worker connection.
    pub heartbeat_interval: Duration,
    /// Tasks per thread at which a worker stops receiving work.
    pub overload_threshold: f64,
    /// Upper bound on how long a draining worker may keep its tasks.
    pub drain_timeout: Duration,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ws_port: 6333,
            internal_port: 5538,
            db_path: PathBuf::from("./data/router.db"),
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            drain_timeout: Duration::from_secs(300),
            log_dir: None,
        }
    }
}

impl RouterConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let overload_threshold =
            parse_var(&lookup, "ROUTER_OVERLOAD_THRESHOLD")?.unwrap_or(defaults.overload_threshold);
        if overload_threshold.is_nan() || overload_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "ROUTER_OVERLOAD_THRESHOLD".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let heartbeat_secs: u64 = parse_var(&lookup, "ROUTER_HEARTBEAT_SECS")?
            .unwrap_or(defaults.heartbeat_interval.as_secs());
        if heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROUTER_HEARTBEAT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let poll_ms: u64 = parse_var(&lookup, "ROUTER_POLL_INTERVAL_MS")?
            .unwrap_or(defaults.poll_interval.as_millis() as u64);
        if poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROUTER_POLL_INTERVAL_MS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            ws_port: parse_var(&lookup, "WS_PORT")?.unwrap_or(defaults.ws_port),
            internal_port: parse_var(&lookup, "INTERNAL_PORT")?.unwrap_or(defaults.internal_port),
            db_path: lookup("ROUTER_DB_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            poll_interval: Duration::from_millis(poll_ms),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            overload_threshold,
            drain_timeout: parse_var(&lookup, "ROUTER_DRAIN_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            log_dir: lookup("ROUTER_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = RouterConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.ws_port, 6333);
        assert_eq!(config.internal_port, 5538);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.overload_threshold, 10.0);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = RouterConfig::from_lookup(lookup_from(&[
            ("WS_PORT", "7000"),
            ("ROUTER_POLL_INTERVAL_MS", "250"),
            ("ROUTER_OVERLOAD_THRESHOLD", "4.5"),
            ("ROUTER_DB_PATH", "/tmp/r.db"),
        ]))
        .unwrap();
        assert_eq!(config.ws_port, 7000);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.overload_threshold, 4.5);
        assert_eq!(config.db_path, PathBuf::from("/tmp/r.db"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = RouterConfig::from_lookup(lookup_from(&[("WS_PORT", "not-a-port")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "WS_PORT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_threshold_is_rejected() {
        assert!(
            RouterConfig::from_lookup(lookup_from(&[("ROUTER_OVERLOAD_THRESHOLD", "0")])).is_err()
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = RouterConfig::from_lookup(lookup_from(&[("WS_PORT", "  ")])).unwrap();
        assert_eq!(config.ws_port, 6333);
    }
}
