use std::str::FromStr;
use std::time::Duration;

use crate::engine::BookingPolicy;

/// Knobs the booking engine itself reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest a request waits for a resource's row lock before `LockTimeout`.
    pub lock_timeout: Duration,
    /// Product rule: both ends of a new reservation must lie in the future.
    pub require_future: bool,
    pub policy: BookingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2_000),
            require_future: true,
            policy: BookingPolicy::SingleUnit,
        }
    }
}

/// Server configuration, read from `FLEETBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub auto_complete: bool,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = EngineConfig::default();
        let policy = match lookup("FLEETBOOK_BOOKING_POLICY") {
            Some(s) => s.parse()?,
            None => defaults.policy,
        };
        let lock_timeout_ms: u64 = parse_or(&lookup, "FLEETBOOK_LOCK_TIMEOUT_MS", 2_000)?;

        Ok(Self {
            port: parse_or(&lookup, "FLEETBOOK_PORT", 5433)?,
            bind: lookup("FLEETBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("FLEETBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()),
            password: lookup("FLEETBOOK_PASSWORD").unwrap_or_else(|| "fleetbook".into()),
            max_connections: parse_or(&lookup, "FLEETBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "FLEETBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("FLEETBOOK_METRICS_PORT")
                .map(|s| parse_value("FLEETBOOK_METRICS_PORT", &s))
                .transpose()?,
            tls_cert: lookup("FLEETBOOK_TLS_CERT"),
            tls_key: lookup("FLEETBOOK_TLS_KEY"),
            auto_complete: parse_or(&lookup, "FLEETBOOK_AUTO_COMPLETE", true)?,
            engine: EngineConfig {
                lock_timeout: Duration::from_millis(lock_timeout_ms),
                require_future: parse_or(
                    &lookup,
                    "FLEETBOOK_REQUIRE_FUTURE",
                    defaults.require_future,
                )?,
                policy,
            },
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match lookup(key) {
        Some(s) => parse_value(key, &s),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("{key}: cannot parse {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert!(cfg.auto_complete);
        assert_eq!(cfg.engine, EngineConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("FLEETBOOK_PORT", "6000"),
            ("FLEETBOOK_METRICS_PORT", "9100"),
            ("FLEETBOOK_LOCK_TIMEOUT_MS", "250"),
            ("FLEETBOOK_REQUIRE_FUTURE", "false"),
            ("FLEETBOOK_BOOKING_POLICY", "multi"),
            ("FLEETBOOK_AUTO_COMPLETE", "false"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.engine.lock_timeout, Duration::from_millis(250));
        assert!(!cfg.engine.require_future);
        assert_eq!(cfg.engine.policy, BookingPolicy::MultiSlot);
        assert!(!cfg.auto_complete);
    }

    #[test]
    fn bad_values_are_reported() {
        let err = Config::from_lookup(lookup_from(&[("FLEETBOOK_PORT", "eighty")])).unwrap_err();
        assert!(err.contains("FLEETBOOK_PORT"));
        let err = Config::from_lookup(lookup_from(&[("FLEETBOOK_BOOKING_POLICY", "greedy")]))
            .unwrap_err();
        assert!(err.contains("greedy"));
    }
}
