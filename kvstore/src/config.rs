//! Replication configuration.
//!
//! Loaded from environment variables; every setting has a default.
//!
//! # Environment Variables
//!
//! - `KVSTORE_REPLICATION_PORT`: Port replicas connect to (default: `7001`)
//! - `KVSTORE_HEARTBEAT_MS`: Idle time before a heartbeat no-op (default: `1100`)
//! - `KVSTORE_SHARD_COUNT`: Number of shard contexts (default: `4`)
//! - `KVSTORE_BACKFILL_TIMEOUT_MS`: Longest wait for the next backfill entry
//!   before giving up (default: unset, wait forever)
//!
//! # Invariants
//!
//! - `heartbeat_interval` is non-zero
//! - `shard_count` is at least 1

use std::time::Duration;

pub const PORT_VAR: &str = "KVSTORE_REPLICATION_PORT";
pub const HEARTBEAT_VAR: &str = "KVSTORE_HEARTBEAT_MS";
pub const SHARD_COUNT_VAR: &str = "KVSTORE_SHARD_COUNT";
pub const BACKFILL_TIMEOUT_VAR: &str = "KVSTORE_BACKFILL_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Port the master listens on for a replica. Zero picks a free port.
    pub listen_port: u16,
    /// After this long without a mutation the master sends a no-op.
    pub heartbeat_interval: Duration,
    pub shard_count: usize,
    /// Per-entry wait bound while streaming a backfill.
    pub backfill_stall_timeout: Option<Duration>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen_port: Self::DEFAULT_PORT,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            shard_count: Self::DEFAULT_SHARD_COUNT,
            backfill_stall_timeout: None,
        }
    }
}

impl ReplicationConfig {
    pub const DEFAULT_PORT: u16 = 7001;
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1100);
    pub const DEFAULT_SHARD_COUNT: usize = 4;

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let listen_port = parse_var::<u16>(&lookup, PORT_VAR, "a port number (0-65535)")?
            .unwrap_or(Self::DEFAULT_PORT);

        let heartbeat_interval = match parse_var::<u64>(&lookup, HEARTBEAT_VAR, "milliseconds")? {
            Some(0) => return Err(invalid(HEARTBEAT_VAR, "must be greater than zero".to_string())),
            Some(ms) => Duration::from_millis(ms),
            None => Self::DEFAULT_HEARTBEAT_INTERVAL,
        };

        let shard_count = match parse_var::<usize>(&lookup, SHARD_COUNT_VAR, "a shard count")? {
            Some(0) => return Err(invalid(SHARD_COUNT_VAR, "must be at least 1".to_string())),
            Some(count) => count,
            None => Self::DEFAULT_SHARD_COUNT,
        };

        let backfill_stall_timeout =
            parse_var::<u64>(&lookup, BACKFILL_TIMEOUT_VAR, "milliseconds")?
                .map(Duration::from_millis);

        Ok(Self {
            listen_port,
            heartbeat_interval,
            shard_count,
            backfill_stall_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    expected: &str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| invalid(name, format!("'{value}' is not {expected}")))
        })
        .transpose()
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ReplicationConfig::from_lookup(lookup(&[])).expect("should load");
        assert_eq!(config, ReplicationConfig::default());
        assert_eq!(config.listen_port, 7001);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1100));
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.backfill_stall_timeout, None);
    }

    #[test]
    fn test_overrides() {
        let config = ReplicationConfig::from_lookup(lookup(&[
            (PORT_VAR, "9000"),
            (HEARTBEAT_VAR, "250"),
            (SHARD_COUNT_VAR, "8"),
            (BACKFILL_TIMEOUT_VAR, "5000"),
        ]))
        .expect("should load");

        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.shard_count, 8);
        assert_eq!(config.backfill_stall_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_port() {
        let error = ReplicationConfig::from_lookup(lookup(&[(PORT_VAR, "70000")]))
            .expect_err("port out of range");
        assert_eq!(
            error.to_string(),
            "invalid value for KVSTORE_REPLICATION_PORT: '70000' is not a port number (0-65535)"
        );
    }

    #[test]
    fn test_zero_heartbeat_and_shards_rejected() {
        assert!(ReplicationConfig::from_lookup(lookup(&[(HEARTBEAT_VAR, "0")])).is_err());
        assert!(ReplicationConfig::from_lookup(lookup(&[(SHARD_COUNT_VAR, "0")])).is_err());
        assert!(ReplicationConfig::from_lookup(lookup(&[(SHARD_COUNT_VAR, "many")])).is_err());
    }
}
