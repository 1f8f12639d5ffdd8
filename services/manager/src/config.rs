//! Configuration for the deployment manager.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::messaging::IN_MEMORY_TYPE;
use crate::monitor::DEFAULT_HEARTBEAT_THRESHOLD;

/// Deployment manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the state database and application resources.
    pub data_dir: PathBuf,

    /// Messaging backend requested at start-up.
    pub messaging_type: String,

    /// Health monitor tick period in seconds.
    pub monitor_interval_secs: u64,

    /// Missed ticks tolerated before a scoped instance is flagged.
    pub heartbeat_threshold: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("DM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/dm"));

        let messaging_type =
            lookup("DM_MESSAGING_TYPE").unwrap_or_else(|| IN_MEMORY_TYPE.to_string());

        let monitor_interval_secs = match lookup("DM_MONITOR_INTERVAL_SECS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid DM_MONITOR_INTERVAL_SECS '{raw}'"))?,
            None => 20,
        };
        if monitor_interval_secs == 0 {
            bail!("DM_MONITOR_INTERVAL_SECS must be greater than zero");
        }

        let heartbeat_threshold = match lookup("DM_HEARTBEAT_THRESHOLD") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid DM_HEARTBEAT_THRESHOLD '{raw}'"))?,
            None => DEFAULT_HEARTBEAT_THRESHOLD,
        };

        let log_level = lookup("DM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            data_dir,
            messaging_type,
            monitor_interval_secs,
            heartbeat_threshold,
            log_level,
        })
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// Path of the SQLite state database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("dm.sqlite")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dm"));
        assert_eq!(config.messaging_type, IN_MEMORY_TYPE);
        assert_eq!(config.monitor_interval(), Duration::from_secs(20));
        assert_eq!(config.heartbeat_threshold, DEFAULT_HEARTBEAT_THRESHOLD);
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/dm/dm.sqlite"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DM_DATA_DIR", "/tmp/dm"),
            ("DM_MESSAGING_TYPE", "amqp"),
            ("DM_MONITOR_INTERVAL_SECS", "5"),
            ("DM_HEARTBEAT_THRESHOLD", "4"),
        ]))
        .unwrap();
        assert_eq!(config.messaging_type, "amqp");
        assert_eq!(config.monitor_interval_secs, 5);
        assert_eq!(config.heartbeat_threshold, 4);
    }

    #[test]
    fn test_rejects_invalid_numbers() {
        assert!(Config::from_lookup(lookup(&[("DM_MONITOR_INTERVAL_SECS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DM_MONITOR_INTERVAL_SECS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DM_HEARTBEAT_THRESHOLD", "-1")])).is_err());
    }
}
