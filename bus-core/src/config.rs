// bus-core/src/config.rs

//! Bus configuration: TOML parsing, environment variable overrides, and
//! validation.
//!
//! The values here are supplied by an external launcher; the bus only
//! validates and consumes them.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::affinity::AffinityFallback;
use crate::error::{BusError, Result};

/// Shared rendezvous address. Used once at bootstrap, never for message
/// addressing afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterEndpoint {
    pub host: String,
    pub port: u16,
}

impl Default for MasterEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 29500,
        }
    }
}

impl MasterEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used for binding and dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // Loads the endpoint from the launcher-distributed CSV file: a header
    // line followed by one "host,port" line.
    pub fn from_csv_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BusError::config_with_source(
                format!("failed to read master config '{}'", path.display()),
                e,
            )
        })?;

        let mut lines = content.lines();
        // skip header line
        lines.next();
        let record = lines
            .next()
            .ok_or_else(|| BusError::config("master config has no record line"))?;

        let mut fields = record.split(',');
        let host = fields
            .next()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BusError::config("master config record has no host"))?;
        let port = fields
            .next()
            .map(str::trim)
            .ok_or_else(|| BusError::config("master config record has no port"))?;
        let port = port.parse().map_err(|e| {
            BusError::config_with_source(format!("invalid master port '{port}'"), e)
        })?;

        Ok(Self::new(host, port))
    }
}

/// Where this process binds and how it advertises itself to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    // Bind address for the inbound endpoint; port 0 picks an ephemeral port.
    pub bind_addr: String,
    // Host peers should dial; combined with the actually-bound port.
    pub advertise_host: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

/// Transport tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    // Concurrent inbound calls serviced per connection; excess queues at the
    // transport layer.
    pub worker_threads: usize,
    // Per-call timeout for synchronous sends, in milliseconds.
    pub call_timeout_ms: u64,
    // Timeout for establishing a channel to a peer, in milliseconds.
    pub connect_timeout_ms: u64,
    // Deadline for the whole-world rendezvous handshake, in milliseconds.
    pub bootstrap_timeout_ms: u64,
    // Poll interval while waiting for the world to complete, in milliseconds.
    pub rendezvous_poll_ms: u64,
    // Initial delay between rendezvous connection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            call_timeout_ms: 1_800_000, // 30 min, matches the upstream RPC default
            connect_timeout_ms: 5_000,
            bootstrap_timeout_ms: 60_000,
            rendezvous_poll_ms: 100,
            reconnect_delay_ms: 100,
        }
    }
}

impl TransportConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
}

/// One row of the per-rank device-index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTableEntry {
    pub rank: u32,
    pub device: u32,
}

/// Device-affinity settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Whether cross-process device-to-device transfer hints are attached.
    pub enabled: bool,
    /// Per-rank device-index table; resolved externally and passed through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<DeviceTableEntry>>,
    /// Pairing used when enabled without a table.
    pub fallback: AffinityFallback,
}

impl AffinityConfig {
    /// The table as a rank -> device lookup, if one was supplied.
    pub fn device_table(&self) -> Option<HashMap<u32, u32>> {
        self.table
            .as_ref()
            .map(|entries| entries.iter().map(|e| (e.rank, e.device)).collect())
    }
}

// Top-level bus configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// This process's rank; rank 0 acts as coordinator.
    pub rank: u32,
    /// Fixed number of ranks in the world.
    pub world_size: u32,
    pub master: MasterEndpoint,
    pub listen: ListenConfig,
    pub transport: TransportConfig,
    pub affinity: AffinityConfig,
}

impl FromStr for BusConfig {
    type Err = BusError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| BusError::config_with_source("failed to parse TOML config", e))
    }
}

impl BusConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BusError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `DWB_`:
    // - `DWB_RANK`, `DWB_WORLD_SIZE`
    // - `DWB_MASTER_HOST`, `DWB_MASTER_PORT`
    // - `DWB_BIND_ADDR`, `DWB_ADVERTISE_HOST`
    // - `DWB_WORKER_THREADS`, `DWB_CALL_TIMEOUT_MS`, `DWB_BOOTSTRAP_TIMEOUT_MS`
    // - `DWB_AFFINITY_ENABLED`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("DWB_RANK") {
            if let Ok(v) = val.parse() {
                self.rank = v;
            }
        }
        if let Ok(val) = std::env::var("DWB_WORLD_SIZE") {
            if let Ok(v) = val.parse() {
                self.world_size = v;
            }
        }
        if let Ok(val) = std::env::var("DWB_MASTER_HOST") {
            self.master.host = val;
        }
        if let Ok(val) = std::env::var("DWB_MASTER_PORT") {
            if let Ok(v) = val.parse() {
                self.master.port = v;
            }
        }
        if let Ok(val) = std::env::var("DWB_BIND_ADDR") {
            self.listen.bind_addr = val;
        }
        if let Ok(val) = std::env::var("DWB_ADVERTISE_HOST") {
            self.listen.advertise_host = val;
        }
        if let Ok(val) = std::env::var("DWB_WORKER_THREADS") {
            if let Ok(v) = val.parse() {
                self.transport.worker_threads = v;
            }
        }
        if let Ok(val) = std::env::var("DWB_CALL_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.transport.call_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DWB_BOOTSTRAP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.transport.bootstrap_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DWB_AFFINITY_ENABLED") {
            if let Ok(v) = val.parse() {
                self.affinity.enabled = v;
            }
        }
        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid. Validation runs
    // before any endpoint is bound.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(BusError::config("world_size must be greater than 0"));
        }
        if self.rank >= self.world_size {
            return Err(BusError::config(format!(
                "rank {} out of range for world size {}",
                self.rank, self.world_size
            )));
        }
        if self.master.host.is_empty() {
            return Err(BusError::config("master.host must not be empty"));
        }
        if self.master.port == 0 {
            return Err(BusError::config("master.port must not be 0"));
        }
        if self.listen.bind_addr.is_empty() {
            return Err(BusError::config("listen.bind_addr must not be empty"));
        }
        if self.listen.advertise_host.is_empty() {
            return Err(BusError::config("listen.advertise_host must not be empty"));
        }
        if self.transport.worker_threads == 0 {
            return Err(BusError::config(
                "transport.worker_threads must be greater than 0",
            ));
        }
        if self.transport.call_timeout_ms == 0 {
            return Err(BusError::config(
                "transport.call_timeout_ms must be greater than 0",
            ));
        }
        if self.transport.bootstrap_timeout_ms == 0 {
            return Err(BusError::config(
                "transport.bootstrap_timeout_ms must be greater than 0",
            ));
        }
        if self.transport.rendezvous_poll_ms == 0 {
            return Err(BusError::config(
                "transport.rendezvous_poll_ms must be greater than 0",
            ));
        }

        if let Some(entries) = &self.affinity.table {
            let mut seen = std::collections::HashSet::new();
            for entry in entries {
                if !seen.insert(entry.rank) {
                    return Err(BusError::config(format!(
                        "affinity.table lists rank {} more than once",
                        entry.rank
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();

        assert_eq!(config.rank, 0);
        assert_eq!(config.master.host, "127.0.0.1");
        assert_eq!(config.master.port, 29500);
        assert_eq!(config.listen.bind_addr, "0.0.0.0:0");
        assert_eq!(config.transport.worker_threads, 16);
        assert_eq!(config.transport.call_timeout_ms, 1_800_000);
        assert!(!config.affinity.enabled);
        assert!(config.affinity.table.is_none());
    }

    #[test]
    fn test_default_validates_with_world() {
        let config = BusConfig {
            world_size: 1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            rank = 2
            world_size = 4

            [master]
            host = "10.0.0.1"
            port = 29501
        "#;
        let config: BusConfig = toml.parse().unwrap();

        assert_eq!(config.rank, 2);
        assert_eq!(config.world_size, 4);
        assert_eq!(config.master.addr(), "10.0.0.1:29501");
        // Other sections keep defaults
        assert_eq!(config.transport.worker_threads, 16);
    }

    #[test]
    fn test_from_str_affinity_table() {
        let toml = r#"
            rank = 0
            world_size = 2

            [affinity]
            enabled = true

            [[affinity.table]]
            rank = 0
            device = 3

            [[affinity.table]]
            rank = 1
            device = 7
        "#;
        let config: BusConfig = toml.parse().unwrap();

        assert!(config.affinity.enabled);
        let table = config.affinity.device_table().unwrap();
        assert_eq!(table, HashMap::from([(0, 3), (1, 7)]));
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<BusConfig, _> = "rank = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            rank = 1
            world_size = 2
            "#
        )
        .unwrap();

        let config = BusConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rank, 1);
        assert_eq!(config.world_size, 2);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = BusConfig::from_file("/nonexistent/bus.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_zero_world() {
        let config = BusConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rank_out_of_range() {
        let config = BusConfig {
            rank: 2,
            world_size: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_validate_duplicate_affinity_rank() {
        let config = BusConfig {
            world_size: 2,
            affinity: AffinityConfig {
                enabled: true,
                table: Some(vec![
                    DeviceTableEntry { rank: 0, device: 1 },
                    DeviceTableEntry { rank: 0, device: 2 },
                ]),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_zero_worker_threads() {
        let mut config = BusConfig {
            world_size: 1,
            ..Default::default()
        };
        config.transport.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_master_from_csv_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "master_address,master_port").unwrap();
        writeln!(file, "192.168.11.1,29500").unwrap();

        let master = MasterEndpoint::from_csv_file(file.path()).unwrap();
        assert_eq!(master.host, "192.168.11.1");
        assert_eq!(master.port, 29500);
    }

    #[test]
    fn test_master_from_csv_file_missing_record() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "master_address,master_port").unwrap();

        assert!(MasterEndpoint::from_csv_file(file.path()).is_err());
    }

    #[test]
    fn test_master_from_csv_file_bad_port() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "master_address,master_port").unwrap();
        writeln!(file, "10.0.0.1,not_a_port").unwrap();

        assert!(MasterEndpoint::from_csv_file(file.path()).is_err());
    }

    // Helper to clear all DWB_ environment variables for test isolation
    fn clear_dwb_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("DWB_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_dwb_env_vars();

        std::env::set_var("DWB_RANK", "3");
        std::env::set_var("DWB_WORLD_SIZE", "8");
        std::env::set_var("DWB_MASTER_HOST", "10.1.2.3");
        std::env::set_var("DWB_MASTER_PORT", "29777");
        std::env::set_var("DWB_CALL_TIMEOUT_MS", "2500");
        std::env::set_var("DWB_AFFINITY_ENABLED", "true");

        let config = BusConfig::default().with_env_overrides();

        assert_eq!(config.rank, 3);
        assert_eq!(config.world_size, 8);
        assert_eq!(config.master.addr(), "10.1.2.3:29777");
        assert_eq!(config.transport.call_timeout_ms, 2500);
        assert!(config.affinity.enabled);

        clear_dwb_env_vars();

        // Invalid values should be ignored (keep defaults)
        std::env::set_var("DWB_WORLD_SIZE", "not_a_number");
        let config = BusConfig::default().with_env_overrides();
        assert_eq!(config.world_size, 0);

        clear_dwb_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = BusConfig {
            world_size: 2,
            ..Default::default()
        };
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: BusConfig = toml_str.parse().unwrap();

        assert_eq!(original, parsed);
    }
}
