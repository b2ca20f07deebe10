use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RelayConfig {
    /// OS port name of the reader-facing endpoint.
    pub client_port: String,
    /// OS port name of the card-emulator-facing endpoint.
    pub host_port: String,
    pub baud_rate: u32,
    /// Per-direction ring capacity in bytes; power of two recommended.
    pub buffer_capacity: usize,
    pub read_timeout_ms: u64,
    /// Inter-byte idle window that flushes ambiguous short frames.
    pub inter_byte_idle_ms: u64,
    pub latency_window_size: usize,
    pub latency_threshold_ns: u64,
    pub metric_tick_ms: u64,
    /// Forward write retries before a pump goes fatal.
    pub max_retries: u32,
    pub auto_restart: bool,
    pub restart_ceiling: u32,
    pub shutdown_timeout_ms: u64,
    /// Advisory 14443-3 style BCC verification; never blocks forwarding.
    pub verify_checksum: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            client_port: String::new(),
            host_port: String::new(),
            baud_rate: 921_600,
            buffer_capacity: 4096,
            read_timeout_ms: 1,
            inter_byte_idle_ms: 2,
            latency_window_size: 100,
            latency_threshold_ns: 5_000_000,
            metric_tick_ms: 100,
            max_retries: 1,
            auto_restart: false,
            restart_ceiling: 3,
            shutdown_timeout_ms: 500,
            verify_checksum: false,
        }
    }
}

impl RelayConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::home_dir()
            .context("No home directory")?
            .join(".nfc_relay");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            let default = Self::default();
            default.save()?;
            Ok(default)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations the relay cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.client_port.is_empty() {
            bail!("client_port is required");
        }
        if self.host_port.is_empty() {
            bail!("host_port is required");
        }
        if self.client_port == self.host_port {
            bail!("client_port and host_port must differ");
        }
        if self.buffer_capacity == 0 {
            bail!("buffer_capacity must be non-zero");
        }
        if !self.buffer_capacity.is_power_of_two() {
            log::warn!(
                "buffer_capacity {} is not a power of two; wrap arithmetic is slower",
                self.buffer_capacity
            );
        }
        if self.latency_window_size == 0 {
            bail!("latency_window_size must be non-zero");
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_timeout_ms)
    }

    pub fn inter_byte_idle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.inter_byte_idle_ms)
    }

    pub fn metric_tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.metric_tick_ms)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.buffer_capacity, 4096);
        assert_eq!(config.read_timeout_ms, 1);
        assert_eq!(config.inter_byte_idle_ms, 2);
        assert_eq!(config.latency_window_size, 100);
        assert_eq!(config.latency_threshold_ns, 5_000_000);
        assert_eq!(config.metric_tick_ms, 100);
        assert_eq!(config.max_retries, 1);
        assert!(!config.auto_restart);
        assert_eq!(config.shutdown_timeout_ms, 500);
    }

    #[test]
    fn test_config_serialization() {
        let config = RelayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.baud_rate, deserialized.baud_rate);
        assert_eq!(config.buffer_capacity, deserialized.buffer_capacity);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"client_port":"/dev/ttyUSB0","host_port":"/dev/ttyUSB1"}"#)
                .unwrap();
        assert_eq!(config.client_port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 921_600);
    }

    #[test]
    fn test_validate_requires_ports() {
        let mut config = RelayConfig::default();
        assert!(config.validate().is_err());
        config.client_port = "/dev/ttyUSB0".to_string();
        config.host_port = "/dev/ttyUSB0".to_string();
        assert!(config.validate().is_err());
        config.host_port = "/dev/ttyUSB1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = RelayConfig::default();
        config.client_port = "a".to_string();
        config.host_port = "b".to_string();
        config.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }
}
