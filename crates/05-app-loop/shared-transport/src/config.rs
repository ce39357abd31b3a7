//! Transport configuration with defaults matching the reference chip setup.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use transport::{PoolConfig, TransportError, TransportResult};

/// Settings of one transport instance.
///
/// Every field has a default, so a TOML document only needs the keys it
/// overrides.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of the channel table; channel numbers must be below it.
    pub max_channels: usize,
    /// Number of send priorities (0 is the highest).
    pub max_priorities: u8,
    /// Largest payload a received packet may declare.
    pub rx_buffer_size: usize,
    /// Line speed applied when the transport starts.
    pub baud_rate: u32,
    /// Re-send a wake indication when its acknowledgment is this late.
    pub wake_ack_timeout_ms: Option<u64>,
    /// How often the I/O thread wakes without any event to check timers.
    pub poll_interval_ms: u64,
    /// Transaction pool sizing.
    pub pool: PoolConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_channels: 16,
            max_priorities: 3,
            rx_buffer_size: 1028,
            baud_rate: 115_200,
            wake_ack_timeout_ms: None,
            poll_interval_ms: 10,
            pool: PoolConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> TransportResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|err| TransportError::invalid_config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> TransportResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.max_channels == 0 || self.max_channels > 256 {
            return Err(TransportError::invalid_config(format!(
                "max_channels must be in 1..=256, got {}",
                self.max_channels
            )));
        }
        if self.max_priorities == 0 {
            return Err(TransportError::invalid_config("max_priorities must be at least 1"));
        }
        if self.rx_buffer_size == 0 || self.rx_buffer_size > self.pool.long_buf_size {
            return Err(TransportError::invalid_config(format!(
                "rx_buffer_size {} must fit the long buffer class of {} bytes",
                self.rx_buffer_size, self.pool.long_buf_size
            )));
        }
        if self.pool.long_buf_count == 0 {
            return Err(TransportError::invalid_config(
                "pool needs long buffers for reception",
            ));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::invalid_config("baud_rate must be non-zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(TransportError::invalid_config("poll_interval_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn wake_ack_timeout(&self) -> Option<Duration> {
        self.wake_ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TransportConfig::default().validate().expect("defaults");
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = TransportConfig::from_toml_str(
            r#"
            baud_rate = 3000000
            wake_ack_timeout_ms = 250

            [pool]
            txn_count = 8
            "#,
        )
        .expect("parse");
        assert_eq!(config.baud_rate, 3_000_000);
        assert_eq!(config.wake_ack_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.pool.txn_count, 8);
        assert_eq!(config.pool.long_buf_size, PoolConfig::default().long_buf_size);
        assert_eq!(config.max_channels, 16);
    }

    #[test]
    fn rx_buffer_must_fit_long_class() {
        let err = TransportConfig::from_toml_str("rx_buffer_size = 4096").expect_err("too big");
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = TransportConfig::from_toml_str("baud_rate = \"fast\"").expect_err("bad type");
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }
}
