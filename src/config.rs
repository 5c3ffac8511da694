//! Link and timing configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Who drains inbound reports from the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Callers step the poller themselves while they wait.
    #[default]
    Manual,
    /// A dedicated thread drains the link for as long as it is connected.
    Background,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Overall bound on the connect handshake.
    pub handshake_timeout_ms: u64,
    /// Spacing of `comtest` probes during the handshake.
    pub probe_interval_ms: u64,
    /// Per-message reply deadline.
    pub reply_timeout_ms: u64,
    /// Steady-state read timeout of the transport; one poll step waits this long.
    pub poll_interval_ms: u64,
    pub sample_timeout_ms: u64,
    pub sample_granularity_ms: u64,
    pub poll_mode: PollMode,
    /// Leave the board's verbose output on after connecting.
    pub verbose: bool,
    /// Drive every PWM output to 0 after connecting.
    pub zero_outputs_on_connect: bool,
    pub reporting_interval_ms: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 57600,
            handshake_timeout_ms: 5000,
            probe_interval_ms: 200,
            reply_timeout_ms: 5000,
            poll_interval_ms: 10,
            sample_timeout_ms: 100,
            sample_granularity_ms: 1,
            poll_mode: PollMode::Manual,
            verbose: false,
            zero_outputs_on_connect: true,
            reporting_interval_ms: 1000,
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn sample_granularity(&self) -> Duration {
        Duration::from_millis(self.sample_granularity_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = DeviceConfig::from_toml_str(
            r#"
            port = "/dev/ttyUSB3"
            poll_mode = "background"
            sample_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.port, "/dev/ttyUSB3");
        assert_eq!(config.poll_mode, PollMode::Background);
        assert_eq!(config.sample_timeout(), Duration::from_millis(250));
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn reject_unknown_poll_mode() {
        let err = DeviceConfig::from_toml_str("poll_mode = \"sometimes\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "baud_rate = 9600\nverbose = true").unwrap();
        let config = DeviceConfig::load(file.path()).unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert!(config.verbose);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = DeviceConfig::load("/nonexistent/board.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
