use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Timeouts and limits of the command engine
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wait for the ping response
    #[serde(deserialize_with = "duration::deserialize")]
    pub ping_timeout: Duration,
    /// Wait for the Ack following a command
    #[serde(deserialize_with = "duration::deserialize")]
    pub ack_timeout: Duration,
    /// Wait for the response of ordinary commands
    #[serde(deserialize_with = "duration::deserialize")]
    pub command_timeout: Duration,
    /// Wait for the response of flash erase and write commands
    #[serde(deserialize_with = "duration::deserialize")]
    pub erase_timeout: Duration,
    /// Send cycles per command, the first one included
    pub max_attempts: u32,
    /// Largest raw block moved per transport call during a data phase
    pub data_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_millis(1000),
            ack_timeout: Duration::from_millis(1000),
            command_timeout: Duration::from_millis(500),
            erase_timeout: Duration::from_secs(10),
            max_attempts: 3,
            data_chunk_size: 32,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.data_chunk_size == 0 {
            return Err(Error::Config("data_chunk_size must be at least 1".into()));
        }
        let timeouts = [
            ("ping_timeout", self.ping_timeout),
            ("ack_timeout", self.ack_timeout),
            ("command_timeout", self.command_timeout),
            ("erase_timeout", self.erase_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(Error::Config(format!("{} must not be zero", name)));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Longest wait for the port while another handle runs an exchange
    #[serde(deserialize_with = "duration::deserialize")]
    pub lock_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115200,
            lock_timeout: Duration::from_secs(15),
        }
    }
}

/// Settings file of the command line tool
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub serial: SerialConfig,
    pub engine: EngineConfig,
}

impl ToolConfig {
    /// Load the settings from a TOML file, or use defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            Some(path) => {
                let txt = fs::read_to_string(path)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                Self::from_toml(&txt)?
            }
            None => Self::default(),
        };
        Ok(cfg)
    }

    pub fn from_toml(txt: &str) -> Result<Self> {
        let cfg: ToolConfig = toml::from_str(txt).map_err(|e| Error::Config(e.to_string()))?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}

/// Durations written the humantime way ("500ms", "10s")
mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ping_timeout, Duration::from_secs(1));
        assert_eq!(cfg.command_timeout, Duration::from_millis(500));
        assert_eq!(cfg.erase_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_attempts, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let cfg = ToolConfig::from_toml(
            r#"
            [serial]
            port = "/dev/ttyUSB1"
            lock_timeout = "2s"

            [engine]
            erase_timeout = "30s"
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.serial.port, "/dev/ttyUSB1");
        assert_eq!(cfg.serial.baud_rate, 115200);
        assert_eq!(cfg.serial.lock_timeout, Duration::from_secs(2));
        assert_eq!(cfg.engine.erase_timeout, Duration::from_secs(30));
        assert_eq!(cfg.engine.max_attempts, 5);
        assert_eq!(cfg.engine.ack_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values() {
        assert!(ToolConfig::from_toml("[engine]\nmax_attempts = 0\n").is_err());
        assert!(ToolConfig::from_toml("[engine]\nping_timeout = \"soon\"\n").is_err());
        assert!(ToolConfig::from_toml("[engine]\ncommand_timeout = \"0s\"\n").is_err());
    }

    #[test]
    fn test_no_file_gives_defaults() {
        assert_eq!(ToolConfig::load(None).unwrap(), ToolConfig::default());
    }
}
