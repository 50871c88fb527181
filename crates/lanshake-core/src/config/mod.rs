//! Configuration management for Lanshake.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/lanshake/config.toml` |
//! | macOS | `~/Library/Application Support/com.lanshake.Lanshake/config.toml` |
//! | Windows | `%APPDATA%\lanshake\Lanshake\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanshake_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Listening on {}", config.network.communication_port);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for Lanshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Trust settings
    pub trust: TrustConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Nickname announced to peers
    pub device_name: String,
    /// Longest nickname stored for any device
    pub nickname_max_length: usize,
    /// Overrides the platform data directory
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Lanshake Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            nickname_max_length: crate::DEFAULT_NICKNAME_MAX_LENGTH,
            data_dir: None,
        }
    }
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Communication server port (TCP)
    pub communication_port: u16,
    /// Data-phase port range; `(0, 0)` lets the OS pick
    pub transfer_port_range: (u16, u16),
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Read timeout for every request/response
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Interface name prefixes ignored for adapter matching
    pub disabled_interfaces: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            communication_port: crate::DEFAULT_COMMUNICATION_PORT,
            transfer_port_range: (
                crate::DEFAULT_TRANSFER_PORT_START,
                crate::DEFAULT_TRANSFER_PORT_END,
            ),
            connect_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            read_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            disabled_interfaces: vec!["lo".to_string(), "docker".to_string(), "veth".to_string()],
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How long a sender waits for the accept/reject decision
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Chunk size for the data phase
    pub chunk_size: usize,
    /// Where received entries land when the application does not choose
    pub output_dir: Option<PathBuf>,
    /// Age after which finished groups are expired
    #[serde(with = "humantime_serde")]
    pub group_expiry: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            output_dir: None,
            group_expiry: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Trust configuration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Accept incoming transfers from trusted devices without asking
    pub auto_accept_trusted: bool,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Render as TOML, the same way the file is written.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be represented in TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "lanshake", "Lanshake")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Directory holding the device id and the registry.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "lanshake", "Lanshake")
                .map_or_else(|| PathBuf::from("."), |dirs| dirs.data_dir().to_path_buf())
        })
    }

    /// Directory for received entries when nothing else is chosen.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.transfer.output_dir.clone().unwrap_or_else(|| {
            directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    const UNITS: [(&str, u64); 4] = [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)];

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 || duration.as_secs() == 0 {
            return serializer.serialize_str(&format!("{}ms", duration.as_millis()));
        }
        let secs = duration.as_secs();
        let (suffix, size) = UNITS
            .iter()
            .find(|(_, size)| secs % size == 0)
            .copied()
            .unwrap_or(("s", 1));
        serializer.serialize_str(&format!("{}{suffix}", secs / size))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{s}'")))
    }

    pub(super) fn parse(s: &str) -> Option<Duration> {
        if let Some(ms) = s.strip_suffix("ms") {
            return ms.parse().ok().map(Duration::from_millis);
        }
        UNITS.iter().find_map(|(suffix, size)| {
            s.strip_suffix(suffix)
                .and_then(|n| n.parse::<u64>().ok())
                .map(|n| Duration::from_secs(n * size))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.network.communication_port, 1128);
        assert_eq!(config.network.read_timeout, Duration::from_secs(5));
        assert_eq!(config.general.nickname_max_length, 32);
        assert!(!config.trust.auto_accept_trusted);
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.general.device_name = "Test Device".to_string();
        original.network.communication_port = 12345;
        original.transfer.response_timeout = Duration::from_secs(90);
        original.trust.auto_accept_trusted = true;
        original.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.general.device_name, "Test Device");
        assert_eq!(loaded.network.communication_port, 12345);
        assert_eq!(loaded.transfer.response_timeout, Duration::from_secs(90));
        assert!(loaded.trust.auto_accept_trusted);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.network.communication_port, 1128);
    }

    #[test]
    fn test_parse_failure_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[network]\nread_timeout = \"soon\"\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[general]
device_name = "My Custom Device"

[transfer]
group_expiry = "2h"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.general.device_name, "My Custom Device");
        assert_eq!(config.transfer.group_expiry, Duration::from_secs(7200));
        assert_eq!(config.network.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let toml_str = toml::to_string_pretty(&Config::default()).expect("serialize");

        assert!(toml_str.contains("read_timeout = \"5s\""));
        assert!(toml_str.contains("response_timeout = \"30s\""));
        assert!(toml_str.contains("group_expiry = \"7d\""));
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(humantime_serde::parse("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(humantime_serde::parse("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(humantime_serde::parse("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(humantime_serde::parse("12"), None);
    }
}
