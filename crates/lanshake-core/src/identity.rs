//! Local device self-description.
//!
//! The local identity is what this node announces in every handshake reply and
//! every outgoing request: brand, model, nickname, device id and application
//! version. Platform details come from a [`PlatformInfo`] so tests can inject
//! fixed values.

use std::fs;
use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{AppInfo, DeviceInfo, HandshakePayload};
use crate::registry::Device;

/// File under the data directory holding the persisted device id
pub const DEVICE_ID_FILE: &str = "device_id";

/// Platform facts needed to describe this device.
pub trait PlatformInfo: Send + Sync {
    /// Stable id of this installation.
    fn device_id(&self) -> String;

    /// Manufacturer or OS family.
    fn brand(&self) -> String;

    /// Hardware model.
    fn model(&self) -> String;

    /// Application version, semver formatted.
    fn app_version(&self) -> String {
        crate::VERSION.to_string()
    }
}

/// The host this process runs on.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    device_id: String,
    model: String,
}

impl HostPlatform {
    /// Read the persisted device id from `data_dir`, generating one on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if the id file cannot be read or written.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DEVICE_ID_FILE);

        let device_id = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                Error::Storage(format!("Failed to read device id at {}: {e}", path.display()))
            })?;
            let id = raw.trim().to_string();
            if id.is_empty() {
                Self::generate(&path)?
            } else {
                id
            }
        } else {
            Self::generate(&path)?
        };

        let model = hostname::get().map_or_else(
            |_| "unknown".to_string(),
            |h| h.to_string_lossy().to_string(),
        );

        debug!(%device_id, %model, "loaded host platform");
        Ok(Self { device_id, model })
    }

    fn generate(path: &Path) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        fs::write(path, &id).map_err(|e| {
            Error::Storage(format!("Failed to write device id at {}: {e}", path.display()))
        })?;
        info!(device_id = %id, "generated new device id");
        Ok(id)
    }
}

impl PlatformInfo for HostPlatform {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn brand(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn model(&self) -> String {
        self.model.clone()
    }
}

/// Numeric version derived from a semver string: `major * 10000 + minor * 100 + patch`.
///
/// Unparseable versions yield 0.
#[must_use]
pub fn version_code(version: &str) -> i64 {
    semver::Version::parse(version).map_or(0, |v| {
        let code = v.major * 10_000 + v.minor * 100 + v.patch;
        i64::try_from(code).unwrap_or(i64::MAX)
    })
}

/// Cap a nickname: anything longer than `max` characters keeps its first `max - 1`.
#[must_use]
pub fn truncate_nickname(nickname: &str, max: usize) -> String {
    if nickname.chars().count() > max {
        nickname.chars().take(max.saturating_sub(1)).collect()
    } else {
        nickname.to_string()
    }
}

/// This node's identity.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    device: Device,
    payload: HandshakePayload,
}

impl LocalIdentity {
    /// Describe the local device. The nickname is `device_name` when set,
    /// otherwise the upper-cased model.
    pub fn new(platform: &dyn PlatformInfo, device_name: Option<&str>, max_nickname: usize) -> Self {
        let model = platform.model();
        let nickname = device_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| model.to_uppercase(), ToString::to_string);
        let nickname = truncate_nickname(&nickname, max_nickname);

        let version_name = platform.app_version();
        let mut device = Device::new(platform.device_id(), platform.brand(), model, nickname);
        device.version_number = version_code(&version_name);
        device.version_name = version_name;
        device.is_local_address = true;
        device.is_trusted = true;
        device.last_usage_time = crate::now_millis();

        let payload = HandshakePayload {
            device: DeviceInfo {
                brand: device.brand.clone(),
                model: device.model.clone(),
                nickname: device.nickname.clone(),
                device_id: device.device_id.clone(),
            },
            app: AppInfo {
                version_name: device.version_name.clone(),
                version_code: device.version_number,
            },
        };

        Self { device, payload }
    }

    /// The local device record.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Local device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    /// Identity block sent on the wire.
    #[must_use]
    pub fn payload(&self) -> &HandshakePayload {
        &self.payload
    }
}

/// Fixed platform facts.
#[derive(Debug, Clone)]
pub struct StaticPlatform {
    /// Device id
    pub device_id: String,
    /// Brand
    pub brand: String,
    /// Model
    pub model: String,
    /// Application version
    pub version: String,
}

impl StaticPlatform {
    /// Platform with the given id and placeholder hardware facts.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            brand: "test".to_string(),
            model: "bench".to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

impl PlatformInfo for StaticPlatform {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn brand(&self) -> String {
        self.brand.clone()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn app_version(&self) -> String {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_version_code() {
        assert_eq!(version_code("1.2.5"), 10_205);
        assert_eq!(version_code("0.3.0"), 300);
        assert_eq!(version_code("garbage"), 0);
    }

    #[test]
    fn test_truncate_nickname() {
        let long = "a".repeat(40);
        assert_eq!(truncate_nickname(&long, 32).chars().count(), 31);
        assert_eq!(truncate_nickname("short", 32), "short");
        assert_eq!(truncate_nickname(&"x".repeat(32), 32).len(), 32);
        assert_eq!(truncate_nickname("ééééé", 4), "ééé");
    }

    #[test]
    fn test_nickname_falls_back_to_model() {
        let platform = StaticPlatform::new("local");
        let identity = LocalIdentity::new(&platform, None, 32);
        assert_eq!(identity.device().nickname, "BENCH");

        let identity = LocalIdentity::new(&platform, Some("Kitchen"), 32);
        assert_eq!(identity.payload().device.nickname, "Kitchen");
        assert!(identity.device().is_local_address);
    }

    #[test]
    fn test_device_id_persisted() {
        let dir = TempDir::new().unwrap();
        let first = HostPlatform::load(dir.path()).unwrap();
        let second = HostPlatform::load(dir.path()).unwrap();

        assert_eq!(first.device_id(), second.device_id());
        assert!(Uuid::parse_str(&first.device_id()).is_ok());
    }
}
