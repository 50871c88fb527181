//! Optional access point capability.
//!
//! Hotspot control is platform territory; the core only describes what it
//! would ask for. A node without a [`HotspotControl`] simply does not offer
//! the feature.

use crate::error::Result;

/// Prefix of hotspot names created for this application
pub const HOTSPOT_NAME_PREFIX: &str = "LS_";

/// Shortest passphrase accepted for a secured network
pub const MIN_PASSPHRASE_LENGTH: usize = 8;

/// Security of a hotspot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotspotSecurity {
    /// No passphrase
    Open,
    /// WPA2-PSK with the given passphrase
    Wpa2(String),
}

/// Access point settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotConfiguration {
    /// Network name
    pub ssid: String,
    /// Security mode
    pub security: HotspotSecurity,
}

impl HotspotConfiguration {
    /// Build a configuration; passphrases shorter than
    /// [`MIN_PASSPHRASE_LENGTH`] produce an open network.
    #[must_use]
    pub fn new(ssid: impl Into<String>, passphrase: Option<&str>) -> Self {
        let security = match passphrase {
            Some(p) if p.chars().count() >= MIN_PASSPHRASE_LENGTH => {
                HotspotSecurity::Wpa2(p.to_string())
            }
            _ => HotspotSecurity::Open,
        };
        Self {
            ssid: ssid.into(),
            security,
        }
    }

    /// Whether the network is unsecured.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.security == HotspotSecurity::Open
    }
}

/// Hotspot name for a nickname: prefix plus the nickname with spaces replaced by `_`.
#[must_use]
pub fn hotspot_name(nickname: &str) -> String {
    format!("{HOTSPOT_NAME_PREFIX}{}", nickname.replace(' ', "_"))
}

/// Platform access point control.
pub trait HotspotControl: Send + Sync {
    /// Whether the access point is currently up.
    fn is_enabled(&self) -> bool;

    /// Start the access point with its last configuration.
    fn enable(&self) -> Result<()>;

    /// Start the access point with a fresh configuration.
    fn enable_configured(&self, name: &str, passphrase: Option<&str>) -> Result<()> {
        self.apply(&HotspotConfiguration::new(name, passphrase))?;
        self.enable()
    }

    /// Store a configuration without starting the access point.
    fn apply(&self, configuration: &HotspotConfiguration) -> Result<()>;

    /// Stop the access point.
    fn disable(&self) -> Result<()>;

    /// Current configuration, if one exists.
    fn configuration(&self) -> Option<HotspotConfiguration>;
}
