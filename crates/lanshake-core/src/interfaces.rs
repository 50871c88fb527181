//! Local network adapter matching.
//!
//! A peer's connection row is labelled with the local adapter that reaches it.
//! The adapter is found by comparing address prefixes: the first three octets
//! for IPv4, the first four segments for IPv6. When nothing matches, the
//! sentinel [`UNKNOWN_ADAPTER`] is used.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::UNKNOWN_ADAPTER;

/// One active local interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Interface name, e.g. `eth0`
    pub name: String,
    /// Address assigned to it
    pub address: IpAddr,
}

impl InterfaceAddress {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Source of the active local interfaces.
pub trait InterfaceEnumerator: Send + Sync + std::fmt::Debug {
    /// Currently active interface addresses.
    fn interfaces(&self) -> Vec<InterfaceAddress>;
}

/// Interfaces of the host, as reported by the OS.
#[derive(Debug, Clone, Default)]
pub struct LocalInterfaces {
    disabled_prefixes: Vec<String>,
}

impl LocalInterfaces {
    /// Enumerate host interfaces, ignoring names that start with any of `disabled_prefixes`.
    #[must_use]
    pub fn new(disabled_prefixes: Vec<String>) -> Self {
        Self { disabled_prefixes }
    }

    fn is_disabled(&self, name: &str) -> bool {
        self.disabled_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

impl InterfaceEnumerator for LocalInterfaces {
    fn interfaces(&self) -> Vec<InterfaceAddress> {
        match local_ip_address::list_afinet_netifas() {
            Ok(list) => list
                .into_iter()
                .filter(|(name, ip)| !ip.is_loopback() && !self.is_disabled(name))
                .map(|(name, ip)| InterfaceAddress::new(name, ip))
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to enumerate network interfaces");
                Vec::new()
            }
        }
    }
}

/// A fixed interface list.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<InterfaceAddress>);

impl InterfaceEnumerator for StaticInterfaces {
    fn interfaces(&self) -> Vec<InterfaceAddress> {
        self.0.clone()
    }
}

/// Network prefix used for adapter matching.
#[must_use]
pub fn address_prefix(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}:", s[0], s[1], s[2], s[3])
        }
    }
}

/// Name of the local adapter sharing `ip`'s prefix, or [`UNKNOWN_ADAPTER`].
#[must_use]
pub fn resolve_adapter(ip: IpAddr, interfaces: &[InterfaceAddress]) -> String {
    let prefix = address_prefix(ip);
    interfaces
        .iter()
        .find(|iface| address_prefix(iface.address) == prefix)
        .map_or_else(
            || {
                debug!(%ip, "no local interface matches peer prefix");
                UNKNOWN_ADAPTER.to_string()
            },
            |iface| iface.name.clone(),
        )
}
