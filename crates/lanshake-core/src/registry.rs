//! Device and connection bookkeeping.
//!
//! The [`DeviceRegistry`] owns every `Device` and `Connection` row. All
//! read-modify-write sequences for one device id run under a per-device lock,
//! so two handshakes from the same peer never produce two rows and the later
//! observation always wins.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::truncate_nickname;
use crate::protocol::HandshakePayload;
use crate::store::Store;

/// A peer, or this device when `is_local_address` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Primary key
    pub device_id: String,
    /// Manufacturer or OS family
    pub brand: String,
    /// Hardware model
    pub model: String,
    /// User-visible name, capped in length
    pub nickname: String,
    /// Application version name
    pub version_name: String,
    /// Application version number
    pub version_number: i64,
    /// Last successful handshake, milliseconds since the Unix epoch
    pub last_usage_time: i64,
    /// Trusted by the user
    pub is_trusted: bool,
    /// Blocked from transferring
    pub is_restricted: bool,
    /// The local device's own row
    pub is_local_address: bool,
}

impl Device {
    /// A fresh, untrusted device.
    pub fn new(
        device_id: impl Into<String>,
        brand: impl Into<String>,
        model: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            brand: brand.into(),
            model: model.into(),
            nickname: nickname.into(),
            version_name: String::new(),
            version_number: 0,
            last_usage_time: 0,
            is_trusted: false,
            is_restricted: false,
            is_local_address: false,
        }
    }

    /// Overwrite the description fields from a received identity block.
    /// Trust flags are left alone.
    fn merge_identity(&mut self, identity: &HandshakePayload, nickname_max: usize) {
        self.brand.clone_from(&identity.device.brand);
        self.model.clone_from(&identity.device.model);
        self.nickname = truncate_nickname(&identity.device.nickname, nickname_max);
        self.version_name.clone_from(&identity.app.version_name);
        self.version_number = identity.app.version_code;
    }
}

/// A network path to a device through one local adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Owning device
    pub device_id: String,
    /// Local adapter label, or `unk0`
    pub adapter_name: String,
    /// Peer address
    pub ip_address: IpAddr,
    /// Last time this path was verified, milliseconds since the Unix epoch
    pub last_checked_date: i64,
}

/// A reconciled device and the path it was reached on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The merged device row
    pub device: Device,
    /// The refreshed connection row
    pub connection: Connection,
}

/// Owner of device and connection rows.
#[derive(Debug)]
pub struct DeviceRegistry {
    store: Arc<dyn Store>,
    local: Device,
    nickname_max: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceRegistry {
    /// Create the registry and record `local` as the single local device.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn new(store: Arc<dyn Store>, mut local: Device, nickname_max: usize) -> Result<Self> {
        local.is_local_address = true;

        for mut other in store.devices()? {
            if other.is_local_address && other.device_id != local.device_id {
                warn!(device_id = %other.device_id, "clearing stale local device flag");
                other.is_local_address = false;
                store.put_device(&other)?;
            }
        }
        store.put_device(&local)?;

        Ok(Self {
            store,
            local,
            nickname_max,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The local device.
    #[must_use]
    pub fn local_device(&self) -> &Device {
        &self.local
    }

    /// Whether `device_id` is this device.
    #[must_use]
    pub fn is_local(&self, device_id: &str) -> bool {
        self.local.device_id == device_id
    }

    fn device_lock(&self, device_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Internal("registry lock table poisoned".to_string()))?;
        Ok(locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn with_device_lock<T>(&self, device_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.device_lock(device_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::Internal(format!("device lock for {device_id} poisoned")))?;
        f()
    }

    /// Insert or replace a device. Only the local device id may carry the local flag.
    pub fn upsert_device(&self, mut device: Device) -> Result<Device> {
        device.is_local_address = self.is_local(&device.device_id);
        device.nickname = truncate_nickname(&device.nickname, self.nickname_max);
        self.with_device_lock(&device.device_id.clone(), || {
            self.store.put_device(&device)?;
            Ok(device)
        })
    }

    /// Insert or replace a connection, purging other rows of the same
    /// device and adapter.
    pub fn upsert_connection(&self, connection: Connection) -> Result<Connection> {
        self.with_device_lock(&connection.device_id.clone(), || {
            self.write_connection(&connection)?;
            Ok(connection)
        })
    }

    fn write_connection(&self, connection: &Connection) -> Result<()> {
        let purged = self.store.remove_connections(
            &connection.device_id,
            Some(&connection.adapter_name),
            Some(connection.ip_address),
        )?;
        if purged > 0 {
            debug!(
                device_id = %connection.device_id,
                adapter = %connection.adapter_name,
                purged,
                "purged stale connection rows"
            );
        }
        self.store.put_connection(connection)
    }

    /// Look up a device.
    pub fn find(&self, device_id: &str) -> Result<Option<Device>> {
        self.store.device(device_id)
    }

    /// Look up a device, failing with `NotFound`.
    pub fn get(&self, device_id: &str) -> Result<Device> {
        self.find(device_id)?
            .ok_or_else(|| Error::NotFound(device_id.to_string()))
    }

    /// Connections of a device, most recently checked first.
    pub fn connections_for(&self, device_id: &str) -> Result<Vec<Connection>> {
        let mut rows = self.store.connections(device_id)?;
        rows.sort_by(|a, b| b.last_checked_date.cmp(&a.last_checked_date));
        Ok(rows)
    }

    /// All devices, most recently used first.
    pub fn devices(&self) -> Result<Vec<Device>> {
        let mut rows = self.store.devices()?;
        rows.sort_by(|a, b| b.last_usage_time.cmp(&a.last_usage_time));
        Ok(rows)
    }

    /// Delete a device with its connections and transfer groups.
    ///
    /// The local device cannot be deleted.
    pub fn delete(&self, device_id: &str) -> Result<bool> {
        if self.is_local(device_id) {
            return Err(Error::InvalidInput(
                "the local device cannot be removed".to_string(),
            ));
        }

        let removed = self.with_device_lock(device_id, || {
            let connections = self.store.remove_connections(device_id, None, None)?;
            let mut groups = 0usize;
            for group in self.store.groups_for(device_id)? {
                if self.store.remove_group(group.group_id)? {
                    groups += 1;
                }
            }
            let removed = self.store.remove_device(device_id)?;
            if removed {
                info!(%device_id, connections, groups, "removed device");
            }
            Ok(removed)
        })?;

        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(device_id);
        }
        Ok(removed)
    }

    fn update(&self, device_id: &str, f: impl FnOnce(&mut Device)) -> Result<Device> {
        self.with_device_lock(device_id, || {
            let mut device = self
                .store
                .device(device_id)?
                .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
            f(&mut device);
            self.store.put_device(&device)?;
            Ok(device)
        })
    }

    /// Mark a device trusted or untrusted.
    pub fn set_trusted(&self, device_id: &str, trusted: bool) -> Result<Device> {
        self.update(device_id, |d| d.is_trusted = trusted)
    }

    /// Block or unblock a device.
    pub fn set_restricted(&self, device_id: &str, restricted: bool) -> Result<Device> {
        self.update(device_id, |d| d.is_restricted = restricted)
    }

    /// Change a device's nickname.
    pub fn rename(&self, device_id: &str, nickname: &str) -> Result<Device> {
        let nickname = truncate_nickname(nickname, self.nickname_max);
        self.update(device_id, |d| d.nickname = nickname)
    }

    /// Reconcile an observed peer.
    ///
    /// Returns `None` when the identity is this device's own. An observation
    /// older than what is already stored does not overwrite newer data.
    pub fn register_remote(
        &self,
        identity: &HandshakePayload,
        ip: IpAddr,
        adapter_name: String,
        observed_at: i64,
    ) -> Result<Option<Registration>> {
        let device_id = identity.device.device_id.as_str();
        if self.is_local(device_id) {
            debug!(%ip, "handshake answered by the local device, ignoring");
            return Ok(None);
        }

        self.with_device_lock(device_id, || {
            let existing = match self.store.device(device_id) {
                Ok(found) => found,
                Err(e) => {
                    debug!(%device_id, error = %e, "device lookup failed, treating as new");
                    None
                }
            };

            let mut device = existing.clone().unwrap_or_else(|| {
                Device::new(device_id, "", "", "")
            });
            let stale = existing
                .as_ref()
                .is_some_and(|prev| prev.last_usage_time > observed_at);

            let connection = Connection {
                device_id: device_id.to_string(),
                adapter_name,
                ip_address: ip,
                last_checked_date: observed_at,
            };
            let newer_path = self
                .store
                .connections(device_id)?
                .into_iter()
                .find(|c| {
                    c.adapter_name == connection.adapter_name
                        && c.last_checked_date > observed_at
                });
            let connection = match newer_path {
                Some(current) => current,
                None => {
                    self.write_connection(&connection)?;
                    connection
                }
            };

            if stale {
                debug!(%device_id, observed_at, "older observation, keeping stored device");
            } else {
                device.merge_identity(identity, self.nickname_max);
                device.last_usage_time = observed_at;
                device.is_local_address = false;
                self.store.put_device(&device)?;
            }

            info!(
                %device_id,
                nickname = %device.nickname,
                adapter = %connection.adapter_name,
                ip = %connection.ip_address,
                new = existing.is_none(),
                "registered device"
            );
            Ok(Some(Registration { device, connection }))
        })
    }
}
