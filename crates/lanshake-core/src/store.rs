//! Persistence contract for devices, connections and transfer groups.
//!
//! The registry and the transfer coordinator only talk to storage through the
//! [`Store`] trait. Two implementations ship with the crate:
//!
//! - [`MemoryStore`] keeps everything in process memory (tests, throwaway nodes)
//! - [`JsonStore`] persists the tables to a versioned JSON document after every mutation
//!
//! ## Invariants
//!
//! - at most one connection row per (`device_id`, `adapter_name`)
//! - an IP address belongs to one device; binding it to another device evicts the stale row

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::{Connection, Device};
use crate::transfer::TransferGroup;

/// Current on-disk document version
const STORE_VERSION: u32 = 1;

/// Keyed access to the persisted tables.
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Look up a device by id.
    fn device(&self, device_id: &str) -> Result<Option<Device>>;

    /// All devices.
    fn devices(&self) -> Result<Vec<Device>>;

    /// Insert or replace a device.
    fn put_device(&self, device: &Device) -> Result<()>;

    /// Remove a device row. Does not cascade.
    fn remove_device(&self, device_id: &str) -> Result<bool>;

    /// Connection rows of a device.
    fn connections(&self, device_id: &str) -> Result<Vec<Connection>>;

    /// The connection currently bound to an IP address.
    fn connection_by_ip(&self, ip: IpAddr) -> Result<Option<Connection>>;

    /// Insert or replace a connection keyed by device and adapter.
    fn put_connection(&self, connection: &Connection) -> Result<()>;

    /// Remove connection rows of a device, optionally limited to one adapter
    /// and optionally keeping the row bound to `except_ip`.
    fn remove_connections(
        &self,
        device_id: &str,
        adapter: Option<&str>,
        except_ip: Option<IpAddr>,
    ) -> Result<usize>;

    /// Look up a transfer group.
    fn group(&self, group_id: u64) -> Result<Option<TransferGroup>>;

    /// All transfer groups.
    fn groups(&self) -> Result<Vec<TransferGroup>>;

    /// Transfer groups owned by a device.
    fn groups_for(&self, device_id: &str) -> Result<Vec<TransferGroup>>;

    /// Insert or replace a transfer group.
    fn put_group(&self, group: &TransferGroup) -> Result<()>;

    /// Insert a transfer group unless its id is already taken.
    /// Returns whether the group was inserted.
    fn insert_group(&self, group: &TransferGroup) -> Result<bool>;

    /// Remove a transfer group.
    fn remove_group(&self, group_id: u64) -> Result<bool>;
}

/// The tables shared by both implementations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    devices: BTreeMap<String, Device>,
    #[serde(default)]
    connections: Vec<Connection>,
    #[serde(default)]
    groups: BTreeMap<u64, TransferGroup>,
}

impl Tables {
    fn put_connection(&mut self, connection: &Connection) {
        self.connections.retain(|c| {
            let same_slot =
                c.device_id == connection.device_id && c.adapter_name == connection.adapter_name;
            let stolen_ip =
                c.device_id != connection.device_id && c.ip_address == connection.ip_address;
            !(same_slot || stolen_ip)
        });
        self.connections.push(connection.clone());
    }

    fn remove_connections(
        &mut self,
        device_id: &str,
        adapter: Option<&str>,
        except_ip: Option<IpAddr>,
    ) -> usize {
        let before = self.connections.len();
        self.connections.retain(|c| {
            let matches = c.device_id == device_id
                && adapter.is_none_or(|a| c.adapter_name == a)
                && except_ip != Some(c.ip_address);
            !matches
        });
        before - self.connections.len()
    }

    fn connections(&self, device_id: &str) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect()
    }

    fn connection_by_ip(&self, ip: IpAddr) -> Option<Connection> {
        self.connections.iter().find(|c| c.ip_address == ip).cloned()
    }

    fn groups_for(&self, device_id: &str) -> Vec<TransferGroup> {
        self.groups
            .values()
            .filter(|g| g.device_id == device_id)
            .cloned()
            .collect()
    }

    fn insert_group(&mut self, group: &TransferGroup) -> bool {
        match self.groups.entry(group.group_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
                true
            }
        }
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.read()?.devices.get(device_id).cloned())
    }

    fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.read()?.devices.values().cloned().collect())
    }

    fn put_device(&self, device: &Device) -> Result<()> {
        self.write()?
            .devices
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    fn remove_device(&self, device_id: &str) -> Result<bool> {
        Ok(self.write()?.devices.remove(device_id).is_some())
    }

    fn connections(&self, device_id: &str) -> Result<Vec<Connection>> {
        Ok(self.read()?.connections(device_id))
    }

    fn connection_by_ip(&self, ip: IpAddr) -> Result<Option<Connection>> {
        Ok(self.read()?.connection_by_ip(ip))
    }

    fn put_connection(&self, connection: &Connection) -> Result<()> {
        self.write()?.put_connection(connection);
        Ok(())
    }

    fn remove_connections(
        &self,
        device_id: &str,
        adapter: Option<&str>,
        except_ip: Option<IpAddr>,
    ) -> Result<usize> {
        Ok(self.write()?.remove_connections(device_id, adapter, except_ip))
    }

    fn group(&self, group_id: u64) -> Result<Option<TransferGroup>> {
        Ok(self.read()?.groups.get(&group_id).cloned())
    }

    fn groups(&self) -> Result<Vec<TransferGroup>> {
        Ok(self.read()?.groups.values().cloned().collect())
    }

    fn groups_for(&self, device_id: &str) -> Result<Vec<TransferGroup>> {
        Ok(self.read()?.groups_for(device_id))
    }

    fn put_group(&self, group: &TransferGroup) -> Result<()> {
        self.write()?.groups.insert(group.group_id, group.clone());
        Ok(())
    }

    fn insert_group(&self, group: &TransferGroup) -> Result<bool> {
        Ok(self.write()?.insert_group(group))
    }

    fn remove_group(&self, group_id: u64) -> Result<bool> {
        Ok(self.write()?.groups.remove(&group_id).is_some())
    }
}

/// On-disk document.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    /// Version of the document format
    version: u32,
    #[serde(flatten)]
    tables: Tables,
}

/// Store persisted to a JSON file.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonStore {
    /// Open the store at the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read.
    pub fn open_default() -> Result<Self> {
        let path = Self::default_path().unwrap_or_else(|| PathBuf::from("registry.json"));
        Self::open(path)
    }

    /// Open the store at `path`; a missing file yields empty tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                tables: Mutex::new(Tables::default()),
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::Storage(format!("Failed to open store at {}: {}", path.display(), e))
        })?;
        let doc: StoreDocument = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::Storage(format!("Failed to parse store at {}: {}", path.display(), e))
        })?;

        if doc.version > STORE_VERSION {
            return Err(Error::Storage(format!(
                "store at {} has unsupported version {}",
                path.display(),
                doc.version
            )));
        }

        Ok(Self {
            path,
            tables: Mutex::new(doc.tables),
        })
    }

    /// Default store path inside the platform data directory.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "lanshake", "Lanshake")
            .map(|dirs| dirs.data_dir().join("registry.json"))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Storage("json store lock poisoned".to_string()))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self.lock()?;
        let out = f(&mut tables);
        self.save(&tables)?;
        Ok(out)
    }

    fn save(&self, tables: &Tables) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let doc = StoreDocument {
            version: STORE_VERSION,
            tables: tables.clone(),
        };
        let file = fs::File::create(&self.path).map_err(|e| {
            Error::Storage(format!(
                "Failed to create store at {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &doc).map_err(|e| {
            Error::Storage(format!(
                "Failed to write store at {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl Store for JsonStore {
    fn device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.lock()?.devices.get(device_id).cloned())
    }

    fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.lock()?.devices.values().cloned().collect())
    }

    fn put_device(&self, device: &Device) -> Result<()> {
        self.mutate(|t| {
            t.devices.insert(device.device_id.clone(), device.clone());
        })
    }

    fn remove_device(&self, device_id: &str) -> Result<bool> {
        self.mutate(|t| t.devices.remove(device_id).is_some())
    }

    fn connections(&self, device_id: &str) -> Result<Vec<Connection>> {
        Ok(self.lock()?.connections(device_id))
    }

    fn connection_by_ip(&self, ip: IpAddr) -> Result<Option<Connection>> {
        Ok(self.lock()?.connection_by_ip(ip))
    }

    fn put_connection(&self, connection: &Connection) -> Result<()> {
        self.mutate(|t| t.put_connection(connection))
    }

    fn remove_connections(
        &self,
        device_id: &str,
        adapter: Option<&str>,
        except_ip: Option<IpAddr>,
    ) -> Result<usize> {
        self.mutate(|t| t.remove_connections(device_id, adapter, except_ip))
    }

    fn group(&self, group_id: u64) -> Result<Option<TransferGroup>> {
        Ok(self.lock()?.groups.get(&group_id).cloned())
    }

    fn groups(&self) -> Result<Vec<TransferGroup>> {
        Ok(self.lock()?.groups.values().cloned().collect())
    }

    fn groups_for(&self, device_id: &str) -> Result<Vec<TransferGroup>> {
        Ok(self.lock()?.groups_for(device_id))
    }

    fn put_group(&self, group: &TransferGroup) -> Result<()> {
        self.mutate(|t| {
            t.groups.insert(group.group_id, group.clone());
        })
    }

    fn insert_group(&self, group: &TransferGroup) -> Result<bool> {
        let mut tables = self.lock()?;
        if !tables.insert_group(group) {
            return Ok(false);
        }
        self.save(&tables)?;
        Ok(true)
    }

    fn remove_group(&self, group_id: u64) -> Result<bool> {
        self.mutate(|t| t.groups.remove(&group_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(id: &str) -> Device {
        Device::new(id, "brand", "model", "nick")
    }

    fn connection(device_id: &str, adapter: &str, ip: &str) -> Connection {
        Connection {
            device_id: device_id.to_string(),
            adapter_name: adapter.to_string(),
            ip_address: ip.parse().unwrap(),
            last_checked_date: 1,
        }
    }

    #[test]
    fn test_connection_replaced_per_adapter() {
        let store = MemoryStore::new();
        store
            .put_connection(&connection("a", "eth0", "192.168.1.10"))
            .unwrap();
        store
            .put_connection(&connection("a", "eth0", "192.168.1.11"))
            .unwrap();
        store
            .put_connection(&connection("a", "wlan0", "10.0.0.3"))
            .unwrap();

        let rows = store.connections("a").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|c| c.adapter_name == "eth0" && c.ip_address.to_string() == "192.168.1.11"));
    }

    #[test]
    fn test_ip_moves_between_devices() {
        let store = MemoryStore::new();
        store
            .put_connection(&connection("a", "eth0", "192.168.1.10"))
            .unwrap();
        store
            .put_connection(&connection("b", "eth0", "192.168.1.10"))
            .unwrap();

        assert!(store.connections("a").unwrap().is_empty());
        let owner = store
            .connection_by_ip("192.168.1.10".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(owner.device_id, "b");
    }

    #[test]
    fn test_remove_connections_except_ip() {
        let store = MemoryStore::new();
        store
            .put_connection(&connection("a", "eth0", "192.168.1.10"))
            .unwrap();
        store
            .put_connection(&connection("a", "wlan0", "10.0.0.3"))
            .unwrap();

        let removed = store
            .remove_connections("a", None, Some("10.0.0.3".parse().unwrap()))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.connections("a").unwrap()[0].adapter_name, "wlan0");
    }

    #[test]
    fn test_insert_group_keeps_first() {
        let store = MemoryStore::new();
        let first = TransferGroup::incoming(9, "a", Vec::new());
        let second = TransferGroup::incoming(9, "b", Vec::new());

        assert!(store.insert_group(&first).unwrap());
        assert!(!store.insert_group(&second).unwrap());
        assert_eq!(store.group(9).unwrap().unwrap().device_id, "a");
    }

    #[test]
    fn test_json_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("registry.json");

        {
            let store = JsonStore::open(&path).unwrap();
            store.put_device(&device("a")).unwrap();
            store
                .put_connection(&connection("a", "eth0", "192.168.1.10"))
                .unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"version\": 1"));

        let reopened = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.devices().unwrap().len(), 1);
        assert_eq!(reopened.connections("a").unwrap().len(), 1);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(JsonStore::open(&path), Err(Error::Storage(_))));
    }
}
