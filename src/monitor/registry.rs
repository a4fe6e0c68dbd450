//! # Device Registry Module
//!
//! In-memory set of currently known serial devices, keyed by stable device
//! path, with USB identity metadata attached. The registry is mutated only by
//! the [`DeviceMonitor`](crate::monitor::DeviceMonitor); everything else reads
//! it through snapshots and lookups.

use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

/// Identity of one serial device node.
///
/// Equality and hashing are defined solely by `path`; the remaining fields
/// are metadata resolved from the device's USB ancestry when available.
/// Immutable once created.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    /// Stable device node path, the primary key (e.g. `/dev/ttyUSB0`).
    pub path: String,
    /// USB product name.
    pub name: Option<String>,
    /// USB vendor name.
    pub vendor_name: Option<String>,
    /// USB serial number.
    pub serial_number: Option<String>,
    /// USB vendor id.
    pub vendor_id: Option<u16>,
    /// USB product id.
    pub product_id: Option<u16>,
}

impl DeviceIdentity {
    /// Creates an identity with only the path populated.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        DeviceIdentity {
            path: path.into(),
            name: None,
            vendor_name: None,
            serial_number: None,
            vendor_id: None,
            product_id: None,
        }
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// Insertion-ordered set of known devices, unique by path.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<DeviceIdentity>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        DeviceRegistry {
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Returns true when a device with `path` is currently known.
    pub fn contains(&self, path: &str) -> bool {
        self.read().iter().any(|d| d.path == path)
    }

    /// Looks up a device by path.
    pub fn get(&self, path: &str) -> Option<DeviceIdentity> {
        self.read().iter().find(|d| d.path == path).cloned()
    }

    /// Inserts a device; returns false when the path is already present.
    pub fn insert(&self, identity: DeviceIdentity) -> bool {
        let mut devices = self.write();
        if devices.iter().any(|d| d.path == identity.path) {
            return false;
        }
        devices.push(identity);
        true
    }

    /// Removes a device by path, returning it when it was present.
    pub fn remove(&self, path: &str) -> Option<DeviceIdentity> {
        let mut devices = self.write();
        let index = devices.iter().position(|d| d.path == path)?;
        Some(devices.remove(index))
    }

    /// Discovery-ordered snapshot of all known devices.
    pub fn snapshot(&self) -> Vec<DeviceIdentity> {
        self.read().clone()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true when no devices are known.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<DeviceIdentity>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<DeviceIdentity>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}
