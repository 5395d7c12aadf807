// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide registry of crypto devices, keyed by minor number.

use crate::CryptoDevice;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// A minor number is already taken.
#[derive(Debug, Error)]
#[error("crypto device with minor {minor} is already registered")]
pub struct DuplicateMinor {
    /// The conflicting minor number.
    pub minor: u32,
}

/// Lock-protected set of registered devices.
///
/// Devices are shared by reference with every file derived from them;
/// unregistering removes the registry's reference but leaves open files
/// working until they are released.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<CryptoDevice>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Adds a device. Fails if its minor number is already registered.
    pub fn register(&self, device: Arc<CryptoDevice>) -> Result<(), DuplicateMinor> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.minor() == device.minor()) {
            return Err(DuplicateMinor {
                minor: device.minor(),
            });
        }
        tracing::debug!(minor = device.minor(), "registered crypto device");
        devices.push(device);
        Ok(())
    }

    /// Removes and returns the device with the given minor number.
    pub fn unregister(&self, minor: u32) -> Option<Arc<CryptoDevice>> {
        let mut devices = self.devices.lock();
        let index = devices.iter().position(|d| d.minor() == minor)?;
        tracing::debug!(minor, "unregistered crypto device");
        Some(devices.swap_remove(index))
    }

    /// Finds the device that owns the given minor number.
    pub fn lookup(&self, minor: u32) -> Option<Arc<CryptoDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.minor() == minor)
            .cloned()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }
}
