// Device registry
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use log::info;

use crate::{
    context::Context,
    device::{Device, DeviceConfig},
    dma::DmaMemory,
    hw::V2dHardware,
    Error, Result,
};

pub const MAX_DEVICES: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Number of minors available to attached devices.
    pub max_devices: u32,
    pub device: DeviceConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_devices: MAX_DEVICES,
            device: DeviceConfig::default(),
        }
    }
}

/// Attached devices, keyed by minor number.
pub struct V2dDriver {
    config: DriverConfig,
    devices: RwLock<BTreeMap<u32, Arc<Device>>>,
}

impl V2dDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> DriverConfig {
        self.config
    }

    /// Registers a unit under the lowest free minor and brings it up.
    pub fn attach(&self, hw: Arc<dyn V2dHardware>, dma: DmaMemory) -> Result<u32> {
        let mut devices = self.devices.write().unwrap();
        let minor = (0..self.config.max_devices)
            .find(|minor| !devices.contains_key(minor))
            .ok_or(Error::TooManyDevices(self.config.max_devices))?;

        let device = Device::new(minor, hw, dma, self.config.device)?;
        devices.insert(minor, Arc::new(device));

        info!("registered v2d{minor}");
        Ok(minor)
    }

    /// Removes a unit. Contexts still open on it fail with
    /// [`Error::NoDevice`] from then on.
    pub fn detach(&self, minor: u32) -> Result<()> {
        let device = self
            .devices
            .write()
            .unwrap()
            .remove(&minor)
            .ok_or(Error::UnknownDevice(minor))?;

        device.detach();
        Ok(())
    }

    pub fn device(&self, minor: u32) -> Result<Arc<Device>> {
        self.devices
            .read()
            .unwrap()
            .get(&minor)
            .cloned()
            .ok_or(Error::UnknownDevice(minor))
    }

    pub fn minors(&self) -> Vec<u32> {
        self.devices.read().unwrap().keys().copied().collect()
    }

    /// Opens a new client session on a device.
    pub fn open(&self, minor: u32) -> Result<Context> {
        Ok(Context::new(self.device(minor)?))
    }
}

impl Drop for V2dDriver {
    fn drop(&mut self) {
        let devices = std::mem::take(&mut *self.devices.write().unwrap());
        for device in devices.into_values() {
            device.detach();
        }
    }
}
