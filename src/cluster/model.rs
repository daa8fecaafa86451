//! Per-pass machine and device model
//!
//! Everything here is rebuilt from scratch on every pass and never
//! persisted. A `DeviceList` is computed once per fabric and then attached
//! to each machine on that fabric through `deep_copy`, so per-machine
//! overlays (quota bounds) can never leak into another machine's list.

use std::collections::BTreeMap;

use crate::client::DeviceBounds;
use crate::config::DeviceInfo;

/// Fabric identifier as reported by the fabric inventory
pub type FabricId = i64;

/// State of one device model on one machine
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub k8s_device_name: String,
    pub driver_name: String,
    pub attributes: BTreeMap<String, String>,
    pub available: u32,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub binding_timeout: Option<i64>,
}

impl Device {
    pub fn from_catalog(info: &DeviceInfo, available: u32, binding_timeout: Option<i64>) -> Self {
        Self {
            k8s_device_name: info.k8s_device_name.clone(),
            driver_name: info.driver_name.clone(),
            attributes: info.dra_attributes.clone(),
            available,
            min: None,
            max: None,
            binding_timeout,
        }
    }

    /// Overlay quota bounds; an unset bound keeps the current value
    pub fn apply_bounds(&mut self, bounds: DeviceBounds) {
        if bounds.min.is_some() {
            self.min = bounds.min;
        }
        if bounds.max.is_some() {
            self.max = bounds.max;
        }
    }
}

/// Device model name -> device state, for one machine
///
/// Deliberately not `Clone`: attaching a fabric-scoped list to a machine
/// goes through `deep_copy`.
#[derive(Debug, Default, PartialEq)]
pub struct DeviceList {
    devices: BTreeMap<String, Device>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, device: Device) {
        self.devices.insert(model.into(), device);
    }

    pub fn get(&self, model: &str) -> Option<&Device> {
        self.devices.get(model)
    }

    pub fn get_mut(&mut self, model: &str) -> Option<&mut Device> {
        self.devices.get_mut(model)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Device)> {
        self.devices.iter()
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Independent copy sharing no state with `self`
    pub fn deep_copy(&self) -> Self {
        Self {
            devices: self
                .devices
                .iter()
                .map(|(model, device)| (model.clone(), device.clone()))
                .collect(),
        }
    }

    /// Overlay per-model bounds; models without an entry are untouched
    pub fn apply_bounds(&mut self, bounds: &BTreeMap<String, DeviceBounds>) {
        for (model, bound) in bounds {
            if let Some(device) = self.devices.get_mut(model) {
                device.apply_bounds(*bound);
            }
        }
    }
}

/// A cluster node backed by a composable machine, with its devices
#[derive(Debug, PartialEq)]
pub struct Machine {
    pub node_name: String,
    pub machine_uuid: String,
    pub fabric_id: FabricId,
    pub node_group: Option<String>,
    pub devices: DeviceList,
}

impl Machine {
    pub fn new(
        node_name: impl Into<String>,
        machine_uuid: impl Into<String>,
        fabric_id: FabricId,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            machine_uuid: machine_uuid.into(),
            fabric_id,
            node_group: None,
            devices: DeviceList::new(),
        }
    }

    pub fn with_node_group(mut self, node_group: Option<String>) -> Self {
        self.node_group = node_group;
        self
    }
}
