//! Device pools and their generations
//!
//! One pool exists per driver and fabric combination, named
//! `<k8s-device-name>-fabric<id>`. A pool is created at generation 1 the
//! first time its fabric is observed and regenerated with generation + 1
//! whenever the number of available devices changes. `PoolState` is the
//! only state the engine carries from one pass to the next.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::labels::{device_label_key, fabric_label_key};
use super::model::{Device, FabricId};
use crate::context::RequestContext;
use crate::kube::KubeError;

/// Attribute marking every published device as a GPU
pub const DEVICE_TYPE_ATTRIBUTE: &str = "type";
pub const DEVICE_TYPE: &str = "gpu";

/// Conditions the scheduler waits for before binding a device
pub const BINDING_CONDITIONS: &[&str] = &["FabricDeviceReady"];

/// Conditions that make the scheduler give up on a binding
pub const BINDING_FAILURE_CONDITIONS: &[&str] = &["FabricDeviceReschedule", "FabricDeviceFailed"];

pub const INITIAL_GENERATION: i64 = 1;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to publish pools of driver {driver}: {source}")]
    Kube {
        driver: String,
        #[source]
        source: KubeError,
    },

    #[error("Failed to publish pools of driver {driver}: {reason}")]
    Rejected { driver: String, reason: String },
}

/// Node selector term: `key` In `values`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorRequirement {
    pub key: String,
    pub values: Vec<String>,
}

/// One advertised device entry
#[derive(Debug, Clone, PartialEq)]
pub struct PoolDevice {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub binds_to_node: bool,
    pub binding_conditions: Vec<String>,
    pub binding_failure_conditions: Vec<String>,
    pub binding_timeout_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    pub name: String,
    pub generation: i64,
    /// All requirements must hold
    pub node_selector: Vec<SelectorRequirement>,
    pub devices: Vec<PoolDevice>,
}

impl Pool {
    /// A pool with one entry per available device
    pub fn generate(device: &Device, fabric: FabricId, label_prefix: &str, generation: i64) -> Self {
        let devices = (0..device.available)
            .map(|i| {
                let mut attributes = BTreeMap::from([(
                    DEVICE_TYPE_ATTRIBUTE.to_string(),
                    DEVICE_TYPE.to_string(),
                )]);
                attributes.extend(device.attributes.clone());

                PoolDevice {
                    name: format!("{}-gpu{}", device.k8s_device_name, i),
                    attributes,
                    binds_to_node: true,
                    binding_conditions: BINDING_CONDITIONS.iter().map(|c| c.to_string()).collect(),
                    binding_failure_conditions: BINDING_FAILURE_CONDITIONS
                        .iter()
                        .map(|c| c.to_string())
                        .collect(),
                    binding_timeout_seconds: device.binding_timeout,
                }
            })
            .collect();

        Self {
            name: pool_name(&device.k8s_device_name, fabric),
            generation,
            node_selector: vec![
                SelectorRequirement {
                    key: device_label_key(label_prefix, &device.k8s_device_name),
                    values: vec!["true".to_string()],
                },
                SelectorRequirement {
                    key: fabric_label_key(label_prefix),
                    values: vec![fabric.to_string()],
                },
            ],
            devices,
        }
    }
}

pub fn pool_name(k8s_device_name: &str, fabric: FabricId) -> String {
    format!("{}-fabric{}", k8s_device_name, fabric)
}

/// Outcome of comparing one observed device against its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolChange {
    Created,
    Regenerated { generation: i64 },
    Unchanged,
}

/// Published pools of every tracked driver
#[derive(Debug, Default)]
pub struct PoolState {
    drivers: BTreeMap<String, BTreeMap<String, Pool>>,
    dirty: BTreeSet<String>,
}

impl PoolState {
    /// Track the given drivers; devices of other drivers are ignored
    pub fn new(drivers: impl IntoIterator<Item = String>) -> Self {
        Self {
            drivers: drivers.into_iter().map(|d| (d, BTreeMap::new())).collect(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn is_tracked(&self, driver: &str) -> bool {
        self.drivers.contains_key(driver)
    }

    /// Bring the pool of `device` on `fabric` up to date
    ///
    /// Only a change in the number of devices regenerates the pool; a
    /// regenerated or created pool marks its driver dirty.
    pub fn update(&mut self, device: &Device, fabric: FabricId, label_prefix: &str) -> PoolChange {
        let Some(pools) = self.drivers.get_mut(&device.driver_name) else {
            return PoolChange::Unchanged;
        };

        let name = pool_name(&device.k8s_device_name, fabric);
        let change = match pools.get(&name) {
            None => {
                pools.insert(
                    name,
                    Pool::generate(device, fabric, label_prefix, INITIAL_GENERATION),
                );
                PoolChange::Created
            }
            Some(pool) if pool.devices.len() != device.available as usize => {
                let generation = pool.generation + 1;
                pools.insert(name, Pool::generate(device, fabric, label_prefix, generation));
                PoolChange::Regenerated { generation }
            }
            Some(_) => PoolChange::Unchanged,
        };

        if change != PoolChange::Unchanged {
            self.dirty.insert(device.driver_name.clone());
        }
        change
    }

    pub fn pools(&self, driver: &str) -> Option<&BTreeMap<String, Pool>> {
        self.drivers.get(driver)
    }

    pub fn pool(&self, driver: &str, name: &str) -> Option<&Pool> {
        self.drivers.get(driver).and_then(|pools| pools.get(name))
    }

    /// Drivers whose pools have not been published since they last changed
    pub fn dirty_drivers(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    pub fn mark_published(&mut self, driver: &str) {
        self.dirty.remove(driver);
    }

    pub fn log_pools(&self, driver: &str) {
        if let Some(pools) = self.drivers.get(driver) {
            for pool in pools.values() {
                info!(
                    "Pool update: pool={}, generation={}, driver={}",
                    pool.name, pool.generation, driver
                );
            }
        }
    }
}

/// Durable publication of a driver's complete pool set
///
/// Must be idempotent: the same set may be handed over again.
#[async_trait]
pub trait PoolPublisher: Send + Sync {
    async fn publish(
        &self,
        ctx: &RequestContext,
        driver: &str,
        pools: &BTreeMap<String, Pool>,
    ) -> Result<(), PublishError>;
}
