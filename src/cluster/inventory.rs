//! Fabric membership, device inventory and quota lookups
//!
//! `DeviceInventory` and `QuotaResolver` hold per-pass memo tables keyed by
//! fabric ID and node-group UUID. They are created at the start of a pass
//! and dropped at its end; nothing is cached across passes.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::model::{Device, DeviceList, FabricId};
use crate::client::{ClientError, ClusterPolicy, DeviceBounds, FabricInventory, NodeGroupInfo};
use crate::config::DeviceInfo;
use crate::context::PassContext;

// ============================================================================
// Fabric membership
// ============================================================================

/// Snapshot of the fabric inventory's machine list
#[derive(Debug, Default)]
pub struct FabricMembership {
    fabrics: HashMap<String, Option<FabricId>>,
}

impl FabricMembership {
    /// One inventory call for the whole pass
    pub async fn fetch(
        ctx: &PassContext,
        inventory: &dyn FabricInventory,
    ) -> Result<Self, ClientError> {
        let machines = inventory.list_machines(&ctx.request()).await?;
        let mut fabrics = HashMap::with_capacity(machines.len());
        for machine in machines {
            debug!(
                "Fabric inventory machine {}, fabric={:?}",
                machine.machine_uuid, machine.fabric_id
            );
            // first entry wins on duplicates
            fabrics
                .entry(machine.machine_uuid)
                .or_insert(machine.fabric_id);
        }
        Ok(Self { fabrics })
    }

    pub fn fabric_of(&self, machine_uuid: &str) -> Option<FabricId> {
        self.fabrics.get(machine_uuid).copied().flatten()
    }
}

// ============================================================================
// Node groups
// ============================================================================

/// Node groups with their members, fetched once per pass
#[derive(Debug, Default)]
pub struct NodeGroupIndex {
    groups: Vec<NodeGroupInfo>,
}

impl NodeGroupIndex {
    /// One call for the group list plus one per group
    pub async fn fetch(ctx: &PassContext, policy: &dyn ClusterPolicy) -> Result<Self, ClientError> {
        let list = policy.list_node_groups(&ctx.request()).await?;
        let mut groups = Vec::with_capacity(list.len());
        for group in &list {
            ctx.check()?;
            debug!("Node group {} ({})", group.name, group.uuid);
            groups.push(policy.node_group_members(&ctx.request(), group).await?);
        }
        Ok(Self { groups })
    }

    pub fn from_groups(groups: Vec<NodeGroupInfo>) -> Self {
        Self { groups }
    }

    /// UUID of the group listing `machine_uuid`; with several, the last one listed
    pub fn group_of(&self, machine_uuid: &str) -> Option<&str> {
        self.groups
            .iter()
            .rev()
            .find(|g| g.machine_ids.iter().any(|id| id == machine_uuid))
            .map(|g| g.uuid.as_str())
    }
}

// ============================================================================
// Device inventory
// ============================================================================

/// Available device counts, queried once per fabric
pub struct DeviceInventory<'a> {
    inventory: &'a dyn FabricInventory,
    catalog: &'a [DeviceInfo],
    binding_timeout: Option<i64>,
    by_fabric: BTreeMap<FabricId, DeviceList>,
}

impl<'a> DeviceInventory<'a> {
    pub fn new(
        inventory: &'a dyn FabricInventory,
        catalog: &'a [DeviceInfo],
        binding_timeout: Option<i64>,
    ) -> Self {
        Self {
            inventory,
            catalog,
            binding_timeout,
            by_fabric: BTreeMap::new(),
        }
    }

    /// A private copy of the device list of `fabric`
    ///
    /// The first machine seen on a fabric triggers one query per catalog
    /// model; later machines on the same fabric get a copy of that result.
    pub async fn devices_for(
        &mut self,
        ctx: &PassContext,
        machine_uuid: &str,
        fabric: FabricId,
    ) -> Result<DeviceList, ClientError> {
        if let Some(list) = self.by_fabric.get(&fabric) {
            return Ok(list.deep_copy());
        }

        let mut list = DeviceList::new();
        for info in self.catalog {
            ctx.check()?;
            let available = self
                .inventory
                .available_count(&ctx.request(), machine_uuid, &info.cdi_model_name)
                .await?;
            debug!(
                "Fabric {} has {} free {} devices",
                fabric, available, info.cdi_model_name
            );
            list.insert(
                info.cdi_model_name.clone(),
                Device::from_catalog(info, available, self.binding_timeout),
            );
        }

        let copy = list.deep_copy();
        self.by_fabric.insert(fabric, list);
        Ok(copy)
    }

    /// Fabric-scoped device lists gathered so far, in fabric order
    pub fn fabrics(&self) -> impl Iterator<Item = (FabricId, &DeviceList)> {
        self.by_fabric.iter().map(|(fabric, list)| (*fabric, list))
    }

    pub fn fabric_count(&self) -> usize {
        self.by_fabric.len()
    }
}

// ============================================================================
// Quota resolver
// ============================================================================

/// Per-model min/max bounds, queried once per node group
pub struct QuotaResolver<'a> {
    policy: &'a dyn ClusterPolicy,
    by_group: BTreeMap<String, BTreeMap<String, DeviceBounds>>,
}

impl<'a> QuotaResolver<'a> {
    pub fn new(policy: &'a dyn ClusterPolicy) -> Self {
        Self {
            policy,
            by_group: BTreeMap::new(),
        }
    }

    /// Bounds of `models` in `group`, looked up through one of its machines
    pub async fn bounds_for<'m>(
        &mut self,
        ctx: &PassContext,
        group: &str,
        machine_uuid: &str,
        models: impl Iterator<Item = &'m str>,
    ) -> Result<&BTreeMap<String, DeviceBounds>, ClientError> {
        let bounds = match self.by_group.entry(group.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                ctx.check()?;
                let details = self.policy.node_details(&ctx.request(), machine_uuid).await?;
                let bounds: BTreeMap<String, DeviceBounds> = models
                    .map(|model| (model.to_string(), details.bounds_for(model)))
                    .collect();
                for (model, bound) in &bounds {
                    if bound.min.is_none() && bound.max.is_none() {
                        debug!("No bounds for {} in node group {}", model, group);
                    }
                }
                entry.insert(bounds)
            }
        };
        Ok(bounds)
    }

    pub fn group_count(&self) -> usize {
        self.by_group.len()
    }
}
