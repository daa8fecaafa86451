//! Reconciliation engine
//!
//! One pass:
//! 1. resolve node -> machine UUID
//! 2. snapshot the fabric inventory's machine list
//! 3. attach fabric IDs (and node groups in quota mode) to machines
//! 4. discover available devices, once per fabric
//! 5. overlay quota bounds, once per node group
//! 6. diff against the published pools and publish changed drivers
//! 7. sync node labels
//!
//! Any collaborator failure aborts the pass; the next tick recomputes
//! everything from scratch. Passes run back to back on a single task and
//! never overlap.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::identity::IdentityResolver;
use super::inventory::{DeviceInventory, FabricMembership, NodeGroupIndex, QuotaResolver};
use super::labels::sync_labels;
use super::model::Machine;
use super::pool::{pool_name, PoolChange, PoolPublisher, PoolState, PublishError};
use crate::client::{ClientError, ClusterPolicy, FabricInventory};
use crate::config::{Catalog, Config};
use crate::context::{Cancelled, PassContext};
use crate::kube::{ClusterApi, KubeError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No machine UUID could be resolved for any node")]
    NoMachinesFound,

    #[error("No machine with a fabric ID to process")]
    NoMachinesToProcess,

    #[error("Cluster API call failed: {0}")]
    Kube(KubeError),

    #[error("Composable infrastructure call failed: {0}")]
    Client(ClientError),

    #[error(transparent)]
    Publish(PublishError),

    #[error("Dynamic Resource Allocation is not enabled in the cluster")]
    CapabilityDisabled,

    #[error("Pass cancelled")]
    Cancelled,
}

impl From<KubeError> for EngineError {
    fn from(e: KubeError) -> Self {
        match e {
            KubeError::Cancelled => EngineError::Cancelled,
            other => EngineError::Kube(other),
        }
    }
}

impl From<PublishError> for EngineError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::Kube {
                source: KubeError::Cancelled,
                ..
            } => EngineError::Cancelled,
            other => EngineError::Publish(other),
        }
    }
}

impl From<ClientError> for EngineError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Cancelled => EngineError::Cancelled,
            other => EngineError::Client(other),
        }
    }
}

impl From<Cancelled> for EngineError {
    fn from(_: Cancelled) -> Self {
        EngineError::Cancelled
    }
}

/// Services the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterApi>,
    pub inventory: Arc<dyn FabricInventory>,
    pub policy: Arc<dyn ClusterPolicy>,
    pub publisher: Arc<dyn PoolPublisher>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub scan_interval: Duration,
    pub use_capi_bmh: bool,
    pub use_cluster_manager: bool,
    pub binding_timeout: Option<i64>,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            scan_interval: config.scan_interval,
            use_capi_bmh: config.use_capi_bmh,
            use_cluster_manager: config.use_cluster_manager,
            binding_timeout: config.binding_timeout,
        }
    }
}

/// What one pass observed and changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PassSummary {
    pub machines: usize,
    pub fabrics: usize,
    /// Node groups whose quotas were fetched
    pub node_groups: usize,
    pub pool_changes: Vec<(String, PoolChange)>,
    pub published: Vec<String>,
    pub nodes_updated: usize,
    pub label_changes: usize,
}

pub struct ReconciliationEngine {
    options: EngineOptions,
    catalog: Arc<Catalog>,
    collaborators: Collaborators,
    pools: PoolState,
}

impl ReconciliationEngine {
    pub fn new(options: EngineOptions, catalog: Catalog, collaborators: Collaborators) -> Self {
        let pools = PoolState::new(catalog.driver_names());
        Self {
            options,
            catalog: Arc::new(catalog),
            collaborators,
            pools,
        }
    }

    pub fn pools(&self) -> &PoolState {
        &self.pools
    }

    /// Fails unless the cluster serves the resource API pools are published to
    pub async fn ensure_capability(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let ctx = PassContext::new(cancel.clone());
        if !self.collaborators.cluster.is_dra_enabled(&ctx.request()).await? {
            return Err(EngineError::CapabilityDisabled);
        }
        Ok(())
    }

    /// Run one reconciliation pass
    pub async fn run_pass(&mut self, ctx: &PassContext) -> Result<PassSummary, EngineError> {
        let mut summary = PassSummary::default();
        let cluster = self.collaborators.cluster.clone();
        let inventory = self.collaborators.inventory.clone();
        let policy = self.collaborators.policy.clone();
        let catalog = self.catalog.clone();

        let uuids = IdentityResolver::new(cluster.as_ref(), self.options.use_capi_bmh)
            .resolve_all(ctx)
            .await?;
        if uuids.is_empty() {
            return Err(EngineError::NoMachinesFound);
        }

        let membership = FabricMembership::fetch(ctx, inventory.as_ref()).await?;
        let groups = if self.options.use_cluster_manager {
            Some(NodeGroupIndex::fetch(ctx, policy.as_ref()).await?)
        } else {
            None
        };

        let mut machines = Vec::with_capacity(uuids.len());
        for (node_name, machine_uuid) in uuids {
            let Some(fabric) = membership.fabric_of(&machine_uuid) else {
                warn!(
                    "Fabric ID not found for machine {} (node {})",
                    machine_uuid, node_name
                );
                continue;
            };
            let node_group = groups.as_ref().and_then(|index| {
                let group = index.group_of(&machine_uuid).map(str::to_string);
                if group.is_none() {
                    warn!(
                        "Machine {} (node {}) is in no node group, min/max device counts not set",
                        machine_uuid, node_name
                    );
                }
                group
            });
            machines.push(Machine::new(node_name, machine_uuid, fabric).with_node_group(node_group));
        }
        if machines.is_empty() {
            return Err(EngineError::NoMachinesToProcess);
        }
        summary.machines = machines.len();

        let mut devices = DeviceInventory::new(
            inventory.as_ref(),
            &catalog.devices,
            self.options.binding_timeout,
        );
        for machine in machines.iter_mut() {
            machine.devices = devices
                .devices_for(ctx, &machine.machine_uuid, machine.fabric_id)
                .await?;
        }
        summary.fabrics = devices.fabric_count();

        if self.options.use_cluster_manager {
            let mut quota = QuotaResolver::new(policy.as_ref());
            for machine in machines.iter_mut() {
                let Some(ref group) = machine.node_group else {
                    continue;
                };
                let bounds = quota
                    .bounds_for(ctx, group, &machine.machine_uuid, machine.devices.models())
                    .await?;
                machine.devices.apply_bounds(bounds);
            }
            summary.node_groups = quota.group_count();
        }

        for machine in &machines {
            debug!(
                "Machine {} on node {}, fabric={}, nodeGroup={:?}",
                machine.machine_uuid, machine.node_name, machine.fabric_id, machine.node_group
            );
            for (model, device) in machine.devices.iter() {
                debug!(
                    "Node {} model {}: available={}, min={:?}, max={:?}",
                    machine.node_name, model, device.available, device.min, device.max
                );
            }
        }

        self.diff_and_publish(ctx, &devices, &mut summary).await?;
        self.sync_node_labels(ctx, &machines, &mut summary).await?;

        Ok(summary)
    }

    async fn diff_and_publish(
        &mut self,
        ctx: &PassContext,
        devices: &DeviceInventory<'_>,
        summary: &mut PassSummary,
    ) -> Result<(), EngineError> {
        for (fabric, list) in devices.fabrics() {
            for (_, device) in list.iter() {
                if !self.pools.is_tracked(&device.driver_name) {
                    continue;
                }
                let change = self.pools.update(device, fabric, &self.catalog.label_prefix);
                if change != PoolChange::Unchanged {
                    summary
                        .pool_changes
                        .push((pool_name(&device.k8s_device_name, fabric), change));
                }
            }
        }

        let publisher = self.collaborators.publisher.clone();
        for driver in self.pools.dirty_drivers() {
            ctx.check()?;
            let Some(pools) = self.pools.pools(&driver) else {
                continue;
            };
            self.pools.log_pools(&driver);

            let request = ctx.request();
            publisher
                .publish(&request, &driver, pools)
                .await
                .map_err(|e| {
                    error!(
                        "Failed to publish pools of driver {}, requestID={}",
                        driver,
                        request.request_id()
                    );
                    e
                })?;
            self.pools.mark_published(&driver);
            summary.published.push(driver);
        }
        Ok(())
    }

    async fn sync_node_labels(
        &self,
        ctx: &PassContext,
        machines: &[Machine],
        summary: &mut PassSummary,
    ) -> Result<(), EngineError> {
        let cluster = self.collaborators.cluster.as_ref();
        let prefix = &self.catalog.label_prefix;

        for machine in machines {
            ctx.check()?;
            let Some(mut node) = cluster.get_node(&ctx.request(), &machine.node_name).await? else {
                warn!("Node {} not found, labels not updated", machine.node_name);
                continue;
            };

            let changes = sync_labels(&mut node, machine, prefix, self.options.use_cluster_manager);
            for (key, value) in &changes.set {
                info!("Set label {}={} on node {}", key, value, node.name);
            }
            for key in &changes.removed {
                info!("Removed label {} from node {}", key, node.name);
            }

            cluster
                .update_node(&ctx.request(), &node)
                .await
                .map_err(|e| {
                    error!("Failed to update labels of node {}", node.name);
                    e
                })?;
            summary.nodes_updated += 1;
            summary.label_changes += changes.len();
        }
        Ok(())
    }

    /// Run a pass now and then once per scan interval until cancelled
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), EngineError> {
        self.ensure_capability(&cancel).await?;

        let mut ticker = tokio::time::interval(self.options.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting reconciliation engine: interval={}s, drivers={}, capiBmh={}, clusterManager={}",
            self.options.scan_interval.as_secs(),
            self.catalog.driver_names().len(),
            self.options.use_capi_bmh,
            self.options.use_cluster_manager
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciliation engine shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let ctx = PassContext::new(cancel.clone());
                    info!("Reconcile pass start, pass={}", ctx.pass_id());
                    match self.run_pass(&ctx).await {
                        Ok(summary) => info!(
                            "Reconcile pass successful, pass={}, machines={}, fabrics={}, nodeGroups={}, poolChanges={}, published={:?}, labelChanges={}",
                            ctx.pass_id(),
                            summary.machines,
                            summary.fabrics,
                            summary.node_groups,
                            summary.pool_changes.len(),
                            summary.published,
                            summary.label_changes
                        ),
                        Err(EngineError::Cancelled) => {
                            info!("Reconcile pass cancelled, pass={}", ctx.pass_id());
                            break;
                        }
                        Err(e) => error!("Reconcile pass failed, pass={}: {}", ctx.pass_id(), e),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Spawn the engine loop as a background task
pub fn spawn_engine(
    engine: ReconciliationEngine,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), EngineError>> {
    tokio::spawn(engine.run(cancel))
}
