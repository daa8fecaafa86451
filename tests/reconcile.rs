//! End-to-end reconciliation passes against in-memory collaborators

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use composable_dra::client::types::{
    NodeDetailsCluster, NodeDetailsData, NodeDetailsMachine, ResourceSpec, SelectorCondition,
};
use composable_dra::client::{
    ClientError, ClusterPolicy, FabricInventory, FabricMachine, NodeDetails, NodeGroup,
    NodeGroupInfo,
};
use composable_dra::cluster::{
    Collaborators, EngineError, EngineOptions, Pool, PoolPublisher, PublishError,
    ReconciliationEngine,
};
use composable_dra::config::{Catalog, DeviceInfo};
use composable_dra::context::{PassContext, RequestContext};
use composable_dra::kube::{ClusterApi, KubeError, Node, ProviderNode};

const PREFIX: &str = "composable.example.com";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeCluster {
    /// provider id -> node name
    providers: Vec<(String, String)>,
    nodes: Mutex<BTreeMap<String, Node>>,
    list_calls: AtomicUsize,
    updates: AtomicUsize,
}

impl FakeCluster {
    fn with_nodes(nodes: &[(&str, &str)]) -> Self {
        let cluster = FakeCluster {
            providers: nodes
                .iter()
                .map(|(node, uuid)| (uuid.to_string(), node.to_string()))
                .collect(),
            ..Default::default()
        };
        for (node, _) in nodes {
            cluster
                .nodes
                .lock()
                .unwrap()
                .insert(node.to_string(), Node::new(*node));
        }
        cluster
    }

    fn labels(&self, node: &str) -> BTreeMap<String, String> {
        self.nodes.lock().unwrap()[node].labels.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_provider_nodes(
        &self,
        _ctx: &RequestContext,
    ) -> Result<Vec<ProviderNode>, KubeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .providers
            .iter()
            .map(|(p, n)| ProviderNode::new(p.clone(), Some(n.as_str())))
            .collect())
    }

    async fn machine_uuid_for(
        &self,
        _ctx: &RequestContext,
        _provider_id: &str,
    ) -> Result<Option<String>, KubeError> {
        Ok(None)
    }

    async fn get_config_map(
        &self,
        _ctx: &RequestContext,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, KubeError> {
        Ok(None)
    }

    async fn get_secret(
        &self,
        _ctx: &RequestContext,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, KubeError> {
        Ok(None)
    }

    async fn get_node(&self, _ctx: &RequestContext, name: &str) -> Result<Option<Node>, KubeError> {
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }

    async fn update_node(&self, _ctx: &RequestContext, node: &Node) -> Result<(), KubeError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.nodes
            .lock()
            .unwrap()
            .insert(node.name.clone(), node.clone());
        Ok(())
    }

    async fn is_dra_enabled(&self, _ctx: &RequestContext) -> Result<bool, KubeError> {
        Ok(true)
    }
}

#[derive(Default)]
struct FakeInventory {
    machines: Vec<FabricMachine>,
    /// (fabric, model) -> available count
    counts: Mutex<BTreeMap<(i64, String), u32>>,
    count_calls: AtomicUsize,
}

impl FakeInventory {
    fn set_count(&self, fabric: i64, model: &str, count: u32) {
        self.counts
            .lock()
            .unwrap()
            .insert((fabric, model.to_string()), count);
    }
}

#[async_trait]
impl FabricInventory for FakeInventory {
    async fn list_machines(&self, _ctx: &RequestContext) -> Result<Vec<FabricMachine>, ClientError> {
        Ok(self.machines.clone())
    }

    async fn available_count(
        &self,
        _ctx: &RequestContext,
        machine_uuid: &str,
        model: &str,
    ) -> Result<u32, ClientError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let fabric = self
            .machines
            .iter()
            .find(|m| m.machine_uuid == machine_uuid)
            .and_then(|m| m.fabric_id)
            .ok_or(ClientError::Api {
                status: 404,
                message: format!("machine {} not found", machine_uuid),
            })?;
        Ok(self
            .counts
            .lock()
            .unwrap()
            .get(&(fabric, model.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Default)]
struct FakePolicy {
    groups: Vec<NodeGroupInfo>,
    /// machine uuid -> (model, min, max)
    bounds: Mutex<BTreeMap<String, Vec<(String, Option<u32>, Option<u32>)>>>,
    details_calls: AtomicUsize,
}

impl FakePolicy {
    fn with_group(mut self, uuid: &str, machines: &[&str]) -> Self {
        self.groups.push(NodeGroupInfo {
            uuid: uuid.to_string(),
            name: format!("group-{}", uuid),
            machine_ids: machines.iter().map(|m| m.to_string()).collect(),
        });
        self
    }

    fn set_bounds(&self, machine_uuid: &str, model: &str, min: Option<u32>, max: Option<u32>) {
        self.bounds
            .lock()
            .unwrap()
            .insert(machine_uuid.to_string(), vec![(model.to_string(), min, max)]);
    }

    fn clear_bounds(&self) {
        self.bounds.lock().unwrap().clear();
    }
}

#[async_trait]
impl ClusterPolicy for FakePolicy {
    async fn list_node_groups(&self, _ctx: &RequestContext) -> Result<Vec<NodeGroup>, ClientError> {
        Ok(self
            .groups
            .iter()
            .map(|g| NodeGroup {
                uuid: g.uuid.clone(),
                name: g.name.clone(),
            })
            .collect())
    }

    async fn node_group_members(
        &self,
        _ctx: &RequestContext,
        group: &NodeGroup,
    ) -> Result<NodeGroupInfo, ClientError> {
        self.groups
            .iter()
            .find(|g| g.uuid == group.uuid)
            .cloned()
            .ok_or(ClientError::Api {
                status: 404,
                message: "no such node group".to_string(),
            })
    }

    async fn node_details(
        &self,
        _ctx: &RequestContext,
        machine_uuid: &str,
    ) -> Result<NodeDetails, ClientError> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        let specs = self
            .bounds
            .lock()
            .unwrap()
            .get(machine_uuid)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(model, min, max)| {
                let mut spec = ResourceSpec {
                    min_count: min,
                    max_count: max,
                    ..Default::default()
                };
                spec.selector.expression.conditions.push(SelectorCondition {
                    column: "model".to_string(),
                    operator: "eq".to_string(),
                    value: model,
                });
                spec
            })
            .collect();

        Ok(NodeDetails {
            data: NodeDetailsData {
                cluster: NodeDetailsCluster {
                    machine: NodeDetailsMachine {
                        resource_specs: specs,
                    },
                },
            },
        })
    }
}

#[derive(Default)]
struct FakePublisher {
    published: Mutex<Vec<(String, BTreeMap<String, Pool>)>>,
    fail: AtomicBool,
}

impl FakePublisher {
    fn calls(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    fn last(&self, driver: &str) -> Option<BTreeMap<String, Pool>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(d, _)| d == driver)
            .map(|(_, pools)| pools.clone())
    }
}

#[async_trait]
impl PoolPublisher for FakePublisher {
    async fn publish(
        &self,
        _ctx: &RequestContext,
        driver: &str,
        pools: &BTreeMap<String, Pool>,
    ) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected {
                driver: driver.to_string(),
                reason: "API server unavailable".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((driver.to_string(), pools.clone()));
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    cluster: Arc<FakeCluster>,
    inventory: Arc<FakeInventory>,
    policy: Arc<FakePolicy>,
    publisher: Arc<FakePublisher>,
    engine: ReconciliationEngine,
}

impl Harness {
    fn new(
        nodes: &[(&str, &str)],
        machines: Vec<FabricMachine>,
        policy: FakePolicy,
        use_cluster_manager: bool,
    ) -> Self {
        let cluster = Arc::new(FakeCluster::with_nodes(nodes));
        let inventory = Arc::new(FakeInventory {
            machines,
            ..Default::default()
        });
        let policy = Arc::new(policy);
        let publisher = Arc::new(FakePublisher::default());

        let collaborators = Collaborators {
            cluster: cluster.clone(),
            inventory: inventory.clone(),
            policy: policy.clone(),
            publisher: publisher.clone(),
        };
        let options = EngineOptions {
            scan_interval: Duration::from_secs(60),
            use_capi_bmh: false,
            use_cluster_manager,
            binding_timeout: Some(600),
        };
        let engine = ReconciliationEngine::new(options, catalog(), collaborators);

        Self {
            cluster,
            inventory,
            policy,
            publisher,
            engine,
        }
    }

    async fn pass(&mut self) -> Result<composable_dra::cluster::PassSummary, EngineError> {
        let ctx = PassContext::new(CancellationToken::new());
        self.engine.run_pass(&ctx).await
    }

    fn generation(&self, driver: &str, pool: &str) -> i64 {
        self.engine.pools().pool(driver, pool).unwrap().generation
    }
}

fn catalog() -> Catalog {
    Catalog {
        devices: vec![DeviceInfo {
            index: 1,
            cdi_model_name: "DEVICE 1".to_string(),
            dra_attributes: BTreeMap::from([("productName".to_string(), "DEVICE 1".to_string())]),
            driver_name: "d1".to_string(),
            k8s_device_name: "dev1".to_string(),
            cannot_coexist_with: vec![],
        }],
        label_prefix: PREFIX.to_string(),
    }
}

fn single_machine(use_cluster_manager: bool) -> Harness {
    let policy = FakePolicy::default().with_group("ng-1", &["m-1"]);
    Harness::new(
        &[("worker-1", "m-1")],
        vec![FabricMachine::new("m-1", Some(3))],
        policy,
        use_cluster_manager,
    )
}

// ============================================================================
// Pools
// ============================================================================

#[tokio::test]
async fn test_pool_generation_follows_available_count() {
    let mut h = single_machine(false);
    h.inventory.set_count(3, "DEVICE 1", 4);

    h.pass().await.unwrap();
    assert_eq!(h.generation("d1", "dev1-fabric3"), 1);
    let pool = h.publisher.last("d1").unwrap()["dev1-fabric3"].clone();
    let names: Vec<_> = pool.devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["dev1-gpu0", "dev1-gpu1", "dev1-gpu2", "dev1-gpu3"]);
    assert_eq!(pool.devices[0].binding_timeout_seconds, Some(600));

    h.pass().await.unwrap();
    assert_eq!(h.generation("d1", "dev1-fabric3"), 1);
    assert_eq!(h.publisher.calls(), 1);

    h.inventory.set_count(3, "DEVICE 1", 5);
    let summary = h.pass().await.unwrap();
    assert_eq!(h.generation("d1", "dev1-fabric3"), 2);
    assert_eq!(summary.published, vec!["d1"]);

    let pool = &h.publisher.last("d1").unwrap()["dev1-fabric3"];
    assert_eq!(pool.generation, 2);
    assert_eq!(pool.devices.len(), 5);
    assert_eq!(pool.devices[4].name, "dev1-gpu4");
}

#[tokio::test]
async fn test_unchanged_passes_are_idempotent() {
    let mut h = single_machine(true);
    h.inventory.set_count(3, "DEVICE 1", 2);
    h.policy.set_bounds("m-1", "DEVICE 1", Some(1), Some(8));

    h.pass().await.unwrap();
    let labels = h.cluster.labels("worker-1");

    let summary = h.pass().await.unwrap();
    assert!(summary.pool_changes.is_empty());
    assert!(summary.published.is_empty());
    assert_eq!(summary.label_changes, 0);
    assert_eq!(h.cluster.labels("worker-1"), labels);
    assert_eq!(h.generation("d1", "dev1-fabric3"), 1);
    assert_eq!(h.publisher.calls(), 1);

    // the fabric label is rewritten on every pass
    assert_eq!(h.cluster.updates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_publish_is_retried_next_pass() {
    let mut h = single_machine(false);
    h.inventory.set_count(3, "DEVICE 1", 2);
    h.publisher.fail.store(true, Ordering::SeqCst);

    let result = h.pass().await;
    assert!(matches!(result, Err(EngineError::Publish(_))));
    assert_eq!(h.publisher.calls(), 0);

    h.publisher.fail.store(false, Ordering::SeqCst);
    let summary = h.pass().await.unwrap();

    assert!(summary.pool_changes.is_empty());
    assert_eq!(summary.published, vec!["d1"]);
    assert_eq!(h.generation("d1", "dev1-fabric3"), 1);
    assert_eq!(h.publisher.last("d1").unwrap()["dev1-fabric3"].devices.len(), 2);
}

#[tokio::test]
async fn test_device_counts_queried_once_per_fabric() {
    let mut h = Harness::new(
        &[("worker-1", "m-1"), ("worker-2", "m-2"), ("worker-3", "m-3")],
        vec![
            FabricMachine::new("m-1", Some(1)),
            FabricMachine::new("m-2", Some(1)),
            FabricMachine::new("m-3", Some(2)),
        ],
        FakePolicy::default(),
        false,
    );
    h.inventory.set_count(1, "DEVICE 1", 3);
    h.inventory.set_count(2, "DEVICE 1", 1);

    let summary = h.pass().await.unwrap();

    assert_eq!(summary.machines, 3);
    assert_eq!(summary.fabrics, 2);
    assert_eq!(h.inventory.count_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.cluster.list_calls.load(Ordering::SeqCst), 1);

    let pools = h.publisher.last("d1").unwrap();
    assert_eq!(pools["dev1-fabric1"].devices.len(), 3);
    assert_eq!(pools["dev1-fabric2"].devices.len(), 1);
}

// ============================================================================
// Labels
// ============================================================================

#[tokio::test]
async fn test_size_labels_follow_node_group_bounds() {
    let mut h = single_machine(true);
    h.inventory.set_count(3, "DEVICE 1", 4);
    h.policy.set_bounds("m-1", "DEVICE 1", Some(1), Some(8));

    let max_key = format!("{}/dev1-size-max", PREFIX);
    let min_key = format!("{}/dev1-size-min", PREFIX);
    let fabric_key = format!("{}/fabric", PREFIX);
    assert!(!h.cluster.labels("worker-1").contains_key(&max_key));

    h.pass().await.unwrap();
    let labels = h.cluster.labels("worker-1");
    assert_eq!(labels[&max_key], "8");
    assert_eq!(labels[&min_key], "1");
    assert_eq!(labels[&fabric_key], "3");

    h.policy.clear_bounds();
    let summary = h.pass().await.unwrap();
    let labels = h.cluster.labels("worker-1");
    assert!(!labels.contains_key(&max_key));
    assert!(!labels.contains_key(&min_key));
    assert_eq!(labels[&fabric_key], "3");
    assert_eq!(summary.label_changes, 2);
}

#[tokio::test]
async fn test_bounds_do_not_leak_across_node_groups_on_one_fabric() {
    let policy = FakePolicy::default()
        .with_group("ng-1", &["m-1"])
        .with_group("ng-2", &["m-2"]);
    let mut h = Harness::new(
        &[("worker-1", "m-1"), ("worker-2", "m-2")],
        vec![
            FabricMachine::new("m-1", Some(7)),
            FabricMachine::new("m-2", Some(7)),
        ],
        policy,
        true,
    );
    h.inventory.set_count(7, "DEVICE 1", 2);
    h.policy.set_bounds("m-1", "DEVICE 1", None, Some(8));

    let summary = h.pass().await.unwrap();
    assert_eq!(summary.node_groups, 2);

    let max_key = format!("{}/dev1-size-max", PREFIX);
    assert_eq!(h.cluster.labels("worker-1")[&max_key], "8");
    assert!(!h.cluster.labels("worker-2").contains_key(&max_key));

    // one device query for the shared fabric, one details query per group
    assert_eq!(h.inventory.count_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.policy.details_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_machine_in_two_groups_takes_the_last_listed() {
    let policy = FakePolicy::default()
        .with_group("ng-1", &["m-1"])
        .with_group("ng-2", &["m-1"]);
    let mut h = Harness::new(
        &[("worker-1", "m-1")],
        vec![FabricMachine::new("m-1", Some(3))],
        policy,
        true,
    );
    h.inventory.set_count(3, "DEVICE 1", 1);
    h.policy.set_bounds("m-1", "DEVICE 1", Some(2), None);

    let summary = h.pass().await.unwrap();

    // one group resolved, so one details query
    assert_eq!(summary.node_groups, 1);
    assert_eq!(h.policy.details_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.cluster.labels("worker-1")[&format!("{}/dev1-size-min", PREFIX)],
        "2"
    );
}

#[tokio::test]
async fn test_machine_outside_node_groups_gets_no_size_labels() {
    let mut h = Harness::new(
        &[("worker-1", "m-1")],
        vec![FabricMachine::new("m-1", Some(3))],
        FakePolicy::default(),
        true,
    );
    h.inventory.set_count(3, "DEVICE 1", 1);
    h.policy.set_bounds("m-1", "DEVICE 1", Some(1), Some(2));

    h.pass().await.unwrap();

    let labels = h.cluster.labels("worker-1");
    assert_eq!(labels.len(), 1);
    assert_eq!(h.policy.details_calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_no_nodes_fails_the_pass() {
    let mut h = Harness::new(&[], vec![], FakePolicy::default(), false);
    assert!(matches!(h.pass().await, Err(EngineError::NoMachinesFound)));
}
