//! Wire types of the composable-infrastructure services
//!
//! Pure data structures, no I/O. Field names follow the JSON the services
//! emit; Rust-side names follow this crate's vocabulary.

use serde::{Deserialize, Serialize};

// ============================================================================
// Fabric inventory
// ============================================================================

/// Response of the machine listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineList {
    #[serde(default)]
    pub data: MachineListData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineListData {
    #[serde(default)]
    pub machines: Vec<FabricMachine>,
}

/// A machine known to the fabric inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricMachine {
    #[serde(rename = "mach_uuid")]
    pub machine_uuid: String,

    /// Absent while the machine is not attached to any fabric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric_id: Option<i64>,
}

impl FabricMachine {
    pub fn new(machine_uuid: impl Into<String>, fabric_id: Option<i64>) -> Self {
        Self {
            machine_uuid: machine_uuid.into(),
            fabric_id,
        }
    }
}

/// Free devices of one model in the fabric a machine belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableReservedResources {
    #[serde(rename = "reserved_res_num_per_fabric")]
    pub reserved_resource_num: u32,
}

// ============================================================================
// Cluster policy
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGroupList {
    #[serde(rename = "nodegroups", default)]
    pub node_groups: Vec<NodeGroup>,
}

/// A policy-service node group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
}

/// A node group together with its member machines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupInfo {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub machine_ids: Vec<String>,
}

/// Per-machine details, carrying the resource specs of its node group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDetails {
    #[serde(default)]
    pub data: NodeDetailsData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDetailsData {
    #[serde(default)]
    pub cluster: NodeDetailsCluster,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDetailsCluster {
    #[serde(default)]
    pub machine: NodeDetailsMachine,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDetailsMachine {
    #[serde(rename = "resspecs", default)]
    pub resource_specs: Vec<ResourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub selector: ResourceSelector,

    #[serde(rename = "min_resspec_count", default)]
    pub min_count: Option<u32>,

    #[serde(rename = "max_resspec_count", default)]
    pub max_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSelector {
    #[serde(default)]
    pub expression: SelectorExpression,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorExpression {
    #[serde(default)]
    pub conditions: Vec<SelectorCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorCondition {
    pub column: String,
    pub operator: String,
    pub value: String,
}

impl SelectorCondition {
    fn selects_model(&self, model: &str) -> bool {
        self.column == "model" && self.operator == "eq" && self.value == model
    }
}

/// Optional device-count bounds for one model; `None` means unset, not zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceBounds {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

impl NodeDetails {
    /// Bounds of every resource spec selecting `model`; later specs win
    pub fn bounds_for(&self, model: &str) -> DeviceBounds {
        let mut bounds = DeviceBounds::default();
        for spec in &self.data.cluster.machine.resource_specs {
            for condition in &spec.selector.expression.conditions {
                if !condition.selects_model(model) {
                    continue;
                }
                if spec.min_count.is_some() {
                    bounds.min = spec.min_count;
                }
                if spec.max_count.is_some() {
                    bounds.max = spec.max_count;
                }
            }
        }
        bounds
    }
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}
