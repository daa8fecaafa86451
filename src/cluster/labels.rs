//! Node label synchronization
//!
//! Labels written on every node backed by a composable machine:
//! - `<prefix>/fabric`: the machine's fabric ID, rewritten on every pass
//! - `<prefix>/<device>-size-max` / `-size-min`: the node group's bounds,
//!   in quota mode only; set when they differ, removed when unset

use super::model::Machine;
use crate::kube::Node;

pub fn fabric_label_key(prefix: &str) -> String {
    format!("{}/fabric", prefix)
}

/// Label a node must carry for the pool of `k8s_device_name` to select it
pub fn device_label_key(prefix: &str, k8s_device_name: &str) -> String {
    format!("{}/{}", prefix, k8s_device_name)
}

pub fn max_label_key(prefix: &str, k8s_device_name: &str) -> String {
    format!("{}/{}-size-max", prefix, k8s_device_name)
}

pub fn min_label_key(prefix: &str, k8s_device_name: &str) -> String {
    format!("{}/{}-size-min", prefix, k8s_device_name)
}

/// Label mutations applied to one node, apart from the fabric label
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LabelChanges {
    pub set: Vec<(String, String)>,
    pub removed: Vec<String>,
}

impl LabelChanges {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.len() + self.removed.len()
    }
}

/// Bring the labels of `node` in line with `machine`
pub fn sync_labels(
    node: &mut Node,
    machine: &Machine,
    prefix: &str,
    quota_mode: bool,
) -> LabelChanges {
    node.labels
        .insert(fabric_label_key(prefix), machine.fabric_id.to_string());

    let mut changes = LabelChanges::default();
    if !quota_mode {
        return changes;
    }

    for (_, device) in machine.devices.iter() {
        let bounds = [
            (max_label_key(prefix, &device.k8s_device_name), device.max),
            (min_label_key(prefix, &device.k8s_device_name), device.min),
        ];
        for (key, bound) in bounds {
            match bound {
                Some(value) => {
                    let value = value.to_string();
                    if node.labels.get(&key) != Some(&value) {
                        node.labels.insert(key.clone(), value.clone());
                        changes.set.push((key, value));
                    }
                }
                None => {
                    if node.labels.remove(&key).is_some() {
                        changes.removed.push(key);
                    }
                }
            }
        }
    }
    changes
}
