//! Device pool publication as ResourceSlices
//!
//! Each pool becomes one ResourceSlice, applied server-side under a fixed
//! field manager so re-applying an unchanged pool is a no-op.

use std::collections::BTreeMap;

use ::kube::api::{Api, DynamicObject, Patch, PatchParams};
use ::kube::discovery::ApiResource;
use ::kube::Client;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::client::{RESOURCE_GROUP, RESOURCE_VERSION};
use super::KubeError;
use crate::cluster::pool::{Pool, PoolPublisher, PublishError};
use crate::context::RequestContext;

pub const FIELD_MANAGER: &str = "composable-dra";

const MAX_NAME_LEN: usize = 253;

pub struct ResourceSlicePublisher {
    client: Client,
}

impl ResourceSlicePublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn resource_slice_resource() -> ApiResource {
    ApiResource {
        group: RESOURCE_GROUP.to_string(),
        version: RESOURCE_VERSION.to_string(),
        api_version: format!("{}/{}", RESOURCE_GROUP, RESOURCE_VERSION),
        kind: "ResourceSlice".to_string(),
        plural: "resourceslices".to_string(),
    }
}

/// Object name of the slice publishing `pool` for `driver`
pub fn slice_name(driver: &str, pool: &str) -> String {
    let mut name: String = format!("{}-{}", pool, driver)
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    name.truncate(MAX_NAME_LEN);
    name.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// The ResourceSlice manifest for one pool
pub fn resource_slice(driver: &str, pool: &Pool) -> Value {
    let devices: Vec<Value> = pool
        .devices
        .iter()
        .map(|device| {
            let attributes: Map<String, Value> = device
                .attributes
                .iter()
                .map(|(key, value)| (key.clone(), json!({ "string": value })))
                .collect();
            let mut entry = json!({
                "name": device.name,
                "attributes": attributes,
                "bindsToNode": device.binds_to_node,
                "bindingConditions": device.binding_conditions,
                "bindingFailureConditions": device.binding_failure_conditions,
            });
            if let (Some(timeout), Some(object)) =
                (device.binding_timeout_seconds, entry.as_object_mut())
            {
                object.insert("bindingTimeoutSeconds".to_string(), json!(timeout));
            }
            entry
        })
        .collect();

    let match_expressions: Vec<Value> = pool
        .node_selector
        .iter()
        .map(|req| {
            json!({
                "key": req.key,
                "operator": "In",
                "values": req.values,
            })
        })
        .collect();

    json!({
        "apiVersion": format!("{}/{}", RESOURCE_GROUP, RESOURCE_VERSION),
        "kind": "ResourceSlice",
        "metadata": { "name": slice_name(driver, &pool.name) },
        "spec": {
            "driver": driver,
            "pool": {
                "name": pool.name,
                "generation": pool.generation,
                "resourceSliceCount": 1,
            },
            "nodeSelector": {
                "nodeSelectorTerms": [{ "matchExpressions": match_expressions }],
            },
            "devices": devices,
        },
    })
}

#[async_trait]
impl PoolPublisher for ResourceSlicePublisher {
    async fn publish(
        &self,
        ctx: &RequestContext,
        driver: &str,
        pools: &BTreeMap<String, Pool>,
    ) -> Result<(), PublishError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource_slice_resource());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let kube_error = |source: KubeError| PublishError::Kube {
            driver: driver.to_string(),
            source,
        };

        for pool in pools.values() {
            let name = slice_name(driver, &pool.name);
            let object: DynamicObject = serde_json::from_value(resource_slice(driver, pool))
                .map_err(|e| PublishError::Rejected {
                    driver: driver.to_string(),
                    reason: format!("ResourceSlice {}: {}", name, e),
                })?;

            debug!(
                "Applying ResourceSlice {} for pool {} (generation {}), requestID={}",
                name,
                pool.name,
                pool.generation,
                ctx.request_id()
            );
            ctx.run(api.patch(&name, &params, &Patch::Apply(&object)))
                .await
                .map_err(|cancelled| kube_error(cancelled.into()))?
                .map_err(|e| kube_error(e.into()))?;
        }
        Ok(())
    }
}
