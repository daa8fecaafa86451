//! `ClusterApi` over the `kube` client

use std::collections::BTreeMap;

use ::kube::api::{Api, DynamicObject, ListParams, PostParams};
use ::kube::discovery::{ApiResource, Discovery};
use ::kube::{Client, ResourceExt};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node as NodeObject, Secret};
use tracing::{debug, warn};

use super::{ClusterApi, KubeError, Node, ProviderNode};
use crate::context::RequestContext;

/// Bare-metal host annotation carrying the composable-infrastructure machine UUID
pub const MACHINE_UUID_ANNOTATION: &str = "cohdi.io/machine-uuid";

/// API group and version that must be served for device pools to be published
pub const RESOURCE_GROUP: &str = "resource.k8s.io";
pub const RESOURCE_VERSION: &str = "v1beta2";

const PROVIDER_SCHEME_METAL3: &str = "metal3://";

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the in-cluster service account, or the local kubeconfig
    pub async fn try_default() -> Result<Self, KubeError> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn bare_metal_host_resource() -> ApiResource {
    ApiResource {
        group: "metal3.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "metal3.io/v1alpha1".to_string(),
        kind: "BareMetalHost".to_string(),
        plural: "baremetalhosts".to_string(),
    }
}

/// Split `metal3://<namespace>/<host>/<machine>` into namespace and host name
pub fn parse_metal3_provider_id(provider_id: &str) -> Option<(&str, &str)> {
    let rest = provider_id.strip_prefix(PROVIDER_SCHEME_METAL3)?;
    let mut parts = rest.split('/');
    match (parts.next(), parts.next()) {
        (Some(namespace), Some(host)) if !namespace.is_empty() && !host.is_empty() => {
            Some((namespace, host))
        }
        _ => None,
    }
}

/// Nodes with a non-empty provider identifier
pub fn provider_nodes(nodes: impl IntoIterator<Item = NodeObject>) -> Vec<ProviderNode> {
    nodes
        .into_iter()
        .filter_map(|node| {
            let provider_id = node
                .spec
                .and_then(|spec| spec.provider_id)
                .filter(|p| !p.is_empty())?;
            Some(ProviderNode {
                provider_id,
                node_name: node.metadata.name,
            })
        })
        .collect()
}

fn machine_uuid_annotation(annotations: &BTreeMap<String, String>) -> Option<String> {
    annotations
        .get(MACHINE_UUID_ANNOTATION)
        .filter(|v| !v.is_empty())
        .cloned()
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list_provider_nodes(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<ProviderNode>, KubeError> {
        let api: Api<NodeObject> = Api::all(self.client.clone());
        debug!("Listing nodes, requestID={}", ctx.request_id());
        let nodes = ctx.run(api.list(&ListParams::default())).await??;
        Ok(provider_nodes(nodes.items))
    }

    async fn machine_uuid_for(
        &self,
        ctx: &RequestContext,
        provider_id: &str,
    ) -> Result<Option<String>, KubeError> {
        let Some((namespace, host)) = parse_metal3_provider_id(provider_id) else {
            warn!("Provider ID {} does not name a bare-metal host", provider_id);
            return Ok(None);
        };

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &bare_metal_host_resource());
        debug!(
            "Getting BareMetalHost {}/{}, requestID={}",
            namespace,
            host,
            ctx.request_id()
        );
        let bmh = ctx.run(api.get_opt(host)).await??;
        Ok(bmh.and_then(|b| machine_uuid_annotation(b.annotations())))
    }

    async fn get_config_map(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, KubeError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = ctx.run(api.get_opt(name)).await??;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn get_secret(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, KubeError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = ctx.run(api.get_opt(name)).await??;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn get_node(&self, ctx: &RequestContext, name: &str) -> Result<Option<Node>, KubeError> {
        let api: Api<NodeObject> = Api::all(self.client.clone());
        match ctx.run(api.get_opt(name)).await?? {
            Some(object) => Node::from_object(object).map(Some),
            None => Ok(None),
        }
    }

    async fn update_node(&self, ctx: &RequestContext, node: &Node) -> Result<(), KubeError> {
        let api: Api<NodeObject> = Api::all(self.client.clone());
        debug!("Replacing node {}, requestID={}", node.name, ctx.request_id());
        ctx.run(api.replace(&node.name, &PostParams::default(), &node.to_object()))
            .await??;
        Ok(())
    }

    async fn is_dra_enabled(&self, ctx: &RequestContext) -> Result<bool, KubeError> {
        let discovery = Discovery::new(self.client.clone()).filter(&[RESOURCE_GROUP]);
        let discovery = ctx.run(discovery.run()).await??;
        Ok(discovery
            .get(RESOURCE_GROUP)
            .is_some_and(|group| group.versions().any(|v| v == RESOURCE_VERSION)))
    }
}
