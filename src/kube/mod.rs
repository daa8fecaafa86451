//! Cluster API access
//!
//! `ClusterApi` is the seam between the reconciliation engine and the
//! Kubernetes API server: node enumeration, config map and secret reads,
//! node get/replace, and the DRA capability check. `KubeClient` implements
//! it with `kube` and `ResourceSlicePublisher` publishes device pools as
//! ResourceSlices.

pub mod client;
pub mod publisher;

pub use client::KubeClient;
pub use publisher::ResourceSlicePublisher;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as NodeObject;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use crate::context::{Cancelled, RequestContext};

#[derive(Error, Debug)]
pub enum KubeError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),

    #[error("Invalid object: {0}")]
    Invalid(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<Cancelled> for KubeError {
    fn from(_: Cancelled) -> Self {
        KubeError::Cancelled
    }
}

/// A cluster node; the full API object is kept so a replace round-trips
/// every field this crate does not look at
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    object: NodeObject,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let object = NodeObject {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            name,
            labels: BTreeMap::new(),
            object,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn from_object(object: NodeObject) -> Result<Self, KubeError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| KubeError::Invalid("node without name".to_string()))?;
        let labels = object.metadata.labels.clone().unwrap_or_default();
        Ok(Self {
            name,
            labels,
            object,
        })
    }

    /// The API object with the current labels written back
    pub fn to_object(&self) -> NodeObject {
        let mut object = self.object.clone();
        object.metadata.labels = Some(self.labels.clone());
        object
    }
}

/// A node carrying a provider identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderNode {
    pub provider_id: String,
    /// `None` when the node object has no name
    pub node_name: Option<String>,
}

impl ProviderNode {
    pub fn new(provider_id: impl Into<String>, node_name: Option<&str>) -> Self {
        Self {
            provider_id: provider_id.into(),
            node_name: node_name.map(str::to_string),
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Every node that has a provider identifier, from a single node listing
    async fn list_provider_nodes(&self, ctx: &RequestContext)
        -> Result<Vec<ProviderNode>, KubeError>;

    /// Machine UUID recorded on the bare-metal host behind `provider_id`
    async fn machine_uuid_for(
        &self,
        ctx: &RequestContext,
        provider_id: &str,
    ) -> Result<Option<String>, KubeError>;

    async fn get_config_map(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, KubeError>;

    /// Decoded secret data, `None` when the secret does not exist
    async fn get_secret(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, KubeError>;

    async fn get_node(&self, ctx: &RequestContext, name: &str) -> Result<Option<Node>, KubeError>;

    async fn update_node(&self, ctx: &RequestContext, node: &Node) -> Result<(), KubeError>;

    /// Whether the resource API version used for device pools is served
    async fn is_dra_enabled(&self, ctx: &RequestContext) -> Result<bool, KubeError>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;

    #[test]
    fn test_node_round_trip_keeps_unknown_fields() {
        let object = NodeObject {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                resource_version: Some("42".to_string()),
                labels: Some(BTreeMap::from([(
                    "kubernetes.io/hostname".to_string(),
                    "worker-1".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("m-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut node = Node::from_object(object).unwrap();
        assert_eq!(node.name, "worker-1");
        assert_eq!(node.labels.len(), 1);

        node.labels.insert("example.com/fabric".to_string(), "3".to_string());
        let out = node.to_object();

        assert_eq!(out.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            out.spec.and_then(|s| s.provider_id).as_deref(),
            Some("m-1")
        );
        let labels = out.metadata.labels.unwrap();
        assert_eq!(labels["example.com/fabric"], "3");
        assert_eq!(labels["kubernetes.io/hostname"], "worker-1");
    }

    #[test]
    fn test_node_without_labels() {
        let node = Node::from_object(Node::new("worker-2").to_object()).unwrap();
        assert_eq!(node.name, "worker-2");
        assert!(node.labels.is_empty());
    }

    #[test]
    fn test_node_without_name_rejected() {
        assert!(matches!(
            Node::from_object(NodeObject::default()),
            Err(KubeError::Invalid(_))
        ));
    }
}
