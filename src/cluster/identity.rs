//! Node to machine identity resolution

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::context::PassContext;
use crate::kube::{ClusterApi, KubeError, ProviderNode};

/// Maps cluster nodes to composable-infrastructure machine UUIDs
///
/// Without bare-metal-host indirection the provider identifier of a node is
/// its machine UUID. With it, the UUID is read from the bare-metal host the
/// provider identifier points at.
pub struct IdentityResolver<'a> {
    cluster: &'a dyn ClusterApi,
    use_capi_bmh: bool,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, use_capi_bmh: bool) -> Self {
        Self {
            cluster,
            use_capi_bmh,
        }
    }

    /// Node name -> machine UUID for every resolvable node
    ///
    /// Entries without a node or a machine UUID are skipped with a warning.
    pub async fn resolve_all(
        &self,
        ctx: &PassContext,
    ) -> Result<BTreeMap<String, String>, KubeError> {
        let nodes = self.cluster.list_provider_nodes(&ctx.request()).await?;

        let mut uuids = BTreeMap::new();
        for ProviderNode {
            provider_id,
            node_name,
        } in nodes
        {
            ctx.check()?;

            let Some(node_name) = node_name else {
                warn!("Missing node for providerID {}", provider_id);
                continue;
            };

            let machine_uuid = if self.use_capi_bmh {
                match self
                    .cluster
                    .machine_uuid_for(&ctx.request(), &provider_id)
                    .await?
                {
                    Some(uuid) => uuid,
                    None => {
                        warn!(
                            "Missing machine UUID for providerID {}, node {} is skipped",
                            provider_id, node_name
                        );
                        continue;
                    }
                }
            } else {
                provider_id
            };

            debug!("Resolved node {} to machine {}", node_name, machine_uuid);
            uuids.insert(node_name, machine_uuid);
        }

        Ok(uuids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::mock::MockCluster;
    use std::sync::atomic::Ordering;
    use tokio_util::sync::CancellationToken;

    fn provider(id: &str, node: Option<&str>, uuid: Option<&str>) -> (String, Option<String>, Option<String>) {
        (
            id.to_string(),
            node.map(str::to_string),
            uuid.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn test_provider_id_is_uuid_without_bmh() {
        let cluster = MockCluster {
            providers: vec![
                provider("m-1", Some("worker-1"), None),
                provider("m-2", None, None),
            ],
            ..Default::default()
        };

        let ctx = PassContext::new(CancellationToken::new());
        let uuids = IdentityResolver::new(&cluster, false)
            .resolve_all(&ctx)
            .await
            .unwrap();

        assert_eq!(uuids.len(), 1);
        assert_eq!(uuids["worker-1"], "m-1");
    }

    #[tokio::test]
    async fn test_bmh_indirection_skips_missing_annotation() {
        let cluster = MockCluster {
            providers: vec![
                provider("metal3://ns/h1/m1", Some("worker-1"), Some("uuid-1")),
                provider("metal3://ns/h2/m2", Some("worker-2"), None),
            ],
            ..Default::default()
        };

        let ctx = PassContext::new(CancellationToken::new());
        let uuids = IdentityResolver::new(&cluster, true)
            .resolve_all(&ctx)
            .await
            .unwrap();

        assert_eq!(uuids, BTreeMap::from([("worker-1".to_string(), "uuid-1".to_string())]));
    }

    #[tokio::test]
    async fn test_enumeration_failure_propagates() {
        let cluster = MockCluster {
            fail_listing: true,
            ..Default::default()
        };

        let ctx = PassContext::new(CancellationToken::new());
        let result = IdentityResolver::new(&cluster, false).resolve_all(&ctx).await;
        assert!(matches!(result, Err(KubeError::Kube(_))));
    }

    #[tokio::test]
    async fn test_nodes_listed_once_per_resolution() {
        let cluster = MockCluster {
            providers: (0..20)
                .map(|i| provider(&format!("m-{}", i), Some(format!("worker-{}", i).as_str()), None))
                .collect(),
            ..Default::default()
        };

        let ctx = PassContext::new(CancellationToken::new());
        let uuids = IdentityResolver::new(&cluster, false)
            .resolve_all(&ctx)
            .await
            .unwrap();

        assert_eq!(uuids.len(), 20);
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 1);
    }
}
