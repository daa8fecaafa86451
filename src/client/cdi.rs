//! HTTP client for the composable-infrastructure API gateway
//!
//! One `CdiClient` talks to the identity service, the fabric inventory and
//! the cluster policy service behind the same endpoint. Calls to the latter
//! two carry a bearer credential from the shared `CredentialCache`; every
//! call carries its correlation identifier as `X-Request-Id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, error};
use uuid::Uuid;

use super::token::CredentialCache;
use super::types::{
    AvailableReservedResources, FabricMachine, MachineList, NodeDetails, NodeGroup,
    NodeGroupInfo, NodeGroupList, TokenResponse,
};
use super::{ClientError, ClusterPolicy, FabricInventory, IdentityService};
use crate::config::{Config, IdentitySecret};
use crate::context::RequestContext;

/// Header carrying the per-call correlation identifier
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Per-request timeout enforced by the HTTP layer
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Device type queried from the fabric inventory
const RESOURCE_TYPE: &str = "gpu";

#[derive(Clone)]
pub struct CdiClient {
    http: reqwest::Client,
    base_url: String,
    tenant_id: Uuid,
    cluster_id: Uuid,
    credentials: Option<Arc<CredentialCache>>,
}

impl CdiClient {
    /// Build a client for `https://<cdi_endpoint>`, trusting `ca_pem` if given
    pub fn new(config: &Config, ca_pem: Option<&str>) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        if let Some(pem) = ca_pem {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| ClientError::Http(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder.build().map_err(|e| ClientError::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: format!("https://{}", config.cdi_endpoint),
            tenant_id: config.tenant_id,
            cluster_id: config.cluster_id,
            credentials: None,
        })
    }

    /// Override the base URL (scheme included)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Attach the credential cache used for fabric and policy calls
    pub fn with_credentials(mut self, credentials: Arc<CredentialCache>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::Http(format!("invalid endpoint {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Http(format!("endpoint {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn cluster_manager_path<'a>(&'a self, tenant: &'a str, cluster: &'a str) -> Vec<&'a str> {
        vec![
            "cluster_manager",
            "cluster_autoscaler",
            "v3",
            "tenants",
            tenant,
            "clusters",
            cluster,
        ]
    }

    /// Authorized GET returning JSON
    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        url: Url,
    ) -> Result<T, ClientError> {
        let mut request = self
            .http
            .get(url)
            .header(REQUEST_ID_HEADER, ctx.request_id());

        if let Some(ref credentials) = self.credentials {
            let credential = ctx
                .run(credentials.obtain())
                .await?
                .map_err(|e| ClientError::Credential(e.to_string()))?;
            request = request.bearer_auth(credential.token);
        }

        let response = ctx
            .run(request.send())
            .await?
            .map_err(|e| ClientError::Http(e.to_string()))?;
        decode(ctx, response).await
    }
}

async fn decode<T: DeserializeOwned>(
    ctx: &RequestContext,
    response: Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let text = ctx
            .run(response.text())
            .await?
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::Api {
            status: status.as_u16(),
            message: text,
        });
    }

    ctx.run(response.json::<T>())
        .await?
        .map_err(|e| ClientError::Parse(e.to_string()))
}

// ============================================================================
// Collaborator implementations
// ============================================================================

#[async_trait]
impl IdentityService for CdiClient {
    async fn issue_token(
        &self,
        ctx: &RequestContext,
        secret: &IdentitySecret,
    ) -> Result<String, ClientError> {
        let url = self.url(&[
            "id_manager",
            "realms",
            &secret.realm,
            "protocol",
            "openid-connect",
            "token",
        ])?;

        let form = [
            ("grant_type", "password"),
            ("username", secret.username.as_str()),
            ("password", secret.password.as_str()),
            ("client_id", secret.client_id.as_str()),
            ("client_secret", secret.client_secret.as_str()),
        ];

        let request = self
            .http
            .post(url)
            .header(REQUEST_ID_HEADER, ctx.request_id())
            .form(&form);

        let response = ctx
            .run(request.send())
            .await?
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let token: TokenResponse = decode(ctx, response).await?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl FabricInventory for CdiClient {
    async fn list_machines(&self, ctx: &RequestContext) -> Result<Vec<FabricMachine>, ClientError> {
        debug!(
            "Trying to get machine list from fabric inventory, requestID={}",
            ctx.request_id()
        );
        let url = self.url(&["fabric_manager", "api", "v1", "machines"])?;
        let list: MachineList = self.get_json(ctx, url).await.map_err(|e| {
            error!(
                "Fabric machine list API failed, requestID={}: {}",
                ctx.request_id(),
                e
            );
            e
        })?;
        debug!(
            "Fabric machine list API completed successfully, requestID={}",
            ctx.request_id()
        );
        Ok(list.data.machines)
    }

    async fn available_count(
        &self,
        ctx: &RequestContext,
        machine_uuid: &str,
        model: &str,
    ) -> Result<u32, ClientError> {
        debug!(
            "Trying to get available reserved resources, machineUUID={}, model={}, requestID={}",
            machine_uuid,
            model,
            ctx.request_id()
        );
        let mut url = self.url(&[
            "fabric_manager",
            "api",
            "v1",
            "machines",
            machine_uuid,
            "available-reserved-resources",
        ])?;
        url.query_pairs_mut()
            .append_pair("res_type", RESOURCE_TYPE)
            .append_pair("model", model);

        let resources: AvailableReservedResources =
            self.get_json(ctx, url).await.map_err(|e| {
                error!(
                    "Fabric available reserved resources API failed, requestID={}: {}",
                    ctx.request_id(),
                    e
                );
                e
            })?;
        debug!(
            "Fabric available reserved resources API completed successfully, requestID={}",
            ctx.request_id()
        );
        Ok(resources.reserved_resource_num)
    }
}

#[async_trait]
impl ClusterPolicy for CdiClient {
    async fn list_node_groups(&self, ctx: &RequestContext) -> Result<Vec<NodeGroup>, ClientError> {
        debug!(
            "Trying to get node groups from cluster policy service, requestID={}",
            ctx.request_id()
        );
        let (tenant, cluster) = (self.tenant_id.to_string(), self.cluster_id.to_string());
        let mut segments = self.cluster_manager_path(&tenant, &cluster);
        segments.push("nodegroups");
        let url = self.url(&segments)?;

        let list: NodeGroupList = self.get_json(ctx, url).await.map_err(|e| {
            error!("Node groups API failed, requestID={}: {}", ctx.request_id(), e);
            e
        })?;
        debug!(
            "Node groups API completed successfully, requestID={}",
            ctx.request_id()
        );
        Ok(list.node_groups)
    }

    async fn node_group_members(
        &self,
        ctx: &RequestContext,
        group: &NodeGroup,
    ) -> Result<NodeGroupInfo, ClientError> {
        debug!(
            "Trying to get node group info, nodeGroup={}, requestID={}",
            group.name,
            ctx.request_id()
        );
        let (tenant, cluster) = (self.tenant_id.to_string(), self.cluster_id.to_string());
        let mut segments = self.cluster_manager_path(&tenant, &cluster);
        segments.extend(["nodegroups", group.uuid.as_str()]);
        let url = self.url(&segments)?;

        let info: NodeGroupInfo = self.get_json(ctx, url).await.map_err(|e| {
            error!(
                "Node group info API failed, requestID={}: {}",
                ctx.request_id(),
                e
            );
            e
        })?;
        debug!(
            "Node group info API completed successfully, requestID={}",
            ctx.request_id()
        );
        Ok(info)
    }

    async fn node_details(
        &self,
        ctx: &RequestContext,
        machine_uuid: &str,
    ) -> Result<NodeDetails, ClientError> {
        debug!(
            "Trying to get node details, machineUUID={}, requestID={}",
            machine_uuid,
            ctx.request_id()
        );
        let (tenant, cluster) = (self.tenant_id.to_string(), self.cluster_id.to_string());
        let mut segments = self.cluster_manager_path(&tenant, &cluster);
        segments.extend(["machines", machine_uuid]);
        let url = self.url(&segments)?;

        let details: NodeDetails = self.get_json(ctx, url).await.map_err(|e| {
            error!(
                "Node details API failed, requestID={}: {}",
                ctx.request_id(),
                e
            );
            e
        })?;
        debug!(
            "Node details API completed successfully, requestID={}",
            ctx.request_id()
        );
        Ok(details)
    }
}
