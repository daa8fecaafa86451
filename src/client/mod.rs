//! Clients for the composable-infrastructure services
//!
//! Three collaborators sit behind one API gateway:
//! - the fabric inventory (machines, fabric membership, free devices)
//! - the cluster policy service (node groups and their device quotas)
//! - the identity service (bearer tokens for the other two)
//!
//! Each is a trait so the reconciliation engine can be driven by in-memory
//! fakes in tests; `CdiClient` is the HTTP implementation of all three.

pub mod cdi;
pub mod token;
pub mod types;

pub use cdi::CdiClient;
pub use token::{Credential, CredentialCache, IdentityTokenSource, TokenError, TokenSource};
pub use types::{DeviceBounds, FabricMachine, NodeDetails, NodeGroup, NodeGroupInfo};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::IdentitySecret;
use crate::context::{Cancelled, RequestContext};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("No credential available: {0}")]
    Credential(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<Cancelled> for ClientError {
    fn from(_: Cancelled) -> Self {
        ClientError::Cancelled
    }
}

// ============================================================================
// Collaborator seams
// ============================================================================

#[async_trait]
pub trait FabricInventory: Send + Sync {
    /// Every machine the inventory knows, with its fabric membership
    async fn list_machines(&self, ctx: &RequestContext) -> Result<Vec<FabricMachine>, ClientError>;

    /// Free devices of `model` in the fabric `machine_uuid` belongs to
    async fn available_count(
        &self,
        ctx: &RequestContext,
        machine_uuid: &str,
        model: &str,
    ) -> Result<u32, ClientError>;
}

#[async_trait]
pub trait ClusterPolicy: Send + Sync {
    async fn list_node_groups(&self, ctx: &RequestContext) -> Result<Vec<NodeGroup>, ClientError>;

    async fn node_group_members(
        &self,
        ctx: &RequestContext,
        group: &NodeGroup,
    ) -> Result<NodeGroupInfo, ClientError>;

    async fn node_details(
        &self,
        ctx: &RequestContext,
        machine_uuid: &str,
    ) -> Result<NodeDetails, ClientError>;
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Exchange credentials for a bearer token (a JWT)
    async fn issue_token(
        &self,
        ctx: &RequestContext,
        secret: &IdentitySecret,
    ) -> Result<String, ClientError>;
}
