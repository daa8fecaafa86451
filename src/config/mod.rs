pub mod catalog;
pub mod secrets;

pub use catalog::{Catalog, CatalogError, DeviceInfo};
pub use secrets::{IdentitySecret, SecretError};

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Namespace holding the device config map and identity secret
pub const DRA_NAMESPACE: &str = "composable-dra";

/// Config map with the device catalog and label prefix
pub const CONFIG_MAP_NAME: &str = "composable-dra-dds";

/// Secret with the identity-service credentials
pub const SECRET_NAME: &str = "composable-dra-secret";

/// Default interval between reconciliation passes
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;

/// Upper bound for the device binding timeout, in seconds
pub const MAX_BINDING_TIMEOUT_SECS: i64 = 86_400;

/// Fatal configuration errors; these abort startup and are never retried
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be a UUID, got '{value}'")]
    InvalidUuid { field: &'static str, value: String },

    #[error("binding timeout must be set from 0 to 86400, got {0}")]
    InvalidBindingTimeout(i64),

    #[error("scan interval must be at least one second")]
    InvalidScanInterval,

    #[error("endpoint must be a host name, got '{0}'")]
    InvalidEndpoint(String),

    #[error("Device catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Identity secret error: {0}")]
    Secret(#[from] SecretError),
}

/// Validated process options
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Time between the start of consecutive passes
    pub scan_interval: Duration,

    /// Tenant the cluster belongs to
    pub tenant_id: Uuid,

    /// Cluster this process runs in
    pub cluster_id: Uuid,

    /// Host (optionally with port) of the composable-infrastructure API
    pub cdi_endpoint: String,

    /// Resolve machine UUIDs through BareMetalHost annotations
    pub use_capi_bmh: bool,

    /// Query node groups for per-model min/max device counts
    pub use_cluster_manager: bool,

    /// Binding timeout advertised on every published device
    pub binding_timeout: Option<i64>,
}

impl Config {
    /// Validate raw option values
    pub fn new(
        scan_interval_secs: u64,
        tenant_id: &str,
        cluster_id: &str,
        cdi_endpoint: &str,
        use_capi_bmh: bool,
        use_cluster_manager: bool,
        binding_timeout: Option<i64>,
    ) -> Result<Self, ConfigError> {
        if scan_interval_secs == 0 {
            return Err(ConfigError::InvalidScanInterval);
        }
        if let Some(timeout) = binding_timeout {
            if !(0..=MAX_BINDING_TIMEOUT_SECS).contains(&timeout) {
                return Err(ConfigError::InvalidBindingTimeout(timeout));
            }
        }

        let endpoint = cdi_endpoint.trim();
        if endpoint.is_empty() || endpoint.contains("://") || endpoint.contains('/') {
            return Err(ConfigError::InvalidEndpoint(cdi_endpoint.to_string()));
        }

        Ok(Self {
            scan_interval: Duration::from_secs(scan_interval_secs),
            tenant_id: parse_uuid("tenant-id", tenant_id)?,
            cluster_id: parse_uuid("cluster-id", cluster_id)?,
            cdi_endpoint: endpoint.to_string(),
            use_capi_bmh,
            use_cluster_manager,
            binding_timeout,
        })
    }
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(value).map_err(|_| ConfigError::InvalidUuid {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "00000000-0000-0000-0000-000000000001";
    const CLUSTER: &str = "00000000-0000-0000-0000-000000000002";

    #[test]
    fn test_valid_config() {
        let config = Config::new(60, TENANT, CLUSTER, "cdi.example.com", false, true, Some(600))
            .unwrap();

        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.cdi_endpoint, "cdi.example.com");
        assert!(config.use_cluster_manager);
        assert_eq!(config.binding_timeout, Some(600));
    }

    #[test]
    fn test_invalid_tenant() {
        let result = Config::new(60, "tenant", CLUSTER, "cdi", false, false, None);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidUuid {
                field: "tenant-id",
                ..
            })
        ));
    }

    #[test]
    fn test_binding_timeout_bounds() {
        assert!(Config::new(60, TENANT, CLUSTER, "cdi", false, false, Some(0)).is_ok());
        assert!(Config::new(60, TENANT, CLUSTER, "cdi", false, false, Some(86_400)).is_ok());
        assert!(matches!(
            Config::new(60, TENANT, CLUSTER, "cdi", false, false, Some(86_401)),
            Err(ConfigError::InvalidBindingTimeout(86_401))
        ));
        assert!(matches!(
            Config::new(60, TENANT, CLUSTER, "cdi", false, false, Some(-1)),
            Err(ConfigError::InvalidBindingTimeout(-1))
        ));
    }

    #[test]
    fn test_endpoint_must_be_host() {
        let result = Config::new(60, TENANT, CLUSTER, "https://cdi", false, false, None);
        assert!(matches!(result, Err(ConfigError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_zero_interval() {
        let result = Config::new(0, TENANT, CLUSTER, "cdi", false, false, None);
        assert!(matches!(result, Err(ConfigError::InvalidScanInterval)));
    }
}
