//! Device catalog and label prefix parsed from the cluster config map
//!
//! The config map carries two keys:
//! - `device-info`: a YAML list describing every composable device model the
//!   fabric can supply and which DRA driver advertises it
//! - `label-prefix`: the DNS subdomain used as prefix for every node label
//!   and node selector key this process writes
//!
//! A missing config map, missing data or missing key is not an error (the
//! process runs with an empty catalog); anything present must validate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub const DEVICE_INFO_KEY: &str = "device-info";
pub const LABEL_PREFIX_KEY: &str = "label-prefix";

const MAX_INDEX: i64 = 10_000;
const MAX_MODEL_NAME_LEN: usize = 1000;
const MAX_DRIVER_NAME_LEN: usize = 1000;
const MAX_DEVICE_NAME_LEN: usize = 50;
const MAX_ATTRIBUTES: usize = 100;
const MAX_ATTRIBUTE_LEN: usize = 1000;
const MAX_COEXIST_ENTRIES: usize = 100;
const MAX_LABEL_PREFIX_LEN: usize = 100;

const DNS1123_LABEL_MAX_LEN: usize = 63;
const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;

static DNS1123_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

static DNS1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid regex")
});

/// Errors raised while reading the device catalog
#[derive(Error, Debug, PartialEq)]
pub enum CatalogError {
    #[error("Failed to parse device-info: {0}")]
    ParseError(String),

    #[error("Invalid device-info entry {index}: {field} {reason}")]
    InvalidEntry {
        index: i64,
        field: &'static str,
        reason: String,
    },

    #[error("Invalid label-prefix '{prefix}': {reason}")]
    InvalidLabelPrefix { prefix: String, reason: String },
}

/// One device model the fabric can supply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceInfo {
    /// Catalog index, referenced by `cannot-coexists-with`
    pub index: i64,

    /// Model name as registered in the fabric inventory
    pub cdi_model_name: String,

    /// Attributes exposed on every published device of this model
    pub dra_attributes: BTreeMap<String, String>,

    /// DRA driver advertising this model
    pub driver_name: String,

    /// Pool name stem and node label stem, usually "<vendor>-<model>"
    pub k8s_device_name: String,

    /// Indexes of models that cannot be attached to the same node
    #[serde(rename = "cannot-coexists-with")]
    pub cannot_coexist_with: Vec<i64>,
}

impl DeviceInfo {
    /// Check every field against its bound
    pub fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |field: &'static str, reason: String| CatalogError::InvalidEntry {
            index: self.index,
            field,
            reason,
        };

        if !(0..=MAX_INDEX).contains(&self.index) {
            return Err(invalid("index", format!("must be within 0..={}", MAX_INDEX)));
        }
        if self.cdi_model_name.len() > MAX_MODEL_NAME_LEN {
            return Err(invalid(
                "cdi-model-name",
                format!("exceeds {} bytes", MAX_MODEL_NAME_LEN),
            ));
        }
        if self.dra_attributes.len() > MAX_ATTRIBUTES {
            return Err(invalid(
                "dra-attributes",
                format!("has more than {} entries", MAX_ATTRIBUTES),
            ));
        }
        for (key, value) in &self.dra_attributes {
            if key.len() > MAX_ATTRIBUTE_LEN || value.len() > MAX_ATTRIBUTE_LEN {
                return Err(invalid(
                    "dra-attributes",
                    format!("entry '{}' exceeds {} bytes", key, MAX_ATTRIBUTE_LEN),
                ));
            }
        }
        if self.driver_name.len() > MAX_DRIVER_NAME_LEN {
            return Err(invalid(
                "driver-name",
                format!("exceeds {} bytes", MAX_DRIVER_NAME_LEN),
            ));
        }
        if self.k8s_device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(invalid(
                "k8s-device-name",
                format!("exceeds {} bytes", MAX_DEVICE_NAME_LEN),
            ));
        }
        if let Err(reason) = validate_dns_label(&self.k8s_device_name) {
            return Err(invalid("k8s-device-name", reason));
        }
        if self.cannot_coexist_with.len() > MAX_COEXIST_ENTRIES {
            return Err(invalid(
                "cannot-coexists-with",
                format!("has more than {} entries", MAX_COEXIST_ENTRIES),
            ));
        }
        Ok(())
    }
}

/// The validated catalog plus label prefix
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub devices: Vec<DeviceInfo>,
    pub label_prefix: String,
}

impl Catalog {
    /// Build the catalog from config map data (`None` when the map is absent)
    pub fn from_config_map(data: Option<&BTreeMap<String, String>>) -> Result<Self, CatalogError> {
        let Some(data) = data else {
            warn!("Device config map not found, running with an empty catalog");
            return Ok(Self::default());
        };
        Ok(Self {
            devices: parse_device_infos(data)?,
            label_prefix: parse_label_prefix(data)?,
        })
    }

    /// Distinct driver names referenced by the catalog
    pub fn driver_names(&self) -> BTreeSet<String> {
        self.devices.iter().map(|d| d.driver_name.clone()).collect()
    }
}

/// Parse and validate the `device-info` key
pub fn parse_device_infos(
    data: &BTreeMap<String, String>,
) -> Result<Vec<DeviceInfo>, CatalogError> {
    let Some(raw) = data.get(DEVICE_INFO_KEY) else {
        warn!("Config map has no {} key", DEVICE_INFO_KEY);
        return Ok(Vec::new());
    };

    let infos: Vec<DeviceInfo> = serde_yaml::from_str(raw).map_err(|e| {
        error!("Failed to parse {}: {}", DEVICE_INFO_KEY, e);
        CatalogError::ParseError(e.to_string())
    })?;

    for info in &infos {
        info.validate()?;
    }
    Ok(infos)
}

/// Parse and validate the `label-prefix` key
pub fn parse_label_prefix(data: &BTreeMap<String, String>) -> Result<String, CatalogError> {
    let Some(prefix) = data.get(LABEL_PREFIX_KEY) else {
        warn!("Config map has no {} key", LABEL_PREFIX_KEY);
        return Ok(String::new());
    };

    let invalid = |reason: String| {
        error!("Validation error for {}: {}", LABEL_PREFIX_KEY, reason);
        CatalogError::InvalidLabelPrefix {
            prefix: prefix.clone(),
            reason,
        }
    };

    if prefix.len() > MAX_LABEL_PREFIX_LEN {
        return Err(invalid(format!("exceeds {} bytes", MAX_LABEL_PREFIX_LEN)));
    }
    validate_dns_subdomain(prefix).map_err(invalid)?;
    Ok(prefix.clone())
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 characters
pub fn validate_dns_label(value: &str) -> Result<(), String> {
    if value.len() > DNS1123_LABEL_MAX_LEN {
        return Err(format!(
            "must be no more than {} characters",
            DNS1123_LABEL_MAX_LEN
        ));
    }
    if !DNS1123_LABEL.is_match(value) {
        return Err(
            "must be a DNS-1123 label (lowercase alphanumerics or '-', alphanumeric at both ends)"
                .to_string(),
        );
    }
    Ok(())
}

/// RFC 1123 subdomain: dot-separated labels, at most 253 characters
pub fn validate_dns_subdomain(value: &str) -> Result<(), String> {
    if value.len() > DNS1123_SUBDOMAIN_MAX_LEN {
        return Err(format!(
            "must be no more than {} characters",
            DNS1123_SUBDOMAIN_MAX_LEN
        ));
    }
    if !DNS1123_SUBDOMAIN.is_match(value) {
        return Err("must be a DNS-1123 subdomain".to_string());
    }
    Ok(())
}
