//! Identity-service credentials loaded from the cluster secret
//!
//! The secret carries the resource-owner credentials used to obtain bearer
//! tokens plus an optional CA bundle trusted for the service endpoint. Every
//! field is bounded; an oversized field is a configuration error rather than
//! something to truncate.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::warn;

/// Upper bound (exclusive) for the credential fields, in bytes
pub const ACCESS_INFO_MAX_LEN: usize = 1000;

/// Upper bound (exclusive) for the CA bundle, in bytes
pub const CERTIFICATE_MAX_LEN: usize = 10_000;

/// Errors while reading the identity secret
#[derive(Error, Debug, PartialEq)]
pub enum SecretError {
    #[error("{0} length exceeds the limitation")]
    FieldTooLong(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidEncoding(&'static str),
}

/// Credentials for the identity service
#[derive(Clone, Default, PartialEq)]
pub struct IdentitySecret {
    pub username: String,
    pub password: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    /// PEM encoded CA bundle for the service endpoint
    pub certificate: Option<String>,
}

impl fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySecret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("certificate", &self.certificate.as_ref().map(|_| "<pem>"))
            .finish()
    }
}

impl IdentitySecret {
    /// Build the credentials from secret data (`None` when the secret is absent)
    pub fn from_secret_data(data: Option<&BTreeMap<String, Vec<u8>>>) -> Result<Self, SecretError> {
        let Some(data) = data else {
            warn!("Identity secret not found, using empty credentials");
            return Ok(Self::default());
        };

        let certificate = match data.get("certificate") {
            Some(bytes) if !bytes.is_empty() => {
                Some(bounded_field(data, "certificate", CERTIFICATE_MAX_LEN)?)
            }
            _ => None,
        };

        Ok(Self {
            username: bounded_field(data, "username", ACCESS_INFO_MAX_LEN)?,
            password: bounded_field(data, "password", ACCESS_INFO_MAX_LEN)?,
            realm: bounded_field(data, "realm", ACCESS_INFO_MAX_LEN)?,
            client_id: bounded_field(data, "client_id", ACCESS_INFO_MAX_LEN)?,
            client_secret: bounded_field(data, "client_secret", ACCESS_INFO_MAX_LEN)?,
            certificate,
        })
    }
}

/// Read one field, treating a missing key as empty
fn bounded_field(
    data: &BTreeMap<String, Vec<u8>>,
    key: &'static str,
    max_len: usize,
) -> Result<String, SecretError> {
    let bytes = data.get(key).map(Vec::as_slice).unwrap_or_default();
    if bytes.len() >= max_len {
        return Err(SecretError::FieldTooLong(key));
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| SecretError::InvalidEncoding(key))
}
