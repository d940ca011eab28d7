//! Registry CRD
//!
//! A Registry names a container image registry (`host:port`) and the Secret
//! holding its CA certificate. The operator copies that certificate into the
//! docker and podman trust stores of every node and removes it again when the
//! reference is cleared or the Registry is deleted.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::sanitize_dns_label;
use crate::{Error, INSTALLER_PREFIX};

/// Longest sanitized `hostPort` that still fits the install job name
/// (`<prefix>-<address>`) within the 63-character DNS label limit
pub const MAX_ADDRESS_ID_LEN: usize = 63 - (INSTALLER_PREFIX.len() + 1);

/// Registry describes a container image registry whose CA must be trusted
/// by every node in the cluster.
///
/// Example:
/// ```yaml
/// apiVersion: kubic.opensuse.org/v1beta1
/// kind: Registry
/// metadata:
///   name: foo
/// spec:
///   hostPort: foo.com:5000
///   certificate:
///     name: foo-ca-crt
///     namespace: kube-system
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubic.opensuse.org",
    version = "v1beta1",
    kind = "Registry",
    plural = "registries",
    status = "RegistryStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"HostPort","type":"string","jsonPath":".spec.hostPort"}"#,
    printcolumn = r#"{"name":"Hash","type":"string","jsonPath":".status.certificate.currentHash","priority":1}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.certificate.numNodes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Registry address as used in image references (e.g. "foo.com:5000")
    pub host_port: String,

    /// Secret holding the registry CA under the `ca.crt` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRef>,
}

/// Reference to the Secret carrying the registry CA
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    /// Secret name
    pub name: String,

    /// Secret namespace (defaults to the operator's job namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Registry status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    /// State of the certificate on the nodes
    #[serde(default)]
    pub certificate: CertificateStatus,
}

/// What has been confirmed installed on the nodes.
///
/// `num_nodes > 0` always implies a non-empty `current_hash`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// Fingerprint of the certificate fully installed on the nodes, empty if none
    #[serde(default)]
    pub current_hash: String,

    /// Number of nodes confirmed to hold `current_hash`
    #[serde(default)]
    pub num_nodes: u32,
}

impl CertificateStatus {
    /// True when some certificate is recorded as installed
    pub fn is_installed(&self) -> bool {
        !self.current_hash.is_empty()
    }

    /// Forget whatever was installed
    pub fn clear(&mut self) {
        self.current_hash.clear();
        self.num_nodes = 0;
    }

    /// Record a confirmed installation.
    ///
    /// A zero node count records nothing, keeping the status invariant.
    pub fn record(&mut self, hash: impl Into<String>, num_nodes: u32) {
        if num_nodes == 0 {
            self.clear();
            return;
        }
        self.current_hash = hash.into();
        self.num_nodes = num_nodes;
    }
}

impl RegistrySpec {
    /// Validate the spec.
    ///
    /// `hostPort` is interpolated into node-side shell commands and paths,
    /// so only characters legal in `host[:port]` (including bracketed IPv6)
    /// are accepted. Its sanitized form names the per-node jobs and must fit
    /// in [`MAX_ADDRESS_ID_LEN`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.host_port.is_empty() {
            return Err(Error::validation("hostPort must not be empty"));
        }
        if let Some(bad) = self
            .host_port
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']')))
        {
            return Err(Error::validation(format!(
                "hostPort {:?} contains invalid character {:?}",
                self.host_port, bad
            )));
        }
        if self.host_port.starts_with('-') || self.host_port.starts_with('.') {
            return Err(Error::validation(format!(
                "hostPort {:?} must start with a host name or address",
                self.host_port
            )));
        }
        let address_id = sanitize_dns_label(&self.host_port);
        if address_id.is_empty() {
            return Err(Error::validation(format!(
                "hostPort {:?} has no letters or digits to name its jobs after",
                self.host_port
            )));
        }
        if address_id.len() > MAX_ADDRESS_ID_LEN {
            return Err(Error::validation(format!(
                "hostPort {:?} is too long: job names allow {} characters for the address, \
                 {:?} has {}",
                self.host_port,
                MAX_ADDRESS_ID_LEN,
                address_id,
                address_id.len()
            )));
        }
        if let Some(cert) = &self.certificate {
            if cert.name.is_empty() {
                return Err(Error::validation("certificate.name must not be empty"));
            }
        }
        Ok(())
    }
}

impl Registry {
    /// Validate the spec, attributing errors to this Registry
    pub fn validate(&self) -> Result<(), Error> {
        self.spec.validate().map_err(|e| match e {
            Error::Validation { message, .. } => Error::validation_for(self.name_any(), message),
            other => other,
        })
    }

    /// Certificate status, or the empty status when none has been written yet
    pub fn certificate_status(&self) -> CertificateStatus {
        self.status
            .as_ref()
            .map(|s| s.certificate.clone())
            .unwrap_or_default()
    }

    /// Mutable certificate status, created on first use
    pub fn certificate_status_mut(&mut self) -> &mut CertificateStatus {
        &mut self.status.get_or_insert_with(RegistryStatus::default).certificate
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Namespace of the certificate Secret, falling back to `default_namespace`
    pub fn certificate_namespace<'a>(&'a self, default_namespace: &'a str) -> Option<&'a str> {
        self.spec
            .certificate
            .as_ref()
            .map(|c| c.namespace.as_deref().unwrap_or(default_namespace))
    }

    /// Build a Registry with a certificate reference, for tests and fixtures
    pub fn test_fixture(name: &str, host_port: &str, secret: &str, namespace: &str) -> Self {
        let mut registry = Registry::new(
            name,
            RegistrySpec {
                host_port: host_port.to_string(),
                certificate: Some(CertificateRef {
                    name: secret.to_string(),
                    namespace: Some(namespace.to_string()),
                }),
            },
        );
        registry.metadata.uid = Some(format!("uid-{}", name));
        registry
    }
}
