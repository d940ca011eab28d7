//! Common types for the registries operator: the Registry CRD, errors,
//! event publishing, certificate hashing and telemetry setup.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod hash;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Name reported as the event source and used as the SSA field manager
pub const OPERATOR_NAME: &str = "registries-operator";

/// Finalizer that blocks Registry deletion until the certificate is removed from every node
pub const REGISTRY_FINALIZER: &str = "registry.finalizers.kubic.opensuse.org";

/// Namespace where removal jobs run and where unqualified certificate references resolve
pub const DEFAULT_JOB_NAMESPACE: &str = "kube-system";

/// Image used for the per-node installer/remover containers
pub const DEFAULT_JOB_IMAGE: &str = "busybox:latest";

/// Label key marking resources created by this operator
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Label selector for jobs created by this operator (for watch filtering)
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=registries-operator";

/// Key inside the certificate Secret holding the registry CA
pub const CA_CRT_KEY: &str = "ca.crt";

/// Name prefix of install jobs
pub const INSTALLER_PREFIX: &str = "kubic-registry-installer";

/// Name prefix of removal jobs
pub const REMOVER_PREFIX: &str = "kubic-registry-remover";
