//! Custom Resource Definitions for the registries operator

mod registry;

pub use registry::{
    CertificateRef, CertificateStatus, Registry, RegistrySpec, RegistryStatus,
};
