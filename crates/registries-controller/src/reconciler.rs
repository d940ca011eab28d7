//! The certificate reconciler capability
//!
//! The entry point drives the install and removal state machines through
//! [`CertReconciler`]. [`CertDistributor`] implements it with per-node jobs;
//! its state machines live in [`crate::installer`] and [`crate::remover`].

use std::sync::Arc;

use async_trait::async_trait;

use registries_common::crd::Registry;
use registries_common::events::EventPublisher;
use registries_common::Error;

use crate::controller::ControllerConfig;
use crate::kube_client::KubeClient;

/// Certificate payload resolved from the referenced Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedCertificate {
    /// Secret name, mounted into the install job
    pub secret_name: String,
    /// Secret namespace; the install job runs here
    pub namespace: String,
    /// The `ca.crt` bytes
    pub ca_crt: Vec<u8>,
}

/// Decides and drives certificate installation and removal for one Registry.
///
/// Both operations mutate the Registry in memory only (status, and the
/// finalizer list once removal completes); the caller persists the result.
#[async_trait]
pub trait CertReconciler: Send + Sync {
    /// Make every node trust `cert` for the registry address
    async fn reconcile_cert_present(
        &self,
        registry: &mut Registry,
        nodes: u32,
        cert: &ResolvedCertificate,
    ) -> Result<(), Error>;

    /// Remove the recorded certificate from every node
    async fn reconcile_cert_missing(&self, registry: &mut Registry, nodes: u32)
        -> Result<(), Error>;
}

/// Distributes certificates with per-node jobs
pub struct CertDistributor {
    pub(crate) kube: Arc<dyn KubeClient>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) config: ControllerConfig,
}

impl CertDistributor {
    /// Create a distributor using the given cluster client and event sink
    pub fn new(
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            events,
            config,
        }
    }
}

#[async_trait]
impl CertReconciler for CertDistributor {
    async fn reconcile_cert_present(
        &self,
        registry: &mut Registry,
        nodes: u32,
        cert: &ResolvedCertificate,
    ) -> Result<(), Error> {
        self.install(registry, nodes, cert).await
    }

    async fn reconcile_cert_missing(
        &self,
        registry: &mut Registry,
        nodes: u32,
    ) -> Result<(), Error> {
        self.remove(registry, nodes).await
    }
}
