//! Registry reconciliation entry point
//!
//! Each pass re-reads the Registry from the API, makes sure it carries the
//! finalizer, takes a node count snapshot and dispatches to the install or
//! removal state machine. Status is persisted first, then a completed
//! finalizer is released.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use registries_common::crd::{CertificateRef, Registry, RegistryStatus};
use registries_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use registries_common::kube_utils::has_finalizer;
use registries_common::{
    Error, CA_CRT_KEY, DEFAULT_JOB_IMAGE, DEFAULT_JOB_NAMESPACE, OPERATOR_NAME,
    REGISTRY_FINALIZER,
};

use crate::finalizer::{finalizer_done, is_finalizing};
use crate::kube_client::{KubeClient, KubeClientImpl};
use crate::reconciler::{CertDistributor, CertReconciler, ResolvedCertificate};

/// Requeue interval after a successful pass, to catch drift
pub const REQUEUE_SUCCESS_SECS: u64 = 300;
/// Requeue interval after a job name collision
pub const REQUEUE_CONFLICT_SECS: u64 = 5;
/// Requeue interval after any other error
pub const REQUEUE_ERROR_SECS: u64 = 30;

/// Operator-wide settings for the jobs it launches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace for removal jobs and for certificate references without one
    pub job_namespace: String,
    /// Image running the install/remove commands
    pub job_image: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            job_namespace: DEFAULT_JOB_NAMESPACE.to_string(),
            job_image: DEFAULT_JOB_IMAGE.to_string(),
        }
    }
}

/// Controller context shared by all reconciliation passes
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event sink for user-visible state transitions
    pub events: Arc<dyn EventPublisher>,
    /// Install/removal state machines
    pub reconciler: Arc<dyn CertReconciler>,
    /// Job settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context with default settings
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        reconciler: Arc<dyn CertReconciler>,
    ) -> Self {
        Self {
            kube,
            events,
            reconciler,
            config: ControllerConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    reconciler: Option<Arc<dyn CertReconciler>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
            reconciler: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the job settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the certificate reconciler
    pub fn cert_reconciler(mut self, reconciler: Arc<dyn CertReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let events = self
            .events
            .unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), OPERATOR_NAME))
            });
        let reconciler = self.reconciler.unwrap_or_else(|| {
            Arc::new(CertDistributor::new(
                kube.clone(),
                events.clone(),
                self.config.clone(),
            ))
        });
        Context {
            kube,
            events,
            reconciler,
            config: self.config,
        }
    }
}

/// Reconcile a Registry
///
/// The cached object only provides the key: the Registry is fetched again so
/// decisions are made on the latest status.
///
/// # Returns
///
/// `Action::requeue` after a successful pass, `Action::await_change` when the
/// Registry is gone, rejected, or released for deletion.
#[instrument(skip(registry, ctx), fields(registry = %registry.name_any()))]
pub async fn reconcile(registry: Arc<Registry>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = registry.name_any();
    info!("reconciling registry");

    let Some(mut current) = ctx.kube.get_registry(&name).await? else {
        debug!("registry no longer exists");
        return Ok(Action::await_change());
    };

    let deleting = current.is_deleting();
    if deleting && !is_finalizing(&current) {
        debug!("registry is being deleted and holds no finalizer of ours");
        return Ok(Action::await_change());
    }

    if !deleting {
        if let Err(e) = current.validate() {
            return reject(&ctx, &current.object_ref(&()), e).await;
        }
        if !has_finalizer(&current, REGISTRY_FINALIZER) {
            ctx.kube.add_finalizer(&name, REGISTRY_FINALIZER).await?;
            current
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(REGISTRY_FINALIZER.to_string());
            debug!("added finalizer");
        }
    }

    let nodes = ctx.kube.count_nodes().await?;
    let original_status = current.status.clone();
    let installed = current.certificate_status();

    if deleting {
        if installed.is_installed() {
            debug!(nodes, "finalizing, removing certificate from nodes");
            ctx.reconciler
                .reconcile_cert_missing(&mut current, nodes)
                .await?;
        } else {
            debug!("finalizing, nothing installed");
            finalizer_done(&mut current);
        }
    } else if let Some(cert_ref) = current.spec.certificate.clone() {
        let cert = match resolve_certificate(&ctx, &name, &cert_ref).await {
            Ok(cert) => cert,
            Err(e @ Error::Validation { .. }) => {
                return reject(&ctx, &current.object_ref(&()), e).await;
            }
            Err(e) => return Err(e),
        };
        debug!(nodes, "certificate configured, installing");
        ctx.reconciler
            .reconcile_cert_present(&mut current, nodes, &cert)
            .await?;
    } else if installed.is_installed() {
        debug!(nodes, "certificate reference removed, removing from nodes");
        ctx.reconciler
            .reconcile_cert_missing(&mut current, nodes)
            .await?;
    } else {
        debug!("no certificate configured or installed");
    }

    persist(&ctx, &name, original_status.as_ref(), &current).await
}

/// Error policy: requeue soon after a job collision, later otherwise
pub fn error_policy(registry: Arc<Registry>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_already_exists() {
        warn!(
            error = %error,
            registry = %registry.name_any(),
            "job still present, retrying shortly"
        );
        return Action::requeue(Duration::from_secs(REQUEUE_CONFLICT_SECS));
    }

    error!(
        ?error,
        registry = %registry.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

/// Read `ca.crt` from the referenced Secret
async fn resolve_certificate(
    ctx: &Context,
    registry: &str,
    cert_ref: &CertificateRef,
) -> Result<ResolvedCertificate, Error> {
    let namespace = cert_ref
        .namespace
        .clone()
        .unwrap_or_else(|| ctx.config.job_namespace.clone());

    let secret = ctx
        .kube
        .get_secret(&cert_ref.name, &namespace)
        .await?
        .ok_or_else(|| Error::certificate_not_found(registry, &cert_ref.name, &namespace))?;

    let ca_crt = secret
        .data
        .as_ref()
        .and_then(|data| data.get(CA_CRT_KEY))
        .map(|bytes| bytes.0.clone())
        .ok_or_else(|| {
            Error::validation_for(
                registry,
                format!(
                    "secret {}/{} has no {} key",
                    namespace, cert_ref.name, CA_CRT_KEY
                ),
            )
        })?;

    Ok(ResolvedCertificate {
        secret_name: cert_ref.name.clone(),
        namespace,
        ca_crt,
    })
}

/// Surface a spec problem and wait for the user to fix it
async fn reject(ctx: &Context, obj_ref: &ObjectReference, error: Error) -> Result<Action, Error> {
    warn!(error = %error, "registry rejected");
    ctx.events
        .publish(
            obj_ref,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            Some(error.to_string()),
        )
        .await;
    Ok(Action::await_change())
}

/// Save the status, then release the finalizer if it was completed.
///
/// A Registry that vanished in the meantime is not an error.
async fn persist(
    ctx: &Context,
    name: &str,
    original_status: Option<&RegistryStatus>,
    current: &Registry,
) -> Result<Action, Error> {
    if let Some(status) = current.status.as_ref() {
        if Some(status) != original_status {
            match ctx.kube.patch_status(name, status).await {
                Ok(()) => debug!(
                    hash = %status.certificate.current_hash,
                    nodes = status.certificate.num_nodes,
                    "status updated"
                ),
                Err(e) if e.is_not_found() => {
                    debug!("registry deleted before status could be saved");
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e),
            }
        }
    }

    if current.is_deleting() && !has_finalizer(current, REGISTRY_FINALIZER) {
        match ctx.kube.remove_finalizer(name, REGISTRY_FINALIZER).await {
            Ok(()) => info!("certificate cleanup complete, finalizer removed"),
            Err(e) if e.is_not_found() => debug!("registry already gone"),
            Err(e) => return Err(e),
        }
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)))
}
