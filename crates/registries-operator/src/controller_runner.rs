//! Controller runner - wires the Registry controller to its watches

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use registries_common::crd::Registry;
use registries_common::MANAGED_BY_SELECTOR;
use registries_controller::mappers::{
    all_registries, registries_for_secret, registry_for_job, NodeTracker,
};
use registries_controller::{error_policy, reconcile, Context, ControllerConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the Registry controller until a shutdown signal arrives
///
/// Besides Registries themselves, reconciliation is triggered by:
/// - Secrets referenced by a Registry (certificate rotation)
/// - newly joined Nodes (every Registry must reach them)
/// - operator-managed Jobs (progress and completion)
pub async fn run(client: Client, config: ControllerConfig) {
    let default_namespace = config.job_namespace.clone();
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let registries: Api<Registry> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client);

    let controller = Controller::new(
        registries,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let store = controller.store();
    let node_store = store.clone();
    let tracker = Arc::new(NodeTracker::new());

    tracing::info!("- Registry controller");

    controller
        .watches(
            secrets,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |secret| registries_for_secret(&secret, &store.state(), &default_namespace),
        )
        .watches(
            nodes,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |node| {
                if tracker.observe(&node) {
                    all_registries(&node_store.state())
                } else {
                    Vec::new()
                }
            },
        )
        .watches(
            jobs,
            WatcherConfig::default()
                .labels(MANAGED_BY_SELECTOR)
                .timeout(WATCH_TIMEOUT_SECS),
            |job| registry_for_job(&job),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Registry"))
        .await;
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
