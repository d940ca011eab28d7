//! Removal state machine
//!
//! Strips the recorded certificate from every node when the Registry no
//! longer references one or is being deleted. For a deleting Registry the
//! finalizer is completed once the removal job has been consumed.

use std::collections::BTreeMap;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use registries_common::crd::Registry;
use registries_common::events::{actions, reasons};
use registries_common::Error;

use crate::finalizer::finalizer_done;
use crate::job::{
    find_job, registry_owner, remover_address_labels, remover_commands, remover_job_name,
    remover_labels, JobOutcome, NodeJobSpec, HOST_PATHS,
};
use crate::reconciler::CertDistributor;

impl CertDistributor {
    /// Remove the recorded certificate from every node.
    ///
    /// A finished removal job is consumed whatever its outcome: a node that
    /// failed to delete the directory is not retried.
    pub(crate) async fn remove(&self, registry: &mut Registry, nodes: u32) -> Result<(), Error> {
        let name = registry.name_any();
        let obj_ref = registry.object_ref(&());
        let host_port = registry.spec.host_port.clone();
        let status = registry.certificate_status();

        let labels = remover_labels(&host_port, &status.current_hash);
        let Some(job) = find_job(self.kube.as_ref(), &labels).await? else {
            if status.is_installed() && status.num_nodes != 0 && nodes > 0 {
                return self.launch_removal(registry, nodes, labels).await;
            }

            // Nothing is left on any node
            if status.num_nodes != 0 {
                info!(registry = %name, "no nodes left, forgetting installed certificate");
                self.events
                    .publish(
                        &obj_ref,
                        EventType::Normal,
                        reasons::REMOVED,
                        actions::REMOVE,
                        Some(format!("Certificate for {} removed: no nodes left", host_port)),
                    )
                    .await;
            }
            registry.certificate_status_mut().clear();
            if registry.is_deleting() {
                finalizer_done(registry);
            }
            return Ok(());
        };

        let job_name = job.name_any();
        match JobOutcome::from(&job) {
            JobOutcome::Active(active) => {
                debug!(registry = %name, job = %job_name, active, "removal job still running");
                return Ok(());
            }
            JobOutcome::Unknown => {
                debug!(registry = %name, job = %job_name, "removal job has not reported yet");
                return Ok(());
            }
            JobOutcome::Failed(_) | JobOutcome::Succeeded(_) => {}
        }

        if status.is_installed() || status.num_nodes != 0 {
            info!(registry = %name, job = %job_name, "certificate removed from nodes");
            self.events
                .publish(
                    &obj_ref,
                    EventType::Normal,
                    reasons::REMOVED,
                    actions::REMOVE,
                    Some(format!("Certificate for {} removed from the nodes", host_port)),
                )
                .await;
            registry.certificate_status_mut().clear();
        }
        self.kube
            .delete_job(&job_name, &job.namespace().unwrap_or_default())
            .await?;

        if registry.is_deleting() {
            finalizer_done(registry);
        }
        Ok(())
    }

    async fn launch_removal(
        &self,
        registry: &Registry,
        nodes: u32,
        labels: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let host_port = &registry.spec.host_port;
        let job = NodeJobSpec {
            name: remover_job_name(host_port),
            namespace: self.config.job_namespace.clone(),
            replicas: nodes,
            commands: remover_commands(host_port),
            secrets: BTreeMap::new(),
            host_paths: HOST_PATHS.iter().map(|p| p.to_string()).collect(),
            labels,
            anti_affinity: remover_address_labels(host_port),
            image: self.config.job_image.clone(),
            owner: registry_owner(registry),
        }
        .build();

        self.kube.create_job(&job).await?;
        info!(
            registry = %registry.name_any(),
            job = %job.name_any(),
            nodes,
            "removal job created"
        );
        self.events
            .publish(
                &registry.object_ref(&()),
                EventType::Normal,
                reasons::REMOVING,
                actions::REMOVE,
                Some(format!(
                    "Removing certificate for {} from {} node(s)",
                    host_port, nodes
                )),
            )
            .await;
        Ok(())
    }
}
