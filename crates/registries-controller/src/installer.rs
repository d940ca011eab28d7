//! Install state machine
//!
//! Decides whether the registry certificate has to be (re)installed on the
//! fleet, consumes the outcome of a previous install job, and launches a new
//! one when needed. Every decision is re-derived from observed state, so a
//! pass can be replayed any number of times.

use std::collections::BTreeMap;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use registries_common::crd::Registry;
use registries_common::events::{actions, reasons};
use registries_common::hash::hash;
use registries_common::kube_utils::label_selector;
use registries_common::Error;

use crate::job::{
    find_job, installer_address_labels, installer_commands, installer_job_name, installer_labels,
    registry_owner, remover_address_labels, JobOutcome, NodeJobSpec, HOST_PATHS,
    INSTALLER_HASH_LABEL, REGISTRY_SECRET_KEY,
};
use crate::reconciler::{CertDistributor, ResolvedCertificate};

impl CertDistributor {
    /// Install `cert` on every node.
    ///
    /// A rotated certificate clears the recorded state immediately, before
    /// the replacement job has run: until it succeeds no node counts as
    /// trusted even though the old file is still on disk.
    pub(crate) async fn install(
        &self,
        registry: &mut Registry,
        nodes: u32,
        cert: &ResolvedCertificate,
    ) -> Result<(), Error> {
        let name = registry.name_any();
        let obj_ref = registry.object_ref(&());
        let host_port = registry.spec.host_port.clone();
        let owner = registry_owner(registry);
        let spec_hash = hash(Some(&cert.ca_crt));

        // A removal that ran after the last install left the nodes without the file
        if !self.consume_removal_jobs(registry, &host_port).await? {
            debug!(registry = %name, "removal job still running, waiting");
            return Ok(());
        }

        let status = registry.certificate_status_mut();
        let mut must_install = false;

        if status.is_installed() && status.current_hash != spec_hash {
            info!(
                registry = %name,
                old_hash = %status.current_hash,
                new_hash = %spec_hash,
                "certificate changed, invalidating installed state"
            );
            status.clear();
            must_install = true;
        }

        if status.num_nodes != nodes {
            debug!(
                registry = %name,
                installed_nodes = status.num_nodes,
                nodes,
                "installed node count differs from cluster"
            );
            must_install = true;
        }

        let labels = installer_labels(&host_port, &spec_hash);
        if let Some(job) = find_job(self.kube.as_ref(), &labels).await? {
            let job_name = job.name_any();
            let job_namespace = job.namespace().unwrap_or_default();
            match JobOutcome::from(&job) {
                JobOutcome::Active(active) => {
                    debug!(registry = %name, job = %job_name, active, "install job still running");
                    must_install = false;
                }
                JobOutcome::Failed(failed) => {
                    warn!(
                        registry = %name,
                        job = %job_name,
                        failed,
                        "install job failed, retrying"
                    );
                    self.events
                        .publish(
                            &obj_ref,
                            EventType::Warning,
                            reasons::FAILED,
                            actions::INSTALL,
                            Some(format!(
                                "Installation of certificate for {} failed on {} node(s)... \
                                 retrying",
                                host_port, failed
                            )),
                        )
                        .await;
                    self.kube.delete_job(&job_name, &job_namespace).await?;
                    must_install = true;
                }
                JobOutcome::Succeeded(succeeded) => {
                    if status.current_hash != spec_hash || status.num_nodes != succeeded {
                        info!(
                            registry = %name,
                            job = %job_name,
                            nodes = succeeded,
                            "certificate installed"
                        );
                        self.events
                            .publish(
                                &obj_ref,
                                EventType::Normal,
                                reasons::INSTALLED,
                                actions::INSTALL,
                                Some(format!(
                                    "Certificate for {} installed on {} node(s)",
                                    host_port, succeeded
                                )),
                            )
                            .await;
                        status.record(spec_hash.clone(), succeeded);
                    }
                    self.kube.delete_job(&job_name, &job_namespace).await?;
                    must_install = false;
                }
                JobOutcome::Unknown => {
                    debug!(registry = %name, job = %job_name, "install job has not reported yet");
                    must_install = false;
                }
            }
        }

        if !must_install {
            return Ok(());
        }
        if nodes == 0 {
            debug!(registry = %name, "no nodes to install on");
            return Ok(());
        }

        self.sweep_stale_install_jobs(&host_port, &spec_hash).await?;

        let job = NodeJobSpec {
            name: installer_job_name(&host_port),
            namespace: cert.namespace.clone(),
            replicas: nodes,
            commands: installer_commands(&host_port),
            secrets: BTreeMap::from([(
                REGISTRY_SECRET_KEY.to_string(),
                cert.secret_name.clone(),
            )]),
            host_paths: HOST_PATHS.iter().map(|p| p.to_string()).collect(),
            labels,
            anti_affinity: installer_address_labels(&host_port),
            image: self.config.job_image.clone(),
            owner,
        }
        .build();

        self.kube.create_job(&job).await?;
        info!(
            registry = %name,
            job = %job.name_any(),
            hash = %spec_hash,
            nodes,
            "install job created"
        );
        self.events
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::STARTING,
                actions::INSTALL,
                Some(format!(
                    "Installing certificate for {} on {} node(s)",
                    host_port, nodes
                )),
            )
            .await;

        Ok(())
    }

    /// Delete install jobs for this address that target another fingerprint.
    ///
    /// They are never looked up again and would hold the job name forever.
    async fn sweep_stale_install_jobs(
        &self,
        host_port: &str,
        spec_hash: &str,
    ) -> Result<(), Error> {
        let selector = label_selector(&installer_address_labels(host_port));
        for job in self.kube.list_jobs(&selector).await? {
            if job.labels().get(INSTALLER_HASH_LABEL).map(String::as_str) == Some(spec_hash) {
                continue;
            }
            let job_name = job.name_any();
            info!(job = %job_name, "deleting install job for a previous certificate");
            self.kube
                .delete_job(&job_name, &job.namespace().unwrap_or_default())
                .await?;
        }
        Ok(())
    }

    /// Consume finished removal jobs for this address.
    ///
    /// Returns false while one is still running.
    async fn consume_removal_jobs(
        &self,
        registry: &mut Registry,
        host_port: &str,
    ) -> Result<bool, Error> {
        let selector = label_selector(&remover_address_labels(host_port));
        let jobs: Vec<_> = self
            .kube
            .list_jobs(&selector)
            .await?
            .into_iter()
            .filter(|j| j.metadata.deletion_timestamp.is_none())
            .collect();
        if jobs
            .iter()
            .any(|j| matches!(JobOutcome::from(j), JobOutcome::Active(_) | JobOutcome::Unknown))
        {
            return Ok(false);
        }
        for job in jobs {
            let job_name = job.name_any();
            info!(
                registry = %registry.name_any(),
                job = %job_name,
                "certificate was removed from the nodes, reinstalling"
            );
            self.kube
                .delete_job(&job_name, &job.namespace().unwrap_or_default())
                .await?;
            registry.certificate_status_mut().clear();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{INSTALLER_HOST_PORT_LABEL, REMOVER_PREFIX};
    use crate::test_support::{foo_cert, foo_registry, FakeCluster, RecordingEventPublisher};
    use registries_common::crd::CertificateStatus;
    use std::sync::Arc;

    const CERT_A: &[u8] = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
    const CERT_B: &[u8] = b"-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n";
    const JOB: &str = "kubic-registry-installer-foo-com-5000";

    fn setup(nodes: u32) -> (FakeCluster, Arc<RecordingEventPublisher>, CertDistributor) {
        let cluster = FakeCluster::with_nodes(nodes);
        let events = Arc::new(RecordingEventPublisher::default());
        let distributor = cluster.distributor(events.clone());
        (cluster, events, distributor)
    }

    fn installed(registry: &mut Registry, hash: &str, nodes: u32) {
        registry.certificate_status_mut().record(hash.to_string(), nodes);
    }

    // =========================================================================
    // Convergence
    // =========================================================================

    #[tokio::test]
    async fn first_pass_launches_job_for_every_node() {
        let (cluster, events, distributor) = setup(3);
        let mut registry = foo_registry();

        distributor.install(&mut registry, 3, &foo_cert(CERT_A)).await.unwrap();

        let created = cluster.created();
        assert_eq!(created.len(), 1);
        let job = &created[0];
        assert_eq!(job.name_any(), JOB);
        assert_eq!(job.spec.as_ref().unwrap().completions, Some(3));
        assert_eq!(job.labels()[INSTALLER_HASH_LABEL], hash(Some(CERT_A)));
        assert_eq!(job.labels()[INSTALLER_HOST_PORT_LABEL], "foo-com-5000");
        assert_eq!(registry.certificate_status(), CertificateStatus::default());
        assert_eq!(events.reasons(), vec![reasons::STARTING]);
    }

    #[tokio::test]
    async fn success_report_records_status_and_deletes_job() {
        let (cluster, events, distributor) = setup(3);
        let mut registry = foo_registry();
        let cert = foo_cert(CERT_A);

        distributor.install(&mut registry, 3, &cert).await.unwrap();
        cluster.report(JOB, 0, 0, 3);
        distributor.install(&mut registry, 3, &cert).await.unwrap();

        let status = registry.certificate_status();
        assert_eq!(status.current_hash, hash(Some(CERT_A)));
        assert_eq!(status.num_nodes, 3);
        assert!(cluster.jobs().is_empty());
        assert_eq!(cluster.deleted(), vec![JOB]);
        assert_eq!(events.reasons(), vec![reasons::STARTING, reasons::INSTALLED]);
    }

    #[tokio::test]
    async fn converged_pass_is_a_no_op() {
        let (cluster, events, distributor) = setup(3);
        let mut registry = foo_registry();
        installed(&mut registry, &hash(Some(CERT_A)), 3);
        let before = registry.clone();

        distributor.install(&mut registry, 3, &foo_cert(CERT_A)).await.unwrap();
        distributor.install(&mut registry, 3, &foo_cert(CERT_A)).await.unwrap();

        assert_eq!(registry, before);
        assert!(cluster.created().is_empty());
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn running_job_is_not_launched_twice() {
        let (cluster, events, distributor) = setup(3);
        let mut registry = foo_registry();
        let cert = foo_cert(CERT_A);

        distributor.install(&mut registry, 3, &cert).await.unwrap();
        cluster.report(JOB, 2, 0, 1);
        distributor.install(&mut registry, 3, &cert).await.unwrap();
        distributor.install(&mut registry, 3, &cert).await.unwrap();

        assert_eq!(cluster.created().len(), 1);
        assert_eq!(cluster.jobs().len(), 1);
        assert_eq!(events.reasons(), vec![reasons::STARTING]);
    }

    #[tokio::test]
    async fn unreported_job_is_waited_for() {
        let (cluster, _events, distributor) = setup(3);
        let mut registry = foo_registry();
        let cert = foo_cert(CERT_A);

        distributor.install(&mut registry, 3, &cert).await.unwrap();
        distributor.install(&mut registry, 3, &cert).await.unwrap();

        assert_eq!(cluster.created().len(), 1);
        assert!(cluster.deleted().is_empty());
    }

    // =========================================================================
    // Failure and retry
    // =========================================================================

    #[tokio::test]
    async fn failed_job_is_replaced() {
        let (cluster, events, distributor) = setup(3);
        let mut registry = foo_registry();
        let cert = foo_cert(CERT_A);

        distributor.install(&mut registry, 3, &cert).await.unwrap();
        cluster.report(JOB, 0, 1, 2);
        distributor.install(&mut registry, 3, &cert).await.unwrap();

        assert_eq!(cluster.created().len(), 2);
        assert_eq!(cluster.jobs().len(), 1);
        assert_eq!(
            events.reasons(),
            vec![reasons::STARTING, reasons::FAILED, reasons::STARTING]
        );
        let failed = &events.events()[1];
        assert_eq!(failed.type_, EventType::Warning);
        assert!(failed.note.as_deref().unwrap().contains("retrying"));
        assert_eq!(registry.certificate_status().num_nodes, 0);
    }

    #[tokio::test]
    async fn already_exists_is_surfaced() {
        let (cluster, events, distributor) = setup(3);
        let mut registry = foo_registry();
        // Same name, foreign labels: invisible to the lookup, collides on create
        let mut squatter = NodeJobSpec {
            name: JOB.to_string(),
            namespace: "kube-system".to_string(),
            ..Default::default()
        }
        .build();
        squatter.metadata.labels = None;
        cluster.put_job(squatter);

        let err = distributor
            .install(&mut registry, 3, &foo_cert(CERT_A))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert!(events.events().is_empty());
    }

    // =========================================================================
    // Rotation and membership changes
    // =========================================================================

    #[tokio::test]
    async fn rotation_invalidates_and_installs_new_hash() {
        let (cluster, _events, distributor) = setup(3);
        let mut registry = foo_registry();
        installed(&mut registry, &hash(Some(CERT_A)), 3);

        distributor.install(&mut registry, 3, &foo_cert(CERT_B)).await.unwrap();

        assert_eq!(registry.certificate_status(), CertificateStatus::default());
        let created = cluster.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].labels()[INSTALLER_HASH_LABEL], hash(Some(CERT_B)));
    }

    #[tokio::test]
    async fn rotation_sweeps_job_for_previous_hash() {
        let (cluster, _events, distributor) = setup(3);
        let mut registry = foo_registry();

        distributor.install(&mut registry, 3, &foo_cert(CERT_A)).await.unwrap();
        cluster.report(JOB, 1, 0, 0);
        distributor.install(&mut registry, 3, &foo_cert(CERT_B)).await.unwrap();

        let jobs = cluster.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].labels()[INSTALLER_HASH_LABEL], hash(Some(CERT_B)));
        assert_eq!(cluster.deleted(), vec![JOB]);
    }

    #[tokio::test]
    async fn new_node_triggers_reinstall() {
        let (cluster, events, distributor) = setup(4);
        let mut registry = foo_registry();
        installed(&mut registry, &hash(Some(CERT_A)), 3);

        distributor.install(&mut registry, 4, &foo_cert(CERT_A)).await.unwrap();

        assert_eq!(cluster.created()[0].spec.as_ref().unwrap().parallelism, Some(4));
        // Same certificate: the recorded install stays valid meanwhile
        assert_eq!(registry.certificate_status().num_nodes, 3);
        assert_eq!(events.reasons(), vec![reasons::STARTING]);
    }

    #[tokio::test]
    async fn no_nodes_launches_nothing() {
        let (cluster, events, distributor) = setup(0);
        let mut registry = foo_registry();

        distributor.install(&mut registry, 0, &foo_cert(CERT_A)).await.unwrap();

        assert!(cluster.created().is_empty());
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn status_invariant_holds_across_passes() {
        let (cluster, _events, distributor) = setup(2);
        let mut registry = foo_registry();
        let check = |r: &Registry| {
            let s = r.certificate_status();
            assert!(s.num_nodes == 0 || !s.current_hash.is_empty());
        };

        distributor.install(&mut registry, 2, &foo_cert(CERT_A)).await.unwrap();
        check(&registry);
        cluster.report(JOB, 0, 0, 2);
        distributor.install(&mut registry, 2, &foo_cert(CERT_A)).await.unwrap();
        check(&registry);
        distributor.install(&mut registry, 2, &foo_cert(CERT_B)).await.unwrap();
        check(&registry);
        cluster.report(JOB, 0, 0, 2);
        distributor.install(&mut registry, 2, &foo_cert(CERT_B)).await.unwrap();
        check(&registry);
        assert_eq!(registry.certificate_status().current_hash, hash(Some(CERT_B)));
    }

    // =========================================================================
    // Interaction with removal jobs
    // =========================================================================

    #[tokio::test]
    async fn waits_for_running_removal() {
        let (cluster, _events, distributor) = setup(3);
        let mut registry = foo_registry();
        installed(&mut registry, &hash(Some(CERT_A)), 3);
        registry.spec.certificate = None;
        distributor.remove(&mut registry, 3).await.unwrap();
        let removal = cluster.created()[0].name_any();
        assert!(removal.starts_with(REMOVER_PREFIX));
        cluster.report(&removal, 3, 0, 0);

        let mut restored = foo_registry();
        installed(&mut restored, &hash(Some(CERT_A)), 3);
        distributor.install(&mut restored, 3, &foo_cert(CERT_A)).await.unwrap();

        assert_eq!(cluster.created().len(), 1);
        assert_eq!(restored.certificate_status().num_nodes, 3);
    }

    #[tokio::test]
    async fn finished_removal_forces_reinstall() {
        let (cluster, _events, distributor) = setup(3);
        let mut registry = foo_registry();
        installed(&mut registry, &hash(Some(CERT_A)), 3);
        distributor.remove(&mut registry, 3).await.unwrap();
        let removal = cluster.created()[0].name_any();
        cluster.report(&removal, 0, 0, 3);

        let mut restored = foo_registry();
        installed(&mut restored, &hash(Some(CERT_A)), 3);
        distributor.install(&mut restored, 3, &foo_cert(CERT_A)).await.unwrap();

        assert_eq!(cluster.deleted(), vec![removal]);
        assert_eq!(restored.certificate_status(), CertificateStatus::default());
        assert_eq!(cluster.created().len(), 2);
        assert_eq!(cluster.created()[1].name_any(), JOB);
    }
}
