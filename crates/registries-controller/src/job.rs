//! Per-node job construction and outcome interpretation
//!
//! A node job runs the same shell commands once on every node: parallelism
//! and completions equal the node count, and a required pod anti-affinity on
//! `kubernetes.io/hostname` keeps two replicas off the same node. Jobs are
//! found again on later passes through their labels, never by name.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, HostPathVolumeSource, PodAffinityTerm, PodAntiAffinity, PodSpec,
    PodTemplateSpec, SecretVolumeSource, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::warn;

use registries_common::crd::Registry;
use registries_common::kube_utils::{label_selector, sanitize_dns_label};
use registries_common::{Error, MANAGED_BY_LABEL_KEY, OPERATOR_NAME};

use crate::kube_client::KubeClient;

pub use registries_common::{INSTALLER_PREFIX, REMOVER_PREFIX};

/// Install job label carrying the sanitized registry address
pub const INSTALLER_HOST_PORT_LABEL: &str = "kubic-registry-installer-host-port";
/// Install job label carrying the certificate fingerprint
pub const INSTALLER_HASH_LABEL: &str = "kubic-registry-installer-hash";
/// Removal job label carrying the sanitized registry address
pub const REMOVER_HOST_PORT_LABEL: &str = "kubic-registry-remover-host-port";
/// Removal job label carrying the fingerprint being removed
pub const REMOVER_HASH_LABEL: &str = "kubic-registry-remover-hash";

/// Where named secrets are mounted inside the job container
pub const SECRETS_MOUNT_ROOT: &str = "/secrets";
/// Mount key of the registry certificate secret
pub const REGISTRY_SECRET_KEY: &str = "this-registry";

/// Docker per-registry trust store root on the nodes
pub const DOCKER_CERTS_ROOT: &str = "/etc/docker/certs.d";
/// Podman/CRI-O per-registry trust store root on the nodes
pub const PODMAN_CERTS_ROOT: &str = "/etc/containers/certs.d";

/// Host directories mounted into every job
pub const HOST_PATHS: [&str; 2] = ["/etc/docker", "/etc/containers"];

const TOPOLOGY_KEY_HOSTNAME: &str = "kubernetes.io/hostname";
const CONTAINER_NAME: &str = "runner";

/// Specification of a job that runs once on every node
#[derive(Clone, Debug, Default)]
pub struct NodeJobSpec {
    /// Job name
    pub name: String,
    /// Job namespace (mounted secrets must live here)
    pub namespace: String,
    /// Number of nodes to run on
    pub replicas: u32,
    /// Shell commands, run in order by `/bin/sh -c`
    pub commands: Vec<String>,
    /// Mount key -> Secret name; each mounted read-only at `/secrets/<key>`
    pub secrets: BTreeMap<String, String>,
    /// Host directories mounted read-write at the same path
    pub host_paths: Vec<String>,
    /// Labels used to find the job again
    pub labels: BTreeMap<String, String>,
    /// Labels no two replicas may share a node on
    pub anti_affinity: BTreeMap<String, String>,
    /// Container image
    pub image: String,
    /// Controlling owner, for garbage collection
    pub owner: Option<OwnerReference>,
}

impl NodeJobSpec {
    /// Build the Kubernetes Job. Pure construction; nothing is sent to the cluster.
    pub fn build(&self) -> Job {
        let replicas = i32::try_from(self.replicas).unwrap_or(i32::MAX);

        let mut job_labels = self.labels.clone();
        job_labels.insert(MANAGED_BY_LABEL_KEY.to_string(), OPERATOR_NAME.to_string());

        // Pods carry the anti-affinity labels so the rule matches sibling replicas
        let mut pod_labels = job_labels.clone();
        pod_labels.extend(self.anti_affinity.clone());

        let mut volumes = Vec::with_capacity(self.secrets.len() + self.host_paths.len());
        let mut mounts = Vec::with_capacity(volumes.capacity());

        for (key, secret_name) in &self.secrets {
            let volume_name = sanitize_dns_label(key);
            volumes.push(Volume {
                name: volume_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: format!("{}/{}", SECRETS_MOUNT_ROOT, key),
                read_only: Some(true),
                ..Default::default()
            });
        }

        for (i, path) in self.host_paths.iter().enumerate() {
            let volume_name = format!("host-path-{}", i);
            volumes.push(Volume {
                name: volume_name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: path.clone(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: path.clone(),
                ..Default::default()
            });
        }

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![self.commands.join(" ; ")]),
            volume_mounts: Some(mounts),
            ..Default::default()
        };

        let affinity = Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![
                    PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(self.anti_affinity.clone()),
                            ..Default::default()
                        }),
                        topology_key: TOPOLOGY_KEY_HOSTNAME.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        Job {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(job_labels),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                parallelism: Some(replicas),
                completions: Some(replicas),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes),
                        restart_policy: Some("Never".to_string()),
                        tolerations: Some(node_tolerations()),
                        affinity: Some(affinity),
                        automount_service_account_token: Some(false),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Tolerations letting replicas land on control-plane and critical-addon nodes too
fn node_tolerations() -> Vec<Toleration> {
    let no_schedule = |key: &str| Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    };
    vec![
        no_schedule("node-role.kubernetes.io/master"),
        no_schedule("node-role.kubernetes.io/control-plane"),
        Toleration {
            key: Some("CriticalAddonsOnly".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        },
    ]
}

/// Observed state of a node job, in precedence order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Replicas still running
    Active(u32),
    /// Replicas failed
    Failed(u32),
    /// Replicas succeeded
    Succeeded(u32),
    /// No counters reported yet
    Unknown,
}

impl From<&Job> for JobOutcome {
    fn from(job: &Job) -> Self {
        let count = |n: Option<i32>| n.and_then(|n| u32::try_from(n).ok()).unwrap_or(0);
        let Some(status) = job.status.as_ref() else {
            return JobOutcome::Unknown;
        };
        let (active, failed, succeeded) = (
            count(status.active),
            count(status.failed),
            count(status.succeeded),
        );
        if active > 0 {
            JobOutcome::Active(active)
        } else if failed > 0 {
            JobOutcome::Failed(failed)
        } else if succeeded > 0 {
            JobOutcome::Succeeded(succeeded)
        } else {
            JobOutcome::Unknown
        }
    }
}

/// Find the job carrying exactly these labels.
///
/// At most one is expected; extra matches are logged and the first is used.
/// Jobs with a deletion timestamp are ignored.
pub async fn find_job(
    kube: &dyn KubeClient,
    labels: &BTreeMap<String, String>,
) -> Result<Option<Job>, Error> {
    let selector = label_selector(labels);
    // Jobs already being deleted have been consumed
    let mut jobs: Vec<Job> = kube
        .list_jobs(&selector)
        .await?
        .into_iter()
        .filter(|job| job.metadata.deletion_timestamp.is_none())
        .collect();
    if jobs.len() > 1 {
        warn!(
            selector = %selector,
            count = jobs.len(),
            "more than one job matches, using the first"
        );
    }
    Ok(if jobs.is_empty() {
        None
    } else {
        Some(jobs.swap_remove(0))
    })
}

/// Name of the install job for a registry address
pub fn installer_job_name(host_port: &str) -> String {
    format!("{}-{}", INSTALLER_PREFIX, sanitize_dns_label(host_port))
}

/// Name of the removal job for a registry address
pub fn remover_job_name(host_port: &str) -> String {
    format!("{}-{}", REMOVER_PREFIX, sanitize_dns_label(host_port))
}

/// Lookup labels of the install job for (address, fingerprint)
pub fn installer_labels(host_port: &str, hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INSTALLER_HOST_PORT_LABEL.to_string(), sanitize_dns_label(host_port)),
        (INSTALLER_HASH_LABEL.to_string(), hash.to_string()),
    ])
}

/// Lookup labels of the removal job for (address, fingerprint)
pub fn remover_labels(host_port: &str, hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (REMOVER_HOST_PORT_LABEL.to_string(), sanitize_dns_label(host_port)),
        (REMOVER_HASH_LABEL.to_string(), hash.to_string()),
    ])
}

/// Labels selecting every install job for an address, whatever the fingerprint
pub fn installer_address_labels(host_port: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        INSTALLER_HOST_PORT_LABEL.to_string(),
        sanitize_dns_label(host_port),
    )])
}

/// Labels removal replicas spread on
pub fn remover_address_labels(host_port: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        REMOVER_HOST_PORT_LABEL.to_string(),
        sanitize_dns_label(host_port),
    )])
}

/// Trust store directories of a registry address on a node
pub fn cert_dirs(host_port: &str) -> [String; 2] {
    [
        format!("{}/{}", DOCKER_CERTS_ROOT, host_port),
        format!("{}/{}", PODMAN_CERTS_ROOT, host_port),
    ]
}

/// Commands replacing both trust store directories with the mounted `ca.crt`
pub fn installer_commands(host_port: &str) -> Vec<String> {
    let src = format!("{}/{}", SECRETS_MOUNT_ROOT, REGISTRY_SECRET_KEY);
    let mut commands = Vec::new();
    for dir in cert_dirs(host_port) {
        commands.push(format!("echo Removing {}", dir));
        commands.push(format!("[ -d '{dir}' ] && rm -rf '{dir}'"));
        commands.push(format!("mkdir -p '{}'", dir));
        commands.push(format!("echo Copying {src}/ca.crt to {dir}/ ..."));
        commands.push(format!("cp '{src}/ca.crt' '{dir}/'"));
    }
    commands.push("echo Done".to_string());
    commands
}

/// Commands deleting both trust store directories
pub fn remover_commands(host_port: &str) -> Vec<String> {
    let mut commands = Vec::new();
    for dir in cert_dirs(host_port) {
        commands.push(format!("echo Removing {}", dir));
        commands.push(format!("rm -rf '{}'", dir));
    }
    commands
}

/// Controller owner reference to the Registry, if it has a uid yet
pub fn registry_owner(registry: &Registry) -> Option<OwnerReference> {
    registry.controller_owner_ref(&())
}

/// Registry named by a job's controller owner reference
pub fn owning_registry_name(job: &Job) -> Option<String> {
    job.owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == Registry::kind(&()))
        .map(|o| o.name.clone())
}
