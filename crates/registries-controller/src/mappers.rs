//! Watch mappers: which Registries to reconcile when a related object changes

use std::sync::Arc;

use dashmap::DashSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::debug;

use registries_common::crd::Registry;

use crate::job::owning_registry_name;

/// Every known Registry
pub fn all_registries(registries: &[Arc<Registry>]) -> Vec<ObjectRef<Registry>> {
    registries.iter().map(|r| ObjectRef::from_obj(&**r)).collect()
}

/// Registries whose certificate reference points at `secret`
///
/// References without a namespace resolve to `default_namespace`.
pub fn registries_for_secret(
    secret: &Secret,
    registries: &[Arc<Registry>],
    default_namespace: &str,
) -> Vec<ObjectRef<Registry>> {
    let name = secret.name_any();
    let namespace = secret.namespace().unwrap_or_default();

    registries
        .iter()
        .filter(|r| {
            r.spec.certificate.as_ref().is_some_and(|c| c.name == name)
                && r.certificate_namespace(default_namespace) == Some(namespace.as_str())
        })
        .map(|r| ObjectRef::from_obj(&**r))
        .collect()
}

/// The Registry a job was launched for, from its controller owner reference
pub fn registry_for_job(job: &Job) -> Option<ObjectRef<Registry>> {
    owning_registry_name(job).map(|name| ObjectRef::new(&name))
}

/// Remembers which nodes have been seen so only new nodes trigger a rollout
#[derive(Debug, Default)]
pub struct NodeTracker {
    seen: DashSet<String>,
}

impl NodeTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node event; true only the first time a live node is seen
    ///
    /// A node is forgotten only when it is observed with a deletion
    /// timestamp. Nodes deleted outright usually arrive without one, so
    /// their names stay in the set: it grows with node churn, and a node
    /// re-created under the same name is only picked up by the periodic
    /// requeue.
    pub fn observe(&self, node: &Node) -> bool {
        let name = node.name_any();
        if node.metadata.deletion_timestamp.is_some() {
            self.seen.remove(&name);
            return false;
        }
        let added = self.seen.insert(name);
        if added {
            debug!(node = %node.name_any(), "new node observed");
        }
        added
    }
}
