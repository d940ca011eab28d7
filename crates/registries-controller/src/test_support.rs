//! In-memory cluster and event sink for multi-pass scenario tests

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use registries_common::crd::{Registry, RegistryStatus};
use registries_common::events::EventPublisher;
use registries_common::{Error, CA_CRT_KEY};

use crate::controller::ControllerConfig;
use crate::kube_client::KubeClient;
use crate::reconciler::{CertDistributor, ResolvedCertificate};

pub(crate) fn not_found() -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "not found".to_string(),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[derive(Default)]
struct State {
    registries: BTreeMap<String, Registry>,
    secrets: HashMap<(String, String), Secret>,
    jobs: Vec<Job>,
    nodes: u32,
    created: Vec<Job>,
    deleted: Vec<String>,
    status_patches: usize,
}

/// Cluster backed by in-memory maps
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub(crate) fn with_nodes(nodes: u32) -> Self {
        let cluster = Self::default();
        cluster.set_nodes(nodes);
        cluster
    }

    pub(crate) fn set_nodes(&self, nodes: u32) {
        self.state.lock().unwrap().nodes = nodes;
    }

    pub(crate) fn put_registry(&self, registry: Registry) {
        self.state
            .lock()
            .unwrap()
            .registries
            .insert(registry.name_any(), registry);
    }

    pub(crate) fn registry(&self, name: &str) -> Option<Registry> {
        self.state.lock().unwrap().registries.get(name).cloned()
    }

    pub(crate) fn put_secret(&self, name: &str, namespace: &str, ca_crt: Option<&[u8]>) {
        let data = ca_crt
            .map(|c| BTreeMap::from([(CA_CRT_KEY.to_string(), ByteString(c.to_vec()))]));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data,
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    pub(crate) fn put_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.push(job);
    }

    /// Live jobs
    pub(crate) fn jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().jobs.clone()
    }

    /// Every job ever created, in order
    pub(crate) fn created(&self) -> Vec<Job> {
        self.state.lock().unwrap().created.clone()
    }

    /// Names of every job deleted, in order
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub(crate) fn status_patches(&self) -> usize {
        self.state.lock().unwrap().status_patches
    }

    /// Feed back a replica report for a live job
    pub(crate) fn report(&self, job_name: &str, active: i32, failed: i32, succeeded: i32) {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.name_any() == job_name)
            .unwrap_or_else(|| panic!("no live job named {job_name}"));
        job.status = Some(JobStatus {
            active: Some(active),
            failed: Some(failed),
            succeeded: Some(succeeded),
            ..Default::default()
        });
    }

    /// Request deletion of a Registry (sets the deletion timestamp)
    pub(crate) fn request_deletion(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(registry) = state.registries.get_mut(name) {
            registry.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub(crate) fn distributor(&self, events: Arc<RecordingEventPublisher>) -> CertDistributor {
        CertDistributor::new(Arc::new(self.clone()), events, ControllerConfig::default())
    }
}

fn matches_selector(job: &Job, selector: &str) -> bool {
    let labels = job.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_registry(&self, name: &str) -> Result<Option<Registry>, Error> {
        Ok(self.registry(name))
    }

    async fn patch_status(&self, name: &str, status: &RegistryStatus) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.status_patches += 1;
        let registry = state.registries.get_mut(name).ok_or_else(not_found)?;
        registry.status = Some(status.clone());
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let registry = state.registries.get_mut(name).ok_or_else(not_found)?;
        let finalizers = registry.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let registry = state.registries.get_mut(name).ok_or_else(not_found)?;
        if let Some(finalizers) = registry.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        // The API server completes a pending deletion once no finalizers remain
        if registry.metadata.deletion_timestamp.is_some() && registry.finalizers().is_empty() {
            state.registries.remove(name);
        }
        Ok(())
    }

    async fn count_nodes(&self) -> Result<u32, Error> {
        Ok(self.state.lock().unwrap().nodes)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| matches_selector(j, label_selector))
            .cloned()
            .collect())
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let (name, namespace) = (job.name_any(), job.namespace().unwrap_or_default());
        if state
            .jobs
            .iter()
            .any(|j| j.name_any() == name && j.namespace().unwrap_or_default() == namespace)
        {
            return Err(Error::job_already_exists(name, namespace));
        }
        state.jobs.push(job.clone());
        state.created.push(job.clone());
        Ok(())
    }

    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .retain(|j| !(j.name_any() == name && j.namespace().unwrap_or_default() == namespace));
        state.deleted.push(name.to_string());
        Ok(())
    }
}

/// A published event
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecordedEvent {
    pub(crate) type_: EventType,
    pub(crate) reason: String,
    pub(crate) action: String,
    pub(crate) note: Option<String>,
}

/// Event sink remembering everything published
#[derive(Default)]
pub(crate) struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub(crate) fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            type_,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Registry `foo` at foo.com:5000 using Secret kube-system/foo-ca-crt
pub(crate) fn foo_registry() -> Registry {
    Registry::test_fixture("foo", "foo.com:5000", "foo-ca-crt", "kube-system")
}

/// Registry `bar` at bar.com:5000 using Secret kube-system/bar-ca-crt
pub(crate) fn bar_registry() -> Registry {
    Registry::test_fixture("bar", "bar.com:5000", "bar-ca-crt", "kube-system")
}

/// Resolved payload for `foo_registry`
pub(crate) fn foo_cert(ca_crt: &[u8]) -> ResolvedCertificate {
    ResolvedCertificate {
        secret_name: "foo-ca-crt".to_string(),
        namespace: "kube-system".to_string(),
        ca_crt: ca_crt.to_vec(),
    }
}
