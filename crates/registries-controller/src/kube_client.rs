//! Cluster API access used by the registry controller

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use registries_common::crd::{Registry, RegistryStatus};
use registries_common::kube_utils::{
    patch_cluster_resource_finalizers, patch_cluster_resource_status,
};
use registries_common::{Error, OPERATOR_NAME};

/// Trait abstracting Kubernetes client operations for Registry reconciliation
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Registry by name, `None` if it no longer exists
    async fn get_registry(&self, name: &str) -> Result<Option<Registry>, Error>;

    /// Patch the status of a Registry
    async fn patch_status(&self, name: &str, status: &RegistryStatus) -> Result<(), Error>;

    /// Add a finalizer to a Registry (no-op if present)
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a Registry (no-op if absent)
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Count the nodes currently in the cluster
    async fn count_nodes(&self) -> Result<u32, Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// List jobs in all namespaces matching a label selector
    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>, Error>;

    /// Create a job in its own namespace.
    ///
    /// A name collision is reported as [`Error::JobAlreadyExists`].
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Delete a job and its pods; deleting an absent job succeeds
    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_registry(&self, name: &str) -> Result<Option<Registry>, Error> {
        let api: Api<Registry> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(registry) => Ok(Some(registry)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, name: &str, status: &RegistryStatus) -> Result<(), Error> {
        patch_cluster_resource_status::<Registry>(&self.client, name, status, OPERATOR_NAME)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api: Api<Registry> = Api::all(self.client.clone());

        let registry = api.get(name).await?;
        let mut finalizers = registry.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        patch_cluster_resource_finalizers::<Registry>(
            &self.client,
            name,
            &finalizers,
            OPERATOR_NAME,
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api: Api<Registry> = Api::all(self.client.clone());

        let registry = api.get(name).await?;
        if !registry.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = registry
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();

        patch_cluster_resource_finalizers::<Registry>(
            &self.client,
            name,
            &finalizers,
            OPERATOR_NAME,
        )
        .await?;
        Ok(())
    }

    async fn count_nodes(&self) -> Result<u32, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list_metadata(&ListParams::default()).await?;
        Ok(u32::try_from(nodes.items.len()).unwrap_or(u32::MAX))
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::all(self.client.clone());
        let jobs = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(jobs.items)
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let name = job.name_any();
        let namespace = job.namespace().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::job_already_exists(name, namespace))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(job = %name, namespace = %namespace, "job not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
