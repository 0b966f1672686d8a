//! Cluster API access used by the engine.
//!
//! Two seams: [`ClusterClient`] for the objects a job owns and [`JobClient`]
//! for the job itself. Both are traits so the reconciler can run against an
//! in-memory cluster in tests.

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::podgroup::{PodGroup, PodGroupSpec};
use crate::engine::kind::JobKind;
use crate::{Error, Result};

/// Operations on pods, services and pod groups. Creating something that
/// already exists and deleting something that is gone both succeed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pod_group(&self, namespace: &str, name: &str) -> Result<Option<PodGroup>>;
    async fn create_pod_group(&self, namespace: &str, group: &PodGroup) -> Result<()>;
    async fn patch_pod_group(
        &self,
        namespace: &str,
        name: &str,
        spec: &PodGroupSpec,
    ) -> Result<()>;
    async fn delete_pod_group(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Read and write access to jobs of one kind.
#[async_trait]
pub trait JobClient<K: JobKind>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Write `job.status`, failing with [`Error::Conflict`] if the job changed
    /// since it was read.
    async fn replace_status(&self, job: &K) -> Result<K>;

    /// Set the finalizer list, guarded by the job's resourceVersion.
    async fn patch_finalizers(&self, job: &K, finalizers: Vec<String>) -> Result<K>;
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

fn ignore_already_exists<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 409) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn conflict_aware(err: kube::Error, what: &str) -> Error {
    if is_status(&err, 409) {
        Error::Conflict(format!("{} changed since it was read", what))
    } else {
        Error::Kubernetes(err)
    }
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pod_groups(&self, namespace: &str) -> Api<PodGroup> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        debug!(namespace, pod = %pod.name_any(), "Creating pod");
        ignore_already_exists(self.pods(namespace).create(&PostParams::default(), pod).await)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, pod = name, "Deleting pod");
        ignore_not_found(
            self.pods(namespace)
                .delete(name, &DeleteParams::background())
                .await,
        )
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let list = self
            .services(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        debug!(namespace, service = %service.name_any(), "Creating service");
        ignore_already_exists(
            self.services(namespace)
                .create(&PostParams::default(), service)
                .await,
        )
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, service = name, "Deleting service");
        ignore_not_found(
            self.services(namespace)
                .delete(name, &DeleteParams::background())
                .await,
        )
    }

    async fn get_pod_group(&self, namespace: &str, name: &str) -> Result<Option<PodGroup>> {
        Ok(self.pod_groups(namespace).get_opt(name).await?)
    }

    async fn create_pod_group(&self, namespace: &str, group: &PodGroup) -> Result<()> {
        debug!(namespace, pod_group = %group.name_any(), "Creating pod group");
        ignore_already_exists(
            self.pod_groups(namespace)
                .create(&PostParams::default(), group)
                .await,
        )
    }

    async fn patch_pod_group(
        &self,
        namespace: &str,
        name: &str,
        spec: &PodGroupSpec,
    ) -> Result<()> {
        let patch = serde_json::json!({ "spec": spec });
        self.pod_groups(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pod_group(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace, pod_group = name, "Deleting pod group");
        ignore_not_found(
            self.pod_groups(namespace)
                .delete(name, &DeleteParams::background())
                .await,
        )
    }
}

pub struct KubeJobClient<K> {
    client: Client,
    _kind: PhantomData<K>,
}

impl<K> KubeJobClient<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: JobKind> JobClient<K> for KubeJobClient<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_status(&self, job: &K) -> Result<K> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        // the serialized body carries the resourceVersion we read
        let body = serde_json::to_vec(job)?;
        api.replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| conflict_aware(e, &format!("{} {}/{}", K::KIND_NAME, namespace, name)))
    }

    async fn patch_finalizers(&self, job: &K, finalizers: Vec<String>) -> Result<K> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": job.resource_version(),
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| conflict_aware(e, &format!("{} {}/{}", K::KIND_NAME, namespace, name)))
    }
}
