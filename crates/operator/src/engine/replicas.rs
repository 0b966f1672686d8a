//! Drives the pods and services of one replica type toward the declared count
//! and reports what it observed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::common::{CleanPodPolicy, ReplicaSpec, ReplicaStatus};
use crate::engine::gang::GangScheduler;
use crate::engine::kind::{JobKind, KindOptions};
use crate::events::{actions, reasons, EventPublisher};
use crate::kubernetes::client::ClusterClient;
use crate::kubernetes::resources::{
    build_pod, build_service, is_controlled_by, job_selector, replica_index,
    replica_type_selector, REPLICA_TYPE_LABEL,
};
use crate::Result;

/// A replica whose pod failed during this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedReplica {
    pub pod_name: String,
    pub index: i32,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaOutcome {
    pub status: ReplicaStatus,
    pub failed: Vec<FailedReplica>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PodClass {
    Active,
    Succeeded,
    Failed(Option<i32>),
}

/// First non-zero exit code among terminated containers.
fn failed_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| cs.state.as_ref().and_then(|st| st.terminated.as_ref()))
                .map(|t| t.exit_code)
                .find(|code| *code != 0)
        })
}

fn classify(pod: &Pod) -> PodClass {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");
    match phase {
        "Succeeded" => PodClass::Succeeded,
        "Failed" => PodClass::Failed(failed_exit_code(pod)),
        _ => {
            let kubelet_restarts = pod
                .spec
                .as_ref()
                .and_then(|s| s.restart_policy.as_deref())
                .map(|p| p != "Never")
                .unwrap_or(true);
            match failed_exit_code(pod) {
                Some(code) if !kubelet_restarts => PodClass::Failed(Some(code)),
                _ => PodClass::Active,
            }
        }
    }
}

fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub struct ReplicaManager {
    client: Arc<dyn ClusterClient>,
    gang: Option<Arc<dyn GangScheduler>>,
    events: Arc<dyn EventPublisher>,
    options: KindOptions,
}

impl ReplicaManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        gang: Option<Arc<dyn GangScheduler>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            gang,
            events,
            options: KindOptions::default(),
        }
    }

    pub fn with_options(mut self, options: KindOptions) -> Self {
        self.options = options;
        self
    }

    async fn owned_pods<K: JobKind>(&self, job: &K, selector: &str) -> Result<Vec<Pod>> {
        let uid = job.uid().unwrap_or_default();
        let pods = self
            .client
            .list_pods(&job.namespace().unwrap_or_default(), selector)
            .await?;
        Ok(pods
            .into_iter()
            .filter(|p| is_controlled_by(&p.metadata, &uid))
            .collect())
    }

    async fn owned_services<K: JobKind>(&self, job: &K, selector: &str) -> Result<Vec<Service>> {
        let uid = job.uid().unwrap_or_default();
        let services = self
            .client
            .list_services(&job.namespace().unwrap_or_default(), selector)
            .await?;
        Ok(services
            .into_iter()
            .filter(|s| is_controlled_by(&s.metadata, &uid))
            .collect())
    }

    async fn create_pod<K: JobKind>(&self, job: &K, pod: &Pod) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        self.client.create_pod(&namespace, pod).await?;
        self.events
            .publish(
                &job.object_ref(&()),
                EventType::Normal,
                reasons::SUCCESSFUL_CREATE_POD,
                actions::RECONCILE,
                Some(format!("Created pod: {}", pod.name_any())),
            )
            .await;
        Ok(())
    }

    async fn delete_pod<K: JobKind>(&self, job: &K, name: &str) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        self.client.delete_pod(&namespace, name).await?;
        self.events
            .publish(
                &job.object_ref(&()),
                EventType::Normal,
                reasons::SUCCESSFUL_DELETE_POD,
                actions::RECONCILE,
                Some(format!("Deleted pod: {}", name)),
            )
            .await;
        Ok(())
    }

    /// One pass for one replica type: delete strays, create what is missing
    /// (service first), and classify the pods that were already there.
    pub async fn reconcile<K: JobKind>(
        &self,
        job: &K,
        replica_type: &str,
        spec: &ReplicaSpec,
    ) -> Result<ReplicaOutcome> {
        let namespace = job.namespace().unwrap_or_default();
        let job_name = job.name_any();
        let selector = replica_type_selector(K::KIND_NAME.as_label(), &job_name, replica_type);
        let desired = spec.desired_replicas();

        let mut pods: BTreeMap<i32, Pod> = BTreeMap::new();
        for pod in self.owned_pods(job, &selector).await? {
            match replica_index(&pod.metadata) {
                Some(index) if index < desired => {
                    pods.insert(index, pod);
                }
                Some(index) => {
                    info!(job = %job_name, replica_type, index, "Scaling down replica");
                    self.delete_replica(job, &pod.name_any()).await?;
                }
                None => {
                    warn!(job = %job_name, pod = %pod.name_any(), "Deleting pod without a valid replica index");
                    self.delete_pod(job, &pod.name_any()).await?;
                }
            }
        }

        let mut services: BTreeSet<i32> = BTreeSet::new();
        for service in self.owned_services(job, &selector).await? {
            match replica_index(&service.metadata) {
                Some(index) if index < desired => {
                    services.insert(index);
                }
                _ => {
                    self.client
                        .delete_service(&namespace, &service.name_any())
                        .await?;
                }
            }
        }

        for index in 0..desired {
            if !services.contains(&index) {
                let service = build_service(job, replica_type, index, spec)?;
                self.client.create_service(&namespace, &service).await?;
            }
            if !pods.contains_key(&index) {
                let mut pod = build_pod(job, replica_type, index, spec)?;
                let init = job.init_containers(replica_type, &self.options)?;
                if !init.is_empty() {
                    if let Some(pod_spec) = pod.spec.as_mut() {
                        let existing = pod_spec.init_containers.take().unwrap_or_default();
                        pod_spec.init_containers = Some(init.into_iter().chain(existing).collect());
                    }
                }
                if let Some(gang) = &self.gang {
                    gang.decorate_pod(&mut pod, &job_name, replica_type);
                }
                info!(job = %job_name, replica_type, index, "Creating replica pod");
                self.create_pod(job, &pod).await?;
            }
        }

        let mut outcome = ReplicaOutcome::default();
        for (index, pod) in pods.iter().filter(|(_, p)| !is_terminating(p)) {
            match classify(pod) {
                PodClass::Active => outcome.status.active += 1,
                PodClass::Succeeded => outcome.status.succeeded += 1,
                PodClass::Failed(exit_code) => {
                    outcome.status.failed += 1;
                    outcome.failed.push(FailedReplica {
                        pod_name: pod.name_any(),
                        index: *index,
                        exit_code,
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Delete a failed pod so the next pass recreates it. The service stays.
    pub async fn restart_replica<K: JobKind>(&self, job: &K, pod_name: &str) -> Result<()> {
        info!(job = %job.name_any(), pod = pod_name, "Restarting replica");
        self.delete_pod(job, pod_name).await
    }

    /// Remove a replica's pod and then its service.
    pub async fn delete_replica<K: JobKind>(&self, job: &K, name: &str) -> Result<()> {
        self.delete_pod(job, name).await?;
        self.client
            .delete_service(&job.namespace().unwrap_or_default(), name)
            .await
    }

    /// Delete owned pods and services whose replica type is no longer declared.
    /// Returns the number of pods removed.
    pub async fn remove_undeclared<K: JobKind>(&self, job: &K) -> Result<usize> {
        let namespace = job.namespace().unwrap_or_default();
        let selector = job_selector(K::KIND_NAME.as_label(), &job.name_any());
        let declared: BTreeSet<String> = job
            .replica_specs()
            .keys()
            .map(|t| t.to_lowercase())
            .collect();
        let undeclared = |labels: Option<&BTreeMap<String, String>>| {
            labels
                .and_then(|l| l.get(REPLICA_TYPE_LABEL))
                .map(|t| !declared.contains(t))
                .unwrap_or(false)
        };

        let mut deleted = 0;
        for pod in self.owned_pods(job, &selector).await? {
            if undeclared(pod.metadata.labels.as_ref()) && !is_terminating(&pod) {
                info!(job = %job.name_any(), pod = %pod.name_any(), "Deleting pod of a removed replica type");
                self.delete_pod(job, &pod.name_any()).await?;
                deleted += 1;
            }
        }
        for service in self.owned_services(job, &selector).await? {
            if undeclared(service.metadata.labels.as_ref()) {
                self.client
                    .delete_service(&namespace, &service.name_any())
                    .await?;
            }
        }
        Ok(deleted)
    }

    /// Apply a finished job's clean pod policy. Returns the number of pods removed.
    pub async fn cleanup<K: JobKind>(&self, job: &K, policy: CleanPodPolicy) -> Result<usize> {
        if policy == CleanPodPolicy::None {
            return Ok(0);
        }
        let selector = job_selector(K::KIND_NAME.as_label(), &job.name_any());
        let mut deleted = 0;
        for pod in self.owned_pods(job, &selector).await? {
            let remove = match policy {
                CleanPodPolicy::All => true,
                CleanPodPolicy::Running => classify(&pod) == PodClass::Active,
                CleanPodPolicy::None => false,
            };
            if remove && !is_terminating(&pod) {
                self.delete_replica(job, &pod.name_any()).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove every pod and service the job owns. Returns the number of pods removed.
    pub async fn delete_all<K: JobKind>(&self, job: &K) -> Result<usize> {
        let namespace = job.namespace().unwrap_or_default();
        let selector = job_selector(K::KIND_NAME.as_label(), &job.name_any());
        let pods = self.owned_pods(job, &selector).await?;
        for pod in &pods {
            self.delete_pod(job, &pod.name_any()).await?;
        }
        for service in self.owned_services(job, &selector).await? {
            self.client
                .delete_service(&namespace, &service.name_any())
                .await?;
        }
        Ok(pods.len())
    }
}
