//! In-memory cluster for engine tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec,
    PodStatus, PodTemplateSpec, Service,
};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use crate::crd::common::{ReplicaSpec, RunPolicy};
use crate::crd::podgroup::{PodGroup, PodGroupSpec};
use crate::crd::tfjob::{TFJob, TFJobSpec};
use crate::engine::kind::JobKind;
use crate::events::EventPublisher;
use crate::kubernetes::client::{ClusterClient, JobClient};
use crate::{Error, Result};

pub fn tf_job(name: &str, specs: &[(&str, i32)]) -> TFJob {
    let mut job = TFJob::new(
        name,
        TFJobSpec {
            run_policy: RunPolicy::default(),
            tf_replica_specs: specs
                .iter()
                .map(|(t, n)| {
                    (
                        t.to_string(),
                        ReplicaSpec {
                            replicas: Some(*n),
                            template: PodTemplateSpec {
                                metadata: None,
                                spec: Some(PodSpec {
                                    containers: vec![Container {
                                        name: "tensorflow".to_string(),
                                        image: Some("tensorflow/tensorflow:2.15.0".to_string()),
                                        ..Default::default()
                                    }],
                                    ..Default::default()
                                }),
                            },
                            restart_policy: None,
                        },
                    )
                })
                .collect(),
        },
    );
    job.metadata.namespace = Some("default".to_string());
    job.metadata.uid = Some("uid-1".to_string());
    job.metadata.resource_version = Some("1".to_string());
    job
}

fn pod_status(phase: &str, exit_code: Option<i32>) -> PodStatus {
    PodStatus {
        phase: Some(phase.to_string()),
        container_statuses: exit_code.map(|code| {
            vec![ContainerStatus {
                name: "tensorflow".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: code,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        }),
        ..Default::default()
    }
}

pub fn pod_with_phase(
    name: &str,
    phase: &str,
    exit_code: Option<i32>,
    restart_policy: &str,
) -> Pod {
    let mut pod = Pod {
        spec: Some(PodSpec {
            restart_policy: Some(restart_policy.to_string()),
            ..Default::default()
        }),
        status: Some(pod_status(phase, exit_code)),
        ..Default::default()
    };
    pod.metadata.name = Some(name.to_string());
    pod
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let labels = match labels {
        Some(l) => l,
        None => return selector.is_empty(),
    };
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(|l| l == v).unwrap_or(false),
            None => false,
        })
}

#[derive(Default)]
struct ClusterState {
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    pod_groups: BTreeMap<String, PodGroup>,
    calls: Vec<String>,
    pod_delete_failures: usize,
}

/// Pods, services and pod groups of a single namespace. Records every
/// mutating call in order.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn with<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear())
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.with(|s| s.pods.keys().cloned().collect())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.with(|s| s.services.keys().cloned().collect())
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.with(|s| s.pods.get(name).cloned())
    }

    pub fn pod_group(&self, name: &str) -> Option<PodGroup> {
        self.with(|s| s.pod_groups.get(name).cloned())
    }

    pub fn set_pod_phase(&self, name: &str, phase: &str, exit_code: Option<i32>) {
        self.with(|s| {
            if let Some(pod) = s.pods.get_mut(name) {
                pod.status = Some(pod_status(phase, exit_code));
            }
        })
    }

    pub fn set_all_pods_phase(&self, phase: &str) {
        self.with(|s| {
            for pod in s.pods.values_mut() {
                pod.status = Some(pod_status(phase, None));
            }
        })
    }

    /// Fail the next `n` pod deletions, leaving the pods in place.
    pub fn fail_pod_deletes(&self, n: usize) {
        self.with(|s| s.pod_delete_failures = n)
    }

    /// Delete a pod behind the controller's back.
    pub fn remove_pod(&self, name: &str) {
        self.with(|s| {
            s.pods.remove(name);
        })
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self.with(|s| {
            s.pods
                .values()
                .filter(|p| matches_selector(p.metadata.labels.as_ref(), selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        self.with(|s| {
            s.calls.push(format!("create_pod {}", name));
            let mut created = pod.clone();
            created.status = Some(pod_status("Pending", None));
            s.pods.entry(name).or_insert(created);
        });
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            if s.pod_delete_failures > 0 {
                s.pod_delete_failures -= 1;
                return Err(Error::Internal(format!("delete pod {}: connection reset", name)));
            }
            s.calls.push(format!("delete_pod {}", name));
            s.pods.remove(name);
            Ok(())
        })
    }

    async fn list_services(&self, _namespace: &str, selector: &str) -> Result<Vec<Service>> {
        Ok(self.with(|s| {
            s.services
                .values()
                .filter(|svc| matches_selector(svc.metadata.labels.as_ref(), selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_service(&self, _namespace: &str, service: &Service) -> Result<()> {
        let name = service.name_any();
        self.with(|s| {
            s.calls.push(format!("create_service {}", name));
            s.services.entry(name).or_insert_with(|| service.clone());
        });
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("delete_service {}", name));
            s.services.remove(name);
        });
        Ok(())
    }

    async fn get_pod_group(&self, _namespace: &str, name: &str) -> Result<Option<PodGroup>> {
        Ok(self.with(|s| s.pod_groups.get(name).cloned()))
    }

    async fn create_pod_group(&self, _namespace: &str, group: &PodGroup) -> Result<()> {
        let name = group.name_any();
        self.with(|s| {
            s.calls.push(format!("create_pod_group {}", name));
            s.pod_groups.entry(name).or_insert_with(|| group.clone());
        });
        Ok(())
    }

    async fn patch_pod_group(
        &self,
        _namespace: &str,
        name: &str,
        spec: &PodGroupSpec,
    ) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("patch_pod_group {}", name));
            if let Some(group) = s.pod_groups.get_mut(name) {
                group.spec = spec.clone();
            }
        });
        Ok(())
    }

    async fn delete_pod_group(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("delete_pod_group {}", name));
            s.pod_groups.remove(name);
        });
        Ok(())
    }
}

struct StoredJob<K> {
    job: Option<K>,
    version: u64,
    status_writes: usize,
    finalizer_patches: usize,
    conflicts_pending: usize,
}

/// Single-object job store with resourceVersion checks.
pub struct FakeJobs<K> {
    state: Mutex<StoredJob<K>>,
}

impl<K: JobKind> FakeJobs<K> {
    pub fn new(job: K) -> Self {
        Self {
            state: Mutex::new(StoredJob {
                job: Some(job),
                version: 1,
                status_writes: 0,
                finalizer_patches: 0,
                conflicts_pending: 0,
            }),
        }
    }

    pub fn current(&self) -> Option<K> {
        self.state.lock().unwrap().job.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn finalizer_patches(&self) -> usize {
        self.state.lock().unwrap().finalizer_patches
    }

    /// Fail the next `n` writes as if another writer got there first.
    pub fn inject_conflicts(&self, n: usize) {
        self.state.lock().unwrap().conflicts_pending = n;
    }

    /// User deletion: the object lingers while finalizers remain.
    pub fn delete(&self) {
        let mut state = self.state.lock().unwrap();
        let remove = match state.job.as_mut() {
            Some(job) if job.finalizers().is_empty() => true,
            Some(job) => {
                job.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                false
            }
            None => false,
        };
        if remove {
            state.job = None;
        }
    }

    pub fn edit(&self, f: impl FnOnce(&mut K)) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let version = state.version.to_string();
        if let Some(job) = state.job.as_mut() {
            f(job);
            job.meta_mut().resource_version = Some(version);
        }
    }

    fn check_write(state: &mut StoredJob<K>, job: &K) -> Result<()> {
        if state.conflicts_pending > 0 {
            state.conflicts_pending -= 1;
            return Err(Error::Conflict("injected".to_string()));
        }
        let stored_version = state.version.to_string();
        if job.resource_version().as_deref() != Some(stored_version.as_str()) {
            return Err(Error::Conflict(format!(
                "resourceVersion {:?} is stale, current {}",
                job.resource_version(),
                stored_version
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<K: JobKind> JobClient<K> for FakeJobs<K> {
    async fn get(&self, _namespace: &str, _name: &str) -> Result<Option<K>> {
        Ok(self.current())
    }

    async fn replace_status(&self, job: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        Self::check_write(&mut state, job)?;
        state.version += 1;
        let version = state.version.to_string();
        state.status_writes += 1;
        let stored = state
            .job
            .as_mut()
            .ok_or_else(|| Error::Internal("job is gone".to_string()))?;
        if let Some(status) = job.job_status() {
            stored.set_job_status(status.clone());
        }
        stored.meta_mut().resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn patch_finalizers(&self, job: &K, finalizers: Vec<String>) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        Self::check_write(&mut state, job)?;
        state.version += 1;
        let version = state.version.to_string();
        state.finalizer_patches += 1;
        let stored = state
            .job
            .as_mut()
            .ok_or_else(|| Error::Internal("job is gone".to_string()))?;
        stored.meta_mut().finalizers = Some(finalizers);
        stored.meta_mut().resource_version = Some(version);
        let patched = stored.clone();
        if patched.meta().deletion_timestamp.is_some() && patched.finalizers().is_empty() {
            state.job = None;
        }
        Ok(patched)
    }
}

/// Keeps the reason of every published event.
#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(EventType, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == EventType::Warning)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.published
            .lock()
            .unwrap()
            .push((type_, reason.to_string()));
    }
}

#[test]
fn selector_matching_requires_every_term() {
    let labels = BTreeMap::from([
        ("a".to_string(), "1".to_string()),
        ("b".to_string(), "2".to_string()),
    ]);
    assert!(matches_selector(Some(&labels), "a=1,b=2"));
    assert!(!matches_selector(Some(&labels), "a=1,b=3"));
    assert!(!matches_selector(None, "a=1"));
}
