//! Gang scheduling adapter.
//!
//! The engine only guarantees that a job's scheduling group exists, with the
//! right minimum size, before any of its pods is created. Admission is the
//! scheduler's business; nothing here waits on the group's phase.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::podgroup::{PodGroup, PodGroupSpec};
use crate::engine::kind::JobKind;
use crate::kubernetes::client::ClusterClient;
use crate::kubernetes::resources::owner_reference;
use crate::Result;

pub const GROUP_NAME_ANNOTATION: &str = "scheduling.k8s.io/group-name";
pub const TASK_SPEC_ANNOTATION: &str = "volcano.sh/task-spec";

/// Desired state of one job's scheduling group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRequest {
    pub namespace: String,
    pub name: String,
    pub min_member: i32,
    pub queue: Option<String>,
    pub priority_class: Option<String>,
    pub owner: OwnerReference,
}

impl GroupRequest {
    pub fn for_job<K: JobKind>(job: &K) -> Result<Self> {
        let scheduling = job.run_policy().scheduling_policy.clone().unwrap_or_default();
        Ok(Self {
            namespace: job.namespace().unwrap_or_default(),
            name: job.name_any(),
            min_member: min_member(job),
            queue: scheduling.queue,
            priority_class: scheduling.priority_class,
            owner: owner_reference(job)?,
        })
    }

    fn spec(&self) -> PodGroupSpec {
        PodGroupSpec {
            min_member: self.min_member,
            queue: self.queue.clone(),
            priority_class_name: self.priority_class.clone(),
        }
    }
}

/// Explicit `minAvailable` if set, else every replica of the gang types.
pub fn min_member<K: JobKind>(job: &K) -> i32 {
    if let Some(min) = job
        .run_policy()
        .scheduling_policy
        .as_ref()
        .and_then(|s| s.min_available)
    {
        return min;
    }
    let specs = job.replica_specs();
    job.gang_replica_types()
        .iter()
        .filter_map(|t| specs.get(t))
        .map(|s| s.desired_replicas())
        .sum()
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GangScheduler: Send + Sync {
    /// Create the group if absent, update it if its spec drifted.
    async fn ensure(&self, request: &GroupRequest) -> Result<()>;

    /// Remove the group. Removing a missing group succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Bind a pod to the group before it is created.
    fn decorate_pod(&self, pod: &mut Pod, group_name: &str, replica_type: &str);
}

pub struct VolcanoScheduler {
    client: Arc<dyn ClusterClient>,
    scheduler_name: String,
}

impl VolcanoScheduler {
    pub fn new(client: Arc<dyn ClusterClient>, scheduler_name: impl Into<String>) -> Self {
        Self {
            client,
            scheduler_name: scheduler_name.into(),
        }
    }
}

#[async_trait]
impl GangScheduler for VolcanoScheduler {
    async fn ensure(&self, request: &GroupRequest) -> Result<()> {
        let desired = request.spec();
        match self
            .client
            .get_pod_group(&request.namespace, &request.name)
            .await?
        {
            None => {
                let mut group = PodGroup::new(&request.name, desired);
                group.metadata = ObjectMeta {
                    name: Some(request.name.clone()),
                    namespace: Some(request.namespace.clone()),
                    owner_references: Some(vec![request.owner.clone()]),
                    ..Default::default()
                };
                info!(
                    namespace = %request.namespace,
                    pod_group = %request.name,
                    min_member = request.min_member,
                    "Creating pod group"
                );
                self.client
                    .create_pod_group(&request.namespace, &group)
                    .await
            }
            Some(existing) if existing.spec != desired => {
                info!(
                    namespace = %request.namespace,
                    pod_group = %request.name,
                    min_member = request.min_member,
                    "Updating pod group"
                );
                self.client
                    .patch_pod_group(&request.namespace, &request.name, &desired)
                    .await
            }
            Some(_) => {
                debug!(pod_group = %request.name, "Pod group up to date");
                Ok(())
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        if self.client.get_pod_group(namespace, name).await?.is_none() {
            return Ok(());
        }
        info!(namespace, pod_group = name, "Deleting pod group");
        self.client.delete_pod_group(namespace, name).await
    }

    fn decorate_pod(&self, pod: &mut Pod, group_name: &str, replica_type: &str) {
        if let Some(spec) = pod.spec.as_mut() {
            spec.scheduler_name = Some(self.scheduler_name.clone());
        }
        let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(GROUP_NAME_ANNOTATION.to_string(), group_name.to_string());
        annotations.insert(
            TASK_SPEC_ANNOTATION.to_string(),
            replica_type.to_lowercase(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::{ReplicaSpec, RunPolicy, SchedulingPolicy};
    use crate::crd::tfjob::{TFJob, TFJobSpec};
    use crate::kubernetes::client::MockClusterClient;
    use k8s_openapi::api::core::v1::PodSpec;
    use std::collections::BTreeMap;

    fn job(min_available: Option<i32>) -> TFJob {
        let mut job = TFJob::new(
            "mnist",
            TFJobSpec {
                run_policy: RunPolicy {
                    scheduling_policy: Some(SchedulingPolicy {
                        min_available,
                        queue: Some("research".to_string()),
                        priority_class: None,
                    }),
                    ..Default::default()
                },
                tf_replica_specs: BTreeMap::from([
                    (
                        "PS".to_string(),
                        ReplicaSpec {
                            replicas: Some(2),
                            ..Default::default()
                        },
                    ),
                    (
                        "Worker".to_string(),
                        ReplicaSpec {
                            replicas: Some(4),
                            ..Default::default()
                        },
                    ),
                ]),
            },
        );
        job.metadata.namespace = Some("ml".to_string());
        job.metadata.uid = Some("uid-1".to_string());
        job
    }

    #[test]
    fn min_member_sums_gang_types() {
        assert_eq!(min_member(&job(None)), 6);
        assert_eq!(min_member(&job(Some(3))), 3);
    }

    #[tokio::test]
    async fn ensure_creates_missing_group() {
        let mut client = MockClusterClient::new();
        client.expect_get_pod_group().returning(|_, _| Ok(None));
        client
            .expect_create_pod_group()
            .withf(|ns, group| {
                ns == "ml"
                    && group.spec.min_member == 6
                    && group.spec.queue.as_deref() == Some("research")
                    && group.metadata.owner_references.is_some()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let scheduler = VolcanoScheduler::new(Arc::new(client), "volcano");
        let request = GroupRequest::for_job(&job(None)).unwrap();
        scheduler.ensure(&request).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_patches_only_on_drift() {
        let request = GroupRequest::for_job(&job(None)).unwrap();

        let mut client = MockClusterClient::new();
        let current = PodGroup::new("mnist", request.spec());
        client
            .expect_get_pod_group()
            .returning(move |_, _| Ok(Some(current.clone())));
        client.expect_patch_pod_group().never();
        client.expect_create_pod_group().never();
        let scheduler = VolcanoScheduler::new(Arc::new(client), "volcano");
        scheduler.ensure(&request).await.unwrap();

        let mut client = MockClusterClient::new();
        let stale = PodGroup::new(
            "mnist",
            PodGroupSpec {
                min_member: 2,
                ..Default::default()
            },
        );
        client
            .expect_get_pod_group()
            .returning(move |_, _| Ok(Some(stale.clone())));
        client
            .expect_patch_pod_group()
            .withf(|_, name, spec| name == "mnist" && spec.min_member == 6)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let scheduler = VolcanoScheduler::new(Arc::new(client), "volcano");
        scheduler.ensure(&request).await.unwrap();
    }

    #[test]
    fn decorated_pod_names_scheduler_and_group() {
        let scheduler = VolcanoScheduler::new(Arc::new(MockClusterClient::new()), "volcano");
        let mut pod = Pod {
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        scheduler.decorate_pod(&mut pod, "mnist", "Worker");

        assert_eq!(
            pod.spec.as_ref().unwrap().scheduler_name.as_deref(),
            Some("volcano")
        );
        let annotations = pod.metadata.annotations.unwrap();
        assert_eq!(annotations[GROUP_NAME_ANNOTATION], "mnist");
        assert_eq!(annotations[TASK_SPEC_ANNOTATION], "worker");
    }
}
