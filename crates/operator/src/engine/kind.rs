//! Job kind adapter contract.
//!
//! Every training framework implements [`JobKind`] on its custom resource. The
//! generic reconciler only ever talks to jobs through this trait, so adding a
//! framework means adding a CRD type and one impl block.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar};
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::common::{
    CleanPodPolicy, JobStatus, ReplicaSpec, ReplicaType, RestartPolicy, RunPolicy,
};
use crate::kubernetes::resources::service_host;
use crate::template::InitContainerTemplate;
use crate::{Error, Result};

/// The job kinds compiled into the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKindName {
    TFJob,
    PyTorchJob,
    MXJob,
    XGBoostJob,
    MPIJob,
}

impl JobKindName {
    pub fn all() -> [JobKindName; 5] {
        [
            JobKindName::TFJob,
            JobKindName::PyTorchJob,
            JobKindName::MXJob,
            JobKindName::XGBoostJob,
            JobKindName::MPIJob,
        ]
    }

    /// Lowercase form used in labels and on the command line.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobKindName::TFJob => "tfjob",
            JobKindName::PyTorchJob => "pytorchjob",
            JobKindName::MXJob => "mxjob",
            JobKindName::XGBoostJob => "xgboostjob",
            JobKindName::MPIJob => "mpijob",
        }
    }
}

impl fmt::Display for JobKindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKindName::TFJob => write!(f, "TFJob"),
            JobKindName::PyTorchJob => write!(f, "PyTorchJob"),
            JobKindName::MXJob => write!(f, "MXJob"),
            JobKindName::XGBoostJob => write!(f, "XGBoostJob"),
            JobKindName::MPIJob => write!(f, "MPIJob"),
        }
    }
}

impl FromStr for JobKindName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tfjob" => Ok(JobKindName::TFJob),
            "pytorchjob" => Ok(JobKindName::PyTorchJob),
            "mxjob" | "mxnetjob" => Ok(JobKindName::MXJob),
            "xgboostjob" => Ok(JobKindName::XGBoostJob),
            "mpijob" => Ok(JobKindName::MPIJob),
            other => Err(Error::UnsupportedKind(other.to_string())),
        }
    }
}

/// Spec and status accessors plus framework defaults for one job kind.
pub trait JobKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND_NAME: JobKindName;
    /// Container that receives the framework port and is inspected for it
    const DEFAULT_CONTAINER_NAME: &'static str;
    const DEFAULT_PORT_NAME: &'static str;
    const DEFAULT_PORT: i32;
    const DEFAULT_RESTART_POLICY: RestartPolicy;
    /// Canonical spelling of the replica types this kind understands
    const REPLICA_TYPES: &'static [&'static str];

    fn replica_specs(&self) -> &BTreeMap<ReplicaType, ReplicaSpec>;
    fn replica_specs_mut(&mut self) -> &mut BTreeMap<ReplicaType, ReplicaSpec>;
    fn run_policy(&self) -> &RunPolicy;
    fn run_policy_mut(&mut self) -> &mut RunPolicy;
    fn job_status(&self) -> Option<&JobStatus>;
    fn set_job_status(&mut self, status: JobStatus);

    /// Replica types whose completion completes the job.
    fn completion_replica_types(&self) -> Vec<ReplicaType>;

    /// Replica types that must be co-scheduled. All of them unless a kind says otherwise.
    fn gang_replica_types(&self) -> Vec<ReplicaType> {
        self.replica_specs().keys().cloned().collect()
    }

    /// Framework bootstrap environment for one replica.
    fn cluster_env(&self, replica_type: &str, index: i32) -> Vec<EnvVar>;

    /// Init containers placed ahead of the template's own in one replica's pod.
    fn init_containers(&self, _replica_type: &str, _options: &KindOptions) -> Result<Vec<Container>> {
        Ok(Vec::new())
    }

    fn set_defaults(&mut self) {
        apply_defaults(self);
    }
}

/// Operator-wide settings some kinds apply to the pods they build.
#[derive(Debug, Clone, Default)]
pub struct KindOptions {
    /// Holds PyTorch workers until the master's service resolves
    pub pytorch_init_container: Option<InitContainerTemplate>,
}

/// Fill unset fields with the kind's defaults.
pub fn apply_defaults<K: JobKind>(job: &mut K) {
    let specs = std::mem::take(job.replica_specs_mut());
    let mut canonical = BTreeMap::new();
    for (replica_type, mut spec) in specs {
        let key = K::REPLICA_TYPES
            .iter()
            .find(|known| known.eq_ignore_ascii_case(&replica_type))
            .map(|known| known.to_string())
            .unwrap_or(replica_type);

        if spec.replicas.is_none() {
            spec.replicas = Some(1);
        }
        if spec.restart_policy.is_none() {
            spec.restart_policy = Some(K::DEFAULT_RESTART_POLICY);
        }
        set_default_port::<K>(&mut spec);
        canonical.insert(key, spec);
    }
    *job.replica_specs_mut() = canonical;

    let policy = job.run_policy_mut();
    if policy.clean_pod_policy.is_none() {
        policy.clean_pod_policy = Some(CleanPodPolicy::None);
    }
}

fn set_default_port<K: JobKind>(spec: &mut ReplicaSpec) {
    let Some(pod_spec) = spec.template.spec.as_mut() else {
        return;
    };
    let Some(container) = pod_spec
        .containers
        .iter_mut()
        .find(|c| c.name == K::DEFAULT_CONTAINER_NAME)
    else {
        return;
    };
    let ports = container.ports.get_or_insert_with(Vec::new);
    if !ports
        .iter()
        .any(|p| p.name.as_deref() == Some(K::DEFAULT_PORT_NAME))
    {
        ports.push(ContainerPort {
            name: Some(K::DEFAULT_PORT_NAME.to_string()),
            container_port: K::DEFAULT_PORT,
            ..Default::default()
        });
    }
}

/// Reject specs the engine cannot act on. Runs after defaulting.
pub fn validate<K: JobKind>(job: &K) -> Result<()> {
    let specs = job.replica_specs();
    if specs.is_empty() {
        return Err(Error::Validation(format!(
            "{} {} has no replica specs",
            K::KIND_NAME,
            job.name_any()
        )));
    }
    let policy = job.run_policy();
    for (field, value) in [
        ("activeDeadlineSeconds", policy.active_deadline_seconds),
        ("ttlSecondsAfterFinished", policy.ttl_seconds_after_finished.map(i64::from)),
        ("backoffLimit", policy.backoff_limit.map(i64::from)),
    ] {
        if let Some(value) = value.filter(|v| *v < 0) {
            return Err(Error::Validation(format!(
                "runPolicy.{} must not be negative ({})",
                field, value
            )));
        }
    }
    for (replica_type, spec) in specs {
        if spec.desired_replicas() < 0 {
            return Err(Error::Validation(format!(
                "replica type {} has negative replicas ({})",
                replica_type,
                spec.desired_replicas()
            )));
        }
        let has_containers = spec
            .template
            .spec
            .as_ref()
            .map(|s| !s.containers.is_empty())
            .unwrap_or(false);
        if !has_containers {
            return Err(Error::Validation(format!(
                "replica type {} has a pod template without containers",
                replica_type
            )));
        }
    }
    Ok(())
}

/// Port exposed by the replicas of one type: the default container's named
/// port if declared, the kind default otherwise.
pub fn replica_port<K: JobKind>(spec: &ReplicaSpec) -> i32 {
    spec.template
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == K::DEFAULT_CONTAINER_NAME))
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(K::DEFAULT_PORT_NAME))
                .map(|p| p.container_port)
        })
        .unwrap_or(K::DEFAULT_PORT)
}

/// Service host names of every replica of one type, in index order.
pub fn replica_hosts<K: JobKind>(job: &K, replica_type: &str) -> Vec<String> {
    let name = job.name_any();
    let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
    let replicas = job
        .replica_specs()
        .get(replica_type)
        .map(|s| s.desired_replicas())
        .unwrap_or(0);
    (0..replicas)
        .map(|index| service_host(&name, &namespace, replica_type, index))
        .collect()
}

/// First of `candidates` present in the job, as the completion-determining set.
pub fn first_present<K: JobKind>(job: &K, candidates: &[&str]) -> Vec<ReplicaType> {
    candidates
        .iter()
        .find(|c| job.replica_specs().contains_key(**c))
        .map(|c| vec![c.to_string()])
        .unwrap_or_default()
}

pub fn total_replicas<K: JobKind>(job: &K) -> i32 {
    job.replica_specs()
        .values()
        .map(|s| s.desired_replicas())
        .sum()
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}
