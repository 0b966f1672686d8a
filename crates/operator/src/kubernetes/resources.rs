//! Deterministic naming, labels and manifests for the pods and services a
//! job owns.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::common::{ReplicaSpec, RestartPolicy};
use crate::engine::kind::{replica_port, JobKind};
use crate::{Error, Result};

pub const OPERATOR_NAME_LABEL: &str = "training.kubeflow.org/operator-name";
pub const JOB_NAME_LABEL: &str = "training.kubeflow.org/job-name";
pub const REPLICA_TYPE_LABEL: &str = "training.kubeflow.org/replica-type";
pub const REPLICA_INDEX_LABEL: &str = "training.kubeflow.org/replica-index";
pub const JOB_ROLE_LABEL: &str = "training.kubeflow.org/job-role";

pub const JOB_FINALIZER: &str = "training.kubeflow.org/job-cleanup";

/// Name shared by the pod and the service of one replica.
pub fn replica_name(job_name: &str, replica_type: &str, index: i32) -> String {
    format!("{}-{}-{}", job_name, replica_type.to_lowercase(), index)
}

/// In-cluster DNS name of one replica's service.
pub fn service_host(job_name: &str, namespace: &str, replica_type: &str, index: i32) -> String {
    format!(
        "{}.{}.svc",
        replica_name(job_name, replica_type, index),
        namespace
    )
}

pub fn job_labels(kind_label: &str, job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OPERATOR_NAME_LABEL.to_string(), kind_label.to_string()),
        (JOB_NAME_LABEL.to_string(), job_name.to_string()),
    ])
}

pub fn replica_labels(
    kind_label: &str,
    job_name: &str,
    replica_type: &str,
    index: i32,
) -> BTreeMap<String, String> {
    let mut labels = job_labels(kind_label, job_name);
    labels.insert(
        REPLICA_TYPE_LABEL.to_string(),
        replica_type.to_lowercase(),
    );
    labels.insert(REPLICA_INDEX_LABEL.to_string(), index.to_string());
    labels
}

/// Label selector matching every pod or service owned by a job.
pub fn job_selector(kind_label: &str, job_name: &str) -> String {
    selector_string(&job_labels(kind_label, job_name))
}

/// Label selector matching the pods or services of one replica type.
pub fn replica_type_selector(kind_label: &str, job_name: &str, replica_type: &str) -> String {
    let mut labels = job_labels(kind_label, job_name);
    labels.insert(
        REPLICA_TYPE_LABEL.to_string(),
        replica_type.to_lowercase(),
    );
    selector_string(&labels)
}

fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Replica index carried in an object's labels, if present and well formed.
pub fn replica_index(meta: &ObjectMeta) -> Option<i32> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(REPLICA_INDEX_LABEL))
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|i| *i >= 0)
}

/// Whether `meta` carries a controller owner reference to the object with `uid`.
pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == uid)
        })
        .unwrap_or(false)
}

pub fn owner_reference<K: JobKind>(job: &K) -> Result<OwnerReference> {
    job.controller_owner_ref(&()).ok_or_else(|| {
        Error::Internal(format!(
            "{} {} has no uid; cannot own resources",
            K::KIND_NAME,
            job.name_any()
        ))
    })
}

/// Pod-level restart policy. The controller recreates failed replicas itself
/// so every failure is observed; only `Always` is left to the kubelet.
pub fn pod_restart_policy(policy: RestartPolicy) -> &'static str {
    match policy {
        RestartPolicy::Always => "Always",
        RestartPolicy::OnFailure | RestartPolicy::Never | RestartPolicy::ExitCode => "Never",
    }
}

/// Pod for one replica, built from the replica's template.
pub fn build_pod<K: JobKind>(
    job: &K,
    replica_type: &str,
    index: i32,
    spec: &ReplicaSpec,
) -> Result<Pod> {
    let job_name = job.name_any();
    let name = replica_name(&job_name, replica_type, index);
    let template = spec.template.clone();
    let template_meta = template.metadata.unwrap_or_default();

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.extend(replica_labels(
        K::KIND_NAME.as_label(),
        &job_name,
        replica_type,
        index,
    ));
    if index == 0
        && job
            .completion_replica_types()
            .iter()
            .any(|t| t == replica_type)
    {
        labels.insert(JOB_ROLE_LABEL.to_string(), "master".to_string());
    }

    let mut pod_spec = template.spec.unwrap_or_default();
    let policy = spec.restart_policy.unwrap_or(K::DEFAULT_RESTART_POLICY);
    pod_spec.restart_policy = Some(pod_restart_policy(policy).to_string());

    let cluster_env = job.cluster_env(replica_type, index);
    for container in pod_spec.containers.iter_mut() {
        let env = container.env.get_or_insert_with(Vec::new);
        for var in &cluster_env {
            // user-provided values win
            if !env.iter().any(|e| e.name == var.name) {
                env.push(var.clone());
            }
        }
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: job.namespace(),
            labels: Some(labels),
            annotations: template_meta.annotations,
            owner_references: Some(vec![owner_reference(job)?]),
            ..Default::default()
        },
        spec: Some(pod_spec),
        ..Default::default()
    })
}

/// Headless service addressing exactly one replica's pod.
pub fn build_service<K: JobKind>(
    job: &K,
    replica_type: &str,
    index: i32,
    spec: &ReplicaSpec,
) -> Result<Service> {
    let job_name = job.name_any();
    let labels = replica_labels(K::KIND_NAME.as_label(), &job_name, replica_type, index);
    let port = replica_port::<K>(spec);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(replica_name(&job_name, replica_type, index)),
            namespace: job.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(job)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(K::DEFAULT_PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
