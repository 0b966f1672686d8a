//! Types shared by every training job kind: replica specs, run policy and
//! the job status with its condition log.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of a role within a job, e.g. `Worker` or `PS`.
pub type ReplicaType = String;

/// Restart behaviour for the replicas of one replica type.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    /// The kubelet restarts containers in place; the controller never sees a failure.
    Always,
    /// Failed replicas are recreated until the backoff limit is exceeded.
    OnFailure,
    /// Any failed replica fails the job.
    Never,
    /// Like `OnFailure`, but only for retryable exit codes.
    ExitCode,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "Always"),
            RestartPolicy::OnFailure => write!(f, "OnFailure"),
            RestartPolicy::Never => write!(f, "Never"),
            RestartPolicy::ExitCode => write!(f, "ExitCode"),
        }
    }
}

/// Which pods are removed once a job finishes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, JsonSchema, PartialEq, Eq, Default)]
pub enum CleanPodPolicy {
    /// Delete every owned pod.
    All,
    /// Delete pods that are still pending or running.
    Running,
    /// Leave pods in place.
    #[default]
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired number of replicas. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template used for every replica of this type
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// Restart policy for replicas of this type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

impl ReplicaSpec {
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    /// Minimum number of members the scheduling group needs before any pod is admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,

    /// Scheduler queue for the group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Priority class applied to the group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Pods to delete once the job finishes. Defaults to `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    /// Seconds to keep owned pods after the job finishes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Seconds the job may stay active before it is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Number of replica restarts allowed before the job is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Gang scheduling parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
}

/// Per replica-type pod counts observed during one reconcile.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Eq, Default)]
pub struct ReplicaStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Created => write!(f, "Created"),
            ConditionType::Running => write!(f, "Running"),
            ConditionType::Restarting => write!(f, "Restarting"),
            ConditionType::Succeeded => write!(f, "Succeeded"),
            ConditionType::Failed => write!(f, "Failed"),
        }
    }
}

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// "True" or "False"
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl JobCondition {
    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Condition log, at most one entry per condition type
    #[serde(default)]
    pub conditions: Vec<JobCondition>,

    /// Pod counts per replica type
    #[serde(default)]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    /// Replica failures the controller has restarted so far
    #[serde(default)]
    pub restart_count: i32,
}
