use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{JobStatus, ReplicaSpec, ReplicaType, RestartPolicy, RunPolicy};
use crate::engine::kind::{
    env, first_present, replica_hosts, replica_port, JobKind, JobKindName,
};

pub const REPLICA_SCHEDULER: &str = "Scheduler";
pub const REPLICA_SERVER: &str = "Server";
pub const REPLICA_WORKER: &str = "Worker";
pub const REPLICA_TUNER_TRACKER: &str = "TunerTracker";
pub const REPLICA_TUNER_SERVER: &str = "TunerServer";
pub const REPLICA_TUNER: &str = "Tuner";

/// Apache MXNet job, either distributed training or auto-tuning.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "MXJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MXJobSpec {
    #[serde(default)]
    pub run_policy: RunPolicy,

    #[serde(default)]
    pub mx_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

fn replica_count(job: &MXJob, replica_type: &str) -> i32 {
    job.replica_specs()
        .get(replica_type)
        .map(|s| s.desired_replicas())
        .unwrap_or(0)
}

impl JobKind for MXJob {
    const KIND_NAME: JobKindName = JobKindName::MXJob;
    const DEFAULT_CONTAINER_NAME: &'static str = "mxnet";
    const DEFAULT_PORT_NAME: &'static str = "mxjob-port";
    const DEFAULT_PORT: i32 = 9091;
    const DEFAULT_RESTART_POLICY: RestartPolicy = RestartPolicy::Never;
    const REPLICA_TYPES: &'static [&'static str] = &[
        REPLICA_SCHEDULER,
        REPLICA_SERVER,
        REPLICA_WORKER,
        REPLICA_TUNER_TRACKER,
        REPLICA_TUNER_SERVER,
        REPLICA_TUNER,
    ];

    fn replica_specs(&self) -> &BTreeMap<ReplicaType, ReplicaSpec> {
        &self.spec.mx_replica_specs
    }

    fn replica_specs_mut(&mut self) -> &mut BTreeMap<ReplicaType, ReplicaSpec> {
        &mut self.spec.mx_replica_specs
    }

    fn run_policy(&self) -> &RunPolicy {
        &self.spec.run_policy
    }

    fn run_policy_mut(&mut self) -> &mut RunPolicy {
        &mut self.spec.run_policy
    }

    fn job_status(&self) -> Option<&JobStatus> {
        self.status.as_ref()
    }

    fn set_job_status(&mut self, status: JobStatus) {
        self.status = Some(status);
    }

    fn completion_replica_types(&self) -> Vec<ReplicaType> {
        first_present(self, &[REPLICA_WORKER, REPLICA_TUNER, REPLICA_SCHEDULER])
    }

    fn cluster_env(&self, replica_type: &str, _index: i32) -> Vec<EnvVar> {
        let root_uri = replica_hosts(self, REPLICA_SCHEDULER)
            .into_iter()
            .next()
            .unwrap_or_default();
        let root_port = self
            .replica_specs()
            .get(REPLICA_SCHEDULER)
            .map(replica_port::<Self>)
            .unwrap_or(Self::DEFAULT_PORT);

        vec![
            env("DMLC_PS_ROOT_URI", root_uri),
            env("DMLC_PS_ROOT_PORT", root_port.to_string()),
            env(
                "DMLC_NUM_SERVER",
                replica_count(self, REPLICA_SERVER).to_string(),
            ),
            env(
                "DMLC_NUM_WORKER",
                replica_count(self, REPLICA_WORKER).to_string(),
            ),
            env("DMLC_ROLE", replica_type.to_lowercase()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> MXJob {
        let mut job = MXJob::new(
            "mx",
            MXJobSpec {
                run_policy: RunPolicy::default(),
                mx_replica_specs: [("Scheduler", 1), ("Server", 2), ("Worker", 4)]
                    .iter()
                    .map(|(t, n)| {
                        (
                            t.to_string(),
                            ReplicaSpec {
                                replicas: Some(*n),
                                ..Default::default()
                            },
                        )
                    })
                    .collect(),
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job
    }

    #[test]
    fn dmlc_env_points_at_scheduler() {
        let vars = job().cluster_env("Server", 1);
        let get = |name: &str| {
            vars.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
                .unwrap()
        };
        assert_eq!(get("DMLC_PS_ROOT_URI"), "mx-scheduler-0.default.svc");
        assert_eq!(get("DMLC_PS_ROOT_PORT"), "9091");
        assert_eq!(get("DMLC_NUM_SERVER"), "2");
        assert_eq!(get("DMLC_NUM_WORKER"), "4");
        assert_eq!(get("DMLC_ROLE"), "server");
    }

    #[test]
    fn workers_decide_completion() {
        assert_eq!(job().completion_replica_types(), vec!["Worker"]);
    }
}
