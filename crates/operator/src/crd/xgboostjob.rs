use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{JobStatus, ReplicaSpec, ReplicaType, RestartPolicy, RunPolicy};
use crate::engine::kind::{
    env, first_present, replica_hosts, replica_port, total_replicas, JobKind, JobKindName,
};

pub const REPLICA_MASTER: &str = "Master";
pub const REPLICA_WORKER: &str = "Worker";

/// XGBoost job using the Rabit tracker hosted on the master.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "XGBoostJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct XGBoostJobSpec {
    #[serde(default)]
    pub run_policy: RunPolicy,

    #[serde(default)]
    pub xgb_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

impl JobKind for XGBoostJob {
    const KIND_NAME: JobKindName = JobKindName::XGBoostJob;
    const DEFAULT_CONTAINER_NAME: &'static str = "xgboost";
    const DEFAULT_PORT_NAME: &'static str = "xgboostjob-port";
    const DEFAULT_PORT: i32 = 9999;
    const DEFAULT_RESTART_POLICY: RestartPolicy = RestartPolicy::Never;
    const REPLICA_TYPES: &'static [&'static str] = &[REPLICA_MASTER, REPLICA_WORKER];

    fn replica_specs(&self) -> &BTreeMap<ReplicaType, ReplicaSpec> {
        &self.spec.xgb_replica_specs
    }

    fn replica_specs_mut(&mut self) -> &mut BTreeMap<ReplicaType, ReplicaSpec> {
        &mut self.spec.xgb_replica_specs
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
        first_present(self, &[REPLICA_MASTER, REPLICA_WORKER])
    }

    fn cluster_env(&self, replica_type: &str, index: i32) -> Vec<EnvVar> {
        let master_addr = replica_hosts(self, REPLICA_MASTER)
            .into_iter()
            .next()
            .unwrap_or_default();
        let master_port = self
            .replica_specs()
            .get(REPLICA_MASTER)
            .map(replica_port::<Self>)
            .unwrap_or(Self::DEFAULT_PORT);
        let worker_port = self
            .replica_specs()
            .get(REPLICA_WORKER)
            .map(replica_port::<Self>)
            .unwrap_or(Self::DEFAULT_PORT);

        let rank = if replica_type == REPLICA_WORKER {
            index + 1
        } else {
            index
        };

        vec![
            env("MASTER_ADDR", master_addr),
            env("MASTER_PORT", master_port.to_string()),
            env("WORLD_SIZE", total_replicas(self).to_string()),
            env("RANK", rank.to_string()),
            env("WORKER_PORT", worker_port.to_string()),
            env(
                "WORKER_ADDRS",
                replica_hosts(self, REPLICA_WORKER).join(","),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_env_lists_peers() {
        let mut job = XGBoostJob::new(
            "boost",
            XGBoostJobSpec {
                run_policy: RunPolicy::default(),
                xgb_replica_specs: BTreeMap::from([
                    (
                        "Master".to_string(),
                        ReplicaSpec {
                            replicas: Some(1),
                            ..Default::default()
                        },
                    ),
                    (
                        "Worker".to_string(),
                        ReplicaSpec {
                            replicas: Some(2),
                            ..Default::default()
                        },
                    ),
                ]),
            },
        );
        job.metadata.namespace = Some("ml".to_string());

        let vars = job.cluster_env("Worker", 0);
        let get = |name: &str| {
            vars.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
                .unwrap()
        };
        assert_eq!(get("MASTER_ADDR"), "boost-master-0.ml.svc");
        assert_eq!(get("RANK"), "1");
        assert_eq!(get("WORLD_SIZE"), "3");
        assert_eq!(get("WORKER_PORT"), "9999");
        assert_eq!(
            get("WORKER_ADDRS"),
            "boost-worker-0.ml.svc,boost-worker-1.ml.svc"
        );
        assert_eq!(job.completion_replica_types(), vec!["Master"]);
    }
}
