use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{JobStatus, ReplicaSpec, ReplicaType, RestartPolicy, RunPolicy};
use crate::engine::kind::{
    env, first_present, replica_hosts, replica_port, total_replicas, JobKind, JobKindName,
    KindOptions,
};
use crate::Result;

pub const REPLICA_MASTER: &str = "Master";
pub const REPLICA_WORKER: &str = "Worker";

/// PyTorch distributed data parallel job. Rank 0 is the master when one is declared.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "PyTorchJob",
    namespaced,
    status = "JobStatus",
    shortname = "ptj"
)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchJobSpec {
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Replica specs keyed by Master or Worker
    #[serde(default)]
    pub pytorch_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

impl PyTorchJob {
    /// Replica type hosting rank 0.
    fn rendezvous_type(&self) -> &'static str {
        if self.spec.pytorch_replica_specs.contains_key(REPLICA_MASTER) {
            REPLICA_MASTER
        } else {
            REPLICA_WORKER
        }
    }
}

impl JobKind for PyTorchJob {
    const KIND_NAME: JobKindName = JobKindName::PyTorchJob;
    const DEFAULT_CONTAINER_NAME: &'static str = "pytorch";
    const DEFAULT_PORT_NAME: &'static str = "pytorchjob-port";
    const DEFAULT_PORT: i32 = 23456;
    const DEFAULT_RESTART_POLICY: RestartPolicy = RestartPolicy::OnFailure;
    const REPLICA_TYPES: &'static [&'static str] = &[REPLICA_MASTER, REPLICA_WORKER];

    fn replica_specs(&self) -> &BTreeMap<ReplicaType, ReplicaSpec> {
        &self.spec.pytorch_replica_specs
    }

    fn replica_specs_mut(&mut self) -> &mut BTreeMap<ReplicaType, ReplicaSpec> {
        &mut self.spec.pytorch_replica_specs
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
        let rendezvous = self.rendezvous_type();
        let master_addr = replica_hosts(self, rendezvous)
            .into_iter()
            .next()
            .unwrap_or_default();
        let master_port = self
            .replica_specs()
            .get(rendezvous)
            .map(replica_port::<Self>)
            .unwrap_or(Self::DEFAULT_PORT);

        let rank = if replica_type == REPLICA_WORKER && rendezvous == REPLICA_MASTER {
            index + 1
        } else {
            index
        };

        vec![
            env("MASTER_ADDR", master_addr),
            env("MASTER_PORT", master_port.to_string()),
            env("WORLD_SIZE", total_replicas(self).to_string()),
            env("RANK", rank.to_string()),
            env("PYTHONUNBUFFERED", "0"),
        ]
    }

    fn init_containers(&self, replica_type: &str, options: &KindOptions) -> Result<Vec<Container>> {
        let Some(template) = &options.pytorch_init_container else {
            return Ok(Vec::new());
        };
        if replica_type != REPLICA_WORKER {
            return Ok(Vec::new());
        }
        match replica_hosts(self, REPLICA_MASTER).into_iter().next() {
            Some(master_addr) => template.render(&master_addr),
            None => Ok(Vec::new()),
        }
    }
}
