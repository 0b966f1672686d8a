use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{JobStatus, ReplicaSpec, ReplicaType, RestartPolicy, RunPolicy};
use crate::engine::kind::{env, first_present, replica_hosts, JobKind, JobKindName};

pub const REPLICA_LAUNCHER: &str = "Launcher";
pub const REPLICA_WORKER: &str = "Worker";

/// MPI job: a single launcher drives `mpirun` across the workers.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "MPIJob",
    namespaced,
    status = "JobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobSpec {
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Slots per worker written into the host list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots_per_worker: Option<i32>,

    #[serde(default)]
    pub mpi_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

impl JobKind for MPIJob {
    const KIND_NAME: JobKindName = JobKindName::MPIJob;
    const DEFAULT_CONTAINER_NAME: &'static str = "mpi";
    const DEFAULT_PORT_NAME: &'static str = "mpijob-port";
    const DEFAULT_PORT: i32 = 22;
    const DEFAULT_RESTART_POLICY: RestartPolicy = RestartPolicy::Never;
    const REPLICA_TYPES: &'static [&'static str] = &[REPLICA_LAUNCHER, REPLICA_WORKER];

    fn replica_specs(&self) -> &BTreeMap<ReplicaType, ReplicaSpec> {
        &self.spec.mpi_replica_specs
    }

    fn replica_specs_mut(&mut self) -> &mut BTreeMap<ReplicaType, ReplicaSpec> {
        &mut self.spec.mpi_replica_specs
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
        first_present(self, &[REPLICA_LAUNCHER, REPLICA_WORKER])
    }

    fn cluster_env(&self, replica_type: &str, _index: i32) -> Vec<EnvVar> {
        let role = if replica_type == REPLICA_LAUNCHER {
            "launcher"
        } else {
            "worker"
        };
        let slots = self.spec.slots_per_worker.unwrap_or(1);
        let hosts = replica_hosts(self, REPLICA_WORKER)
            .into_iter()
            .map(|host| format!("{}:{}", host, slots))
            .collect::<Vec<_>>()
            .join(",");

        vec![
            env("K_MPI_JOB_ROLE", role),
            env("OMPI_MCA_orte_default_hostfile_hosts", hosts),
            env("OMPI_MCA_orte_keep_fqdn_hostnames", "true"),
        ]
    }
}
