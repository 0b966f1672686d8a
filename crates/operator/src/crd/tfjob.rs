use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::crd::common::{JobStatus, ReplicaSpec, ReplicaType, RestartPolicy, RunPolicy};
use crate::engine::kind::{
    env, first_present, replica_hosts, replica_port, JobKind, JobKindName,
};

pub const REPLICA_PS: &str = "PS";
pub const REPLICA_WORKER: &str = "Worker";
pub const REPLICA_CHIEF: &str = "Chief";
pub const REPLICA_MASTER: &str = "Master";
pub const REPLICA_EVALUATOR: &str = "Evaluator";

/// TensorFlow distributed training job (parameter server or multi-worker).
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Default)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "TFJob",
    namespaced,
    status = "JobStatus",
    shortname = "tfj"
)]
#[serde(rename_all = "camelCase")]
pub struct TFJobSpec {
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Replica specs keyed by PS, Worker, Chief, Master or Evaluator
    #[serde(default)]
    pub tf_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

impl JobKind for TFJob {
    const KIND_NAME: JobKindName = JobKindName::TFJob;
    const DEFAULT_CONTAINER_NAME: &'static str = "tensorflow";
    const DEFAULT_PORT_NAME: &'static str = "tfjob-port";
    const DEFAULT_PORT: i32 = 2222;
    const DEFAULT_RESTART_POLICY: RestartPolicy = RestartPolicy::Never;
    const REPLICA_TYPES: &'static [&'static str] = &[
        REPLICA_PS,
        REPLICA_WORKER,
        REPLICA_CHIEF,
        REPLICA_MASTER,
        REPLICA_EVALUATOR,
    ];

    fn replica_specs(&self) -> &BTreeMap<ReplicaType, ReplicaSpec> {
        &self.spec.tf_replica_specs
    }

    fn replica_specs_mut(&mut self) -> &mut BTreeMap<ReplicaType, ReplicaSpec> {
        &mut self.spec.tf_replica_specs
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
        first_present(self, &[REPLICA_CHIEF, REPLICA_MASTER, REPLICA_WORKER])
    }

    fn cluster_env(&self, replica_type: &str, index: i32) -> Vec<EnvVar> {
        let mut cluster = Map::new();
        for (rtype, spec) in self.replica_specs() {
            // evaluators run outside the training cluster
            if rtype == REPLICA_EVALUATOR {
                continue;
            }
            let port = replica_port::<Self>(spec);
            let hosts: Vec<Value> = replica_hosts(self, rtype)
                .into_iter()
                .map(|host| Value::String(format!("{}:{}", host, port)))
                .collect();
            cluster.insert(rtype.to_lowercase(), Value::Array(hosts));
        }

        let tf_config = json!({
            "cluster": cluster,
            "task": {
                "type": replica_type.to_lowercase(),
                "index": index,
            },
            "environment": "cloud",
        });
        vec![env("TF_CONFIG", tf_config.to_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kind::apply_defaults;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;

    fn template() -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "tensorflow".to_string(),
                    image: Some("tensorflow/tensorflow:2.15.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn job(specs: &[(&str, i32)]) -> TFJob {
        let mut job = TFJob::new(
            "mnist",
            TFJobSpec {
                run_policy: RunPolicy::default(),
                tf_replica_specs: specs
                    .iter()
                    .map(|(t, n)| {
                        (
                            t.to_string(),
                            ReplicaSpec {
                                replicas: Some(*n),
                                template: template(),
                                restart_policy: None,
                            },
                        )
                    })
                    .collect(),
            },
        );
        job.metadata = ObjectMeta {
            name: Some("mnist".to_string()),
            namespace: Some("ml".to_string()),
            ..Default::default()
        };
        job
    }

    #[test]
    fn defaults_canonicalize_types_and_inject_port() {
        let mut job = job(&[("worker", 2), ("ps", 1)]);
        apply_defaults(&mut job);

        let specs = job.replica_specs();
        assert!(specs.contains_key("Worker"));
        assert!(specs.contains_key("PS"));
        let worker = &specs["Worker"];
        assert_eq!(worker.restart_policy, Some(RestartPolicy::Never));
        let ports = worker.template.spec.as_ref().unwrap().containers[0]
            .ports
            .clone()
            .unwrap();
        assert_eq!(ports[0].name.as_deref(), Some("tfjob-port"));
        assert_eq!(ports[0].container_port, 2222);
    }

    #[test]
    fn chief_decides_completion_when_present() {
        let job_with_chief = job(&[("Chief", 1), ("Worker", 2)]);
        assert_eq!(job_with_chief.completion_replica_types(), vec!["Chief"]);

        let workers_only = job(&[("PS", 1), ("Worker", 2)]);
        assert_eq!(workers_only.completion_replica_types(), vec!["Worker"]);
    }

    #[test]
    fn tf_config_describes_cluster_and_task() {
        let job = job(&[("PS", 1), ("Worker", 2), ("Evaluator", 1)]);
        let vars = job.cluster_env("Worker", 1);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "TF_CONFIG");

        let config: Value = serde_json::from_str(vars[0].value.as_deref().unwrap()).unwrap();
        assert_eq!(config["task"]["type"], "worker");
        assert_eq!(config["task"]["index"], 1);
        assert_eq!(config["environment"], "cloud");
        assert_eq!(
            config["cluster"]["worker"],
            json!(["mnist-worker-0.ml.svc:2222", "mnist-worker-1.ml.svc:2222"])
        );
        assert_eq!(config["cluster"]["ps"], json!(["mnist-ps-0.ml.svc:2222"]));
        assert!(config["cluster"].get("evaluator").is_none());
    }

    #[test]
    fn spec_deserializes_from_manifest() {
        let spec: TFJobSpec = serde_json::from_value(json!({
            "runPolicy": { "cleanPodPolicy": "All" },
            "tfReplicaSpecs": {
                "Worker": {
                    "replicas": 3,
                    "restartPolicy": "OnFailure",
                    "template": { "spec": { "containers": [{ "name": "tensorflow" }] } }
                }
            }
        }))
        .unwrap();
        assert_eq!(spec.tf_replica_specs["Worker"].replicas, Some(3));
        assert_eq!(
            spec.tf_replica_specs["Worker"].restart_policy,
            Some(RestartPolicy::OnFailure)
        );
    }
}
