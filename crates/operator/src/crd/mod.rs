pub mod common;
pub mod mpijob;
pub mod mxjob;
pub mod podgroup;
pub mod pytorchjob;
pub mod tfjob;
pub mod xgboostjob;

pub use common::{
    CleanPodPolicy, ConditionType, JobCondition, JobStatus, ReplicaSpec, ReplicaStatus,
    ReplicaType, RestartPolicy, RunPolicy, SchedulingPolicy,
};
pub use mpijob::{MPIJob, MPIJobSpec};
pub use mxjob::{MXJob, MXJobSpec};
pub use podgroup::{PodGroup, PodGroupSpec};
pub use pytorchjob::{PyTorchJob, PyTorchJobSpec};
pub use tfjob::{TFJob, TFJobSpec};
pub use xgboostjob::{XGBoostJob, XGBoostJobSpec};
