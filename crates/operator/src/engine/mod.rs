//! The generic training job engine: kind contract, replica management, gang
//! scheduling, status aggregation, restart policy and the reconciler tying
//! them together.

pub mod gang;
pub mod kind;
pub mod reconciler;
pub mod replicas;
pub mod restart;
pub mod state;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use kind::{JobKind, JobKindName, KindOptions};
pub use reconciler::JobReconciler;
pub use state::JobState;
