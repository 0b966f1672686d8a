pub mod backoff;
pub mod dispatcher;
pub mod job;

pub use dispatcher::{ControllerContext, EnabledSchemes, SchemeDispatcher, SchemeRegistry};
pub use job::JobController;
