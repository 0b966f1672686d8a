use std::fmt;

use crate::crd::common::ConditionType;

/// Job lifecycle: `Created -> Running <-> Restarting -> Succeeded | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "Created"),
            JobState::Running => write!(f, "Running"),
            JobState::Restarting => write!(f, "Restarting"),
            JobState::Succeeded => write!(f, "Succeeded"),
            JobState::Failed => write!(f, "Failed"),
        }
    }
}

impl From<ConditionType> for JobState {
    fn from(condition: ConditionType) -> Self {
        match condition {
            ConditionType::Created => JobState::Created,
            ConditionType::Running => JobState::Running,
            ConditionType::Restarting => JobState::Restarting,
            ConditionType::Succeeded => JobState::Succeeded,
            ConditionType::Failed => JobState::Failed,
        }
    }
}
