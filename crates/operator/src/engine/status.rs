//! Job-level status: the aggregation rules that turn per-replica counts into a
//! condition, and the helpers that maintain the condition log.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::common::{
    ConditionType, JobCondition, JobStatus, ReplicaStatus, ReplicaType, CONDITION_FALSE,
    CONDITION_TRUE,
};
use crate::engine::kind::JobKindName;
use crate::engine::state::JobState;

/// What one reconcile observed for a single replica type.
#[derive(Debug, Clone, Default)]
pub struct ReplicaObservation {
    pub replica_type: ReplicaType,
    pub desired: i32,
    pub status: ReplicaStatus,
    /// Whether this type decides job success
    pub completion: bool,
    /// Failed replicas the restart policy refused to recreate
    pub exhausted: i32,
    /// Failed replicas being recreated
    pub restarting: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub condition: ConditionType,
    pub reason: String,
    pub message: String,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        JobState::from(self.condition).is_terminal()
    }
}

/// Map observations to the job's condition. First matching rule wins:
/// an exhausted failure fails the job; every completion type fully succeeded
/// completes it; any restart in flight means Restarting; any active replica
/// means Running; otherwise the job is only Created.
pub fn aggregate(kind: JobKindName, job_name: &str, observations: &[ReplicaObservation]) -> Outcome {
    if let Some(failed) = observations.iter().find(|o| o.exhausted > 0) {
        return Outcome {
            condition: ConditionType::Failed,
            reason: format!("{}Failed", kind),
            message: format!(
                "{} {} has failed because {} {} replica(s) failed.",
                kind, job_name, failed.status.failed, failed.replica_type
            ),
        };
    }

    let completion: Vec<&ReplicaObservation> =
        observations.iter().filter(|o| o.completion).collect();
    let completed = !completion.is_empty()
        && completion
            .iter()
            .all(|o| o.desired > 0 && o.status.succeeded == o.desired);
    if completed {
        return Outcome {
            condition: ConditionType::Succeeded,
            reason: format!("{}Succeeded", kind),
            message: format!("{} {} is successfully completed.", kind, job_name),
        };
    }

    if let Some(restarting) = observations.iter().find(|o| o.restarting > 0) {
        return Outcome {
            condition: ConditionType::Restarting,
            reason: format!("{}Restarting", kind),
            message: format!(
                "{} {} is restarting because {} {} replica(s) failed.",
                kind, job_name, restarting.restarting, restarting.replica_type
            ),
        };
    }

    if observations.iter().any(|o| o.status.active > 0) {
        return Outcome {
            condition: ConditionType::Running,
            reason: format!("{}Running", kind),
            message: format!("{} {} is running.", kind, job_name),
        };
    }

    Outcome {
        condition: ConditionType::Created,
        reason: format!("{}Created", kind),
        message: format!("{} {} is created.", kind, job_name),
    }
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn find(status: &JobStatus, condition: ConditionType) -> Option<&JobCondition> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition)
}

pub fn has_condition(status: &JobStatus, condition: ConditionType) -> bool {
    find(status, condition).map(|c| c.is_true()).unwrap_or(false)
}

pub fn is_succeeded(status: &JobStatus) -> bool {
    has_condition(status, ConditionType::Succeeded)
}

pub fn is_failed(status: &JobStatus) -> bool {
    has_condition(status, ConditionType::Failed)
}

pub fn is_finished(status: &JobStatus) -> bool {
    is_succeeded(status) || is_failed(status)
}

/// The state the condition log currently describes.
pub fn current_state(status: &JobStatus) -> JobState {
    [
        ConditionType::Failed,
        ConditionType::Succeeded,
        ConditionType::Restarting,
        ConditionType::Running,
    ]
    .into_iter()
    .find(|c| has_condition(status, *c))
    .map(JobState::from)
    .unwrap_or(JobState::Created)
}

/// Update the condition of `condition_type` in place, appending it if absent.
///
/// `lastTransitionTime` moves only when the status flips. A True Running or
/// Restarting clears the other; a True terminal clears both. Once the job is
/// finished no condition may change. Returns whether anything changed.
pub fn set_condition(
    status: &mut JobStatus,
    condition_type: ConditionType,
    condition_status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    if is_finished(status) {
        return false;
    }

    let ts = timestamp(now);
    let changed = match status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => {
            if existing.status == condition_status
                && existing.reason == reason
                && existing.message == message
            {
                false
            } else {
                if existing.status != condition_status {
                    existing.status = condition_status.to_string();
                    existing.last_transition_time = Some(ts.clone());
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.last_update_time = Some(ts.clone());
                true
            }
        }
        None => {
            status.conditions.push(JobCondition {
                condition_type,
                status: condition_status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_update_time: Some(ts.clone()),
                last_transition_time: Some(ts.clone()),
            });
            true
        }
    };

    if changed && condition_status == CONDITION_TRUE {
        let cleared: &[ConditionType] = match condition_type {
            ConditionType::Running => &[ConditionType::Restarting],
            ConditionType::Restarting => &[ConditionType::Running],
            ConditionType::Succeeded | ConditionType::Failed => {
                &[ConditionType::Running, ConditionType::Restarting]
            }
            ConditionType::Created => &[],
        };
        for condition in status
            .conditions
            .iter_mut()
            .filter(|c| cleared.contains(&c.condition_type) && c.is_true())
        {
            condition.status = CONDITION_FALSE.to_string();
            condition.last_update_time = Some(ts.clone());
            condition.last_transition_time = Some(ts.clone());
        }
    }

    changed
}

/// Apply an aggregation outcome to the condition log.
///
/// A `Created` outcome never demotes a job that has already started: it only
/// makes sure the Created condition is present.
pub fn apply_outcome(status: &mut JobStatus, outcome: &Outcome, now: DateTime<Utc>) -> bool {
    if outcome.condition == ConditionType::Created && find(status, ConditionType::Created).is_some()
    {
        return false;
    }
    set_condition(
        status,
        outcome.condition,
        CONDITION_TRUE,
        &outcome.reason,
        &outcome.message,
        now,
    )
}
