//! The generic job reconciler.
//!
//! One instance per job kind. Each pass reads the job, converges its owned
//! pods and services, folds the observations into a condition and writes the
//! status back at most once. Everything it knows is re-derived from the
//! cluster on every pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controllers::backoff::MAX_DELAY;
use crate::crd::common::{ConditionType, JobStatus, CONDITION_FALSE, CONDITION_TRUE};
use crate::engine::gang::{GangScheduler, GroupRequest};
use crate::engine::kind::{validate, JobKind, KindOptions};
use crate::engine::replicas::ReplicaManager;
use crate::engine::restart::{evaluate, RestartDecision};
use crate::engine::status::{
    aggregate, apply_outcome, has_condition, is_finished, set_condition, timestamp,
    ReplicaObservation,
};
use crate::events::{actions, reasons, EventPublisher};
use crate::kubernetes::client::{ClusterClient, JobClient};
use crate::kubernetes::resources::JOB_FINALIZER;
use crate::metrics::{
    JOBS_CREATED_TOTAL, JOBS_FAILED_TOTAL, JOBS_RESTARTED_TOTAL, JOBS_SUCCEEDED_TOTAL,
};
use crate::{Error, Result};

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn event_type(condition: ConditionType) -> EventType {
    match condition {
        ConditionType::Created | ConditionType::Running | ConditionType::Succeeded => {
            EventType::Normal
        }
        ConditionType::Restarting | ConditionType::Failed => EventType::Warning,
    }
}

/// Requeue delay toward `deadline`, between one second and [`MAX_DELAY`].
fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now)
        .to_std()
        .unwrap_or(Duration::from_secs(1))
        .clamp(Duration::from_secs(1), MAX_DELAY)
}

/// `start + secs`, or `None` when the sum is not representable.
fn offset(start: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(secs).and_then(|d| start.checked_add_signed(d))
}

/// A condition that became True during the pass, reported once persisted.
struct Transition {
    condition: ConditionType,
    reason: String,
    message: String,
}

pub struct JobReconciler<K: JobKind> {
    jobs: Arc<dyn JobClient<K>>,
    replicas: ReplicaManager,
    gang: Option<Arc<dyn GangScheduler>>,
    events: Arc<dyn EventPublisher>,
}

impl<K: JobKind> JobReconciler<K> {
    pub fn new(
        jobs: Arc<dyn JobClient<K>>,
        cluster: Arc<dyn ClusterClient>,
        gang: Option<Arc<dyn GangScheduler>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            jobs,
            replicas: ReplicaManager::new(cluster, gang.clone(), events.clone()),
            gang,
            events,
        }
    }

    pub fn with_options(mut self, options: KindOptions) -> Self {
        self.replicas = self.replicas.with_options(options);
        self
    }

    pub async fn reconcile(&self, namespace: &str, name: &str, now: DateTime<Utc>) -> Result<Action> {
        let kind = K::KIND_NAME;
        let Some(job) = self.jobs.get(namespace, name).await? else {
            debug!(%kind, namespace, name, "Job no longer exists");
            return Ok(Action::await_change());
        };

        if job.meta().deletion_timestamp.is_some() {
            return self.finalize(job).await;
        }

        let mut status = job.job_status().cloned().unwrap_or_default();
        let mut desired = job.clone();
        desired.set_defaults();

        if is_finished(&status) {
            return self.finish(&desired, &status, now).await;
        }

        let job = self.ensure_finalizer(job).await?;

        if let Err(err) = validate(&desired) {
            return self.reject(job, status, err, now).await;
        }

        let mut transitions = Vec::new();
        if status.start_time.is_none() {
            status.start_time = Some(timestamp(now));
        }
        if !has_condition(&status, ConditionType::Created) {
            let reason = format!("{}Created", kind);
            let message = format!("{} {} is created.", kind, name);
            set_condition(
                &mut status,
                ConditionType::Created,
                CONDITION_TRUE,
                &reason,
                &message,
                now,
            );
            JOBS_CREATED_TOTAL
                .with_label_values(&[kind.as_label()])
                .inc();
            transitions.push(Transition {
                condition: ConditionType::Created,
                reason,
                message,
            });
        }

        // a deadline too far out to represent never expires
        let deadline = desired.run_policy().active_deadline_seconds.and_then(|secs| {
            let started = parse_time(status.start_time.as_deref()).unwrap_or(now);
            offset(started, secs).map(|at| (secs, at))
        });
        if let Some((secs, at)) = deadline {
            if now >= at {
                let message = format!(
                    "{} {} has run past its active deadline of {}s.",
                    kind, name, secs
                );
                set_condition(
                    &mut status,
                    ConditionType::Failed,
                    CONDITION_TRUE,
                    reasons::DEADLINE_EXCEEDED,
                    &message,
                    now,
                );
                status.completion_time = Some(timestamp(now));
                transitions.push(Transition {
                    condition: ConditionType::Failed,
                    reason: reasons::DEADLINE_EXCEEDED.to_string(),
                    message,
                });
                let job = self.write_status(&job, &status).await?;
                self.announce(&job, &transitions).await;
                JOBS_FAILED_TOTAL.with_label_values(&[kind.as_label()]).inc();
                return self.finish(&desired, &status, now).await;
            }
        }

        if let Some(gang) = &self.gang {
            gang.ensure(&GroupRequest::for_job(&desired)?).await?;
        }

        let removed = self.replicas.remove_undeclared(&desired).await?;
        if removed > 0 {
            info!(%kind, job = name, removed, "Removed pods of undeclared replica types");
        }

        let backoff_limit = desired.run_policy().backoff_limit;
        let completion = desired.completion_replica_types();
        let mut observations = Vec::new();
        let mut replica_statuses = BTreeMap::new();
        // (observation slot, pod name) of each failed replica to recreate
        let mut restarts: Vec<(usize, String)> = Vec::new();
        for (replica_type, spec) in desired.replica_specs() {
            let outcome = self.replicas.reconcile(&desired, replica_type, spec).await?;
            let policy = spec.restart_policy.unwrap_or(K::DEFAULT_RESTART_POLICY);

            let mut observation = ReplicaObservation {
                replica_type: replica_type.clone(),
                desired: spec.desired_replicas(),
                status: outcome.status.clone(),
                completion: completion.contains(replica_type),
                ..Default::default()
            };
            for failed in &outcome.failed {
                let failure_count = status.restart_count + restarts.len() as i32 + 1;
                match evaluate(policy, backoff_limit, failure_count, failed.exit_code) {
                    RestartDecision::Restart => {
                        observation.restarting += 1;
                        restarts.push((observations.len(), failed.pod_name.clone()));
                    }
                    RestartDecision::Exhausted => {
                        warn!(
                            %kind,
                            job = name,
                            pod = %failed.pod_name,
                            exit_code = ?failed.exit_code,
                            %policy,
                            "Replica failed with no restart left"
                        );
                        observation.exhausted += 1;
                    }
                }
            }
            replica_statuses.insert(replica_type.clone(), outcome.status);
            observations.push(observation);
        }

        // A failure counts once its pod is gone. A delete that fails leaves
        // the pod in place to be seen, and counted, on the retry.
        let mut restart_error = None;
        if !aggregate(kind, name, &observations).is_terminal() {
            let mut pending = restarts.iter();
            for (slot, pod_name) in pending.by_ref() {
                if let Err(e) = self.replicas.restart_replica(&desired, pod_name).await {
                    warn!(%kind, job = name, pod = %pod_name, error = %e, "Failed to restart replica");
                    observations[*slot].restarting -= 1;
                    restart_error = Some(e);
                    break;
                }
                status.restart_count += 1;
                JOBS_RESTARTED_TOTAL
                    .with_label_values(&[kind.as_label()])
                    .inc();
            }
            for (slot, _) in pending {
                observations[*slot].restarting -= 1;
            }
        }

        let outcome = aggregate(kind, name, &observations);
        status.replica_statuses = replica_statuses;
        if outcome.condition == ConditionType::Running
            && observations.iter().all(|o| o.status.failed == 0)
        {
            status.restart_count = 0;
        }
        if apply_outcome(&mut status, &outcome, now) {
            transitions.push(Transition {
                condition: outcome.condition,
                reason: outcome.reason.clone(),
                message: outcome.message.clone(),
            });
        }
        if outcome.is_terminal() && status.completion_time.is_none() {
            status.completion_time = Some(timestamp(now));
        }

        if job.job_status() != Some(&status) {
            let job = self.write_status(&job, &status).await?;
            self.announce(&job, &transitions).await;
        } else {
            debug!(%kind, job = name, "Status unchanged");
        }

        if let Some(e) = restart_error {
            return Err(e);
        }

        if outcome.is_terminal() {
            let counter = match outcome.condition {
                ConditionType::Succeeded => &*JOBS_SUCCEEDED_TOTAL,
                _ => &*JOBS_FAILED_TOTAL,
            };
            counter.with_label_values(&[kind.as_label()]).inc();
            info!(%kind, job = name, condition = %outcome.condition, "Job finished");
            return self.finish(&desired, &status, now).await;
        }

        Ok(match deadline {
            Some((_, at)) => Action::requeue(until(at, now)),
            None => Action::await_change(),
        })
    }

    /// Terminal handling: clean pod policy, scheduling group removal and TTL.
    async fn finish(&self, job: &K, status: &JobStatus, now: DateTime<Utc>) -> Result<Action> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let policy = job.run_policy().clean_pod_policy.unwrap_or_default();

        let removed = self.replicas.cleanup(job, policy).await?;
        if removed > 0 {
            info!(kind = %K::KIND_NAME, job = %name, removed, ?policy, "Cleaned up pods of finished job");
        }
        if let Some(gang) = &self.gang {
            gang.delete(&namespace, &name).await?;
        }

        let Some(ttl) = job.run_policy().ttl_seconds_after_finished else {
            return Ok(Action::await_change());
        };
        let finished = parse_time(status.completion_time.as_deref()).unwrap_or(now);
        let Some(expiry) = offset(finished, i64::from(ttl)) else {
            return Ok(Action::await_change());
        };
        if now < expiry {
            return Ok(Action::requeue(until(expiry, now)));
        }

        let removed = self.replicas.delete_all(job).await?;
        if removed > 0 {
            info!(kind = %K::KIND_NAME, job = %name, removed, "TTL after finish expired");
            self.events
                .publish(
                    &job.object_ref(&()),
                    EventType::Normal,
                    reasons::TTL_EXPIRED,
                    actions::CLEANUP,
                    Some(format!("Removed {} pod(s) {}s after the job finished", removed, ttl)),
                )
                .await;
        }
        Ok(Action::await_change())
    }

    /// Finalizer cleanup for a job being deleted. The finalizer goes last so an
    /// interrupted cleanup is retried.
    async fn finalize(&self, job: K) -> Result<Action> {
        if !job.finalizers().iter().any(|f| f == JOB_FINALIZER) {
            return Ok(Action::await_change());
        }
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        info!(kind = %K::KIND_NAME, namespace = %namespace, job = %name, "Cleaning up deleted job");

        self.replicas.delete_all(&job).await?;
        if let Some(gang) = &self.gang {
            gang.delete(&namespace, &name).await?;
        }

        let remaining: Vec<String> = job
            .finalizers()
            .iter()
            .filter(|f| *f != JOB_FINALIZER)
            .cloned()
            .collect();
        self.jobs.patch_finalizers(&job, remaining).await?;
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(&self, job: K) -> Result<K> {
        if job.finalizers().iter().any(|f| f == JOB_FINALIZER) {
            return Ok(job);
        }
        let mut finalizers = job.finalizers().to_vec();
        finalizers.push(JOB_FINALIZER.to_string());
        self.jobs.patch_finalizers(&job, finalizers).await
    }

    /// Surface a spec the engine cannot act on and retry slowly until it is edited.
    async fn reject(&self, job: K, mut status: JobStatus, err: Error, now: DateTime<Utc>) -> Result<Action> {
        let Error::Validation(message) = err else {
            return Err(err);
        };
        warn!(kind = %K::KIND_NAME, job = %job.name_any(), %message, "Invalid job spec");

        let changed = set_condition(
            &mut status,
            ConditionType::Created,
            CONDITION_FALSE,
            reasons::INVALID_SPEC,
            &message,
            now,
        );
        if changed {
            let job = self.write_status(&job, &status).await?;
            self.events
                .publish(
                    &job.object_ref(&()),
                    EventType::Warning,
                    reasons::INVALID_SPEC,
                    actions::RECONCILE,
                    Some(message),
                )
                .await;
        }
        Ok(Action::requeue(MAX_DELAY))
    }

    async fn write_status(&self, job: &K, status: &JobStatus) -> Result<K> {
        let mut updated = job.clone();
        updated.set_job_status(status.clone());
        self.jobs.replace_status(&updated).await
    }

    async fn announce(&self, job: &K, transitions: &[Transition]) {
        let reference = job.object_ref(&());
        for transition in transitions {
            self.events
                .publish(
                    &reference,
                    event_type(transition.condition),
                    &transition.reason,
                    actions::RECONCILE,
                    Some(transition.message.clone()),
                )
                .await;
        }
    }
}
