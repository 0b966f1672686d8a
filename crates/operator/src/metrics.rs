use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::{Error, Result};

fn counter(name: &str, help: &str) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), &["kind"]).expect("valid metric definition")
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref RECONCILES_TOTAL: IntCounterVec = counter(
        "training_operator_reconciles_total",
        "Reconcile passes run, by job kind."
    );
    pub static ref RECONCILE_ERRORS_TOTAL: IntCounterVec = counter(
        "training_operator_reconcile_errors_total",
        "Reconcile passes that returned an error, by job kind."
    );
    pub static ref JOBS_CREATED_TOTAL: IntCounterVec = counter(
        "training_operator_jobs_created_total",
        "Jobs observed for the first time, by job kind."
    );
    pub static ref JOBS_SUCCEEDED_TOTAL: IntCounterVec = counter(
        "training_operator_jobs_succeeded_total",
        "Jobs that reached Succeeded, by job kind."
    );
    pub static ref JOBS_FAILED_TOTAL: IntCounterVec = counter(
        "training_operator_jobs_failed_total",
        "Jobs that reached Failed, by job kind."
    );
    pub static ref JOBS_RESTARTED_TOTAL: IntCounterVec = counter(
        "training_operator_jobs_restarted_total",
        "Replica restarts performed, by job kind."
    );
}

/// Register every counter on [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() -> Result<()> {
    for metric in [
        &*RECONCILES_TOTAL,
        &*RECONCILE_ERRORS_TOTAL,
        &*JOBS_CREATED_TOTAL,
        &*JOBS_SUCCEEDED_TOTAL,
        &*JOBS_FAILED_TOTAL,
        &*JOBS_RESTARTED_TOTAL,
    ] {
        match REGISTRY.register(Box::new(metric.clone())) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(Error::Internal(format!("metric registration: {}", e))),
        }
    }
    Ok(())
}

/// Render the registry in the Prometheus text format.
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("metric encoding: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metric encoding: {}", e)))
}
