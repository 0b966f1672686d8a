//! Kubernetes Events emitted on job objects.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails a
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// `controller_name` is reported as the event's reportingComponent.
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            reference.clone(),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons outside the per-kind condition reasons.
pub mod reasons {
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
    pub const SUCCESSFUL_CREATE_POD: &str = "SuccessfulCreatePod";
    pub const SUCCESSFUL_DELETE_POD: &str = "SuccessfulDeletePod";
    pub const TTL_EXPIRED: &str = "TTLExpired";
}

pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CLEANUP: &str = "Cleanup";
}
