use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Client,
};
use tracing::{debug, error, info, warn};

use crate::{
    controllers::backoff::{RequeueBackoff, INITIAL_DELAY, MAX_DELAY},
    engine::{
        gang::{GangScheduler, VolcanoScheduler},
        JobKind, JobReconciler, KindOptions,
    },
    events::KubeEventPublisher,
    kubernetes::{resources::OPERATOR_NAME_LABEL, ClusterClient, KubeClusterClient, KubeJobClient},
    metrics::{RECONCILES_TOTAL, RECONCILE_ERRORS_TOTAL},
    Error, Result,
};

pub const CONTROLLER_NAME: &str = "training-operator";

/// Watches one job kind plus the pods and services it owns.
pub struct JobController<K: JobKind> {
    client: Client,
    namespace: Option<String>,
    reconciler: JobReconciler<K>,
    backoff: RequeueBackoff,
}

impl<K: JobKind> JobController<K> {
    /// `gang_scheduler_name` turns on gang scheduling through that scheduler.
    pub fn new(
        client: Client,
        namespace: Option<String>,
        gang_scheduler_name: Option<String>,
        options: KindOptions,
    ) -> Self {
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
        let gang = gang_scheduler_name.map(|name| {
            Arc::new(VolcanoScheduler::new(cluster.clone(), name)) as Arc<dyn GangScheduler>
        });
        let reconciler = JobReconciler::new(
            Arc::new(KubeJobClient::<K>::new(client.clone())),
            cluster,
            gang,
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        )
        .with_options(options);
        Self {
            client,
            namespace,
            reconciler,
            backoff: RequeueBackoff::new(),
        }
    }

    fn api<T>(&self) -> Api<T>
    where
        T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        T::DynamicType: Default,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let kind = K::KIND_NAME;
        info!(%kind, namespace = ?self.namespace, "Starting job controller");

        let owned = Config::default().labels(&format!("{}={}", OPERATOR_NAME_LABEL, kind.as_label()));

        Controller::new(self.api::<K>(), Config::default())
            .owns(self.api::<Pod>(), owned.clone())
            .owns(self.api::<Service>(), owned)
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, self.clone())
            .for_each(|res| async move {
                match res {
                    Ok((object, _action)) => debug!(%kind, job = %object.name, "Reconciled"),
                    Err(e) => warn!(%kind, "Reconcile failed: {}", e),
                }
            })
            .await;

        info!(%kind, "Job controller stopped");
        Ok(())
    }

    async fn reconcile(job: Arc<K>, ctx: Arc<Self>) -> Result<Action> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        RECONCILES_TOTAL
            .with_label_values(&[K::KIND_NAME.as_label()])
            .inc();

        let action = ctx.reconciler.reconcile(&namespace, &name, Utc::now()).await?;
        ctx.backoff.reset(&object_key(&namespace, &name));
        Ok(action)
    }

    fn error_policy(job: Arc<K>, error: &Error, ctx: Arc<Self>) -> Action {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let kind = K::KIND_NAME;
        RECONCILE_ERRORS_TOTAL
            .with_label_values(&[kind.as_label()])
            .inc();

        if error.is_conflict() {
            debug!(%kind, %namespace, %name, "Stale job version, retrying");
            return Action::requeue(INITIAL_DELAY);
        }
        if !error.is_transient() {
            error!(%kind, %namespace, %name, ?error, "Reconcile failed permanently");
            return Action::requeue(MAX_DELAY);
        }
        let delay = ctx.backoff.next_delay(&object_key(&namespace, &name));
        warn!(%kind, %namespace, %name, ?error, ?delay, "Reconcile failed, requeueing");
        Action::requeue(delay)
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
