//! Maps the job kinds enabled on the command line onto runnable controllers.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use kube::Client;
use tracing::info;

use crate::controllers::job::JobController;
use crate::crd::{MPIJob, MXJob, PyTorchJob, TFJob, XGBoostJob};
use crate::engine::{JobKind, JobKindName, KindOptions};
use crate::{Error, Result};

/// Job kinds the operator was asked to run. Empty input means every kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledSchemes(Vec<JobKindName>);

impl EnabledSchemes {
    pub fn parse(names: &[String]) -> Result<Self> {
        if names.iter().all(|n| n.trim().is_empty()) {
            return Ok(Self::all());
        }
        let mut kinds = Vec::new();
        for name in names.iter().filter(|n| !n.trim().is_empty()) {
            let kind: JobKindName = name.parse()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(Self(kinds))
    }

    pub fn all() -> Self {
        Self(JobKindName::all().to_vec())
    }

    pub fn kinds(&self) -> &[JobKindName] {
        &self.0
    }
}

/// Everything a controller needs from the process.
#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub namespace: Option<String>,
    /// Set when gang scheduling is on.
    pub gang_scheduler_name: Option<String>,
    pub options: KindOptions,
}

pub type ControllerFuture = BoxFuture<'static, Result<()>>;
type SetupFn = fn(&ControllerContext) -> ControllerFuture;

/// Setup functions keyed by job kind. Built explicitly at startup.
#[derive(Default)]
pub struct SchemeRegistry {
    setups: BTreeMap<JobKindName, SetupFn>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_all_kinds() -> Self {
        let mut registry = Self::new();
        registry.register::<TFJob>();
        registry.register::<PyTorchJob>();
        registry.register::<MXJob>();
        registry.register::<XGBoostJob>();
        registry.register::<MPIJob>();
        registry
    }

    pub fn register<K: JobKind>(&mut self) {
        self.setups.insert(K::KIND_NAME, start_controller::<K>);
    }

    pub fn contains(&self, kind: JobKindName) -> bool {
        self.setups.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKindName> {
        self.setups.keys().copied().collect()
    }
}

fn start_controller<K: JobKind>(ctx: &ControllerContext) -> ControllerFuture {
    let controller = Arc::new(JobController::<K>::new(
        ctx.client.clone(),
        ctx.namespace.clone(),
        ctx.gang_scheduler_name.clone(),
        ctx.options.clone(),
    ));
    Box::pin(controller.run())
}

pub struct SchemeDispatcher {
    registry: SchemeRegistry,
    enabled: EnabledSchemes,
}

impl SchemeDispatcher {
    pub fn new(registry: SchemeRegistry, enabled: EnabledSchemes) -> Self {
        Self { registry, enabled }
    }

    /// The enabled kinds, failing on the first one with no registered setup.
    pub fn resolve(&self) -> Result<Vec<JobKindName>> {
        self.enabled
            .kinds()
            .iter()
            .map(|kind| {
                if self.registry.contains(*kind) {
                    Ok(*kind)
                } else {
                    Err(Error::UnsupportedKind(kind.as_label().to_string()))
                }
            })
            .collect()
    }

    pub fn build_controllers(&self, ctx: &ControllerContext) -> Result<Vec<ControllerFuture>> {
        let kinds = self.resolve()?;
        let mut controllers = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let Some(setup) = self.registry.setups.get(&kind) else {
                return Err(Error::UnsupportedKind(kind.as_label().to_string()));
            };
            info!(%kind, "Enabling controller");
            controllers.push(setup(ctx));
        }
        Ok(controllers)
    }
}
