use futures::future::join_all;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use training_operator::{
    config::OperatorConfig,
    controllers::{ControllerContext, SchemeDispatcher, SchemeRegistry},
    engine::KindOptions,
    metrics::register_metrics,
    server::{self, Readiness},
    template::InitContainerTemplate,
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match OperatorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded configuration: {:?}", config);

    register_metrics()?;

    let dispatcher = SchemeDispatcher::new(SchemeRegistry::with_all_kinds(), config.enabled_schemes.clone());
    let kinds = match dispatcher.resolve() {
        Ok(kinds) => kinds,
        Err(e) => {
            error!("Cannot start controllers: {}", e);
            std::process::exit(1);
        }
    };

    let init_container = match InitContainerTemplate::load(
        &config.pytorch_init_container_image,
        &config.pytorch_init_container_template_file,
    ) {
        Ok(template) => template,
        Err(e) => {
            error!("Invalid init container template: {}", e);
            std::process::exit(1);
        }
    };

    let client = Client::try_default().await?;
    let context = ControllerContext {
        client,
        namespace: config.namespace.clone(),
        gang_scheduler_name: config.gang_scheduler_name.clone(),
        options: KindOptions {
            pytorch_init_container: Some(init_container),
        },
    };
    let controllers = dispatcher.build_controllers(&context)?;

    let readiness = Readiness::new();
    tokio::spawn(log_exit(
        "metrics server",
        server::serve(config.metrics_addr, server::metrics_router()),
    ));
    tokio::spawn(log_exit(
        "probe server",
        server::serve(config.health_probe_addr, server::probe_router(readiness.clone())),
    ));

    info!(?kinds, "Starting controllers");
    readiness.mark_ready();

    for result in join_all(controllers).await {
        if let Err(e) = result {
            error!("Controller exited with error: {}", e);
        }
    }
    info!("All controllers stopped, shutting down");
    Ok(())
}

async fn log_exit(name: &'static str, task: impl std::future::Future<Output = Result<()>>) {
    if let Err(e) = task.await {
        error!("{} failed: {}", name, e);
    }
}
