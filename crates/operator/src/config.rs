use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::controllers::EnabledSchemes;
use crate::template::{DEFAULT_INIT_CONTAINER_IMAGE, DEFAULT_INIT_CONTAINER_TEMPLATE_FILE};
use crate::{Error, Result};

/// Command line of the operator. Every flag can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "training-operator", version, about = "Kubernetes operator for distributed training jobs")]
pub struct Cli {
    /// Job kind to reconcile, repeatable. Defaults to every supported kind.
    #[arg(long = "enable-scheme", env = "ENABLE_SCHEME", value_delimiter = ',')]
    pub enable_scheme: Vec<String>,

    /// Create a scheduling group per job and bind its pods to it.
    #[arg(long, env = "ENABLE_GANG_SCHEDULING")]
    pub enable_gang_scheduling: bool,

    #[arg(long, env = "GANG_SCHEDULER_NAME", default_value = "volcano")]
    pub gang_scheduler_name: String,

    /// Namespace to watch. All namespaces when unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: String,

    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: String,

    /// Image of the init container that holds PyTorch workers until the master resolves.
    #[arg(long, env = "PYTORCH_INIT_CONTAINER_IMAGE", default_value = DEFAULT_INIT_CONTAINER_IMAGE)]
    pub pytorch_init_container_image: String,

    /// YAML list of init containers for PyTorch workers. The built-in one is used when missing.
    #[arg(
        long,
        env = "PYTORCH_INIT_CONTAINER_TEMPLATE_FILE",
        default_value = DEFAULT_INIT_CONTAINER_TEMPLATE_FILE
    )]
    pub pytorch_init_container_template_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub enabled_schemes: EnabledSchemes,
    /// Gang scheduler to bind pods to, when gang scheduling is on.
    pub gang_scheduler_name: Option<String>,
    pub namespace: Option<String>,
    pub metrics_addr: SocketAddr,
    pub health_probe_addr: SocketAddr,
    pub pytorch_init_container_image: String,
    pub pytorch_init_container_template_file: PathBuf,
}

impl OperatorConfig {
    /// Read `.env` if present, then the process arguments.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_cli(Cli::parse())
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let enabled_schemes = EnabledSchemes::parse(&cli.enable_scheme)?;

        if cli.enable_gang_scheduling && cli.gang_scheduler_name.trim().is_empty() {
            return Err(Error::Config(
                "--gang-scheduler-name must be set when gang scheduling is enabled".to_string(),
            ));
        }
        if cli.pytorch_init_container_image.trim().is_empty() {
            return Err(Error::Config(
                "--pytorch-init-container-image must not be empty".to_string(),
            ));
        }
        let gang_scheduler_name = cli
            .enable_gang_scheduling
            .then(|| cli.gang_scheduler_name.clone());

        Ok(Self {
            enabled_schemes,
            gang_scheduler_name,
            namespace: cli.namespace.filter(|ns| !ns.is_empty()),
            metrics_addr: parse_addr("metrics-bind-address", &cli.metrics_bind_address)?,
            health_probe_addr: parse_addr(
                "health-probe-bind-address",
                &cli.health_probe_bind_address,
            )?,
            pytorch_init_container_image: cli.pytorch_init_container_image,
            pytorch_init_container_template_file: cli.pytorch_init_container_template_file,
        })
    }
}

fn parse_addr(flag: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Config(format!("invalid --{} {:?}: {}", flag, value, e)))
}
