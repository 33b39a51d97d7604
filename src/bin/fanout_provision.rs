//! fanout-provision: build a fan-out topology from configuration.
//!
//! ## Configuration
//! - `--config <path>` or FANOUT_CONFIG: topology description (YAML)
//! - FANOUT_BACKEND: `memory` (default) prints the resulting plan as YAML,
//!   `aws` provisions it (requires `--features aws`)
//! - FANOUT_LOG: log filter (default `info`)
//!
//! Exits non-zero on failure, printing the error code first.

use std::process::ExitCode;

use tracing::{error, info};

use fanout::builder::{BuildError, TopologyBuilder};
use fanout::config::{BackendType, ConfigError, FanoutConfig};
use fanout::provisioning::InMemoryBackend;
#[cfg(feature = "aws")]
use fanout::provisioning::{AwsBackend, ProvisionError};
use fanout::spec::TopologySpec;
use fanout::utils::bootstrap;

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[cfg(feature = "aws")]
    #[error(transparent)]
    Backend(#[from] ProvisionError),

    #[error("Failed to render output: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("{0}")]
    Unsupported(String),
}

impl RunError {
    fn code(&self) -> &'static str {
        match self {
            RunError::Config(e) => e.code(),
            RunError::Build(e) => e.code(),
            #[cfg(feature = "aws")]
            RunError::Backend(_) => "PROVISIONING_FAILURE",
            RunError::Render(_) => "RENDER_FAILURE",
            RunError::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), error = %e, "Provisioning failed");
            eprintln!("{}: {}", e.code(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), RunError> {
    let config = FanoutConfig::load(bootstrap::parse_config_path().as_deref())?;
    let spec = config.topology_spec().map_err(ConfigError::from)?;
    let builder = TopologyBuilder::new(&config.topology_id).map_err(ConfigError::from)?;

    info!(
        topology_id = %config.topology_id,
        stage = %spec.stage(),
        backend = ?config.backend,
        "Starting fanout-provision"
    );

    match config.backend {
        BackendType::Memory => {
            let backend = InMemoryBackend::new(spec.region());
            let handles = builder.build(&spec, &backend).await?;
            let plan = backend.snapshot().await;
            print!("{}", serde_yaml::to_string(&plan)?);
            info!(routes = handles.routes.len(), "Plan complete");
            Ok(())
        }
        BackendType::Aws => provision_aws(&config, &spec, &builder).await,
    }
}

#[cfg(feature = "aws")]
async fn provision_aws(
    config: &FanoutConfig,
    spec: &TopologySpec,
    builder: &TopologyBuilder,
) -> Result<(), RunError> {
    let backend = AwsBackend::new(spec.region(), config.aws.clone()).await?;
    let handles = builder.build(spec, &backend).await?;
    print!("{}", serde_yaml::to_string(&handles)?);
    info!(topic = %handles.topic.arn, routes = handles.routes.len(), "Topology provisioned");
    Ok(())
}

#[cfg(not(feature = "aws"))]
async fn provision_aws(
    _config: &FanoutConfig,
    _spec: &TopologySpec,
    _builder: &TopologyBuilder,
) -> Result<(), RunError> {
    Err(RunError::Unsupported(
        "AWS support requires the 'aws' feature. Rebuild with --features aws".to_string(),
    ))
}
