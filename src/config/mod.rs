//! Configuration loading.
//!
//! Sources, later overriding earlier:
//! 1. `fanout.yaml` in the current directory (if present)
//! 2. The file passed to [`FanoutConfig::load`]
//! 3. The file named by `FANOUT_CONFIG`
//! 4. `FANOUT_*` environment variables, `__` separating nested keys
//!    (e.g. `FANOUT_AWS__ENDPOINT_URL`)

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spec::{
    MessageFilter, RouteProps, RouteSpec, TopologyProps, TopologySpec, DEFAULT_GATEWAY_PATH,
    DEFAULT_MAX_BATCH_SIZE, DEFAULT_VISIBILITY_TIMEOUT,
};
use crate::validation::{self, ValidationError};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FANOUT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FANOUT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FANOUT_LOG";

/// Errors from loading or interpreting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid topology: {0}")]
    Invalid(#[from] ValidationError),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Load(_) => "CONFIG_INVALID",
            ConfigError::Invalid(e) => e.code(),
        }
    }
}

/// Which provisioning backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process simulation; prints the resulting plan.
    #[default]
    Memory,
    /// Real AWS (or LocalStack via `aws.endpoint_url`).
    Aws,
}

/// AWS backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsBackendConfig {
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
    /// Execution role for consumer functions.
    pub consumer_role_arn: Option<String>,
    /// Role the ingress integration assumes to publish.
    pub ingress_role_arn: Option<String>,
    pub consumer_runtime: String,
    pub consumer_handler: String,
}

impl Default for AwsBackendConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            consumer_role_arn: None,
            ingress_role_arn: None,
            consumer_runtime: "provided.al2023".to_string(),
            consumer_handler: "bootstrap".to_string(),
        }
    }
}

fn default_max_batch_size() -> u32 {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_visibility_timeout_secs() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT.as_secs()
}

/// One route as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    /// Path or reference to the consumer bundle.
    pub consumer: String,
    #[serde(default)]
    pub filter: MessageFilter,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    #[serde(default)]
    pub max_batching_window_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default)]
    pub queue_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub consumer_overrides: BTreeMap<String, String>,
}

impl RouteConfig {
    pub fn to_props(&self) -> RouteProps {
        RouteProps {
            name: self.name.clone(),
            filter: self.filter.clone(),
            environment_variables: self.environment.clone(),
            consumer_reference: crate::spec::ConsumerReference::new(self.consumer.clone()),
            max_batch_size: self.max_batch_size,
            max_batching_window: Duration::from_secs(self.max_batching_window_secs),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            queue_overrides: self.queue_overrides.clone(),
            consumer_overrides: self.consumer_overrides.clone(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Second component of every resource name.
    pub topology_id: String,
    pub stage: String,
    pub region: String,
    pub include_gateway: bool,
    pub include_gateway_key_auth: bool,
    pub include_consumers: bool,
    pub gateway_path: String,
    pub routes: Vec<RouteConfig>,
    pub backend: BackendType,
    pub aws: AwsBackendConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            topology_id: "fanout".to_string(),
            stage: "dev".to_string(),
            region: "us-east-1".to_string(),
            include_gateway: true,
            include_gateway_key_auth: true,
            include_consumers: true,
            gateway_path: DEFAULT_GATEWAY_PATH.to_string(),
            routes: Vec::new(),
            backend: BackendType::Memory,
            aws: AwsBackendConfig::default(),
        }
    }
}

impl FanoutConfig {
    /// Load configuration from files and environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate into a [`TopologySpec`].
    ///
    /// Stage and region are checked before any route, so the first error
    /// reported for a given file is always the same.
    pub fn topology_spec(&self) -> Result<TopologySpec, ValidationError> {
        validation::validate_stage(&self.stage)?;
        validation::validate_region(&self.region)?;

        let routes = self
            .routes
            .iter()
            .map(|r| RouteSpec::new(r.to_props()))
            .collect::<Result<Vec<_>, _>>()?;

        TopologySpec::new(
            TopologyProps::new(&self.stage, &self.region)
                .with_routes(routes)
                .with_gateway(self.include_gateway)
                .with_gateway_key_auth(self.include_gateway_key_auth)
                .with_consumers(self.include_consumers)
                .with_gateway_path(&self.gateway_path),
        )
    }
}
