//! The whole fan-out description: stage, region, routes and inclusion flags.

use std::collections::HashSet;

use crate::spec::{Region, RouteSpec};
use crate::validation::{self, ValidationError};

/// Default ingress path, relative to the API root.
pub const DEFAULT_GATEWAY_PATH: &str = "send-event";

/// Raw, unvalidated topology parameters.
#[derive(Debug, Clone)]
pub struct TopologyProps {
    pub stage: String,
    pub region: String,
    /// Insertion order is provisioning order.
    pub routes: Vec<RouteSpec>,
    pub include_gateway: bool,
    /// Ignored when `include_gateway` is false.
    pub include_gateway_key_auth: bool,
    /// When false, queues are created without bound consumers.
    pub include_consumers: bool,
    pub gateway_path: String,
}

impl TopologyProps {
    pub fn new(stage: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            region: region.into(),
            routes: Vec::new(),
            include_gateway: true,
            include_gateway_key_auth: true,
            include_consumers: true,
            gateway_path: DEFAULT_GATEWAY_PATH.to_string(),
        }
    }

    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_routes(mut self, routes: impl IntoIterator<Item = RouteSpec>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn with_gateway(mut self, include: bool) -> Self {
        self.include_gateway = include;
        self
    }

    pub fn with_gateway_key_auth(mut self, include: bool) -> Self {
        self.include_gateway_key_auth = include;
        self
    }

    pub fn with_consumers(mut self, include: bool) -> Self {
        self.include_consumers = include;
        self
    }

    pub fn with_gateway_path(mut self, path: impl Into<String>) -> Self {
        self.gateway_path = path.into();
        self
    }
}

/// A validated, read-only topology description.
#[derive(Debug, Clone)]
pub struct TopologySpec {
    stage: String,
    region: Region,
    routes: Vec<RouteSpec>,
    include_gateway: bool,
    include_gateway_key_auth: bool,
    include_consumers: bool,
    gateway_path: String,
}

impl TopologySpec {
    /// Validate the props.
    ///
    /// Stage checks run before region checks, and both before the cross-route
    /// uniqueness check, so identical malformed input always reports the same
    /// error. Route internals were validated when each `RouteSpec` was built.
    pub fn new(props: TopologyProps) -> validation::Result<Self> {
        validation::validate_stage(&props.stage)?;
        let region = validation::validate_region(&props.region)?;

        let mut seen = HashSet::with_capacity(props.routes.len());
        for route in &props.routes {
            if !seen.insert(route.name()) {
                return Err(ValidationError::DuplicateRouteName {
                    name: route.name().to_string(),
                });
            }
        }

        if props.include_gateway {
            validation::validate_gateway_path(&props.gateway_path)?;
        }

        Ok(Self {
            stage: props.stage,
            region,
            routes: props.routes,
            include_gateway: props.include_gateway,
            include_gateway_key_auth: props.include_gateway_key_auth,
            include_consumers: props.include_consumers,
            gateway_path: props.gateway_path,
        })
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn routes(&self) -> &[RouteSpec] {
        &self.routes
    }

    pub fn route(&self, name: &str) -> Option<&RouteSpec> {
        self.routes.iter().find(|r| r.name() == name)
    }

    pub fn include_gateway(&self) -> bool {
        self.include_gateway
    }

    /// Key auth only applies when there is a gateway to protect.
    pub fn include_gateway_key_auth(&self) -> bool {
        self.include_gateway && self.include_gateway_key_auth
    }

    pub fn include_consumers(&self) -> bool {
        self.include_consumers
    }

    pub fn gateway_path(&self) -> &str {
        &self.gateway_path
    }
}

impl TryFrom<TopologyProps> for TopologySpec {
    type Error = ValidationError;

    fn try_from(props: TopologyProps) -> Result<Self, Self::Error> {
        TopologySpec::new(props)
    }
}
