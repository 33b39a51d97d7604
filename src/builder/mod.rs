//! Topology builder.
//!
//! Turns a validated [`TopologySpec`] into provisioning calls, in dependency
//! order:
//!
//! 1. broadcast topic, plus the ingress publish grant when a gateway is
//!    included
//! 2. ingress route and, if enabled, key auth
//! 3. shared delivery-failures queue
//! 4. per route, in declaration order: dead-letter queue, queue (redriving
//!    to it), filtered subscription (failing over to the shared queue),
//!    consume grant, then consumer and event-source binding when consumers
//!    are included
//!
//! The topic and the shared queue exist before any route starts, and each
//! route only touches its own resources. The first backend failure ends the
//! build; nothing is retried or rolled back. Re-running the build converges
//! because every backend call reconciles by name.

use std::fmt;

use serde::Serialize;
use tracing::{error, info};

use crate::ingress::{default_response_rules, publish_request_template};
use crate::naming::NamingScheme;
use crate::provisioning::{
    ConsumerRef, ConsumerSpec, EventSourceBinding, EventSourceRef, Grant, GrantAction,
    IngressRef, IngressRoute, KeyAuthRef, KeyAuthSpec, Principal, ProvisionError,
    ProvisioningBackend, QueueRef, QueueSpec, RedrivePolicy, SubscriptionRef, SubscriptionSpec,
    TopicRef, INGRESS_SERVICE_PRINCIPAL, MAX_RECEIVE_COUNT,
};
use crate::spec::{RouteSpec, TopologySpec};
use crate::validation::{self, ValidationError};

/// Result type for builds.
pub type Result<T> = std::result::Result<T, BuildError>;

/// A provisioning step, as reported when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    Topic,
    IngressPublishGrant,
    IngressRoute,
    KeyAuth,
    DeliveryFailureQueue,
    DeadLetterQueue,
    Queue,
    Subscription,
    ConsumeGrant,
    Consumer,
    EventSource,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStep::Topic => "topic",
            BuildStep::IngressPublishGrant => "ingress publish grant",
            BuildStep::IngressRoute => "ingress route",
            BuildStep::KeyAuth => "key auth",
            BuildStep::DeliveryFailureQueue => "delivery-failure queue",
            BuildStep::DeadLetterQueue => "dead-letter queue",
            BuildStep::Queue => "queue",
            BuildStep::Subscription => "subscription",
            BuildStep::ConsumeGrant => "consume grant",
            BuildStep::Consumer => "consumer",
            BuildStep::EventSource => "event source",
        };
        f.write_str(s)
    }
}

fn route_suffix(route: &Option<String>) -> String {
    route
        .as_ref()
        .map(|r| format!(" for route '{}'", r))
        .unwrap_or_default()
}

/// Errors that end a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Provisioning failed at {step}{at}: {source}", at = route_suffix(.route))]
    Provisioning {
        step: BuildStep,
        route: Option<String>,
        #[source]
        source: ProvisionError,
    },
}

impl BuildError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::Validation(e) => e.code(),
            BuildError::Provisioning { .. } => "PROVISIONING_FAILURE",
        }
    }

    /// The failing step, for provisioning failures.
    pub fn step(&self) -> Option<BuildStep> {
        match self {
            BuildError::Provisioning { step, .. } => Some(*step),
            BuildError::Validation(_) => None,
        }
    }

    pub fn route(&self) -> Option<&str> {
        match self {
            BuildError::Provisioning { route, .. } => route.as_deref(),
            BuildError::Validation(_) => None,
        }
    }
}

fn failed_at(step: BuildStep, route: Option<&str>) -> impl FnOnce(ProvisionError) -> BuildError {
    let route = route.map(str::to_string);
    move |source| {
        error!(step = %step, route = ?route, error = %source, "Provisioning failed");
        BuildError::Provisioning {
            step,
            route,
            source,
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// What a build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyHandles {
    pub topic: TopicRef,
    /// Shared sink for subscription delivery failures.
    pub delivery_failures: QueueRef,
    pub ingress: Option<IngressHandles>,
    /// One entry per route, in declaration order.
    pub routes: Vec<RouteHandles>,
}

impl TopologyHandles {
    pub fn route(&self, name: &str) -> Option<&RouteHandles> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn queue(&self, route: &str) -> Option<&QueueRef> {
        self.route(route).map(|r| &r.queue)
    }

    pub fn consumer(&self, route: &str) -> Option<&ConsumerRef> {
        self.route(route)
            .and_then(|r| r.consumer.as_ref())
            .map(|c| &c.consumer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressHandles {
    pub route: IngressRef,
    pub key_auth: Option<KeyAuthRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteHandles {
    pub name: String,
    pub queue: QueueRef,
    pub dead_letter_queue: QueueRef,
    pub subscription: SubscriptionRef,
    pub consumer: Option<ConsumerHandles>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerHandles {
    pub consumer: ConsumerRef,
    pub event_source: EventSourceRef,
}

// ============================================================================
// Builder
// ============================================================================

/// Builds fan-out topologies under one topology id.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    topology_id: String,
}

impl TopologyBuilder {
    pub fn new(topology_id: impl Into<String>) -> validation::Result<Self> {
        let topology_id = topology_id.into();
        validation::validate_topology_id(&topology_id)?;
        Ok(Self { topology_id })
    }

    pub fn topology_id(&self) -> &str {
        &self.topology_id
    }

    /// Provision `spec` through `backend`.
    #[tracing::instrument(
        name = "topology.build",
        skip_all,
        fields(stage = %spec.stage(), topology_id = %self.topology_id)
    )]
    pub async fn build(
        &self,
        spec: &TopologySpec,
        backend: &dyn ProvisioningBackend,
    ) -> Result<TopologyHandles> {
        let names = NamingScheme::for_spec(spec, &self.topology_id)?;
        info!(
            region = %spec.region(),
            routes = spec.routes().len(),
            gateway = spec.include_gateway(),
            consumers = spec.include_consumers(),
            "Building topology"
        );

        let topic = backend
            .create_topic(&names.topic())
            .await
            .map_err(failed_at(BuildStep::Topic, None))?;

        let ingress = if spec.include_gateway() {
            backend
                .grant(&Grant {
                    principal: Principal::Service(INGRESS_SERVICE_PRINCIPAL.to_string()),
                    resource: topic.arn.clone(),
                    action: GrantAction::Publish,
                })
                .await
                .map_err(failed_at(BuildStep::IngressPublishGrant, None))?;
            Some(build_ingress(spec, &names, &topic, backend).await?)
        } else {
            None
        };

        let delivery_failures = backend
            .create_queue(&QueueSpec::dead_letter(names.delivery_failures()))
            .await
            .map_err(failed_at(BuildStep::DeliveryFailureQueue, None))?;

        let mut routes = Vec::with_capacity(spec.routes().len());
        for route in spec.routes() {
            let handles =
                build_route(spec, &names, route, &topic, &delivery_failures, backend).await?;
            routes.push(handles);
        }

        info!(topic = %topic.name, routes = routes.len(), "Topology built");
        Ok(TopologyHandles {
            topic,
            delivery_failures,
            ingress,
            routes,
        })
    }
}

async fn build_ingress(
    spec: &TopologySpec,
    names: &NamingScheme,
    topic: &TopicRef,
    backend: &dyn ProvisioningBackend,
) -> Result<IngressHandles> {
    let route = backend
        .create_ingress_route(&IngressRoute {
            api_name: names.api(),
            stage: spec.stage().to_string(),
            path: spec.gateway_path().to_string(),
            target: topic.clone(),
            request_template: publish_request_template(&topic.arn),
            response_rules: default_response_rules(),
            api_key_required: spec.include_gateway_key_auth(),
            cors: true,
        })
        .await
        .map_err(failed_at(BuildStep::IngressRoute, None))?;

    let key_auth = if spec.include_gateway_key_auth() {
        let key = backend
            .create_key_auth(&KeyAuthSpec {
                ingress: route.clone(),
                key_name: names.api_key(),
                usage_plan_name: names.usage_plan(),
            })
            .await
            .map_err(failed_at(BuildStep::KeyAuth, None))?;
        Some(key)
    } else {
        None
    };

    Ok(IngressHandles { route, key_auth })
}

async fn build_route(
    spec: &TopologySpec,
    names: &NamingScheme,
    route: &RouteSpec,
    topic: &TopicRef,
    delivery_failures: &QueueRef,
    backend: &dyn ProvisioningBackend,
) -> Result<RouteHandles> {
    let name = route.name();
    let on = |step| failed_at(step, Some(name));

    let dead_letter_queue = backend
        .create_queue(&QueueSpec::dead_letter(names.dead_letter_queue(name)))
        .await
        .map_err(on(BuildStep::DeadLetterQueue))?;

    let queue = backend
        .create_queue(&QueueSpec {
            name: names.queue(name),
            visibility_timeout: route.visibility_timeout(),
            retention: None,
            redrive: Some(RedrivePolicy {
                dead_letter: dead_letter_queue.clone(),
                max_receive_count: MAX_RECEIVE_COUNT,
            }),
            overrides: route.queue_overrides().clone(),
        })
        .await
        .map_err(on(BuildStep::Queue))?;

    let subscription = backend
        .subscribe(&SubscriptionSpec {
            topic: topic.clone(),
            queue: queue.clone(),
            filter: route.filter().clone(),
            failure_sink: Some(delivery_failures.clone()),
        })
        .await
        .map_err(on(BuildStep::Subscription))?;

    let consumer_role = names.consumer_role(name);
    backend
        .grant(&Grant {
            principal: Principal::ConsumerRole(consumer_role.clone()),
            resource: queue.arn.clone(),
            action: GrantAction::Consume,
        })
        .await
        .map_err(on(BuildStep::ConsumeGrant))?;

    let consumer = if spec.include_consumers() {
        let consumer = backend
            .create_consumer(&ConsumerSpec {
                name: names.consumer(name),
                role: consumer_role,
                reference: route.consumer_reference().clone(),
                environment: route.environment_variables().clone(),
                overrides: route.consumer_overrides().clone(),
            })
            .await
            .map_err(on(BuildStep::Consumer))?;

        let event_source = backend
            .bind_event_source(&EventSourceBinding {
                consumer: consumer.clone(),
                queue: queue.clone(),
                batch_size: route.max_batch_size(),
                batching_window: route.max_batching_window(),
                report_batch_item_failures: true,
            })
            .await
            .map_err(on(BuildStep::EventSource))?;

        Some(ConsumerHandles {
            consumer,
            event_source,
        })
    } else {
        None
    };

    info!(route = %name, queue = %queue.name, consumer = consumer.is_some(), "Route built");
    Ok(RouteHandles {
        name: name.to_string(),
        queue,
        dead_letter_queue,
        subscription,
        consumer,
    })
}
