//! In-memory provisioning backend.
//!
//! Reconciles resources by name like a real provider and simulates enough of
//! the data plane to exercise a built topology: topic publish with filter
//! evaluation, enveloped delivery, receive with redrive, purge and ingress
//! invocation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ConsumerRef, ConsumerSpec, EventSourceBinding, EventSourceRef, Grant, GrantAction,
    IngressRef, IngressRoute, KeyAuthRef, KeyAuthSpec, Principal, ProvisionError,
    ProvisioningBackend, QueueRef, QueueSpec, Result, SubscriptionRef, SubscriptionSpec,
    TopicRef, CORS_PREFLIGHT_HEADERS, INGRESS_SERVICE_PRINCIPAL,
};
use crate::envelope::{BrokerEnvelope, QueueRecord};
use crate::ingress::{IngressAccepted, IngressRejected, OutcomeClass};
use crate::spec::{MessageFilter, Region};

/// Account id used in every simulated ARN.
const ACCOUNT_ID: &str = "000000000000";

/// Kind of provisioning call, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    CreateTopic,
    CreateQueue,
    Subscribe,
    Grant,
    CreateConsumer,
    BindEventSource,
    CreateIngressRoute,
    CreateKeyAuth,
}

/// One provisioning call, in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ProvisionCall {
    CreateTopic { name: String },
    CreateQueue { name: String },
    Subscribe { topic: String, queue: String },
    Grant { principal: Principal, resource: String, action: GrantAction },
    CreateConsumer { name: String },
    BindEventSource { consumer: String, queue: String },
    CreateIngressRoute { api: String, path: String },
    CreateKeyAuth { key: String },
}

impl ProvisionCall {
    pub fn kind(&self) -> CallKind {
        match self {
            ProvisionCall::CreateTopic { .. } => CallKind::CreateTopic,
            ProvisionCall::CreateQueue { .. } => CallKind::CreateQueue,
            ProvisionCall::Subscribe { .. } => CallKind::Subscribe,
            ProvisionCall::Grant { .. } => CallKind::Grant,
            ProvisionCall::CreateConsumer { .. } => CallKind::CreateConsumer,
            ProvisionCall::BindEventSource { .. } => CallKind::BindEventSource,
            ProvisionCall::CreateIngressRoute { .. } => CallKind::CreateIngressRoute,
            ProvisionCall::CreateKeyAuth { .. } => CallKind::CreateKeyAuth,
        }
    }

    /// Name the call is about: the resource created, the subscribed or
    /// bound queue, or the granted resource ARN.
    pub fn subject(&self) -> &str {
        match self {
            ProvisionCall::CreateTopic { name }
            | ProvisionCall::CreateQueue { name }
            | ProvisionCall::CreateConsumer { name } => name,
            ProvisionCall::Subscribe { queue, .. }
            | ProvisionCall::BindEventSource { queue, .. } => queue,
            ProvisionCall::Grant { resource, .. } => resource,
            ProvisionCall::CreateIngressRoute { api, .. } => api,
            ProvisionCall::CreateKeyAuth { key } => key,
        }
    }
}

/// Response from a simulated ingress invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
}

impl StoredMessage {
    fn new(body: String) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
            receive_count: 0,
        }
    }

    fn to_record(&self, receipt_handle: &str, queue_arn: &str) -> QueueRecord {
        QueueRecord {
            message_id: self.message_id.clone(),
            receipt_handle: receipt_handle.to_string(),
            body: Some(self.body.clone()),
            event_source_arn: queue_arn.to_string(),
            ..Default::default()
        }
    }
}

struct QueueState {
    reference: QueueRef,
    spec: QueueSpec,
    visible: VecDeque<StoredMessage>,
    /// Received but not yet deleted, in receive order, by receipt handle.
    in_flight: VecDeque<(String, StoredMessage)>,
    reachable: bool,
}

struct SubscriptionState {
    reference: SubscriptionRef,
    spec: SubscriptionSpec,
}

struct IngressState {
    reference: IngressRef,
    route: IngressRoute,
    key: Option<KeyAuthRef>,
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, TopicRef>,
    queues: BTreeMap<String, QueueState>,
    subscriptions: Vec<SubscriptionState>,
    grants: Vec<Grant>,
    consumers: BTreeMap<String, (ConsumerRef, ConsumerSpec)>,
    event_sources: Vec<(EventSourceRef, EventSourceBinding)>,
    ingress: BTreeMap<String, IngressState>,
    calls: Vec<ProvisionCall>,
    fail_on: HashSet<(CallKind, String)>,
}

impl State {
    /// Log the call, then fail it if a failure was injected for it.
    fn record(&mut self, call: ProvisionCall) -> Result<()> {
        let injected = self
            .fail_on
            .contains(&(call.kind(), call.subject().to_string()));
        let subject = call.subject().to_string();
        self.calls.push(call);
        if injected {
            return Err(ProvisionError::Rejected(format!(
                "Injected failure for {}",
                subject
            )));
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<&QueueState> {
        self.queues
            .get(name)
            .ok_or_else(|| ProvisionError::NotFound(format!("queue {}", name)))
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| ProvisionError::NotFound(format!("queue {}", name)))
    }

    fn require_topic(&self, name: &str) -> Result<()> {
        if self.topics.contains_key(name) {
            Ok(())
        } else {
            Err(ProvisionError::NotFound(format!("topic {}", name)))
        }
    }

    fn knows_arn(&self, arn: &str) -> bool {
        self.topics.values().any(|t| t.arn == arn)
            || self.queues.values().any(|q| q.reference.arn == arn)
    }
}

/// In-process backend for tests and dry runs.
pub struct InMemoryBackend {
    region: Region,
    state: RwLock<State>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(Region::UsEast1)
    }
}

impl InMemoryBackend {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            state: RwLock::new(State::default()),
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    fn arn(&self, service: &str, resource: &str) -> String {
        format!("arn:aws:{}:{}:{}:{}", service, self.region, ACCOUNT_ID, resource)
    }

    fn stable_id(parts: &[&str]) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, parts.join("|").as_bytes())
            .simple()
            .to_string()
    }

    /// Fail the next and every later call of `kind` whose subject is `name`.
    pub async fn set_fail_on(&self, kind: CallKind, name: impl Into<String>) {
        self.state.write().await.fail_on.insert((kind, name.into()));
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.fail_on.clear();
    }

    /// Every provisioning call received so far, in order.
    pub async fn calls(&self) -> Vec<ProvisionCall> {
        self.state.read().await.calls.clone()
    }

    pub async fn take_calls(&self) -> Vec<ProvisionCall> {
        std::mem::take(&mut self.state.write().await.calls)
    }

    /// Mark a queue unreachable so the topic routes its deliveries to the
    /// subscription's failure sink.
    pub async fn set_reachable(&self, queue: &str, reachable: bool) -> Result<()> {
        self.state.write().await.queue_mut(queue)?.reachable = reachable;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    /// Publish `body` to a topic. Returns the broker message id.
    pub async fn publish(
        &self,
        topic: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let topic_ref = state
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| ProvisionError::NotFound(format!("topic {}", topic)))?;

        let message_id = Uuid::new_v4().to_string();
        let envelope = BrokerEnvelope::notification(&topic_ref.arn, &message_id, body, attributes);
        let wrapped = serde_json::to_string(&envelope)
            .map_err(|e| ProvisionError::Rejected(format!("Failed to encode envelope: {}", e)))?;

        let deliveries: Vec<(String, Option<String>)> = state
            .subscriptions
            .iter()
            .filter(|s| s.spec.topic.name == topic && s.spec.filter.matches(attributes, body))
            .map(|s| {
                (
                    s.spec.queue.name.clone(),
                    s.spec.failure_sink.as_ref().map(|q| q.name.clone()),
                )
            })
            .collect();

        for (queue, sink) in deliveries {
            let reachable = state.queues.get(&queue).is_some_and(|q| q.reachable);
            let target = if reachable {
                Some(queue)
            } else {
                debug!(queue = %queue, sink = ?sink, "Delivery failed, routing to failure sink");
                sink
            };
            if let Some(q) = target.and_then(|t| state.queues.get_mut(&t)) {
                q.visible.push_back(StoredMessage::new(wrapped.clone()));
            }
        }

        Ok(message_id)
    }

    /// Receive up to `max` messages. Messages already received
    /// `maxReceiveCount` times are moved to the dead-letter queue instead.
    pub async fn receive(&self, queue: &str, max: usize) -> Result<Vec<QueueRecord>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let q = state.queue_mut(queue)?;
        let arn = q.reference.arn.clone();
        let redrive = q.spec.redrive.clone();

        let mut received = Vec::new();
        let mut exhausted = Vec::new();
        while received.len() < max {
            let Some(mut msg) = q.visible.pop_front() else {
                break;
            };
            if let Some(policy) = &redrive {
                if msg.receive_count >= policy.max_receive_count {
                    exhausted.push(msg);
                    continue;
                }
            }
            msg.receive_count += 1;
            let receipt = Uuid::new_v4().to_string();
            received.push(msg.to_record(&receipt, &arn));
            q.in_flight.push_back((receipt, msg));
        }

        if let Some(policy) = redrive {
            if !exhausted.is_empty() {
                let dlq = state.queue_mut(&policy.dead_letter.name)?;
                for mut msg in exhausted {
                    debug!(
                        queue = %queue,
                        message_id = %msg.message_id,
                        "Redriving to dead-letter queue",
                    );
                    msg.receive_count = 0;
                    dlq.visible.push_back(msg);
                }
            }
        }

        Ok(received)
    }

    /// Acknowledge a received message.
    pub async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let q = state.queue_mut(queue)?;
        let idx = q
            .in_flight
            .iter()
            .position(|(receipt, _)| receipt == receipt_handle)
            .ok_or_else(|| ProvisionError::NotFound(format!("receipt {}", receipt_handle)))?;
        q.in_flight.remove(idx);
        Ok(())
    }

    /// Make every in-flight message visible again, as if its visibility
    /// timeout elapsed, ahead of newer messages and in the order they were
    /// received. Returns how many were released.
    pub async fn expire_in_flight(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let q = state.queue_mut(queue)?;
        let released = std::mem::take(&mut q.in_flight);
        let count = released.len();
        for (_, msg) in released.into_iter().rev() {
            q.visible.push_front(msg);
        }
        Ok(count)
    }

    pub async fn purge(&self, queue: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let q = state.queue_mut(queue)?;
        q.visible.clear();
        q.in_flight.clear();
        Ok(())
    }

    /// Visible (not in-flight) messages.
    pub async fn message_count(&self, queue: &str) -> Result<usize> {
        Ok(self.state.read().await.queue(queue)?.visible.len())
    }

    pub async fn in_flight_count(&self, queue: &str) -> Result<usize> {
        Ok(self.state.read().await.queue(queue)?.in_flight.len())
    }

    /// POST `body` to the ingress route at `path`.
    pub async fn invoke_ingress(
        &self,
        path: &str,
        body: &str,
        api_key: Option<&str>,
    ) -> IngressResponse {
        let request_id = Uuid::new_v4().to_string();

        let (topic, allowed) = {
            let state = self.state.read().await;
            let Some(ingress) = state.ingress.values().find(|i| i.route.path == path) else {
                return IngressResponse {
                    status: 403,
                    body: serde_json::json!({"message": "Missing Authentication Token"}),
                };
            };
            if ingress.route.api_key_required {
                let issued = ingress.key.as_ref().and_then(|k| k.value.as_deref());
                if issued.is_none() || issued != api_key {
                    return IngressResponse {
                        status: 403,
                        body: serde_json::json!({"message": "Forbidden"}),
                    };
                }
            }
            let topic = ingress.route.target.clone();
            let principal = Principal::Service(INGRESS_SERVICE_PRINCIPAL.to_string());
            let allowed = state.grants.iter().any(|g| {
                g.resource == topic.arn
                    && g.action == GrantAction::Publish
                    && g.principal == principal
            });
            (topic, allowed)
        };

        let upstream = if allowed {
            self.publish(&topic.name, body, &HashMap::new())
                .await
                .map_err(|e| (500, "InternalFailure", e.to_string()))
        } else {
            Err((
                403,
                "AuthorizationError",
                format!("Not authorized to publish to {}", topic.arn),
            ))
        };

        match upstream {
            Ok(_) => IngressResponse {
                status: OutcomeClass::Success.status_code(),
                body: serde_json::json!(IngressAccepted::new(request_id)),
            },
            Err((status, error_type, error_message)) => {
                let class = OutcomeClass::classify(status);
                IngressResponse {
                    status: class.status_code(),
                    body: serde_json::json!(IngressRejected::new(
                        class,
                        error_type,
                        error_message,
                        request_id
                    )),
                }
            }
        }
    }

    /// `OPTIONS` request to the ingress route at `path`. Returns the preflight
    /// headers, or `None` when no route there answers preflight.
    pub async fn preflight_ingress(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let state = self.state.read().await;
        state
            .ingress
            .values()
            .find(|i| i.route.path == path && i.route.cors)
            .map(|_| {
                CORS_PREFLIGHT_HEADERS
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect()
            })
    }

    /// Serializable view of everything provisioned so far.
    pub async fn snapshot(&self) -> Plan {
        let state = self.state.read().await;
        Plan {
            region: self.region,
            topics: state.topics.values().cloned().collect(),
            queues: state
                .queues
                .values()
                .map(|q| QueuePlan {
                    name: q.reference.name.clone(),
                    arn: q.reference.arn.clone(),
                    visibility_timeout_secs: q.spec.visibility_timeout.as_secs(),
                    retention_secs: q.spec.retention.map(|r| r.as_secs()),
                    dead_letter: q.spec.redrive.as_ref().map(|r| r.dead_letter.name.clone()),
                    max_receive_count: q.spec.redrive.as_ref().map(|r| r.max_receive_count),
                    overrides: q.spec.overrides.clone(),
                })
                .collect(),
            subscriptions: state
                .subscriptions
                .iter()
                .map(|s| SubscriptionPlan {
                    arn: s.reference.arn.clone(),
                    topic: s.spec.topic.name.clone(),
                    queue: s.spec.queue.name.clone(),
                    filter: s.spec.filter.clone(),
                    failure_sink: s.spec.failure_sink.as_ref().map(|q| q.name.clone()),
                })
                .collect(),
            grants: state.grants.clone(),
            consumers: state
                .consumers
                .values()
                .map(|(r, spec)| ConsumerPlan {
                    name: r.name.clone(),
                    role: spec.role.clone(),
                    arn: r.arn.clone(),
                    reference: spec.reference.as_str().to_string(),
                    environment: spec.environment.clone(),
                    overrides: spec.overrides.clone(),
                })
                .collect(),
            event_sources: state
                .event_sources
                .iter()
                .map(|(r, b)| EventSourcePlan {
                    id: r.id.clone(),
                    consumer: b.consumer.name.clone(),
                    queue: b.queue.name.clone(),
                    batch_size: b.batch_size,
                    batching_window_secs: b.batching_window.as_secs(),
                    report_batch_item_failures: b.report_batch_item_failures,
                })
                .collect(),
            ingress: state
                .ingress
                .values()
                .map(|i| IngressPlan {
                    endpoint: i.reference.endpoint.clone(),
                    path: i.route.path.clone(),
                    target: i.route.target.name.clone(),
                    api_key_required: i.route.api_key_required,
                    cors: i.route.cors,
                    key_id: i.key.as_ref().map(|k| k.key_id.clone()),
                    usage_plan_id: i.key.as_ref().map(|k| k.usage_plan_id.clone()),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ProvisioningBackend for InMemoryBackend {
    async fn create_topic(&self, name: &str) -> Result<TopicRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::CreateTopic {
            name: name.to_string(),
        })?;

        if let Some(existing) = state.topics.get(name) {
            return Ok(existing.clone());
        }
        let topic = TopicRef {
            name: name.to_string(),
            arn: self.arn("sns", name),
        };
        info!(topic = %name, arn = %topic.arn, "Created topic");
        state.topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    async fn create_queue(&self, spec: &QueueSpec) -> Result<QueueRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::CreateQueue {
            name: spec.name.clone(),
        })?;

        if let Some(policy) = &spec.redrive {
            state.queue(&policy.dead_letter.name)?;
        }

        if let Some(existing) = state.queues.get_mut(&spec.name) {
            existing.spec = spec.clone();
            return Ok(existing.reference.clone());
        }

        let reference = QueueRef {
            name: spec.name.clone(),
            url: format!(
                "https://sqs.{}.amazonaws.com/{}/{}",
                self.region, ACCOUNT_ID, spec.name
            ),
            arn: self.arn("sqs", &spec.name),
        };
        info!(queue = %spec.name, arn = %reference.arn, "Created queue");
        state.queues.insert(
            spec.name.clone(),
            QueueState {
                reference: reference.clone(),
                spec: spec.clone(),
                visible: VecDeque::new(),
                in_flight: VecDeque::new(),
                reachable: true,
            },
        );
        Ok(reference)
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<SubscriptionRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::Subscribe {
            topic: spec.topic.name.clone(),
            queue: spec.queue.name.clone(),
        })?;

        state.require_topic(&spec.topic.name)?;
        state.queue(&spec.queue.name)?;
        if let Some(sink) = &spec.failure_sink {
            state.queue(&sink.name)?;
        }

        if let Some(existing) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.spec.topic.name == spec.topic.name && s.spec.queue.name == spec.queue.name)
        {
            existing.spec = spec.clone();
            return Ok(existing.reference.clone());
        }

        let reference = SubscriptionRef {
            arn: format!(
                "{}:{}",
                spec.topic.arn,
                Self::stable_id(&[spec.topic.name.as_str(), spec.queue.name.as_str()])
            ),
        };
        info!(
            topic = %spec.topic.name,
            queue = %spec.queue.name,
            filtered = !spec.filter.is_all(),
            "Subscribed queue to topic",
        );
        state.subscriptions.push(SubscriptionState {
            reference: reference.clone(),
            spec: spec.clone(),
        });
        Ok(reference)
    }

    async fn grant(&self, grant: &Grant) -> Result<()> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::Grant {
            principal: grant.principal.clone(),
            resource: grant.resource.clone(),
            action: grant.action,
        })?;

        if !state.knows_arn(&grant.resource) {
            return Err(ProvisionError::NotFound(grant.resource.clone()));
        }
        if !state.grants.contains(grant) {
            debug!(
                resource = %grant.resource,
                principal = ?grant.principal,
                action = ?grant.action,
                "Granted",
            );
            state.grants.push(grant.clone());
        }
        Ok(())
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::CreateConsumer {
            name: spec.name.clone(),
        })?;

        let reference = ConsumerRef {
            name: spec.name.clone(),
            arn: self.arn("lambda", &format!("function:{}", spec.name)),
        };
        if !state.consumers.contains_key(&spec.name) {
            info!(consumer = %spec.name, reference = %spec.reference.as_str(), "Created consumer");
        }
        state
            .consumers
            .insert(spec.name.clone(), (reference.clone(), spec.clone()));
        Ok(reference)
    }

    async fn bind_event_source(&self, binding: &EventSourceBinding) -> Result<EventSourceRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::BindEventSource {
            consumer: binding.consumer.name.clone(),
            queue: binding.queue.name.clone(),
        })?;

        if !state.consumers.contains_key(&binding.consumer.name) {
            return Err(ProvisionError::NotFound(format!(
                "consumer {}",
                binding.consumer.name
            )));
        }
        state.queue(&binding.queue.name)?;

        if let Some((reference, existing)) = state.event_sources.iter_mut().find(|(_, b)| {
            b.consumer.name == binding.consumer.name && b.queue.name == binding.queue.name
        }) {
            *existing = binding.clone();
            return Ok(reference.clone());
        }

        let reference = EventSourceRef {
            id: Self::stable_id(&[binding.consumer.name.as_str(), binding.queue.name.as_str()]),
        };
        info!(
            consumer = %binding.consumer.name,
            queue = %binding.queue.name,
            batch_size = binding.batch_size,
            "Bound event source",
        );
        state.event_sources.push((reference.clone(), binding.clone()));
        Ok(reference)
    }

    async fn create_ingress_route(&self, route: &IngressRoute) -> Result<IngressRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::CreateIngressRoute {
            api: route.api_name.clone(),
            path: route.path.clone(),
        })?;

        state.require_topic(&route.target.name)?;

        if let Some(existing) = state.ingress.get_mut(&route.api_name) {
            existing.route = route.clone();
            return Ok(existing.reference.clone());
        }

        let api_id: String = Self::stable_id(&[route.api_name.as_str()]).chars().take(10).collect();
        let reference = IngressRef {
            endpoint: format!(
                "https://{}.execute-api.{}.amazonaws.com/{}/{}",
                api_id, self.region, route.stage, route.path
            ),
            api_id,
            api_name: route.api_name.clone(),
            stage: route.stage.clone(),
            path: route.path.clone(),
        };
        info!(api = %route.api_name, endpoint = %reference.endpoint, "Created ingress route");
        state.ingress.insert(
            route.api_name.clone(),
            IngressState {
                reference: reference.clone(),
                route: route.clone(),
                key: None,
            },
        );
        Ok(reference)
    }

    async fn create_key_auth(&self, spec: &KeyAuthSpec) -> Result<KeyAuthRef> {
        let mut state = self.state.write().await;
        state.record(ProvisionCall::CreateKeyAuth {
            key: spec.key_name.clone(),
        })?;

        let ingress = state
            .ingress
            .get_mut(&spec.ingress.api_name)
            .ok_or_else(|| ProvisionError::NotFound(format!("api {}", spec.ingress.api_name)))?;

        if let Some(existing) = &ingress.key {
            return Ok(existing.clone());
        }

        let key = KeyAuthRef {
            key_id: Self::stable_id(&[spec.key_name.as_str()]),
            usage_plan_id: Self::stable_id(&[spec.usage_plan_name.as_str()]),
            value: Some(Uuid::new_v4().simple().to_string()),
        };
        info!(key = %spec.key_name, usage_plan = %spec.usage_plan_name, "Issued API key");
        ingress.key = Some(key.clone());
        Ok(key)
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Serializable snapshot of an in-memory topology.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub region: Region,
    pub topics: Vec<TopicRef>,
    pub queues: Vec<QueuePlan>,
    pub subscriptions: Vec<SubscriptionPlan>,
    pub grants: Vec<Grant>,
    pub consumers: Vec<ConsumerPlan>,
    pub event_sources: Vec<EventSourcePlan>,
    pub ingress: Vec<IngressPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuePlan {
    pub name: String,
    pub arn: String,
    pub visibility_timeout_secs: u64,
    pub retention_secs: Option<u64>,
    pub dead_letter: Option<String>,
    pub max_receive_count: Option<u32>,
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionPlan {
    pub arn: String,
    pub topic: String,
    pub queue: String,
    pub filter: MessageFilter,
    pub failure_sink: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerPlan {
    pub name: String,
    pub role: String,
    pub arn: String,
    pub reference: String,
    pub environment: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSourcePlan {
    pub id: String,
    pub consumer: String,
    pub queue: String,
    pub batch_size: u32,
    pub batching_window_secs: u64,
    pub report_batch_item_failures: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngressPlan {
    pub endpoint: String,
    pub path: String,
    pub target: String,
    pub api_key_required: bool,
    pub cors: bool,
    pub key_id: Option<String>,
    pub usage_plan_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{RedrivePolicy, MAX_RECEIVE_COUNT};
    use std::time::Duration;

    async fn topic_and_queue(
        backend: &InMemoryBackend,
        filter: MessageFilter,
    ) -> (TopicRef, QueueRef, QueueRef) {
        let topic = backend.create_topic("t").await.unwrap();
        let dlq = backend.create_queue(&QueueSpec::dead_letter("q-dlq")).await.unwrap();
        let queue = backend
            .create_queue(&QueueSpec {
                name: "q".to_string(),
                visibility_timeout: Duration::from_secs(30),
                retention: None,
                redrive: Some(RedrivePolicy {
                    dead_letter: dlq.clone(),
                    max_receive_count: MAX_RECEIVE_COUNT,
                }),
                overrides: BTreeMap::new(),
            })
            .await
            .unwrap();
        backend
            .subscribe(&SubscriptionSpec {
                topic: topic.clone(),
                queue: queue.clone(),
                filter,
                failure_sink: Some(dlq.clone()),
            })
            .await
            .unwrap();
        (topic, queue, dlq)
    }

    #[tokio::test]
    async fn test_create_topic_is_idempotent() {
        let backend = InMemoryBackend::default();
        let a = backend.create_topic("t").await.unwrap();
        let b = backend.create_topic("t").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.arn, "arn:aws:sns:us-east-1:000000000000:t");
        assert_eq!(backend.snapshot().await.topics.len(), 1);
        assert_eq!(backend.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_redrive_target_must_exist() {
        let backend = InMemoryBackend::default();
        let ghost = QueueRef {
            name: "ghost".to_string(),
            url: String::new(),
            arn: String::new(),
        };
        let mut spec = QueueSpec::dead_letter("q");
        spec.redrive = Some(RedrivePolicy {
            dead_letter: ghost,
            max_receive_count: 3,
        });
        let err = backend.create_queue(&spec).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_wraps_in_envelope() {
        let backend = InMemoryBackend::default();
        topic_and_queue(&backend, MessageFilter::All).await;

        backend
            .publish("t", r#"{"message":"hi"}"#, &HashMap::new())
            .await
            .unwrap();

        let records = backend.receive("q", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let decoded: Vec<crate::envelope::QueueMessage<serde_json::Value>> =
            crate::envelope::decode_records(&records);
        assert_eq!(decoded[0].body, serde_json::json!({"message": "hi"}));
    }

    #[tokio::test]
    async fn test_filter_excludes_non_matching() {
        let backend = InMemoryBackend::default();
        topic_and_queue(&backend, MessageFilter::allowlist("eventType", ["send"])).await;

        let mut attrs = HashMap::new();
        attrs.insert("eventType".to_string(), "receive".to_string());
        backend.publish("t", "{}", &attrs).await.unwrap();
        assert_eq!(backend.message_count("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redrive_after_max_receives() {
        let backend = InMemoryBackend::default();
        topic_and_queue(&backend, MessageFilter::All).await;
        backend.publish("t", "{}", &HashMap::new()).await.unwrap();

        for _ in 0..MAX_RECEIVE_COUNT {
            assert_eq!(backend.receive("q", 1).await.unwrap().len(), 1);
            assert_eq!(backend.expire_in_flight("q").await.unwrap(), 1);
        }

        assert!(backend.receive("q", 1).await.unwrap().is_empty());
        assert_eq!(backend.message_count("q-dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_messages_return_in_receive_order() {
        let backend = InMemoryBackend::default();
        topic_and_queue(&backend, MessageFilter::All).await;
        for n in 0..8 {
            backend
                .publish("t", &format!(r#"{{"n":{}}}"#, n), &HashMap::new())
                .await
                .unwrap();
        }

        let first: Vec<String> = backend
            .receive("q", 8)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(backend.expire_in_flight("q").await.unwrap(), 8);

        let again: Vec<String> = backend
            .receive("q", 8)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_delete_acknowledges() {
        let backend = InMemoryBackend::default();
        topic_and_queue(&backend, MessageFilter::All).await;
        backend.publish("t", "{}", &HashMap::new()).await.unwrap();

        let records = backend.receive("q", 1).await.unwrap();
        backend
            .delete_message("q", &records[0].receipt_handle)
            .await
            .unwrap();
        assert_eq!(backend.expire_in_flight("q").await.unwrap(), 0);
        assert!(backend.delete_message("q", "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_queue_routes_to_failure_sink() {
        let backend = InMemoryBackend::default();
        topic_and_queue(&backend, MessageFilter::All).await;
        backend.set_reachable("q", false).await.unwrap();

        backend.publish("t", "{}", &HashMap::new()).await.unwrap();
        assert_eq!(backend.message_count("q").await.unwrap(), 0);
        assert_eq!(backend.message_count("q-dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = InMemoryBackend::default();
        backend.set_fail_on(CallKind::CreateQueue, "q").await;

        assert!(backend.create_queue(&QueueSpec::dead_letter("other")).await.is_ok());
        let err = backend.create_queue(&QueueSpec::dead_letter("q")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Rejected(_)));
        assert_eq!(backend.calls().await.len(), 2);

        backend.clear_failures().await;
        assert!(backend.create_queue(&QueueSpec::dead_letter("q")).await.is_ok());
    }

    #[tokio::test]
    async fn test_grant_unknown_resource() {
        let backend = InMemoryBackend::default();
        let grant = Grant {
            principal: Principal::ConsumerRole("c-role".to_string()),
            resource: "arn:aws:sqs:us-east-1:000000000000:missing".to_string(),
            action: GrantAction::Consume,
        };
        assert!(matches!(
            backend.grant(&grant).await,
            Err(ProvisionError::NotFound(_))
        ));
    }
}
