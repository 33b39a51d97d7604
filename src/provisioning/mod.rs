//! Provisioning backends.
//!
//! This module contains:
//! - `ProvisioningBackend` trait: the narrow capability set the builder drives
//! - Request and reference types passed across that seam
//! - Implementations: in-memory (always available), AWS (`--features aws`)
//!
//! Every call is idempotent by name. Re-invoking a call for a resource that
//! already exists reconciles it to the requested state and returns the same
//! reference instead of creating a duplicate.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::ingress::ResponseRule;
use crate::spec::{ConsumerReference, MessageFilter};

#[cfg(feature = "aws")]
pub mod aws;
pub mod memory;

#[cfg(feature = "aws")]
pub use aws::AwsBackend;
pub use memory::InMemoryBackend;

/// Retention for every dead-letter queue the builder creates.
pub const DEAD_LETTER_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Receives before a message is redriven to its route's dead-letter queue.
pub const MAX_RECEIVE_COUNT: u32 = 3;

/// Service principal of the ingress gateway.
pub const INGRESS_SERVICE_PRINCIPAL: &str = "apigateway.amazonaws.com";

/// Headers an ingress answers CORS preflight with: any origin, any method.
pub const CORS_PREFLIGHT_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "OPTIONS,GET,PUT,POST,DELETE,PATCH,HEAD"),
    ("Access-Control-Allow-Headers", CORS_ALLOW_HEADERS),
];

const CORS_ALLOW_HEADERS: &str =
    "Content-Type,X-Amz-Date,Authorization,X-Api-Key,X-Amz-Security-Token,X-Amz-User-Agent";

// ============================================================================
// Errors
// ============================================================================

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors a backend reports.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// References
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicRef {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueRef {
    pub name: String,
    pub url: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRef {
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerRef {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSourceRef {
    pub id: String,
}

/// A deployed ingress route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRef {
    pub api_id: String,
    pub api_name: String,
    pub stage: String,
    pub path: String,
    /// Full URL callers POST to.
    pub endpoint: String,
}

/// An issued API key bound to the ingress through a usage plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyAuthRef {
    pub key_id: String,
    pub usage_plan_id: String,
    /// Key value, when the backend discloses it.
    #[serde(skip_serializing)]
    pub value: Option<String>,
}

// ============================================================================
// Requests
// ============================================================================

/// Where a queue sends messages it has given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedrivePolicy {
    pub dead_letter: QueueRef,
    pub max_receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub visibility_timeout: Duration,
    pub retention: Option<Duration>,
    pub redrive: Option<RedrivePolicy>,
    /// Opaque backend attributes applied on top of the above.
    pub overrides: BTreeMap<String, String>,
}

impl QueueSpec {
    /// A dead-letter queue: default visibility, 14-day retention, no redrive.
    pub fn dead_letter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: crate::spec::DEFAULT_VISIBILITY_TIMEOUT,
            retention: Some(DEAD_LETTER_RETENTION),
            redrive: None,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub topic: TopicRef,
    pub queue: QueueRef,
    pub filter: MessageFilter,
    /// Receives messages the topic could not deliver to `queue`.
    pub failure_sink: Option<QueueRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Principal {
    /// A cloud service acting on its own behalf (e.g. the ingress gateway).
    Service(String),
    /// A consumer's execution role, by role name. Backends that manage
    /// identities create the role on first use.
    ConsumerRole(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    Publish,
    Consume,
}

impl GrantAction {
    /// Provider actions this grant expands to.
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            GrantAction::Publish => &["sns:Publish"],
            GrantAction::Consume => &[
                "sqs:ReceiveMessage",
                "sqs:ChangeMessageVisibility",
                "sqs:GetQueueUrl",
                "sqs:DeleteMessage",
                "sqs:GetQueueAttributes",
            ],
        }
    }
}

/// Permission for `principal` to perform `action` on `resource` (an ARN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub principal: Principal,
    pub resource: String,
    pub action: GrantAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    /// Execution role name, shared with the route's consume grant.
    pub role: String,
    pub reference: ConsumerReference,
    pub environment: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSourceBinding {
    pub consumer: ConsumerRef,
    pub queue: QueueRef,
    pub batch_size: u32,
    pub batching_window: Duration,
    /// Consumer may acknowledge part of a batch.
    pub report_batch_item_failures: bool,
}

/// A POST route forwarding its body to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRoute {
    pub api_name: String,
    pub stage: String,
    pub path: String,
    pub target: TopicRef,
    pub request_template: String,
    pub response_rules: Vec<ResponseRule>,
    pub api_key_required: bool,
    /// Answer `OPTIONS` preflight with [`CORS_PREFLIGHT_HEADERS`].
    pub cors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAuthSpec {
    pub ingress: IngressRef,
    pub key_name: String,
    pub usage_plan_name: String,
}

// ============================================================================
// Trait
// ============================================================================

/// Materializes topology nodes and edges.
///
/// Implementations:
/// - `InMemoryBackend`: in-process simulation with a data plane, for tests
/// - `AwsBackend`: SNS, SQS, Lambda and API Gateway
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create_topic(&self, name: &str) -> Result<TopicRef>;

    async fn create_queue(&self, spec: &QueueSpec) -> Result<QueueRef>;

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<SubscriptionRef>;

    async fn grant(&self, grant: &Grant) -> Result<()>;

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerRef>;

    async fn bind_event_source(&self, binding: &EventSourceBinding) -> Result<EventSourceRef>;

    async fn create_ingress_route(&self, route: &IngressRoute) -> Result<IngressRef>;

    async fn create_key_auth(&self, spec: &KeyAuthSpec) -> Result<KeyAuthRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_queue_spec() {
        let spec = QueueSpec::dead_letter("dlq");
        assert_eq!(spec.retention, Some(Duration::from_secs(1_209_600)));
        assert!(spec.redrive.is_none());
    }

    #[test]
    fn test_consume_grant_expands_to_receive_and_delete() {
        let actions = GrantAction::Consume.actions();
        assert!(actions.contains(&"sqs:ReceiveMessage"));
        assert!(actions.contains(&"sqs:DeleteMessage"));
        assert_eq!(GrantAction::Publish.actions(), &["sns:Publish"]);
    }

    #[test]
    fn test_key_value_not_serialized() {
        let key = KeyAuthRef {
            key_id: "k".to_string(),
            usage_plan_id: "p".to_string(),
            value: Some("secret".to_string()),
        };
        let json = serde_json::to_value(&key).unwrap();
        assert!(json.get("value").is_none());
    }
}
