//! Deterministic resource naming.
//!
//! Every resource name is derived from a root of `{stage}-{topology_id}`:
//!
//! | Role               | Name                             |
//! |--------------------|----------------------------------|
//! | Topic              | `{root}-topic`                   |
//! | Delivery failures  | `{root}-delivery-failures`       |
//! | Ingress API        | `{root}-api`                     |
//! | API key            | `{root}-api-key`                 |
//! | Usage plan         | `{root}-usage-plan`              |
//! | Route queue        | `{root}-{route}-queue`           |
//! | Route DLQ          | `{root}-{route}-dlq`             |
//! | Route consumer     | `{root}-{route}-consumer`        |
//! | Consumer role      | `{root}-{route}-role`            |
//!
//! Route-scoped suffixes never appear as the last token of a topology-level
//! name, so two distinct `(role, route)` pairs can never produce the same
//! name. Names longer than the provider allows for a role are truncated and
//! suffixed with a short SHA-256 digest of the full name.

use sha2::{Digest, Sha256};

use crate::spec::TopologySpec;
use crate::validation;

/// Length of the hex digest appended to truncated names.
const DIGEST_HEX_LEN: usize = 8;

/// SQS queue names, API names.
const MAX_QUEUE_NAME_LENGTH: usize = 80;
/// SNS topic names.
const MAX_TOPIC_NAME_LENGTH: usize = 256;
/// Lambda function names, IAM role names.
const MAX_CONSUMER_NAME_LENGTH: usize = 64;

/// What a name is for. Route-scoped roles carry the route name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole<'a> {
    Topic,
    DeliveryFailures,
    Api,
    ApiKey,
    UsagePlan,
    Queue(&'a str),
    DeadLetterQueue(&'a str),
    Consumer(&'a str),
    ConsumerRole(&'a str),
}

impl ResourceRole<'_> {
    fn suffix(&self) -> &'static str {
        match self {
            ResourceRole::Topic => "topic",
            ResourceRole::DeliveryFailures => "delivery-failures",
            ResourceRole::Api => "api",
            ResourceRole::ApiKey => "api-key",
            ResourceRole::UsagePlan => "usage-plan",
            ResourceRole::Queue(_) => "queue",
            ResourceRole::DeadLetterQueue(_) => "dlq",
            ResourceRole::Consumer(_) => "consumer",
            ResourceRole::ConsumerRole(_) => "role",
        }
    }

    fn route(&self) -> Option<&str> {
        match self {
            ResourceRole::Queue(r)
            | ResourceRole::DeadLetterQueue(r)
            | ResourceRole::Consumer(r)
            | ResourceRole::ConsumerRole(r) => Some(*r),
            _ => None,
        }
    }

    fn max_len(&self) -> usize {
        match self {
            ResourceRole::Topic => MAX_TOPIC_NAME_LENGTH,
            ResourceRole::Consumer(_) | ResourceRole::ConsumerRole(_) => MAX_CONSUMER_NAME_LENGTH,
            _ => MAX_QUEUE_NAME_LENGTH,
        }
    }
}

/// Derives resource names for one topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingScheme {
    root: String,
}

impl NamingScheme {
    /// Build the scheme for `stage` and the caller-supplied `topology_id`.
    pub fn new(stage: &str, topology_id: &str) -> validation::Result<Self> {
        validation::validate_stage(stage)?;
        validation::validate_topology_id(topology_id)?;
        Ok(Self {
            root: format!("{}-{}", stage, topology_id),
        })
    }

    pub fn for_spec(spec: &TopologySpec, topology_id: &str) -> validation::Result<Self> {
        Self::new(spec.stage(), topology_id)
    }

    /// `{stage}-{topology_id}`.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The name for `role`. Same input, same output.
    pub fn name(&self, role: ResourceRole<'_>) -> String {
        let full = match role.route() {
            Some(route) => format!("{}-{}-{}", self.root, route, role.suffix()),
            None => format!("{}-{}", self.root, role.suffix()),
        };
        fit(full, role.max_len())
    }

    pub fn topic(&self) -> String {
        self.name(ResourceRole::Topic)
    }

    pub fn delivery_failures(&self) -> String {
        self.name(ResourceRole::DeliveryFailures)
    }

    pub fn api(&self) -> String {
        self.name(ResourceRole::Api)
    }

    pub fn api_key(&self) -> String {
        self.name(ResourceRole::ApiKey)
    }

    pub fn usage_plan(&self) -> String {
        self.name(ResourceRole::UsagePlan)
    }

    pub fn queue(&self, route: &str) -> String {
        self.name(ResourceRole::Queue(route))
    }

    pub fn dead_letter_queue(&self, route: &str) -> String {
        self.name(ResourceRole::DeadLetterQueue(route))
    }

    pub fn consumer(&self, route: &str) -> String {
        self.name(ResourceRole::Consumer(route))
    }

    /// Execution role the route's consumer runs as.
    pub fn consumer_role(&self, route: &str) -> String {
        self.name(ResourceRole::ConsumerRole(route))
    }
}

/// Truncate `full` to `max` characters, keeping it unique via a digest.
///
/// Route names reaching the public helpers are not necessarily validated, so
/// the cut is made on a char boundary.
fn fit(full: String, max: usize) -> String {
    if full.chars().count() <= max {
        return full;
    }
    let digest = Sha256::digest(full.as_bytes());
    let tag = hex::encode(digest);
    let keep = max - DIGEST_HEX_LEN - 1;
    let cut = full
        .char_indices()
        .nth(keep)
        .map_or(full.len(), |(idx, _)| idx);
    let head = full[..cut].trim_end_matches('-');
    format!("{}-{}", head, &tag[..DIGEST_HEX_LEN])
}
