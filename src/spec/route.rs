//! One subscriber pipeline: queue, dead-letter queue, filter and consumer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validation::{self, ValidationError};

/// Default messages per consumer invocation.
pub const DEFAULT_MAX_BATCH_SIZE: u32 = 10;

/// Default visibility timeout (the SQS default).
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a filter looks for its attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterScope {
    /// Broker message attributes set by the publisher.
    #[default]
    MessageAttributes,
    /// Top-level keys of the JSON message body.
    MessageBody,
}

impl FilterScope {
    /// Identifier understood by SNS (`FilterPolicyScope`).
    pub fn as_policy_scope(&self) -> &'static str {
        match self {
            FilterScope::MessageAttributes => "MessageAttributes",
            FilterScope::MessageBody => "MessageBody",
        }
    }
}

/// Predicate deciding which published messages a route receives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageFilter {
    /// Receive everything published to the topic.
    #[default]
    All,
    /// Receive messages whose `attribute` equals one of `values`.
    AttributeAllowlist {
        attribute: String,
        values: Vec<String>,
        #[serde(default)]
        scope: FilterScope,
    },
}

impl MessageFilter {
    /// Allowlist on a message attribute.
    pub fn allowlist<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MessageFilter::AttributeAllowlist {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
            scope: FilterScope::MessageAttributes,
        }
    }

    /// Allowlist on a top-level key of the JSON body.
    pub fn body_allowlist<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MessageFilter::AttributeAllowlist {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
            scope: FilterScope::MessageBody,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, MessageFilter::All)
    }

    /// Evaluate the filter against a published message.
    pub fn matches(&self, attributes: &HashMap<String, String>, body: &str) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::AttributeAllowlist {
                attribute,
                values,
                scope,
            } => {
                let actual = match scope {
                    FilterScope::MessageAttributes => attributes.get(attribute).cloned(),
                    FilterScope::MessageBody => body_value(body, attribute),
                };
                actual.is_some_and(|v| values.iter().any(|allowed| *allowed == v))
            }
        }
    }

    /// SNS filter policy document, or `None` for an unfiltered subscription.
    pub fn to_policy(&self) -> Option<(serde_json::Value, FilterScope)> {
        match self {
            MessageFilter::All => None,
            MessageFilter::AttributeAllowlist {
                attribute,
                values,
                scope,
            } => {
                let mut policy = serde_json::Map::new();
                policy.insert(attribute.clone(), serde_json::json!(values));
                Some((serde_json::Value::Object(policy), *scope))
            }
        }
    }
}

fn body_value(body: &str, key: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    match parsed.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Opaque handle to consumer code (a bundle path or a deployable unit id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerReference(String);

impl ConsumerReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Raw, unvalidated route parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteProps {
    pub name: String,
    pub filter: MessageFilter,
    pub environment_variables: BTreeMap<String, String>,
    pub consumer_reference: ConsumerReference,
    pub max_batch_size: u32,
    pub max_batching_window: Duration,
    pub visibility_timeout: Duration,
    /// Passed through to the backend when creating the queue.
    pub queue_overrides: BTreeMap<String, String>,
    /// Passed through to the backend when creating the consumer.
    pub consumer_overrides: BTreeMap<String, String>,
}

impl RouteProps {
    /// Props with default batching and an unfiltered subscription.
    pub fn new(name: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: MessageFilter::All,
            environment_variables: BTreeMap::new(),
            consumer_reference: ConsumerReference::new(consumer),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batching_window: Duration::ZERO,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            queue_overrides: BTreeMap::new(),
            consumer_overrides: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn with_max_batch_size(mut self, size: u32) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_batching_window(mut self, window: Duration) -> Self {
        self.max_batching_window = window;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_queue_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.queue_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_consumer_override(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.consumer_overrides.insert(key.into(), value.into());
        self
    }
}

/// A validated, immutable route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    props: RouteProps,
}

impl RouteSpec {
    /// Validate the props. Fails on the first violated constraint.
    pub fn new(props: RouteProps) -> validation::Result<Self> {
        validation::validate_route_name(&props.name)?;
        validation::validate_filter(&props.name, &props.filter)?;
        validation::validate_queue_bounds(
            &props.name,
            props.max_batch_size,
            props.max_batching_window,
            props.visibility_timeout,
        )?;
        Ok(Self { props })
    }

    pub fn name(&self) -> &str {
        &self.props.name
    }

    pub fn filter(&self) -> &MessageFilter {
        &self.props.filter
    }

    pub fn environment_variables(&self) -> &BTreeMap<String, String> {
        &self.props.environment_variables
    }

    pub fn consumer_reference(&self) -> &ConsumerReference {
        &self.props.consumer_reference
    }

    pub fn max_batch_size(&self) -> u32 {
        self.props.max_batch_size
    }

    pub fn max_batching_window(&self) -> Duration {
        self.props.max_batching_window
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.props.visibility_timeout
    }

    pub fn queue_overrides(&self) -> &BTreeMap<String, String> {
        &self.props.queue_overrides
    }

    pub fn consumer_overrides(&self) -> &BTreeMap<String, String> {
        &self.props.consumer_overrides
    }
}

impl TryFrom<RouteProps> for RouteSpec {
    type Error = ValidationError;

    fn try_from(props: RouteProps) -> Result<Self, Self::Error> {
        RouteSpec::new(props)
    }
}
