//! AWS provisioning backend.
//!
//! Topics are SNS topics, queues are SQS queues, consumers are Lambda
//! functions fed by SQS event-source mappings, and the ingress is an API
//! Gateway REST API whose POST method publishes straight to SNS. Consumer
//! execution roles are IAM roles, created here unless
//! `aws.consumer_role_arn` names an existing one.
//!
//! Every call looks the resource up by name first and reconciles it in place.
//! SNS topic creation is natively idempotent; everything else is get-then-
//! update or create.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_apigateway::types::{ApiKeySourceType, IntegrationType};
use aws_sdk_apigateway::Client as ApiGatewayClient;
use aws_sdk_iam::Client as IamClient;
use aws_sdk_lambda::Client as LambdaClient;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    ConsumerRef, ConsumerSpec, EventSourceBinding, EventSourceRef, Grant, IngressRef,
    IngressRoute, KeyAuthRef, KeyAuthSpec, Principal, ProvisionError, ProvisioningBackend,
    QueueRef, QueueSpec, Result, SubscriptionRef, SubscriptionSpec, TopicRef,
    CORS_PREFLIGHT_HEADERS,
};
use crate::config::AwsBackendConfig;
use crate::ingress::{FORM_CONTENT_TYPE, INGRESS_METHOD, JSON_CONTENT_TYPE};
use crate::spec::Region;

/// Lambda memory when not overridden.
const DEFAULT_MEMORY_MB: i32 = 512;
/// Lambda timeout when not overridden.
const DEFAULT_TIMEOUT_SECS: i32 = 20;

/// Trust policy letting Lambda assume a consumer role.
const LAMBDA_SERVICE_PRINCIPAL: &str = "lambda.amazonaws.com";
/// Managed policy granting a consumer its log streams.
const LAMBDA_BASIC_EXECUTION_POLICY: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

const PREFLIGHT_METHOD: &str = "OPTIONS";
const PREFLIGHT_STATUS: &str = "204";

/// Page size for API Gateway list calls.
const LIST_LIMIT: i32 = 500;

/// SNS, SQS, Lambda and API Gateway provisioning.
pub struct AwsBackend {
    sns: SnsClient,
    sqs: SqsClient,
    lambda: LambdaClient,
    apigateway: ApiGatewayClient,
    iam: IamClient,
    region: Region,
    config: AwsBackendConfig,
    /// Queue URLs by ARN, for policy updates on grants.
    queue_urls: RwLock<HashMap<String, String>>,
    /// Consumer role ARNs by role name.
    role_arns: RwLock<HashMap<String, String>>,
    /// Resource policy statements by resource ARN, merged across calls.
    policies: RwLock<HashMap<String, Vec<serde_json::Value>>>,
}

impl AwsBackend {
    /// Connect to AWS (or the configured endpoint) in `region`.
    pub async fn new(region: Region, config: AwsBackendConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.as_str().to_string()));

        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        info!(
            region = %region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS"
        );

        Ok(Self {
            sns: SnsClient::new(&sdk_config),
            sqs: SqsClient::new(&sdk_config),
            lambda: LambdaClient::new(&sdk_config),
            apigateway: ApiGatewayClient::new(&sdk_config),
            iam: IamClient::new(&sdk_config),
            region,
            config,
            queue_urls: RwLock::new(HashMap::new()),
            role_arns: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
        })
    }

    pub fn sns(&self) -> &SnsClient {
        &self.sns
    }

    pub fn sqs(&self) -> &SqsClient {
        &self.sqs
    }

    pub fn iam(&self) -> &IamClient {
        &self.iam
    }

    /// Add `statement` to the cached policy for `arn` and return the full
    /// policy document.
    async fn merge_policy(&self, arn: &str, statement: serde_json::Value) -> String {
        let mut policies = self.policies.write().await;
        let statements = policies.entry(arn.to_string()).or_default();
        if !statements.contains(&statement) {
            statements.push(statement);
        }
        json!({
            "Version": "2012-10-17",
            "Statement": statements,
        })
        .to_string()
    }

    async fn set_queue_policy(
        &self,
        queue_url: &str,
        queue_arn: &str,
        statement: serde_json::Value,
    ) -> Result<()> {
        let policy = self.merge_policy(queue_arn, statement).await;
        self.sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .attributes(QueueAttributeName::Policy, policy)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to set queue policy: {}", e)))?;
        Ok(())
    }

    async fn set_topic_policy(&self, topic_arn: &str, statement: serde_json::Value) -> Result<()> {
        let policy = self.merge_policy(topic_arn, statement).await;
        self.sns
            .set_topic_attributes()
            .topic_arn(topic_arn)
            .attribute_name("Policy")
            .attribute_value(policy)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to set topic policy: {}", e)))?;
        Ok(())
    }

    /// Statement allowing `topic_arn` to deliver into `queue_arn`.
    fn topic_delivery_statement(topic_arn: &str, queue_arn: &str) -> serde_json::Value {
        json!({
            "Effect": "Allow",
            "Principal": {"Service": "sns.amazonaws.com"},
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {"ArnEquals": {"aws:SourceArn": topic_arn}},
        })
    }


    fn queue_attributes(spec: &QueueSpec) -> HashMap<QueueAttributeName, String> {
        let mut attrs = HashMap::new();
        attrs.insert(
            QueueAttributeName::VisibilityTimeout,
            spec.visibility_timeout.as_secs().to_string(),
        );
        if let Some(retention) = spec.retention {
            attrs.insert(
                QueueAttributeName::MessageRetentionPeriod,
                retention.as_secs().to_string(),
            );
        }
        if let Some(redrive) = &spec.redrive {
            let policy = json!({
                "deadLetterTargetArn": redrive.dead_letter.arn,
                "maxReceiveCount": redrive.max_receive_count,
            });
            attrs.insert(QueueAttributeName::RedrivePolicy, policy.to_string());
        }
        for (key, value) in &spec.overrides {
            attrs.insert(QueueAttributeName::from(key.as_str()), value.clone());
        }
        attrs
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String> {
        let output = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to get queue ARN: {}", e)))?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| ProvisionError::Rejected("Queue has no ARN attribute".to_string()))
    }

    async fn rest_api_id(&self, name: &str) -> Result<String> {
        let apis = self
            .apigateway
            .get_rest_apis()
            .limit(LIST_LIMIT)
            .send()
            .await
            .map_err(|e| ProvisionError::Connection(format!("Failed to list REST APIs: {}", e)))?;

        if let Some(id) = apis
            .items()
            .iter()
            .find(|api| api.name() == Some(name))
            .and_then(|api| api.id())
        {
            return Ok(id.to_string());
        }

        let created = self
            .apigateway
            .create_rest_api()
            .name(name)
            .api_key_source(ApiKeySourceType::Header)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to create REST API: {}", e)))?;
        let id = created
            .id()
            .ok_or_else(|| ProvisionError::Rejected("create_rest_api returned no id".to_string()))?;
        info!(api = %name, id = %id, "Created REST API");
        Ok(id.to_string())
    }

    /// `OPTIONS` on the resource, answered by a mock integration with
    /// [`CORS_PREFLIGHT_HEADERS`].
    async fn put_cors_preflight(&self, api_id: &str, resource_id: &str) -> Result<()> {
        let put = self
            .apigateway
            .put_method()
            .rest_api_id(api_id)
            .resource_id(resource_id)
            .http_method(PREFLIGHT_METHOD)
            .authorization_type("NONE")
            .send()
            .await;
        if let Err(e) = put {
            let conflict = e
                .as_service_error()
                .map(|se| se.is_conflict_exception())
                .unwrap_or(false);
            if !conflict {
                return Err(ProvisionError::Rejected(format!(
                    "Failed to put preflight method: {}",
                    e
                )));
            }
        }

        self.apigateway
            .put_integration()
            .rest_api_id(api_id)
            .resource_id(resource_id)
            .http_method(PREFLIGHT_METHOD)
            .r#type(IntegrationType::Mock)
            .request_templates(
                JSON_CONTENT_TYPE,
                format!(r#"{{"statusCode": {}}}"#, PREFLIGHT_STATUS),
            )
            .send()
            .await
            .map_err(|e| {
                ProvisionError::Rejected(format!("Failed to put preflight integration: {}", e))
            })?;

        let mut method_response = self
            .apigateway
            .put_method_response()
            .rest_api_id(api_id)
            .resource_id(resource_id)
            .http_method(PREFLIGHT_METHOD)
            .status_code(PREFLIGHT_STATUS);
        let mut integration_response = self
            .apigateway
            .put_integration_response()
            .rest_api_id(api_id)
            .resource_id(resource_id)
            .http_method(PREFLIGHT_METHOD)
            .status_code(PREFLIGHT_STATUS);
        for (header, value) in CORS_PREFLIGHT_HEADERS {
            let parameter = format!("method.response.header.{}", header);
            method_response = method_response.response_parameters(&parameter, true);
            integration_response =
                integration_response.response_parameters(parameter, format!("'{}'", value));
        }

        if let Err(e) = method_response.send().await {
            let conflict = e
                .as_service_error()
                .map(|se| se.is_conflict_exception())
                .unwrap_or(false);
            if !conflict {
                return Err(ProvisionError::Rejected(format!(
                    "Failed to put preflight method response: {}",
                    e
                )));
            }
        }
        integration_response.send().await.map_err(|e| {
            ProvisionError::Rejected(format!("Failed to put preflight integration response: {}", e))
        })?;

        debug!(api = %api_id, resource = %resource_id, "Enabled CORS preflight");
        Ok(())
    }

    /// Resource id for `/{path}`, creating it under the root if needed.
    async fn path_resource_id(&self, api_id: &str, path: &str) -> Result<String> {
        let resources = self
            .apigateway
            .get_resources()
            .rest_api_id(api_id)
            .limit(LIST_LIMIT)
            .send()
            .await
            .map_err(|e| ProvisionError::Connection(format!("Failed to list resources: {}", e)))?;

        let full_path = format!("/{}", path);
        let mut root_id = None;
        for resource in resources.items() {
            match resource.path() {
                Some(p) if p == full_path => {
                    if let Some(id) = resource.id() {
                        return Ok(id.to_string());
                    }
                }
                Some("/") => root_id = resource.id().map(str::to_string),
                _ => {}
            }
        }

        let root_id = root_id
            .ok_or_else(|| ProvisionError::NotFound(format!("root resource of API {}", api_id)))?;
        let created = self
            .apigateway
            .create_resource()
            .rest_api_id(api_id)
            .parent_id(root_id)
            .path_part(path)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to create resource: {}", e)))?;
        created
            .id()
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::Rejected("create_resource returned no id".to_string()))
    }

    fn endpoint(&self, api_id: &str, stage: &str, path: &str) -> String {
        match &self.config.endpoint_url {
            Some(base) => format!(
                "{}/restapis/{}/{}/_user_request_/{}",
                base.trim_end_matches('/'),
                api_id,
                stage,
                path
            ),
            None => format!(
                "https://{}.execute-api.{}.amazonaws.com/{}/{}",
                api_id, self.region, stage, path
            ),
        }
    }

    /// ARN of the consumer role `name`, creating the role if needed.
    ///
    /// A configured `aws.consumer_role_arn` replaces every derived role.
    async fn consumer_role_arn(&self, name: &str) -> Result<String> {
        if let Some(arn) = &self.config.consumer_role_arn {
            return Ok(arn.clone());
        }
        if let Some(arn) = self.role_arns.read().await.get(name) {
            return Ok(arn.clone());
        }

        let existing = self
            .iam
            .get_role()
            .role_name(name)
            .send()
            .await
            .ok()
            .and_then(|out| out.role().map(|r| r.arn().to_string()));

        let arn = match existing {
            Some(arn) => arn,
            None => {
                let trust = json!({
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": {"Service": LAMBDA_SERVICE_PRINCIPAL},
                        "Action": "sts:AssumeRole",
                    }],
                });
                let created = self
                    .iam
                    .create_role()
                    .role_name(name)
                    .assume_role_policy_document(trust.to_string())
                    .send()
                    .await
                    .map_err(|e| {
                        ProvisionError::Rejected(format!("Failed to create consumer role: {}", e))
                    })?;
                let arn = created
                    .role()
                    .map(|r| r.arn().to_string())
                    .ok_or_else(|| {
                        ProvisionError::Rejected("IAM create_role returned no role".to_string())
                    })?;
                info!(role = %name, arn = %arn, "Created consumer role");
                arn
            }
        };

        self.iam
            .attach_role_policy()
            .role_name(name)
            .policy_arn(LAMBDA_BASIC_EXECUTION_POLICY)
            .send()
            .await
            .map_err(|e| {
                ProvisionError::Rejected(format!("Failed to attach execution policy: {}", e))
            })?;

        self.role_arns
            .write()
            .await
            .insert(name.to_string(), arn.clone());
        Ok(arn)
    }

    /// Allow a derived consumer role `actions` on `resource` through an
    /// inline policy named after the resource.
    async fn put_role_grant(&self, role: &str, grant: &Grant) -> Result<()> {
        let resource_name = grant.resource.rsplit(':').next().unwrap_or(&grant.resource);
        let document = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": grant.action.actions(),
                "Resource": grant.resource,
            }],
        });
        self.iam
            .put_role_policy()
            .role_name(role)
            .policy_name(format!("{}-{:?}", resource_name, grant.action).to_lowercase())
            .policy_document(document.to_string())
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to put role policy: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ProvisioningBackend for AwsBackend {
    async fn create_topic(&self, name: &str) -> Result<TopicRef> {
        // Idempotent: returns the existing topic's ARN.
        let result = self
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to create SNS topic: {}", e)))?;

        let arn = result
            .topic_arn()
            .ok_or_else(|| {
                ProvisionError::Rejected("SNS create_topic returned no ARN".to_string())
            })?
            .to_string();

        info!(topic = %name, arn = %arn, "Created/found SNS topic");
        Ok(TopicRef {
            name: name.to_string(),
            arn,
        })
    }

    async fn create_queue(&self, spec: &QueueSpec) -> Result<QueueRef> {
        let attrs = Self::queue_attributes(spec);

        let existing = self
            .sqs
            .get_queue_url()
            .queue_name(&spec.name)
            .send()
            .await
            .ok()
            .and_then(|out| out.queue_url().map(str::to_string));

        let url = match existing {
            Some(url) => {
                warn!(queue = %spec.name, "Queue exists, reconciling attributes");
                self.sqs
                    .set_queue_attributes()
                    .queue_url(&url)
                    .set_attributes(Some(attrs))
                    .send()
                    .await
                    .map_err(|e| {
                        ProvisionError::Rejected(format!("Failed to update SQS queue: {}", e))
                    })?;
                url
            }
            None => {
                let result = self
                    .sqs
                    .create_queue()
                    .queue_name(&spec.name)
                    .set_attributes(Some(attrs))
                    .send()
                    .await
                    .map_err(|e| {
                        ProvisionError::Rejected(format!("Failed to create SQS queue: {}", e))
                    })?;
                result
                    .queue_url()
                    .ok_or_else(|| {
                        ProvisionError::Rejected("SQS create_queue returned no URL".to_string())
                    })?
                    .to_string()
            }
        };

        let arn = self.queue_arn(&url).await?;
        self.queue_urls.write().await.insert(arn.clone(), url.clone());

        info!(queue = %spec.name, url = %url, "Created/found SQS queue");
        Ok(QueueRef {
            name: spec.name.clone(),
            url,
            arn,
        })
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<SubscriptionRef> {
        // The topic must be able to deliver into the queue and the sink.
        self.set_queue_policy(
            &spec.queue.url,
            &spec.queue.arn,
            Self::topic_delivery_statement(&spec.topic.arn, &spec.queue.arn),
        )
        .await?;
        if let Some(sink) = &spec.failure_sink {
            self.set_queue_policy(
                &sink.url,
                &sink.arn,
                Self::topic_delivery_statement(&spec.topic.arn, &sink.arn),
            )
            .await?;
        }

        // Idempotent for an identical (topic, protocol, endpoint) triple.
        let result = self
            .sns
            .subscribe()
            .topic_arn(&spec.topic.arn)
            .protocol("sqs")
            .endpoint(&spec.queue.arn)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| {
                ProvisionError::Rejected(format!("Failed to subscribe queue to topic: {}", e))
            })?;

        let arn = result
            .subscription_arn()
            .ok_or_else(|| ProvisionError::Rejected("SNS subscribe returned no ARN".to_string()))?
            .to_string();

        let mut attributes = Vec::new();
        if let Some((policy, scope)) = spec.filter.to_policy() {
            attributes.push(("FilterPolicyScope", scope.as_policy_scope().to_string()));
            attributes.push(("FilterPolicy", policy.to_string()));
        }
        if let Some(sink) = &spec.failure_sink {
            attributes.push((
                "RedrivePolicy",
                json!({"deadLetterTargetArn": sink.arn}).to_string(),
            ));
        }
        for (name, value) in attributes {
            self.sns
                .set_subscription_attributes()
                .subscription_arn(&arn)
                .attribute_name(name)
                .attribute_value(value)
                .send()
                .await
                .map_err(|e| {
                    ProvisionError::Rejected(format!("Failed to set subscription {}: {}", name, e))
                })?;
        }

        debug!(
            topic_arn = %spec.topic.arn,
            queue_arn = %spec.queue.arn,
            subscription = %arn,
            "Subscribed queue to topic",
        );
        Ok(SubscriptionRef { arn })
    }

    async fn grant(&self, grant: &Grant) -> Result<()> {
        let principal = match &grant.principal {
            Principal::Service(service) => json!({"Service": service}),
            Principal::ConsumerRole(role) => {
                let arn = self.consumer_role_arn(role).await?;
                if self.config.consumer_role_arn.is_none() {
                    // Roles created here carry the grant as identity policy.
                    self.put_role_grant(role, grant).await?;
                    debug!(
                        resource = %grant.resource,
                        role = %role,
                        action = ?grant.action,
                        "Granted",
                    );
                    return Ok(());
                }
                json!({"AWS": arn})
            }
        };

        let statement = json!({
            "Effect": "Allow",
            "Principal": principal,
            "Action": grant.action.actions(),
            "Resource": grant.resource,
        });

        if grant.resource.starts_with("arn:aws:sns:") {
            self.set_topic_policy(&grant.resource, statement).await?;
        } else {
            let url = self
                .queue_urls
                .read()
                .await
                .get(&grant.resource)
                .cloned()
                .ok_or_else(|| ProvisionError::NotFound(grant.resource.clone()))?;
            self.set_queue_policy(&url, &grant.resource, statement).await?;
        }

        debug!(resource = %grant.resource, action = ?grant.action, "Granted");
        Ok(())
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerRef> {
        use aws_sdk_lambda::primitives::Blob;
        use aws_sdk_lambda::types::{Environment, FunctionCode, Runtime};

        let role = self.consumer_role_arn(&spec.role).await?;
        let mut runtime = self.config.consumer_runtime.clone();
        let mut handler = self.config.consumer_handler.clone();
        let mut memory = DEFAULT_MEMORY_MB;
        let mut timeout = DEFAULT_TIMEOUT_SECS;
        for (key, value) in &spec.overrides {
            match key.as_str() {
                "Runtime" => runtime = value.clone(),
                "Handler" => handler = value.clone(),
                "MemorySize" => {
                    memory = value.parse().map_err(|_| {
                        ProvisionError::Rejected(format!("Invalid MemorySize override: {}", value))
                    })?
                }
                "Timeout" => {
                    timeout = value.parse().map_err(|_| {
                        ProvisionError::Rejected(format!("Invalid Timeout override: {}", value))
                    })?
                }
                other => warn!(
                    consumer = %spec.name,
                    key = %other,
                    "Ignoring unknown consumer override",
                ),
            }
        }

        let environment = Environment::builder()
            .set_variables(Some(
                spec.environment
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
            .build();

        if let Ok(existing) = self
            .lambda
            .get_function()
            .function_name(&spec.name)
            .send()
            .await
        {
            let arn = existing
                .configuration()
                .and_then(|c| c.function_arn())
                .ok_or_else(|| {
                    ProvisionError::Rejected("get_function returned no ARN".to_string())
                })?
                .to_string();

            warn!(consumer = %spec.name, "Consumer exists, reconciling configuration");
            self.lambda
                .update_function_configuration()
                .function_name(&spec.name)
                .role(role)
                .runtime(Runtime::from(runtime.as_str()))
                .handler(handler)
                .memory_size(memory)
                .timeout(timeout)
                .environment(environment)
                .send()
                .await
                .map_err(|e| {
                    ProvisionError::Rejected(format!("Failed to update consumer: {}", e))
                })?;

            return Ok(ConsumerRef {
                name: spec.name.clone(),
                arn,
            });
        }

        let code = tokio::fs::read(spec.reference.as_str()).await?;

        let result = self
            .lambda
            .create_function()
            .function_name(&spec.name)
            .role(role)
            .runtime(Runtime::from(runtime.as_str()))
            .handler(handler)
            .memory_size(memory)
            .timeout(timeout)
            .environment(environment)
            .code(FunctionCode::builder().zip_file(Blob::new(code)).build())
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to create consumer: {}", e)))?;

        let arn = result
            .function_arn()
            .ok_or_else(|| ProvisionError::Rejected("create_function returned no ARN".to_string()))?
            .to_string();

        info!(consumer = %spec.name, arn = %arn, "Created consumer");
        Ok(ConsumerRef {
            name: spec.name.clone(),
            arn,
        })
    }

    async fn bind_event_source(&self, binding: &EventSourceBinding) -> Result<EventSourceRef> {
        use aws_sdk_lambda::types::FunctionResponseType;

        let batch_size = i32::try_from(binding.batch_size).map_err(|_| {
            ProvisionError::Rejected(format!("Invalid batch size: {}", binding.batch_size))
        })?;
        let window = i32::try_from(binding.batching_window.as_secs()).map_err(|_| {
            ProvisionError::Rejected(format!(
                "Invalid batching window: {:?}",
                binding.batching_window
            ))
        })?;
        let response_types = if binding.report_batch_item_failures {
            vec![FunctionResponseType::ReportBatchItemFailures]
        } else {
            Vec::new()
        };

        let mappings = self
            .lambda
            .list_event_source_mappings()
            .function_name(&binding.consumer.name)
            .event_source_arn(&binding.queue.arn)
            .send()
            .await
            .map_err(|e| {
                ProvisionError::Connection(format!("Failed to list event source mappings: {}", e))
            })?;

        if let Some(uuid) = mappings.event_source_mappings().iter().find_map(|m| m.uuid()) {
            self.lambda
                .update_event_source_mapping()
                .uuid(uuid)
                .batch_size(batch_size)
                .maximum_batching_window_in_seconds(window)
                .set_function_response_types(Some(response_types))
                .send()
                .await
                .map_err(|e| {
                    ProvisionError::Rejected(format!(
                        "Failed to update event source mapping: {}",
                        e
                    ))
                })?;
            return Ok(EventSourceRef {
                id: uuid.to_string(),
            });
        }

        let created = self
            .lambda
            .create_event_source_mapping()
            .function_name(&binding.consumer.name)
            .event_source_arn(&binding.queue.arn)
            .batch_size(batch_size)
            .maximum_batching_window_in_seconds(window)
            .set_function_response_types(Some(response_types))
            .enabled(true)
            .send()
            .await
            .map_err(|e| {
                ProvisionError::Rejected(format!("Failed to create event source mapping: {}", e))
            })?;

        let id = created
            .uuid()
            .ok_or_else(|| {
                ProvisionError::Rejected("create_event_source_mapping returned no id".to_string())
            })?
            .to_string();

        info!(
            consumer = %binding.consumer.name,
            queue = %binding.queue.name,
            id = %id,
            "Bound event source",
        );
        Ok(EventSourceRef { id })
    }

    async fn create_ingress_route(&self, route: &IngressRoute) -> Result<IngressRef> {
        use aws_sdk_apigateway::types::{Op, PatchOperation};

        let credentials = self.config.ingress_role_arn.clone().ok_or_else(|| {
            ProvisionError::Unsupported(
                "aws.ingress_role_arn is required for the ingress".to_string(),
            )
        })?;

        let api_id = self.rest_api_id(&route.api_name).await?;
        let resource_id = self.path_resource_id(&api_id, &route.path).await?;

        let put = self
            .apigateway
            .put_method()
            .rest_api_id(&api_id)
            .resource_id(&resource_id)
            .http_method(INGRESS_METHOD)
            .authorization_type("NONE")
            .api_key_required(route.api_key_required)
            .send()
            .await;
        if let Err(e) = put {
            let conflict = e
                .as_service_error()
                .map(|se| se.is_conflict_exception())
                .unwrap_or(false);
            if !conflict {
                return Err(ProvisionError::Rejected(format!("Failed to put method: {}", e)));
            }
            self.apigateway
                .update_method()
                .rest_api_id(&api_id)
                .resource_id(&resource_id)
                .http_method(INGRESS_METHOD)
                .patch_operations(
                    PatchOperation::builder()
                        .op(Op::Replace)
                        .path("/apiKeyRequired")
                        .value(route.api_key_required.to_string())
                        .build(),
                )
                .send()
                .await
                .map_err(|e| ProvisionError::Rejected(format!("Failed to update method: {}", e)))?;
        }

        self.apigateway
            .put_integration()
            .rest_api_id(&api_id)
            .resource_id(&resource_id)
            .http_method(INGRESS_METHOD)
            .r#type(IntegrationType::Aws)
            .integration_http_method(INGRESS_METHOD)
            .uri(format!("arn:aws:apigateway:{}:sns:action/Publish", self.region))
            .credentials(credentials)
            .request_parameters(
                "integration.request.header.Content-Type",
                format!("'{}'", FORM_CONTENT_TYPE),
            )
            .request_templates(JSON_CONTENT_TYPE, &route.request_template)
            .request_templates(FORM_CONTENT_TYPE, &route.request_template)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to put integration: {}", e)))?;

        for rule in &route.response_rules {
            let status = rule.status_code.to_string();
            let method_response = self
                .apigateway
                .put_method_response()
                .rest_api_id(&api_id)
                .resource_id(&resource_id)
                .http_method(INGRESS_METHOD)
                .status_code(&status)
                .send()
                .await;
            if let Err(e) = method_response {
                let conflict = e
                    .as_service_error()
                    .map(|se| se.is_conflict_exception())
                    .unwrap_or(false);
                if !conflict {
                    return Err(ProvisionError::Rejected(format!(
                        "Failed to put method response {}: {}",
                        status, e
                    )));
                }
            }

            self.apigateway
                .put_integration_response()
                .rest_api_id(&api_id)
                .resource_id(&resource_id)
                .http_method(INGRESS_METHOD)
                .status_code(&status)
                .set_selection_pattern(rule.selection_pattern.clone())
                .response_templates(JSON_CONTENT_TYPE, &rule.template)
                .send()
                .await
                .map_err(|e| {
                    ProvisionError::Rejected(format!(
                        "Failed to put integration response {}: {}",
                        status, e
                    ))
                })?;
        }

        if route.cors {
            self.put_cors_preflight(&api_id, &resource_id).await?;
        }

        self.apigateway
            .create_deployment()
            .rest_api_id(&api_id)
            .stage_name(&route.stage)
            .send()
            .await
            .map_err(|e| ProvisionError::Rejected(format!("Failed to deploy API: {}", e)))?;

        let endpoint = self.endpoint(&api_id, &route.stage, &route.path);
        info!(api = %route.api_name, endpoint = %endpoint, "Deployed ingress route");
        Ok(IngressRef {
            api_id,
            api_name: route.api_name.clone(),
            stage: route.stage.clone(),
            path: route.path.clone(),
            endpoint,
        })
    }

    async fn create_key_auth(&self, spec: &KeyAuthSpec) -> Result<KeyAuthRef> {
        use aws_sdk_apigateway::types::ApiStage;

        let keys = self
            .apigateway
            .get_api_keys()
            .name_query(&spec.key_name)
            .include_values(true)
            .send()
            .await
            .map_err(|e| ProvisionError::Connection(format!("Failed to list API keys: {}", e)))?;

        let (key_id, value) = match keys
            .items()
            .iter()
            .find(|k| k.name() == Some(spec.key_name.as_str()))
        {
            Some(key) => (
                key.id().map(str::to_string),
                key.value().map(str::to_string),
            ),
            None => {
                let created = self
                    .apigateway
                    .create_api_key()
                    .name(&spec.key_name)
                    .enabled(true)
                    .send()
                    .await
                    .map_err(|e| {
                        ProvisionError::Rejected(format!("Failed to create API key: {}", e))
                    })?;
                info!(key = %spec.key_name, "Created API key");
                (
                    created.id().map(str::to_string),
                    created.value().map(str::to_string),
                )
            }
        };
        let key_id = key_id
            .ok_or_else(|| ProvisionError::Rejected("API key has no id".to_string()))?;

        let plans = self
            .apigateway
            .get_usage_plans()
            .limit(LIST_LIMIT)
            .send()
            .await
            .map_err(|e| ProvisionError::Connection(format!("Failed to list usage plans: {}", e)))?;

        let existing_plan = plans
            .items()
            .iter()
            .find(|p| p.name() == Some(spec.usage_plan_name.as_str()))
            .and_then(|p| p.id())
            .map(str::to_string);

        let usage_plan_id = match existing_plan {
            Some(id) => id,
            None => {
                let created = self
                    .apigateway
                    .create_usage_plan()
                    .name(&spec.usage_plan_name)
                    .api_stages(
                        ApiStage::builder()
                            .api_id(&spec.ingress.api_id)
                            .stage(&spec.ingress.stage)
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        ProvisionError::Rejected(format!("Failed to create usage plan: {}", e))
                    })?;
                info!(usage_plan = %spec.usage_plan_name, "Created usage plan");
                created
                    .id()
                    .map(str::to_string)
                    .ok_or_else(|| ProvisionError::Rejected("Usage plan has no id".to_string()))?
            }
        };

        let bound = self
            .apigateway
            .create_usage_plan_key()
            .usage_plan_id(&usage_plan_id)
            .key_id(&key_id)
            .key_type("API_KEY")
            .send()
            .await;
        if let Err(e) = bound {
            let conflict = e
                .as_service_error()
                .map(|se| se.is_conflict_exception())
                .unwrap_or(false);
            if !conflict {
                return Err(ProvisionError::Rejected(format!(
                    "Failed to bind API key to usage plan: {}",
                    e
                )));
            }
        }

        Ok(KeyAuthRef {
            key_id,
            usage_plan_id,
            value,
        })
    }
}
