//! HTTP ingress contract.
//!
//! The gateway exposes `POST /<path>`, forwards the raw request body to the
//! topic as the message, and shapes the upstream publish response into one of
//! three outcome classes. The rules and templates here are handed to the
//! provisioning backend verbatim.

use serde::{Deserialize, Serialize};

/// The only method the ingress route accepts.
pub const INGRESS_METHOD: &str = "POST";

/// Message returned on a successful publish.
pub const ACCEPTED_MESSAGE: &str = "Message sent to SNS topic";
/// Message returned when the upstream rejects the request.
pub const INVALID_REQUEST_MESSAGE: &str = "Invalid request";
/// Message returned when the upstream fails.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Content type the templates are keyed under.
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of the upstream publish call.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Outcome class of an upstream publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    ClientError,
    ServerError,
}

impl OutcomeClass {
    /// Classify an upstream status code. Anything outside 4xx/5xx is success,
    /// matching how the default (pattern-less) response rule behaves.
    pub fn classify(status: u16) -> Self {
        match status {
            400..=499 => OutcomeClass::ClientError,
            500..=599 => OutcomeClass::ServerError,
            _ => OutcomeClass::Success,
        }
    }

    /// Status code returned to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            OutcomeClass::Success => 200,
            OutcomeClass::ClientError => 400,
            OutcomeClass::ServerError => 500,
        }
    }
}

/// One integration response rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Regex over the upstream status. `None` is the default rule.
    pub selection_pattern: Option<String>,
    pub status_code: u16,
    /// JSON mapping template for `application/json`.
    pub template: String,
}

impl ResponseRule {
    pub fn outcome(&self) -> OutcomeClass {
        match self.status_code {
            400 => OutcomeClass::ClientError,
            500 => OutcomeClass::ServerError,
            _ => OutcomeClass::Success,
        }
    }
}

/// The three rules every ingress route carries.
pub fn default_response_rules() -> Vec<ResponseRule> {
    vec![
        ResponseRule {
            selection_pattern: None,
            status_code: 200,
            template: accepted_template(),
        },
        ResponseRule {
            selection_pattern: Some(r"4\d{2}".to_string()),
            status_code: 400,
            template: rejected_template(INVALID_REQUEST_MESSAGE),
        },
        ResponseRule {
            selection_pattern: Some(r"5\d{2}".to_string()),
            status_code: 500,
            template: rejected_template(INTERNAL_ERROR_MESSAGE),
        },
    ]
}

fn accepted_template() -> String {
    serde_json::json!({
        "message": ACCEPTED_MESSAGE,
        "requestId": "$context.requestId",
    })
    .to_string()
}

fn rejected_template(message: &str) -> String {
    serde_json::json!({
        "message": message,
        "errorType": "$util.escapeJavaScript($input.path('$.errorType'))",
        "errorMessage": "$util.escapeJavaScript($input.path('$.errorMessage'))",
        "requestId": "$context.requestId",
    })
    .to_string()
}

/// Form-encoded request template that publishes the raw body to `topic_arn`.
pub fn publish_request_template(topic_arn: &str) -> String {
    format!(
        "Action=Publish&TopicArn=$util.urlEncode('{}')&Message=$util.urlEncode($input.body)",
        topic_arn
    )
}

/// Body returned on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressAccepted {
    pub message: String,
    pub request_id: String,
}

impl IngressAccepted {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            message: ACCEPTED_MESSAGE.to_string(),
            request_id: request_id.into(),
        }
    }
}

/// Body returned when the upstream reports a 4xx or 5xx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRejected {
    pub message: String,
    pub error_type: String,
    pub error_message: String,
    pub request_id: String,
}

impl IngressRejected {
    /// Shape an upstream error for `class`. Success has no rejected form and
    /// is reported as an internal error.
    pub fn new(
        class: OutcomeClass,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let message = match class {
            OutcomeClass::ClientError => INVALID_REQUEST_MESSAGE,
            OutcomeClass::Success | OutcomeClass::ServerError => INTERNAL_ERROR_MESSAGE,
        };
        Self {
            message: message.to_string(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            request_id: request_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(OutcomeClass::classify(200), OutcomeClass::Success);
        assert_eq!(OutcomeClass::classify(403), OutcomeClass::ClientError);
        assert_eq!(OutcomeClass::classify(503), OutcomeClass::ServerError);
        assert_eq!(OutcomeClass::classify(403).status_code(), 400);
    }

    #[test]
    fn test_default_rules() {
        let rules = default_response_rules();
        assert_eq!(rules.len(), 3);
        assert!(rules[0].selection_pattern.is_none());
        assert_eq!(rules[1].selection_pattern.as_deref(), Some(r"4\d{2}"));
        assert_eq!(rules[2].outcome(), OutcomeClass::ServerError);

        let rejected: serde_json::Value = serde_json::from_str(&rules[1].template).unwrap();
        assert_eq!(rejected["message"], INVALID_REQUEST_MESSAGE);
        assert!(rejected.get("errorType").is_some());
        assert!(rejected.get("errorMessage").is_some());
    }

    #[test]
    fn test_request_template_embeds_topic() {
        let template = publish_request_template("arn:aws:sns:us-east-1:000000000000:t");
        assert!(template.starts_with("Action=Publish&"));
        assert!(template.contains("'arn:aws:sns:us-east-1:000000000000:t'"));
        assert!(template.ends_with("$util.urlEncode($input.body)"));
    }

    #[test]
    fn test_bodies_serialize_camel_case() {
        let accepted = serde_json::to_value(IngressAccepted::new("r-1")).unwrap();
        assert_eq!(
            accepted,
            serde_json::json!({"message": ACCEPTED_MESSAGE, "requestId": "r-1"})
        );

        let rejected = serde_json::to_value(IngressRejected::new(
            OutcomeClass::ServerError,
            "InternalFailure",
            "boom",
            "r-2",
        ))
        .unwrap();
        assert_eq!(rejected["message"], INTERNAL_ERROR_MESSAGE);
        assert_eq!(rejected["errorType"], "InternalFailure");
        assert_eq!(rejected["requestId"], "r-2");
    }
}
