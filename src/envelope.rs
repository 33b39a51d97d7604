//! Consumer-side message contract.
//!
//! A message delivered to a consumer is wrapped twice: the queue event
//! carries records whose `body` is a broker envelope, and the envelope's
//! `Message` field holds the payload exactly as it was published.
//!
//! Decoding is lenient per record. A record without a body, or whose body or
//! inner message does not parse, is dropped and logged at debug level; the
//! batch as a whole never fails. Callers that care compare counts.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Broker envelope `Type` for an ordinary publish.
pub const NOTIFICATION_TYPE: &str = "Notification";

/// Batch of queue records handed to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueRecord>,
}

/// One queue record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub message_attributes: HashMap<String, QueueMessageAttribute>,
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessageAttribute {
    pub data_type: String,
    #[serde(default)]
    pub string_value: Option<String>,
}

/// Broker-level wrapper around a published payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrokerEnvelope {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub topic_arn: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub message_attributes: HashMap<String, BrokerAttribute>,
}

impl BrokerEnvelope {
    /// Wrap `message` as a notification from `topic_arn`.
    pub fn notification(
        topic_arn: impl Into<String>,
        message_id: impl Into<String>,
        message: impl Into<String>,
        attributes: &HashMap<String, String>,
    ) -> Self {
        Self {
            kind: NOTIFICATION_TYPE.to_string(),
            message_id: message_id.into(),
            topic_arn: topic_arn.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            message_attributes: attributes
                .iter()
                .map(|(k, v)| (k.clone(), BrokerAttribute::string(v)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAttribute {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl BrokerAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            kind: "String".to_string(),
            value: value.into(),
        }
    }
}

/// A decoded record: delivery id plus the original payload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage<T> {
    pub message_id: String,
    pub body: T,
}

/// Unwrap one record. `None` if the body is absent or either layer fails to
/// parse.
pub fn decode_record<T: DeserializeOwned>(record: &QueueRecord) -> Option<QueueMessage<T>> {
    let Some(raw) = record.body.as_deref().filter(|b| !b.is_empty()) else {
        debug!(message_id = %record.message_id, "Dropping record without body");
        return None;
    };

    let envelope: BrokerEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(
                message_id = %record.message_id,
                error = %e,
                "Dropping record with unparsable envelope",
            );
            return None;
        }
    };

    match serde_json::from_str(&envelope.message) {
        Ok(body) => Some(QueueMessage {
            message_id: record.message_id.clone(),
            body,
        }),
        Err(e) => {
            debug!(
                message_id = %record.message_id,
                error = %e,
                "Dropping record with unparsable message",
            );
            None
        }
    }
}

/// Unwrap every decodable record, preserving order.
pub fn decode_records<T: DeserializeOwned>(records: &[QueueRecord]) -> Vec<QueueMessage<T>> {
    records.iter().filter_map(decode_record).collect()
}

/// Response a consumer returns to report partial batch failures.
///
/// Only the listed records are retried; the rest of the batch is
/// acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    pub fn from_failed<I, S>(message_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            batch_item_failures: message_ids
                .into_iter()
                .map(|id| BatchItemFailure {
                    item_identifier: id.into(),
                })
                .collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.batch_item_failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, body: Option<&str>) -> QueueRecord {
        QueueRecord {
            message_id: id.to_string(),
            body: body.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_wrapped_message() {
        let rec = record("m-1", Some(r#"{"Message": "{\"message\":\"fakeMessage1\"}"}"#));
        let decoded: QueueMessage<serde_json::Value> = decode_record(&rec).unwrap();
        assert_eq!(decoded.message_id, "m-1");
        assert_eq!(decoded.body, serde_json::json!({"message": "fakeMessage1"}));
    }

    #[test]
    fn test_malformed_records_are_dropped() {
        let records = vec![
            record("ok", Some(r#"{"Message": "{\"n\":1}"}"#)),
            record("absent", None),
            record("empty", Some("")),
            record("not-json", Some("garbage")),
            record("no-message", Some(r#"{"Type":"Notification"}"#)),
            record("bad-inner", Some(r#"{"Message": "not json"}"#)),
        ];
        let decoded: Vec<QueueMessage<serde_json::Value>> = decode_records(&records);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message_id, "ok");
    }

    #[test]
    fn test_typed_decode() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Order {
            id: u32,
        }

        let rec = record("m", Some(r#"{"Message": "{\"id\":7}"}"#));
        let decoded: QueueMessage<Order> = decode_record(&rec).unwrap();
        assert_eq!(decoded.body, Order { id: 7 });

        let wrong = record("m", Some(r#"{"Message": "{\"id\":\"x\"}"}"#));
        assert!(decode_record::<Order>(&wrong).is_none());
    }

    #[test]
    fn test_queue_event_wire_names() {
        let event: QueueEvent = serde_json::from_str(
            r#"{"Records":[{
                "messageId":"1",
                "receiptHandle":"h",
                "body":"{}",
                "eventSourceARN":"arn:q",
                "messageAttributes":{"eventType":{"dataType":"String","stringValue":"send"}}
            }]}"#,
        )
        .unwrap();
        let rec = &event.records[0];
        assert_eq!(rec.event_source_arn, "arn:q");
        assert_eq!(
            rec.message_attributes["eventType"].string_value.as_deref(),
            Some("send")
        );
    }

    #[test]
    fn test_notification_envelope() {
        let mut attrs = HashMap::new();
        attrs.insert("eventType".to_string(), "send".to_string());
        let env = BrokerEnvelope::notification("arn:t", "id-1", r#"{"a":1}"#, &attrs);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["Type"], NOTIFICATION_TYPE);
        assert_eq!(json["TopicArn"], "arn:t");
        assert_eq!(json["MessageAttributes"]["eventType"]["Value"], "send");
    }

    #[test]
    fn test_batch_response() {
        let resp = BatchResponse::from_failed(["a", "b"]);
        assert!(!resp.is_success());
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            serde_json::json!({
                "batchItemFailures": [{"itemIdentifier": "a"}, {"itemIdentifier": "b"}]
            })
        );
        assert!(BatchResponse::default().is_success());
    }
}
