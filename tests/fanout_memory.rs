//! End-to-end fan-out against the in-memory backend.
//!
//! Run with: cargo test --test fanout_memory -- --nocapture
//!
//! Builds real topologies, publishes through the topic and the ingress, and
//! checks what each route's queue ends up holding.

use std::collections::HashMap;
use std::time::Duration;

use fanout::builder::{BuildStep, TopologyBuilder, TopologyHandles};
use fanout::envelope::{decode_records, BatchResponse, QueueEvent, QueueMessage};
use fanout::provisioning::memory::{CallKind, InMemoryBackend};
use fanout::spec::{MessageFilter, RouteProps, RouteSpec, TopologyProps, TopologySpec};

fn send_receive_spec() -> TopologySpec {
    let send = RouteSpec::new(
        RouteProps::new("send-event", "consumers/send-event.zip")
            .with_filter(MessageFilter::allowlist("eventType", ["send"]))
            .with_env("QUEUE_ROLE", "send"),
    )
    .unwrap();
    let receive = RouteSpec::new(
        RouteProps::new("receive-event", "consumers/receive-event.zip")
            .with_filter(MessageFilter::allowlist("eventType", ["receive"]))
            .with_max_batch_size(100)
            .with_max_batching_window(Duration::from_secs(5))
            .with_visibility_timeout(Duration::from_secs(60)),
    )
    .unwrap();

    TopologySpec::new(TopologyProps::new("test", "us-east-1").with_routes([send, receive])).unwrap()
}

async fn build(spec: &TopologySpec) -> (InMemoryBackend, TopologyHandles) {
    let backend = InMemoryBackend::new(spec.region());
    let handles = TopologyBuilder::new("fanout")
        .unwrap()
        .build(spec, &backend)
        .await
        .unwrap();
    (backend, handles)
}

fn event_type(value: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    attrs.insert("eventType".to_string(), value.to_string());
    attrs
}

#[tokio::test]
async fn test_send_event_reaches_only_send_queue() {
    println!("=== Fan-out: send event ===");

    let (backend, handles) = build(&send_receive_spec()).await;
    let send_queue = &handles.queue("send-event").unwrap().name;
    let receive_queue = &handles.queue("receive-event").unwrap().name;
    assert_ne!(send_queue, receive_queue);

    backend
        .publish(
            &handles.topic.name,
            r#"{"message":"fakeMessage1"}"#,
            &event_type("send"),
        )
        .await
        .unwrap();

    assert_eq!(backend.message_count(send_queue).await.unwrap(), 1);
    assert_eq!(backend.message_count(receive_queue).await.unwrap(), 0);

    backend.purge(send_queue).await.unwrap();
    backend.purge(receive_queue).await.unwrap();

    assert_eq!(backend.message_count(send_queue).await.unwrap(), 0);
    assert_eq!(backend.message_count(receive_queue).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unmatched_event_reaches_no_queue() {
    let (backend, handles) = build(&send_receive_spec()).await;

    backend
        .publish(&handles.topic.name, "{}", &event_type("archive"))
        .await
        .unwrap();
    backend
        .publish(&handles.topic.name, "{}", &HashMap::new())
        .await
        .unwrap();

    for route in &handles.routes {
        assert_eq!(backend.message_count(&route.queue.name).await.unwrap(), 0);
    }
    assert_eq!(
        backend
            .message_count(&handles.delivery_failures.name)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_consumer_unwraps_envelope() {
    let (backend, handles) = build(&send_receive_spec()).await;
    let queue = &handles.queue("receive-event").unwrap().name;

    for i in 0..3 {
        backend
            .publish(
                &handles.topic.name,
                &format!(r#"{{"message":"fakeMessage{}"}}"#, i),
                &event_type("receive"),
            )
            .await
            .unwrap();
    }

    // What the consumer would be invoked with.
    let event = QueueEvent {
        records: backend.receive(queue, 10).await.unwrap(),
    };
    let wire = serde_json::to_string(&event).unwrap();
    let event: QueueEvent = serde_json::from_str(&wire).unwrap();

    let messages: Vec<QueueMessage<serde_json::Value>> = decode_records(&event.records);
    let bodies: Vec<&str> = messages
        .iter()
        .map(|m| m.body["message"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, ["fakeMessage0", "fakeMessage1", "fakeMessage2"]);
    assert!(event
        .records
        .iter()
        .all(|r| r.event_source_arn == handles.queue("receive-event").unwrap().arn));
}

#[tokio::test]
async fn test_partial_batch_failure_redrives_only_failed_records() {
    let (backend, handles) = build(&send_receive_spec()).await;
    let route = handles.route("send-event").unwrap();
    let queue = &route.queue.name;

    for i in 0..2 {
        backend
            .publish(
                &handles.topic.name,
                &format!(r#"{{"n":{}}}"#, i),
                &event_type("send"),
            )
            .await
            .unwrap();
    }

    let mut failing = None;
    for _ in 0..3 {
        let records = backend.receive(queue, 10).await.unwrap();
        let messages: Vec<QueueMessage<serde_json::Value>> = decode_records(&records);

        // The consumer fails n == 1 and acknowledges the rest.
        let failed: Vec<&str> = messages
            .iter()
            .filter(|m| m.body["n"] == 1)
            .map(|m| m.message_id.as_str())
            .collect();
        let response = BatchResponse::from_failed(failed.iter().copied());
        assert_eq!(response.batch_item_failures.len(), 1);
        failing = Some(response.batch_item_failures[0].item_identifier.clone());

        for record in &records {
            let is_failed = response
                .batch_item_failures
                .iter()
                .any(|f| f.item_identifier == record.message_id);
            if !is_failed {
                backend
                    .delete_message(queue, &record.receipt_handle)
                    .await
                    .unwrap();
            }
        }
        backend.expire_in_flight(queue).await.unwrap();
    }

    // Fourth receive finds the message exhausted and redrives it.
    assert!(backend.receive(queue, 10).await.unwrap().is_empty());
    let dead = backend.receive(&route.dead_letter_queue.name, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(Some(dead[0].message_id.clone()), failing);
}

#[tokio::test]
async fn test_delivery_failure_goes_to_shared_queue() {
    let (backend, handles) = build(&send_receive_spec()).await;
    let queue = &handles.queue("send-event").unwrap().name;

    backend.set_reachable(queue, false).await.unwrap();
    backend
        .publish(&handles.topic.name, "{}", &event_type("send"))
        .await
        .unwrap();

    assert_eq!(backend.message_count(queue).await.unwrap(), 0);
    assert_eq!(
        backend
            .message_count(&handles.delivery_failures.name)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_ingress_requires_key() {
    let body_route = RouteSpec::new(
        RouteProps::new("orders", "consumers/orders.zip")
            .with_filter(MessageFilter::body_allowlist("eventType", ["order"])),
    )
    .unwrap();
    let spec = TopologySpec::new(TopologyProps::new("test", "us-east-1").with_route(body_route))
        .unwrap();
    let (backend, handles) = build(&spec).await;

    let ingress = handles.ingress.as_ref().unwrap();
    assert!(ingress.route.endpoint.ends_with("/test/send-event"));
    let key = ingress.key_auth.as_ref().unwrap().value.clone().unwrap();

    let body = r#"{"eventType":"order","id":42}"#;

    let rejected = backend.invoke_ingress("send-event", body, None).await;
    assert_eq!(rejected.status, 403);
    let wrong = backend
        .invoke_ingress("send-event", body, Some("not-the-key"))
        .await;
    assert_eq!(wrong.status, 403);
    assert_eq!(backend.message_count(&handles.routes[0].queue.name).await.unwrap(), 0);

    let accepted = backend.invoke_ingress("send-event", body, Some(&key)).await;
    assert_eq!(accepted.status, 200);
    assert_eq!(accepted.body["message"], "Message sent to SNS topic");
    assert!(accepted.body["requestId"].is_string());
    assert_eq!(backend.message_count(&handles.routes[0].queue.name).await.unwrap(), 1);
}

#[tokio::test]
async fn test_ingress_without_key_auth() {
    let spec = TopologySpec::new(
        TopologyProps::new("test", "us-east-1")
            .with_gateway_key_auth(false)
            .with_gateway_path("events"),
    )
    .unwrap();
    let (backend, handles) = build(&spec).await;

    assert!(handles.ingress.as_ref().unwrap().key_auth.is_none());
    let response = backend.invoke_ingress("events", "{}", None).await;
    assert_eq!(response.status, 200);
    assert_eq!(backend.invoke_ingress("send-event", "{}", None).await.status, 403);
}

#[tokio::test]
async fn test_ingress_preflight_allows_any_origin() {
    let (backend, _) = build(&send_receive_spec()).await;

    // Preflight carries no key, and is answered anyway.
    let headers = backend.preflight_ingress("send-event").await.unwrap();
    assert_eq!(headers["Access-Control-Allow-Origin"], "*");
    let methods: Vec<&str> = headers["Access-Control-Allow-Methods"].split(',').collect();
    assert!(methods.contains(&"POST"));
    assert!(methods.contains(&"OPTIONS"));
    assert!(headers["Access-Control-Allow-Headers"].contains("X-Api-Key"));

    assert!(backend.preflight_ingress("elsewhere").await.is_none());
}

#[tokio::test]
async fn test_redeploy_is_idempotent_and_keeps_messages() {
    let spec = send_receive_spec();
    let (backend, first) = build(&spec).await;
    backend
        .publish(&first.topic.name, "{}", &event_type("send"))
        .await
        .unwrap();

    let second = TopologyBuilder::new("fanout")
        .unwrap()
        .build(&spec, &backend)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(
        backend
            .message_count(&second.queue("send-event").unwrap().name)
            .await
            .unwrap(),
        1
    );
    let plan = backend.snapshot().await;
    assert_eq!(plan.topics.len(), 1);
    assert_eq!(plan.subscriptions.len(), 2);
    assert_eq!(plan.consumers.len(), 2);
}

#[tokio::test]
async fn test_failed_build_converges_on_rerun() {
    let spec = send_receive_spec();
    let backend = InMemoryBackend::new(spec.region());
    let builder = TopologyBuilder::new("fanout").unwrap();

    backend
        .set_fail_on(CallKind::CreateConsumer, "test-fanout-receive-event-consumer")
        .await;
    let err = builder.build(&spec, &backend).await.unwrap_err();
    assert_eq!(err.code(), "PROVISIONING_FAILURE");
    assert_eq!(err.step(), Some(BuildStep::Consumer));
    assert_eq!(err.route(), Some("receive-event"));

    backend.clear_failures().await;
    let handles = builder.build(&spec, &backend).await.unwrap();
    assert!(handles.consumer("receive-event").is_some());
    assert_eq!(backend.snapshot().await.event_sources.len(), 2);
}

#[tokio::test]
async fn test_plan_carries_route_parameters() {
    let (backend, _) = build(&send_receive_spec()).await;
    let plan = backend.snapshot().await;

    let receive = plan
        .event_sources
        .iter()
        .find(|e| e.queue == "test-fanout-receive-event-queue")
        .unwrap();
    assert_eq!(receive.batch_size, 100);
    assert_eq!(receive.batching_window_secs, 5);

    let queue = plan
        .queues
        .iter()
        .find(|q| q.name == "test-fanout-receive-event-queue")
        .unwrap();
    assert_eq!(queue.visibility_timeout_secs, 60);

    let consumer = plan
        .consumers
        .iter()
        .find(|c| c.name == "test-fanout-send-event-consumer")
        .unwrap();
    assert_eq!(consumer.environment["QUEUE_ROLE"], "send");
    assert_eq!(consumer.reference, "consumers/send-event.zip");

    let yaml = serde_yaml::to_string(&plan).unwrap();
    assert!(yaml.contains("test-fanout-topic"));
}
