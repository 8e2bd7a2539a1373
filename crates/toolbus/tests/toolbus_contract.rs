//! Contract tests for the tool bus, exercised through the public API only.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use futures::stream;
use serde_json::json;
use stagehand_toolbus::{
    HandlerError, InvokeRequest, Reply, StatusCode, StreamChunk, StreamRequest,
    SubscribeRequest, ToolBus, ToolEndpoint, invoke_fn, stream_fn, sync_invoke_fn,
};

#[tokio::test]
async fn given_unregistered_tool_when_invoked_then_not_found() {
    // GIVEN: an empty bus
    let bus = ToolBus::new();

    // WHEN: a caller invokes a tool nobody registered
    let response = bus.invoke(InvokeRequest::new("ghost", json!({}))).await;

    // THEN: the call resolves with NOT_FOUND instead of failing
    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(response.status.code(), 2);
}

#[tokio::test]
async fn given_guarded_handler_when_invoked_then_guard_message_is_returned() {
    // GIVEN: a handler that validates its JSON input
    let bus = ToolBus::new();
    bus.register_local(
        "strict",
        [sync_invoke_fn(|_, payload| {
            let value: serde_json::Value = serde_json::from_slice(&payload)?;
            Ok(Reply::ok(value))
        })],
    )
    .unwrap();

    // WHEN: it receives garbage
    let response = bus.invoke(InvokeRequest::new("strict", "{not json")).await;

    // THEN: the rejection carries the guard's message
    assert_eq!(response.status, StatusCode::GuardRejected);
    assert!(response.error.unwrap().starts_with("invalid JSON payload"));
}

#[tokio::test]
async fn given_handler_returning_status_pair_when_invoked_then_status_is_kept() {
    // GIVEN: a handler that signals temporary unavailability
    let bus = ToolBus::new();
    bus.register_local(
        "busy",
        [invoke_fn(|_, _| async { Ok(Reply::from(("retry later", StatusCode::Unavailable))) })],
    )
    .unwrap();

    // WHEN
    let response = bus.invoke(InvokeRequest::new("busy", "")).await;

    // THEN
    assert_eq!(response.status, StatusCode::Unavailable);
    assert_eq!(response.text(), "retry later");
}

#[tokio::test]
async fn given_counting_stream_when_collected_then_chunks_arrive_in_order_with_terminator() {
    // GIVEN: a stream endpoint yielding 1 and 2
    let bus = ToolBus::new();
    bus.register_local(
        "numbers",
        [stream_fn(|_, _| {
            Ok(stream::iter([1, 2]).map(|n| Ok(Reply::ok(json!(n)))).boxed())
        })],
    )
    .unwrap();

    // WHEN: the caller drains it
    let chunks: Vec<StreamChunk> = bus
        .stream(StreamRequest::new("numbers", ""))
        .collect()
        .await;

    // THEN: [1, 2, <end_of_stream, OK>]
    let texts: Vec<String> = chunks.iter().map(StreamChunk::text).collect();
    assert_eq!(texts, vec!["1".to_string(), "2".to_string(), String::new()]);
    let last = chunks.last().unwrap();
    assert!(last.end_of_stream);
    assert_eq!(last.status, StatusCode::Ok);
    assert!(chunks.iter().all(|c| c.request_id == last.request_id));
}

#[tokio::test]
async fn given_stream_that_refuses_to_open_when_collected_then_single_error_chunk() {
    // GIVEN
    let bus = ToolBus::new();
    bus.register_local("closed", [stream_fn(|_, _| Err(HandlerError::failed("offline")))])
        .unwrap();

    // WHEN
    let chunks: Vec<StreamChunk> = bus.stream(StreamRequest::new("closed", "")).collect().await;

    // THEN
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].status, StatusCode::Error);
    assert_eq!(chunks[0].error.as_deref(), Some("offline"));
}

#[tokio::test]
async fn given_subscription_before_publish_when_closed_later_then_only_earlier_events_arrive() {
    // GIVEN: one subscription opened before publishing
    let bus = ToolBus::new();
    let mut early = bus
        .subscribe(SubscribeRequest::new("setup").with_topics(["topic"]))
        .await;

    // WHEN: an event is published, the subscription closes, a second one
    // opens, closes, and another event is published
    bus.publish("topic", "first", BTreeMap::new(), Some("r-1".to_string()));
    early.close();
    let mut late = bus
        .subscribe(SubscribeRequest::new("setup").with_topics(["topic"]))
        .await;
    late.close();
    let reached = bus.publish("topic", "second", BTreeMap::new(), None);

    // THEN: the early subscription still drains what it buffered, and nothing
    // reaches either subscription after close
    let event = early.next().await.unwrap();
    assert_eq!(event.payload, b"first".to_vec());
    assert_eq!(event.request_id, "r-1");
    assert!(early.next().await.is_none());
    assert!(late.next().await.is_none());
    assert_eq!(reached, 0);
}

#[tokio::test]
async fn given_two_subscribers_when_published_then_both_receive() {
    // GIVEN
    let bus = ToolBus::new();
    let mut a = bus.subscribe(SubscribeRequest::new("news")).await;
    let mut b = bus.subscribe(SubscribeRequest::new("news")).await;

    // WHEN
    let reached = bus.publish("news", json!({"headline": "ok"}), BTreeMap::new(), None);

    // THEN
    assert_eq!(reached, 2);
    assert_eq!(a.next().await.unwrap().json().unwrap()["headline"], "ok");
    assert_eq!(b.next().await.unwrap().json().unwrap()["headline"], "ok");
}

#[tokio::test]
async fn given_unregistered_endpoint_when_invoked_again_then_not_found() {
    // GIVEN: a registered endpoint that counts calls
    let bus = ToolBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    bus.register_endpoint(ToolEndpoint::new("count").with_handler(sync_invoke_fn(
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Reply::ok(""))
        },
    )))
    .unwrap();
    bus.invoke(InvokeRequest::new("count", "")).await;

    // WHEN
    assert!(bus.unregister("count"));
    let response = bus.invoke(InvokeRequest::new("count", "")).await;

    // THEN
    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
