//! Tool bus for invoke, stream and subscribe routing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

use crate::endpoint::{InvocationContext, ReplyStream, ToolEndpoint, ToolHandler};
use crate::error::{Error, HandlerError, Result};
use crate::subscription::{Subscription, SubscriptionCloser, TopicRegistry};
use crate::trace::TraceContext;
use crate::wire::{
    Event, Header, InvokeRequest, InvokeResponse, PayloadValue, StatusCode, StreamChunk,
    StreamRequest, SubscribeRequest,
};

/// Source tag for endpoints registered in-process.
pub const LOCAL_SOURCE: &str = "local";

fn not_registered(tool: &str) -> String {
    format!("Tool '{tool}' is not registered")
}

fn handler_status(err: &HandlerError) -> StatusCode {
    if err.is_guard() {
        StatusCode::GuardRejected
    } else {
        StatusCode::Error
    }
}

/// Worker-scoped source tag.
#[must_use]
pub fn worker_source(worker_id: &str) -> String {
    format!("worker:{worker_id}")
}

/// In-process async router.
///
/// Endpoints are addressed by unique name. Subscriptions to endpoints without a
/// subscribe handler (or to no endpoint at all) fall back to the local topic
/// registry fed by [`ToolBus::publish`].
pub struct ToolBus {
    endpoints: RwLock<HashMap<String, Arc<ToolEndpoint>>>,
    topics: Arc<TopicRegistry>,
    next_subscription: AtomicU64,
}

impl Default for ToolBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            topics: Arc::new(TopicRegistry::default()),
            next_subscription: AtomicU64::new(1),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register an endpoint under its unique name.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEndpoint` if the name is taken and `EmptyEndpoint` if
    /// it declares no handler.
    pub fn register_endpoint(&self, endpoint: ToolEndpoint) -> Result<()> {
        if endpoint.modes().is_empty() {
            return Err(Error::empty_endpoint(endpoint.name));
        }
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&endpoint.name) {
            return Err(Error::duplicate_endpoint(endpoint.name));
        }
        debug!(tool = %endpoint.name, source = %endpoint.source, modes = ?endpoint.modes(), "Registered tool endpoint");
        endpoints.insert(endpoint.name.clone(), Arc::new(endpoint));
        Ok(())
    }

    /// Register an in-process endpoint from its handlers.
    ///
    /// # Errors
    ///
    /// See [`ToolBus::register_endpoint`].
    pub fn register_local<I>(&self, name: impl Into<String>, handlers: I) -> Result<()>
    where
        I: IntoIterator<Item = ToolHandler>,
    {
        let endpoint = handlers
            .into_iter()
            .fold(ToolEndpoint::new(name).with_source(LOCAL_SOURCE), |ep, h| {
                ep.with_handler(h)
            });
        self.register_endpoint(endpoint)
    }

    /// Register every endpoint a worker exposes, tagging unset sources with
    /// `worker:<id>`. All or nothing: on failure the ones already added are
    /// removed again.
    ///
    /// # Errors
    ///
    /// Returns the first registration error.
    pub fn register_worker<I>(&self, worker_id: &str, endpoints: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = ToolEndpoint>,
    {
        let mut registered = Vec::new();
        for mut endpoint in endpoints {
            if endpoint.source.is_empty() {
                endpoint.source = worker_source(worker_id);
            }
            let name = endpoint.name.clone();
            if let Err(err) = self.register_endpoint(endpoint) {
                registered.iter().for_each(|n: &String| {
                    self.unregister(n);
                });
                return Err(err);
            }
            registered.push(name);
        }
        Ok(registered)
    }

    /// Remove an endpoint. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<Arc<ToolEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered endpoint names, sorted.
    #[must_use]
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Perform a single request/response call.
    pub async fn invoke(&self, request: InvokeRequest) -> InvokeResponse {
        let InvokeRequest { header, payload } = request;
        let endpoint = self.endpoint(&header.tool);
        let ctx = prepare(header, endpoint.as_deref());
        let span = info_span!(
            "toolbus.invoke",
            tool = %ctx.tool,
            request_id = %ctx.request_id,
            source = %ctx.source,
            trace_id = %ctx.trace.trace_id(),
        );

        async move {
            let request_id = ctx.request_id.clone();
            let Some(handler) = endpoint.and_then(|ep| ep.invoke.clone()) else {
                debug!("Invoke target not found");
                return InvokeResponse {
                    request_id,
                    status: StatusCode::NotFound,
                    payload: Vec::new(),
                    error: Some(not_registered(&ctx.tool)),
                };
            };
            match handler.invoke(ctx, payload).await {
                Ok(reply) => reply.into_response(&request_id),
                Err(err) => {
                    if !err.is_guard() {
                        error!(error = %err, "Tool handler failed");
                    }
                    InvokeResponse {
                        request_id,
                        status: handler_status(&err),
                        payload: Vec::new(),
                        error: Some(err.to_string()),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Open a streaming call. The returned stream always ends with exactly one
    /// chunk whose `end_of_stream` is set.
    pub fn stream(&self, request: StreamRequest) -> BoxStream<'static, StreamChunk> {
        let StreamRequest { header, payload } = request;
        let endpoint = self.endpoint(&header.tool);
        let ctx = prepare(header, endpoint.as_deref());
        let span = info_span!(
            "toolbus.stream",
            tool = %ctx.tool,
            request_id = %ctx.request_id,
            source = %ctx.source,
            trace_id = %ctx.trace.trace_id(),
        );
        let request_id = ctx.request_id.clone();

        let Some(handler) = endpoint.and_then(|ep| ep.stream.clone()) else {
            span.in_scope(|| debug!("Stream target not found"));
            let chunk =
                StreamChunk::failure(request_id, StatusCode::NotFound, not_registered(&ctx.tool));
            return stream::iter([chunk]).boxed();
        };

        let opening = {
            let span = span.clone();
            async move { handler.stream(ctx, payload).await }.instrument(span)
        };
        stream::once(opening)
            .flat_map(move |opened| match opened {
                Ok(inner) => forward_chunks(inner, request_id.clone(), span.clone()),
                Err(err) => {
                    span.in_scope(|| log_handler_error(&err));
                    stream::iter([StreamChunk::failure(
                        request_id.clone(),
                        handler_status(&err),
                        err.to_string(),
                    )])
                    .boxed()
                }
            })
            .boxed()
    }

    /// Open a live event feed.
    ///
    /// Endpoints with a subscribe handler are served by a forwarding task;
    /// everything else is answered from the local topic registry.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Subscription {
        let SubscribeRequest { header, topics } = request;
        let endpoint = self.endpoint(&header.tool);
        let topics = if topics.is_empty() {
            vec![header.tool.clone()]
        } else {
            topics
        };
        let ctx = prepare(header, endpoint.as_deref());
        let span = info_span!(
            "toolbus.subscribe",
            tool = %ctx.tool,
            request_id = %ctx.request_id,
            source = %ctx.source,
            trace_id = %ctx.trace.trace_id(),
        );
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        match endpoint.and_then(|ep| ep.subscribe.clone()) {
            Some(handler) => {
                let request_id = ctx.request_id.clone();
                let default_topic = topics.first().cloned().unwrap_or_default();
                let opened = handler
                    .subscribe(ctx, topics.clone())
                    .instrument(span.clone())
                    .await;
                match opened {
                    Ok(events) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let closer = SubscriptionCloser::delegated(id);
                        let task = tokio::spawn(
                            forward_events(events, tx, request_id, default_topic).instrument(span),
                        );
                        closer.attach_task(task.abort_handle());
                        Subscription::new(rx, closer, topics)
                    }
                    Err(err) => {
                        span.in_scope(|| log_handler_error(&err));
                        Subscription::failed(topics, handler_status(&err), err.to_string())
                    }
                }
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut registry = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
                    for topic in &topics {
                        registry.entry(topic.clone()).or_default().push((id, tx.clone()));
                    }
                }
                span.in_scope(|| debug!(topics = ?topics, "Local subscription registered"));
                let closer = SubscriptionCloser::local(id, topics.clone(), &self.topics);
                Subscription::new(rx, closer, topics)
            }
        }
    }

    /// Fan an event out to every local subscription on `topic`. Returns the
    /// number of subscriptions reached.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<PayloadValue>,
        metadata: BTreeMap<String, String>,
        request_id: Option<String>,
    ) -> usize {
        let event = Event {
            topic: topic.to_string(),
            payload: payload.into().encode(),
            metadata,
            request_id: request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };
        let mut registry = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = registry.get_mut(topic) else {
            return 0;
        };
        senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            registry.remove(topic);
        }
        delivered
    }

    /// Number of live local subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// Fill in the request id and propagate the trace context.
fn prepare(mut header: Header, endpoint: Option<&ToolEndpoint>) -> InvocationContext {
    if header.request_id.is_empty() {
        header.request_id = Uuid::new_v4().to_string();
    }
    let trace = TraceContext::propagate(&mut header.metadata);
    InvocationContext {
        request_id: header.request_id,
        tool: header.tool,
        metadata: header.metadata,
        source: endpoint.map(|ep| ep.source.clone()).unwrap_or_default(),
        trace,
    }
}

fn log_handler_error(err: &HandlerError) {
    if err.is_guard() {
        debug!(error = %err, "Tool handler rejected request");
    } else {
        error!(error = %err, "Tool handler failed");
    }
}

/// Forward handler replies, stopping at the first error, and append the
/// terminal chunk.
fn forward_chunks(
    inner: ReplyStream,
    request_id: String,
    span: tracing::Span,
) -> BoxStream<'static, StreamChunk> {
    stream::unfold(Some(inner), move |state| {
        let request_id = request_id.clone();
        let span = span.clone();
        async move {
            let mut inner = state?;
            match inner.next().await {
                Some(Ok(reply)) => Some((reply.into_chunk(&request_id), Some(inner))),
                Some(Err(err)) => {
                    log_handler_error(&err);
                    let chunk =
                        StreamChunk::failure(request_id, handler_status(&err), err.to_string());
                    Some((chunk, None))
                }
                None => Some((StreamChunk::end(request_id), None)),
            }
        }
        .instrument(span)
    })
    .boxed()
}

async fn forward_events(
    mut events: crate::endpoint::EventStream,
    tx: mpsc::UnboundedSender<Event>,
    request_id: String,
    default_topic: String,
) {
    while let Some(mut event) = events.next().await {
        if event.request_id.is_empty() {
            event.request_id.clone_from(&request_id);
        }
        if event.topic.is_empty() {
            event.topic.clone_from(&default_topic);
        }
        if tx.send(event).is_err() {
            warn!("Subscriber went away; stopping delegated feed");
            return;
        }
    }
    debug!("Delegated feed finished");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::endpoint::{invoke_fn, stream_fn, subscribe_fn, sync_invoke_fn};
    use crate::trace::TRACEPARENT;
    use crate::wire::Reply;

    fn echo() -> ToolHandler {
        sync_invoke_fn(|_, payload| Ok(Reply::ok(payload)))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    #[test]
    fn should_reject_duplicate_endpoint_names() {
        let bus = ToolBus::new();
        bus.register_local("echo", [echo()]).unwrap();

        let err = bus.register_local("echo", [echo()]).unwrap_err();
        assert_eq!(err, Error::duplicate_endpoint("echo"));
    }

    #[test]
    fn should_reject_endpoint_without_handlers() {
        let bus = ToolBus::new();
        let err = bus.register_endpoint(ToolEndpoint::new("empty")).unwrap_err();
        assert_eq!(err, Error::empty_endpoint("empty"));
    }

    #[test]
    fn should_tag_worker_endpoints_with_worker_source() {
        let bus = ToolBus::new();
        let names = bus
            .register_worker(
                "demo",
                [
                    ToolEndpoint::new("a").with_handler(echo()),
                    ToolEndpoint::new("b").with_handler(echo()).with_source("custom"),
                ],
            )
            .unwrap();

        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(bus.endpoint("a").unwrap().source, "worker:demo");
        assert_eq!(bus.endpoint("b").unwrap().source, "custom");
    }

    #[test]
    fn should_roll_back_worker_endpoints_on_collision() {
        let bus = ToolBus::new();
        bus.register_local("taken", [echo()]).unwrap();

        let result = bus.register_worker(
            "demo",
            [
                ToolEndpoint::new("fresh").with_handler(echo()),
                ToolEndpoint::new("taken").with_handler(echo()),
            ],
        );

        assert!(result.is_err());
        assert!(bus.endpoint("fresh").is_none());
        assert_eq!(bus.endpoint_names(), vec!["taken".to_string()]);
    }

    // ========================================================================
    // Invoke
    // ========================================================================

    #[tokio::test]
    async fn should_return_not_found_for_unknown_tool() {
        let bus = ToolBus::new();
        let response = bus.invoke(InvokeRequest::new("missing", "hi")).await;

        assert_eq!(response.status, StatusCode::NotFound);
        assert_eq!(response.error.as_deref(), Some("Tool 'missing' is not registered"));
        assert!(!response.request_id.is_empty());
    }

    #[tokio::test]
    async fn should_return_not_found_when_endpoint_cannot_invoke() {
        let bus = ToolBus::new();
        bus.register_local("feed", [stream_fn(|_, _| Ok(stream::empty().boxed()))])
            .unwrap();

        let response = bus.invoke(InvokeRequest::new("feed", "hi")).await;
        assert_eq!(response.status, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn should_map_guard_error_to_guard_rejected() {
        let bus = ToolBus::new();
        bus.register_local(
            "guarded",
            [sync_invoke_fn(|_, _| Err(HandlerError::guard("forbidden input")))],
        )
        .unwrap();

        let response = bus.invoke(InvokeRequest::new("guarded", "x")).await;

        assert_eq!(response.status, StatusCode::GuardRejected);
        assert_eq!(response.error.as_deref(), Some("forbidden input"));
    }

    #[tokio::test]
    async fn should_map_other_errors_to_error_status() {
        let bus = ToolBus::new();
        bus.register_local("broken", [sync_invoke_fn(|_, _| Err(HandlerError::failed("disk")))])
            .unwrap();

        let response = bus.invoke(InvokeRequest::new("broken", "x")).await;
        assert_eq!(response.status, StatusCode::Error);
    }

    #[tokio::test]
    async fn should_keep_request_id_and_propagate_trace() {
        let bus = ToolBus::new();
        bus.register_local(
            "trace",
            [invoke_fn(|ctx: InvocationContext, _| async move {
                Ok(Reply::ok(json!({
                    "traceparent": ctx.metadata.get(TRACEPARENT),
                    "trace_id": ctx.trace.trace_id(),
                })))
            })],
        )
        .unwrap();
        let parent = TraceContext::root();

        let request = InvokeRequest::new("trace", "")
            .with_request_id("req-1")
            .with_metadata(TRACEPARENT, parent.header());
        let response = bus.invoke(request).await;

        assert_eq!(response.request_id, "req-1");
        let body = response.json().unwrap();
        assert_eq!(body["trace_id"], json!(parent.trace_id()));
        assert_ne!(body["traceparent"], json!(parent.header()));
    }

    // ========================================================================
    // Stream
    // ========================================================================

    #[tokio::test]
    async fn should_append_terminal_chunk_after_items() {
        let bus = ToolBus::new();
        bus.register_local(
            "count",
            [stream_fn(|_, _| {
                Ok(stream::iter([Ok(Reply::ok("1")), Ok(Reply::ok("2"))]).boxed())
            })],
        )
        .unwrap();

        let chunks: Vec<StreamChunk> = bus.stream(StreamRequest::new("count", "")).collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text(), "1");
        assert_eq!(chunks[1].text(), "2");
        assert!(chunks[2].end_of_stream);
        assert_eq!(chunks[2].status, StatusCode::Ok);
        assert!(chunks[..2].iter().all(|c| !c.end_of_stream));
    }

    #[tokio::test]
    async fn should_stop_stream_at_first_error() {
        let bus = ToolBus::new();
        bus.register_local(
            "flaky",
            [stream_fn(|_, _| {
                Ok(stream::iter([
                    Ok(Reply::ok("1")),
                    Err(HandlerError::guard("stop")),
                    Ok(Reply::ok("never")),
                ])
                .boxed())
            })],
        )
        .unwrap();

        let chunks: Vec<StreamChunk> = bus.stream(StreamRequest::new("flaky", "")).collect().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].status, StatusCode::GuardRejected);
        assert!(chunks[1].end_of_stream);
    }

    #[tokio::test]
    async fn should_emit_single_not_found_chunk_for_unknown_stream() {
        let bus = ToolBus::new();
        let chunks: Vec<StreamChunk> = bus.stream(StreamRequest::new("nope", "")).collect().await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status, StatusCode::NotFound);
        assert!(chunks[0].end_of_stream);
    }

    // ========================================================================
    // Subscribe / publish
    // ========================================================================

    #[tokio::test]
    async fn should_deliver_published_events_to_local_subscribers() {
        let bus = ToolBus::new();
        let mut sub = bus.subscribe(SubscribeRequest::new("updates")).await;

        let delivered = bus.publish("updates", "hello", BTreeMap::new(), None);
        let event = sub.next().await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(event.topic, "updates");
        assert_eq!(event.payload, b"hello".to_vec());
        assert!(!event.request_id.is_empty());
    }

    #[tokio::test]
    async fn should_stop_delivery_after_close() {
        let bus = ToolBus::new();
        let mut sub = bus.subscribe(SubscribeRequest::new("updates")).await;

        sub.close();

        assert_eq!(bus.publish("updates", "late", BTreeMap::new(), None), 0);
        assert_eq!(bus.subscriber_count("updates"), 0);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn should_unblock_pending_consumer_when_closer_fires() {
        let bus = ToolBus::new();
        let mut sub = bus.subscribe(SubscribeRequest::new("idle")).await;
        let closer = sub.closer();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(outcome, Ok(Ok(None))));
    }

    #[tokio::test]
    async fn should_forward_delegated_events_and_fill_defaults() {
        let bus = ToolBus::new();
        bus.register_local(
            "ticker",
            [subscribe_fn(|_, _| {
                Ok(stream::iter([Event::new("", "tick"), Event::new("other", "tock")]).boxed())
            })],
        )
        .unwrap();

        let mut sub = bus
            .subscribe(SubscribeRequest::new("ticker").with_topics(["clock"]))
            .await;
        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();

        assert_eq!(first.topic, "clock");
        assert_eq!(second.topic, "other");
        assert!(!first.request_id.is_empty());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn should_report_refused_delegated_subscription() {
        let bus = ToolBus::new();
        bus.register_local(
            "private",
            [subscribe_fn(|_, _| Err(HandlerError::guard("not allowed")))],
        )
        .unwrap();

        let mut sub = bus.subscribe(SubscribeRequest::new("private")).await;

        assert_eq!(sub.status(), StatusCode::GuardRejected);
        assert_eq!(sub.error(), Some("not allowed"));
        assert!(sub.next().await.is_none());
    }
}
