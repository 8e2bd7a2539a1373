//! Endpoint handlers and the registered endpoint record.
//!
//! Every handler takes the same `(context, payload)` shape. The `*_fn`
//! constructors wrap plain closures once, when the endpoint is built.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::HandlerError;
use crate::trace::TraceContext;
use crate::wire::{Event, Reply};

/// Result type returned by handlers.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Items produced by a stream handler.
pub type ReplyStream = BoxStream<'static, HandlerResult<Reply>>;

/// Events produced by a delegated subscription.
pub type EventStream = BoxStream<'static, Event>;

/// What a handler learns about the call it serves.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: String,
    pub tool: String,
    /// Request metadata, including the propagated `traceparent`.
    pub metadata: BTreeMap<String, String>,
    pub source: String,
    pub trace: TraceContext,
}

#[async_trait]
pub trait InvokeHandler: Send + Sync {
    async fn invoke(&self, ctx: InvocationContext, payload: Vec<u8>) -> HandlerResult<Reply>;
}

#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn stream(&self, ctx: InvocationContext, payload: Vec<u8>)
    -> HandlerResult<ReplyStream>;
}

#[async_trait]
pub trait SubscribeHandler: Send + Sync {
    async fn subscribe(
        &self,
        ctx: InvocationContext,
        topics: Vec<String>,
    ) -> HandlerResult<EventStream>;
}

/// The three call shapes an endpoint may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    Invoke,
    Stream,
    Subscribe,
}

impl CallMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Stream => "stream",
            Self::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler for one call mode.
#[derive(Clone)]
pub enum ToolHandler {
    Invoke(Arc<dyn InvokeHandler>),
    Stream(Arc<dyn StreamHandler>),
    Subscribe(Arc<dyn SubscribeHandler>),
}

impl ToolHandler {
    #[must_use]
    pub const fn mode(&self) -> CallMode {
        match self {
            Self::Invoke(_) => CallMode::Invoke,
            Self::Stream(_) => CallMode::Stream,
            Self::Subscribe(_) => CallMode::Subscribe,
        }
    }
}

impl fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToolHandler::{}", self.mode())
    }
}

// ============================================================================
// Closure adapters
// ============================================================================

struct AsyncInvoke<F>(F);

#[async_trait]
impl<F, Fut> InvokeHandler for AsyncInvoke<F>
where
    F: Fn(InvocationContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<Reply>> + Send + 'static,
{
    async fn invoke(&self, ctx: InvocationContext, payload: Vec<u8>) -> HandlerResult<Reply> {
        (self.0)(ctx, payload).await
    }
}

struct SyncInvoke<F>(F);

#[async_trait]
impl<F> InvokeHandler for SyncInvoke<F>
where
    F: Fn(InvocationContext, Vec<u8>) -> HandlerResult<Reply> + Send + Sync,
{
    async fn invoke(&self, ctx: InvocationContext, payload: Vec<u8>) -> HandlerResult<Reply> {
        (self.0)(ctx, payload)
    }
}

struct FnStream<F>(F);

#[async_trait]
impl<F> StreamHandler for FnStream<F>
where
    F: Fn(InvocationContext, Vec<u8>) -> HandlerResult<ReplyStream> + Send + Sync,
{
    async fn stream(
        &self,
        ctx: InvocationContext,
        payload: Vec<u8>,
    ) -> HandlerResult<ReplyStream> {
        (self.0)(ctx, payload)
    }
}

struct FnSubscribe<F>(F);

#[async_trait]
impl<F> SubscribeHandler for FnSubscribe<F>
where
    F: Fn(InvocationContext, Vec<u8>) -> HandlerResult<EventStream> + Send + Sync,
{
    async fn subscribe(
        &self,
        ctx: InvocationContext,
        topics: Vec<String>,
    ) -> HandlerResult<EventStream> {
        let payload = serde_json::to_vec(&topics)
            .map_err(|e| HandlerError::failed(format!("encoding topics: {e}")))?;
        (self.0)(ctx, payload)
    }
}

/// Wrap an async closure as an invoke handler.
pub fn invoke_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(InvocationContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Reply>> + Send + 'static,
{
    ToolHandler::Invoke(Arc::new(AsyncInvoke(f)))
}

/// Wrap a blocking closure as an invoke handler.
pub fn sync_invoke_fn<F>(f: F) -> ToolHandler
where
    F: Fn(InvocationContext, Vec<u8>) -> HandlerResult<Reply> + Send + Sync + 'static,
{
    ToolHandler::Invoke(Arc::new(SyncInvoke(f)))
}

/// Wrap a closure producing a reply stream.
pub fn stream_fn<F>(f: F) -> ToolHandler
where
    F: Fn(InvocationContext, Vec<u8>) -> HandlerResult<ReplyStream> + Send + Sync + 'static,
{
    ToolHandler::Stream(Arc::new(FnStream(f)))
}

/// Wrap a closure producing an event stream. The payload is the JSON array of
/// requested topics.
pub fn subscribe_fn<F>(f: F) -> ToolHandler
where
    F: Fn(InvocationContext, Vec<u8>) -> HandlerResult<EventStream> + Send + Sync + 'static,
{
    ToolHandler::Subscribe(Arc::new(FnSubscribe(f)))
}

// ============================================================================
// ToolEndpoint
// ============================================================================

/// A named target on the bus. At least one handler must be present for the
/// endpoint to be registered.
#[derive(Clone, Default)]
pub struct ToolEndpoint {
    pub name: String,
    /// Who registered it (`local`, `worker:<id>`); empty means unset.
    pub source: String,
    pub invoke: Option<Arc<dyn InvokeHandler>>,
    pub stream: Option<Arc<dyn StreamHandler>>,
    pub subscribe: Option<Arc<dyn SubscribeHandler>>,
    pub metadata: BTreeMap<String, String>,
}

impl ToolEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: ToolHandler) -> Self {
        self.set_handler(handler);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn set_handler(&mut self, handler: ToolHandler) {
        match handler {
            ToolHandler::Invoke(h) => self.invoke = Some(h),
            ToolHandler::Stream(h) => self.stream = Some(h),
            ToolHandler::Subscribe(h) => self.subscribe = Some(h),
        }
    }

    #[must_use]
    pub fn modes(&self) -> Vec<CallMode> {
        [
            self.invoke.as_ref().map(|_| CallMode::Invoke),
            self.stream.as_ref().map(|_| CallMode::Stream),
            self.subscribe.as_ref().map(|_| CallMode::Subscribe),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    #[must_use]
    pub fn supports(&self, mode: CallMode) -> bool {
        match mode {
            CallMode::Invoke => self.invoke.is_some(),
            CallMode::Stream => self.stream.is_some(),
            CallMode::Subscribe => self.subscribe.is_some(),
        }
    }
}

impl fmt::Debug for ToolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEndpoint")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("modes", &self.modes())
            .field("metadata", &self.metadata)
            .finish()
    }
}
