//! In-process tool bus.
//!
//! Multiplexes three call shapes over named endpoints:
//!
//! - **invoke**: one request, one [`InvokeResponse`]
//! - **stream**: one request, a sequence of [`StreamChunk`]s closed by a
//!   terminal `end_of_stream` chunk
//! - **subscribe**: a live [`Subscription`], served by the endpoint's own
//!   handler or by the local topic registry fed through [`ToolBus::publish`]
//!
//! Handler failures never surface as Rust errors to the caller. They map to
//! status codes: guard rejections to `GUARD_REJECTED`, everything else to
//! `ERROR`, and unknown targets to `NOT_FOUND`.
//!
//! # Example
//!
//! ```ignore
//! use stagehand_toolbus::{InvokeRequest, Reply, ToolBus, sync_invoke_fn};
//!
//! let bus = ToolBus::new();
//! bus.register_local("echo", [sync_invoke_fn(|_, payload| Ok(Reply::ok(payload)))])?;
//!
//! let response = bus.invoke(InvokeRequest::new("echo", "hello")).await;
//! assert!(response.status.is_ok());
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bus;
pub mod endpoint;
pub mod error;
pub mod subscription;
pub mod trace;
pub mod wire;

pub use bus::{LOCAL_SOURCE, ToolBus, worker_source};
pub use endpoint::{
    CallMode, EventStream, HandlerResult, InvocationContext, InvokeHandler, ReplyStream,
    StreamHandler, SubscribeHandler, ToolEndpoint, ToolHandler, invoke_fn, stream_fn,
    subscribe_fn, sync_invoke_fn,
};
pub use error::{Error, HandlerError, Result};
pub use subscription::{Subscription, SubscriptionCloser};
pub use trace::{TRACEPARENT, TraceContext};
pub use wire::{
    Event, Header, InvokeRequest, InvokeResponse, PayloadValue, Reply, StatusCode, StreamChunk,
    StreamRequest, SubscribeRequest,
};
