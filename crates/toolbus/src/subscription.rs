//! Live event feeds returned by `ToolBus::subscribe`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::wire::{Event, StatusCode};

/// Local pub/sub registry: topic to the senders of every live subscription.
pub(crate) type TopicRegistry = Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Event>)>>>;

/// A queue-backed async sequence of events.
///
/// The sequence ends once its channel closes: the delegated stream finished,
/// or the subscription was closed. Events buffered before closing are still
/// yielded.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Event>,
    closer: SubscriptionCloser,
    topics: Vec<String>,
    status: StatusCode,
    error: Option<String>,
}

impl Subscription {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<Event>,
        closer: SubscriptionCloser,
        topics: Vec<String>,
    ) -> Self {
        Self {
            receiver,
            closer,
            topics,
            status: StatusCode::Ok,
            error: None,
        }
    }

    /// A subscription that failed to open. It yields nothing.
    pub(crate) fn failed(topics: Vec<String>, status: StatusCode, error: String) -> Self {
        let (_, mut receiver) = mpsc::unbounded_channel();
        receiver.close();
        Self {
            receiver,
            closer: SubscriptionCloser::detached(),
            topics,
            status,
            error: Some(error),
        }
    }

    /// Wait for the next event; `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Cancel the feed. Pending and future `next()` calls drain what is
    /// already buffered and then return `None`.
    pub fn close(&mut self) {
        self.closer.close();
        self.receiver.close();
    }

    /// A handle that can close this subscription from elsewhere.
    #[must_use]
    pub fn closer(&self) -> SubscriptionCloser {
        self.closer.clone()
    }

    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// `OK` for a live feed; the failure status if the handler refused it.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closer.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topics", &self.topics)
            .field("status", &self.status)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Cloneable cancellation handle for a [`Subscription`].
#[derive(Clone)]
pub struct SubscriptionCloser {
    inner: Arc<CloserInner>,
}

struct CloserInner {
    id: u64,
    topics: Vec<String>,
    registry: Weak<TopicRegistry>,
    task: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl SubscriptionCloser {
    pub(crate) fn local(id: u64, topics: Vec<String>, registry: &Arc<TopicRegistry>) -> Self {
        Self {
            inner: Arc::new(CloserInner {
                id,
                topics,
                registry: Arc::downgrade(registry),
                task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn delegated(id: u64) -> Self {
        Self {
            inner: Arc::new(CloserInner {
                id,
                topics: Vec::new(),
                registry: Weak::new(),
                task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn detached() -> Self {
        let closer = Self::delegated(0);
        closer.inner.closed.store(true, Ordering::SeqCst);
        closer
    }

    pub(crate) fn attach_task(&self, handle: AbortHandle) {
        if self.is_closed() {
            handle.abort();
            return;
        }
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Abort the forwarding task and drop local registrations. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            let mut topics = registry.lock().unwrap_or_else(PoisonError::into_inner);
            for topic in &self.inner.topics {
                if let Some(senders) = topics.get_mut(topic) {
                    senders.retain(|(id, _)| *id != self.inner.id);
                    if senders.is_empty() {
                        topics.remove(topic);
                    }
                }
            }
        }
        tracing::debug!(subscription = self.inner.id, "Subscription closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
