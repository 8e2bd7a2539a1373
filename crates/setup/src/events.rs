//! Dashboard events and the hub that fans them out.
//!
//! Every event goes to the registered listeners first, then to the tool bus
//! on the configured events topic as `{"type": <variant>, "event": <json>}`.
//! Neither path can fail the run: listener panics are caught and a bus with
//! no subscribers simply drops the event.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stagehand_core::{JsonMap, ResultExt};
use stagehand_toolbus::ToolBus;
use tracing::debug;

use crate::stage::SetupStage;

/// Default tool-bus topic for orchestrator events.
pub const DEFAULT_EVENTS_TOPIC: &str = "setup.events";

/// Metadata `source` attached to published events.
pub const EVENT_SOURCE: &str = "orchestrator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupEvent {
    Stage {
        stage: SetupStage,
        status: String,
        #[serde(default)]
        payload: JsonMap,
    },
    Task {
        task: String,
        stage: SetupStage,
        status: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        payload: JsonMap,
    },
    Log {
        level: String,
        message: String,
        #[serde(default)]
        payload: JsonMap,
    },
}

impl SetupEvent {
    pub fn stage(stage: SetupStage, status: impl Into<String>, payload: JsonMap) -> Self {
        Self::Stage {
            stage,
            status: status.into(),
            payload,
        }
    }

    pub fn task(
        task: impl Into<String>,
        stage: SetupStage,
        status: impl Into<String>,
        payload: JsonMap,
    ) -> Self {
        Self::Task {
            task: task.into(),
            stage,
            status: status.into(),
            error: None,
            payload,
        }
    }

    pub fn task_failed(
        task: impl Into<String>,
        stage: SetupStage,
        error: Option<String>,
        payload: JsonMap,
    ) -> Self {
        Self::Task {
            task: task.into(),
            stage,
            status: "failed".to_string(),
            error,
            payload,
        }
    }

    pub fn log(level: impl Into<String>, message: impl Into<String>, payload: JsonMap) -> Self {
        Self::Log {
            level: level.into(),
            message: message.into(),
            payload,
        }
    }

    /// Variant name used as `type` on the bus.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Stage { .. } => "StageEvent",
            Self::Task { .. } => "TaskEvent",
            Self::Log { .. } => "LogEvent",
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::Stage { status, .. } | Self::Task { status, .. } => Some(status),
            Self::Log { .. } => None,
        }
    }

    #[must_use]
    pub const fn payload(&self) -> &JsonMap {
        match self {
            Self::Stage { payload, .. } | Self::Task { payload, .. } | Self::Log { payload, .. } => {
                payload
            }
        }
    }
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SetupEvent) + Send + Sync>;

pub struct EventHub {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    tool_bus: Arc<ToolBus>,
    topic: String,
}

impl EventHub {
    pub fn new(tool_bus: Arc<ToolBus>, topic: impl Into<String>) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tool_bus,
            topic: topic.into(),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SetupEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: &SetupEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                debug!(event = event.type_name(), "Dashboard listener panicked");
            }
        }

        let body = serde_json::to_value(event).or_default_logged("serialize setup event", Value::Null);
        let metadata = BTreeMap::from([("source".to_string(), EVENT_SOURCE.to_string())]);
        let delivered = self.tool_bus.publish(
            &self.topic,
            json!({"type": event.type_name(), "event": body}),
            metadata,
            None,
        );
        debug!(topic = %self.topic, delivered, "Published setup event");
    }

    /// Re-publish historical events, e.g. from a journal.
    pub fn replay_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = SetupEvent>,
    {
        events.into_iter().for_each(|event| self.publish(&event));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use stagehand_toolbus::SubscribeRequest;

    use super::*;

    fn hub() -> (Arc<ToolBus>, EventHub) {
        let bus = Arc::new(ToolBus::new());
        let hub = EventHub::new(Arc::clone(&bus), DEFAULT_EVENTS_TOPIC);
        (bus, hub)
    }

    #[test]
    fn should_deliver_to_listeners_until_unsubscribed() {
        let (_bus, hub) = hub();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = hub.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        hub.publish(&SetupEvent::log("info", "one", JsonMap::new()));
        assert!(hub.unsubscribe(id));
        hub.publish(&SetupEvent::log("info", "two", JsonMap::new()));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!hub.unsubscribe(id));
    }

    #[test]
    fn should_survive_panicking_listener() {
        let (_bus, hub) = hub();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        hub.subscribe(|_| panic!("listener bug"));
        hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(&SetupEvent::stage(SetupStage::Preflight, "started", JsonMap::new()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_mirror_events_onto_bus_topic() {
        let (bus, hub) = hub();
        let mut sub = bus
            .subscribe(SubscribeRequest::new("dashboard").with_topics([DEFAULT_EVENTS_TOPIC]))
            .await;

        hub.publish(&SetupEvent::task(
            "a",
            SetupStage::Installers,
            "completed",
            JsonMap::new(),
        ));

        let event = sub.next().await.unwrap();
        assert_eq!(event.metadata.get("source").map(String::as_str), Some(EVENT_SOURCE));
        let body = event.json().unwrap();
        assert_eq!(body["type"], "TaskEvent");
        assert_eq!(body["event"]["task"], "a");
        assert_eq!(body["event"]["stage"], "installers");
    }
}
