//! The telemetry client interface and its recorder implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::Value;
use stagehand_core::JsonMap;
use tracing::warn;

use crate::error::Result;
use crate::event::{TelemetryEvent, TelemetryEventType};
use crate::knowledge::TelemetryKnowledgeBase;
use crate::storage::TelemetryStorage;

/// Sink for structured run telemetry. Recording never fails the caller.
pub trait TelemetryClient: Send + Sync {
    fn record_run(&self, metadata: JsonMap);
    fn record_stage(&self, metadata: JsonMap);
    fn record_task(&self, metadata: JsonMap);
    fn record_plugin(&self, metadata: JsonMap);

    /// Push buffered events to storage.
    ///
    /// # Errors
    ///
    /// Returns the storage error, if any.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// The knowledge base fed by this client, when it keeps one.
    fn knowledge(&self) -> Option<Arc<TelemetryKnowledgeBase>> {
        None
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetryClient;

impl TelemetryClient for NullTelemetryClient {
    fn record_run(&self, _metadata: JsonMap) {}
    fn record_stage(&self, _metadata: JsonMap) {}
    fn record_task(&self, _metadata: JsonMap) {}
    fn record_plugin(&self, _metadata: JsonMap) {}
}

/// Persists events and feeds task failures to a knowledge base.
pub struct TelemetryRecorder {
    storage: Arc<dyn TelemetryStorage>,
    knowledge: Arc<TelemetryKnowledgeBase>,
    enabled: AtomicBool,
}

impl TelemetryRecorder {
    pub fn new(storage: Arc<dyn TelemetryStorage>, knowledge: Arc<TelemetryKnowledgeBase>) -> Self {
        Self {
            storage,
            knowledge,
            enabled: AtomicBool::new(true),
        }
    }

    /// Replay stored events into the knowledge base. Returns how many were read.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    pub fn bootstrap(&self) -> Result<usize> {
        let events = self.storage.bootstrap()?;
        self.knowledge.load(&events);
        Ok(events.len())
    }

    /// Stop recording. Already buffered events can still be flushed.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn record(&self, kind: TelemetryEventType, metadata: JsonMap) {
        if !self.is_enabled() {
            return;
        }
        let event = TelemetryEvent::now(kind, metadata);
        if let Err(e) = self.storage.persist(&event) {
            warn!(kind = %kind, error = %e, "Failed to persist telemetry event");
        }
        self.knowledge.observe(&event);
    }
}

impl TelemetryClient for TelemetryRecorder {
    fn record_run(&self, metadata: JsonMap) {
        self.record(TelemetryEventType::Run, metadata);
    }

    fn record_stage(&self, mut metadata: JsonMap) {
        metadata
            .entry("recorded_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        self.record(TelemetryEventType::Stage, metadata);
    }

    fn record_task(&self, metadata: JsonMap) {
        self.record(TelemetryEventType::Task, metadata);
    }

    fn record_plugin(&self, metadata: JsonMap) {
        self.record(TelemetryEventType::Plugin, metadata);
    }

    fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    fn knowledge(&self) -> Option<Arc<TelemetryKnowledgeBase>> {
        Some(Arc::clone(&self.knowledge))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;
    use stagehand_core::json::object;

    use super::*;
    use crate::storage::InMemoryTelemetryStorage;
    use crate::suggestion::FailureSignature;

    fn failed_task() -> JsonMap {
        object([
            ("status", json!("failed")),
            ("failure_code", json!("preflight:demo:Boom")),
            ("suggested_fix", json!("Try again")),
        ])
    }

    #[test]
    fn should_persist_and_learn_from_task_events() {
        let storage = Arc::new(InMemoryTelemetryStorage::new());
        let kb = Arc::new(TelemetryKnowledgeBase::new());
        let recorder = TelemetryRecorder::new(storage.clone(), kb.clone());

        recorder.record_task(failed_task());
        recorder.record_stage(object([("stage", json!("preflight"))]));

        let events = storage.events();
        assert_eq!(events.len(), 2);
        assert!(events[1].metadata.contains_key("recorded_at"));
        assert!(kb.suggest_fix(&FailureSignature::new("preflight:demo:Boom")).is_some());
    }

    #[test]
    fn should_hydrate_knowledge_from_storage() {
        let storage = Arc::new(InMemoryTelemetryStorage::new());
        storage.persist(&TelemetryEvent::task(failed_task())).unwrap();
        let kb = Arc::new(TelemetryKnowledgeBase::new());
        let recorder = TelemetryRecorder::new(storage, kb.clone());

        assert_eq!(recorder.bootstrap().unwrap(), 1);
        assert_eq!(kb.summarize()["preflight:demo:Boom"].occurrences, 1);
    }

    #[test]
    fn should_drop_events_when_disabled() {
        let storage = Arc::new(InMemoryTelemetryStorage::new());
        let recorder = TelemetryRecorder::new(storage.clone(), Arc::new(TelemetryKnowledgeBase::new()));

        recorder.disable();
        recorder.record_run(object([("recipe", json!("demo"))]));

        assert!(storage.events().is_empty());
        assert!(recorder.knowledge().is_some());
        assert!(NullTelemetryClient.knowledge().is_none());
    }
}
