#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! Telemetry for setup runs.
//!
//! [`TelemetryRecorder`] turns run, stage, task and plugin payloads into
//! [`TelemetryEvent`]s, persists them through a [`TelemetryStorage`] adapter
//! and feeds failed tasks to the [`TelemetryKnowledgeBase`], which ranks the
//! remediations seen for similar failures.

pub mod client;
pub mod error;
pub mod event;
pub mod knowledge;
pub mod storage;
pub mod suggestion;

pub use client::{NullTelemetryClient, TelemetryClient, TelemetryRecorder};
pub use error::{Error, Result};
pub use event::{TelemetryEvent, TelemetryEventType};
pub use knowledge::{FailureInsight, InsightSummary, TelemetryKnowledgeBase};
pub use storage::{InMemoryTelemetryStorage, JsonlTelemetryStorage, TelemetryStorage};
pub use suggestion::{
    ConfigPatch, FailureSignature, RemediationAdvisor, RemediationSuggestion, TaskOverride,
};
