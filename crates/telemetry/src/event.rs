//! Telemetry event primitives.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::JsonMap;

/// Kinds of events captured by the telemetry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryEventType {
    Environment,
    Stage,
    Task,
    Consent,
    Run,
    Plugin,
}

impl fmt::Display for TelemetryEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Environment => "environment",
            Self::Stage => "stage",
            Self::Task => "task",
            Self::Consent => "consent",
            Self::Run => "run",
            Self::Plugin => "plugin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: TelemetryEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl TelemetryEvent {
    /// An event stamped with the current time.
    #[must_use]
    pub fn now(kind: TelemetryEventType, metadata: JsonMap) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Shorthand for a task event, mostly useful when priming a knowledge base.
    #[must_use]
    pub fn task(metadata: JsonMap) -> Self {
        Self::now(TelemetryEventType::Task, metadata)
    }
}
