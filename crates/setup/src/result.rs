//! Task results and the errors task actions raise.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::JsonMap;
use stagehand_core::json::str_field;

use crate::stage::{SetupStage, SetupStatus};

/// Default `kind` of a [`TaskError`].
pub const DEFAULT_ERROR_KIND: &str = "TaskError";

/// Kind given to a task action that panicked.
pub const PANIC_ERROR_KIND: &str = "Panic";

fn default_kind() -> String {
    DEFAULT_ERROR_KIND.to_string()
}

/// Failure raised by a task action.
///
/// `kind` plays the role of an exception type name: it ends up in failure
/// codes and is one of the keys the knowledge base indexes fixes by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(default = "default_kind")]
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: default_kind(),
            message: message.into(),
        }
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::with_kind(PANIC_ERROR_KIND, message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

const fn one() -> u32 {
    1
}

/// Outcome of one execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupResult {
    pub task: String,
    pub stage: SetupStage,
    pub status: SetupStatus,
    #[serde(default)]
    pub payload: JsonMap,
    #[serde(default)]
    pub error: Option<TaskError>,
    /// 0 when skipped without running.
    #[serde(default = "one")]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SetupResult {
    pub fn new(task: impl Into<String>, stage: SetupStage, status: SetupStatus) -> Self {
        Self {
            task: task.into(),
            stage,
            status,
            payload: JsonMap::new(),
            error: None,
            attempts: 1,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn success(task: impl Into<String>, stage: SetupStage, payload: JsonMap) -> Self {
        Self::new(task, stage, SetupStatus::Success).with_payload(payload)
    }

    /// A result for a task that never ran.
    pub fn skipped(task: impl Into<String>, stage: SetupStage, payload: JsonMap) -> Self {
        Self::new(task, stage, SetupStatus::Skipped)
            .with_payload(payload)
            .with_attempts(0)
    }

    pub fn failed(task: impl Into<String>, stage: SetupStage, error: TaskError) -> Self {
        Self::new(task, stage, SetupStatus::Failed).with_error(error)
    }

    #[must_use]
    pub fn with_payload(mut self, payload: JsonMap) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == SetupStatus::Success
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == SetupStatus::Failed
    }

    /// The error kind, if the attempt raised one.
    #[must_use]
    pub fn error_type(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    /// `payload.failure_code` when it is a string, otherwise
    /// `<stage>:<task>:<error kind or "unknown">`.
    #[must_use]
    pub fn failure_code(&self) -> String {
        self.payload
            .get("failure_code")
            .and_then(Value::as_str)
            .map_or_else(
                || {
                    format!(
                        "{}:{}:{}",
                        self.stage,
                        self.task,
                        self.error_type().unwrap_or("unknown")
                    )
                },
                str::to_string,
            )
    }

    /// The failure code explicitly carried in the payload, if any.
    #[must_use]
    pub fn payload_failure_code(&self) -> Option<&str> {
        str_field(&self.payload, "failure_code")
    }

    /// Wall time between start and finish, clamped at zero.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                u64::try_from(end.signed_duration_since(start).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// JSON form, as written to the journal and stage telemetry.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Duration;
    use serde_json::json;
    use stagehand_core::json::object;

    use super::*;

    #[test]
    fn should_derive_failure_code_from_error_kind() {
        let result = SetupResult::failed(
            "pip",
            SetupStage::Installers,
            TaskError::with_kind("NetworkError", "timeout"),
        );
        assert_eq!(result.failure_code(), "installers:pip:NetworkError");
    }

    #[test]
    fn should_prefer_payload_failure_code() {
        let result = SetupResult::skipped(
            "pip",
            SetupStage::Installers,
            object([("failure_code", json!("installers:pip:dependency-blocked"))]),
        );
        assert_eq!(result.failure_code(), "installers:pip:dependency-blocked");
        assert_eq!(result.attempts, 0);
    }

    #[test]
    fn should_use_unknown_when_no_error() {
        let result = SetupResult::new("a", SetupStage::Preflight, SetupStatus::Failed);
        assert_eq!(result.failure_code(), "preflight:a:unknown");
    }

    #[test]
    fn should_roundtrip_through_json() {
        let now = Utc::now();
        let mut result = SetupResult::failed("a", SetupStage::Verification, TaskError::new("x"));
        result.started_at = Some(now);
        result.finished_at = now.checked_add_signed(Duration::milliseconds(42));

        let back: SetupResult = serde_json::from_value(result.to_json()).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.duration_ms(), 42);
        assert_eq!(back.error.unwrap().kind, DEFAULT_ERROR_KIND);
    }
}
