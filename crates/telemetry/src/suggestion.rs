//! Remediation suggestions and the failure signature they are looked up by.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::JsonMap;

/// A configuration change proposed by a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

impl ConfigPatch {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Parameters to apply to a task on its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOverride {
    pub task: String,
    #[serde(default)]
    pub parameters: JsonMap,
}

/// A candidate fix for a failure, as recorded in telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationSuggestion {
    pub title: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub config_patches: Vec<ConfigPatch>,
    #[serde(default)]
    pub task_overrides: Vec<TaskOverride>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub retry: bool,
}

impl RemediationSuggestion {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            commands: Vec::new(),
            config_patches: Vec::new(),
            task_overrides: Vec::new(),
            confidence: 0.0,
            retry: false,
        }
    }

    #[must_use]
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_config_patch(mut self, patch: ConfigPatch) -> Self {
        self.config_patches.push(patch);
        self
    }

    #[must_use]
    pub fn with_task_override(mut self, task: impl Into<String>, parameters: JsonMap) -> Self {
        self.task_overrides.push(TaskOverride {
            task: task.into(),
            parameters,
        });
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Parse a `suggested_remediation` payload. Returns `None` unless it is an
    /// object with a non-empty title.
    #[must_use]
    pub fn from_payload(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value::<Self>(value.clone())
            .ok()
            .filter(|s| !s.title.trim().is_empty())
    }

    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// One-line human summary.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut details = Vec::new();
        if !self.commands.is_empty() {
            details.push(format!("run {}", self.commands.join("; ")));
        }
        if !self.config_patches.is_empty() {
            let paths = self.config_patches.iter().map(|p| p.path.as_str()).join(", ");
            details.push(format!("patch {paths}"));
        }
        if !self.task_overrides.is_empty() {
            let tasks = self.task_overrides.iter().map(|o| o.task.as_str()).join(", ");
            details.push(format!("override {tasks}"));
        }
        if details.is_empty() {
            self.title.clone()
        } else {
            format!("{} ({})", self.title, details.join("; "))
        }
    }
}

/// The failure a suggestion is requested for. Empty fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureSignature {
    pub failure_code: Option<String>,
    pub error_type: Option<String>,
    pub stage: Option<String>,
    pub task: Option<String>,
}

impl FailureSignature {
    pub fn new(failure_code: impl Into<String>) -> Self {
        Self {
            failure_code: Some(failure_code.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    #[must_use]
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Read a signature from a JSON object with `failure_code`, `error_type`,
    /// `stage` and `task` string fields.
    #[must_use]
    pub fn from_json(map: &JsonMap) -> Self {
        let field = |key: &str| stagehand_core::json::str_field(map, key).map(str::to_string);
        Self {
            failure_code: field("failure_code"),
            error_type: field("error_type"),
            stage: field("stage"),
            task: field("task"),
        }
    }
}

/// Anything that can rank a remediation for a failure.
pub trait RemediationAdvisor: Send + Sync {
    fn suggest_fix(&self, signature: &FailureSignature) -> Option<RemediationSuggestion>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn should_parse_full_payload() {
        let payload = json!({
            "title": "Install dependencies",
            "commands": ["pip install deps"],
            "config_patches": [{"path": "env.debug", "value": true}],
            "task_overrides": [{"task": "install", "parameters": {"force": true}}],
            "confidence": 0.85,
            "retry": true,
        });

        let suggestion = RemediationSuggestion::from_payload(&payload).unwrap();

        assert_eq!(suggestion.commands, vec!["pip install deps".to_string()]);
        assert_eq!(suggestion.config_patches[0].path, "env.debug");
        assert_eq!(suggestion.task_overrides[0].parameters["force"], json!(true));
        assert!(suggestion.retry);
    }

    #[test]
    fn should_reject_payload_without_title() {
        assert!(RemediationSuggestion::from_payload(&json!({"commands": []})).is_none());
        assert!(RemediationSuggestion::from_payload(&json!("text")).is_none());
    }

    #[test]
    fn should_describe_actions_after_title() {
        let suggestion = RemediationSuggestion::new("Fix network")
            .with_commands(["restart-service"])
            .with_config_patch(ConfigPatch::new("proxy.enabled", json!(false)));

        assert_eq!(
            suggestion.describe(),
            "Fix network (run restart-service; patch proxy.enabled)"
        );
        assert_eq!(RemediationSuggestion::new("Plain").describe(), "Plain");
    }
}
