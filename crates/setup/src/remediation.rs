//! Telemetry-driven remediation for failed tasks.
//!
//! [`AdaptiveRemediationPlugin`] asks a [`RemediationAdvisor`] (by default the
//! knowledge base behind the run's telemetry client) for a fix whenever a task
//! fails. A suggestion becomes one repair that stages its commands, config
//! patches and task overrides in `state["adaptive_remediation"]`, and may
//! request a retry.

use std::sync::Arc;

use serde_json::{Value, json};
use stagehand_core::JsonMap;
use stagehand_telemetry::{FailureSignature, RemediationAdvisor, RemediationSuggestion, TelemetryClient};
use stagehand_toolbus::{Reply, sync_invoke_fn};
use tracing::debug;

use crate::context::StageContext;
use crate::events::SetupEvent;
use crate::plugins::{PluginError, PluginRegistrar, SetupPlugin};
use crate::result::SetupResult;
use crate::validators::{ContinuousValidator, ValidatorDecision};

pub const PLUGIN_NAME: &str = "adaptive-remediation";

/// Tool-bus endpoint answering suggestion queries.
pub const SUGGEST_ENDPOINT: &str = "setup.remediation.suggest";

/// Context state key holding staged remediation.
pub const STATE_KEY: &str = "adaptive_remediation";

/// Where suggestions come from.
#[derive(Clone, Default)]
struct AdvisorSource {
    advisor: Option<Arc<dyn RemediationAdvisor>>,
    telemetry: Option<Arc<dyn TelemetryClient>>,
}

impl AdvisorSource {
    /// A fixed advisor wins, then the given context's knowledge base, then
    /// the knowledge base of the telemetry client the plugin was built with.
    fn resolve(&self, ctx: Option<&StageContext>) -> Option<Arc<dyn RemediationAdvisor>> {
        if let Some(advisor) = &self.advisor {
            return Some(Arc::clone(advisor));
        }
        ctx.and_then(StageContext::knowledge)
            .or_else(|| self.telemetry.as_ref().and_then(|t| t.knowledge()))
            .map(|knowledge| knowledge as Arc<dyn RemediationAdvisor>)
    }
}

#[derive(Clone, Default)]
pub struct AdaptiveRemediationPlugin {
    source: AdvisorSource,
}

impl AdaptiveRemediationPlugin {
    /// Suggestions come from the run's telemetry knowledge base.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always consult `advisor`.
    #[must_use]
    pub fn with_advisor(advisor: Arc<dyn RemediationAdvisor>) -> Self {
        Self {
            source: AdvisorSource {
                advisor: Some(advisor),
                telemetry: None,
            },
        }
    }

    /// Also answer tool-bus queries outside a run from `telemetry`'s
    /// knowledge base.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryClient>) -> Self {
        self.source.telemetry = Some(telemetry);
        self
    }
}

impl SetupPlugin for AdaptiveRemediationPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register(&self, registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
        registrar.add_continuous_validator(RemediationValidator {
            source: self.source.clone(),
        });
        let source = self.source.clone();
        registrar.add_handler(
            SUGGEST_ENDPOINT,
            sync_invoke_fn(move |_ctx, payload| {
                let query: JsonMap = serde_json::from_slice(&payload)?;
                let suggestion = source
                    .resolve(None)
                    .and_then(|advisor| advisor.suggest_fix(&FailureSignature::from_json(&query)));
                Ok(Reply::ok(json!({
                    "suggestion": suggestion.map(|s| s.to_payload()),
                })))
            }),
        );
        Ok(())
    }
}

/// The continuous validator contributed by the plugin.
struct RemediationValidator {
    source: AdvisorSource,
}

impl ContinuousValidator for RemediationValidator {
    fn evaluate(
        &self,
        result: &SetupResult,
        ctx: &StageContext,
    ) -> Result<Option<ValidatorDecision>, PluginError> {
        if !result.is_failed() {
            return Ok(None);
        }
        let Some(advisor) = self.source.resolve(Some(ctx)) else {
            debug!(task = %result.task, "No remediation advisor available");
            return Ok(None);
        };
        let failure_code = result.failure_code();
        let mut signature = FailureSignature::new(&failure_code)
            .with_stage(result.stage.as_str())
            .with_task(&result.task);
        if let Some(kind) = result.error_type() {
            signature = signature.with_error_type(kind);
        }
        let Some(suggestion) = advisor.suggest_fix(&signature) else {
            return Ok(None);
        };

        announce(ctx, result, &suggestion, &failure_code);
        let reason = format!(
            "Applying remediation '{}' (confidence {:.2})",
            suggestion.title, suggestion.confidence
        );
        let retry = suggestion.retry;
        let plan = RemediationPlan::from_suggestion(&suggestion);
        Ok(Some(
            ValidatorDecision::new(PLUGIN_NAME, reason)
                .with_repair(move |ctx, failed| Ok(Some(apply(ctx, failed, &suggestion, &plan))))
                .with_retry(retry),
        ))
    }
}

fn announce(ctx: &StageContext, result: &SetupResult, suggestion: &RemediationSuggestion, failure_code: &str) {
    let mut payload = JsonMap::new();
    payload.insert("source".into(), json!(PLUGIN_NAME));
    payload.insert("suggestion".into(), suggestion.to_payload());
    payload.insert("confidence".into(), json!(suggestion.confidence));
    payload.insert("failure_code".into(), json!(failure_code));
    payload.insert("task".into(), json!(result.task));
    payload.insert("stage".into(), json!(result.stage.as_str()));
    ctx.publish(&SetupEvent::task(
        &result.task,
        result.stage,
        "remediation",
        payload.clone(),
    ));
    ctx.publish(&SetupEvent::log(
        "info",
        format!(
            "{PLUGIN_NAME} predicted remediation for {}: {}",
            result.task,
            suggestion.describe()
        ),
        payload,
    ));
}

/// What a suggestion asks to stage.
#[derive(Debug, Clone, Default)]
struct RemediationPlan {
    commands: Vec<Value>,
    config_patches: Vec<Value>,
    task_overrides: JsonMap,
}

impl RemediationPlan {
    fn from_suggestion(suggestion: &RemediationSuggestion) -> Self {
        Self {
            commands: suggestion.commands.iter().map(|c| json!(c)).collect(),
            config_patches: suggestion
                .config_patches
                .iter()
                .map(|p| json!({"path": p.path, "value": p.value}))
                .collect(),
            task_overrides: suggestion
                .task_overrides
                .iter()
                .map(|o| (o.task.clone(), Value::Object(o.parameters.clone())))
                .collect(),
        }
    }

    fn stage_into(&self, state: &mut JsonMap) {
        let bucket = state
            .entry(STATE_KEY)
            .or_insert_with(|| json!({"commands": [], "config_patches": [], "task_overrides": {}}));
        if !bucket.is_object() {
            *bucket = json!({});
        }
        let Value::Object(bucket) = bucket else {
            return;
        };
        extend_list(bucket, "commands", &self.commands);
        extend_list(bucket, "config_patches", &self.config_patches);
        let overrides = bucket
            .entry("task_overrides")
            .or_insert_with(|| Value::Object(JsonMap::new()));
        match overrides {
            Value::Object(existing) => existing.extend(self.task_overrides.clone()),
            other => *other = Value::Object(self.task_overrides.clone()),
        }
    }
}

fn extend_list(bucket: &mut JsonMap, key: &str, items: &[Value]) {
    let slot = bucket
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(list) => list.extend(items.iter().cloned()),
        other => *other = Value::Array(items.to_vec()),
    }
}

fn apply(
    ctx: &mut StageContext,
    failed: &SetupResult,
    suggestion: &RemediationSuggestion,
    plan: &RemediationPlan,
) -> SetupResult {
    plan.stage_into(&mut ctx.state);

    let suggestion_payload = suggestion.to_payload();
    let mut applied = JsonMap::new();
    applied.insert("source".into(), json!(PLUGIN_NAME));
    applied.insert("suggestion".into(), suggestion_payload.clone());
    applied.insert("confidence".into(), json!(suggestion.confidence));
    applied.insert("target_task".into(), json!(failed.task));
    applied.insert("stage".into(), json!(failed.stage.as_str()));

    ctx.publish(&SetupEvent::task(
        &failed.task,
        failed.stage,
        "remediation-applied",
        applied.clone(),
    ));
    ctx.publish(&SetupEvent::log(
        "info",
        format!(
            "Remediation actions staged for {} (confidence {:.2})",
            failed.task, suggestion.confidence
        ),
        applied.clone(),
    ));

    let mut payload = JsonMap::new();
    payload.insert("applied".into(), Value::Object(applied));
    payload.insert("suggested_remediation".into(), suggestion_payload);
    SetupResult::success(
        format!("{}#{PLUGIN_NAME}", failed.task),
        failed.stage,
        payload,
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use stagehand_telemetry::{ConfigPatch, TelemetryEvent, TelemetryEventType, TelemetryKnowledgeBase};

    use super::*;
    use crate::context::RunServices;
    use crate::recipe::Recipe;
    use crate::result::TaskError;
    use crate::stage::SetupStage;

    fn primed_knowledge() -> Arc<TelemetryKnowledgeBase> {
        let knowledge = TelemetryKnowledgeBase::new();
        let suggestion = RemediationSuggestion::new("Install dependencies")
            .with_commands(["pip install deps"])
            .with_config_patch(ConfigPatch::new("env.debug", json!(true)))
            .with_task_override("install", JsonMap::from_iter([("force".to_string(), json!(true))]))
            .with_confidence(0.85)
            .with_retry(true);
        let metadata = JsonMap::from_iter([
            ("status".to_string(), json!("failed")),
            ("failure_code".to_string(), json!("preflight:demo:RuntimeError")),
            ("stage".to_string(), json!("preflight")),
            ("task".to_string(), json!("demo")),
            ("error_type".to_string(), json!("RuntimeError")),
            ("suggested_remediation".to_string(), suggestion.to_payload()),
        ]);
        knowledge.observe(&TelemetryEvent::now(TelemetryEventType::Task, metadata));
        Arc::new(knowledge)
    }

    fn failed_demo() -> SetupResult {
        SetupResult::failed(
            "demo",
            SetupStage::Preflight,
            TaskError::with_kind("RuntimeError", "boom"),
        )
    }

    #[test]
    fn should_ignore_successful_results() {
        let validator = RemediationValidator {
            source: AdvisorSource {
                advisor: Some(primed_knowledge()),
                telemetry: None,
            },
        };
        let ctx = StageContext::new("/tmp", Recipe::new("demo"), RunServices::detached());
        let ok = SetupResult::success("demo", SetupStage::Preflight, JsonMap::new());
        assert!(validator.evaluate(&ok, &ctx).unwrap().is_none());
    }

    #[test]
    fn should_stage_knowledge_driven_plan() {
        let validator = RemediationValidator {
            source: AdvisorSource {
                advisor: Some(primed_knowledge()),
                telemetry: None,
            },
        };
        let mut ctx = StageContext::new("/tmp", Recipe::new("demo"), RunServices::detached());
        let failed = failed_demo();

        let decision = validator.evaluate(&failed, &ctx).unwrap().unwrap();
        assert!(decision.retry);
        assert!(decision.reason.contains("Install dependencies"));
        assert_eq!(decision.repairs.len(), 1);

        let repair = decision.repairs.into_iter().next().unwrap();
        let produced = repair(&mut ctx, &failed).unwrap().unwrap();
        assert_eq!(produced.task, "demo#adaptive-remediation");
        assert!(produced.is_success());

        let staged = &ctx.state[STATE_KEY];
        assert_eq!(staged["commands"], json!(["pip install deps"]));
        assert_eq!(staged["config_patches"][0]["path"], json!("env.debug"));
        assert_eq!(staged["task_overrides"]["install"]["force"], json!(true));
    }

    #[test]
    fn should_decline_without_advisor() {
        let validator = RemediationValidator {
            source: AdvisorSource::default(),
        };
        let ctx = StageContext::new("/tmp", Recipe::new("demo"), RunServices::detached());
        assert!(validator.evaluate(&failed_demo(), &ctx).unwrap().is_none());
    }
}
