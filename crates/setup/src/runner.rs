//! Execution of one planned stage.
//!
//! Each task moves through [`TaskState`] until it reaches a terminal result.
//! A continuous validator can send a failed attempt back to `Running`, bounded
//! by the task's `max_retries`.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use itertools::Itertools;
use serde_json::{Value, json};
use stagehand_core::JsonMap;
use tracing::{error, info, warn};

use crate::context::{RunServices, StageContext};
use crate::error::Result;
use crate::events::SetupEvent;
use crate::journal::JournalWriter;
use crate::result::{SetupResult, TaskError};
use crate::stage::{SetupStage, SetupStatus};
use crate::task::{SetupTask, TaskOutput};

/// Where a task stands inside the attempt loop.
#[derive(Debug)]
enum TaskState {
    Pending,
    Running { attempt: u32 },
    Retrying { attempt: u32 },
    Terminal(Box<SetupResult>),
}

/// Why a task was skipped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    RecipeSkip,
    DependencyMissing,
    DependencyBlocked,
    StageAborted,
}

impl SkipReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::RecipeSkip => "recipe-skip",
            Self::DependencyMissing => "dependency-missing",
            Self::DependencyBlocked => "dependency-blocked",
            Self::StageAborted => "stage-aborted",
        }
    }
}

/// The most recent result of each task, in no particular order.
pub(crate) fn latest_per_task(results: &[SetupResult]) -> Vec<&SetupResult> {
    results
        .iter()
        .rev()
        .unique_by(|r| r.task.as_str())
        .collect()
}

/// First task whose latest result is FAILED, in execution order.
pub(crate) fn first_failure(results: &[SetupResult]) -> Option<&SetupResult> {
    latest_per_task(results)
        .into_iter()
        .rev()
        .find(|r| r.is_failed())
}

/// Task telemetry payload for one attempt.
pub(crate) fn task_telemetry(task: &SetupTask, result: &SetupResult) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("task".into(), json!(task.name));
    payload.insert("stage".into(), json!(task.stage.as_str()));
    payload.insert("status".into(), json!(result.status.as_str()));
    payload.insert("duration_ms".into(), json!(result.duration_ms()));
    payload.insert("attempts".into(), json!(result.attempts));

    if result.is_failed() {
        payload.insert("failure_code".into(), json!(result.failure_code()));
        if let Some(err) = &result.error {
            payload.insert("error_type".into(), json!(err.kind));
            payload.insert("error_message".into(), json!(err.to_string()));
        }
    } else if let Some(code) = result.payload_failure_code() {
        payload.insert("failure_code".into(), json!(code));
    }

    if !result.payload.is_empty() {
        for key in ["suggested_fix", "suggested_remediation"] {
            if let Some(value) = result.payload.get(key).filter(|v| is_truthy(v)) {
                payload.insert(key.into(), value.clone());
            }
        }
        let keys: Vec<&String> = result.payload.keys().sorted().collect();
        payload.insert("payload_keys".into(), json!(keys));
    }
    payload
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

/// Runs the tasks of a single stage against a shared context.
pub(crate) struct StageRunner<'a> {
    services: &'a RunServices,
    journal: &'a mut JournalWriter,
    /// Tasks whose resumed result is still waiting to be reused.
    resume_pending: &'a mut HashSet<String>,
    stage: SetupStage,
    stage_failed: bool,
    results: Vec<SetupResult>,
}

impl<'a> StageRunner<'a> {
    pub(crate) fn new(
        services: &'a RunServices,
        journal: &'a mut JournalWriter,
        resume_pending: &'a mut HashSet<String>,
        stage: SetupStage,
    ) -> Self {
        Self {
            services,
            journal,
            resume_pending,
            stage,
            stage_failed: false,
            results: Vec::new(),
        }
    }

    /// Run `tasks` in plan order and report the stage.
    ///
    /// # Errors
    ///
    /// Fails on a fatal plugin startup error and on journal I/O errors.
    pub(crate) fn run(
        mut self,
        tasks: &[SetupTask],
        ctx: &mut StageContext,
    ) -> Result<Vec<SetupResult>> {
        let stage = self.stage;
        let started_at = Utc::now();
        ctx.set(format!("stage.{stage}.started"), started_at.to_rfc3339());
        ctx.publish(&SetupEvent::stage(stage, "started", JsonMap::new()));
        self.services.plugins.dispatch_before_stage(stage, ctx)?;
        let skip: HashSet<String> = ctx.recipe.skip_list(stage).into_iter().collect();

        for task in tasks {
            if self.resume_pending.remove(&task.name) {
                if let Some(existing) = ctx.results.get(&task.name) {
                    self.results.push(existing.clone());
                }
                continue;
            }
            if skip.contains(&task.name) {
                self.skip(task, SkipReason::RecipeSkip, JsonMap::new(), ctx);
                continue;
            }
            if let Some((reason, details)) = self.gate(task, ctx) {
                if reason == SkipReason::DependencyBlocked {
                    self.stage_failed = true;
                }
                self.skip(task, reason, details, ctx);
                continue;
            }
            self.run_task(task, ctx)?;
        }

        self.finish(started_at, ctx);
        Ok(self.results)
    }

    /// Decide whether a task may run given its dependencies and the stage.
    fn gate(&self, task: &SetupTask, ctx: &StageContext) -> Option<(SkipReason, JsonMap)> {
        let missing: Vec<&str> = task
            .dependencies
            .iter()
            .filter(|dep| !ctx.results.contains_key(dep.as_str()))
            .map(String::as_str)
            .sorted()
            .collect();
        if !missing.is_empty() {
            let details = JsonMap::from_iter([("missing".to_string(), json!(missing))]);
            return Some((SkipReason::DependencyMissing, details));
        }

        let blocked: BTreeMap<&str, &str> = task
            .dependencies
            .iter()
            .filter_map(|dep| ctx.results.get(dep).map(|r| (dep.as_str(), r)))
            .filter(|(_, r)| r.status != SetupStatus::Success)
            .map(|(dep, r)| (dep, r.status.as_str()))
            .collect();
        let dependency_failed = blocked
            .values()
            .any(|status| *status == SetupStatus::Failed.as_str());
        // Once the stage has failed, only a direct failure counts as blocking;
        // tasks behind a skipped dependency are aborted with the stage.
        if self.stage_failed && !dependency_failed {
            return Some((SkipReason::StageAborted, JsonMap::new()));
        }
        (!blocked.is_empty()).then(|| {
            let details = JsonMap::from_iter([("dependencies".to_string(), json!(blocked))]);
            (SkipReason::DependencyBlocked, details)
        })
    }

    fn skip(&mut self, task: &SetupTask, reason: SkipReason, details: JsonMap, ctx: &mut StageContext) {
        let mut payload = JsonMap::from_iter([("reason".to_string(), json!(reason.as_str()))]);
        payload.extend(details);
        if reason != SkipReason::RecipeSkip {
            payload.insert(
                "failure_code".into(),
                json!(format!("{}:{}:{}", self.stage, task.name, reason.as_str())),
            );
        }
        let result = SetupResult::skipped(&task.name, self.stage, payload.clone());
        ctx.results.insert(task.name.clone(), result.clone());
        ctx.publish(&SetupEvent::task(&task.name, self.stage, "skipped", payload));
        if reason != SkipReason::RecipeSkip {
            self.services
                .telemetry
                .record_task(task_telemetry(task, &result));
        }
        self.results.push(result);
    }

    fn run_task(&mut self, task: &SetupTask, ctx: &mut StageContext) -> Result<()> {
        let mut state = TaskState::Pending;
        loop {
            state = match state {
                TaskState::Pending => {
                    let payload =
                        JsonMap::from_iter([("dependencies".to_string(), json!(task.dependencies))]);
                    ctx.publish(&SetupEvent::task(&task.name, self.stage, "started", payload));
                    TaskState::Running { attempt: 1 }
                }
                TaskState::Running { attempt } => {
                    let result = self.attempt(task, attempt, ctx)?;
                    let retry = self.remediate(task, &result, ctx);
                    if retry && result.is_failed() && !task.allow_fail && attempt < task.max_retries {
                        TaskState::Retrying { attempt }
                    } else {
                        TaskState::Terminal(Box::new(result))
                    }
                }
                TaskState::Retrying { attempt } => {
                    let next = attempt.saturating_add(1);
                    ctx.publish(&SetupEvent::log(
                        "info",
                        format!("Retrying task {} after remediation (attempt {next})", task.name),
                        JsonMap::new(),
                    ));
                    info!(stage = %self.stage, task = %task.name, attempt = next, "Retrying task after remediation");
                    TaskState::Running { attempt: next }
                }
                TaskState::Terminal(result) => {
                    if result.is_failed() && !task.allow_fail {
                        self.stage_failed = true;
                    }
                    return Ok(());
                }
            };
        }
    }

    /// One execution of the task action, recorded everywhere a result goes.
    fn attempt(&mut self, task: &SetupTask, attempt: u32, ctx: &mut StageContext) -> Result<SetupResult> {
        let services = self.services;
        services.plugins.dispatch_before_task(task, ctx);

        let started_at = Utc::now();
        let mut result = match task.execute(ctx) {
            Ok(TaskOutput::Payload(payload)) => SetupResult::success(&task.name, task.stage, payload),
            Ok(TaskOutput::Result(result)) => *result,
            Err(err) => self.fail(task, err, ctx),
        }
        .with_attempts(attempt);
        result.started_at = Some(started_at);
        result.finished_at = Some(Utc::now());

        ctx.results.insert(task.name.clone(), result.clone());
        self.journal.record(&result)?;
        self.results.push(result.clone());
        services.plugins.dispatch_after_task(&result, ctx);
        ctx.publish(&self.outcome_event(task, &result));
        services.telemetry.record_task(task_telemetry(task, &result));
        Ok(result)
    }

    fn fail(&self, task: &SetupTask, err: TaskError, ctx: &mut StageContext) -> SetupResult {
        self.services.plugins.dispatch_error(task, &err, ctx);
        if !task.allow_fail {
            ctx.publish(&SetupEvent::log(
                "error",
                format!("Task {} failed: {err}", task.name),
                JsonMap::new(),
            ));
            error!(stage = %self.stage, task = %task.name, error = %err, "Task failed");
        }
        SetupResult::failed(&task.name, task.stage, err)
    }

    fn outcome_event(&self, task: &SetupTask, result: &SetupResult) -> SetupEvent {
        match result.status {
            SetupStatus::Success => {
                SetupEvent::task(&task.name, self.stage, "completed", result.payload.clone())
            }
            SetupStatus::Failed => {
                let mut payload = JsonMap::new();
                payload.insert("failure_code".into(), json!(result.failure_code()));
                if !result.payload.is_empty() {
                    payload.insert("payload".into(), Value::Object(result.payload.clone()));
                }
                if let Some(kind) = result.error_type() {
                    payload.insert("error_type".into(), json!(kind));
                }
                SetupEvent::task_failed(
                    &task.name,
                    self.stage,
                    result.error.as_ref().map(ToString::to_string),
                    payload,
                )
            }
            SetupStatus::Skipped => SetupEvent::task(
                &task.name,
                self.stage,
                result.status.as_str(),
                result.payload.clone(),
            ),
        }
    }

    /// Run validators and continuous validators; returns whether any
    /// decision asked for a retry.
    fn remediate(&mut self, task: &SetupTask, result: &SetupResult, ctx: &mut StageContext) -> bool {
        let services = self.services;
        let plugins = &services.plugins;
        for validator in plugins.validators() {
            if let Err(err) = validator.validate(result, ctx) {
                warn!(task = %task.name, error = %err, "Validator error");
            }
        }

        let mut retry = false;
        for validator in plugins.continuous_validators() {
            let decision = match validator.evaluate(result, ctx) {
                Ok(Some(decision)) => decision,
                Ok(None) => continue,
                Err(err) => {
                    warn!(task = %task.name, error = %err, "Continuous validator error");
                    continue;
                }
            };
            info!(
                task = %task.name,
                validator = %decision.name,
                reason = %decision.reason,
                "Continuous validator decision"
            );
            retry |= decision.retry;
            let actions = decision.rollbacks.into_iter().chain(decision.repairs);
            for action in actions {
                match action(ctx, result) {
                    Ok(Some(mut produced)) => {
                        produced.finished_at = Some(Utc::now());
                        ctx.results.insert(produced.task.clone(), produced.clone());
                        self.results.push(produced);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(task = %task.name, validator = %decision.name, error = %err, "Remediation action failed");
                    }
                }
            }
        }
        retry
    }

    fn finish(&self, started_at: chrono::DateTime<Utc>, ctx: &mut StageContext) {
        let stage = self.stage;
        let plugins = &self.services.plugins;
        plugins.dispatch_after_stage(stage, &self.results, ctx);
        for reporter in plugins.reporters() {
            if let Err(err) = reporter.report(&self.results, ctx) {
                warn!(stage = %stage, error = %err, "Reporter error");
            }
        }

        let failure = first_failure(&self.results);
        let status = if failure.is_some() { "failed" } else { "completed" };
        let results_json: Vec<Value> = self.results.iter().map(SetupResult::to_json).collect();
        let payload = JsonMap::from_iter([("results".to_string(), json!(results_json))]);
        ctx.publish(&SetupEvent::stage(stage, status, payload.clone()));

        let duration_ms =
            u64::try_from(Utc::now().signed_duration_since(started_at).num_milliseconds()).unwrap_or(0);
        let mut telemetry = JsonMap::new();
        telemetry.insert("stage".into(), json!(stage.as_str()));
        telemetry.insert("status".into(), json!(status));
        telemetry.insert("duration_ms".into(), json!(duration_ms));
        if let Some(failure) = failure {
            telemetry.insert("failure_code".into(), json!(failure.failure_code()));
        }
        telemetry.extend(payload);
        self.services.telemetry.record_stage(telemetry);
        info!(stage = %stage, status, results = self.results.len(), "Stage finished");
    }
}
