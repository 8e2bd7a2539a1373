//! Adaptive remediation driven by telemetry history.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::indexing_slicing)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use stagehand_core::json::object;
use stagehand_setup::remediation::{STATE_KEY, SUGGEST_ENDPOINT};
use stagehand_setup::{
    AdaptiveRemediationPlugin, Recipe, RunOptions, SetupEvent, SetupOrchestrator, SetupStage,
    SetupTask, TaskError, TaskOutput,
};
use stagehand_telemetry::{
    InMemoryTelemetryStorage, RemediationSuggestion, TelemetryClient, TelemetryEvent,
    TelemetryKnowledgeBase, TelemetryRecorder,
};
use stagehand_toolbus::{InvokeRequest, StatusCode};

fn primed_recorder(retry: bool) -> Arc<TelemetryRecorder> {
    let knowledge = TelemetryKnowledgeBase::new();
    let suggestion = RemediationSuggestion::new("Use the internal mirror")
        .with_commands(["pip config set global.index-url https://mirror.internal"])
        .with_task_override("pip", object([("index_url", json!("https://mirror.internal"))]))
        .with_confidence(0.8)
        .with_retry(retry);
    knowledge.observe(&TelemetryEvent::task(object([
        ("status", json!("failed")),
        ("failure_code", json!("installers:pip:Timeout")),
        ("suggested_remediation", suggestion.to_payload()),
    ])));
    Arc::new(TelemetryRecorder::new(
        Arc::new(InMemoryTelemetryStorage::new()),
        Arc::new(knowledge),
    ))
}

/// `pip` times out until remediation has staged a task override for it.
fn pip_task(calls: &Arc<AtomicU32>) -> SetupTask {
    let calls = Arc::clone(calls);
    SetupTask::new("pip", SetupStage::Installers, move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let index_url = ctx
            .get(STATE_KEY)
            .and_then(|staged| staged.pointer("/task_overrides/pip/index_url"))
            .cloned();
        match index_url {
            Some(url) => Ok(TaskOutput::from(object([("index_url", url)]))),
            None => Err(TaskError::with_kind("Timeout", "pypi.org timed out")),
        }
    })
    .with_max_retries(2)
}

#[test]
fn given_known_failure_when_task_fails_then_remediation_is_staged_and_task_retried() {
    // GIVEN: telemetry history with a retryable fix for this failure
    let dir = tempfile::tempdir().unwrap();
    let telemetry: Arc<dyn TelemetryClient> = primed_recorder(true);
    let mut orchestrator = SetupOrchestrator::builder(dir.path())
        .telemetry(telemetry)
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    orchestrator.register_task(pip_task(&calls)).unwrap();
    assert!(orchestrator.register_plugin(Arc::new(AdaptiveRemediationPlugin::new())));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    orchestrator.subscribe(move |event: &SetupEvent| sink.lock().unwrap().push(event.clone()));

    // WHEN: the recipe runs
    orchestrator
        .run(Recipe::new("default"), RunOptions::default())
        .unwrap();

    // THEN: the second attempt picked up the staged override
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let pip = orchestrator.result("pip").unwrap();
    assert!(pip.is_success());
    assert_eq!(pip.attempts, 2);
    assert_eq!(pip.payload["index_url"], json!("https://mirror.internal"));

    // AND: the repair is recorded as its own successful result
    let applied = orchestrator.result("pip#adaptive-remediation").unwrap();
    assert!(applied.is_success());
    assert_eq!(
        applied.payload["suggested_remediation"]["title"],
        json!("Use the internal mirror")
    );

    // AND: the dashboard saw the prediction and the application
    let statuses: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SetupEvent::Task { task, status, .. } if task == "pip" => Some(status.clone()),
            _ => None,
        })
        .collect();
    assert!(statuses.contains(&"remediation".to_string()));
    assert!(statuses.contains(&"remediation-applied".to_string()));
}

#[test]
fn given_fix_without_retry_when_task_fails_then_failure_stands() {
    // GIVEN: history whose fix does not ask for a retry
    let dir = tempfile::tempdir().unwrap();
    let telemetry: Arc<dyn TelemetryClient> = primed_recorder(false);
    let mut orchestrator = SetupOrchestrator::builder(dir.path())
        .telemetry(telemetry)
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    orchestrator.register_task(pip_task(&calls)).unwrap();
    orchestrator.register_plugin(Arc::new(AdaptiveRemediationPlugin::new()));

    // WHEN: the recipe runs
    orchestrator
        .run(Recipe::new("default"), RunOptions::default())
        .unwrap();

    // THEN: remediation was staged but the task ran only once
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(orchestrator.result("pip").unwrap().is_failed());
    assert!(orchestrator.result("pip#adaptive-remediation").is_some());
}

#[test]
fn given_no_history_when_task_fails_then_nothing_is_applied() {
    // GIVEN: an empty knowledge base
    let dir = tempfile::tempdir().unwrap();
    let telemetry: Arc<dyn TelemetryClient> = Arc::new(TelemetryRecorder::new(
        Arc::new(InMemoryTelemetryStorage::new()),
        Arc::new(TelemetryKnowledgeBase::new()),
    ));
    let mut orchestrator = SetupOrchestrator::builder(dir.path())
        .telemetry(telemetry)
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    orchestrator.register_task(pip_task(&calls)).unwrap();
    orchestrator.register_plugin(Arc::new(AdaptiveRemediationPlugin::new()));

    // WHEN: the recipe runs
    let results = orchestrator
        .run(Recipe::new("default"), RunOptions::default())
        .unwrap();

    // THEN: only the failed attempt is reported
    assert_eq!(results.len(), 1);
    assert!(results[0].is_failed());
    assert!(orchestrator.result("pip#adaptive-remediation").is_none());
}

#[tokio::test]
async fn given_remediation_plugin_when_queried_over_bus_then_suggestion_is_returned() {
    // GIVEN: the plugin registered with telemetry history
    let dir = tempfile::tempdir().unwrap();
    let telemetry: Arc<dyn TelemetryClient> = primed_recorder(true);
    let orchestrator = SetupOrchestrator::builder(dir.path())
        .telemetry(Arc::clone(&telemetry))
        .build();
    orchestrator.register_plugin(Arc::new(
        AdaptiveRemediationPlugin::new().with_telemetry(telemetry),
    ));

    // WHEN: a client asks about a known failure code
    let response = orchestrator
        .tool_bus()
        .invoke(InvokeRequest::new(
            SUGGEST_ENDPOINT,
            json!({"failure_code": "installers:pip:Timeout"}),
        ))
        .await;

    // THEN: the best suggestion comes back
    assert_eq!(response.status, StatusCode::Ok);
    let body = response.json().unwrap();
    assert_eq!(body["suggestion"]["title"], json!("Use the internal mirror"));

    // AND: malformed queries are rejected by the guard
    let malformed = orchestrator
        .tool_bus()
        .invoke(InvokeRequest::new(SUGGEST_ENDPOINT, "{not json"))
        .await;
    assert_eq!(malformed.status, StatusCode::GuardRejected);
}

#[tokio::test]
async fn given_plugin_without_advisor_when_queried_over_bus_then_suggestion_is_null() {
    // GIVEN: the plugin on an orchestrator without telemetry history
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = SetupOrchestrator::new(dir.path());
    orchestrator.register_plugin(Arc::new(AdaptiveRemediationPlugin::new()));

    // WHEN: a client asks about any failure
    let response = orchestrator
        .tool_bus()
        .invoke(InvokeRequest::new(
            SUGGEST_ENDPOINT,
            json!({"failure_code": "installers:pip:Timeout"}),
        ))
        .await;

    // THEN: the call succeeds with no suggestion
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.json().unwrap()["suggestion"], Value::Null);
}
