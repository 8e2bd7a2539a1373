//! Journaling, resumption and retry across orchestrator instances.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::indexing_slicing)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use stagehand_setup::{
    Error, Recipe, RetryOptions, RunOptions, SetupEvent, SetupOrchestrator, SetupStage,
    SetupTask, TaskError, TaskOutput, load_journal, load_last_run,
};

/// Registers `detect` (counting calls) and `install`, which fails while
/// `broken` is set.
fn register(orchestrator: &SetupOrchestrator, detections: &Arc<AtomicU32>, broken: &Arc<AtomicBool>) {
    let detections = Arc::clone(detections);
    let broken = Arc::clone(broken);
    orchestrator
        .register_tasks([
            SetupTask::new("detect", SetupStage::Preflight, move |_| {
                detections.fetch_add(1, Ordering::SeqCst);
                Ok(TaskOutput::from(stagehand_core::json::object([(
                    "python",
                    json!("3.12"),
                )])))
            }),
            SetupTask::new("install", SetupStage::Installers, move |_| {
                if broken.load(Ordering::SeqCst) {
                    Err(TaskError::with_kind("Network", "mirror unreachable"))
                } else {
                    Ok(TaskOutput::empty())
                }
            })
            .depends_on("detect"),
        ])
        .unwrap();
}

fn journal_dir(root: &Path) -> std::path::PathBuf {
    root.join("artifacts/setup_runs")
}

#[test]
fn given_completed_run_when_journal_loaded_then_header_and_attempts_are_recorded() {
    // GIVEN: a run that fails in the installers stage
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = SetupOrchestrator::new(dir.path());
    let detections = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(true));
    register(&orchestrator, &detections, &broken);

    // WHEN: it runs
    orchestrator
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();

    // THEN: the journal on disk holds the header and one record per attempt
    let journal = orchestrator.last_journal().unwrap();
    assert!(journal.path.starts_with(journal_dir(dir.path())));
    assert_eq!(journal.recipe_name(), Some("workstation"));
    assert_eq!(journal.results.len(), 2);
    let header = journal.header().unwrap();
    assert!(!header.run_id.is_empty());
    assert_eq!(journal.successful_results().len(), 1);
    assert!(journal.successful_results().contains_key("detect"));

    let reloaded = load_journal(&journal.path).unwrap();
    assert_eq!(&reloaded, journal);
}

#[test]
fn given_journal_when_resumed_then_completed_tasks_are_not_rerun() {
    // GIVEN: a first run where install failed
    let dir = tempfile::tempdir().unwrap();
    let detections = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(true));
    let mut first = SetupOrchestrator::new(dir.path());
    register(&first, &detections, &broken);
    first
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();
    let journal = first.last_journal().unwrap().clone();

    // WHEN: a fresh orchestrator resumes from that journal after the fix
    broken.store(false, Ordering::SeqCst);
    let mut second = SetupOrchestrator::new(dir.path());
    register(&second, &detections, &broken);
    second.resume_from_journal(Some(&journal));
    let results = second
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();

    // THEN: detect is replayed from the journal and install finally succeeds
    assert_eq!(detections.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 2);
    assert_eq!(second.result("detect"), journal.successful_results().get("detect"));
    assert!(second.result("install").unwrap().is_success());

    // AND: the same journal file was extended, not a new one created
    let extended = second.last_journal().unwrap();
    assert_eq!(extended.path, journal.path);
    assert_eq!(extended.results.len(), 3);
    assert!(extended.successful_results().contains_key("install"));
}

#[test]
fn given_resume_cleared_when_run_then_everything_runs_again() {
    // GIVEN: a primed orchestrator whose priming is then cleared
    let dir = tempfile::tempdir().unwrap();
    let detections = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(false));
    let mut orchestrator = SetupOrchestrator::new(dir.path());
    register(&orchestrator, &detections, &broken);
    orchestrator
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();
    let journal = orchestrator.last_journal().unwrap().clone();
    orchestrator.resume_from_journal(Some(&journal));
    orchestrator.resume_from_journal(None);

    // WHEN: it runs again
    orchestrator
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();

    // THEN: detect ran twice and a second journal exists
    assert_eq!(detections.load(Ordering::SeqCst), 2);
    assert_ne!(orchestrator.last_journal().unwrap().path, journal.path);
}

#[test]
fn given_prior_journal_when_fresh_orchestrator_retries_then_recipe_and_progress_are_restored() {
    // GIVEN: a failed run journaled by another process
    let dir = tempfile::tempdir().unwrap();
    let detections = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(true));
    let recipe = Recipe::new("workstation").with_config("channel", json!("stable"));
    {
        let mut first = SetupOrchestrator::new(dir.path());
        register(&first, &detections, &broken);
        first.run(recipe.clone(), RunOptions::default()).unwrap();
    }
    assert!(load_last_run(&journal_dir(dir.path())).is_some());

    // WHEN: a new orchestrator retries without a recipe
    broken.store(false, Ordering::SeqCst);
    let mut second = SetupOrchestrator::new(dir.path());
    register(&second, &detections, &broken);
    let results = second.retry(RetryOptions::default()).unwrap();

    // THEN: the journaled recipe is reused and only the failed task re-ran
    assert_eq!(results.len(), 2);
    assert_eq!(detections.load(Ordering::SeqCst), 1);
    assert!(second.result("install").unwrap().is_success());
    let journal = second.last_journal().unwrap();
    let restored = journal.to_recipe().unwrap();
    assert_eq!(restored.name, "workstation");
    assert_eq!(restored.config()["channel"], json!("stable"));
}

#[test]
fn given_no_history_when_retry_then_no_prior_run() {
    // GIVEN: an orchestrator that never ran, with an empty journal directory
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = SetupOrchestrator::new(dir.path());

    // WHEN: retry is requested
    let err = orchestrator.retry(RetryOptions::default()).unwrap_err();

    // THEN: there is nothing to retry
    assert!(matches!(err, Error::NoPriorRun));
}

#[test]
fn given_previous_run_when_rerun_stage_then_only_that_stage_executes() {
    // GIVEN: a successful run across two stages
    let dir = tempfile::tempdir().unwrap();
    let detections = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(false));
    let mut orchestrator = SetupOrchestrator::new(dir.path());
    register(&orchestrator, &detections, &broken);
    orchestrator
        .register_task(SetupTask::new("smoke", SetupStage::Verification, |_| {
            Ok(TaskOutput::empty())
        }))
        .unwrap();
    orchestrator
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();

    // WHEN: verification alone is re-run
    let results = orchestrator.rerun_stage(SetupStage::Verification).unwrap();

    // THEN: only smoke ran again
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task, "smoke");
    assert_eq!(detections.load(Ordering::SeqCst), 1);
}

#[test]
fn given_journal_when_replayed_then_listeners_see_stage_and_task_events() {
    // GIVEN: a journaled run and a listener
    let dir = tempfile::tempdir().unwrap();
    let detections = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(true));
    let mut orchestrator = SetupOrchestrator::new(dir.path());
    register(&orchestrator, &detections, &broken);
    orchestrator
        .run(Recipe::new("workstation"), RunOptions::default())
        .unwrap();
    let events = orchestrator.last_journal().unwrap().iter_events();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orchestrator.subscribe(move |event: &SetupEvent| {
        sink.lock().unwrap().push((event.type_name(), event.status().map(str::to_string)));
    });

    // WHEN: the journal's events are replayed
    orchestrator.replay_events(events);

    // THEN: each stage is bracketed by stage events around its tasks
    let seen = seen.lock().unwrap();
    let statuses: Vec<(&str, Option<&str>)> =
        seen.iter().map(|(kind, status)| (*kind, status.as_deref())).collect();
    assert_eq!(
        statuses,
        vec![
            ("StageEvent", Some("started")),
            ("TaskEvent", Some("completed")),
            ("StageEvent", Some("completed")),
            ("StageEvent", Some("started")),
            ("TaskEvent", Some("failed")),
            ("StageEvent", Some("failed")),
        ]
    );
}
