//! The setup orchestrator.
//!
//! Owns the task registry (through the plugin manager), plans each run,
//! walks the stages in order and journals every attempt so a failed run can
//! be resumed or retried later.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use stagehand_core::{Config, JsonMap, ResultExt};
use stagehand_telemetry::{NullTelemetryClient, TelemetryClient};
use stagehand_toolbus::ToolBus;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::context::{RunServices, StageContext};
use crate::error::{Error, Result};
use crate::events::{DEFAULT_EVENTS_TOPIC, EventHub, ListenerId, SetupEvent};
use crate::journal::{JournalWriter, ResumeRecord, RunRecord, SetupRunJournal, load_journal, load_last_run};
use crate::plan::{ExecutionPlan, build_execution_plan};
use crate::plugins::manifest::{PluginDefinition, ProfileDevSettings};
use crate::plugins::runtime::PluginRuntimeManager;
use crate::plugins::supervisor::WorkerSupervisor;
use crate::plugins::{
    DEFAULT_HOT_RELOAD_INTERVAL, PluginManager, PluginRegistration, SetupPlugin,
};
use crate::recipe::Recipe;
use crate::result::SetupResult;
use crate::runner::{StageRunner, latest_per_task};
use crate::stage::SetupStage;
use crate::task::{SetupTask, TaskRegistry};

/// Journal directory relative to the project root.
pub const DEFAULT_JOURNAL_DIR: &str = "artifacts/setup_runs";

/// Paths and intervals the orchestrator runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub journal_dir: PathBuf,
    pub events_topic: String,
    pub hot_reload_interval: Duration,
}

impl OrchestratorConfig {
    /// Defaults for a project at `root`.
    #[must_use]
    pub fn for_root(root: &Path) -> Self {
        Self {
            journal_dir: root.join(DEFAULT_JOURNAL_DIR),
            events_topic: DEFAULT_EVENTS_TOPIC.to_string(),
            hot_reload_interval: DEFAULT_HOT_RELOAD_INTERVAL,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, root: &Path) -> Self {
        Self {
            journal_dir: config.journal_dir(root),
            events_topic: config.tool_bus.events_topic.clone(),
            hot_reload_interval: Duration::from_millis(config.hot_reload.interval_ms),
        }
    }
}

/// Arguments to [`SetupOrchestrator::run`]. Empty filters select everything.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub stages: Vec<SetupStage>,
    pub task_names: Vec<String>,
    /// `Some` (even empty) replaces the loaded plugins with this manifest.
    pub plugins: Option<Vec<PluginDefinition>>,
    pub dev: Option<ProfileDevSettings>,
}

impl RunOptions {
    #[must_use]
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = SetupStage>) -> Self {
        self.stages = stages.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_tasks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_names = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_plugins(mut self, plugins: Vec<PluginDefinition>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    #[must_use]
    pub fn with_dev(mut self, dev: ProfileDevSettings) -> Self {
        self.dev = Some(dev);
        self
    }
}

/// Arguments to [`SetupOrchestrator::retry`].
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub task_names: Vec<String>,
    pub stages: Vec<SetupStage>,
    /// Used instead of the last recipe when given.
    pub recipe: Option<Recipe>,
}

#[derive(Debug, Clone)]
struct ResumeState {
    journal: PathBuf,
    completed: HashMap<String, SetupResult>,
}

/// Builder for a [`SetupOrchestrator`] with injected services.
pub struct OrchestratorBuilder {
    root: PathBuf,
    config: Option<OrchestratorConfig>,
    tool_bus: Option<Arc<ToolBus>>,
    telemetry: Option<Arc<dyn TelemetryClient>>,
    supervisor: Option<Arc<dyn WorkerSupervisor>>,
    runtimes: Option<Vec<Arc<dyn PluginRuntimeManager>>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn tool_bus(mut self, tool_bus: Arc<ToolBus>) -> Self {
        self.tool_bus = Some(tool_bus);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryClient>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn supervisor(mut self, supervisor: Arc<dyn WorkerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    #[must_use]
    pub fn runtimes(mut self, runtimes: Vec<Arc<dyn PluginRuntimeManager>>) -> Self {
        self.runtimes = Some(runtimes);
        self
    }

    #[must_use]
    pub fn build(self) -> SetupOrchestrator {
        let config = self
            .config
            .unwrap_or_else(|| OrchestratorConfig::for_root(&self.root));
        let tool_bus = self.tool_bus.unwrap_or_else(|| Arc::new(ToolBus::new()));
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(NullTelemetryClient));

        let mut manager = PluginManager::new(
            TaskRegistry::shared(),
            Arc::clone(&tool_bus),
            Arc::clone(&telemetry),
        )
        .with_hot_reload_interval(config.hot_reload_interval);
        if let Some(supervisor) = self.supervisor {
            manager = manager.with_supervisor(supervisor);
        }
        if let Some(runtimes) = self.runtimes {
            manager = manager.with_runtimes(runtimes);
        }
        let services =
            RunServices::assemble(tool_bus, telemetry, Arc::new(manager), &config.events_topic);

        SetupOrchestrator {
            root: self.root,
            config,
            services,
            results: HashMap::new(),
            last_recipe: None,
            last_plugins: None,
            last_dev: None,
            resume: None,
            last_journal: None,
        }
    }
}

/// Coordinates the execution of setup stages.
pub struct SetupOrchestrator {
    root: PathBuf,
    config: OrchestratorConfig,
    services: RunServices,
    results: HashMap<String, SetupResult>,
    last_recipe: Option<Recipe>,
    last_plugins: Option<Vec<PluginDefinition>>,
    last_dev: Option<ProfileDevSettings>,
    resume: Option<ResumeState>,
    last_journal: Option<SetupRunJournal>,
}

impl SetupOrchestrator {
    /// An orchestrator with a private tool bus and no telemetry.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::builder(root).build()
    }

    pub fn builder(root: impl Into<PathBuf>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            root: root.into(),
            config: None,
            tool_bus: None,
            telemetry: None,
            supervisor: None,
            runtimes: None,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`Error::DuplicateTask`] if the name is taken.
    pub fn register_task(&self, task: SetupTask) -> Result<()> {
        self.services
            .plugins
            .task_registry()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(task)
    }

    /// Register several tasks, stopping at the first duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTask`] for the first name already taken.
    pub fn register_tasks(&self, tasks: impl IntoIterator<Item = SetupTask>) -> Result<()> {
        tasks
            .into_iter()
            .try_for_each(|task| self.register_task(task))
    }

    /// Registered tasks in declaration order.
    #[must_use]
    pub fn tasks(&self) -> Vec<SetupTask> {
        self.services
            .plugins
            .task_registry()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Returns whether the plugin was registered.
    pub fn register_plugin(&self, plugin: Arc<dyn SetupPlugin>) -> bool {
        self.services.plugins.register_plugin(plugin)
    }

    pub fn register_plugin_with(
        &self,
        plugin: Arc<dyn SetupPlugin>,
        registration: PluginRegistration,
    ) -> bool {
        self.services.plugins.register_with(plugin, registration)
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    #[must_use]
    pub fn plugin_manager(&self) -> &Arc<PluginManager> {
        &self.services.plugins
    }

    #[must_use]
    pub fn tool_bus(&self) -> &Arc<ToolBus> {
        &self.services.tool_bus
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventHub> {
        &self.services.events
    }

    #[must_use]
    pub fn telemetry(&self) -> &Arc<dyn TelemetryClient> {
        &self.services.telemetry
    }

    #[must_use]
    pub const fn services(&self) -> &RunServices {
        &self.services
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SetupEvent) + Send + Sync + 'static,
    {
        self.services.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.services.events.unsubscribe(id)
    }

    pub fn replay_events(&self, events: impl IntoIterator<Item = SetupEvent>) {
        self.services.events.replay_events(events);
    }

    // ------------------------------------------------------------------
    // Results and journals
    // ------------------------------------------------------------------

    /// Latest result per task from the last run, resumed ones included.
    #[must_use]
    pub const fn results(&self) -> &HashMap<String, SetupResult> {
        &self.results
    }

    #[must_use]
    pub fn result(&self, task: &str) -> Option<&SetupResult> {
        self.results.get(task)
    }

    /// The journal written by the last run, read back from disk.
    #[must_use]
    pub const fn last_journal(&self) -> Option<&SetupRunJournal> {
        self.last_journal.as_ref()
    }

    /// Prime the next run with the successful tasks of `journal`, or clear
    /// any priming with `None`.
    pub fn resume_from_journal(&mut self, journal: Option<&SetupRunJournal>) {
        self.resume = journal.map(|journal| {
            let completed = journal.successful_results();
            debug!(
                path = %journal.path.display(),
                completed = completed.len(),
                "Priming run from journal"
            );
            ResumeState {
                journal: journal.path.clone(),
                completed,
            }
        });
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Run `recipe` and return every result in execution order.
    ///
    /// # Errors
    ///
    /// Fails when no tasks are registered, the plan is invalid, the manifest
    /// cannot be loaded, the journal cannot be written or a plugin fails to
    /// start. Resume priming is consumed either way.
    pub fn run(&mut self, recipe: Recipe, options: RunOptions) -> Result<Vec<SetupResult>> {
        let resume = self.resume.take();

        if let Some(definitions) = options.plugins.as_deref() {
            self.services
                .plugins
                .load_from_manifest(definitions, options.dev.as_ref())?;
        }
        self.last_plugins.clone_from(&options.plugins);
        if options.plugins.is_some() {
            self.last_dev.clone_from(&options.dev);
        }
        self.last_recipe = Some(recipe.clone());

        let tasks = self.tasks();
        if tasks.is_empty() {
            return Err(Error::NoTasks);
        }
        let stage_filter: HashSet<SetupStage> = options.stages.iter().copied().collect();
        let task_filter: HashSet<String> = options.task_names.iter().cloned().collect();
        let plan = build_execution_plan(&tasks, &stage_filter, &task_filter)?;

        let run_id = Ulid::new().to_string();
        let plugin_ids: Option<Vec<String>> = options
            .plugins
            .as_ref()
            .map(|defs| defs.iter().map(|d| d.identifier.clone()).collect());
        let mut journal =
            self.open_journal(&run_id, &recipe, &options, plugin_ids.clone(), resume.as_ref())?;

        let mut run_metadata = JsonMap::new();
        run_metadata.insert("run_id".into(), json!(run_id));
        run_metadata.insert("recipe".into(), json!(recipe.name));
        let stage_names: Vec<&str> = SetupStage::ORDER.iter().map(|s| s.as_str()).collect();
        run_metadata.insert("stages".into(), json!(stage_names));
        run_metadata.insert("task_count".into(), json!(tasks.len()));
        if let Some(ids) = &plugin_ids {
            run_metadata.insert("plugins".into(), json!(ids));
        }
        self.services.telemetry.record_run(run_metadata);
        info!(run_id = %run_id, recipe = %recipe.name, tasks = tasks.len(), "Setup run started");

        let mut ctx = StageContext::new(self.root.clone(), recipe, self.services.clone());
        let mut resume_pending = HashSet::new();
        if let Some(resume) = resume {
            resume_pending = resume.completed.keys().cloned().collect();
            ctx.results = resume.completed;
        }

        let allow_fail: HashMap<String, bool> = tasks
            .iter()
            .map(|t| (t.name.clone(), t.allow_fail))
            .collect();
        let walk = StageWalk {
            plan: &plan,
            stage_filter: &stage_filter,
            allow_fail: &allow_fail,
        };
        let mut results = Vec::new();
        let outcome = walk.run(&self.services, &mut journal, &mut resume_pending, &mut ctx, &mut results);

        let journal_path = journal.path().to_path_buf();
        drop(journal);
        self.last_journal = load_journal(&journal_path).into_option_logged("reload run journal");
        self.results = ctx.results;
        info!(run_id = %run_id, results = results.len(), ok = outcome.is_ok(), "Setup run finished");
        outcome.map(|()| results)
    }

    /// Run again with the last recipe, an explicit one, or the recipe stored
    /// in the newest journal (which also primes resumption).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPriorRun`] when no recipe can be found, and any
    /// error of [`run`](Self::run).
    pub fn retry(&mut self, options: RetryOptions) -> Result<Vec<SetupResult>> {
        let recipe = match options.recipe.or_else(|| self.last_recipe.clone()) {
            Some(recipe) => recipe,
            None => {
                let journal = load_last_run(&self.config.journal_dir).ok_or(Error::NoPriorRun)?;
                let recipe = journal.to_recipe().ok_or(Error::NoPriorRun)?;
                self.resume_from_journal(Some(&journal));
                self.last_journal = Some(journal);
                recipe
            }
        };
        let run_options = RunOptions {
            stages: options.stages,
            task_names: options.task_names,
            plugins: self.last_plugins.clone(),
            dev: self.last_dev.clone(),
        };
        self.run(recipe, run_options)
    }

    /// Retry a single stage.
    ///
    /// # Errors
    ///
    /// See [`retry`](Self::retry).
    pub fn rerun_stage(&mut self, stage: SetupStage) -> Result<Vec<SetupResult>> {
        self.retry(RetryOptions {
            stages: vec![stage],
            ..RetryOptions::default()
        })
    }

    /// Tear down plugins and flush telemetry.
    pub fn shutdown(&self) {
        self.services.plugins.clear();
        if let Err(err) = self.services.telemetry.flush() {
            warn!(error = %err, "Telemetry flush failed");
        }
    }

    fn open_journal(
        &self,
        run_id: &str,
        recipe: &Recipe,
        options: &RunOptions,
        plugins: Option<Vec<String>>,
        resume: Option<&ResumeState>,
    ) -> Result<JournalWriter> {
        let now = Utc::now();
        if let Some(resume) = resume.filter(|r| r.journal.exists()) {
            return JournalWriter::resume(
                &resume.journal,
                ResumeRecord {
                    run_id: run_id.to_string(),
                    timestamp: now,
                    stages: options.stages.clone(),
                    tasks: options.task_names.clone(),
                },
            );
        }
        JournalWriter::create(
            &self.config.journal_dir,
            RunRecord {
                run_id: run_id.to_string(),
                timestamp: now,
                recipe_name: recipe.name.clone(),
                recipe: recipe.as_dict(),
                stages: options.stages.clone(),
                tasks: options.task_names.clone(),
                plugins,
                recipe_source: recipe.source.as_ref().map(|p| p.display().to_string()),
            },
        )
    }
}

/// The stage loop of one run.
struct StageWalk<'p> {
    plan: &'p ExecutionPlan,
    stage_filter: &'p HashSet<SetupStage>,
    allow_fail: &'p HashMap<String, bool>,
}

impl StageWalk<'_> {
    fn run(
        &self,
        services: &RunServices,
        journal: &mut JournalWriter,
        resume_pending: &mut HashSet<String>,
        ctx: &mut StageContext,
        results: &mut Vec<SetupResult>,
    ) -> Result<()> {
        let continue_on_failure = ctx.recipe.continue_on_failure();
        for stage in SetupStage::ORDER {
            if !self.stage_filter.is_empty() && !self.stage_filter.contains(&stage) {
                continue;
            }
            let stage_tasks = self.plan.get(&stage).map(Vec::as_slice).unwrap_or_default();
            if stage_tasks.is_empty() {
                let payload = JsonMap::from_iter([("reason".to_string(), json!("no tasks"))]);
                ctx.publish(&SetupEvent::stage(stage, "skipped", payload));
                continue;
            }

            let started_at = Utc::now();
            let stage_results = match StageRunner::new(services, journal, resume_pending, stage)
                .run(stage_tasks, ctx)
            {
                Ok(stage_results) => stage_results,
                Err(err) => {
                    Self::abort_stage(services, stage, started_at, &err, ctx);
                    return Err(err);
                }
            };
            // Remediation results are not registered tasks and never block.
            let blocking = latest_per_task(&stage_results)
                .iter()
                .any(|r| r.is_failed() && self.allow_fail.get(&r.task) == Some(&false));
            results.extend(stage_results);
            if blocking && !continue_on_failure {
                info!(stage = %stage, "Halting run after failed stage");
                break;
            }
        }
        Ok(())
    }

    fn abort_stage(
        services: &RunServices,
        stage: SetupStage,
        started_at: chrono::DateTime<Utc>,
        err: &Error,
        ctx: &StageContext,
    ) {
        let error = err.to_string();
        let payload = JsonMap::from_iter([("error".to_string(), json!(error))]);
        ctx.publish(&SetupEvent::stage(stage, "failed", payload));

        let duration_ms =
            u64::try_from(Utc::now().signed_duration_since(started_at).num_milliseconds()).unwrap_or(0);
        let mut telemetry = JsonMap::new();
        telemetry.insert("stage".into(), json!(stage.as_str()));
        telemetry.insert("status".into(), json!("failed"));
        telemetry.insert("duration_ms".into(), json!(duration_ms));
        telemetry.insert(
            "failure_code".into(),
            json!(format!("{stage}:exception:{}", err.kind_name())),
        );
        telemetry.insert("error".into(), json!(error));
        services.telemetry.record_stage(telemetry);
        warn!(stage = %stage, error = %err, "Stage aborted");
    }
}
