//! Plugin handles, atomic registration and supervised hook dispatch.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use stagehand_core::JsonMap;
use stagehand_telemetry::TelemetryClient;
use stagehand_toolbus::ToolBus;
use tracing::{debug, info, warn};

use super::hot_reload::HotReloadController;
use super::manifest::{PluginDefinition, ProfileDevSettings};
use super::registrar::{Contributions, PluginRegistrar};
use super::runtime::{NativeRuntimeManager, PluginRuntimeManager, PluginWorker};
use super::supervisor::{
    InProcessSupervisor, PluginMetrics, SupervisorError, WorkerDiagnostics, WorkerSupervisor,
};
use super::{PluginError, SetupPlugin};
use crate::context::StageContext;
use crate::error::{Error, Result};
use crate::result::{SetupResult, TaskError};
use crate::stage::SetupStage;
use crate::task::{SetupTask, SharedTaskRegistry, panic_message};
use crate::validators::{ContinuousValidator, HookResult, ProgressColumn, Reporter, Validator};

/// Default hot-reload poll interval.
pub const DEFAULT_HOT_RELOAD_INTERVAL: Duration = Duration::from_secs(1);

/// Optional bookkeeping passed along with a plugin object.
#[derive(Clone, Default)]
pub struct PluginRegistration {
    /// Overrides the definition identifier and the plugin's name.
    pub id: Option<String>,
    pub definition: Option<PluginDefinition>,
    pub runtime: Option<Arc<dyn PluginRuntimeManager>>,
    pub worker: Option<Arc<dyn PluginWorker>>,
}

impl PluginRegistration {
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_definition(mut self, definition: PluginDefinition) -> Self {
        self.definition = Some(definition);
        self
    }
}

/// One registered plugin and everything it contributed.
#[derive(Clone)]
pub struct PluginHandle {
    pub identifier: String,
    pub plugin: Arc<dyn SetupPlugin>,
    pub definition: Option<PluginDefinition>,
    pub runtime: Option<Arc<dyn PluginRuntimeManager>>,
    pub worker: Option<Arc<dyn PluginWorker>>,
    pub validators: Vec<Arc<dyn Validator>>,
    pub reporters: Vec<Arc<dyn Reporter>>,
    pub progress_columns: Vec<Arc<dyn ProgressColumn>>,
    pub continuous_validators: Vec<Arc<dyn ContinuousValidator>>,
    pub tasks: Vec<String>,
    pub endpoints: Vec<String>,
    pub disabled: bool,
    pub last_diagnostics: Option<JsonMap>,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("identifier", &self.identifier)
            .field("runtime", &self.runtime.as_ref().map(|r| r.name().to_string()))
            .field("validators", &self.validators.len())
            .field("reporters", &self.reporters.len())
            .field("progress_columns", &self.progress_columns.len())
            .field("continuous_validators", &self.continuous_validators.len())
            .field("tasks", &self.tasks)
            .field("endpoints", &self.endpoints)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

/// A hook failure the supervisor reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginViolation {
    pub plugin: String,
    pub hook: String,
    pub reason: String,
    pub diagnostics: Option<JsonMap>,
    /// Fatal violations abort the run instead of disabling the plugin.
    pub fatal: bool,
}

struct Owned<T: ?Sized> {
    owner: String,
    entry: Arc<T>,
}

/// State a handle keeps across an in-place swap.
#[derive(Clone, Default)]
struct Carried {
    disabled: bool,
    last_diagnostics: Option<JsonMap>,
}

fn tag<T: ?Sized>(owner: &str, entries: &[Arc<T>]) -> impl Iterator<Item = Owned<T>> {
    entries.iter().map(move |entry| Owned {
        owner: owner.to_string(),
        entry: Arc::clone(entry),
    })
}

#[derive(Default)]
struct ManagerState {
    handles: Vec<PluginHandle>,
    validators: Vec<Owned<dyn Validator>>,
    reporters: Vec<Owned<dyn Reporter>>,
    progress_columns: Vec<Owned<dyn ProgressColumn>>,
    continuous_validators: Vec<Owned<dyn ContinuousValidator>>,
    violations: Vec<PluginViolation>,
    definitions: BTreeMap<String, PluginDefinition>,
    workers: HashMap<String, Arc<dyn PluginWorker>>,
    profile_dev: Option<ProfileDevSettings>,
}

impl ManagerState {
    fn handle(&self, id: &str) -> Option<&PluginHandle> {
        self.handles.iter().find(|h| h.identifier == id)
    }

    fn is_disabled(&self, id: &str) -> bool {
        self.handle(id).is_some_and(|h| h.disabled)
    }

    fn enabled<T: ?Sized>(&self, list: &[Owned<T>]) -> Vec<Arc<T>> {
        list.iter()
            .filter(|owned| !self.is_disabled(&owned.owner))
            .map(|owned| Arc::clone(&owned.entry))
            .collect()
    }

    fn take_handle(&mut self, id: &str) -> Option<PluginHandle> {
        let index = self.handles.iter().position(|h| h.identifier == id)?;
        let handle = self.handles.remove(index);
        self.validators.retain(|o| o.owner != id);
        self.reporters.retain(|o| o.owner != id);
        self.progress_columns.retain(|o| o.owner != id);
        self.continuous_validators.retain(|o| o.owner != id);
        Some(handle)
    }
}

/// Owns plugin handles and routes lifecycle hooks to them.
pub struct PluginManager {
    state: Mutex<ManagerState>,
    tasks: SharedTaskRegistry,
    tool_bus: Arc<ToolBus>,
    telemetry: Arc<dyn TelemetryClient>,
    supervisor: Arc<dyn WorkerSupervisor>,
    runtimes: Vec<Arc<dyn PluginRuntimeManager>>,
    hot_reload: Mutex<Option<Arc<HotReloadController>>>,
    hot_reload_interval: Duration,
}

impl PluginManager {
    pub fn new(
        tasks: SharedTaskRegistry,
        tool_bus: Arc<ToolBus>,
        telemetry: Arc<dyn TelemetryClient>,
    ) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            tasks,
            tool_bus,
            telemetry,
            supervisor: Arc::new(InProcessSupervisor::new()),
            runtimes: vec![Arc::new(NativeRuntimeManager::new())],
            hot_reload: Mutex::new(None),
            hot_reload_interval: DEFAULT_HOT_RELOAD_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn WorkerSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replace the runtime list. The first manager that supports a
    /// definition wins.
    #[must_use]
    pub fn with_runtimes(mut self, runtimes: Vec<Arc<dyn PluginRuntimeManager>>) -> Self {
        self.runtimes = runtimes;
        self
    }

    #[must_use]
    pub fn with_hot_reload_interval(mut self, interval: Duration) -> Self {
        self.hot_reload_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn task_registry(&self) -> &SharedTaskRegistry {
        &self.tasks
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a plugin under its own name. Returns whether it was kept.
    pub fn register_plugin(&self, plugin: Arc<dyn SetupPlugin>) -> bool {
        self.register_with(plugin, PluginRegistration::default())
    }

    /// Register a plugin, replacing any handle with the same identifier.
    ///
    /// A failing `register`, a task name collision or an endpoint collision
    /// is logged and leaves no trace of the plugin.
    pub fn register_with(&self, plugin: Arc<dyn SetupPlugin>, registration: PluginRegistration) -> bool {
        let identifier = registration
            .id
            .clone()
            .or_else(|| registration.definition.as_ref().map(|d| d.identifier.clone()))
            .unwrap_or_else(|| plugin.name().to_string());
        self.remove_plugin(&identifier);

        let contributions = match Self::collect(&identifier, plugin.as_ref(), registration.definition.as_ref()) {
            Ok(contributions) => contributions,
            Err(err) => {
                warn!(plugin = %identifier, error = %err, "Plugin register() failed");
                return false;
            }
        };

        match self.commit(&identifier, plugin, registration, contributions, None) {
            Ok(()) => true,
            Err(err) => {
                warn!(plugin = %identifier, error = %err, "Plugin registration rolled back");
                false
            }
        }
    }

    fn collect(
        identifier: &str,
        plugin: &dyn SetupPlugin,
        definition: Option<&PluginDefinition>,
    ) -> std::result::Result<Contributions, PluginError> {
        let mut registrar = PluginRegistrar::new(identifier, plugin);
        catch_unwind(AssertUnwindSafe(|| plugin.register(&mut registrar)))
            .unwrap_or_else(|panic| {
                Err(PluginError::failed(format!(
                    "panicked: {}",
                    panic_message(panic.as_ref())
                )))
            })?;
        if let Some(definition) = definition {
            registrar.wire_bindings(&definition.toolbus)?;
        }
        Ok(registrar.finish())
    }

    fn commit(
        &self,
        identifier: &str,
        plugin: Arc<dyn SetupPlugin>,
        registration: PluginRegistration,
        contributions: Contributions,
        carried: Option<Carried>,
    ) -> Result<()> {
        let Contributions {
            tasks,
            validators,
            reporters,
            progress_columns,
            continuous_validators,
            endpoints,
        } = contributions;

        let task_names = self.register_tasks(tasks)?;
        let endpoint_names = match self.tool_bus.register_worker(identifier, endpoints) {
            Ok(names) => names,
            Err(err) => {
                self.unregister_tasks(&task_names);
                return Err(err.into());
            }
        };
        // A swapped handle keeps its supervisor entry and the metrics in it.
        if carried.is_none() {
            self.supervisor
                .register(identifier, registration.definition.as_ref());
        }
        let carried = carried.unwrap_or_default();

        info!(
            plugin = %identifier,
            tasks = task_names.len(),
            endpoints = endpoint_names.len(),
            validators = validators.len(),
            "Registered plugin"
        );

        let mut state = self.lock();
        state.validators.extend(tag(identifier, &validators));
        state.reporters.extend(tag(identifier, &reporters));
        state.progress_columns.extend(tag(identifier, &progress_columns));
        state
            .continuous_validators
            .extend(tag(identifier, &continuous_validators));
        if let Some(worker) = &registration.worker {
            state
                .workers
                .insert(identifier.to_string(), Arc::clone(worker));
        }
        state.handles.push(PluginHandle {
            identifier: identifier.to_string(),
            plugin,
            definition: registration.definition,
            runtime: registration.runtime,
            worker: registration.worker,
            validators,
            reporters,
            progress_columns,
            continuous_validators,
            tasks: task_names,
            endpoints: endpoint_names,
            disabled: carried.disabled,
            last_diagnostics: carried.last_diagnostics,
        });
        Ok(())
    }

    fn register_tasks(&self, tasks: Vec<SetupTask>) -> Result<Vec<String>> {
        let mut registry = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::with_capacity(tasks.len());
        for task in tasks {
            let name = task.name.clone();
            if let Err(err) = registry.register(task) {
                added.iter().for_each(|n: &String| {
                    registry.remove(n);
                });
                return Err(err);
            }
            added.push(name);
        }
        Ok(added)
    }

    fn unregister_tasks(&self, names: &[String]) {
        let mut registry = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        names.iter().for_each(|n| {
            registry.remove(n);
        });
    }

    /// Take a handle out and release its tasks and endpoints. The
    /// supervisor entry is left alone.
    fn detach(&self, identifier: &str) -> Option<PluginHandle> {
        let handle = self.lock().take_handle(identifier)?;
        self.unregister_tasks(&handle.tasks);
        handle.endpoints.iter().for_each(|name| {
            self.tool_bus.unregister(name);
        });
        Some(handle)
    }

    /// Drop a handle and everything it owns. Returns whether it existed.
    pub fn remove_plugin(&self, identifier: &str) -> bool {
        if self.detach(identifier).is_none() {
            return false;
        }
        self.supervisor.unregister(identifier);
        debug!(plugin = identifier, "Removed plugin handle");
        true
    }

    /// Replace the plugin object behind an existing handle.
    ///
    /// The disabled flag, the last diagnostics and the supervisor metrics
    /// survive the swap. When the new object fails to register, the old one
    /// is put back and `false` is returned.
    fn swap_plugin(&self, identifier: &str, plugin: Arc<dyn SetupPlugin>, registration: PluginRegistration) -> bool {
        let carried = self.lock().handle(identifier).map(|handle| Carried {
            disabled: handle.disabled,
            last_diagnostics: handle.last_diagnostics.clone(),
        });
        let Some(carried) = carried else {
            return self.register_with(plugin, registration);
        };

        let contributions = match Self::collect(identifier, plugin.as_ref(), registration.definition.as_ref()) {
            Ok(contributions) => contributions,
            Err(err) => {
                warn!(plugin = %identifier, error = %err, "Plugin register() failed; keeping previous instance");
                return false;
            }
        };

        let Some(previous) = self.detach(identifier) else {
            return false;
        };
        let err = match self.commit(identifier, plugin, registration, contributions, Some(carried.clone())) {
            Ok(()) => return true,
            Err(err) => err,
        };
        warn!(plugin = %identifier, error = %err, "Plugin swap rolled back; restoring previous instance");

        let restore = PluginRegistration {
            id: Some(identifier.to_string()),
            definition: previous.definition,
            runtime: previous.runtime,
            worker: previous.worker,
        };
        match Self::collect(identifier, previous.plugin.as_ref(), restore.definition.as_ref()) {
            Ok(contributions) => {
                if let Err(err) = self.commit(identifier, previous.plugin, restore, contributions, Some(carried)) {
                    warn!(plugin = %identifier, error = %err, "Failed to restore previous plugin instance");
                }
            }
            Err(err) => {
                warn!(plugin = %identifier, error = %err, "Failed to restore previous plugin instance");
            }
        }
        false
    }

    /// Shut down workers, stop hot reload and drop every handle.
    pub fn clear(&self) {
        let (ids, workers) = {
            let mut state = self.lock();
            let ids: Vec<String> = state.handles.iter().map(|h| h.identifier.clone()).collect();
            let workers: Vec<_> = state.workers.drain().map(|(_, w)| w).collect();
            state.definitions.clear();
            state.profile_dev = None;
            (ids, workers)
        };
        workers.iter().for_each(|worker| worker.shutdown());
        ids.iter().for_each(|id| {
            self.remove_plugin(id);
        });
        self.supervisor.clear();
        let controller = self
            .hot_reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(controller) = controller {
            controller.stop();
        }
    }

    // ------------------------------------------------------------------
    // Manifest and runtimes
    // ------------------------------------------------------------------

    fn resolve_runtime(&self, definition: &PluginDefinition) -> Result<Arc<dyn PluginRuntimeManager>> {
        self.runtimes
            .iter()
            .find(|runtime| runtime.supports(definition))
            .cloned()
            .ok_or_else(|| Error::unsupported_runtime(&definition.identifier, &definition.runtime.kind))
    }

    /// Replace every plugin with workers built from `definitions`.
    ///
    /// # Errors
    ///
    /// Fails when no runtime supports a definition or a worker cannot start.
    /// Plugins loaded before the failure stay registered.
    pub fn load_from_manifest(
        self: &Arc<Self>,
        definitions: &[PluginDefinition],
        dev: Option<&ProfileDevSettings>,
    ) -> Result<()> {
        self.clear();
        {
            let mut state = self.lock();
            state.profile_dev = dev.cloned();
            state.definitions = definitions
                .iter()
                .map(|d| (d.identifier.clone(), d.clone()))
                .collect();
        }
        for definition in definitions {
            let runtime = self.resolve_runtime(definition)?;
            let worker = runtime.create_worker(definition)?;
            let registration = PluginRegistration {
                id: Some(definition.identifier.clone()),
                definition: Some(definition.clone()),
                runtime: Some(runtime),
                worker: Some(Arc::clone(&worker)),
            };
            self.lock()
                .workers
                .insert(definition.identifier.clone(), Arc::clone(&worker));
            self.register_with(worker.plugin(), registration);
        }
        self.configure_hot_reload(definitions, dev);
        Ok(())
    }

    fn configure_hot_reload(
        self: &Arc<Self>,
        definitions: &[PluginDefinition],
        dev: Option<&ProfileDevSettings>,
    ) {
        let profile_hot = dev.is_some_and(|d| d.hot_reload);
        if !profile_hot && !definitions.iter().any(|d| d.dev.hot_reload) {
            return;
        }
        let controller = Arc::new(HotReloadController::new(self.hot_reload_interval));
        let manager: Weak<Self> = Arc::downgrade(self);
        controller.set_callback(Arc::new(move |plugin_id: &str| {
            if let Some(manager) = manager.upgrade() {
                manager.reload_plugin(plugin_id);
            }
        }));
        let profile_paths = dev.map(|d| d.watch_paths.clone()).unwrap_or_default();
        for definition in definitions {
            if !(profile_hot || definition.dev.hot_reload) {
                continue;
            }
            let paths = if definition.dev.watch_paths.is_empty() {
                profile_paths.clone()
            } else {
                definition.dev.watch_paths.clone()
            };
            controller.watch(&definition.identifier, paths);
        }
        *self.hot_reload.lock().unwrap_or_else(PoisonError::into_inner) = Some(controller);
    }

    /// The hot-reload controller, when the manifest enabled one.
    #[must_use]
    pub fn hot_reload(&self) -> Option<Arc<HotReloadController>> {
        self.hot_reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ask the plugin's worker for a fresh object and swap it in under the
    /// same identifier. Returns whether the reload took.
    pub fn reload_plugin(&self, plugin_id: &str) -> bool {
        let (definition, worker, runtime) = {
            let state = self.lock();
            let (Some(definition), Some(worker)) = (
                state.definitions.get(plugin_id).cloned(),
                state.workers.get(plugin_id).cloned(),
            ) else {
                return false;
            };
            let runtime = state.handle(plugin_id).and_then(|h| h.runtime.clone());
            (definition, worker, runtime)
        };
        let runtime = match runtime.map_or_else(|| self.resolve_runtime(&definition), Ok) {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(plugin = plugin_id, error = %err, "Failed to hot-reload plugin");
                return false;
            }
        };
        let plugin = match worker.reload() {
            Ok(plugin) => plugin,
            Err(err) => {
                warn!(plugin = plugin_id, error = %err, "Failed to hot-reload plugin");
                return false;
            }
        };
        info!(plugin = plugin_id, "Hot-reloading plugin");
        self.swap_plugin(
            plugin_id,
            plugin,
            PluginRegistration {
                id: Some(plugin_id.to_string()),
                definition: Some(definition),
                runtime: Some(runtime),
                worker: Some(worker),
            },
        )
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    #[must_use]
    pub fn plugin_ids(&self) -> Vec<String> {
        self.lock().handles.iter().map(|h| h.identifier.clone()).collect()
    }

    #[must_use]
    pub fn handle(&self, identifier: &str) -> Option<PluginHandle> {
        self.lock().handle(identifier).cloned()
    }

    /// Developer settings from the last manifest load.
    #[must_use]
    pub fn profile_dev(&self) -> Option<ProfileDevSettings> {
        self.lock().profile_dev.clone()
    }

    #[must_use]
    pub fn is_disabled(&self, identifier: &str) -> bool {
        self.lock().is_disabled(identifier)
    }

    #[must_use]
    pub fn violations(&self) -> Vec<PluginViolation> {
        self.lock().violations.clone()
    }

    pub fn pop_violations(&self) -> Vec<PluginViolation> {
        std::mem::take(&mut self.lock().violations)
    }

    #[must_use]
    pub fn metrics(&self, identifier: &str) -> Option<PluginMetrics> {
        self.supervisor.metrics(identifier)
    }

    #[must_use]
    pub fn validators(&self) -> Vec<Arc<dyn Validator>> {
        let state = self.lock();
        state.enabled(&state.validators)
    }

    #[must_use]
    pub fn reporters(&self) -> Vec<Arc<dyn Reporter>> {
        let state = self.lock();
        state.enabled(&state.reporters)
    }

    #[must_use]
    pub fn progress_columns(&self) -> Vec<Arc<dyn ProgressColumn>> {
        let state = self.lock();
        state.enabled(&state.progress_columns)
    }

    #[must_use]
    pub fn continuous_validators(&self) -> Vec<Arc<dyn ContinuousValidator>> {
        let state = self.lock();
        state.enabled(&state.continuous_validators)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn active_plugins(&self) -> Vec<(String, Arc<dyn SetupPlugin>)> {
        self.lock()
            .handles
            .iter()
            .filter(|h| !h.disabled)
            .map(|h| (h.identifier.clone(), Arc::clone(&h.plugin)))
            .collect()
    }

    fn dispatch<F>(&self, hook: &str, startup_is_fatal: bool, mut call: F) -> Result<()>
    where
        F: FnMut(&dyn SetupPlugin) -> HookResult,
    {
        for (id, plugin) in self.active_plugins() {
            let outcome = self
                .supervisor
                .call(&id, hook, &mut || call(plugin.as_ref()));
            match outcome {
                Ok(()) => {}
                Err(err) if startup_is_fatal && err.is_startup() => {
                    self.record_violation(&id, hook, &err, true);
                    return Err(Error::plugin_startup(&id, hook, err.reason()));
                }
                Err(err) => self.record_violation(&id, hook, &err, false),
            }
        }
        Ok(())
    }

    fn record_violation(&self, plugin_id: &str, hook: &str, err: &SupervisorError, fatal: bool) {
        let diagnostics = err.diagnostics().map(WorkerDiagnostics::telemetry_payload);
        warn!(
            plugin = plugin_id,
            hook,
            reason = err.reason(),
            fatal,
            "Plugin hook failed"
        );

        let mut payload = diagnostics.clone().unwrap_or_default();
        payload.insert("plugin".into(), Value::from(plugin_id));
        payload.insert("hook".into(), Value::from(hook));
        payload.insert("reason".into(), Value::from(err.reason()));
        payload.insert("fatal".into(), Value::from(fatal));
        self.telemetry.record_plugin(payload);

        let mut state = self.lock();
        if let Some(handle) = state.handles.iter_mut().find(|h| h.identifier == plugin_id) {
            handle.disabled |= !fatal;
            if diagnostics.is_some() {
                handle.last_diagnostics.clone_from(&diagnostics);
            }
        }
        state.violations.push(PluginViolation {
            plugin: plugin_id.to_string(),
            hook: hook.to_string(),
            reason: err.reason().to_string(),
            diagnostics,
            fatal,
        });
    }

    /// # Errors
    ///
    /// Returns [`Error::PluginStartup`] when a plugin fails to start; the run
    /// must abort.
    pub fn dispatch_before_stage(&self, stage: SetupStage, ctx: &mut StageContext) -> Result<()> {
        self.dispatch("before_stage", true, |plugin| plugin.before_stage(stage, ctx))
    }

    pub fn dispatch_after_stage(
        &self,
        stage: SetupStage,
        results: &[SetupResult],
        ctx: &mut StageContext,
    ) {
        self.dispatch_observer("after_stage", |plugin| {
            plugin.after_stage(stage, results, ctx)
        });
    }

    pub fn dispatch_before_task(&self, task: &SetupTask, ctx: &mut StageContext) {
        self.dispatch_observer("before_task", |plugin| plugin.before_task(task, ctx));
    }

    pub fn dispatch_after_task(&self, result: &SetupResult, ctx: &mut StageContext) {
        self.dispatch_observer("after_task", |plugin| plugin.after_task(result, ctx));
    }

    pub fn dispatch_error(&self, task: &SetupTask, error: &TaskError, ctx: &mut StageContext) {
        self.dispatch_observer("on_error", |plugin| plugin.on_error(task, error, ctx));
    }

    fn dispatch_observer<F>(&self, hook: &str, call: F)
    where
        F: FnMut(&dyn SetupPlugin) -> HookResult,
    {
        // Failures are recorded as violations; only before_stage can abort.
        if let Err(err) = self.dispatch(hook, false, call) {
            warn!(hook, error = %err, "Unexpected plugin dispatch failure");
        }
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugin_ids())
            .field(
                "runtimes",
                &self.runtimes.iter().map(|r| r.name().to_string()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        let controller = self
            .hot_reload
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(controller) = controller {
            controller.stop();
        }
    }
}
