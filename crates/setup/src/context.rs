//! Per-run state shared by tasks, plugins and validators.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use stagehand_core::JsonMap;
use stagehand_telemetry::{NullTelemetryClient, TelemetryClient, TelemetryKnowledgeBase};
use stagehand_toolbus::ToolBus;

use crate::events::{DEFAULT_EVENTS_TOPIC, EventHub, SetupEvent};
use crate::plugins::PluginManager;
use crate::recipe::Recipe;
use crate::result::SetupResult;
use crate::stage::SetupStage;
use crate::task::TaskRegistry;

/// The services a run can reach. Shared by reference counting; cloning is
/// cheap.
#[derive(Clone)]
pub struct RunServices {
    pub events: Arc<EventHub>,
    pub tool_bus: Arc<ToolBus>,
    pub telemetry: Arc<dyn TelemetryClient>,
    pub plugins: Arc<PluginManager>,
}

impl RunServices {
    /// Services around a fresh plugin manager and task registry.
    pub fn new(tool_bus: Arc<ToolBus>, telemetry: Arc<dyn TelemetryClient>) -> Self {
        let plugins = Arc::new(PluginManager::new(
            TaskRegistry::shared(),
            Arc::clone(&tool_bus),
            Arc::clone(&telemetry),
        ));
        Self::assemble(tool_bus, telemetry, plugins, DEFAULT_EVENTS_TOPIC)
    }

    /// Services around an existing plugin manager, publishing events on
    /// `events_topic`.
    pub fn assemble(
        tool_bus: Arc<ToolBus>,
        telemetry: Arc<dyn TelemetryClient>,
        plugins: Arc<PluginManager>,
        events_topic: &str,
    ) -> Self {
        Self {
            events: Arc::new(EventHub::new(Arc::clone(&tool_bus), events_topic)),
            tool_bus,
            telemetry,
            plugins,
        }
    }

    /// A private bus and no telemetry.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Arc::new(ToolBus::new()), Arc::new(NullTelemetryClient))
    }
}

/// Mutable state for one `run()`.
pub struct StageContext {
    pub root: PathBuf,
    pub recipe: Recipe,
    /// Free-form state tasks and remediations share.
    pub state: JsonMap,
    /// Latest result per task so far, resumed ones included.
    pub results: HashMap<String, SetupResult>,
    services: RunServices,
}

impl StageContext {
    pub fn new(root: impl Into<PathBuf>, recipe: Recipe, services: RunServices) -> Self {
        Self {
            root: root.into(),
            recipe,
            state: JsonMap::new(),
            results: HashMap::new(),
            services,
        }
    }

    #[must_use]
    pub fn stage_config(&self, stage: SetupStage) -> JsonMap {
        self.recipe.stage_config(stage)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    #[must_use]
    pub fn result(&self, task: &str) -> Option<&SetupResult> {
        self.results.get(task)
    }

    /// One value per registered progress-column factory.
    #[must_use]
    pub fn progress_columns(&self) -> Vec<Value> {
        self.services
            .plugins
            .progress_columns()
            .iter()
            .map(|column| column.column(self))
            .collect()
    }

    pub fn publish(&self, event: &SetupEvent) {
        self.services.events.publish(event);
    }

    #[must_use]
    pub const fn services(&self) -> &RunServices {
        &self.services
    }

    #[must_use]
    pub fn tool_bus(&self) -> &Arc<ToolBus> {
        &self.services.tool_bus
    }

    #[must_use]
    pub fn telemetry(&self) -> &Arc<dyn TelemetryClient> {
        &self.services.telemetry
    }

    /// The knowledge base behind the telemetry client, if it keeps one.
    #[must_use]
    pub fn knowledge(&self) -> Option<Arc<TelemetryKnowledgeBase>> {
        self.services.telemetry.knowledge()
    }
}
