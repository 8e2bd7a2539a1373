//! Service wiring for a host process.
//!
//! [`Stagehand`] owns one tool bus, one telemetry client and one
//! orchestrator, all built from a [`Config`]. Nothing here is global: two
//! runtimes for two project roots do not share state.
//!
//! ## Initialization
//!
//! 1. **Config** - defaults, `stagehand.toml`, then `STAGEHAND_*` overrides
//! 2. **Telemetry** - JSONL storage replayed into a fresh knowledge base
//! 3. **Tool bus** - shared by plugins and the dashboard event topic
//! 4. **Orchestrator** - journal directory and hot-reload interval from config
//!
//! [`Stagehand::shutdown`] tears plugins down and flushes telemetry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use stagehand_core::{Config, load_config};
use stagehand_setup::{AdaptiveRemediationPlugin, OrchestratorConfig, SetupOrchestrator};
use stagehand_telemetry::{
    JsonlTelemetryStorage, NullTelemetryClient, TelemetryClient, TelemetryKnowledgeBase,
    TelemetryRecorder,
};
use stagehand_toolbus::ToolBus;
use tracing::{debug, info};

pub struct Stagehand {
    root: PathBuf,
    config: Config,
    tool_bus: Arc<ToolBus>,
    telemetry: Arc<dyn TelemetryClient>,
    orchestrator: SetupOrchestrator,
}

impl Stagehand {
    /// Load the configuration for `root` and build every service from it.
    ///
    /// # Errors
    ///
    /// Fails if the configuration cannot be loaded or telemetry history
    /// cannot be replayed.
    pub fn bootstrap(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = load_config(&root)
            .with_context(|| format!("Failed to load configuration for {}", root.display()))?;
        Self::with_config(root, config)
    }

    /// Build every service from an already loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails if `config` is invalid or telemetry history cannot be replayed.
    pub fn with_config(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let root = root.into();
        config.validate().context("Configuration is invalid")?;

        let telemetry = init_telemetry(&config, &root)?;
        let tool_bus = Arc::new(ToolBus::new());
        let orchestrator = SetupOrchestrator::builder(&root)
            .config(OrchestratorConfig::from_config(&config, &root))
            .tool_bus(Arc::clone(&tool_bus))
            .telemetry(Arc::clone(&telemetry))
            .build();

        info!(
            root = %root.display(),
            journal_dir = %orchestrator.config().journal_dir.display(),
            telemetry = config.telemetry.enabled,
            "Stagehand runtime ready"
        );
        Ok(Self {
            root,
            config,
            tool_bus,
            telemetry,
            orchestrator,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn tool_bus(&self) -> &Arc<ToolBus> {
        &self.tool_bus
    }

    #[must_use]
    pub fn telemetry(&self) -> &Arc<dyn TelemetryClient> {
        &self.telemetry
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &SetupOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut SetupOrchestrator {
        &mut self.orchestrator
    }

    /// Register the adaptive remediation plugin backed by this runtime's
    /// telemetry. Returns whether it was registered.
    pub fn enable_remediation(&self) -> bool {
        let plugin = AdaptiveRemediationPlugin::new().with_telemetry(Arc::clone(&self.telemetry));
        self.orchestrator.register_plugin(Arc::new(plugin))
    }

    /// Drop every plugin and flush buffered telemetry.
    ///
    /// # Errors
    ///
    /// Fails if telemetry cannot be written.
    pub fn shutdown(self) -> Result<()> {
        self.orchestrator.plugin_manager().clear();
        self.telemetry
            .flush()
            .context("Failed to flush telemetry during shutdown")?;
        info!(root = %self.root.display(), "Stagehand runtime stopped");
        Ok(())
    }
}

fn init_telemetry(config: &Config, root: &Path) -> Result<Arc<dyn TelemetryClient>> {
    if !config.telemetry.enabled {
        debug!("Telemetry disabled");
        return Ok(Arc::new(NullTelemetryClient));
    }
    let path = config.telemetry_path(root);
    let recorder = TelemetryRecorder::new(
        Arc::new(JsonlTelemetryStorage::new(&path)),
        Arc::new(TelemetryKnowledgeBase::new()),
    );
    let replayed = recorder
        .bootstrap()
        .with_context(|| format!("Failed to replay telemetry from {}", path.display()))?;
    debug!(path = %path.display(), replayed, "Telemetry history loaded");
    Ok(Arc::new(recorder))
}
