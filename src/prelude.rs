//! Common imports for hosts embedding the orchestrator.
//!
//! ```rust
//! use stagehand::prelude::*;
//! ```

pub use stagehand_core::{Config, JsonMap, load_config};

pub use stagehand_setup::{
    AdaptiveRemediationPlugin, PluginDefinition, Recipe, RetryOptions, RunOptions, SetupEvent,
    SetupOrchestrator, SetupPlugin, SetupResult, SetupStage, SetupStatus, SetupTask,
    StageContext, TaskError, TaskOutput, ValidatorDecision,
};

pub use stagehand_telemetry::{RemediationSuggestion, TelemetryClient, TelemetryKnowledgeBase};

pub use stagehand_toolbus::{InvokeRequest, Reply, StatusCode, ToolBus};

pub use crate::runtime::Stagehand;
