#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! Stage-ordered setup orchestration.
//!
//! Tasks are grouped into five fixed [`SetupStage`]s and ordered within each
//! stage by their dependencies. [`SetupOrchestrator::run`] walks the plan,
//! journals every attempt, publishes dashboard events and lets supervised
//! plugins observe, validate and remediate each result.

pub mod context;
pub mod error;
pub mod events;
pub mod journal;
pub mod orchestrator;
pub mod plan;
pub mod plugins;
pub mod recipe;
pub mod remediation;
pub mod result;
mod runner;
pub mod stage;
pub mod task;
pub mod validators;

pub use context::{RunServices, StageContext};
pub use error::{Error, Result};
pub use events::{EventHub, ListenerId, SetupEvent};
pub use journal::{SetupRunJournal, load_journal, load_last_run};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorConfig, RetryOptions, RunOptions, SetupOrchestrator,
};
pub use plan::{ExecutionPlan, build_execution_plan};
pub use plugins::manifest::{PluginDefinition, ProfileDevSettings};
pub use plugins::{PluginError, PluginManager, PluginRegistrar, PluginRegistration, SetupPlugin};
pub use recipe::Recipe;
pub use remediation::AdaptiveRemediationPlugin;
pub use result::{SetupResult, TaskError};
pub use stage::{SetupStage, SetupStatus};
pub use task::{SetupTask, TaskOutput};
pub use validators::{HookResult, ValidatorDecision};
