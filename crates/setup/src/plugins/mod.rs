//! Plugin interface, registration and supervision.
//!
//! A [`SetupPlugin`] contributes tasks, validators, reporters, progress
//! columns, continuous validators and tool-bus endpoints through a
//! [`PluginRegistrar`], and observes the run through lifecycle hooks. The
//! [`PluginManager`] owns the handles, commits registrations atomically and
//! routes every hook call through a [`supervisor::WorkerSupervisor`].

pub mod hot_reload;
pub mod manifest;
pub mod runtime;
pub mod supervisor;

mod manager;
mod registrar;

use stagehand_toolbus::ToolHandler;
use thiserror::Error;

pub use manager::{
    DEFAULT_HOT_RELOAD_INTERVAL, PluginHandle, PluginManager, PluginRegistration, PluginViolation,
};
pub use registrar::PluginRegistrar;

use crate::context::StageContext;
use crate::result::{SetupResult, TaskError};
use crate::stage::SetupStage;
use crate::task::SetupTask;
use crate::validators::HookResult;

/// Failure raised by a plugin hook or by `register`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    /// The plugin cannot work at all; fatal when raised from `before_stage`.
    #[error("{0}")]
    Startup(String),

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub fn startup(reason: impl Into<String>) -> Self {
        Self::Startup(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    #[must_use]
    pub const fn is_startup(&self) -> bool {
        matches!(self, Self::Startup(_))
    }
}

/// A participant in setup runs. Every hook defaults to a no-op.
pub trait SetupPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Contribute entries. Nothing is committed unless this returns `Ok`.
    ///
    /// # Errors
    ///
    /// An error drops the plugin; it is logged, not propagated.
    fn register(&self, _registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    fn before_stage(&self, _stage: SetupStage, _ctx: &mut StageContext) -> HookResult {
        Ok(())
    }

    fn after_stage(
        &self,
        _stage: SetupStage,
        _results: &[SetupResult],
        _ctx: &mut StageContext,
    ) -> HookResult {
        Ok(())
    }

    fn before_task(&self, _task: &SetupTask, _ctx: &mut StageContext) -> HookResult {
        Ok(())
    }

    fn after_task(&self, _result: &SetupResult, _ctx: &mut StageContext) -> HookResult {
        Ok(())
    }

    fn on_error(
        &self,
        _task: &SetupTask,
        _error: &TaskError,
        _ctx: &mut StageContext,
    ) -> HookResult {
        Ok(())
    }

    /// Resolve a method named in a manifest `toolbus` block to a handler.
    fn tool_method(&self, _method: &str) -> Option<ToolHandler> {
        None
    }
}
