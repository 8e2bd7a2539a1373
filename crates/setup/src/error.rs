//! Error types for the setup crate.

use std::fmt;
use std::path::PathBuf;

/// Result type alias for setup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Setup orchestration errors.
#[derive(Debug, Clone)]
pub enum Error {
    /// A task depends on a name that is not registered.
    UnknownDependency { task: String, dependency: String },
    /// A task depends on a task of a later stage.
    FutureStageDependency { task: String, dependency: String },
    /// A dependency was excluded by the task filter.
    FilteredDependency {
        task: String,
        dependency: String,
        /// Set when the dependency lives in the dependent's own stage.
        stage: Option<String>,
    },
    /// A dependency lives in a stage excluded by the stage filter.
    SkippedStageDependency {
        task: String,
        dependency: String,
        stage: String,
    },
    /// Same-stage dependencies form a cycle.
    CyclicDependency { stage: String },
    /// Task name already registered.
    DuplicateTask { name: String },
    /// `run()` called with an empty registry.
    NoTasks,
    /// Stage name not recognised.
    UnknownStage { name: String },
    /// No runtime manager supports the plugin's runtime kind.
    UnsupportedRuntime { plugin: String, kind: String },
    /// A runtime manager could not create a worker.
    WorkerStartup { plugin: String, reason: String },
    /// A plugin failed fatally during `before_stage`.
    PluginStartup {
        plugin: String,
        hook: String,
        reason: String,
    },
    /// Journal file could not be written or read.
    Journal { path: PathBuf, reason: String },
    /// `retry()` found neither a recipe nor a journal to rebuild one from.
    NoPriorRun,
    /// Tool bus registration failed.
    ToolBus { reason: String },
    /// Serialization error.
    Serialization { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDependency { task, dependency } => {
                write!(f, "Task '{task}' depends on unknown task '{dependency}'")
            }
            Self::FutureStageDependency { task, dependency } => {
                write!(f, "Task '{task}' depends on future stage task '{dependency}'")
            }
            Self::FilteredDependency {
                task,
                dependency,
                stage: Some(stage),
            } => write!(
                f,
                "Task '{task}' depends on filtered task '{dependency}' in stage '{stage}'"
            ),
            Self::FilteredDependency {
                task,
                dependency,
                stage: None,
            } => write!(f, "Task '{task}' depends on filtered task '{dependency}'"),
            Self::SkippedStageDependency {
                task,
                dependency,
                stage,
            } => write!(
                f,
                "Task '{task}' depends on task '{dependency}' from skipped stage '{stage}'"
            ),
            Self::CyclicDependency { stage } => {
                write!(f, "Cyclic dependency detected in stage '{stage}'")
            }
            Self::DuplicateTask { name } => write!(f, "Task '{name}' already registered"),
            Self::NoTasks => write!(f, "No tasks registered for setup orchestration"),
            Self::UnknownStage { name } => write!(f, "unknown setup stage '{name}'"),
            Self::UnsupportedRuntime { plugin, kind } => write!(
                f,
                "No runtime manager available for plugin '{plugin}' ({kind})"
            ),
            Self::WorkerStartup { plugin, reason } => {
                write!(f, "failed to start worker for plugin '{plugin}': {reason}")
            }
            Self::PluginStartup {
                plugin,
                hook,
                reason,
            } => write!(f, "plugin '{plugin}' failed during {hook}: {reason}"),
            Self::Journal { path, reason } => {
                write!(f, "journal '{}' failed: {reason}", path.display())
            }
            Self::NoPriorRun => write!(f, "No prior recipe run recorded; call run() first"),
            Self::ToolBus { reason } => write!(f, "tool bus registration failed: {reason}"),
            Self::Serialization { reason } => write!(f, "serialization error: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn unknown_dependency(task: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::UnknownDependency {
            task: task.into(),
            dependency: dependency.into(),
        }
    }

    pub fn future_stage_dependency(
        task: impl Into<String>,
        dependency: impl Into<String>,
    ) -> Self {
        Self::FutureStageDependency {
            task: task.into(),
            dependency: dependency.into(),
        }
    }

    pub fn filtered_dependency(
        task: impl Into<String>,
        dependency: impl Into<String>,
        stage: Option<String>,
    ) -> Self {
        Self::FilteredDependency {
            task: task.into(),
            dependency: dependency.into(),
            stage,
        }
    }

    pub fn skipped_stage_dependency(
        task: impl Into<String>,
        dependency: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self::SkippedStageDependency {
            task: task.into(),
            dependency: dependency.into(),
            stage: stage.into(),
        }
    }

    pub fn cyclic_dependency(stage: impl Into<String>) -> Self {
        Self::CyclicDependency {
            stage: stage.into(),
        }
    }

    pub fn duplicate_task(name: impl Into<String>) -> Self {
        Self::DuplicateTask { name: name.into() }
    }

    pub fn unknown_stage(name: impl Into<String>) -> Self {
        Self::UnknownStage { name: name.into() }
    }

    pub fn unsupported_runtime(plugin: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnsupportedRuntime {
            plugin: plugin.into(),
            kind: kind.into(),
        }
    }

    pub fn worker_startup(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerStartup {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn plugin_startup(
        plugin: impl Into<String>,
        hook: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PluginStartup {
            plugin: plugin.into(),
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    pub fn journal(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::Journal {
            path: path.into(),
            reason: source.to_string(),
        }
    }

    /// Short type name used in stage failure codes
    /// (`<stage>:exception:<kind>`).
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::UnknownDependency { .. }
            | Self::FutureStageDependency { .. }
            | Self::FilteredDependency { .. }
            | Self::SkippedStageDependency { .. }
            | Self::CyclicDependency { .. } => "PlanError",
            Self::DuplicateTask { .. } | Self::NoTasks | Self::UnknownStage { .. } => {
                "RegistryError"
            }
            Self::UnsupportedRuntime { .. } | Self::WorkerStartup { .. } => "RuntimeError",
            Self::PluginStartup { .. } => "PluginStartupError",
            Self::Journal { .. } => "JournalError",
            Self::NoPriorRun => "NoPriorRunError",
            Self::ToolBus { .. } => "ToolBusError",
            Self::Serialization { .. } => "SerializationError",
        }
    }
}

impl From<stagehand_toolbus::Error> for Error {
    fn from(e: stagehand_toolbus::Error) -> Self {
        Self::ToolBus {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            reason: e.to_string(),
        }
    }
}
