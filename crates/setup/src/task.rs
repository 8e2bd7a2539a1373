//! Setup tasks and the registry that holds them.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use stagehand_core::JsonMap;

use crate::context::StageContext;
use crate::error::{Error, Result};
use crate::result::{SetupResult, TaskError};
use crate::stage::SetupStage;

/// What a task action hands back.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    /// Wrapped into a SUCCESS result.
    Payload(JsonMap),
    /// Taken as-is; only the attempt counter is overwritten.
    Result(Box<SetupResult>),
}

impl TaskOutput {
    /// A SUCCESS with an empty payload.
    #[must_use]
    pub fn empty() -> Self {
        Self::Payload(JsonMap::new())
    }
}

impl From<JsonMap> for TaskOutput {
    fn from(payload: JsonMap) -> Self {
        Self::Payload(payload)
    }
}

impl From<SetupResult> for TaskOutput {
    fn from(result: SetupResult) -> Self {
        Self::Result(Box::new(result))
    }
}

/// The work a task performs.
pub type TaskAction =
    Arc<dyn Fn(&mut StageContext) -> std::result::Result<TaskOutput, TaskError> + Send + Sync>;

/// A named, stage-scoped unit of work.
#[derive(Clone)]
pub struct SetupTask {
    pub name: String,
    pub stage: SetupStage,
    action: TaskAction,
    pub dependencies: Vec<String>,
    pub allow_fail: bool,
    pub max_retries: u32,
}

impl SetupTask {
    pub fn new<F>(name: impl Into<String>, stage: SetupStage, action: F) -> Self
    where
        F: Fn(&mut StageContext) -> std::result::Result<TaskOutput, TaskError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            stage,
            action: Arc::new(action),
            dependencies: Vec::new(),
            allow_fail: false,
            max_retries: 1,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// A failure of this task does not fail its stage.
    #[must_use]
    pub const fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Upper bound on attempts, retries included.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run the action, turning a panic into a `Panic` task error.
    pub(crate) fn execute(
        &self,
        ctx: &mut StageContext,
    ) -> std::result::Result<TaskOutput, TaskError> {
        catch_unwind(AssertUnwindSafe(|| (self.action)(ctx)))
            .unwrap_or_else(|panic| Err(TaskError::panic(panic_message(panic.as_ref()))))
    }
}

impl fmt::Debug for SetupTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupTask")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("dependencies", &self.dependencies)
            .field("allow_fail", &self.allow_fail)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

/// Registered tasks in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<SetupTask>,
}

/// Registry shared by the orchestrator and the plugin manager.
pub type SharedTaskRegistry = Arc<Mutex<TaskRegistry>>;

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedTaskRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// # Errors
    ///
    /// Returns [`Error::DuplicateTask`] if the name is taken.
    pub fn register(&mut self, task: SetupTask) -> Result<()> {
        if self.contains(&task.name) {
            return Err(Error::duplicate_task(&task.name));
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Remove a task by name. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.name != name);
        self.tasks.len() != before
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SetupTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SetupTask> {
        self.tasks.iter()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<SetupTask> {
        self.tasks.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
