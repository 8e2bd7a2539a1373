//! Hooks plugins contribute to the run loop.
//!
//! Plain closures work for every hook through blanket implementations.

use std::fmt;

use serde_json::Value;

use crate::context::StageContext;
use crate::plugins::PluginError;
use crate::result::SetupResult;

/// Result of an observation hook.
pub type HookResult = Result<(), PluginError>;

/// Observes each task result. Errors are logged and ignored.
pub trait Validator: Send + Sync {
    fn validate(&self, result: &SetupResult, ctx: &StageContext) -> HookResult;
}

impl<F> Validator for F
where
    F: Fn(&SetupResult, &StageContext) -> HookResult + Send + Sync,
{
    fn validate(&self, result: &SetupResult, ctx: &StageContext) -> HookResult {
        self(result, ctx)
    }
}

/// Observes a finished stage.
pub trait Reporter: Send + Sync {
    fn report(&self, results: &[SetupResult], ctx: &StageContext) -> HookResult;
}

impl<F> Reporter for F
where
    F: Fn(&[SetupResult], &StageContext) -> HookResult + Send + Sync,
{
    fn report(&self, results: &[SetupResult], ctx: &StageContext) -> HookResult {
        self(results, ctx)
    }
}

/// Produces one dashboard column value for the current context.
pub trait ProgressColumn: Send + Sync {
    fn column(&self, ctx: &StageContext) -> Value;
}

impl<F> ProgressColumn for F
where
    F: Fn(&StageContext) -> Value + Send + Sync,
{
    fn column(&self, ctx: &StageContext) -> Value {
        self(ctx)
    }
}

/// Offered every task result; may stage remediation and ask for a retry.
pub trait ContinuousValidator: Send + Sync {
    /// # Errors
    ///
    /// An error is logged and the validator is skipped for this result.
    fn evaluate(
        &self,
        result: &SetupResult,
        ctx: &StageContext,
    ) -> Result<Option<ValidatorDecision>, PluginError>;
}

impl<F> ContinuousValidator for F
where
    F: Fn(&SetupResult, &StageContext) -> Result<Option<ValidatorDecision>, PluginError>
        + Send
        + Sync,
{
    fn evaluate(
        &self,
        result: &SetupResult,
        ctx: &StageContext,
    ) -> Result<Option<ValidatorDecision>, PluginError> {
        self(result, ctx)
    }
}

/// A repair or rollback step. A returned result is recorded alongside the
/// stage's results.
pub type RemediationAction = Box<
    dyn FnOnce(&mut StageContext, &SetupResult) -> Result<Option<SetupResult>, PluginError> + Send,
>;

/// What a continuous validator decided to do about a result.
pub struct ValidatorDecision {
    pub name: String,
    pub reason: String,
    pub repairs: Vec<RemediationAction>,
    pub rollbacks: Vec<RemediationAction>,
    pub retry: bool,
}

impl ValidatorDecision {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
            repairs: Vec::new(),
            rollbacks: Vec::new(),
            retry: false,
        }
    }

    #[must_use]
    pub fn with_repair<F>(mut self, action: F) -> Self
    where
        F: FnOnce(&mut StageContext, &SetupResult) -> Result<Option<SetupResult>, PluginError>
            + Send
            + 'static,
    {
        self.repairs.push(Box::new(action));
        self
    }

    #[must_use]
    pub fn with_rollback<F>(mut self, action: F) -> Self
    where
        F: FnOnce(&mut StageContext, &SetupResult) -> Result<Option<SetupResult>, PluginError>
            + Send
            + 'static,
    {
        self.rollbacks.push(Box::new(action));
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for ValidatorDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorDecision")
            .field("name", &self.name)
            .field("reason", &self.reason)
            .field("repairs", &self.repairs.len())
            .field("rollbacks", &self.rollbacks.len())
            .field("retry", &self.retry)
            .finish()
    }
}
