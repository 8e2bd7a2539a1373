//! Fault isolation for plugin hook calls.
//!
//! Every hook dispatch goes through [`WorkerSupervisor::call`]. The default
//! [`InProcessSupervisor`] catches panics, enforces the wall-time budget from
//! the plugin's manifest and keeps per-plugin metrics.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use stagehand_core::JsonMap;
use thiserror::Error;
use tracing::debug;

use super::PluginError;
use super::manifest::PluginDefinition;
use crate::task::panic_message;

/// Limits enforced around each call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetLimits {
    pub wall_time: Option<Duration>,
}

impl BudgetLimits {
    #[must_use]
    pub fn from_definition(definition: Option<&PluginDefinition>) -> Self {
        Self {
            wall_time: definition.and_then(|d| d.resources.wall_time()),
        }
    }

    #[must_use]
    pub const fn is_enforced(&self) -> bool {
        self.wall_time.is_some()
    }

    fn breaches(&self, elapsed: Duration) -> BTreeMap<String, Breach> {
        self.wall_time
            .filter(|limit| elapsed > *limit)
            .map(|limit| {
                (
                    "wall_time".to_string(),
                    Breach {
                        observed: elapsed.as_secs_f64(),
                        limit: limit.as_secs_f64(),
                    },
                )
            })
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Breach {
    pub observed: f64,
    pub limit: f64,
}

/// What the supervisor saw when a call broke its budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDiagnostics {
    pub plugin: String,
    pub method: String,
    /// Seconds.
    pub wall_time: f64,
    pub breaches: BTreeMap<String, Breach>,
}

impl WorkerDiagnostics {
    /// JSON form attached to violations and plugin telemetry.
    #[must_use]
    pub fn telemetry_payload(&self) -> JsonMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => JsonMap::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// Startup-class failure; fatal during `before_stage`.
    #[error("plugin '{plugin}' failed to start during {method}: {reason}")]
    Startup {
        plugin: String,
        method: String,
        reason: String,
        diagnostics: Option<WorkerDiagnostics>,
    },
    #[error("plugin '{plugin}' raised during {method}: {reason}")]
    Runtime {
        plugin: String,
        method: String,
        reason: String,
    },
}

impl SupervisorError {
    #[must_use]
    pub const fn is_startup(&self) -> bool {
        matches!(self, Self::Startup { .. })
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Startup { reason, .. } | Self::Runtime { reason, .. } => reason,
        }
    }

    #[must_use]
    pub const fn diagnostics(&self) -> Option<&WorkerDiagnostics> {
        match self {
            Self::Startup { diagnostics, .. } => diagnostics.as_ref(),
            Self::Runtime { .. } => None,
        }
    }
}

/// Per-plugin call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginMetrics {
    pub invocations: u64,
    pub errors: u64,
    pub budget_violations: u64,
    pub last_error: Option<String>,
    pub total_wall_time: Duration,
}

pub trait WorkerSupervisor: Send + Sync {
    fn register(&self, plugin_id: &str, definition: Option<&PluginDefinition>);

    fn unregister(&self, plugin_id: &str);

    /// Run one hook invocation on behalf of `plugin_id`.
    ///
    /// # Errors
    ///
    /// Returns a startup error for budget breaches and startup failures, a
    /// runtime error for anything else, including unknown plugins.
    fn call(
        &self,
        plugin_id: &str,
        method: &str,
        invocation: &mut dyn FnMut() -> Result<(), PluginError>,
    ) -> Result<(), SupervisorError>;

    fn metrics(&self, plugin_id: &str) -> Option<PluginMetrics>;

    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct InProcessSupervisor {
    workers: Mutex<HashMap<String, BudgetLimits>>,
    metrics: Mutex<HashMap<String, PluginMetrics>>,
}

impl InProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, plugin_id: &str, elapsed: Duration, outcome: &Result<(), SupervisorError>) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = metrics.entry(plugin_id.to_string()).or_default();
        entry.invocations = entry.invocations.saturating_add(1);
        entry.total_wall_time = entry.total_wall_time.saturating_add(elapsed);
        if let Err(err) = outcome {
            entry.errors = entry.errors.saturating_add(1);
            entry.last_error = Some(err.reason().to_string());
            if err.diagnostics().is_some() {
                entry.budget_violations = entry.budget_violations.saturating_add(1);
            }
        }
    }
}

impl WorkerSupervisor for InProcessSupervisor {
    fn register(&self, plugin_id: &str, definition: Option<&PluginDefinition>) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), BudgetLimits::from_definition(definition));
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(plugin_id.to_string())
            .or_default();
    }

    fn unregister(&self, plugin_id: &str) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id);
    }

    fn call(
        &self,
        plugin_id: &str,
        method: &str,
        invocation: &mut dyn FnMut() -> Result<(), PluginError>,
    ) -> Result<(), SupervisorError> {
        let limits = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .copied()
            .ok_or_else(|| SupervisorError::Runtime {
                plugin: plugin_id.to_string(),
                method: method.to_string(),
                reason: format!("plugin '{plugin_id}' not registered"),
            })?;

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| invocation()));
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(PluginError::Startup(reason))) => Err(SupervisorError::Startup {
                plugin: plugin_id.to_string(),
                method: method.to_string(),
                reason,
                diagnostics: None,
            }),
            Ok(Err(other)) => Err(SupervisorError::Runtime {
                plugin: plugin_id.to_string(),
                method: method.to_string(),
                reason: other.to_string(),
            }),
            Err(panic) => Err(SupervisorError::Runtime {
                plugin: plugin_id.to_string(),
                method: method.to_string(),
                reason: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        };

        // A blown budget outranks whatever the call itself returned.
        let breaches = limits.breaches(elapsed);
        let result = if breaches.is_empty() {
            result
        } else {
            Err(SupervisorError::Startup {
                plugin: plugin_id.to_string(),
                method: method.to_string(),
                reason: format!(
                    "Plugin '{plugin_id}' exceeded its resource budget: {}",
                    describe_breaches(&breaches)
                ),
                diagnostics: Some(WorkerDiagnostics {
                    plugin: plugin_id.to_string(),
                    method: method.to_string(),
                    wall_time: elapsed.as_secs_f64(),
                    breaches,
                }),
            })
        };

        debug!(
            plugin = plugin_id,
            method,
            elapsed_ms = elapsed.as_millis(),
            ok = result.is_ok(),
            "Plugin call finished"
        );
        self.record(plugin_id, elapsed, &result);
        result
    }

    fn metrics(&self, plugin_id: &str) -> Option<PluginMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
    }

    fn clear(&self) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// One-line summary such as `wall_time 0.021s over 0.000s limit`.
fn describe_breaches(breaches: &BTreeMap<String, Breach>) -> String {
    breaches
        .iter()
        .map(|(budget, b)| format!("{budget} {:.3}s over {:.3}s limit", b.observed, b.limit))
        .collect::<Vec<_>>()
        .join("; ")
}
