//! Plugin runtime backends.
//!
//! A runtime manager turns a [`PluginDefinition`] into a worker; the worker
//! owns the live plugin object and can rebuild it for hot reload. Only the
//! in-process native backend ships here. Other kinds are supplied by callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::SetupPlugin;
use super::manifest::{NATIVE_RUNTIME, PluginDefinition};
use crate::error::{Error, Result};

pub trait PluginWorker: Send + Sync {
    fn identifier(&self) -> &str;

    /// The current plugin object.
    fn plugin(&self) -> Arc<dyn SetupPlugin>;

    /// Rebuild the plugin object and return it.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot be rebuilt.
    fn reload(&self) -> Result<Arc<dyn SetupPlugin>>;

    fn shutdown(&self) {}
}

pub trait PluginRuntimeManager: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, definition: &PluginDefinition) -> bool;

    /// # Errors
    ///
    /// Returns an error if the worker cannot be started.
    fn create_worker(&self, definition: &PluginDefinition) -> Result<Arc<dyn PluginWorker>>;
}

/// Builds a fresh plugin object.
pub type PluginFactory = Arc<dyn Fn(&PluginDefinition) -> Arc<dyn SetupPlugin> + Send + Sync>;

/// Resolves `runtime.entrypoint` against a table of in-process factories.
#[derive(Default, Clone)]
pub struct NativeRuntimeManager {
    factories: HashMap<String, PluginFactory>,
}

impl NativeRuntimeManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_factory<F>(mut self, entrypoint: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginDefinition) -> Arc<dyn SetupPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(entrypoint.into(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn entrypoints(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for NativeRuntimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRuntimeManager")
            .field("entrypoints", &self.entrypoints())
            .finish()
    }
}

impl PluginRuntimeManager for NativeRuntimeManager {
    fn name(&self) -> &str {
        NATIVE_RUNTIME
    }

    fn supports(&self, definition: &PluginDefinition) -> bool {
        definition.runtime.kind == NATIVE_RUNTIME
    }

    fn create_worker(&self, definition: &PluginDefinition) -> Result<Arc<dyn PluginWorker>> {
        let entrypoint = definition.runtime.entrypoint.as_deref().ok_or_else(|| {
            Error::worker_startup(&definition.identifier, "runtime.entrypoint is not set")
        })?;
        let factory = self.factories.get(entrypoint).ok_or_else(|| {
            Error::worker_startup(
                &definition.identifier,
                format!("no native factory for entrypoint '{entrypoint}'"),
            )
        })?;
        debug!(plugin = %definition.identifier, entrypoint, "Starting native worker");
        Ok(Arc::new(NativeWorker::start(
            definition.clone(),
            Arc::clone(factory),
        )))
    }
}

/// Holds the plugin built by a native factory.
pub struct NativeWorker {
    definition: PluginDefinition,
    factory: PluginFactory,
    plugin: Mutex<Arc<dyn SetupPlugin>>,
}

impl NativeWorker {
    fn start(definition: PluginDefinition, factory: PluginFactory) -> Self {
        let plugin = factory(&definition);
        Self {
            definition,
            factory,
            plugin: Mutex::new(plugin),
        }
    }
}

impl PluginWorker for NativeWorker {
    fn identifier(&self) -> &str {
        &self.definition.identifier
    }

    fn plugin(&self) -> Arc<dyn SetupPlugin> {
        Arc::clone(&*self.plugin.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn reload(&self) -> Result<Arc<dyn SetupPlugin>> {
        let fresh = (self.factory)(&self.definition);
        *self.plugin.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&fresh);
        Ok(fresh)
    }
}
