//! Buffered registration for one plugin.

use std::sync::Arc;

use stagehand_toolbus::{CallMode, ToolEndpoint, ToolHandler};

use super::manifest::ToolBusBindings;
use super::{PluginError, SetupPlugin};
use crate::task::SetupTask;
use crate::validators::{ContinuousValidator, ProgressColumn, Reporter, Validator};

/// Everything a plugin asked for, committed by the manager in one step.
#[derive(Default)]
pub(super) struct Contributions {
    pub(super) tasks: Vec<SetupTask>,
    pub(super) validators: Vec<Arc<dyn Validator>>,
    pub(super) reporters: Vec<Arc<dyn Reporter>>,
    pub(super) progress_columns: Vec<Arc<dyn ProgressColumn>>,
    pub(super) continuous_validators: Vec<Arc<dyn ContinuousValidator>>,
    pub(super) endpoints: Vec<ToolEndpoint>,
}

/// Handed to [`SetupPlugin::register`]. Entries are held back until the
/// plugin returns and are then committed all together, or not at all.
pub struct PluginRegistrar<'a> {
    plugin_id: &'a str,
    plugin: &'a dyn SetupPlugin,
    contributions: Contributions,
}

impl<'a> PluginRegistrar<'a> {
    pub(super) fn new(plugin_id: &'a str, plugin: &'a dyn SetupPlugin) -> Self {
        Self {
            plugin_id,
            plugin,
            contributions: Contributions::default(),
        }
    }

    pub(super) fn finish(self) -> Contributions {
        self.contributions
    }

    #[must_use]
    pub const fn plugin_id(&self) -> &str {
        self.plugin_id
    }

    pub fn add_task(&mut self, task: SetupTask) {
        self.contributions.tasks.push(task);
    }

    pub fn add_validator(&mut self, validator: impl Validator + 'static) {
        self.contributions.validators.push(Arc::new(validator));
    }

    pub fn add_reporter(&mut self, reporter: impl Reporter + 'static) {
        self.contributions.reporters.push(Arc::new(reporter));
    }

    pub fn add_progress_column(&mut self, column: impl ProgressColumn + 'static) {
        self.contributions.progress_columns.push(Arc::new(column));
    }

    pub fn add_continuous_validator(&mut self, validator: impl ContinuousValidator + 'static) {
        self.contributions
            .continuous_validators
            .push(Arc::new(validator));
    }

    /// Expose `method` of this plugin as `name` for the given call mode.
    /// Several modes under one name merge into one endpoint.
    ///
    /// # Errors
    ///
    /// Fails if the plugin has no such method or the method serves a
    /// different call mode.
    pub fn add_tool_endpoint(
        &mut self,
        name: &str,
        method: &str,
        mode: CallMode,
    ) -> Result<(), PluginError> {
        let handler = self.plugin.tool_method(method).ok_or_else(|| {
            PluginError::startup(format!(
                "plugin '{}' has no tool method '{method}'",
                self.plugin_id
            ))
        })?;
        if handler.mode() != mode {
            return Err(PluginError::startup(format!(
                "tool method '{method}' of plugin '{}' serves {}, not {mode}",
                self.plugin_id,
                handler.mode()
            )));
        }
        self.merge(ToolEndpoint::new(name).with_handler(handler));
        Ok(())
    }

    /// Expose a fully built endpoint.
    pub fn add_endpoint(&mut self, endpoint: ToolEndpoint) {
        self.merge(endpoint);
    }

    /// Shorthand for a single-handler endpoint.
    pub fn add_handler(&mut self, name: &str, handler: ToolHandler) {
        self.merge(ToolEndpoint::new(name).with_handler(handler));
    }

    pub(super) fn wire_bindings(&mut self, bindings: &ToolBusBindings) -> Result<(), PluginError> {
        bindings
            .iter()
            .try_for_each(|(endpoint, method, mode)| self.add_tool_endpoint(endpoint, method, mode))
    }

    fn merge(&mut self, endpoint: ToolEndpoint) {
        let existing = self
            .contributions
            .endpoints
            .iter_mut()
            .find(|e| e.name == endpoint.name);
        match existing {
            Some(existing) => {
                let ToolEndpoint {
                    invoke,
                    stream,
                    subscribe,
                    metadata,
                    ..
                } = endpoint;
                existing.invoke = invoke.or(existing.invoke.take());
                existing.stream = stream.or(existing.stream.take());
                existing.subscribe = subscribe.or(existing.subscribe.take());
                existing.metadata.extend(metadata);
            }
            None => self.contributions.endpoints.push(endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use stagehand_toolbus::{Reply, sync_invoke_fn};

    use super::*;
    use crate::stage::SetupStage;
    use crate::task::TaskOutput;

    struct Tools;

    impl SetupPlugin for Tools {
        fn name(&self) -> &str {
            "tools"
        }

        fn tool_method(&self, method: &str) -> Option<ToolHandler> {
            (method == "echo").then(|| sync_invoke_fn(|_, payload| Ok(Reply::ok(payload))))
        }
    }

    #[test]
    fn should_buffer_contributions_until_finished() {
        let plugin = Tools;
        let mut registrar = PluginRegistrar::new("tools", &plugin);
        registrar.add_task(SetupTask::new("t", SetupStage::Preflight, |_| {
            Ok(TaskOutput::empty())
        }));
        registrar.add_tool_endpoint("tools.echo", "echo", CallMode::Invoke).unwrap();
        registrar.add_endpoint(
            ToolEndpoint::new("tools.echo").with_metadata("owner", "tools"),
        );

        let contributions = registrar.finish();
        assert_eq!(contributions.tasks.len(), 1);
        assert_eq!(contributions.endpoints.len(), 1);
        let endpoint = contributions.endpoints.first().unwrap();
        assert!(endpoint.supports(CallMode::Invoke));
        assert_eq!(endpoint.metadata.get("owner").map(String::as_str), Some("tools"));
    }

    #[test]
    fn should_reject_unknown_method_and_wrong_mode() {
        let plugin = Tools;
        let mut registrar = PluginRegistrar::new("tools", &plugin);
        let missing = registrar
            .add_tool_endpoint("tools.nope", "nope", CallMode::Invoke)
            .unwrap_err();
        assert!(missing.is_startup());
        assert!(missing.to_string().contains("no tool method 'nope'"));

        let wrong = registrar
            .add_tool_endpoint("tools.echo", "echo", CallMode::Stream)
            .unwrap_err();
        assert!(wrong.to_string().contains("serves invoke, not stream"));
        assert!(registrar.finish().endpoints.is_empty());
    }
}
