//! Plugin manifest data types.
//!
//! Parsing the boot manifest file is the caller's job; these types only
//! describe one plugin entry and the profile's developer settings, with
//! serde defaults so partial entries deserialize.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_toolbus::CallMode;

/// Runtime kind handled by [`super::runtime::NativeRuntimeManager`].
pub const NATIVE_RUNTIME: &str = "native";

fn native() -> String {
    NATIVE_RUNTIME.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub identifier: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeConfiguration,
    #[serde(default)]
    pub capabilities: PluginCapabilities,
    #[serde(default)]
    pub resources: ResourceBudget,
    #[serde(default)]
    pub dev: PluginDevSettings,
    #[serde(default)]
    pub toolbus: ToolBusBindings,
}

impl PluginDefinition {
    /// A native plugin resolved through `entrypoint`.
    pub fn native(identifier: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            version: None,
            description: None,
            runtime: RuntimeConfiguration {
                entrypoint: Some(entrypoint.into()),
                ..RuntimeConfiguration::default()
            },
            capabilities: PluginCapabilities::default(),
            resources: ResourceBudget::default(),
            dev: PluginDevSettings::default(),
            toolbus: ToolBusBindings::default(),
        }
    }

    /// Wall-time budget in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: u64) -> Self {
        self.resources.timeout = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_hot_reload<I, P>(mut self, watch_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.dev.hot_reload = true;
        self.dev.watch_paths = watch_paths.into_iter().map(Into::into).collect();
        self
    }

    /// Bind a tool-bus endpoint to a plugin method.
    #[must_use]
    pub fn with_tool(
        mut self,
        mode: CallMode,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        let map = match mode {
            CallMode::Invoke => &mut self.toolbus.invoke,
            CallMode::Stream => &mut self.toolbus.stream,
            CallMode::Subscribe => &mut self.toolbus.subscribe,
        };
        map.insert(endpoint.into(), method.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfiguration {
    #[serde(default = "native")]
    pub kind: String,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            kind: native(),
            entrypoint: None,
            module: None,
            handler: None,
            features: Vec::new(),
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCapabilities {
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub sandbox: Vec<String>,
}

/// Resource limits. Only `timeout` is enforced in-process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub disk: Option<String>,
    #[serde(default)]
    pub gpu: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ResourceBudget {
    #[must_use]
    pub fn wall_time(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDevSettings {
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default)]
    pub locales: Vec<String>,
}

/// Profile-wide developer settings; `hot_reload` here applies to every plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDevSettings {
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default)]
    pub locales: Vec<String>,
}

/// `endpoint name -> plugin method` per call kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBusBindings {
    #[serde(default)]
    pub invoke: BTreeMap<String, String>,
    #[serde(default)]
    pub stream: BTreeMap<String, String>,
    #[serde(default)]
    pub subscribe: BTreeMap<String, String>,
}

impl ToolBusBindings {
    /// Every binding as `(endpoint, method, mode)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, CallMode)> {
        fn tag(map: &BTreeMap<String, String>, mode: CallMode) -> Vec<(&str, &str, CallMode)> {
            map.iter()
                .map(|(endpoint, method)| (endpoint.as_str(), method.as_str(), mode))
                .collect()
        }
        tag(&self.invoke, CallMode::Invoke)
            .into_iter()
            .chain(tag(&self.stream, CallMode::Stream))
            .chain(tag(&self.subscribe, CallMode::Subscribe))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invoke.is_empty() && self.stream.is_empty() && self.subscribe.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn should_fill_defaults_for_minimal_entry() {
        let def: PluginDefinition =
            serde_json::from_value(json!({"identifier": "dummy"})).unwrap();
        assert_eq!(def.runtime.kind, NATIVE_RUNTIME);
        assert!(def.resources.wall_time().is_none());
        assert!(!def.dev.hot_reload);
        assert!(def.toolbus.is_empty());
    }

    #[test]
    fn should_parse_toolbus_block() {
        let def: PluginDefinition = serde_json::from_value(json!({
            "identifier": "dummy",
            "runtime": {"kind": "native", "entrypoint": "dummy:Plugin"},
            "resources": {"timeout": 5},
            "toolbus": {"invoke": {"tools.dummy": "handle"}, "stream": {"tools.tail": "tail"}}
        }))
        .unwrap();
        let bindings: Vec<_> = def.toolbus.iter().collect();
        assert_eq!(
            bindings,
            vec![
                ("tools.dummy", "handle", CallMode::Invoke),
                ("tools.tail", "tail", CallMode::Stream),
            ]
        );
        assert_eq!(def.resources.wall_time(), Some(Duration::from_secs(5)));
    }
}
