//! Recipe: the declarative run configuration handed to the orchestrator.
//!
//! Loading recipes from disk is left to callers. This type only answers the
//! questions the orchestrator asks of one.

use std::path::PathBuf;

use serde_json::{Value, json};
use stagehand_core::JsonMap;

use crate::stage::SetupStage;

const CONTINUE_ON_FAILURE: &str = "continue_on_failure";

fn default_config() -> JsonMap {
    let mut config = JsonMap::new();
    config.insert(CONTINUE_ON_FAILURE.to_string(), Value::Bool(false));
    config
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recipe {
    pub name: String,
    pub data: JsonMap,
    pub source: Option<PathBuf>,
}

impl Recipe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Rebuild a recipe from the snapshot stored in a journal header.
    pub fn from_snapshot(name: impl Into<String>, snapshot: JsonMap) -> Self {
        Self {
            name: name.into(),
            data: snapshot,
            source: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: JsonMap) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set `config.<key>`.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        let config = self
            .data
            .entry("config")
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !config.is_object() {
            *config = Value::Object(JsonMap::new());
        }
        if let Value::Object(map) = config {
            map.insert(key.into(), value);
        }
        self
    }

    /// Add tasks to a stage's skip list.
    #[must_use]
    pub fn with_skip<I, S>(mut self, stage: SetupStage, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut stage_config = self.stage_config(stage);
        let skip = stage_config
            .entry("skip")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = skip {
            list.extend(tasks.into_iter().map(|t| Value::String(t.into())));
        }
        let stages = self
            .data
            .entry("stages")
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if let Value::Object(map) = stages {
            map.insert(stage.as_str().to_string(), Value::Object(stage_config));
        }
        self
    }

    /// Defaults merged with `data.config`.
    #[must_use]
    pub fn config(&self) -> JsonMap {
        let mut config = default_config();
        if let Some(Value::Object(overrides)) = self.data.get("config") {
            config.extend(overrides.clone());
        }
        config
    }

    /// `data.stages.<stage>`. A non-object value is wrapped as `{"value": ..}`.
    #[must_use]
    pub fn stage_config(&self, stage: SetupStage) -> JsonMap {
        match self
            .data
            .get("stages")
            .and_then(|stages| stages.get(stage.as_str()))
        {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => JsonMap::new(),
            Some(other) => {
                let mut wrapped = JsonMap::new();
                wrapped.insert("value".to_string(), other.clone());
                wrapped
            }
        }
    }

    /// Task names listed under the stage's `skip` key.
    #[must_use]
    pub fn skip_list(&self, stage: SetupStage) -> Vec<String> {
        self.stage_config(stage)
            .get("skip")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn continue_on_failure(&self) -> bool {
        self.config()
            .get(CONTINUE_ON_FAILURE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The full recipe document: defaults, then `data`, then the name.
    #[must_use]
    pub fn as_dict(&self) -> JsonMap {
        let stages: JsonMap = SetupStage::ORDER
            .iter()
            .map(|stage| (stage.as_str().to_string(), json!({})))
            .collect();
        let mut doc = JsonMap::new();
        doc.insert("config".to_string(), Value::Object(default_config()));
        doc.insert("stages".to_string(), Value::Object(stages));
        doc.extend(self.data.clone());
        doc.insert("name".to_string(), Value::String(self.name.clone()));
        doc
    }
}
