//! Append-only JSONL run journal.
//!
//! A file starts with one `run` record, may contain `resume` records from
//! later resumed runs, and otherwise holds one `result` record per task
//! attempt. Every write is flushed so a crash loses at most the attempt in
//! flight.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stagehand_core::JsonMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::SetupEvent;
use crate::recipe::Recipe;
use crate::result::SetupResult;
use crate::stage::{SetupStage, SetupStatus};

const JOURNAL_EXTENSION: &str = "jsonl";
const MAX_NAME_COLLISIONS: u32 = 1000;

/// Header written when a run opens a fresh journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub recipe_name: String,
    #[serde(default)]
    pub recipe: JsonMap,
    #[serde(default)]
    pub stages: Vec<SetupStage>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_source: Option<String>,
}

/// Marker appended when a later run resumes this journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    #[serde(default)]
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stages: Vec<SetupStage>,
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JournalEntry {
    Run(RunRecord),
    Resume(ResumeRecord),
    Result(SetupResult),
}

/// A journal read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupRunJournal {
    pub path: PathBuf,
    /// The `run` header without its `type` tag.
    pub metadata: JsonMap,
    /// Every recorded attempt, in file order.
    pub results: Vec<SetupResult>,
}

impl SetupRunJournal {
    #[must_use]
    pub fn header(&self) -> Option<RunRecord> {
        serde_json::from_value(Value::Object(self.metadata.clone())).ok()
    }

    #[must_use]
    pub fn recipe_name(&self) -> Option<&str> {
        self.metadata.get("recipe_name").and_then(Value::as_str)
    }

    /// Rebuild the recipe from the stored name and snapshot.
    #[must_use]
    pub fn to_recipe(&self) -> Option<Recipe> {
        let name = self.recipe_name()?;
        let snapshot = self
            .metadata
            .get("recipe")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let recipe = Recipe::from_snapshot(name, snapshot);
        Some(
            match self.metadata.get("recipe_source").and_then(Value::as_str) {
                Some(source) => recipe.with_source(source),
                None => recipe,
            },
        )
    }

    /// The last attempt of each task, in order of first appearance.
    #[must_use]
    pub fn latest_results(&self) -> Vec<SetupResult> {
        let latest: HashMap<&str, &SetupResult> =
            self.results.iter().map(|r| (r.task.as_str(), r)).collect();
        self.results
            .iter()
            .map(|r| r.task.as_str())
            .unique()
            .filter_map(|task| latest.get(task).map(|r| (*r).clone()))
            .collect()
    }

    /// Tasks whose latest attempt succeeded.
    #[must_use]
    pub fn successful_results(&self) -> HashMap<String, SetupResult> {
        self.latest_results()
            .into_iter()
            .filter(SetupResult::is_success)
            .map(|r| (r.task.clone(), r))
            .collect()
    }

    /// Dashboard events reconstructing the recorded run, for replay.
    #[must_use]
    pub fn iter_events(&self) -> Vec<SetupEvent> {
        let mut events = Vec::new();
        for (stage, group) in &self.results.iter().chunk_by(|r| r.stage) {
            let results: Vec<&SetupResult> = group.collect();
            events.push(SetupEvent::stage(stage, "started", journal_source()));
            events.extend(results.iter().map(|r| journal_task_event(r)));
            events.push(journal_stage_event(stage, &results));
        }
        events
    }
}

fn journal_source() -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("source".into(), json!("journal"));
    payload
}

fn journal_task_event(result: &SetupResult) -> SetupEvent {
    let mut payload = journal_source();
    if !result.payload.is_empty() {
        payload.insert("payload".into(), Value::Object(result.payload.clone()));
    }
    match result.status {
        SetupStatus::Success => SetupEvent::task(&result.task, result.stage, "completed", payload),
        SetupStatus::Skipped => SetupEvent::task(&result.task, result.stage, "skipped", payload),
        SetupStatus::Failed => SetupEvent::task_failed(
            &result.task,
            result.stage,
            result.error.as_ref().map(ToString::to_string),
            payload,
        ),
    }
}

fn journal_stage_event(stage: SetupStage, results: &[&SetupResult]) -> SetupEvent {
    let status = match results.last() {
        Some(last) if last.is_failed() => "failed",
        _ if results.iter().all(|r| r.status == SetupStatus::Skipped) => "skipped",
        _ => "completed",
    };
    let mut payload = journal_source();
    payload.insert(
        "results".into(),
        Value::Array(results.iter().map(|r| r.to_json()).collect()),
    );
    SetupEvent::stage(stage, status, payload)
}

/// Open journal file for the run in progress.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl JournalWriter {
    /// Start a new journal file in `dir` and write the run header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Journal`] if the directory or file cannot be created.
    pub fn create(dir: &Path, header: RunRecord) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::journal(dir, &e))?;
        let stem = header.timestamp.format("%Y%m%dT%H%M%S").to_string();
        let (path, file) = create_unique(dir, &stem)?;
        debug!(path = %path.display(), "Opened setup journal");
        let mut writer = Self {
            path,
            file: BufWriter::new(file),
        };
        writer.write(&JournalEntry::Run(header))?;
        Ok(writer)
    }

    /// Reopen an existing journal and append a resume marker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Journal`] if the file cannot be opened or written.
    pub fn resume(path: &Path, marker: ResumeRecord) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| Error::journal(path, &e))?;
        debug!(path = %path.display(), "Resuming setup journal");
        let mut writer = Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
        };
        writer.write(&JournalEntry::Resume(marker))?;
        Ok(writer)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    ///
    /// Returns [`Error::Journal`] if the record cannot be written.
    pub fn record(&mut self, result: &SetupResult) -> Result<()> {
        self.write(&JournalEntry::Result(result.clone()))
    }

    fn write(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.file, "{line}")
            .and_then(|()| self.file.flush())
            .map_err(|e| Error::journal(&self.path, &e))
    }
}

fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    let mut last_err = None;
    for n in 0..MAX_NAME_COLLISIONS {
        let name = if n == 0 {
            format!("{stem}.{JOURNAL_EXTENSION}")
        } else {
            format!("{stem}-{n}.{JOURNAL_EXTENSION}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => last_err = Some(err),
            Err(err) => return Err(Error::journal(&path, &err)),
        }
    }
    let err = last_err.unwrap_or_else(|| std::io::Error::from(ErrorKind::AlreadyExists));
    Err(Error::journal(dir.join(stem), &err))
}

/// Read a journal. Blank and unparseable lines are skipped.
///
/// # Errors
///
/// Returns [`Error::Journal`] if the file cannot be read or has no `run`
/// header.
pub fn load_journal(path: &Path) -> Result<SetupRunJournal> {
    let text = fs::read_to_string(path).map_err(|e| Error::journal(path, &e))?;
    let mut metadata: Option<JsonMap> = None;
    let mut results = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(Value::Object(mut record)) = serde_json::from_str::<Value>(line) else {
            debug!(path = %path.display(), "Skipping unparseable journal line");
            continue;
        };
        match record.get("type").and_then(Value::as_str) {
            Some("run") => {
                if metadata.is_none() {
                    record.remove("type");
                    metadata = Some(record);
                }
            }
            Some("resume") => {}
            _ => match serde_json::from_value::<SetupResult>(Value::Object(record)) {
                Ok(result) => results.push(result),
                Err(err) => debug!(path = %path.display(), error = %err, "Skipping bad journal record"),
            },
        }
    }
    let metadata = metadata.ok_or_else(|| Error::Journal {
        path: path.to_path_buf(),
        reason: "missing run header".to_string(),
    })?;
    Ok(SetupRunJournal {
        path: path.to_path_buf(),
        metadata,
        results,
    })
}

/// The most recently modified loadable journal in `dir`.
#[must_use]
pub fn load_last_run(dir: &Path) -> Option<SetupRunJournal> {
    let pattern = dir.join(format!("*.{JOURNAL_EXTENSION}"));
    let candidates = glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .sorted_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    candidates
        .into_iter()
        .find_map(|(_, path)| match load_journal(&path) {
            Ok(journal) => Some(journal),
            Err(err) => {
                debug!(error = %err, "Skipping unreadable journal");
                None
            }
        })
}
