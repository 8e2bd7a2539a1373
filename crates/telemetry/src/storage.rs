//! Storage adapters for telemetry events.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{Error, Result};
use crate::event::TelemetryEvent;

/// Persists events and hands them back for knowledge-base hydration.
pub trait TelemetryStorage: Send + Sync {
    /// Accept one event. Adapters may buffer until [`TelemetryStorage::flush`].
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be accepted.
    fn persist(&self, event: &TelemetryEvent) -> Result<()>;

    /// Write buffered events to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; buffered events are kept for the next
    /// attempt.
    fn flush(&self) -> Result<()>;

    /// Previously persisted events.
    ///
    /// # Errors
    ///
    /// Returns an error if storage exists but cannot be read.
    fn bootstrap(&self) -> Result<Vec<TelemetryEvent>>;
}

/// Non-persistent storage, used by tests and when telemetry files are disabled.
#[derive(Debug, Default)]
pub struct InMemoryTelemetryStorage {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl InMemoryTelemetryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything persisted so far.
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetryStorage for InMemoryTelemetryStorage {
    fn persist(&self, event: &TelemetryEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn bootstrap(&self) -> Result<Vec<TelemetryEvent>> {
        Ok(self.events())
    }
}

/// Append-only JSON-lines file, one event per line.
#[derive(Debug)]
pub struct JsonlTelemetryStorage {
    path: PathBuf,
    buffer: Mutex<Vec<TelemetryEvent>>,
}

impl JsonlTelemetryStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetryStorage for JsonlTelemetryStorage {
    fn persist(&self, event: &TelemetryEvent) -> Result<()> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.is_empty() {
            return Ok(());
        }
        let lines = buffer
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::storage(&self.path, e))?;
        let mut content = lines.join("\n");
        content.push('\n');
        file.write_all(content.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| Error::storage(&self.path, e))?;
        buffer.clear();
        Ok(())
    }

    fn bootstrap(&self) -> Result<Vec<TelemetryEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).map_err(|e| Error::storage(&self.path, e))?;
        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::storage(&self.path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => debug!(path = %self.path.display(), line = index, error = %e, "Skipping unreadable telemetry line"),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;
    use stagehand_core::json::object;

    use super::*;
    use crate::event::TelemetryEventType;

    #[test]
    fn should_only_write_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlTelemetryStorage::new(dir.path().join("nested/events.jsonl"));

        storage
            .persist(&TelemetryEvent::task(object([("task", json!("a"))])))
            .unwrap();
        assert!(!storage.path().exists());

        storage.flush().unwrap();
        let events = storage.bootstrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TelemetryEventType::Task);
    }

    #[test]
    fn should_skip_corrupt_lines_on_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let good = serde_json::to_string(&TelemetryEvent::now(
            TelemetryEventType::Run,
            object([("recipe", json!("demo"))]),
        ))
        .unwrap();
        std::fs::write(&path, format!("{{broken\n\n{good}\n")).unwrap();

        let events = JsonlTelemetryStorage::new(&path).bootstrap().unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata["recipe"], json!("demo"));
    }

    #[test]
    fn should_bootstrap_empty_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlTelemetryStorage::new(dir.path().join("absent.jsonl"));
        assert!(storage.bootstrap().unwrap().is_empty());
    }
}
