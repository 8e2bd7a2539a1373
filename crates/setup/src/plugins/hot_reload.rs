//! File watcher that triggers plugin reloads.
//!
//! Declared paths are handed to a [`notify::PollWatcher`] scanning every
//! interval. Directories are watched recursively, files on their own, and a
//! path that does not exist yet is tracked through its parent so its
//! creation counts as a change. Events are mapped back to the plugins whose
//! declared paths contain them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use notify::{Event, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Polling faster than this only burns CPU.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Events for the same plugin closer together than this fire one reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// How long [`HotReloadController::poll_once`] waits for a forced scan to
/// report.
const SETTLE: Duration = Duration::from_millis(300);

/// Called with the identifier of a plugin whose files changed.
pub type ReloadCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// State shared with the watcher's event handler.
#[derive(Default)]
struct Shared {
    watches: Mutex<HashMap<String, Vec<PathBuf>>>,
    callback: Mutex<Option<ReloadCallback>>,
    /// Set while `poll_once` collects the result of a forced scan.
    waiter: Mutex<Option<Sender<String>>>,
    fired: Mutex<HashMap<String, Instant>>,
}

impl Shared {
    /// Plugins owning any of `paths`, sorted.
    fn owners(&self, paths: &[PathBuf]) -> Vec<String> {
        let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        let owners: BTreeSet<String> = watches
            .iter()
            .filter(|(_, declared)| {
                paths
                    .iter()
                    .any(|changed| declared.iter().any(|d| changed.starts_with(d)))
            })
            .map(|(id, _)| id.clone())
            .collect();
        owners.into_iter().collect()
    }

    fn handle(&self, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "Hot reload watcher error");
                return;
            }
        };
        let ids = self.owners(&event.paths);
        if ids.is_empty() {
            return;
        }

        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waiter) = waiter {
            for id in ids {
                let _ = waiter.send(id);
            }
            return;
        }

        let now = Instant::now();
        let fresh: Vec<String> = {
            let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
            ids.into_iter()
                .filter(|id| {
                    let recent = fired
                        .get(id)
                        .is_some_and(|at| now.saturating_duration_since(*at) < DEBOUNCE);
                    if !recent {
                        fired.insert(id.clone(), now);
                    }
                    !recent
                })
                .collect()
        };
        self.dispatch(&fresh);
    }

    fn dispatch(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            for id in ids {
                debug!(plugin = %id, "Plugin sources changed");
                callback(id);
            }
        }
    }

    /// What the watcher has to observe for the current declarations.
    fn targets(&self) -> HashMap<PathBuf, RecursiveMode> {
        let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        let mut targets = HashMap::new();
        for path in watches.values().flatten() {
            let Some((target, mode)) = target_for(path) else {
                debug!(path = %path.display(), "Watch path has no existing parent; ignoring");
                continue;
            };
            let entry = targets.entry(target).or_insert(mode);
            if mode == RecursiveMode::Recursive {
                *entry = mode;
            }
        }
        targets
    }
}

fn target_for(path: &Path) -> Option<(PathBuf, RecursiveMode)> {
    if path.is_dir() {
        return Some((path.to_path_buf(), RecursiveMode::Recursive));
    }
    if path.exists() {
        return Some((path.to_path_buf(), RecursiveMode::NonRecursive));
    }
    let parent = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => return None,
    };
    parent
        .is_dir()
        .then(|| (parent.to_path_buf(), RecursiveMode::NonRecursive))
}

struct Running {
    watcher: PollWatcher,
    targets: HashMap<PathBuf, RecursiveMode>,
}

pub struct HotReloadController {
    interval: Duration,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl HotReloadController {
    /// `interval` is clamped to [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            shared: Arc::new(Shared::default()),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_callback(&self, callback: ReloadCallback) {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Start (or replace) the watch for `plugin_id`. Empty `paths` removes it.
    pub fn watch(&self, plugin_id: &str, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            self.unwatch(plugin_id);
            return;
        }
        debug!(plugin = plugin_id, paths = ?paths, "Watching plugin sources");
        self.shared
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), paths);
        self.retarget();
    }

    /// Stop watching `plugin_id`; the watcher stops with the last watch.
    pub fn unwatch(&self, plugin_id: &str) {
        let now_empty = {
            let mut watches = self
                .shared
                .watches
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            watches.remove(plugin_id);
            watches.is_empty()
        };
        if now_empty {
            self.stop();
        } else {
            self.retarget();
        }
    }

    #[must_use]
    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Force a scan, invoke the callback for changed plugins and return
    /// their identifiers.
    pub fn poll_once(&self) -> Vec<String> {
        let (tx, rx) = mpsc::channel();
        *self
            .shared
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let requested = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.watcher.poll());
        let mut changed = BTreeSet::new();
        match requested {
            Some(Ok(())) => {
                let deadline = Instant::now().checked_add(SETTLE);
                while let Some(left) = deadline.and_then(|d| d.checked_duration_since(Instant::now())) {
                    match rx.recv_timeout(left) {
                        Ok(id) => {
                            changed.insert(id);
                        }
                        Err(_) => break,
                    }
                }
            }
            Some(Err(err)) => warn!(error = %err, "Could not request a hot reload scan"),
            None => {}
        }

        *self
            .shared
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        // Events that raced the window closing are still ours.
        changed.extend(rx.try_iter());
        let changed: Vec<String> = changed.into_iter().collect();
        self.shared.dispatch(&changed);
        changed
    }

    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if running.is_some() {
            debug!("Stopped hot reload watcher");
        }
    }

    /// Bring the watcher's targets in line with the declared paths,
    /// starting it on first use.
    fn retarget(&self) {
        let desired = self.shared.targets();
        let mut slot = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            let shared = Arc::clone(&self.shared);
            let config = notify::Config::default().with_poll_interval(self.interval);
            match PollWatcher::new(move |result: notify::Result<Event>| shared.handle(result), config) {
                Ok(watcher) => {
                    *slot = Some(Running {
                        watcher,
                        targets: HashMap::new(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "Could not start hot reload watcher");
                    return;
                }
            }
        }
        let Some(running) = slot.as_mut() else {
            return;
        };

        let stale: Vec<PathBuf> = running
            .targets
            .iter()
            .filter(|(path, mode)| desired.get(*path) != Some(*mode))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Err(err) = running.watcher.unwatch(&path) {
                debug!(path = %path.display(), error = %err, "Could not unwatch path");
            }
            running.targets.remove(&path);
        }
        for (path, mode) in desired {
            if running.targets.contains_key(&path) {
                continue;
            }
            match running.watcher.watch(&path, mode) {
                Ok(()) => {
                    running.targets.insert(path, mode);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "Could not watch path"),
            }
        }
    }
}

impl Drop for HotReloadController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for HotReloadController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloadController")
            .field("interval", &self.interval)
            .field("watched", &self.watched())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::fs;
    use std::time::SystemTime;

    use super::*;

    fn bump(path: &Path, secs: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        let later = SystemTime::UNIX_EPOCH
            .checked_add(Duration::from_secs(secs))
            .unwrap();
        file.set_modified(later).unwrap();
    }

    #[test]
    fn should_clamp_interval() {
        let controller = HotReloadController::new(Duration::from_millis(10));
        assert_eq!(controller.interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn should_report_changed_plugins_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugin.rs");
        fs::write(&file, "v1").unwrap();
        bump(&file, 1_000);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let controller = HotReloadController::new(Duration::from_secs(60));
        controller.set_callback(Arc::new(move |id: &str| {
            sink.lock().unwrap().push(id.to_string());
        }));
        controller.watch("p", vec![dir.path().to_path_buf()]);
        assert!(controller.is_running());
        assert!(controller.poll_once().is_empty());

        bump(&file, 2_000_000_000);
        assert_eq!(controller.poll_once(), vec!["p".to_string()]);
        assert!(controller.poll_once().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["p".to_string()]);
    }

    #[test]
    fn should_only_report_plugins_owning_the_changed_path() {
        let dir = tempfile::tempdir().unwrap();
        let mine = dir.path().join("mine.toml");
        let theirs = dir.path().join("theirs.toml");
        fs::write(&mine, "a").unwrap();
        fs::write(&theirs, "b").unwrap();
        bump(&mine, 1_000);
        bump(&theirs, 1_000);

        let controller = HotReloadController::new(Duration::from_secs(60));
        controller.watch("mine", vec![mine.clone()]);
        controller.watch("theirs", vec![theirs]);
        assert_eq!(controller.watched(), vec!["mine".to_string(), "theirs".to_string()]);

        bump(&mine, 2_000_000_000);
        assert_eq!(controller.poll_once(), vec!["mine".to_string()]);
    }

    #[test]
    fn should_stop_when_last_watch_removed() {
        let dir = tempfile::tempdir().unwrap();
        let controller = HotReloadController::new(Duration::from_secs(60));
        controller.watch("a", vec![dir.path().to_path_buf()]);
        controller.watch("b", vec![dir.path().to_path_buf()]);
        controller.unwatch("a");
        assert!(controller.is_running());
        controller.watch("b", Vec::new());
        assert!(!controller.is_running());
        assert!(controller.watched().is_empty());
        assert!(controller.poll_once().is_empty());
    }

    #[test]
    fn should_treat_missing_path_appearing_as_change() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("later.toml");
        let controller = HotReloadController::new(Duration::from_secs(60));
        controller.watch("p", vec![target.clone()]);
        assert!(controller.poll_once().is_empty());
        fs::write(&target, "x").unwrap();
        assert_eq!(controller.poll_once(), vec!["p".to_string()]);
        controller.stop();
    }
}
