//! Filesystem watcher feeding configuration changes into a channel.
//!
//! The notify callback never touches the registry. Once a burst of events for
//! tracked files has settled it re-runs the tracked directory diff and
//! forwards the events it produces, so the registry's consumer loop remains
//! the only writer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::{LibraryError, Result};

use super::{ChangeSource, FileEvent, TrackedDirectory};

/// Quiet period after the last raw event before the directory is re-checked.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a tracked directory and forwards its changes.
///
/// Dropping the watcher stops it.
pub struct DirectoryWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl DirectoryWatcher {
    /// Start watching `tracked`'s directory with [`DEFAULT_DEBOUNCE`].
    ///
    /// The directory must exist.
    pub fn start(tracked: Arc<TrackedDirectory>, events: UnboundedSender<FileEvent>) -> Result<Self> {
        Self::start_with_debounce(tracked, events, DEFAULT_DEBOUNCE)
    }

    /// Start watching, coalescing raw events that arrive within `debounce`.
    pub fn start_with_debounce(
        tracked: Arc<TrackedDirectory>,
        events: UnboundedSender<FileEvent>,
        debounce: Duration,
    ) -> Result<Self> {
        let directory = tracked.directory().to_path_buf();
        let source = Arc::clone(&tracked);

        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            match result {
                Ok(batch) => {
                    if !batch.iter().any(|event| is_relevant(&source, &event.path)) {
                        return;
                    }
                    for change in source.check() {
                        debug!(reason = %change.reason, file = %change.path.display(), "Configuration change detected");
                        if events.send(change).is_err() {
                            debug!("Change receiver dropped, ignoring event");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = ?e, "File watcher error"),
            }
        })
        .map_err(|e| LibraryError::Watch(format!("Failed to create file watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| {
                LibraryError::Watch(format!(
                    "Failed to watch directory {}: {}",
                    directory.display(),
                    e
                ))
            })?;

        info!(
            dir = %directory.display(),
            debounce_ms = debounce.as_millis() as u64,
            "Started watching library configuration directory"
        );

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Only tracked files, or the directory itself, can change the registry.
fn is_relevant(tracked: &TrackedDirectory, path: &Path) -> bool {
    path == tracked.directory() || tracked.tracks(path)
}
