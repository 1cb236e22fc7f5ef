//! Change tracking for configuration directories.
//!
//! A [`ChangeSource`] reports file-level events for configuration files.
//! [`TrackedDirectory`] computes them by diffing a directory against its
//! last snapshot; [`DirectoryWatcher`] runs that diff once a burst of OS
//! notifications has settled and forwards the resulting events over a
//! channel to the registry's single consumer loop.

mod tracked;
mod watcher;

use std::fmt;
use std::path::PathBuf;

pub use tracked::TrackedDirectory;
pub use watcher::{DirectoryWatcher, DEFAULT_DEBOUNCE};

/// Why a file event was emitted. A created file is reported as `Updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    Updated,
    Deleted,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated => f.write_str("updated"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// A change to one configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub reason: ChangeReason,
    pub path: PathBuf,
}

impl FileEvent {
    pub fn updated(path: impl Into<PathBuf>) -> Self {
        Self {
            reason: ChangeReason::Updated,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            reason: ChangeReason::Deleted,
            path: path.into(),
        }
    }
}

/// Source of configuration file changes.
pub trait ChangeSource: Send + Sync {
    /// Flush pending notifications: return every change observed since the
    /// previous call. Each change is reported once.
    fn check(&self) -> Vec<FileEvent>;
}
