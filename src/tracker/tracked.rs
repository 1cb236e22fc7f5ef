//! Snapshot-diffing change source over a single directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{ChangeSource, FileEvent};

/// What a file looked like at the last scan.
///
/// The content digest catches same-size rewrites that land inside the
/// filesystem's mtime granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    digest: Option<[u8; 32]>,
}

impl FileStamp {
    fn read(path: &Path, meta: &fs::Metadata) -> Self {
        let digest = match fs::read(path) {
            Ok(content) => Some(Sha256::digest(&content).into()),
            Err(e) => {
                debug!(file = %path.display(), error = %e, "Failed to read tracked file");
                None
            }
        };
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            digest,
        }
    }
}

/// A directory whose files are compared against the last seen snapshot.
///
/// The first [`check`](ChangeSource::check) reports every existing file as
/// updated. A missing directory is treated as empty.
#[derive(Debug)]
pub struct TrackedDirectory {
    directory: PathBuf,
    extension: Option<String>,
    snapshot: Mutex<HashMap<PathBuf, FileStamp>>,
}

impl TrackedDirectory {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            extension: None,
            snapshot: Mutex::new(HashMap::new()),
        }
    }

    /// Only track files with this extension (case-insensitive).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into().trim_start_matches('.').to_lowercase());
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether `path` has the tracked extension.
    pub fn tracks(&self, path: &Path) -> bool {
        match &self.extension {
            None => true,
            Some(wanted) => path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase() == *wanted)
                .unwrap_or(false),
        }
    }

    fn scan(&self) -> HashMap<PathBuf, FileStamp> {
        let mut files = HashMap::new();
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.directory.display(), "Tracked directory does not exist");
                return files;
            }
            Err(e) => {
                warn!(dir = %self.directory.display(), error = %e, "Failed to scan tracked directory");
                return files;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !self.tracks(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let stamp = FileStamp::read(&path, &meta);
            files.insert(path, stamp);
        }
        files
    }
}

impl ChangeSource for TrackedDirectory {
    fn check(&self) -> Vec<FileEvent> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.scan();

        let mut deleted: Vec<PathBuf> = snapshot
            .keys()
            .filter(|path| !current.contains_key(*path))
            .cloned()
            .collect();
        let mut updated: Vec<PathBuf> = current
            .iter()
            .filter(|(path, stamp)| snapshot.get(*path) != Some(*stamp))
            .map(|(path, _)| path.clone())
            .collect();
        deleted.sort();
        updated.sort();

        *snapshot = current;

        deleted
            .into_iter()
            .map(FileEvent::deleted)
            .chain(updated.into_iter().map(FileEvent::updated))
            .collect()
    }
}
