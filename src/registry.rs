//! Library registry for libreg
//!
//! This module provides the `LibraryRegistry`, which tracks the libraries
//! declared by every configuration file and publishes their union as one
//! lookup namespace.
//!
//! # Concurrency
//!
//! - All writes (file events and `close`) hold the `files` mutex for their
//!   whole duration, so they are serialized.
//! - Lookups clone the published `Arc<LibraryMap>` under a read guard and never
//!   wait on a write in progress, except for the pointer swap itself.
//! - Library `load` and `close` run while the previous map is still being
//!   served; a new map is only published once every entry has a final status.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{LibraryError, Result};
use crate::library::{
    read_library_file, FactoryContext, FileLibraries, IdentityManager, Library, LibraryFactory,
    LibraryStatus, RegisteredLibrary,
};
use crate::tracker::{ChangeReason, ChangeSource, FileEvent};

/// Merged view of every tracked file, keyed by library name.
pub type LibraryMap = BTreeMap<String, Arc<RegisteredLibrary>>;

/// Tunables for a [`LibraryRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Extension of configuration files; other files are ignored.
    pub extension: String,
    /// Ask the change source for pending changes before each lookup.
    pub check_on_read: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            extension: "json".to_string(),
            check_on_read: true,
        }
    }
}

/// Hot-reloadable registry of named library instances.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use libreg::library::LibraryFactory;
/// use libreg::registry::LibraryRegistry;
/// use libreg::tracker::ChangeReason;
///
/// # tokio_test::block_on(async {
/// let dir = std::env::temp_dir().join("libreg-doc-example");
/// std::fs::create_dir_all(&dir).unwrap();
/// let file = dir.join("settings.json");
/// std::fs::write(
///     &file,
///     r#"{ "library": { "settings": { "type": "properties" } } }"#,
/// )
/// .unwrap();
///
/// let registry = LibraryRegistry::new(&dir, None, Arc::new(LibraryFactory::with_builtins()));
/// registry.on_file_event(ChangeReason::Updated, &file).await;
///
/// assert!(registry.get_library("settings").await.is_some());
/// assert_eq!(registry.list_libraries().await["settings"], "properties");
///
/// registry.close().await;
/// assert!(registry.get_library("settings").await.is_none());
/// # })
/// ```
pub struct LibraryRegistry {
    data_directory: PathBuf,
    change_source: Option<Arc<dyn ChangeSource>>,
    factory: Arc<LibraryFactory>,
    options: RegistryOptions,
    /// Per-file maps. Held for the whole of a write.
    files: Mutex<BTreeMap<PathBuf, FileLibraries>>,
    /// Published merge of `files`, only ever replaced wholesale.
    global: RwLock<Arc<LibraryMap>>,
}

impl LibraryRegistry {
    /// Create a registry with default options.
    ///
    /// # Arguments
    /// * `data_directory` - Directory libraries may keep their data in
    /// * `change_source` - Optional source flushed before each lookup
    /// * `factory` - Constructors for the library types files may declare
    pub fn new(
        data_directory: impl Into<PathBuf>,
        change_source: Option<Arc<dyn ChangeSource>>,
        factory: Arc<LibraryFactory>,
    ) -> Self {
        Self {
            data_directory: data_directory.into(),
            change_source,
            factory,
            options: RegistryOptions::default(),
            files: Mutex::new(BTreeMap::new()),
            global: RwLock::new(Arc::new(LibraryMap::new())),
        }
    }

    pub fn with_options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn factory(&self) -> &LibraryFactory {
        &self.factory
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn context(&self) -> FactoryContext {
        FactoryContext::new(&self.data_directory)
    }

    /// Whether `path` has the configured configuration extension.
    pub fn is_configuration_file(&self, path: &Path) -> bool {
        let wanted = self.options.extension.trim_start_matches('.');
        path.extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted))
            .unwrap_or(false)
    }

    /// Apply one change notification.
    ///
    /// Files without the configuration extension are ignored. Parse, load and
    /// close failures are logged and never leave the registry inconsistent.
    pub async fn on_file_event(&self, reason: ChangeReason, path: &Path) {
        if !self.is_configuration_file(path) {
            debug!(file = %path.display(), "Ignoring non-configuration file");
            return;
        }
        match reason {
            ChangeReason::Updated => self.load_library_set(path).await,
            ChangeReason::Deleted => self.unload_library_set(path).await,
        }
    }

    async fn load_library_set(&self, path: &Path) {
        let libraries = match read_library_file(path, &self.factory, &self.context()).await {
            Ok(Some(libraries)) => libraries,
            Ok(None) => {
                debug!(file = %path.display(), "Configuration declares no libraries");
                self.unload_library_set(path).await;
                return;
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "Failed to load library configuration file");
                return;
            }
        };

        info!(
            file = %path.display(),
            libraries = libraries.len(),
            "Load library configuration file"
        );

        let mut files = self.files.lock().await;
        // A Deleted event for this file may have been applied since it was read
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(file = %path.display(), "Configuration file vanished before it was applied");
            return;
        }
        load_libraries(&libraries).await;
        let replaced = files.insert(path.to_path_buf(), libraries);
        self.publish(&files).await;

        if let Some(replaced) = replaced {
            close_libraries(&replaced).await;
        }
    }

    async fn unload_library_set(&self, path: &Path) {
        let mut files = self.files.lock().await;
        let Some(removed) = files.remove(path) else {
            debug!(file = %path.display(), "Configuration file not tracked, nothing to unload");
            return;
        };

        info!(
            file = %path.display(),
            libraries = removed.len(),
            "Unload library configuration file"
        );

        self.publish(&files).await;
        close_libraries(&removed).await;
    }

    async fn publish(&self, files: &BTreeMap<PathBuf, FileLibraries>) {
        let global = Arc::new(build_global_map(files));
        *self.global.write().await = global;
    }

    /// Drain pending changes from the change source and apply them.
    ///
    /// Returns the number of events applied.
    pub async fn refresh(&self) -> usize {
        let Some(source) = self.change_source.as_ref().map(Arc::clone) else {
            return 0;
        };
        let events = match tokio::task::spawn_blocking(move || source.check()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Change source check failed");
                return 0;
            }
        };
        let count = events.len();
        for event in events {
            self.on_file_event(event.reason, &event.path).await;
        }
        count
    }

    async fn check(&self) {
        if self.options.check_on_read {
            self.refresh().await;
        }
    }

    /// The currently published map, without a freshness check.
    pub async fn snapshot(&self) -> Arc<LibraryMap> {
        Arc::clone(&*self.global.read().await)
    }

    /// Look up a library by name. Absence is not an error.
    pub async fn get_library(&self, name: &str) -> Option<Arc<dyn Library>> {
        self.get_entry(name)
            .await
            .map(|entry| Arc::clone(&entry.library))
    }

    /// Look up a library's registry entry (type, source file, status).
    pub async fn get_entry(&self, name: &str) -> Option<Arc<RegisteredLibrary>> {
        self.check().await;
        self.snapshot().await.get(name).cloned()
    }

    /// Names of all registered libraries mapped to their declared type.
    pub async fn list_libraries(&self) -> BTreeMap<String, String> {
        self.check().await;
        self.snapshot()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.type_tag.clone()))
            .collect()
    }

    /// Look up a realm connector.
    ///
    /// # Errors
    /// - `LibraryError::NoSuchRealm` if no library has this name
    /// - `LibraryError::NotARealmConnector` if it lacks the identity capability
    pub async fn get_identity_manager(&self, name: &str) -> Result<Arc<dyn IdentityManager>> {
        let entry = self
            .get_entry(name)
            .await
            .ok_or_else(|| LibraryError::NoSuchRealm(name.to_string()))?;
        Arc::clone(&entry.library)
            .as_identity_manager()
            .ok_or_else(|| LibraryError::NotARealmConnector(name.to_string()))
    }

    /// Configuration files currently contributing libraries.
    pub async fn tracked_files(&self) -> Vec<PathBuf> {
        self.files.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.is_empty()
    }

    /// Apply an `Updated` event for every configuration file in `directory`,
    /// in path order.
    pub async fn load_directory(&self, directory: &Path) -> Result<usize> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if self.is_configuration_file(&path) && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        for path in &paths {
            self.on_file_event(ChangeReason::Updated, path).await;
        }
        Ok(paths.len())
    }

    /// Consume change events until every sender is dropped.
    pub async fn run(&self, mut events: UnboundedReceiver<FileEvent>) {
        info!("Library registry event loop started");
        while let Some(event) = events.recv().await {
            self.on_file_event(event.reason, &event.path).await;
        }
        info!("Library registry event loop stopped");
    }

    /// Close every tracked library and empty the registry.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        let mut files = self.files.lock().await;
        let removed = std::mem::take(&mut *files);
        *self.global.write().await = Arc::new(LibraryMap::new());

        if !removed.is_empty() {
            info!(files = removed.len(), "Closing library registry");
        }
        for libraries in removed.values() {
            close_libraries(libraries).await;
        }
    }
}

/// Merge per-file maps in path order; on a name collision the later path wins.
pub(crate) fn build_global_map(files: &BTreeMap<PathBuf, FileLibraries>) -> LibraryMap {
    let mut libraries = LibraryMap::new();
    for (path, file_libraries) in files {
        for (name, entry) in file_libraries {
            if let Some(shadowed) = libraries.insert(name.clone(), Arc::clone(entry)) {
                warn!(
                    library = %name,
                    shadowed = %shadowed.source.display(),
                    winner = %path.display(),
                    "Library declared in several configuration files"
                );
            }
        }
    }
    libraries
}

async fn load_libraries(libraries: &FileLibraries) {
    let loads = libraries.values().map(|entry| async move {
        match entry.library.load().await {
            Ok(()) => {
                debug!(library = %entry.name, type_tag = %entry.type_tag, "Library loaded");
                entry.set_status(LibraryStatus::loaded());
            }
            Err(e) => {
                warn!(library = %entry.name, error = %e, "Library failed to load, keeping it registered");
                entry.set_status(LibraryStatus::failed(e.to_string()));
            }
        }
    });
    join_all(loads).await;
}

async fn close_libraries(libraries: &FileLibraries) {
    for entry in libraries.values() {
        if let Err(e) = entry.library.close().await {
            error!(library = %entry.name, error = %e, "Failed to close library");
        }
        entry.set_status(LibraryStatus::Closed);
    }
}

/// Holds the application's registry and rejects a second initialization.
///
/// ```rust
/// use std::sync::Arc;
/// use libreg::library::LibraryFactory;
/// use libreg::registry::RegistryCell;
///
/// let cell = RegistryCell::new();
/// let factory = Arc::new(LibraryFactory::with_builtins());
/// assert!(cell.initialize("/tmp/data", None, Arc::clone(&factory)).is_ok());
/// assert!(cell.initialize("/tmp/data", None, factory).is_err());
/// ```
#[derive(Default)]
pub struct RegistryCell {
    registry: OnceCell<Arc<LibraryRegistry>>,
}

impl RegistryCell {
    pub const fn new() -> Self {
        Self {
            registry: OnceCell::new(),
        }
    }

    /// Build and install the registry.
    ///
    /// # Errors
    /// `LibraryError::AlreadyInitialized` if a registry is already installed;
    /// the installed registry is left untouched.
    pub fn initialize(
        &self,
        data_directory: impl Into<PathBuf>,
        change_source: Option<Arc<dyn ChangeSource>>,
        factory: Arc<LibraryFactory>,
    ) -> Result<Arc<LibraryRegistry>> {
        if self.registry.get().is_some() {
            return Err(LibraryError::AlreadyInitialized);
        }
        self.install(LibraryRegistry::new(data_directory, change_source, factory))
    }

    /// Install an already configured registry.
    pub fn install(&self, registry: LibraryRegistry) -> Result<Arc<LibraryRegistry>> {
        let registry = Arc::new(registry);
        self.registry
            .set(Arc::clone(&registry))
            .map_err(|_| LibraryError::AlreadyInitialized)?;
        info!(data_dir = %registry.data_directory().display(), "Library registry initialized");
        Ok(registry)
    }

    pub fn get(&self) -> Option<Arc<LibraryRegistry>> {
        self.registry.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::builtin::test_password_hash;
    use crate::tracker::TrackedDirectory;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::any::Any;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Records every load/close call as `"<step>:<type>:<id>"`.
    #[derive(Default)]
    struct EventLog(std::sync::Mutex<Vec<String>>);

    impl EventLog {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn count(&self, entry: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
        }

        fn count_prefix(&self, prefix: &str) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    struct TestLibrary {
        tag: &'static str,
        id: String,
        version: String,
        fail_load: bool,
        delay: Duration,
        log: Arc<EventLog>,
    }

    fn string_param(decl: &crate::library::LibraryDeclaration, key: &str) -> Option<String> {
        decl.params
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    impl TestLibrary {
        fn new(
            tag: &'static str,
            decl: &crate::library::LibraryDeclaration,
            log: Arc<EventLog>,
        ) -> Self {
            Self {
                tag,
                id: string_param(decl, "id").unwrap_or_default(),
                version: string_param(decl, "version").unwrap_or_default(),
                fail_load: decl.params.get("fail").and_then(Value::as_bool) == Some(true),
                delay: Duration::from_millis(
                    string_param(decl, "delay_ms")
                        .and_then(|d| d.parse().ok())
                        .unwrap_or(0),
                ),
                log,
            }
        }
    }

    #[async_trait]
    impl Library for TestLibrary {
        async fn load(&self) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.push(format!("load:{}:{}", self.tag, self.id));
            if self.fail_load {
                return Err(LibraryError::InstanceLoad {
                    name: self.id.clone(),
                    message: "refused".to_string(),
                });
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.log.push(format!("close:{}:{}", self.tag, self.id));
            if self.id == "sticky" {
                return Err(LibraryError::InstanceClose {
                    name: self.id.clone(),
                    message: "still busy".to_string(),
                });
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn test_factory(log: &Arc<EventLog>) -> LibraryFactory {
        let mut factory = LibraryFactory::with_builtins();
        for tag in ["type_a", "type_b", "type_c"] {
            let log = Arc::clone(log);
            factory.register(tag, move |decl, _ctx| {
                Ok(Arc::new(TestLibrary::new(tag, decl, Arc::clone(&log))) as Arc<dyn Library>)
            });
        }
        factory
    }

    /// `{"library": {name: {"type": tag, "id": name}}}` for each pair.
    fn libs(entries: &[(&str, &str)]) -> String {
        let mut library = serde_json::Map::new();
        for (name, tag) in entries {
            library.insert(name.to_string(), json!({ "type": tag, "id": name }));
        }
        json!({ "library": library }).to_string()
    }

    struct Harness {
        tmp: TempDir,
        log: Arc<EventLog>,
        registry: LibraryRegistry,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(EventLog::default());
        let registry = LibraryRegistry::new(
            tmp.path().join("data"),
            None,
            Arc::new(test_factory(&log)),
        );
        Harness { tmp, log, registry }
    }

    impl Harness {
        fn path(&self, file: &str) -> PathBuf {
            self.tmp.path().join(file)
        }

        async fn update(&self, file: &str, content: &str) -> PathBuf {
            let path = self.path(file);
            fs::write(&path, content).unwrap();
            self.registry
                .on_file_event(ChangeReason::Updated, &path)
                .await;
            path
        }

        async fn delete(&self, file: &str) {
            let path = self.path(file);
            let _ = fs::remove_file(&path);
            self.registry
                .on_file_event(ChangeReason::Deleted, &path)
                .await;
        }
    }

    fn names(map: &BTreeMap<String, String>) -> Vec<(&str, &str)> {
        map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    #[tokio::test]
    async fn test_scenario_walkthrough() {
        let h = harness();

        // 1. a.json declares x: type_a
        h.update("a.json", &libs(&[("x", "type_a")])).await;
        let x = h.registry.get_entry("x").await.unwrap();
        assert_eq!(x.type_tag, "type_a");
        assert!(x.status().is_loaded());
        assert_eq!(h.log.count("load:type_a:x"), 1);

        // 2. b.json adds y: type_b
        h.update("b.json", &libs(&[("y", "type_b")])).await;
        assert_eq!(
            names(&h.registry.list_libraries().await),
            vec![("x", "type_a"), ("y", "type_b")]
        );

        // 3. a.json now declares x: type_c, old instance closed
        h.update("a.json", &libs(&[("x", "type_c")])).await;
        assert_eq!(h.registry.get_entry("x").await.unwrap().type_tag, "type_c");
        assert_eq!(h.log.count("close:type_a:x"), 1);
        assert_eq!(h.log.count("load:type_c:x"), 1);
        assert_eq!(x.status(), LibraryStatus::Closed);

        // 4. b.json deleted
        h.delete("b.json").await;
        assert_eq!(
            names(&h.registry.list_libraries().await),
            vec![("x", "type_c")]
        );
        assert_eq!(h.log.count("close:type_b:y"), 1);

        // 5. type_c is not a realm connector
        let err = h.registry.get_identity_manager("x").await.err().unwrap();
        assert!(matches!(err, LibraryError::NotARealmConnector(ref n) if n == "x"));

        // 6. malformed a.json leaves x untouched
        let before = h.registry.get_library("x").await.unwrap();
        h.update("a.json", "{ this is not json").await;
        let after = h.registry.get_library("x").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(h.log.count_prefix("close:type_c"), 0);
    }

    #[tokio::test]
    async fn test_malformed_file_preserves_observable_state() {
        let h = harness();
        h.update("a.json", &libs(&[("x", "type_a"), ("y", "type_b")]))
            .await;
        let before = h.registry.snapshot().await;

        // Unknown type tag fails the whole file, including the valid sibling
        h.update(
            "a.json",
            r#"{ "library": { "x": { "type": "type_c" }, "z": { "type": "nope" } } }"#,
        )
        .await;

        let after = h.registry.snapshot().await;
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(h.log.count_prefix("close:"), 0);
        assert_eq!(h.log.count_prefix("load:type_c"), 0);
    }

    #[tokio::test]
    async fn test_malformed_new_file_is_not_tracked() {
        let h = harness();
        h.update("broken.json", "[1, 2").await;
        assert!(h.registry.tracked_files().await.is_empty());
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_ignores_other_extensions() {
        let h = harness();
        h.update("a.txt", &libs(&[("x", "type_a")])).await;
        h.update("a", &libs(&[("y", "type_a")])).await;
        assert!(h.registry.list_libraries().await.is_empty());

        h.update("b.JSON", &libs(&[("z", "type_a")])).await;
        assert!(h.registry.get_library("z").await.is_some());
    }

    #[tokio::test]
    async fn test_empty_declaration_unloads_file() {
        let h = harness();
        h.update("a.json", &libs(&[("x", "type_a")])).await;
        h.update("a.json", r#"{ "library": {} }"#).await;

        assert!(h.registry.get_library("x").await.is_none());
        assert!(h.registry.tracked_files().await.is_empty());
        assert_eq!(h.log.count("close:type_a:x"), 1);

        h.update("a.json", &libs(&[("x", "type_a")])).await;
        h.update("a.json", r#"{ "other": true }"#).await;
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_delete_is_noop() {
        let h = harness();
        h.update("a.json", &libs(&[("x", "type_a")])).await;
        h.delete("a.json").await;
        h.delete("a.json").await;
        h.delete("never-seen.json").await;

        assert_eq!(h.log.count("close:type_a:x"), 1);
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_removal_closes_each_contributed_instance_once() {
        let h = harness();
        h.update(
            "a.json",
            &libs(&[("x", "type_a"), ("y", "type_b"), ("z", "type_c")]),
        )
        .await;
        h.update("b.json", &libs(&[("w", "type_a")])).await;

        h.delete("a.json").await;
        assert_eq!(h.log.count("close:type_a:x"), 1);
        assert_eq!(h.log.count("close:type_b:y"), 1);
        assert_eq!(h.log.count("close:type_c:z"), 1);
        assert_eq!(h.log.count("close:type_a:w"), 0);
        assert_eq!(
            names(&h.registry.list_libraries().await),
            vec![("w", "type_a")]
        );
    }

    #[tokio::test]
    async fn test_failed_load_stays_registered() {
        let h = harness();
        h.update(
            "a.json",
            r#"{ "library": {
                "bad": { "type": "type_a", "id": "bad", "fail": true },
                "good": { "type": "type_b", "id": "good" }
            } }"#,
        )
        .await;

        let bad = h.registry.get_entry("bad").await.unwrap();
        match bad.status() {
            LibraryStatus::Error { message, .. } => assert!(message.contains("refused")),
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(h.registry.get_entry("good").await.unwrap().status().is_loaded());
        assert_eq!(h.log.count("load:type_b:good"), 1);
    }

    #[tokio::test]
    async fn test_collision_later_path_wins() {
        let h = harness();
        h.update("b.json", &libs(&[("x", "type_b")])).await;
        h.update("a.json", &libs(&[("x", "type_a")])).await;

        // Independent of update order
        assert_eq!(h.registry.get_entry("x").await.unwrap().type_tag, "type_b");

        h.delete("b.json").await;
        assert_eq!(h.registry.get_entry("x").await.unwrap().type_tag, "type_a");
        assert_eq!(h.log.count("close:type_b:x"), 1);
        assert_eq!(h.log.count("close:type_a:x"), 0);
    }

    #[tokio::test]
    async fn test_reregistration_is_content_stable() {
        let h = harness();
        let content = libs(&[("x", "type_a"), ("y", "type_b")]);

        h.update("a.json", &content).await;
        let first = h.registry.list_libraries().await;
        let first_x = h.registry.get_library("x").await.unwrap();

        h.update("a.json", &content).await;
        let second = h.registry.list_libraries().await;
        let second_x = h.registry.get_library("x").await.unwrap();

        assert_eq!(first, second);
        assert!(!Arc::ptr_eq(&first_x, &second_x));
        assert_eq!(h.log.count("load:type_a:x"), 2);
        assert_eq!(h.log.count("close:type_a:x"), 1);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let h = harness();
        h.update("a.json", &libs(&[("x", "type_a")])).await;
        h.update("b.json", &libs(&[("x", "type_b"), ("y", "type_c")]))
            .await;
        let held = h.registry.get_entry("y").await.unwrap();

        h.registry.close().await;
        assert!(h.registry.list_libraries().await.is_empty());
        assert!(h.registry.tracked_files().await.is_empty());
        // Shadowed instance is closed too
        assert_eq!(h.log.count("close:type_a:x"), 1);
        assert_eq!(h.log.count("close:type_b:x"), 1);
        assert_eq!(h.log.count("close:type_c:y"), 1);
        assert_eq!(held.status(), LibraryStatus::Closed);

        h.registry.close().await;
        assert_eq!(h.log.count_prefix("close:"), 3);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_stop_others() {
        let h = harness();
        h.update("a.json", &libs(&[("sticky", "type_a"), ("x", "type_b")]))
            .await;
        h.delete("a.json").await;

        assert_eq!(h.log.count("close:type_a:sticky"), 1);
        assert_eq!(h.log.count("close:type_b:x"), 1);
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_identity_manager() {
        let h = harness();
        let content = json!({
            "library": {
                "realm": {
                    "type": "static_realm",
                    "users": {
                        "alice": { "password_hash": test_password_hash("secret"), "roles": ["admin"] }
                    }
                },
                "x": { "type": "type_a", "id": "x" }
            }
        })
        .to_string();
        h.update("a.json", &content).await;

        let realm = h.registry.get_identity_manager("realm").await.unwrap();
        let account = realm.verify("alice", "secret").await.unwrap();
        assert!(account.has_role("admin"));
        assert!(realm.verify("alice", "nope").await.is_none());

        let err = h.registry.get_identity_manager("missing").await.err().unwrap();
        assert!(matches!(err, LibraryError::NoSuchRealm(_)));

        let err = h.registry.get_identity_manager("x").await.err().unwrap();
        assert!(matches!(err, LibraryError::NotARealmConnector(_)));
    }

    #[tokio::test]
    async fn test_lookup_miss_is_none() {
        let h = harness();
        assert!(h.registry.get_library("nothing").await.is_none());
        assert!(h.registry.get_entry("nothing").await.is_none());
    }

    #[tokio::test]
    async fn test_freshness_check_applies_pending_changes() {
        let tmp = TempDir::new().unwrap();
        let etc = tmp.path().join("etc");
        fs::create_dir(&etc).unwrap();
        let log = Arc::new(EventLog::default());
        let tracked = Arc::new(TrackedDirectory::new(&etc).with_extension("json"));
        let registry = LibraryRegistry::new(
            tmp.path().join("data"),
            Some(tracked as Arc<dyn ChangeSource>),
            Arc::new(test_factory(&log)),
        );

        fs::write(etc.join("a.json"), libs(&[("x", "type_a")])).unwrap();
        assert!(registry.get_library("x").await.is_some());

        fs::remove_file(etc.join("a.json")).unwrap();
        assert!(registry.get_library("x").await.is_none());
        assert_eq!(log.count("close:type_a:x"), 1);
    }

    #[tokio::test]
    async fn test_check_on_read_disabled_needs_refresh() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(EventLog::default());
        let tracked = Arc::new(TrackedDirectory::new(tmp.path()));
        let registry = LibraryRegistry::new(
            tmp.path(),
            Some(tracked as Arc<dyn ChangeSource>),
            Arc::new(test_factory(&log)),
        )
        .with_options(RegistryOptions {
            check_on_read: false,
            ..Default::default()
        });

        fs::write(tmp.path().join("a.json"), libs(&[("x", "type_a")])).unwrap();
        assert!(registry.get_library("x").await.is_none());

        assert_eq!(registry.refresh().await, 1);
        assert!(registry.get_library("x").await.is_some());
        assert_eq!(registry.refresh().await, 0);
    }

    #[tokio::test]
    async fn test_load_directory() {
        let h = harness();
        fs::write(h.path("a.json"), libs(&[("x", "type_a")])).unwrap();
        fs::write(h.path("b.json"), libs(&[("y", "type_b")])).unwrap();
        fs::write(h.path("readme.md"), "# not config").unwrap();

        let loaded = h.registry.load_directory(h.tmp.path()).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(h.registry.len().await, 2);
        assert_eq!(h.registry.tracked_files().await.len(), 2);
    }

    #[tokio::test]
    async fn test_run_consumes_events_in_order() {
        let h = harness();
        let a = h.path("a.json");
        fs::write(&a, libs(&[("x", "type_a")])).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(FileEvent::updated(&a)).unwrap();
        tx.send(FileEvent::deleted(&a)).unwrap();
        tx.send(FileEvent::updated(&a)).unwrap();
        drop(tx);

        h.registry.run(rx).await;
        assert!(h.registry.get_library("x").await.is_some());
        assert_eq!(h.log.count("load:type_a:x"), 2);
        assert_eq!(h.log.count("close:type_a:x"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_partial_update() {
        fn versioned(version: u32) -> String {
            let entry = |id: &str| {
                json!({
                    "type": "type_a",
                    "id": id,
                    "version": version.to_string(),
                    "delay_ms": "1"
                })
            };
            json!({ "library": { "first": entry("first"), "second": entry("second") } })
                .to_string()
        }

        fn version_of(map: &LibraryMap, name: &str) -> String {
            map[name].downcast_ref::<TestLibrary>().unwrap().version.clone()
        }

        let h = Arc::new(harness());
        h.update("a.json", &versioned(0)).await;

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let h = Arc::clone(&h);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut reads = 0usize;
                loop {
                    let snapshot = h.registry.snapshot().await;
                    assert_eq!(
                        version_of(&snapshot, "first"),
                        version_of(&snapshot, "second"),
                        "reader observed a torn update"
                    );
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        break reads;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for version in 1..=20 {
            h.update("a.json", &versioned(version)).await;
        }
        done.store(true, Ordering::Release);

        assert!(reader.await.unwrap() > 0);
        let last = h.registry.snapshot().await;
        assert_eq!(version_of(&last, "first"), "20");
    }

    #[tokio::test]
    async fn test_update_of_vanished_file_is_discarded() {
        let h = Arc::new(harness());
        let path = h.path("a.json");
        fs::write(&path, libs(&[("x", "type_a")])).unwrap();

        // Hold the writer lock so the update parses and then waits
        let files = h.registry.files.lock().await;
        let pending = {
            let h = Arc::clone(&h);
            let path = path.clone();
            tokio::spawn(async move {
                h.registry
                    .on_file_event(ChangeReason::Updated, &path)
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The deletion lands (and is reported) before the update commits
        fs::remove_file(&path).unwrap();
        drop(files);
        h.registry
            .on_file_event(ChangeReason::Deleted, &path)
            .await;
        pending.await.unwrap();

        assert!(h.registry.get_library("x").await.is_none());
        assert!(h.registry.tracked_files().await.is_empty());
        assert_eq!(h.log.count("load:type_a:x"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let h = Arc::new(harness());
        let mut handles = Vec::new();
        for i in 0..8 {
            let h = Arc::clone(&h);
            handles.push(tokio::spawn(async move {
                let file = format!("f{}.json", i);
                let name = format!("lib{}", i);
                h.update(&file, &libs(&[(name.as_str(), "type_a")])).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(h.registry.len().await, 8);
        assert_eq!(h.registry.tracked_files().await.len(), 8);
    }

    #[test]
    fn test_registry_cell_rejects_second_initialize() {
        let cell = RegistryCell::new();
        assert!(cell.get().is_none());

        let factory = Arc::new(LibraryFactory::with_builtins());
        let first = cell
            .initialize("/tmp/first", None, Arc::clone(&factory))
            .unwrap();

        let err = cell
            .initialize("/tmp/second", None, Arc::clone(&factory))
            .err()
            .unwrap();
        assert!(matches!(err, LibraryError::AlreadyInitialized));

        let err = cell
            .install(LibraryRegistry::new("/tmp/third", None, factory))
            .err()
            .unwrap();
        assert!(matches!(err, LibraryError::AlreadyInitialized));

        let current = cell.get().unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(current.data_directory(), Path::new("/tmp/first"));
    }

    #[test]
    fn test_is_configuration_file() {
        let registry = LibraryRegistry::new("/tmp", None, Arc::new(LibraryFactory::new()))
            .with_options(RegistryOptions {
                extension: ".conf".to_string(),
                check_on_read: false,
            });
        assert!(registry.is_configuration_file(Path::new("/etc/a.conf")));
        assert!(registry.is_configuration_file(Path::new("/etc/a.CONF")));
        assert!(!registry.is_configuration_file(Path::new("/etc/a.json")));
        assert!(!registry.is_configuration_file(Path::new("/etc/conf")));
    }
}
