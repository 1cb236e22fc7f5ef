//! Library factory: the table of constructors keyed by type tag.
//!
//! Every supported library type registers a constructor under a string tag.
//! Configuration parsing resolves each declaration's `type` through this
//! table, so adding a library type is a single `register` call at startup.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LibraryError, Result};

use super::builtin;
use super::types::{Library, LibraryDeclaration};

/// Values a constructor may need besides its own declaration.
#[derive(Debug, Clone)]
pub struct FactoryContext {
    /// Directory libraries may keep their data in.
    pub data_directory: PathBuf,
}

impl FactoryContext {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
        }
    }

    /// Resolve a possibly relative path against the data directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_directory.join(path)
        }
    }
}

/// Constructor signature stored in the factory.
pub type Constructor =
    Arc<dyn Fn(&LibraryDeclaration, &FactoryContext) -> Result<Arc<dyn Library>> + Send + Sync>;

/// Table of library constructors keyed by type tag.
///
/// # Example
///
/// ```rust
/// use libreg::library::{FactoryContext, LibraryDeclaration, LibraryFactory};
///
/// let factory = LibraryFactory::with_builtins();
/// assert!(factory.contains("properties"));
///
/// let ctx = FactoryContext::new("/tmp/libreg-data");
/// let library = factory
///     .create(&LibraryDeclaration::new("properties"), &ctx)
///     .unwrap();
/// assert!(library.as_identity_manager().is_none());
/// ```
#[derive(Default, Clone)]
pub struct LibraryFactory {
    constructors: HashMap<String, Constructor>,
}

impl LibraryFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with every built-in library type registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        builtin::register_builtins(&mut factory);
        factory
    }

    /// Register a constructor under a type tag.
    ///
    /// Registering an existing tag replaces the previous constructor.
    pub fn register<F>(&mut self, type_tag: impl Into<String>, constructor: F)
    where
        F: Fn(&LibraryDeclaration, &FactoryContext) -> Result<Arc<dyn Library>>
            + Send
            + Sync
            + 'static,
    {
        let type_tag = type_tag.into();
        if self
            .constructors
            .insert(type_tag.clone(), Arc::new(constructor))
            .is_some()
        {
            warn!(type_tag = %type_tag, "Replacing library constructor");
        } else {
            debug!(type_tag = %type_tag, "Registered library constructor");
        }
    }

    /// Check whether a constructor is registered for a tag.
    pub fn contains(&self, type_tag: &str) -> bool {
        self.constructors.contains_key(type_tag)
    }

    /// All registered tags, sorted.
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    /// Build a library instance from its declaration.
    ///
    /// # Errors
    /// - `LibraryError::UnknownType` if no constructor is registered for the tag
    /// - whatever the constructor returns, typically `InvalidDeclaration`
    pub fn create(
        &self,
        declaration: &LibraryDeclaration,
        ctx: &FactoryContext,
    ) -> Result<Arc<dyn Library>> {
        let constructor = self
            .constructors
            .get(&declaration.type_tag)
            .ok_or_else(|| LibraryError::UnknownType(declaration.type_tag.clone()))?;
        constructor(declaration, ctx)
    }
}

impl fmt::Debug for LibraryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryFactory")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}
