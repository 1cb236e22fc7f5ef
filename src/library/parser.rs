//! Configuration file parsing.
//!
//! Turns the contents of one configuration file into the map of library
//! instances it declares. Parsing is all-or-nothing: a syntax error, an
//! empty library name, an unknown type tag or a rejected declaration fails
//! the whole file, so the registry can keep the file's previous state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{LibraryError, Result};

use super::factory::{FactoryContext, LibraryFactory};
use super::types::{LibraryDeclaration, RegisteredLibrary};

/// Libraries contributed by one configuration file, keyed by name.
pub type FileLibraries = BTreeMap<String, Arc<RegisteredLibrary>>;

/// Top-level document of a configuration file.
///
/// ```json
/// {
///   "library": {
///     "users": { "type": "static_realm", "users": {} },
///     "settings": { "type": "properties", "properties": { "region": "eu" } }
///   }
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct LibraryConfiguration {
    #[serde(default)]
    pub library: Option<BTreeMap<String, LibraryDeclaration>>,
}

/// Library names are free-form strings; only the empty name is refused.
pub fn is_valid_library_name(name: &str) -> bool {
    !name.is_empty()
}

/// Parse configuration text and build its libraries.
///
/// Returns `Ok(None)` when the document declares no libraries (missing,
/// `null` or empty `library` object), which callers treat like a deletion.
///
/// # Errors
/// `LibraryError::ConfigParse` carrying `path` for any failure.
pub fn parse_library_config(
    path: &Path,
    content: &str,
    factory: &LibraryFactory,
    ctx: &FactoryContext,
) -> Result<Option<FileLibraries>> {
    let parse_error = |message: String| LibraryError::ConfigParse {
        path: path.to_path_buf(),
        message,
    };

    let configuration: LibraryConfiguration =
        json5::from_str(content).map_err(|e| parse_error(e.to_string()))?;

    let declarations = match configuration.library {
        Some(declarations) if !declarations.is_empty() => declarations,
        _ => return Ok(None),
    };

    let mut libraries = FileLibraries::new();
    for (name, declaration) in declarations {
        if !is_valid_library_name(&name) {
            return Err(parse_error("empty library name".to_string()));
        }
        let library = factory
            .create(&declaration, ctx)
            .map_err(|e| parse_error(format!("library '{}': {}", name, e)))?;
        let entry = RegisteredLibrary::new(name.clone(), declaration, path.to_path_buf(), library);
        libraries.insert(name, Arc::new(entry));
    }

    Ok(Some(libraries))
}

/// Read a configuration file from disk and build its libraries.
pub async fn read_library_file(
    path: &Path,
    factory: &LibraryFactory,
    ctx: &FactoryContext,
) -> Result<Option<FileLibraries>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| LibraryError::ConfigParse {
            path: path.to_path_buf(),
            message: format!("failed to read file: {}", e),
        })?;
    parse_library_config(path, &content, factory, ctx)
}
