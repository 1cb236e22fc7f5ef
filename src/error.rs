//! Error types for libreg
//!
//! This module defines all error types used throughout the registry.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! Only caller-facing contract violations (double initialization, realm
//! lookups) are returned from the public registry API. Parse, load and close
//! failures are contained where they happen and only show up in logs and in
//! [`LibraryStatus`](crate::library::LibraryStatus).

use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for libreg operations.
#[derive(Error, Debug)]
pub enum LibraryError {
    /// The registry cell was initialized a second time.
    #[error("Library registry already initialized")]
    AlreadyInitialized,

    /// A configuration file could not be turned into a library map.
    #[error("Failed to parse {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    /// No constructor is registered for a declared type tag.
    #[error("Unknown library type: {0}")]
    UnknownType(String),

    /// A constructor rejected the declaration it was given.
    #[error("Invalid library declaration: {0}")]
    InvalidDeclaration(String),

    /// A library's load step failed.
    #[error("Failed to load library '{name}': {message}")]
    InstanceLoad { name: String, message: String },

    /// A library's close step failed.
    #[error("Failed to close library '{name}': {message}")]
    InstanceClose { name: String, message: String },

    /// No library is registered under the requested realm name.
    #[error("No realm connector with this name: {0}")]
    NoSuchRealm(String),

    /// The library exists but does not expose the identity capability.
    #[error("This is not a realm connector: {0}")]
    NotARealmConnector(String),

    /// Password hashing failures
    #[error("Credential error: {0}")]
    Credential(String),

    /// Filesystem watcher setup failures
    #[error("Watch error: {0}")]
    Watch(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for libreg operations.
pub type Result<T> = std::result::Result<T, LibraryError>;
