//! Library types for libreg
//!
//! This module defines the `Library` lifecycle trait every registered instance
//! implements, the optional `IdentityManager` capability, the declaration
//! structure parsed from configuration files, and the registry-side entry
//! that tracks an instance's load status.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LibraryError, Result};

/// A named, pluggable component with a load/close lifecycle.
///
/// Instances are built by the [`LibraryFactory`](super::LibraryFactory) while
/// a configuration file is parsed. The registry calls [`load`](Library::load)
/// once before the instance becomes visible and [`close`](Library::close)
/// once after it has been removed or replaced.
#[async_trait]
pub trait Library: Send + Sync + 'static {
    /// Prepare the instance for use. Failures are logged by the registry and
    /// the entry stays registered with an error status.
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    /// Release any resources held by the instance.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Capability query for the identity/authentication capability.
    ///
    /// Realm connectors override this to return themselves.
    fn as_identity_manager(self: Arc<Self>) -> Option<Arc<dyn IdentityManager>> {
        None
    }

    /// Downcast support for application code that knows the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// An authenticated account returned by a realm connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Account {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Identity/authentication capability exposed by realm connectors.
#[async_trait]
pub trait IdentityManager: Send + Sync {
    /// Verify a user/password pair. Returns the account on success.
    async fn verify(&self, id: &str, password: &str) -> Option<Account>;

    /// Look up an account without verifying credentials.
    async fn account(&self, id: &str) -> Option<Account>;
}

/// A single entry of the `library` object in a configuration file.
///
/// The `type` field selects the constructor; every other field is handed to
/// that constructor untouched.
///
/// ```json
/// { "type": "properties", "properties": { "region": "eu-west-1" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryDeclaration {
    /// Factory tag of the library type.
    #[serde(rename = "type")]
    pub type_tag: String,

    /// Type-specific parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl LibraryDeclaration {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter, builder style.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Deserialize the parameters into a typed structure.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.params.clone())).map_err(|e| {
            LibraryError::InvalidDeclaration(format!(
                "bad parameters for type '{}': {}",
                self.type_tag, e
            ))
        })
    }
}

/// Lifecycle state of a registered library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LibraryStatus {
    /// Constructed, load step not run yet.
    Unloaded,
    /// Load step succeeded.
    Loaded { at: DateTime<Utc> },
    /// Load step failed; the entry stays visible.
    Error { message: String, at: DateTime<Utc> },
    /// Close step has run.
    Closed,
}

impl LibraryStatus {
    pub fn loaded() -> Self {
        Self::Loaded { at: Utc::now() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded { .. } => "loaded",
            Self::Error { .. } => "error",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error { message, .. } => write!(f, "error: {}", message),
            other => f.write_str(other.label()),
        }
    }
}

/// A library instance as tracked by the registry.
pub struct RegisteredLibrary {
    /// Name under which the library was declared.
    pub name: String,

    /// Declared type tag.
    pub type_tag: String,

    /// Configuration file that declared the library.
    pub source: PathBuf,

    /// Declared parameters (everything except `type`).
    pub params: Map<String, Value>,

    /// The constructed instance.
    pub library: Arc<dyn Library>,

    status: RwLock<LibraryStatus>,
}

impl RegisteredLibrary {
    pub fn new(
        name: impl Into<String>,
        declaration: LibraryDeclaration,
        source: PathBuf,
        library: Arc<dyn Library>,
    ) -> Self {
        Self {
            name: name.into(),
            type_tag: declaration.type_tag,
            source,
            params: declaration.params,
            library,
            status: RwLock::new(LibraryStatus::Unloaded),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> LibraryStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_status(&self, status: LibraryStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Downcast the instance to a concrete library type.
    pub fn downcast_ref<T: Library>(&self) -> Option<&T> {
        self.library.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for RegisteredLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredLibrary")
            .field("name", &self.name)
            .field("type_tag", &self.type_tag)
            .field("source", &self.source)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
