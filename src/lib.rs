//! libreg - hot-reloadable registry of named library instances
//!
//! Libraries are declared in JSON configuration files. Each file contributes
//! its own map of libraries; the registry merges them into one namespace and
//! keeps it current as files are created, changed and deleted.

pub mod config;
pub mod error;
pub mod library;
pub mod registry;
pub mod tracker;

pub use config::RegistryConfig;
pub use error::{LibraryError, Result};
pub use library::{IdentityManager, Library, LibraryFactory};
pub use registry::{LibraryRegistry, RegistryCell, RegistryOptions};
pub use tracker::{ChangeReason, ChangeSource, FileEvent};
