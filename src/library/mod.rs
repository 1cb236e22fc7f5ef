//! Library instances and how they are built from configuration.
//!
//! # Architecture
//!
//! - **types**: the `Library` lifecycle trait, the `IdentityManager`
//!   capability, declarations and registry entries
//! - **factory**: constructor table keyed by type tag
//! - **parser**: configuration file → per-file map of instances
//! - **builtin**: library types shipped with the crate
//!
//! # Configuration file
//!
//! ```json
//! {
//!   "library": {
//!     "users": {
//!       "type": "static_realm",
//!       "users": { "alice": { "password_hash": "$argon2id$...", "roles": ["admin"] } }
//!     },
//!     "settings": { "type": "properties", "properties": { "region": "eu" } }
//!   }
//! }
//! ```

pub mod builtin;
mod factory;
mod parser;
pub mod types;

pub use factory::{Constructor, FactoryContext, LibraryFactory};
pub use parser::{
    is_valid_library_name, parse_library_config, read_library_file, FileLibraries,
    LibraryConfiguration,
};
pub use types::{
    Account, IdentityManager, Library, LibraryDeclaration, LibraryStatus, RegisteredLibrary,
};
