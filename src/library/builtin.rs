//! Built-in library types.
//!
//! - `static_realm`: realm connector backed by a static user table
//! - `properties`: a string key/value bag
//! - `data_dir`: a directory under the registry data directory

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{LibraryError, Result};

use super::factory::{FactoryContext, LibraryFactory};
use super::types::{Account, IdentityManager, Library, LibraryDeclaration};

pub const STATIC_REALM: &str = "static_realm";
pub const PROPERTIES: &str = "properties";
pub const DATA_DIR: &str = "data_dir";

pub(crate) fn register_builtins(factory: &mut LibraryFactory) {
    factory.register(STATIC_REALM, |decl, _ctx| {
        Ok(Arc::new(StaticRealm::from_declaration(decl)?) as Arc<dyn Library>)
    });
    factory.register(PROPERTIES, |decl, _ctx| {
        Ok(Arc::new(Properties::from_declaration(decl)?) as Arc<dyn Library>)
    });
    factory.register(DATA_DIR, |decl, ctx| {
        Ok(Arc::new(DataDirectory::from_declaration(decl, ctx)?) as Arc<dyn Library>)
    });
}

/// Hash a password into the PHC string format `static_realm` stores.
///
/// Uses Argon2id with default parameters and a random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| LibraryError::Credential(format!("failed to hash password: {}", e)))
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Stored password hash is unreadable");
            false
        }
    }
}

// ---- static_realm ----

#[derive(Debug, Deserialize)]
struct StaticRealmParams {
    #[serde(default)]
    users: BTreeMap<String, StaticUser>,
}

#[derive(Debug, Deserialize)]
struct StaticUser {
    password_hash: String,
    #[serde(default)]
    roles: BTreeSet<String>,
}

/// Realm connector with a fixed user table.
///
/// ```json
/// {
///   "type": "static_realm",
///   "users": {
///     "alice": { "password_hash": "$argon2id$v=19$...", "roles": ["admin"] }
///   }
/// }
/// ```
///
/// Hashes are PHC strings as produced by [`hash_password`] or `libreg hash-password`.
#[derive(Debug)]
pub struct StaticRealm {
    users: BTreeMap<String, (String, BTreeSet<String>)>,
}

impl StaticRealm {
    pub fn from_declaration(decl: &LibraryDeclaration) -> Result<Self> {
        let params: StaticRealmParams = decl.params_as()?;
        let mut users = BTreeMap::new();
        for (id, user) in params.users {
            let hash = user.password_hash.trim().to_string();
            PasswordHash::new(&hash).map_err(|e| {
                LibraryError::InvalidDeclaration(format!(
                    "user '{}' has a malformed password hash: {}",
                    id, e
                ))
            })?;
            users.insert(id, (hash, user.roles));
        }
        Ok(Self { users })
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn account_for(&self, id: &str) -> Option<Account> {
        self.users.get(id).map(|(_, roles)| Account {
            id: id.to_string(),
            roles: roles.clone(),
        })
    }
}

#[async_trait]
impl Library for StaticRealm {
    async fn load(&self) -> Result<()> {
        debug!(users = self.users.len(), "Static realm ready");
        Ok(())
    }

    fn as_identity_manager(self: Arc<Self>) -> Option<Arc<dyn IdentityManager>> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl IdentityManager for StaticRealm {
    async fn verify(&self, id: &str, password: &str) -> Option<Account> {
        let (hash, _) = self.users.get(id)?;
        let hash = hash.clone();
        let password = password.to_string();
        // Argon2 verification is CPU-bound
        let verified = tokio::task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .unwrap_or(false);
        if verified {
            self.account_for(id)
        } else {
            None
        }
    }

    async fn account(&self, id: &str) -> Option<Account> {
        self.account_for(id)
    }
}

// ---- properties ----

#[derive(Debug, Deserialize)]
struct PropertiesParams {
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// A string key/value bag, useful for sharing settings between components.
#[derive(Debug)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn from_declaration(decl: &LibraryDeclaration) -> Result<Self> {
        let params: PropertiesParams = decl.params_as()?;
        Ok(Self {
            values: params.properties,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Library for Properties {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---- data_dir ----

#[derive(Debug, Deserialize)]
struct DataDirectoryParams {
    path: String,
    #[serde(default)]
    create: bool,
}

/// A directory resolved against the registry data directory.
///
/// Loading fails when the directory is missing, unless `create` is set.
#[derive(Debug)]
pub struct DataDirectory {
    path: PathBuf,
    create: bool,
}

impl DataDirectory {
    pub fn from_declaration(decl: &LibraryDeclaration, ctx: &FactoryContext) -> Result<Self> {
        let params: DataDirectoryParams = decl.params_as()?;
        if params.path.trim().is_empty() {
            return Err(LibraryError::InvalidDeclaration(
                "data_dir requires a non-empty path".to_string(),
            ));
        }
        Ok(Self {
            path: ctx.resolve(&params.path),
            create: params.create,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Library for DataDirectory {
    async fn load(&self) -> Result<()> {
        if self.create {
            tokio::fs::create_dir_all(&self.path).await?;
            info!(path = %self.path.display(), "Data directory ready");
            return Ok(());
        }
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(LibraryError::InvalidDeclaration(format!(
                "{} is not a directory",
                self.path.display()
            ))),
            Err(e) => Err(LibraryError::Io(e)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Cheap Argon2id hash for tests; verification reads the parameters back from the PHC string.
#[cfg(test)]
pub(crate) fn test_password_hash(password: &str) -> String {
    use argon2::{Algorithm, Params, Version};

    let params = Params::new(1024, 1, 1, None).unwrap();
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}
