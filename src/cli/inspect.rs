//! Read-only commands: list, get, realm, hash-password.

use anyhow::{bail, Result};

use libreg::library::builtin::hash_password;
use libreg::RegistryConfig;

use super::common::open_registry;

/// Print every registered library with its type and status.
pub(crate) async fn cmd_list(config: &RegistryConfig, json: bool) -> Result<()> {
    let (registry, _tracked) = open_registry(config).await?;
    let snapshot = registry.snapshot().await;

    if json {
        let listing: serde_json::Map<String, serde_json::Value> = snapshot
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": entry.type_tag,
                        "source": entry.source,
                        "status": entry.status(),
                    }),
                )
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else if snapshot.is_empty() {
        println!("No libraries found in {}", config.etc_dir.display());
    } else {
        let width = snapshot.keys().map(|n| n.len()).max().unwrap_or(0);
        for (name, entry) in snapshot.iter() {
            println!(
                "{:width$}  {:14}  {}",
                name,
                entry.type_tag,
                entry.status(),
                width = width
            );
        }
    }

    registry.close().await;
    Ok(())
}

/// Print one library's declaration and status.
pub(crate) async fn cmd_get(config: &RegistryConfig, name: &str) -> Result<()> {
    let (registry, _tracked) = open_registry(config).await?;

    let Some(entry) = registry.get_entry(name).await else {
        registry.close().await;
        bail!("No library named '{}'", name);
    };

    println!("name:   {}", entry.name);
    println!("type:   {}", entry.type_tag);
    println!("source: {}", entry.source.display());
    println!("status: {}", entry.status());
    if !entry.params.is_empty() {
        println!(
            "params: {}",
            serde_json::to_string_pretty(&entry.params)?
        );
    }

    registry.close().await;
    Ok(())
}

/// Verify a user against a realm connector.
pub(crate) async fn cmd_realm(
    config: &RegistryConfig,
    realm: &str,
    user: &str,
    password: &str,
) -> Result<()> {
    let (registry, _tracked) = open_registry(config).await?;

    let result = match registry.get_identity_manager(realm).await {
        Ok(identity) => match identity.verify(user, password).await {
            Some(account) => {
                let roles: Vec<&str> = account.roles.iter().map(|r| r.as_str()).collect();
                println!("Authenticated '{}' (roles: {})", account.id, roles.join(", "));
                Ok(())
            }
            None => Err(anyhow::anyhow!("Authentication failed for '{}'", user)),
        },
        Err(e) => Err(e.into()),
    };

    registry.close().await;
    result
}

/// Print a PHC string suitable for a `static_realm` user's `password_hash`.
pub(crate) fn cmd_hash_password(password: &str) -> Result<()> {
    if password.is_empty() {
        bail!("Refusing to hash an empty password");
    }
    println!("{}", hash_password(password)?);
    Ok(())
}
