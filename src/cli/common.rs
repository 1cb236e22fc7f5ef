//! Shared setup for CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use libreg::tracker::TrackedDirectory;
use libreg::{ChangeSource, LibraryFactory, LibraryRegistry, RegistryCell, RegistryConfig};

/// The binary's registry; each command opens it once.
static REGISTRY: RegistryCell = RegistryCell::new();

/// Command-line overrides applied on top of the loaded configuration.
#[derive(Debug, Default, Clone)]
pub(crate) struct Overrides {
    pub etc_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub extension: Option<String>,
}

/// Load configuration and apply command-line overrides.
pub(crate) fn load_config(overrides: &Overrides) -> Result<RegistryConfig> {
    let mut config =
        RegistryConfig::load().with_context(|| "Failed to load registry configuration")?;
    if let Some(dir) = &overrides.etc_dir {
        config.etc_dir = dir.clone();
    }
    if let Some(dir) = &overrides.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(ext) = &overrides.extension {
        config.extension = ext.trim_start_matches('.').to_string();
    }
    Ok(config)
}

/// Build a registry over the configured directory and load its files.
pub(crate) async fn open_registry(
    config: &RegistryConfig,
) -> Result<(Arc<LibraryRegistry>, Arc<TrackedDirectory>)> {
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "Failed to create data directory: {}",
            config.data_dir.display()
        )
    })?;

    let tracked = Arc::new(TrackedDirectory::new(&config.etc_dir).with_extension(&config.extension));
    let registry = REGISTRY
        .install(
            LibraryRegistry::new(
                &config.data_dir,
                Some(Arc::clone(&tracked) as Arc<dyn ChangeSource>),
                Arc::new(LibraryFactory::with_builtins()),
            )
            .with_options(config.options()),
        )
        .with_context(|| "Failed to install library registry")?;

    let applied = registry.refresh().await;
    tracing::debug!(
        etc_dir = %config.etc_dir.display(),
        files = applied,
        "Initial configuration scan complete"
    );

    Ok((registry, tracked))
}
