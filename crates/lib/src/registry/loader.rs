//! Load the registry from config: inline `registry.commands` plus an optional `registry.file`.
//! Commands whose binary is not on PATH are still registered (running them reports a spawn
//! failure) but are logged so operators notice at startup.

use anyhow::{Context, Result};
use std::path::Path;

use super::descriptor::{CommandDescriptor, RegistryFile};
use super::Registry;
use crate::config::{self, Config};
use crate::validator::DenyList;

/// Read and parse a registry file (`{ "commands": [...] }`).
pub fn load_registry_file(path: &Path) -> Result<Vec<CommandDescriptor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading registry from {}", path.display()))?;
    let file: RegistryFile = serde_json::from_str(&content)
        .with_context(|| format!("parsing registry from {}", path.display()))?;
    Ok(file.commands)
}

/// Build the registry: file entries first, then inline entries. A name defined in both is an error.
pub fn load_registry(config: &Config, config_path: &Path, deny: &DenyList) -> Result<Registry> {
    let mut descriptors = Vec::new();
    if let Some(path) = config::resolve_registry_file(config, config_path) {
        let from_file = load_registry_file(&path)?;
        log::debug!(
            "loaded {} command(s) from {}",
            from_file.len(),
            path.display()
        );
        descriptors.extend(from_file);
    }
    descriptors.extend(config.registry.commands.iter().cloned());

    let registry = Registry::from_descriptors(&descriptors, deny).context("building registry")?;
    for spec in registry.iter() {
        if !bin_on_path(&spec.binary) {
            log::warn!(
                "command {}: binary {} not found on PATH",
                spec.name,
                spec.binary
            );
        }
    }
    log::info!("registry loaded with {} command(s)", registry.len());
    Ok(registry)
}

/// Returns true if the given binary name is found on PATH (or has path separators and exists).
fn bin_on_path(bin: &str) -> bool {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(bin).is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| {
        if dir.as_os_str().is_empty() {
            return false;
        }
        if dir.join(bin).is_file() {
            return true;
        }
        cfg!(windows) && dir.join(format!("{}.exe", bin)).is_file()
    })
}
