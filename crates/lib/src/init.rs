//! Initialize the configuration directory: create ~/.cligate with a default config and an
//! example command registry.
//!
//! Templates live in `crates/lib/config/`: `config.json` and `commands.json`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

static DEFAULT_CONFIG: &str = include_str!("../config/config.json");
static DEFAULT_COMMANDS: &str = include_str!("../config/commands.json");

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `cligate init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

fn write_if_missing(path: &Path, content: &str, what: &str) -> Result<bool> {
    if path.exists() {
        log::debug!("{} already exists at {}, skipping", what, path.display());
        return Ok(false);
    }
    std::fs::write(path, content)
        .with_context(|| format!("writing default {} to {}", what, path.display()))?;
    log::info!("created default {} at {}", what, path.display());
    Ok(true)
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` from the template if missing.
/// - Writes `commands.json` (referenced by the default config) if missing.
///
/// Existing files are never overwritten.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    write_if_missing(config_path, DEFAULT_CONFIG, "config")?;
    write_if_missing(&config_dir.join("commands.json"), DEFAULT_COMMANDS, "command registry")?;

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config, Config};
    use crate::registry::{load_registry, RegistryFile};
    use crate::validator::DenyList;

    #[test]
    fn templates_parse() {
        let config: Config = serde_json::from_str(DEFAULT_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        let file: RegistryFile = serde_json::from_str(DEFAULT_COMMANDS).unwrap();
        assert!(!file.commands.is_empty());
    }

    #[test]
    fn init_writes_loadable_config_and_keeps_existing_files() {
        let dir = std::env::temp_dir().join(format!("cligate-init-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");
        assert!(require_initialized(&config_path).is_err());

        let created = init_config_dir(&config_path).unwrap();
        assert_eq!(created, dir);
        require_initialized(&config_path).unwrap();

        let (config, path) = load_config(Some(config_path.clone())).unwrap();
        let registry = load_registry(&config, &path, &DenyList::baseline()).unwrap();
        assert!(registry.get("list-items").is_some());

        std::fs::write(&config_path, "{}").unwrap();
        init_config_dir(&config_path).unwrap();
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "{}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
