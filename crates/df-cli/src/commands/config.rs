//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use df_core::config::{self, DeployConfig};

/// Path of the configuration file in use
pub fn config_file(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load and validate the configuration, falling back to defaults
///
/// An explicitly given path must exist; the default path may be absent.
pub fn load(config_path: Option<&PathBuf>) -> Result<DeployConfig> {
    let config: DeployConfig = match config_path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let path = config::default_config_path();
            if path.exists() {
                config::load_config(&path)
                    .with_context(|| format!("Failed to load config from {:?}", path))?
            } else {
                tracing::debug!("No config at {:?}, using defaults", path);
                DeployConfig::default()
            }
        }
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Show current configuration
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_file(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 'devfleet config init' to create one");
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Print the configuration file path
pub fn config_path(config_path: Option<&PathBuf>) {
    println!("{}", config_file(config_path).display());
}

/// Write the default configuration
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = config_file(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    write_default(&path)?;
    print_success(&format!("Created configuration file: {:?}", path));
    print_info("Add devices as [[targets]] entries, or pass --target on the command line");
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    config::save_config(path, &DeployConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devfleet").join("config.toml");

        config_init(Some(&path), false).unwrap();
        assert!(path.exists());

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.relay.base_port, 8080);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay]\nbase_port = 9000\n").unwrap();

        config_init(Some(&path), false).unwrap();
        assert_eq!(load(Some(&path)).unwrap().relay.base_port, 9000);

        config_init(Some(&path), true).unwrap();
        assert_eq!(load(Some(&path)).unwrap().relay.base_port, 8080);
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ssh]\nport = 0\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
