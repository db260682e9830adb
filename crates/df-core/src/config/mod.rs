//! devfleet configuration
//!
//! A single TOML file holds every section of [`DeployConfig`]. Each section
//! falls back to its defaults, so an empty file is a valid configuration.

mod deploy;
pub mod serde_utils;

pub use deploy::{
    DeployConfig, DiscoveryConfig, OutputLevel, PackagesConfig, RelayConfig, RelayProtocol,
    SshConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// `<config dir>/devfleet/config.toml`, or `./devfleet/config.toml` when the
/// platform has no config directory
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devfleet")
        .join("config.toml")
}

/// Read a deployment configuration
///
/// The result is not validated; see [`DeployConfig::validate`].
pub fn load_config(path: &Path) -> Result<DeployConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    Ok(toml::from_str(&content)?)
}

/// Write `config`, creating missing parent directories
pub fn save_config(path: &Path, config: &DeployConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, content).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_ends_with_devfleet() {
        let path = default_config_path();
        assert!(path.ends_with("devfleet/config.toml"));
    }

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DeployConfig::default();
        config.relay.base_port = 9050;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.relay.base_port, 9050);
        assert_eq!(loaded.ssh.port, 22);
    }
}
