//! Deployment configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::TargetDescriptor;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Remote shell settings
    pub ssh: SshConfig,

    /// Local relay settings
    pub relay: RelayConfig,

    /// Device discovery settings
    pub discovery: DiscoveryConfig,

    /// OS package settings
    pub packages: PackagesConfig,

    /// Devices addressed when no target is given on the command line
    pub targets: Vec<TargetDescriptor>,
}

impl DeployConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh.port == 0 {
            return Err(ConfigError::Invalid("ssh.port must not be 0".into()));
        }
        if self.relay.remote_port == 0 {
            return Err(ConfigError::Invalid("relay.remote_port must not be 0".into()));
        }
        if self.relay.base_port == 0 {
            return Err(ConfigError::Invalid("relay.base_port must not be 0".into()));
        }
        if self.relay.last_port().is_none() {
            return Err(ConfigError::Invalid(format!(
                "relay port range {}+{} exceeds 65535",
                self.relay.base_port, self.relay.port_range
            )));
        }
        if !self.packages.manifest_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "packages.manifest_path must be absolute".into(),
            ));
        }
        if let Some(target) = self.targets.iter().find(|t| t.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "target for user '{}' has an empty name",
                target.username
            )));
        }
        Ok(())
    }
}

/// Log level applied to a stream of remote output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for OutputLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputLevel::Trace => "trace",
            OutputLevel::Debug => "debug",
            OutputLevel::Info => "info",
            OutputLevel::Warn => "warn",
            OutputLevel::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(OutputLevel::Trace),
            "debug" => Ok(OutputLevel::Debug),
            "info" => Ok(OutputLevel::Info),
            "warn" | "warning" => Ok(OutputLevel::Warn),
            "error" => Ok(OutputLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Remote shell settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// TCP port of the SSH server
    pub port: u16,

    /// Bound on the first connection attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Bound on opening a command channel
    #[serde(with = "duration_secs")]
    pub channel_timeout: Duration,

    /// Value of TERM for remote commands
    pub terminal_type: String,

    /// Value of LC_ALL for remote commands
    pub locale: String,

    /// Level remote stderr lines are logged at
    pub stderr_level: OutputLevel,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(2),
            channel_timeout: Duration::from_secs(3),
            terminal_type: "vanilla".to_string(),
            locale: "en_GB.UTF-8".to_string(),
            stderr_level: OutputLevel::Info,
        }
    }
}

/// Wire protocol spoken by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProtocol {
    /// HTTP proxy with CONNECT tunnelling
    #[default]
    Http,
    /// SOCKS5 without authentication
    Socks5,
}

impl fmt::Display for RelayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayProtocol::Http => write!(f, "http"),
            RelayProtocol::Socks5 => write!(f, "socks5"),
        }
    }
}

/// Local relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Proxy protocol
    pub protocol: RelayProtocol,

    /// First local port tried when binding
    pub base_port: u16,

    /// How many ports above `base_port` may be tried
    pub port_range: u16,

    /// Port opened on the device's loopback
    pub remote_port: u16,

    /// Bound on outbound connections made for the device
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Highest port the relay may bind, if the range fits in u16
    pub fn last_port(&self) -> Option<u16> {
        self.base_port.checked_add(self.port_range)
    }

    /// Proxy URL a device uses through the reverse forward
    pub fn remote_proxy_url(&self) -> String {
        match self.protocol {
            RelayProtocol::Http => format!("http://localhost:{}", self.remote_port),
            RelayProtocol::Socks5 => format!("socks5h://localhost:{}", self.remote_port),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            protocol: RelayProtocol::Http,
            base_port: 8080,
            port_range: 128,
            remote_port: 8080,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Device discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Probe every up, non-loopback adapter instead of only local-network ones
    pub all_adapters: bool,

    /// Service type browsed over multicast DNS
    pub service_type: String,

    /// How long each adapter is browsed
    #[serde(with = "duration_secs")]
    pub multicast_timeout: Duration,

    /// Suffix appended when plain name resolution fails
    pub local_suffix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            all_adapters: true,
            service_type: "_sftp-ssh._tcp.local.".to_string(),
            multicast_timeout: Duration::from_secs(5),
            local_suffix: ".local".to_string(),
        }
    }
}

/// OS package settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Remote file recording the last installed dependency set
    pub manifest_path: String,

    /// Refresh the package index when it is older than this many days
    pub index_max_age_days: u32,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            manifest_path: "/var/lib/devfleet/dependencies".to_string(),
            index_max_age_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiscoveryMethod;

    #[test]
    fn test_defaults() {
        let config = DeployConfig::default();
        assert_eq!(config.ssh.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.ssh.channel_timeout, Duration::from_secs(3));
        assert_eq!(config.ssh.terminal_type, "vanilla");
        assert_eq!(config.relay.remote_port, 8080);
        assert_eq!(config.relay.last_port(), Some(8208));
        assert_eq!(config.discovery.local_suffix, ".local");
        assert_eq!(config.packages.index_max_age_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            [ssh]
            connect_timeout = 5
            stderr_level = "warn"

            [relay]
            protocol = "socks5"

            [[targets]]
            name = "greenhouse"
            discovery = "multicast"
        "#;
        let config: DeployConfig = toml::from_str(text).unwrap();
        assert_eq!(config.ssh.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.stderr_level, OutputLevel::Warn);
        assert_eq!(config.relay.protocol, RelayProtocol::Socks5);
        assert_eq!(config.relay.base_port, 8080);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].discovery, DiscoveryMethod::Multicast);
        assert_eq!(config.relay.remote_proxy_url(), "socks5h://localhost:8080");
    }

    #[test]
    fn test_validate_rejects_overflowing_range() {
        let mut config = DeployConfig::default();
        config.relay.base_port = 65500;
        config.relay.port_range = 100;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_relative_manifest() {
        let mut config = DeployConfig::default();
        config.packages.manifest_path = "deps".into();
        assert!(config.validate().is_err());
    }
}
