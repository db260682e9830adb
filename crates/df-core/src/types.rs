//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// How a target's address is found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    /// Regular name resolution, retried with the local suffix
    Hostname,
    /// Multicast DNS browsing on local adapters
    Multicast,
    /// Name resolution first, multicast only if that fails
    #[default]
    HostnameThenMulticast,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMethod::Hostname => write!(f, "hostname"),
            DiscoveryMethod::Multicast => write!(f, "multicast"),
            DiscoveryMethod::HostnameThenMulticast => write!(f, "hostname-then-multicast"),
        }
    }
}

impl FromStr for DiscoveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hostname" | "host" => Ok(DiscoveryMethod::Hostname),
            "multicast" | "mdns" => Ok(DiscoveryMethod::Multicast),
            "hostname-then-multicast" | "auto" => Ok(DiscoveryMethod::HostnameThenMulticast),
            other => Err(format!(
                "unknown discovery method '{}' (expected hostname, multicast, or hostname-then-multicast)",
                other
            )),
        }
    }
}

/// Operator-supplied record identifying a device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Host name or advertised multicast name
    pub name: String,

    /// Login user on the device
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for the login user
    #[serde(default)]
    pub secret: String,

    /// How to find the device
    #[serde(default)]
    pub discovery: DiscoveryMethod,
}

fn default_username() -> String {
    "pi".to_string()
}

impl TargetDescriptor {
    /// Create a new descriptor
    pub fn new(
        discovery: DiscoveryMethod,
        name: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            secret: secret.into(),
            discovery,
        }
    }

    /// Bind this descriptor to a concrete address
    pub fn resolved(&self, address: IpAddr) -> ResolvedHost {
        ResolvedHost {
            name: self.name.clone(),
            address,
            username: self.username.clone(),
            secret: self.secret.clone(),
        }
    }
}

impl fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("discovery", &self.discovery)
            .finish()
    }
}

/// A target bound to a concrete network address
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// Name the host was resolved from
    pub name: String,
    /// Address to connect to
    pub address: IpAddr,
    /// Login user
    pub username: String,
    /// Password for the login user
    pub secret: String,
}

impl ResolvedHost {
    /// Identity used in logs and errors
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResolvedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

impl fmt::Debug for ResolvedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHost")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Hardware interface that can be toggled with `raspi-config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    I2c,
    Spi,
    Serial,
    OneWire,
    Camera,
    Ssh,
    Vnc,
}

impl Interface {
    /// Suffix used by `raspi-config nonint get_<name>` / `do_<name>`
    pub fn raspi_config_name(&self) -> &'static str {
        match self {
            Interface::I2c => "i2c",
            Interface::Spi => "spi",
            Interface::Serial => "serial",
            Interface::OneWire => "onewire",
            Interface::Camera => "camera",
            Interface::Ssh => "ssh",
            Interface::Vnc => "vnc",
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raspi_config_name())
    }
}

impl FromStr for Interface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "i2c" => Ok(Interface::I2c),
            "spi" => Ok(Interface::Spi),
            "serial" => Ok(Interface::Serial),
            "onewire" | "1-wire" | "w1" => Ok(Interface::OneWire),
            "camera" => Ok(Interface::Camera),
            "ssh" => Ok(Interface::Ssh),
            "vnc" => Ok(Interface::Vnc),
            other => Err(format!("unknown interface '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_method_parse() {
        assert_eq!("mdns".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::Multicast);
        assert_eq!(
            "Hostname-Then-Multicast".parse::<DiscoveryMethod>().unwrap(),
            DiscoveryMethod::HostnameThenMulticast
        );
        assert!("dns".parse::<DiscoveryMethod>().is_err());
    }

    #[test]
    fn test_resolved_host_display_hides_secret() {
        let target = TargetDescriptor::new(DiscoveryMethod::Hostname, "sensor-1", "pi", "raspberry");
        let host = target.resolved("192.168.1.20".parse().unwrap());
        assert_eq!(host.to_string(), "sensor-1 (192.168.1.20)");
        assert!(!format!("{:?}", host).contains("raspberry"));
        assert!(!format!("{:?}", target).contains("raspberry"));
    }

    #[test]
    fn test_target_defaults_from_toml() {
        let target: TargetDescriptor = toml::from_str(r#"name = "sensor-1""#).unwrap();
        assert_eq!(target.username, "pi");
        assert_eq!(target.discovery, DiscoveryMethod::HostnameThenMulticast);
    }

    #[test]
    fn test_interface_names() {
        assert_eq!("1-wire".parse::<Interface>().unwrap(), Interface::OneWire);
        assert_eq!(Interface::I2c.raspi_config_name(), "i2c");
    }
}
