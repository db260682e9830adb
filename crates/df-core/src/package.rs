//! Package layout and systemd unit rendering
//!
//! A package named `app` deployed for user `pi` lives in `/usr/local/app`,
//! is started through `/usr/local/app/bin/app`, and is managed by the unit
//! `/etc/systemd/system/app.service`.

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A `NAME=value` pair exported to the service environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StartParameter {
    name: String,
    value: String,
}

impl StartParameter {
    /// Create a parameter, validating the variable name
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let value = value.into();

        let mut chars = name.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ConfigError::Invalid(format!(
                "start parameter name '{}' is not a valid environment variable",
                name
            )));
        }
        if value.contains('\n') {
            return Err(ConfigError::Invalid(format!(
                "start parameter '{}' must not contain a newline",
                name
            )));
        }

        Ok(Self { name, value })
    }

    /// Variable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variable value
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl FromStr for StartParameter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!("start parameter '{}' must look like NAME=value", s))
        })?;
        Self::new(name, value)
    }
}

impl TryFrom<String> for StartParameter {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StartParameter> for String {
    fn from(param: StartParameter) -> Self {
        param.to_string()
    }
}

impl fmt::Display for StartParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Remote layout and unit file of one deployed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageConfig {
    name: String,
    user: String,
    parameters: Vec<StartParameter>,
}

impl PackageConfig {
    /// Create a package configuration without start parameters
    pub fn new(name: impl Into<String>, user: impl Into<String>) -> Result<Self, ConfigError> {
        Self::with_parameters(name, user, Vec::new())
    }

    /// Create a package configuration with start parameters
    pub fn with_parameters(
        name: impl Into<String>,
        user: impl Into<String>,
        parameters: Vec<StartParameter>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        validate_package_name(&name)?;
        Ok(Self {
            name,
            user: user.into(),
            parameters,
        })
    }

    /// Package name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User the service runs as
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Start parameters in declaration order
    pub fn parameters(&self) -> &[StartParameter] {
        &self.parameters
    }

    /// Directory the artifact tree is copied to
    pub fn install_dir(&self) -> String {
        format!("/usr/local/{}", self.name)
    }

    /// Script executed by the unit
    pub fn start_script(&self) -> String {
        format!("/usr/local/{0}/bin/{0}", self.name)
    }

    /// Unit name as understood by systemctl
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Where the unit file is written
    pub fn unit_path(&self) -> String {
        format!("/etc/systemd/system/{}", self.unit_name())
    }

    /// Render the systemd unit text
    pub fn render_unit(&self) -> String {
        let mut unit = String::with_capacity(512);

        unit.push_str("[Unit]\n");
        let _ = writeln!(unit, "Description={}", self.name);
        unit.push_str("Requires=network.target\n\n");

        unit.push_str("[Service]\n");
        unit.push_str("Type=simple\n");
        let _ = writeln!(unit, "WorkingDirectory={}", self.install_dir());
        for param in &self.parameters {
            let _ = writeln!(
                unit,
                "Environment=\"{}={}\"",
                param.name(),
                escape_unit_value(param.value())
            );
        }
        let _ = writeln!(unit, "ExecStart=/bin/bash {}", self.start_script());
        unit.push_str("ExecReload=/bin/kill -HUP $MAINPID\n");
        unit.push_str("Restart=always\n");
        unit.push_str("RestartSec=60\n");
        unit.push_str("TimeoutStopSec=5\n");
        let _ = writeln!(unit, "User={}", self.user);
        unit.push_str("PermissionsStartOnly=true\n");
        unit.push_str("LimitNOFILE=1024\n\n");

        unit.push_str("[Install]\n");
        unit.push_str("WantedBy=multi-user.target\n");
        unit
    }
}

/// Package names end up in paths, unit names, and shell commands
fn validate_package_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "package name '{}' may only contain letters, digits, '.', '_' and '-'",
            name
        )))
    }
}

fn escape_unit_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let package = PackageConfig::new("weather", "pi").unwrap();
        assert_eq!(package.install_dir(), "/usr/local/weather");
        assert_eq!(package.start_script(), "/usr/local/weather/bin/weather");
        assert_eq!(package.unit_path(), "/etc/systemd/system/weather.service");
        assert_eq!(package.unit_name(), "weather.service");
    }

    #[test]
    fn test_render_unit_without_parameters() {
        let package = PackageConfig::new("weather", "pi").unwrap();
        let unit = package.render_unit();

        assert!(unit.starts_with("[Unit]\nDescription=weather\n"));
        assert!(unit.contains("Type=simple\n"));
        assert!(unit.contains("WorkingDirectory=/usr/local/weather\n"));
        assert!(unit.contains("ExecStart=/bin/bash /usr/local/weather/bin/weather\n"));
        assert!(unit.contains("Restart=always\n"));
        assert!(unit.contains("LimitNOFILE=1024\n"));
        assert!(unit.contains("User=pi\n"));
        assert!(!unit.contains("Environment="));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_render_unit_one_environment_line_per_parameter() {
        let params = vec![
            "PORT=8000".parse().unwrap(),
            StartParameter::new("GREETING", r#"say "hi" 100%"#).unwrap(),
        ];
        let package = PackageConfig::with_parameters("weather", "sensor", params).unwrap();
        let unit = package.render_unit();

        let env_lines: Vec<&str> = unit
            .lines()
            .filter(|l| l.starts_with("Environment="))
            .collect();
        assert_eq!(
            env_lines,
            vec![
                r#"Environment="PORT=8000""#,
                r#"Environment="GREETING=say \"hi\" 100%%""#,
            ]
        );
        assert!(unit.contains("User=sensor\n"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(PackageConfig::new("", "pi").is_err());
        assert!(PackageConfig::new("../etc", "pi").is_err());
        assert!(PackageConfig::new("my app", "pi").is_err());
        assert!("1ABC=x".parse::<StartParameter>().is_err());
        assert!("NOVALUE".parse::<StartParameter>().is_err());
        assert_eq!(
            "EMPTY=".parse::<StartParameter>().unwrap().value(),
            ""
        );
    }
}
