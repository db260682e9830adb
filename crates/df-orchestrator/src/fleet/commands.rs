//! Remote command lines issued by the orchestrator

use std::fmt;
use std::str::FromStr;

use df_core::config::DeployConfig;
use df_core::shell;
use df_core::types::Interface;
use df_core::{DependencyManifest, PackageConfig};

/// Cache file whose age decides whether the package index is refreshed
pub const PACKAGE_CACHE: &str = "/var/cache/apt/pkgcache.bin";

/// One command line and whether a non-zero exit fails the step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub line: String,
    pub check: bool,
}

impl RemoteCommand {
    fn checked(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            check: true,
        }
    }

    fn unchecked(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            check: false,
        }
    }
}

/// Service lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Install,
    Start,
    Stop,
    Restart,
    Uninstall,
}

impl Lifecycle {
    /// Commands that carry out the action for `package`
    pub fn commands(&self, package: &PackageConfig) -> Vec<RemoteCommand> {
        let name = package.name();
        let systemctl = |verb: &str| format!("sudo systemctl {} {}", verb, name);
        match self {
            Lifecycle::Install => vec![
                RemoteCommand::checked(systemctl("enable")),
                RemoteCommand::checked(systemctl("start")),
            ],
            Lifecycle::Start => vec![RemoteCommand::checked(systemctl("start"))],
            Lifecycle::Stop => vec![RemoteCommand::checked(systemctl("stop"))],
            Lifecycle::Restart => vec![RemoteCommand::checked(systemctl("restart"))],
            Lifecycle::Uninstall => vec![
                RemoteCommand::unchecked(systemctl("stop")),
                RemoteCommand::unchecked(systemctl("disable")),
                RemoteCommand::checked(format!("sudo rm -f {}", shell::quote(&package.unit_path()))),
                RemoteCommand::checked(format!(
                    "sudo rm -rf {}",
                    shell::quote(&package.install_dir())
                )),
                RemoteCommand::checked(DAEMON_RELOAD),
            ],
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lifecycle::Install => "install",
            Lifecycle::Start => "start",
            Lifecycle::Stop => "stop",
            Lifecycle::Restart => "restart",
            Lifecycle::Uninstall => "uninstall",
        })
    }
}

impl FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Lifecycle::Install),
            "start" => Ok(Lifecycle::Start),
            "stop" => Ok(Lifecycle::Stop),
            "restart" => Ok(Lifecycle::Restart),
            "uninstall" => Ok(Lifecycle::Uninstall),
            other => Err(format!("unknown lifecycle action '{}'", other)),
        }
    }
}

pub const DAEMON_RELOAD: &str = "sudo systemctl daemon-reload";

/// Follow the service journal
pub fn follow_journal(package: &PackageConfig) -> String {
    format!("journalctl -f -u {}", package.name())
}

/// Package manager invocations for one dependency set
#[derive(Debug, Clone)]
pub struct AptCommands {
    proxy_option: String,
    max_age_days: u32,
}

impl AptCommands {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            proxy_option: format!(
                "-o Acquire::http::proxy=\"{}\"",
                config.relay.remote_proxy_url()
            ),
            max_age_days: config.packages.index_max_age_days,
        }
    }

    /// Exits 0 when the package cache exists
    pub fn cache_exists(&self) -> String {
        format!("test -e {}", PACKAGE_CACHE)
    }

    /// Unconditional index refresh
    pub fn update(&self) -> String {
        format!("sudo apt-get {} update", self.proxy_option)
    }

    /// Refresh only when the cache is older than the configured age
    pub fn update_if_stale(&self) -> String {
        format!(
            "find {} -mtime +{} -exec {} \\;",
            PACKAGE_CACHE,
            self.max_age_days,
            self.update()
        )
    }

    pub fn install(&self, dependencies: &DependencyManifest) -> String {
        let packages: Vec<String> = dependencies.tokens().map(shell::word).collect();
        format!(
            "sudo apt-get {} install -y {}",
            self.proxy_option,
            packages.join(" ")
        )
    }
}

/// Query command; prints `0` when the interface is enabled
pub fn interface_status(interface: Interface) -> String {
    format!(
        "sudo raspi-config nonint get_{}",
        interface.raspi_config_name()
    )
}

pub fn enable_interface(interface: Interface) -> String {
    format!(
        "sudo raspi-config nonint do_{} 0",
        interface.raspi_config_name()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_core::config::RelayProtocol;

    fn weather() -> PackageConfig {
        PackageConfig::new("weather", "pi").unwrap()
    }

    #[test]
    fn test_uninstall_tolerates_stopped_service() {
        let commands = Lifecycle::Uninstall.commands(&weather());
        let lines: Vec<&str> = commands.iter().map(|c| c.line.as_str()).collect();
        assert_eq!(
            lines,
            vec![
                "sudo systemctl stop weather",
                "sudo systemctl disable weather",
                "sudo rm -f '/etc/systemd/system/weather.service'",
                "sudo rm -rf '/usr/local/weather'",
                "sudo systemctl daemon-reload",
            ]
        );
        assert!(!commands[0].check);
        assert!(!commands[1].check);
        assert!(commands[2..].iter().all(|c| c.check));
    }

    #[test]
    fn test_install_enables_then_starts() {
        let commands = Lifecycle::Install.commands(&weather());
        assert_eq!(commands[0].line, "sudo systemctl enable weather");
        assert_eq!(commands[1].line, "sudo systemctl start weather");
        assert_eq!(follow_journal(&weather()), "journalctl -f -u weather");
    }

    #[test]
    fn test_apt_commands_carry_proxy() {
        let config = DeployConfig::default();
        let apt = AptCommands::new(&config);
        let deps = DependencyManifest::new(["python3", "git"]);

        assert_eq!(
            apt.install(&deps),
            "sudo apt-get -o Acquire::http::proxy=\"http://localhost:8080\" install -y git python3"
        );
        assert_eq!(
            apt.update_if_stale(),
            "find /var/cache/apt/pkgcache.bin -mtime +30 -exec sudo apt-get \
             -o Acquire::http::proxy=\"http://localhost:8080\" update \\;"
        );
    }

    #[test]
    fn test_socks_proxy_url() {
        let mut config = DeployConfig::default();
        config.relay.protocol = RelayProtocol::Socks5;
        config.relay.remote_port = 1080;
        assert!(AptCommands::new(&config)
            .update()
            .contains("proxy=\"socks5h://localhost:1080\""));
    }

    #[test]
    fn test_interface_commands() {
        assert_eq!(
            interface_status(Interface::I2c),
            "sudo raspi-config nonint get_i2c"
        );
        assert_eq!(
            enable_interface(Interface::OneWire),
            "sudo raspi-config nonint do_onewire 0"
        );
    }

    #[test]
    fn test_lifecycle_from_str() {
        assert_eq!("restart".parse::<Lifecycle>().unwrap(), Lifecycle::Restart);
        assert!("reboot".parse::<Lifecycle>().is_err());
    }
}
