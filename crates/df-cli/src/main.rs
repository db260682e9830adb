//! devfleet CLI
//!
//! Installs dependencies, enables interfaces, deploys artifacts, and manages
//! the resulting systemd service on a fleet of devices reached over SSH.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devfleet::commands::{self, DeployPlan, Reporter, TargetArgs};
use df_core::config::DeployConfig;
use df_core::types::Interface;
use df_core::StartParameter;
use df_orchestrator::{Lifecycle, Orchestrator};

#[derive(Parser)]
#[command(name = "devfleet")]
#[command(author, version, about = "Deploy packages and services to a fleet of devices")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print reports as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install OS packages unless the same set is already installed
    Deps {
        #[command(flatten)]
        targets: TargetArgs,
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Enable hardware interfaces (i2c, spi, serial, onewire, camera, ssh, vnc)
    Enable {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(required = true)]
        interfaces: Vec<Interface>,
    },

    /// Copy an artifact directory and install its systemd unit
    Deploy {
        #[command(flatten)]
        targets: TargetArgs,
        /// Package name; the tree must contain bin/<package>
        package: String,
        /// Local artifact directory
        artifact_dir: PathBuf,
        /// Environment for the service (repeatable)
        #[arg(short, long = "param", value_name = "NAME=value")]
        params: Vec<StartParameter>,
        /// OS packages to ensure first (repeatable)
        #[arg(long = "dep", value_name = "PACKAGE")]
        deps: Vec<String>,
        /// Interfaces to enable first (repeatable)
        #[arg(long = "enable", value_name = "INTERFACE")]
        enable: Vec<Interface>,
        /// Enable and start the service afterwards
        #[arg(long)]
        install: bool,
    },

    /// Enable and start the service
    Install {
        #[command(flatten)]
        targets: TargetArgs,
        package: String,
    },

    /// Start the service
    Start {
        #[command(flatten)]
        targets: TargetArgs,
        package: String,
    },

    /// Stop the service
    Stop {
        #[command(flatten)]
        targets: TargetArgs,
        package: String,
    },

    /// Restart the service
    Restart {
        #[command(flatten)]
        targets: TargetArgs,
        package: String,
    },

    /// Stop and disable the service and delete its files
    Uninstall {
        #[command(flatten)]
        targets: TargetArgs,
        package: String,
    },

    /// Start the service and follow its journal; press <Enter> twice to detach
    Run {
        #[command(flatten)]
        targets: TargetArgs,
        package: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show config file path
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = cli.config.as_ref();
    let (targets, operation) = match cli.command {
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => commands::config_show(config_path)?,
                ConfigAction::Path => commands::config_path(config_path),
                ConfigAction::Init { force } => commands::config_init(config_path, force)?,
            }
            return Ok(());
        }
        Commands::Deps { targets, packages } => (targets, Operation::Deps(packages)),
        Commands::Enable {
            targets,
            interfaces,
        } => (targets, Operation::Enable(interfaces)),
        Commands::Deploy {
            targets,
            package,
            artifact_dir,
            params,
            deps,
            enable,
            install,
        } => (
            targets,
            Operation::Deploy {
                package,
                artifact_dir,
                plan: DeployPlan {
                    dependencies: deps,
                    interfaces: enable,
                    parameters: params,
                    install,
                },
            },
        ),
        Commands::Install { targets, package } => {
            (targets, Operation::Lifecycle(Lifecycle::Install, package))
        }
        Commands::Start { targets, package } => {
            (targets, Operation::Lifecycle(Lifecycle::Start, package))
        }
        Commands::Stop { targets, package } => {
            (targets, Operation::Lifecycle(Lifecycle::Stop, package))
        }
        Commands::Restart { targets, package } => {
            (targets, Operation::Lifecycle(Lifecycle::Restart, package))
        }
        Commands::Uninstall { targets, package } => {
            (targets, Operation::Lifecycle(Lifecycle::Uninstall, package))
        }
        Commands::Run { targets, package } => (targets, Operation::Run(package)),
    };

    let config = commands::load(config_path)?;
    let mut reporter = Reporter::new(cli.json);
    let mut orchestrator = commands::connect(&config, &targets, &mut reporter).await?;

    let result = operation
        .execute(&mut orchestrator, &config, &mut reporter)
        .await;
    orchestrator.close().await;

    result?;
    reporter.finish()
}

/// A fleet command with its arguments, minus target selection
enum Operation {
    Deps(Vec<String>),
    Enable(Vec<Interface>),
    Deploy {
        package: String,
        artifact_dir: PathBuf,
        plan: DeployPlan,
    },
    Lifecycle(Lifecycle, String),
    Run(String),
}

impl Operation {
    async fn execute(
        &self,
        orchestrator: &mut Orchestrator,
        config: &DeployConfig,
        reporter: &mut Reporter,
    ) -> Result<()> {
        tracing::debug!(
            "Fleet of {} host(s), relay {} from port {}",
            orchestrator.len(),
            config.relay.protocol,
            config.relay.base_port
        );
        match self {
            Operation::Deps(packages) => {
                commands::deps_command(orchestrator, packages, reporter).await
            }
            Operation::Enable(interfaces) => {
                commands::enable_command(orchestrator, interfaces, reporter).await
            }
            Operation::Deploy {
                package,
                artifact_dir,
                plan,
            } => commands::deploy_command(orchestrator, package, artifact_dir, plan, reporter).await,
            Operation::Lifecycle(action, package) => {
                commands::lifecycle_command(orchestrator, *action, package, reporter).await
            }
            Operation::Run(package) => commands::run_command(orchestrator, package, reporter).await,
        }
    }
}
