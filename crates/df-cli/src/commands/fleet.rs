//! Fleet command implementations

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;

use crate::output::{print_report, print_warning};
use df_client::Resolver;
use df_core::config::DeployConfig;
use df_core::types::{DiscoveryMethod, Interface, TargetDescriptor};
use df_core::StartParameter;
use df_orchestrator::{FleetReport, Lifecycle, Orchestrator, RelayServer};

/// Which devices a command addresses
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Device to address (repeatable); defaults to the configured targets
    #[arg(short = 't', long = "target", value_name = "NAME")]
    pub targets: Vec<String>,

    /// Login user for --target devices
    #[arg(short, long, default_value = "pi")]
    pub user: String,

    /// Password for --target devices
    #[arg(long, env = "DEVFLEET_PASSWORD", hide_env_values = true, default_value = "")]
    pub password: String,

    /// How --target names are resolved
    #[arg(long, default_value_t = DiscoveryMethod::HostnameThenMulticast)]
    pub discovery: DiscoveryMethod,
}

impl TargetArgs {
    /// Descriptors from the command line, or from the configuration
    pub fn descriptors(&self, config: &DeployConfig) -> Result<Vec<TargetDescriptor>> {
        if self.targets.is_empty() {
            if config.targets.is_empty() {
                bail!("No targets: pass --target NAME or add [[targets]] to the configuration");
            }
            return Ok(config.targets.clone());
        }

        Ok(self
            .targets
            .iter()
            .map(|name| {
                TargetDescriptor::new(
                    self.discovery,
                    name.as_str(),
                    self.user.as_str(),
                    self.password.as_str(),
                )
            })
            .collect())
    }
}

/// What `deploy` does besides copying the artifact
#[derive(Debug, Clone, Default)]
pub struct DeployPlan {
    pub dependencies: Vec<String>,
    pub interfaces: Vec<Interface>,
    pub parameters: Vec<StartParameter>,
    pub install: bool,
}

/// Collects the reports of one invocation
pub struct Reporter {
    json: bool,
    failed: usize,
}

impl Reporter {
    pub fn new(json: bool) -> Self {
        Self { json, failed: 0 }
    }

    /// Print `report` and remember its failures
    pub fn report(&mut self, report: &FleetReport) {
        self.failed += report.failures().count();
        print_report(report, self.json);
    }

    /// Error out when any host failed along the way
    pub fn finish(self) -> Result<()> {
        if self.failed > 0 {
            bail!("{} host operation(s) failed", self.failed);
        }
        Ok(())
    }
}

/// Resolve targets and connect; bails when no host is reachable
pub async fn connect(
    config: &DeployConfig,
    targets: &TargetArgs,
    reporter: &mut Reporter,
) -> Result<Orchestrator> {
    let descriptors = targets.descriptors(config)?;
    let resolver = Resolver::new(config.discovery.clone());
    let relay = RelayServer::new(config.relay.clone());

    let orchestrator =
        Orchestrator::connect(&descriptors, &resolver, config.clone(), Arc::new(relay)).await;

    let connected = orchestrator.connect_report();
    if !connected.is_success() {
        reporter.report(connected);
    }
    if orchestrator.is_empty() {
        bail!("None of the {} target(s) could be reached", descriptors.len());
    }
    Ok(orchestrator)
}

pub async fn deps_command(
    orchestrator: &mut Orchestrator,
    dependencies: &[String],
    reporter: &mut Reporter,
) -> Result<()> {
    reporter.report(&orchestrator.ensure_packages(dependencies).await);
    Ok(())
}

pub async fn enable_command(
    orchestrator: &mut Orchestrator,
    interfaces: &[Interface],
    reporter: &mut Reporter,
) -> Result<()> {
    let report = orchestrator.ensure_enabled(interfaces).await;
    if report.count("ok") > 0 {
        print_warning("Interfaces were enabled; a reboot may be required");
    }
    reporter.report(&report);
    Ok(())
}

/// Dependencies, interfaces, artifact, and optionally service start
pub async fn deploy_command(
    orchestrator: &mut Orchestrator,
    package: &str,
    artifact_dir: &Path,
    plan: &DeployPlan,
    reporter: &mut Reporter,
) -> Result<()> {
    if !plan.dependencies.is_empty() {
        deps_command(orchestrator, &plan.dependencies, reporter).await?;
    }
    if !plan.interfaces.is_empty() {
        enable_command(orchestrator, &plan.interfaces, reporter).await?;
    }

    reporter.report(
        &orchestrator
            .deploy(package, artifact_dir, &plan.parameters)
            .await?,
    );

    if plan.install && !orchestrator.is_empty() {
        reporter.report(&orchestrator.install(package).await?);
    }
    Ok(())
}

pub async fn lifecycle_command(
    orchestrator: &mut Orchestrator,
    action: Lifecycle,
    package: &str,
    reporter: &mut Reporter,
) -> Result<()> {
    reporter.report(&orchestrator.lifecycle(action, package).await?);
    Ok(())
}

/// Start the service and follow its journal, reading operator input from stdin
pub async fn run_command(
    orchestrator: &mut Orchestrator,
    package: &str,
    reporter: &mut Reporter,
) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    reporter.report(&orchestrator.run(package, stdin).await?);
    Ok(())
}
