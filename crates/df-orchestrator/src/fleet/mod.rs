//! Deployment orchestrator
//!
//! An [`Orchestrator`] owns one [`ExecutionClient`] per reachable host and
//! applies each operation to all of them concurrently. Failures stay with
//! the host they happened on: they are logged, recorded in the returned
//! [`FleetReport`], and the remaining hosts carry on. Only a failed upload
//! during [`Orchestrator::deploy`] drops a host from the fleet.

mod commands;
mod report;

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use df_client::{ExecutionClient, Resolver, SshConnector};
use df_core::config::DeployConfig;
use df_core::error::DeployError;
use df_core::shell;
use df_core::traits::{Connector, Relay};
use df_core::types::{Interface, ResolvedHost, TargetDescriptor};
use df_core::{DependencyManifest, PackageConfig, StartParameter};

pub use commands::{Lifecycle, RemoteCommand};
pub use report::{FleetReport, HostReport, Outcome};

use commands::AptCommands;

/// What a host's step amounted to
enum Step {
    Done,
    Skipped(String),
}

/// A failed step; `remove` drops the host from the fleet
struct StepError {
    error: DeployError,
    remove: bool,
}

impl StepError {
    fn removal(error: DeployError) -> Self {
        Self {
            error,
            remove: true,
        }
    }
}

impl From<DeployError> for StepError {
    fn from(error: DeployError) -> Self {
        Self {
            error,
            remove: false,
        }
    }
}

type StepResult = Result<Step, StepError>;

/// Runs deployment operations across a fleet of hosts
pub struct Orchestrator {
    clients: Vec<ExecutionClient>,
    relay: Arc<dyn Relay>,
    config: DeployConfig,
    connect_report: FleetReport,
}

impl Orchestrator {
    /// Resolve `descriptors` and open an SSH session to every host found
    pub async fn connect(
        descriptors: &[TargetDescriptor],
        resolver: &Resolver,
        config: DeployConfig,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self::connect_with(descriptors, resolver, &SshConnector::new(), config, relay).await
    }

    /// Like [`Orchestrator::connect`] with an explicit connector
    ///
    /// Hosts that do not resolve or refuse the connection are left out of
    /// the fleet and recorded in [`Orchestrator::connect_report`].
    pub async fn connect_with(
        descriptors: &[TargetDescriptor],
        resolver: &Resolver,
        connector: &dyn Connector,
        config: DeployConfig,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let mut report = FleetReport::new("connect");
        let mut hosts: Vec<ResolvedHost> = Vec::new();

        let resolved = join_all(descriptors.iter().map(|d| resolver.resolve_one(d))).await;
        for (descriptor, result) in descriptors.iter().zip(resolved) {
            match result {
                Ok(found) => hosts.extend(found),
                Err(e) => {
                    tracing::error!("{}", e);
                    report.push(descriptor.name.clone(), Outcome::Failed(e.to_string()));
                }
            }
        }

        let connected = join_all(
            hosts
                .iter()
                .map(|host| ExecutionClient::connect_with(connector, host.clone(), &config.ssh)),
        )
        .await;

        let mut clients = Vec::with_capacity(connected.len());
        for (host, result) in hosts.iter().zip(connected) {
            match result {
                Ok(client) => {
                    tracing::info!("Connected to {}", host);
                    report.push(host.identity(), Outcome::Succeeded);
                    clients.push(client);
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    report.push(host.identity(), Outcome::Failed(e.to_string()));
                }
            }
        }

        let mut orchestrator = Self::from_clients(clients, config, relay);
        orchestrator.connect_report = report;
        orchestrator
    }

    /// Build a fleet from already connected clients
    pub fn from_clients(
        clients: Vec<ExecutionClient>,
        config: DeployConfig,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self {
            clients,
            relay,
            config,
            connect_report: FleetReport::new("connect"),
        }
    }

    /// Outcome of resolving and connecting, one entry per attempted host
    pub fn connect_report(&self) -> &FleetReport {
        &self.connect_report
    }

    /// Hosts currently in the fleet
    pub fn hosts(&self) -> impl Iterator<Item = &ResolvedHost> {
        self.clients.iter().map(ExecutionClient::host)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Make sure exactly `dependencies` were installed last time
    ///
    /// Hosts whose manifest already lists the same set, in any order, are
    /// skipped. Others fetch through the relay, install, and record the new
    /// manifest.
    pub async fn ensure_packages<S: AsRef<str>>(&mut self, dependencies: &[S]) -> FleetReport {
        let plan = PackagePlan {
            wanted: DependencyManifest::new(dependencies),
            manifest_path: self.config.packages.manifest_path.clone(),
            apt: AptCommands::new(&self.config),
            relay: self.relay.clone(),
        };

        let results = join_all(self.clients.iter_mut().map(|c| ensure_packages_on(c, &plan))).await;
        self.record("ensure_packages", results).await
    }

    /// Enable hardware interfaces that are not enabled yet
    pub async fn ensure_enabled(&mut self, interfaces: &[Interface]) -> FleetReport {
        let results =
            join_all(self.clients.iter_mut().map(|c| ensure_enabled_on(c, interfaces))).await;
        self.record("ensure_enabled", results).await
    }

    /// Copy `artifact_dir` to every host and install its systemd unit
    ///
    /// A host whose upload fails is closed and removed from the fleet.
    pub async fn deploy(
        &mut self,
        package: &str,
        artifact_dir: &Path,
        parameters: &[StartParameter],
    ) -> Result<FleetReport, DeployError> {
        PackageConfig::with_parameters(package, "", parameters.to_vec())?;
        let metadata = tokio::fs::metadata(artifact_dir)
            .await
            .map_err(|e| DeployError::local_io(artifact_dir, e))?;
        if !metadata.is_dir() {
            return Err(DeployError::local_io(
                artifact_dir,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let results = join_all(
            self.clients
                .iter_mut()
                .map(|c| deploy_on(c, package, artifact_dir, parameters)),
        )
        .await;
        Ok(self.record("deploy", results).await)
    }

    /// Apply a service lifecycle action on every host
    pub async fn lifecycle(
        &mut self,
        action: Lifecycle,
        package: &str,
    ) -> Result<FleetReport, DeployError> {
        PackageConfig::new(package, "")?;
        let results =
            join_all(self.clients.iter_mut().map(|c| lifecycle_on(c, action, package))).await;
        Ok(self.record(&action.to_string(), results).await)
    }

    /// Enable and start the service
    pub async fn install(&mut self, package: &str) -> Result<FleetReport, DeployError> {
        self.lifecycle(Lifecycle::Install, package).await
    }

    pub async fn start(&mut self, package: &str) -> Result<FleetReport, DeployError> {
        self.lifecycle(Lifecycle::Start, package).await
    }

    pub async fn stop(&mut self, package: &str) -> Result<FleetReport, DeployError> {
        self.lifecycle(Lifecycle::Stop, package).await
    }

    pub async fn restart(&mut self, package: &str) -> Result<FleetReport, DeployError> {
        self.lifecycle(Lifecycle::Restart, package).await
    }

    /// Stop, disable, and delete the service and its files
    pub async fn uninstall(&mut self, package: &str) -> Result<FleetReport, DeployError> {
        self.lifecycle(Lifecycle::Uninstall, package).await
    }

    /// Start the service, then follow its journal on each host in turn
    ///
    /// Lines read from `input` go to the followed process; two empty lines
    /// move on to the next host.
    pub async fn run<R>(&mut self, package: &str, input: R) -> Result<FleetReport, DeployError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut report = self.lifecycle(Lifecycle::Start, package).await?;
        report.operation = "run".to_string();

        let mut lines = input.lines();
        for (client, entry) in self.clients.iter_mut().zip(report.hosts.iter_mut()) {
            if entry.outcome.is_failure() {
                continue;
            }
            let package = PackageConfig::new(package, client.host().username.clone())?;
            let follow = commands::follow_journal(&package);
            match client.run(&follow, &mut lines).await {
                Ok(None) => {}
                Ok(Some(code)) => {
                    tracing::info!("{}: `{}` ended with status {}", client.identity(), follow, code);
                }
                Err(e) => {
                    tracing::error!("run: {}", describe(client.identity(), &e));
                    entry.outcome = Outcome::Failed(e.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Close every session, releasing relay registrations
    pub async fn close(&mut self) {
        let results = join_all(self.clients.iter_mut().map(|c| c.close())).await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!("{}", e);
            }
        }
    }

    /// Turn per-host results into a report and drop hosts marked for removal
    async fn record(&mut self, operation: &str, results: Vec<StepResult>) -> FleetReport {
        let mut report = FleetReport::new(operation);
        let mut removed = BTreeSet::new();

        for (index, (client, result)) in self.clients.iter().zip(results).enumerate() {
            let outcome = match result {
                Ok(Step::Done) => Outcome::Succeeded,
                Ok(Step::Skipped(reason)) => {
                    tracing::info!("{}: {}", client.identity(), reason);
                    Outcome::Skipped(reason)
                }
                Err(StepError {
                    error,
                    remove: false,
                }) => {
                    tracing::error!("{}: {}", operation, describe(client.identity(), &error));
                    Outcome::Failed(error.to_string())
                }
                Err(StepError {
                    error,
                    remove: true,
                }) => {
                    tracing::warn!(
                        "{}: removing from fleet: {}",
                        operation,
                        describe(client.identity(), &error)
                    );
                    removed.insert(index);
                    Outcome::Removed(error.to_string())
                }
            };
            report.push(client.identity(), outcome);
        }

        if !removed.is_empty() {
            let clients = std::mem::take(&mut self.clients);
            for (index, mut client) in clients.into_iter().enumerate() {
                if !removed.contains(&index) {
                    self.clients.push(client);
                } else if let Err(e) = client.close().await {
                    tracing::warn!("{}", e);
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("clients", &self.clients)
            .finish()
    }
}

/// Error text prefixed with the host unless the error already names it
fn describe(identity: &str, error: &DeployError) -> String {
    match error.host() {
        Some(_) => error.to_string(),
        None => format!("{}: {}", identity, error),
    }
}

struct PackagePlan {
    wanted: DependencyManifest,
    manifest_path: String,
    apt: AptCommands,
    relay: Arc<dyn Relay>,
}

async fn ensure_packages_on(client: &mut ExecutionClient, plan: &PackagePlan) -> StepResult {
    let recorded = client.download(&plan.manifest_path).await?;
    let installed = DependencyManifest::parse(&String::from_utf8_lossy(&recorded));
    if installed == plan.wanted {
        return Ok(Step::Skipped(format!(
            "{} dependencies already installed",
            plan.wanted.len()
        )));
    }

    client.set_proxy(plan.relay.clone()).await?;
    let result = install_packages(client, plan).await;
    client.clear_proxy().await;
    result?;

    tracing::info!(
        "{}: installed {} dependencies",
        client.identity(),
        plan.wanted.len()
    );
    Ok(Step::Done)
}

async fn install_packages(client: &mut ExecutionClient, plan: &PackagePlan) -> Result<(), DeployError> {
    let cached = client.exec(&plan.apt.cache_exists(), false).await?.success();
    let update = if cached {
        plan.apt.update_if_stale()
    } else {
        plan.apt.update()
    };
    client.exec(&update, true).await?;
    client.exec(&plan.apt.install(&plan.wanted), true).await?;

    if let Some(dir) = shell::parent(&plan.manifest_path) {
        client.mkdir(dir).await?;
    }
    client
        .upload_bytes(plan.wanted.render().as_bytes(), &plan.manifest_path)
        .await
}

async fn ensure_enabled_on(client: &mut ExecutionClient, interfaces: &[Interface]) -> StepResult {
    let mut enabled = Vec::new();
    for interface in interfaces {
        let status = client
            .exec(&commands::interface_status(*interface), true)
            .await?;
        if status.stdout.trim() == "0" {
            tracing::debug!("{}: {} already enabled", client.identity(), interface);
            continue;
        }
        client
            .exec(&commands::enable_interface(*interface), true)
            .await?;
        tracing::warn!(
            "{}: enabled {}; a reboot may be required",
            client.identity(),
            interface
        );
        enabled.push(interface.to_string());
    }

    if enabled.is_empty() {
        Ok(Step::Skipped("interfaces already enabled".to_string()))
    } else {
        Ok(Step::Done)
    }
}

async fn deploy_on(
    client: &mut ExecutionClient,
    package: &str,
    artifact_dir: &Path,
    parameters: &[StartParameter],
) -> StepResult {
    let package = PackageConfig::with_parameters(
        package,
        client.host().username.clone(),
        parameters.to_vec(),
    )
    .map_err(DeployError::from)?;

    client
        .upload_dir(artifact_dir, &package.install_dir())
        .await
        .map_err(StepError::removal)?;
    client
        .upload_bytes(package.render_unit().as_bytes(), &package.unit_path())
        .await
        .map_err(StepError::removal)?;
    client.exec(commands::DAEMON_RELOAD, true).await?;

    tracing::info!(
        "{}: deployed {} to {}",
        client.identity(),
        package.name(),
        package.install_dir()
    );
    Ok(Step::Done)
}

async fn lifecycle_on(client: &mut ExecutionClient, action: Lifecycle, package: &str) -> StepResult {
    let package =
        PackageConfig::new(package, client.host().username.clone()).map_err(DeployError::from)?;
    for command in action.commands(&package) {
        client.exec(&command.line, command.check).await?;
    }
    Ok(Step::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use df_client::discovery::{Adapter, MulticastProbe, NameLookup, ServiceInstance};
    use df_client::testing::{MockConnector, MockRemote};
    use df_core::config::{DiscoveryConfig, RelayConfig};
    use df_core::types::DiscoveryMethod;

    use crate::relay::RelayServer;

    #[derive(Default)]
    struct StaticLookup(HashMap<String, IpAddr>);

    #[async_trait]
    impl NameLookup for StaticLookup {
        async fn lookup(&self, name: &str) -> Option<IpAddr> {
            self.0.get(name).copied()
        }
    }

    struct NoAdapters;

    #[async_trait]
    impl MulticastProbe for NoAdapters {
        fn adapters(&self) -> Vec<Adapter> {
            Vec::new()
        }

        async fn probe(&self, _: &Adapter, _: &str, _: Duration) -> Vec<ServiceInstance> {
            Vec::new()
        }
    }

    fn relay(base_port: u16) -> RelayServer {
        RelayServer::new(RelayConfig {
            base_port,
            ..RelayConfig::default()
        })
    }

    fn fleet(remotes: &[&MockRemote], relay: &RelayServer) -> Orchestrator {
        let clients = remotes
            .iter()
            .enumerate()
            .map(|(i, remote)| {
                remote.client(&format!("sensor-{}", i + 1), &format!("192.168.1.{}", 21 + i))
            })
            .collect();
        Orchestrator::from_clients(clients, DeployConfig::default(), Arc::new(relay.clone()))
    }

    fn artifact() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/weather"), b"exec java -jar weather.jar\n").unwrap();
        std::fs::write(dir.path().join("weather.jar"), b"PK").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_connect_skips_unresolved_and_unreachable_hosts() {
        let up = MockRemote::new();
        let down = MockRemote::new();
        down.refuse_connections();

        let mut table = HashMap::new();
        table.insert("sensor-1".to_string(), "10.0.0.1".parse().unwrap());
        table.insert("sensor-2".to_string(), "10.0.0.2".parse().unwrap());
        let resolver = Resolver::with_backends(
            DiscoveryConfig::default(),
            Box::new(StaticLookup(table)),
            Box::new(NoAdapters),
        );
        let connector = MockConnector::new()
            .with_remote("10.0.0.1".parse().unwrap(), up)
            .with_remote("10.0.0.2".parse().unwrap(), down);

        let descriptors: Vec<TargetDescriptor> = ["sensor-1", "sensor-2", "ghost"]
            .iter()
            .map(|name| TargetDescriptor::new(DiscoveryMethod::Hostname, *name, "pi", "raspberry"))
            .collect();

        let relay = relay(19180);
        let orchestrator = Orchestrator::connect_with(
            &descriptors,
            &resolver,
            &connector,
            DeployConfig::default(),
            Arc::new(relay),
        )
        .await;

        assert_eq!(orchestrator.len(), 1);
        assert_eq!(orchestrator.hosts().next().unwrap().name, "sensor-1");

        let report = orchestrator.connect_report();
        assert_eq!(report.failures().count(), 2);
        assert!(report
            .hosts
            .iter()
            .any(|h| h.host == "ghost" && h.outcome.is_failure()));
    }

    #[tokio::test]
    async fn test_ensure_packages_installs_then_skips_same_set() {
        let remote = MockRemote::new();
        let relay = relay(19280);
        let mut orchestrator = fleet(&[&remote], &relay);

        let report = orchestrator.ensure_packages(&["python3", "git", "i2c-tools"]).await;
        assert!(report.is_success());
        assert_eq!(report.count("ok"), 1);
        assert_eq!(
            remote.file("/var/lib/devfleet/dependencies").unwrap().data,
            b"git i2c-tools python3\n"
        );
        let installs = remote
            .commands()
            .iter()
            .filter(|c| c.contains("install -y"))
            .count();
        assert_eq!(installs, 1);
        assert!(remote
            .commands()
            .iter()
            .any(|c| c.starts_with("find /var/cache/apt/pkgcache.bin -mtime +30")));

        let report = orchestrator.ensure_packages(&["i2c-tools", "python3", "git"]).await;
        assert_eq!(report.count("skipped"), 1);
        let installs = remote
            .commands()
            .iter()
            .filter(|c| c.contains("install -y"))
            .count();
        assert_eq!(installs, 1);
    }

    #[tokio::test]
    async fn test_ensure_packages_releases_relay() {
        let first = MockRemote::new();
        let second = MockRemote::new();
        second.fail_commands_containing("install -y", 100, "E: Unable to locate package\n");
        let relay = relay(19380);
        let mut orchestrator = fleet(&[&first, &second], &relay);

        let report = orchestrator.ensure_packages(&["python3"]).await;
        assert_eq!(report.hosts[0].outcome, Outcome::Succeeded);
        assert!(matches!(report.hosts[1].outcome, Outcome::Failed(_)));

        // A failed install keeps the host and records nothing
        assert_eq!(orchestrator.len(), 2);
        assert!(second.file("/var/lib/devfleet/dependencies").is_none());

        assert_eq!(relay.client_count().await, 0);
        assert!(!relay.is_running().await);
        assert!(first.forwards().is_empty());
        assert!(second.forwards().is_empty());
    }

    #[tokio::test]
    async fn test_missing_cache_updates_unconditionally() {
        let remote = MockRemote::new();
        remote.script("test -e /var/cache/apt/pkgcache.bin", 1, "", "");
        let relay = relay(19480);
        let mut orchestrator = fleet(&[&remote], &relay);

        orchestrator.ensure_packages(&["git"]).await;
        assert!(remote.commands().iter().any(|c| c
            == "sudo apt-get -o Acquire::http::proxy=\"http://localhost:8080\" update"));
        assert!(!remote.commands().iter().any(|c| c.starts_with("find ")));
    }

    #[tokio::test]
    async fn test_ensure_enabled_only_touches_disabled_interfaces() {
        let remote = MockRemote::new();
        remote.script("sudo raspi-config nonint get_spi", 0, "0\n", "");
        remote.script("sudo raspi-config nonint get_i2c", 0, "1\n", "");
        let relay = relay(19580);
        let mut orchestrator = fleet(&[&remote], &relay);

        let report = orchestrator
            .ensure_enabled(&[Interface::Spi, Interface::I2c])
            .await;
        assert_eq!(report.hosts[0].outcome, Outcome::Succeeded);

        let commands = remote.commands();
        assert!(commands.contains(&"sudo raspi-config nonint do_i2c 0".to_string()));
        assert!(!commands.contains(&"sudo raspi-config nonint do_spi 0".to_string()));

        remote.script("sudo raspi-config nonint get_i2c", 0, "0\n", "");
        let report = orchestrator.ensure_enabled(&[Interface::I2c]).await;
        assert_eq!(report.count("skipped"), 1);
    }

    #[tokio::test]
    async fn test_deploy_drops_host_whose_upload_fails() {
        let hosts = [MockRemote::new(), MockRemote::new(), MockRemote::new()];
        hosts[1].reject_uploads_to("/usr/local");
        let relay = relay(19680);
        let mut orchestrator = fleet(&[&hosts[0], &hosts[1], &hosts[2]], &relay);
        let dir = artifact();
        let parameters = vec!["STATION=roof".parse::<StartParameter>().unwrap()];

        let report = orchestrator
            .deploy("weather", dir.path(), &parameters)
            .await
            .unwrap();

        assert_eq!(report.hosts[0].outcome, Outcome::Succeeded);
        assert!(matches!(report.hosts[1].outcome, Outcome::Removed(_)));
        assert_eq!(report.hosts[2].outcome, Outcome::Succeeded);

        let names: Vec<&str> = orchestrator.hosts().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["sensor-1", "sensor-3"]);
        assert_eq!(hosts[1].close_count(), 1);

        for remote in [&hosts[0], &hosts[2]] {
            assert_eq!(
                remote.file("/usr/local/weather/weather.jar").unwrap().data,
                b"PK"
            );
            let unit = remote.file("/etc/systemd/system/weather.service").unwrap();
            let unit = String::from_utf8(unit.data).unwrap();
            assert!(unit.contains("Environment=\"STATION=roof\"\n"));
            assert!(unit.contains("User=pi\n"));
            assert!(remote
                .commands()
                .contains(&"sudo systemctl daemon-reload".to_string()));
        }
        assert!(!hosts[1]
            .commands()
            .contains(&"sudo systemctl daemon-reload".to_string()));

        // Later operations only reach the remaining hosts
        orchestrator.restart("weather").await.unwrap();
        assert!(!hosts[1]
            .commands()
            .contains(&"sudo systemctl restart weather".to_string()));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_host() {
        let remote = MockRemote::new();
        remote.fail_commands_containing("daemon-reload", 1, "Failed to reload\n");
        let relay = relay(19780);
        let mut orchestrator = fleet(&[&remote], &relay);
        let dir = artifact();

        let report = orchestrator.deploy("weather", dir.path(), &[]).await.unwrap();
        assert!(matches!(report.hosts[0].outcome, Outcome::Failed(_)));
        assert_eq!(orchestrator.len(), 1);
    }

    #[tokio::test]
    async fn test_deploy_rejects_missing_artifact_dir() {
        let remote = MockRemote::new();
        let relay = relay(19880);
        let mut orchestrator = fleet(&[&remote], &relay);

        let err = orchestrator
            .deploy("weather", Path::new("/nonexistent/devfleet/build"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::LocalIo { .. }));

        let err = orchestrator.start("../etc").await.unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
        assert!(remote.commands().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_removes_files() {
        let remote = MockRemote::new();
        let relay = relay(19980);
        let mut orchestrator = fleet(&[&remote], &relay);
        let dir = artifact();

        orchestrator.deploy("weather", dir.path(), &[]).await.unwrap();
        orchestrator.install("weather").await.unwrap();
        remote.fail_commands_containing("systemctl stop", 5, "Unit weather.service not loaded.\n");

        let report = orchestrator.uninstall("weather").await.unwrap();
        assert!(report.is_success());
        assert!(remote.file("/etc/systemd/system/weather.service").is_none());
        assert!(remote.file("/usr/local/weather/bin/weather").is_none());

        let report = orchestrator.stop("weather").await.unwrap();
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_run_follows_each_host_in_turn() {
        let first = MockRemote::new();
        let second = MockRemote::new();
        for remote in [&first, &second] {
            remote.script_follow("journalctl -f -u weather", "-- Logs begin --\n");
        }
        let relay = relay(20080);
        let mut orchestrator = fleet(&[&first, &second], &relay);

        let input: &[u8] = b"\n\nhello\n\n\n";
        let report = orchestrator.run("weather", input).await.unwrap();

        assert_eq!(report.operation, "run");
        assert!(report.is_success());
        for remote in [&first, &second] {
            assert!(remote
                .commands()
                .contains(&"sudo systemctl start weather".to_string()));
        }
        assert_eq!(first.stdin_for("journalctl -f -u weather"), b"\n");
        assert_eq!(second.stdin_for("journalctl -f -u weather"), b"hello\n\n");
    }

    #[tokio::test]
    async fn test_close_closes_every_session() {
        let first = MockRemote::new();
        let second = MockRemote::new();
        let relay = relay(20180);
        let mut orchestrator = fleet(&[&first, &second], &relay);

        orchestrator.close().await;
        orchestrator.close().await;
        assert_eq!(first.close_count(), 1);
        assert_eq!(second.close_count(), 1);
    }
}
