//! Descriptor resolution policy

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use df_core::config::DiscoveryConfig;
use df_core::error::DeployError;
use df_core::types::{DiscoveryMethod, ResolvedHost, TargetDescriptor};

use super::mdns::MdnsProbe;

/// Plain host name resolution
#[async_trait]
pub trait NameLookup: Send + Sync {
    /// First address `name` resolves to, if any
    async fn lookup(&self, name: &str) -> Option<IpAddr>;
}

/// Resolves names through the operating system resolver
#[derive(Debug, Clone, Default)]
pub struct SystemLookup;

#[async_trait]
impl NameLookup for SystemLookup {
    async fn lookup(&self, name: &str) -> Option<IpAddr> {
        match tokio::net::lookup_host((name, 0)).await {
            Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
            Err(e) => {
                tracing::debug!("Lookup of {} failed: {}", name, e);
                None
            }
        }
    }
}

/// A local network adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    pub name: String,
    pub address: IpAddr,
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// One service instance seen while browsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Instance name without the service type
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Multicast DNS browsing
#[async_trait]
pub trait MulticastProbe: Send + Sync {
    /// Candidate adapters, loopback excluded
    fn adapters(&self) -> Vec<Adapter>;

    /// Browse `service_type` on one adapter for `timeout`
    async fn probe(
        &self,
        adapter: &Adapter,
        service_type: &str,
        timeout: Duration,
    ) -> Vec<ServiceInstance>;
}

/// Link-local, or in one of the private IPv4 ranges
pub fn is_local_network(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_link_local() || v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Turns target descriptors into resolved hosts
pub struct Resolver {
    config: DiscoveryConfig,
    lookup: Box<dyn NameLookup>,
    probe: Box<dyn MulticastProbe>,
}

impl Resolver {
    /// Resolver backed by the system resolver and `mdns-sd`
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_backends(config, Box::new(SystemLookup), Box::new(MdnsProbe::new()))
    }

    /// Resolver with explicit collaborators
    pub fn with_backends(
        config: DiscoveryConfig,
        lookup: Box<dyn NameLookup>,
        probe: Box<dyn MulticastProbe>,
    ) -> Self {
        Self {
            config,
            lookup,
            probe,
        }
    }

    /// Resolve every descriptor; unresolvable ones are logged and skipped
    pub async fn resolve(&self, descriptors: &[TargetDescriptor]) -> Vec<ResolvedHost> {
        let results = join_all(descriptors.iter().map(|d| self.resolve_one(d))).await;

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(hosts) => Some(hosts),
                Err(e) => {
                    tracing::error!("{}", e);
                    None
                }
            })
            .flatten()
            .collect()
    }

    /// Resolve one descriptor to all addresses it answers on
    pub async fn resolve_one(
        &self,
        descriptor: &TargetDescriptor,
    ) -> Result<Vec<ResolvedHost>, DeployError> {
        let addresses: Vec<IpAddr> = match descriptor.discovery {
            DiscoveryMethod::Hostname => self.by_hostname(&descriptor.name).await.into_iter().collect(),
            DiscoveryMethod::Multicast => self.by_multicast(&descriptor.name).await,
            DiscoveryMethod::HostnameThenMulticast => match self.by_hostname(&descriptor.name).await {
                Some(address) => vec![address],
                None => self.by_multicast(&descriptor.name).await,
            },
        };

        if addresses.is_empty() {
            return Err(DeployError::Resolution {
                name: descriptor.name.clone(),
            });
        }

        let hosts: Vec<ResolvedHost> = addresses
            .into_iter()
            .map(|address| descriptor.resolved(address))
            .collect();
        for host in &hosts {
            tracing::info!("Found {}", host);
        }
        Ok(hosts)
    }

    /// Resolve `name`, retrying once with the local suffix
    async fn by_hostname(&self, name: &str) -> Option<IpAddr> {
        if let Some(address) = self.lookup.lookup(name).await {
            return Some(address);
        }

        let suffix = &self.config.local_suffix;
        if suffix.is_empty() || name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
            return None;
        }

        let local = format!("{}{}", name, suffix);
        tracing::debug!("{} not found, trying {}", name, local);
        self.lookup.lookup(&local).await
    }

    /// Browse every selected adapter in parallel for instances named `name`
    async fn by_multicast(&self, name: &str) -> Vec<IpAddr> {
        let adapters: Vec<Adapter> = self
            .probe
            .adapters()
            .into_iter()
            .filter(|adapter| self.config.all_adapters || is_local_network(&adapter.address))
            .collect();

        if adapters.is_empty() {
            tracing::warn!("No network adapter to search for {} on", name);
            return Vec::new();
        }

        tracing::info!(
            "Searching for {} on {} adapter(s) for {:?}",
            name,
            adapters.len(),
            self.config.multicast_timeout
        );

        let probes = adapters.iter().map(|adapter| {
            self.probe
                .probe(adapter, &self.config.service_type, self.config.multicast_timeout)
        });
        let wanted = name
            .strip_suffix(self.config.local_suffix.as_str())
            .unwrap_or(name);

        let addresses: BTreeSet<IpAddr> = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .filter(|instance| instance.name.eq_ignore_ascii_case(wanted))
            .flat_map(|instance| instance.addresses)
            .collect();

        if addresses.is_empty() {
            tracing::warn!("{} did not answer on any adapter", name);
        }
        addresses.into_iter().collect()
    }
}
