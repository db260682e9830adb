//! Multicast DNS probing with one daemon per adapter

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent};

use super::resolver::{Adapter, MulticastProbe, ServiceInstance};

/// Browses a service type with `mdns-sd`
#[derive(Debug, Clone, Default)]
pub struct MdnsProbe;

impl MdnsProbe {
    /// Create a new probe
    pub fn new() -> Self {
        Self
    }

    async fn browse(
        adapter: &Adapter,
        service_type: &str,
        timeout: Duration,
    ) -> Result<Vec<ServiceInstance>, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;
        daemon.disable_interface(IfKind::All)?;
        daemon.enable_interface(IfKind::Addr(adapter.address))?;

        let receiver = daemon.browse(service_type)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut found = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let addresses: BTreeSet<IpAddr> = info
                        .get_addresses()
                        .iter()
                        .map(|address| IpAddr::from(*address))
                        .collect();
                    tracing::trace!(
                        "{} answered on {} with {:?}",
                        info.get_fullname(),
                        adapter,
                        addresses
                    );
                    found.push(ServiceInstance {
                        name: instance_name(info.get_fullname(), service_type),
                        addresses: addresses.into_iter().collect(),
                    });
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if let Err(e) = daemon.shutdown() {
            tracing::debug!("mDNS daemon on {} did not shut down cleanly: {}", adapter, e);
        }
        Ok(found)
    }
}

#[async_trait]
impl MulticastProbe for MdnsProbe {
    fn adapters(&self) -> Vec<Adapter> {
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .map(|iface| Adapter {
                    address: iface.ip(),
                    name: iface.name,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Could not list network adapters: {}", e);
                Vec::new()
            }
        }
    }

    async fn probe(
        &self,
        adapter: &Adapter,
        service_type: &str,
        timeout: Duration,
    ) -> Vec<ServiceInstance> {
        match Self::browse(adapter, service_type, timeout).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("mDNS probe on {} failed: {}", adapter, e);
                Vec::new()
            }
        }
    }
}

/// `sensor-1._sftp-ssh._tcp.local.` -> `sensor-1`
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_end_matches('.')
        .to_string()
}
