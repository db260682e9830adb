//! df-orchestrator: Fleet deployment and the local proxy relay
//!
//! The [`Orchestrator`] drives package installation, interface setup,
//! artifact deployment, and systemd lifecycle across every connected host.
//! Devices without internet access fetch packages through the
//! [`RelayServer`], reached over a reverse port forward.

pub mod fleet;
pub mod relay;

pub use fleet::{FleetReport, HostReport, Lifecycle, Orchestrator, Outcome};
pub use relay::{ProxyError, RelayServer};
