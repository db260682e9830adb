//! Relay trait
//!
//! An execution client registers with a relay before opening a reverse
//! forward to it. The relay itself lives in `df-orchestrator`.

use async_trait::async_trait;

use crate::error::DeployError;

/// Proof of one registration with a relay
///
/// Not `Clone`: handing it back to [`Relay::unregister_client`] consumes it,
/// so one registration is released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct RelayRegistration {
    id: u64,
    port: u16,
}

impl RelayRegistration {
    /// Issued by a relay implementation
    pub fn new(id: u64, port: u16) -> Self {
        Self { id, port }
    }

    /// Registration id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Local port the relay listened on when the registration was made
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// A shared local proxy that devices reach through a reverse forward
#[async_trait]
pub trait Relay: Send + Sync {
    /// Port opened on the device's loopback
    fn remote_port(&self) -> u16;

    /// Register a client, starting the listener if needed
    async fn register_client(&self, client_id: &str) -> Result<RelayRegistration, DeployError>;

    /// Release a registration, stopping the listener after the last one
    async fn unregister_client(&self, registration: RelayRegistration);
}
