//! Local proxy relay
//!
//! A [`RelayServer`] is shared by every execution client of one run. The
//! listening socket exists only while at least one client is registered:
//! the first registration binds it, the last unregistration closes it.
//! Devices reach it through a reverse port forward on their loopback.

mod http;
mod listener;
mod socks5;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use df_core::config::RelayConfig;
use df_core::error::DeployError;
use df_core::traits::{Relay, RelayRegistration};

pub use http::RequestHead;

/// Errors that end one proxied connection
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The client spoke something we do not understand
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct RunningListener {
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RelayState {
    registrations: HashSet<u64>,
    listener: Option<RunningListener>,
}

struct RelayInner {
    config: RelayConfig,
    state: Mutex<RelayState>,
    next_id: AtomicU64,
}

/// Reference-counted SOCKS5 / HTTP proxy on 127.0.0.1
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<RelayInner>,
}

impl RelayServer {
    /// Create a relay; nothing is bound until the first registration
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                state: Mutex::new(RelayState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Relay settings
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Register `client_id`, binding the listener if it is not running
    pub async fn register_client(
        &self,
        client_id: &str,
    ) -> Result<RelayRegistration, DeployError> {
        let mut state = self.inner.state.lock().await;

        let port = match &state.listener {
            Some(running) => running.port,
            None => {
                let config = &self.inner.config;
                let (listener, port) = listener::bind_in_range(config).await?;
                let cancel = CancellationToken::new();
                let task = tokio::spawn(listener::accept_loop(
                    listener,
                    config.protocol,
                    config.connect_timeout,
                    cancel.clone(),
                ));
                tracing::info!("{} relay listening on 127.0.0.1:{}", config.protocol, port);
                state.listener = Some(RunningListener { port, cancel, task });
                port
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        state.registrations.insert(id);
        tracing::debug!(
            "Registered {} with relay ({} client(s))",
            client_id,
            state.registrations.len()
        );
        Ok(RelayRegistration::new(id, port))
    }

    /// Release `registration`; the listener stops after the last one
    ///
    /// Returns once the socket is closed.
    pub async fn unregister_client(&self, registration: RelayRegistration) {
        let mut state = self.inner.state.lock().await;

        if !state.registrations.remove(&registration.id()) {
            tracing::warn!("Relay registration {} is not active", registration.id());
            return;
        }
        tracing::debug!(
            "Unregistered relay client {} ({} left)",
            registration.id(),
            state.registrations.len()
        );

        if state.registrations.is_empty() {
            if let Some(running) = state.listener.take() {
                running.cancel.cancel();
                if let Err(e) = running.task.await {
                    tracing::warn!("Relay listener task failed: {}", e);
                }
                tracing::info!("Relay on port {} stopped", running.port);
            }
        }
    }

    /// Port currently listened on
    pub async fn port(&self) -> Option<u16> {
        self.inner
            .state
            .lock()
            .await
            .listener
            .as_ref()
            .map(|running| running.port)
    }

    /// Number of active registrations
    pub async fn client_count(&self) -> usize {
        self.inner.state.lock().await.registrations.len()
    }

    /// Whether the listener is running
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.listener.is_some()
    }
}

#[async_trait]
impl Relay for RelayServer {
    fn remote_port(&self) -> u16 {
        self.inner.config.remote_port
    }

    async fn register_client(&self, client_id: &str) -> Result<RelayRegistration, DeployError> {
        RelayServer::register_client(self, client_id).await
    }

    async fn unregister_client(&self, registration: RelayRegistration) {
        RelayServer::unregister_client(self, registration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_core::config::RelayProtocol;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Base port that is free right now, with room above it
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn relay(protocol: RelayProtocol, base_port: u16) -> RelayServer {
        RelayServer::new(RelayConfig {
            protocol,
            base_port,
            port_range: 16,
            remote_port: 8080,
            connect_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn test_listener_lifetime_follows_registrations() {
        let base = free_port().await;
        let relay = relay(RelayProtocol::Http, base);
        assert!(!relay.is_running().await);

        let first = relay.register_client("a").await.unwrap();
        let second = relay.register_client("b").await.unwrap();
        let port = first.port();
        assert_eq!(second.port(), port);
        assert_eq!(relay.client_count().await, 2);
        assert_eq!(relay.port().await, Some(port));

        relay.unregister_client(first).await;
        assert!(relay.is_running().await);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        relay.unregister_client(second).await;
        assert_eq!(relay.client_count().await, 0);
        assert!(!relay.is_running().await);
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_count_never_goes_negative() {
        let base = free_port().await;
        let relay = relay(RelayProtocol::Http, base);

        let registration = relay.register_client("a").await.unwrap();
        let forged = RelayRegistration::new(registration.id() + 100, registration.port());
        relay.unregister_client(forged).await;
        assert_eq!(relay.client_count().await, 1);

        relay.unregister_client(registration).await;
        assert_eq!(relay.client_count().await, 0);
        let again = RelayRegistration::new(1, 0);
        relay.unregister_client(again).await;
        assert_eq!(relay.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_skips_taken_ports() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = blocker.local_addr().unwrap().port();
        let relay = relay(RelayProtocol::Socks5, base);

        let registration = relay.register_client("a").await.unwrap();
        assert!(registration.port() > base);
        relay.unregister_client(registration).await;
    }

    #[tokio::test]
    async fn test_bind_failure_reports_range() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = blocker.local_addr().unwrap().port();
        let relay = RelayServer::new(RelayConfig {
            base_port: base,
            port_range: 0,
            ..RelayConfig::default()
        });

        let err = relay.register_client("a").await.unwrap_err();
        assert!(matches!(err, DeployError::RelayBind { first, last, .. } if first == base && last == base));
        assert_eq!(relay.client_count().await, 0);
        assert!(!relay.is_running().await);
    }

    #[tokio::test]
    async fn test_restarts_after_stop() {
        let base = free_port().await;
        let relay = relay(RelayProtocol::Http, base);

        let registration = relay.register_client("a").await.unwrap();
        relay.unregister_client(registration).await;
        let registration = relay.register_client("a").await.unwrap();
        assert!(relay.is_running().await);

        let mut stream = TcpStream::connect(("127.0.0.1", registration.port())).await.unwrap();
        stream.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 501"));
        relay.unregister_client(registration).await;
    }
}
