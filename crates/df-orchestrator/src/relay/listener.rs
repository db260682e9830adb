//! Relay accept loop

use std::io;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use df_core::config::{RelayConfig, RelayProtocol};
use df_core::error::DeployError;

use super::{http, socks5};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the first free port in `base_port..=base_port + port_range`
pub(super) async fn bind_in_range(config: &RelayConfig) -> Result<(TcpListener, u16), DeployError> {
    let first = config.base_port;
    let last = config.last_port().unwrap_or(u16::MAX);
    let mut last_error = None;

    for port in first..=last {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let port = listener.local_addr().map(|addr| addr.port()).unwrap_or(port);
                return Ok((listener, port));
            }
            Err(e) => {
                tracing::trace!("Relay port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }

    Err(DeployError::RelayBind {
        first,
        last,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "empty port range")),
    })
}

/// Accept connections until `cancel` fires
///
/// Handlers run as independent tasks and are not cancelled with the loop.
pub(super) async fn accept_loop(
    listener: TcpListener,
    protocol: RelayProtocol,
    connect_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Relay listener shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((socket, peer_addr)) => {
                        tracing::debug!("Relay connection from {}", peer_addr);
                        tokio::spawn(handle_connection(socket, protocol, connect_timeout));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept relay connection: {}", e);
                        if !backoff(&cancel).await {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Wait out [`ACCEPT_BACKOFF`]; false when cancelled meanwhile
async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn handle_connection(socket: TcpStream, protocol: RelayProtocol, connect_timeout: Duration) {
    let result = match protocol {
        RelayProtocol::Socks5 => socks5::serve(socket, connect_timeout).await,
        RelayProtocol::Http => http::serve(socket, connect_timeout).await,
    };

    if let Err(e) = result {
        tracing::debug!("Relay connection closed with error: {}", e);
    }
}

/// Connect to `host:port` within `timeout`
pub(super) async fn connect_upstream(
    host: &str,
    port: u16,
    timeout: Duration,
) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connecting to {}:{} timed out", host, port),
        )),
    }
}
