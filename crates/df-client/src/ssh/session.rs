//! Password-authenticated SSH sessions
//!
//! One [`SshSession`] wraps one russh client handle. Command channels are
//! plain exec channels without a pseudo-terminal, so transfer streams stay
//! binary-safe. Reverse forwards are served by the client handler: every
//! forwarded-tcpip channel for a registered remote port is spliced onto a
//! local TCP connection to the relay.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use df_core::config::SshConfig;
use df_core::error::ShellError;
use df_core::traits::{
    ChannelEvent, CommandChannel, Connector, ExecRequest, RemoteSession, TransferStream,
};
use df_core::types::ResolvedHost;

/// Extended data stream number of stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Remote port -> local port for active reverse forwards
type ForwardTable = Arc<Mutex<HashMap<u32, u16>>>;

/// Opens russh sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    /// Create a new connector
    pub fn new() -> Self {
        Self
    }

    /// Attempt a single connection and password authentication
    async fn try_connect(
        &self,
        host: &ResolvedHost,
        config: &SshConfig,
    ) -> Result<SshSession, ShellError> {
        let ssh_config = Arc::new(Config::default());
        let forwards = ForwardTable::default();
        let handler = ClientHandler {
            forwards: Arc::clone(&forwards),
        };

        let address = SocketAddr::new(host.address, config.port);
        tracing::debug!("Connecting to {}", address);
        let mut handle = client::connect(ssh_config, address, handler)
            .await
            .map_err(|e| ShellError::Connect(format!("{}: {}", address, e)))?;

        tracing::debug!("Authenticating as user '{}'", host.username);
        let authenticated = handle
            .authenticate_password(&host.username, &host.secret)
            .await
            .map_err(|e| ShellError::Connect(format!("authentication error: {}", e)))?;

        if !authenticated {
            return Err(ShellError::AuthRejected(host.username.clone()));
        }

        Ok(SshSession { handle, forwards })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &ResolvedHost,
        config: &SshConfig,
    ) -> Result<Box<dyn RemoteSession>, ShellError> {
        let session = self.try_connect(host, config).await?;
        tracing::info!("Opened session to {}", host);
        Ok(Box::new(session))
    }
}

/// An authenticated russh session
pub struct SshSession {
    handle: Handle<ClientHandler>,
    forwards: ForwardTable,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn open_command(
        &mut self,
        request: ExecRequest,
    ) -> Result<Box<dyn CommandChannel>, ShellError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ShellError::Channel(format!("failed to open channel: {}", e)))?;

        for (name, value) in &request.env {
            // Servers silently drop variables they do not accept
            channel
                .set_env(false, name.as_str(), value.as_str())
                .await
                .map_err(|e| ShellError::Channel(format!("failed to set {}: {}", name, e)))?;
        }

        channel
            .exec(true, request.command.as_str())
            .await
            .map_err(|e| ShellError::Channel(format!("failed to exec: {}", e)))?;

        Ok(Box::new(SshChannel { channel }))
    }

    async fn reverse_forward(
        &mut self,
        remote_port: u16,
        local_port: u16,
    ) -> Result<(), ShellError> {
        self.forwards
            .lock()
            .await
            .insert(u32::from(remote_port), local_port);

        if let Err(e) = self
            .handle
            .tcpip_forward("localhost", u32::from(remote_port))
            .await
        {
            self.forwards.lock().await.remove(&u32::from(remote_port));
            return Err(ShellError::Channel(format!(
                "reverse forward of port {} refused: {}",
                remote_port, e
            )));
        }

        tracing::debug!("Forwarding remote port {} to local port {}", remote_port, local_port);
        Ok(())
    }

    async fn cancel_reverse_forward(&mut self, remote_port: u16) -> Result<(), ShellError> {
        self.forwards.lock().await.remove(&u32::from(remote_port));
        self.handle
            .cancel_tcpip_forward("localhost", u32::from(remote_port))
            .await
            .map_err(|e| ShellError::Channel(format!("failed to cancel forward: {}", e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
            .map_err(|e| ShellError::Channel(e.to_string()))?;
        Ok(())
    }
}

/// One exec channel
struct SshChannel {
    channel: Channel<Msg>,
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ShellError> {
        loop {
            let Some(msg) = self.channel.wait().await else {
                return Ok(None);
            };
            match msg {
                ChannelMsg::Data { data } => {
                    return Ok(Some(ChannelEvent::Stdout(Bytes::copy_from_slice(&data))));
                }
                ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    return Ok(Some(ChannelEvent::Stderr(Bytes::copy_from_slice(&data))));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Ok(Some(ChannelEvent::ExitStatus(exit_status)));
                }
                ChannelMsg::Close => return Ok(None),
                other => {
                    tracing::trace!("Ignoring channel message {:?}", other);
                }
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ShellError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ShellError::Channel(format!("failed to send: {}", e)))
    }

    async fn eof(&mut self) -> Result<(), ShellError> {
        self.channel
            .eof()
            .await
            .map_err(|e| ShellError::Channel(format!("failed to send EOF: {}", e)))
    }

    fn into_stream(self: Box<Self>) -> Box<dyn TransferStream> {
        Box::new(self.channel.into_stream())
    }
}

/// SSH client handler
struct ClientHandler {
    forwards: ForwardTable,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Devices are reflashed often, so any host key is accepted
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    /// Splice a connection made to a reverse-forwarded port onto the relay
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let local_port = self.forwards.lock().await.get(&connected_port).copied();
        let Some(local_port) = local_port else {
            tracing::warn!(
                "Forwarded connection to {}:{} has no local target",
                connected_address,
                connected_port
            );
            return Ok(());
        };

        tracing::trace!(
            "Forwarded connection from {}:{} to local port {}",
            originator_address,
            originator_port,
            local_port
        );

        tokio::spawn(async move {
            let target = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
            let mut local = match TcpStream::connect(target).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Relay at {} unreachable: {}", target, e);
                    return;
                }
            };
            let mut remote = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut remote, &mut local).await {
                tracing::debug!("Forwarded connection ended: {}", e);
            }
        });

        Ok(())
    }
}
