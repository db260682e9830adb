//! Remote-shell traits
//!
//! These are the seams between the deployment logic and the SSH transport.
//! The production implementation lives in `df-client::ssh`; tests use an
//! in-memory remote.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::SshConfig;
use crate::error::ShellError;
use crate::types::ResolvedHost;

/// Byte stream carrying a file transfer
pub trait TransferStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TransferStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Command to execute on the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Shell command line
    pub command: String,
    /// Environment variables requested before exec
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    /// Create a request without environment
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }
}

/// Something that happened on a command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes written to the remote stdout
    Stdout(Bytes),
    /// Bytes written to the remote stderr
    Stderr(Bytes),
    /// The remote command exited
    ExitStatus(u32),
}

/// A single running remote command
#[async_trait]
pub trait CommandChannel: Send {
    /// Next event, or None once the channel is closed
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ShellError>;

    /// Write to the remote stdin
    async fn send(&mut self, data: &[u8]) -> Result<(), ShellError>;

    /// Close the remote stdin
    async fn eof(&mut self) -> Result<(), ShellError>;

    /// Turn the channel into a raw byte stream (stdin/stdout only)
    fn into_stream(self: Box<Self>) -> Box<dyn TransferStream>;
}

/// An authenticated session to one host
#[async_trait]
pub trait RemoteSession: Send {
    /// Open a channel and start `request` on it
    async fn open_command(
        &mut self,
        request: ExecRequest,
    ) -> Result<Box<dyn CommandChannel>, ShellError>;

    /// Ask the server to forward `remote_port` on its loopback to `local_port` here
    async fn reverse_forward(&mut self, remote_port: u16, local_port: u16)
        -> Result<(), ShellError>;

    /// Undo a previous [`RemoteSession::reverse_forward`]
    async fn cancel_reverse_forward(&mut self, remote_port: u16) -> Result<(), ShellError>;

    /// Disconnect
    async fn close(&mut self) -> Result<(), ShellError>;
}

/// Opens sessions to resolved hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// One connection and authentication attempt; retries are up to the caller
    async fn connect(
        &self,
        host: &ResolvedHost,
        config: &SshConfig,
    ) -> Result<Box<dyn RemoteSession>, ShellError>;
}
