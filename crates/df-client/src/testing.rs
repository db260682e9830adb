//! In-memory remote for tests
//!
//! [`MockRemote`] behaves like a device reached over SSH: it keeps a small
//! file system, answers `scp -t` / `scp -f` with the real protocol over an
//! in-process duplex stream, runs scripted commands, and records everything
//! it was asked to do. Clones share state, so a test can keep one handle
//! while an [`ExecutionClient`] drives another.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use df_core::config::SshConfig;
use df_core::error::ShellError;
use df_core::shell;
use df_core::traits::{
    ChannelEvent, CommandChannel, Connector, ExecRequest, RemoteSession, TransferStream,
};
use df_core::types::{DiscoveryMethod, ResolvedHost, TargetDescriptor};
use df_protocol::{ControlMessage, ACK_FATAL, ACK_OK, ACK_WARNING};

use crate::client::ExecutionClient;

const STREAM_BUFFER: usize = 64 * 1024;
const FILE_TIME: u64 = 1_500_000_000;

/// A file stored on the mock remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone)]
enum Script {
    Exit {
        status: Option<u32>,
        stdout: String,
        stderr: String,
    },
    Follow {
        stdout: String,
    },
}

#[derive(Default)]
struct RemoteState {
    files: HashMap<String, MockFile>,
    dirs: BTreeSet<String>,
    scripts: HashMap<String, Script>,
    failures: Vec<(String, u32, String)>,
    rejected_uploads: Vec<String>,
    commands: Vec<String>,
    envs: Vec<Vec<(String, String)>>,
    stdin: HashMap<String, Vec<u8>>,
    forwards: HashMap<u16, u16>,
    refuse_forwarding: bool,
    refuse_connections: bool,
    close_count: usize,
}

/// Shared handle to one simulated device
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemote {
    /// Create an empty device where every unknown command succeeds silently
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `command` print the given output and exit with `status`
    pub fn script(&self, command: &str, status: u32, stdout: &str, stderr: &str) {
        self.state().scripts.insert(
            command.to_string(),
            Script::Exit {
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Make `command` end without reporting an exit status
    pub fn script_without_status(&self, command: &str) {
        self.state().scripts.insert(
            command.to_string(),
            Script::Exit {
                status: None,
                stdout: String::new(),
                stderr: String::new(),
            },
        );
    }

    /// Make `command` print `stdout` and then never finish
    pub fn script_follow(&self, command: &str, stdout: &str) {
        self.state().scripts.insert(
            command.to_string(),
            Script::Follow {
                stdout: stdout.to_string(),
            },
        );
    }

    /// Every command containing `fragment` exits with `status`
    pub fn fail_commands_containing(&self, fragment: &str, status: u32, stderr: &str) {
        self.state()
            .failures
            .push((fragment.to_string(), status, stderr.to_string()));
    }

    /// Uploads below `prefix` are refused by the sink
    pub fn reject_uploads_to(&self, prefix: &str) {
        self.state().rejected_uploads.push(prefix.to_string());
    }

    /// Reverse forward requests fail
    pub fn refuse_forwarding(&self) {
        self.state().refuse_forwarding = true;
    }

    /// [`MockConnector`] fails to connect to this device
    pub fn refuse_connections(&self) {
        self.state().refuse_connections = true;
    }

    /// Place a file on the device
    pub fn write_file(&self, path: &str, data: &[u8]) {
        self.state().files.insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                mode: 0o644,
            },
        );
    }

    /// A stored file
    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.state().files.get(path).cloned()
    }

    /// Whether `mkdir -p` created `path`
    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    /// Every command line executed so far, transfers included
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Environment of the most recent command
    pub fn last_env(&self) -> Vec<(String, String)> {
        self.state().envs.last().cloned().unwrap_or_default()
    }

    /// Bytes written to the stdin of `command`
    pub fn stdin_for(&self, command: &str) -> Vec<u8> {
        self.state().stdin.get(command).cloned().unwrap_or_default()
    }

    /// Active reverse forwards as (remote port, local port)
    pub fn forwards(&self) -> Vec<(u16, u16)> {
        let mut forwards: Vec<_> = self.state().forwards.iter().map(|(r, l)| (*r, *l)).collect();
        forwards.sort_unstable();
        forwards
    }

    /// How many times the session was closed
    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    /// A session to this device
    pub fn session(&self) -> MockSession {
        MockSession {
            remote: self.clone(),
        }
    }

    /// An execution client connected to this device
    pub fn client(&self, name: &str, address: &str) -> ExecutionClient {
        let address = address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let host = TargetDescriptor::new(DiscoveryMethod::Hostname, name, "pi", "raspberry")
            .resolved(address);
        ExecutionClient::from_session(host, Box::new(self.session()), SshConfig::default())
    }

    fn execute(&self, request: ExecRequest) -> MockChannel {
        let command = request.command.clone();
        {
            let mut state = self.state();
            state.commands.push(command.clone());
            state.envs.push(request.env);
        }

        if let Some(path) = command.strip_prefix("sudo scp -p -t ") {
            return self.transfer(unquote(path), Transfer::Sink);
        }
        if let Some(path) = command.strip_prefix("scp -f ") {
            return self.transfer(unquote(path), Transfer::Source);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = MockChannel {
            command: command.clone(),
            events: rx,
            keep_open: None,
            stream: None,
            remote: self.clone(),
        };

        let failure = self
            .state()
            .failures
            .iter()
            .find(|(fragment, _, _)| command.contains(fragment.as_str()))
            .cloned();
        if let Some((_, status, stderr)) = failure {
            let _ = tx.send(ChannelEvent::Stderr(Bytes::from(stderr)));
            let _ = tx.send(ChannelEvent::ExitStatus(status));
            return channel;
        }

        if let Some(dir) = command.strip_prefix("sudo mkdir -p ") {
            let dir = unquote(dir);
            let mut state = self.state();
            let mut current = dir.trim_end_matches('/').to_string();
            while !current.is_empty() && current != "/" {
                state.dirs.insert(current.clone());
                current = shell::parent(&current).unwrap_or("").to_string();
            }
            let _ = tx.send(ChannelEvent::ExitStatus(0));
            return channel;
        }

        let removed = command
            .strip_prefix("sudo rm -rf ")
            .or_else(|| command.strip_prefix("sudo rm -f "));
        if let Some(target) = removed {
            let target = unquote(target);
            let below = format!("{}/", target.trim_end_matches('/'));
            let mut state = self.state();
            state
                .files
                .retain(|path, _| path != &target && !path.starts_with(&below));
            state
                .dirs
                .retain(|path| path != &target && !path.starts_with(&below));
            let _ = tx.send(ChannelEvent::ExitStatus(0));
            return channel;
        }

        let script = self.state().scripts.get(&command).cloned();
        match script {
            Some(Script::Exit {
                status,
                stdout,
                stderr,
            }) => {
                if !stdout.is_empty() {
                    let _ = tx.send(ChannelEvent::Stdout(Bytes::from(stdout)));
                }
                if !stderr.is_empty() {
                    let _ = tx.send(ChannelEvent::Stderr(Bytes::from(stderr)));
                }
                if let Some(status) = status {
                    let _ = tx.send(ChannelEvent::ExitStatus(status));
                }
                channel
            }
            Some(Script::Follow { stdout }) => {
                let _ = tx.send(ChannelEvent::Stdout(Bytes::from(stdout)));
                MockChannel {
                    keep_open: Some(tx),
                    ..channel
                }
            }
            None => {
                let _ = tx.send(ChannelEvent::ExitStatus(0));
                channel
            }
        }
    }

    fn transfer(&self, path: String, kind: Transfer) -> MockChannel {
        let (local, remote_end) = tokio::io::duplex(STREAM_BUFFER);
        let remote = self.clone();
        tokio::spawn(async move {
            let result = match kind {
                Transfer::Sink => remote.run_sink(remote_end, path).await,
                Transfer::Source => remote.run_source(remote_end, path).await,
            };
            if let Err(e) = result {
                tracing::debug!("Mock transfer ended: {}", e);
            }
        });

        let (_, rx) = mpsc::unbounded_channel();
        MockChannel {
            command: String::new(),
            events: rx,
            keep_open: None,
            stream: Some(local),
            remote: self.clone(),
        }
    }

    /// Remote side of `scp -t`
    async fn run_sink(&self, mut stream: DuplexStream, target: String) -> std::io::Result<()> {
        let rejected = self
            .state()
            .rejected_uploads
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()));
        if rejected {
            let message = format!("scp: {}: Permission denied\n", target);
            stream.write_all(&[ACK_WARNING]).await?;
            stream.write_all(message.as_bytes()).await?;
            return stream.shutdown().await;
        }

        stream.write_all(&[ACK_OK]).await?;
        loop {
            let Some(line) = read_line(&mut stream).await? else {
                return Ok(());
            };
            match ControlMessage::parse_line(&line) {
                Ok(ControlMessage::Time { .. }) => stream.write_all(&[ACK_OK]).await?,
                Ok(ControlMessage::Copy { mode, size, name }) => {
                    stream.write_all(&[ACK_OK]).await?;
                    let mut data = vec![0u8; size as usize];
                    stream.read_exact(&mut data).await?;
                    let mut terminator = [0u8; 1];
                    stream.read_exact(&mut terminator).await?;

                    let path = {
                        let state = self.state();
                        if state.dirs.contains(&target) {
                            shell::join(&target, &name)
                        } else {
                            target.clone()
                        }
                    };
                    self.state().files.insert(
                        path,
                        MockFile {
                            data,
                            mode: mode.bits(),
                        },
                    );
                    stream.write_all(&[ACK_OK]).await?;
                }
                _ => {
                    stream.write_all(&[ACK_FATAL]).await?;
                    stream.write_all(b"scp: protocol error\n").await?;
                    return stream.shutdown().await;
                }
            }
        }
    }

    /// Remote side of `scp -f`
    async fn run_source(&self, mut stream: DuplexStream, path: String) -> std::io::Result<()> {
        let mut ready = [0u8; 1];
        stream.read_exact(&mut ready).await?;

        let Some(file) = self.file(&path) else {
            let message = format!("scp: {}: No such file or directory\n", path);
            stream.write_all(&[ACK_WARNING]).await?;
            stream.write_all(message.as_bytes()).await?;
            return stream.shutdown().await;
        };

        let time = ControlMessage::Time {
            mtime: FILE_TIME,
            atime: FILE_TIME,
        };
        stream.write_all(time.to_line().as_bytes()).await?;
        stream.read_exact(&mut ready).await?;

        let copy = ControlMessage::copy(
            df_protocol::FileMode::new(file.mode),
            file.data.len() as u64,
            &path,
        );
        stream.write_all(copy.to_line().as_bytes()).await?;
        stream.read_exact(&mut ready).await?;

        stream.write_all(&file.data).await?;
        stream.write_all(&[ACK_OK]).await?;
        stream.read_exact(&mut ready).await?;
        stream.shutdown().await
    }
}

enum Transfer {
    Sink,
    Source,
}

async fn read_line(stream: &mut DuplexStream) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        if byte[0] == b'\n' {
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        line.push(byte[0]);
    }
}

/// Reverse of [`shell::quote`]
fn unquote(quoted: &str) -> String {
    let inner = quoted
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(quoted);
    inner.replace(r#"'"'"'"#, "'")
}

/// Session handed out by [`MockRemote::session`]
pub struct MockSession {
    remote: MockRemote,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn open_command(
        &mut self,
        request: ExecRequest,
    ) -> Result<Box<dyn CommandChannel>, ShellError> {
        Ok(Box::new(self.remote.execute(request)))
    }

    async fn reverse_forward(
        &mut self,
        remote_port: u16,
        local_port: u16,
    ) -> Result<(), ShellError> {
        let mut state = self.remote.state();
        if state.refuse_forwarding {
            return Err(ShellError::Channel(format!(
                "remote port forwarding failed for listen port {}",
                remote_port
            )));
        }
        state.forwards.insert(remote_port, local_port);
        Ok(())
    }

    async fn cancel_reverse_forward(&mut self, remote_port: u16) -> Result<(), ShellError> {
        self.remote.state().forwards.remove(&remote_port);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        self.remote.state().close_count += 1;
        Ok(())
    }
}

struct MockChannel {
    command: String,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    keep_open: Option<mpsc::UnboundedSender<ChannelEvent>>,
    stream: Option<DuplexStream>,
    remote: MockRemote,
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ShellError> {
        Ok(self.events.recv().await)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ShellError> {
        self.remote
            .state()
            .stdin
            .entry(self.command.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn eof(&mut self) -> Result<(), ShellError> {
        self.keep_open = None;
        Ok(())
    }

    fn into_stream(self: Box<Self>) -> Box<dyn TransferStream> {
        match self.stream {
            Some(stream) => Box::new(stream),
            None => {
                let (stream, _) = tokio::io::duplex(1);
                Box::new(stream)
            }
        }
    }
}

/// Connects to mock remotes by address
#[derive(Clone, Default)]
pub struct MockConnector {
    remotes: HashMap<IpAddr, MockRemote>,
    attempts: Arc<Mutex<HashSet<IpAddr>>>,
}

impl MockConnector {
    /// Create a connector that knows no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `remote` at `address`
    pub fn with_remote(mut self, address: IpAddr, remote: MockRemote) -> Self {
        self.remotes.insert(address, remote);
        self
    }

    /// Whether a connection to `address` was attempted
    pub fn attempted(&self, address: IpAddr) -> bool {
        self.attempts
            .lock()
            .map(|attempts| attempts.contains(&address))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &ResolvedHost,
        _config: &SshConfig,
    ) -> Result<Box<dyn RemoteSession>, ShellError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.insert(host.address);
        }
        match self.remotes.get(&host.address) {
            Some(remote) if !remote.state().refuse_connections => Ok(Box::new(remote.session())),
            _ => Err(ShellError::Connect(format!(
                "{}:22: Connection refused",
                host.address
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquote_reverses_quote() {
        for path in ["/usr/local/app", "/tmp/it's here"] {
            assert_eq!(unquote(&shell::quote(path)), path);
        }
    }

    #[tokio::test]
    async fn test_mkdir_creates_parents() {
        let remote = MockRemote::new();
        let mut client = remote.client("pi", "10.0.0.2");
        client.mkdir("/var/lib/devfleet").await.unwrap();
        assert!(remote.has_dir("/var/lib"));
        assert!(remote.has_dir("/var/lib/devfleet"));
        assert!(!remote.has_dir("/"));
    }

    #[tokio::test]
    async fn test_connector_refuses_unknown_hosts() {
        let connector = MockConnector::new();
        let host = TargetDescriptor::new(DiscoveryMethod::Hostname, "ghost", "pi", "")
            .resolved("10.0.0.9".parse().unwrap());
        let result = connector.connect(&host, &SshConfig::default()).await;
        assert!(matches!(result, Err(ShellError::Connect(_))));
        assert!(connector.attempted(host.address));
    }
}
