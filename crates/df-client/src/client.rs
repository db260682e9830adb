//! Execution client
//!
//! Owns one authenticated session to one resolved host and offers command
//! execution, file transfer, and relay access on top of it. Every error that
//! leaves this module carries the host identity.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufRead, AsyncRead, Lines};

use df_core::config::{OutputLevel, SshConfig};
use df_core::error::{DeployError, ShellError};
use df_core::shell;
use df_core::traits::{
    ChannelEvent, CommandChannel, Connector, ExecRequest, Relay, RelayRegistration, RemoteSession,
};
use df_core::types::ResolvedHost;
use df_protocol::{receive_file, send_file, FileHeader, FileMode, TransferError, MAX_DOWNLOAD_SIZE};

use crate::ssh::SshConnector;

/// Result of a finished remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, or -1 when the server reported none
    pub exit_code: i32,
    /// Everything written to stdout
    pub stdout: String,
    /// Everything written to stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Active relay registration plus the reverse forward serving it
struct ProxyBinding {
    relay: Arc<dyn Relay>,
    registration: RelayRegistration,
    remote_port: u16,
}

/// Remote command execution and file transfer for one host
pub struct ExecutionClient {
    host: ResolvedHost,
    identity: String,
    session: Box<dyn RemoteSession>,
    config: SshConfig,
    proxy: Option<ProxyBinding>,
    closed: bool,
}

impl ExecutionClient {
    /// Connect to `host` over SSH
    pub async fn connect(host: ResolvedHost, config: &SshConfig) -> Result<Self, DeployError> {
        Self::connect_with(&SshConnector::new(), host, config).await
    }

    /// Connect to `host` through an arbitrary connector
    ///
    /// The first attempt is bounded by `connect_timeout`; a failed or timed
    /// out first attempt is retried once without a bound, since devices that
    /// were offline for a while often miss the first handshake. Rejected
    /// credentials are never retried.
    pub async fn connect_with(
        connector: &dyn Connector,
        host: ResolvedHost,
        config: &SshConfig,
    ) -> Result<Self, DeployError> {
        let first = tokio::time::timeout(config.connect_timeout, connector.connect(&host, config))
            .await
            .unwrap_or(Err(ShellError::Timeout(config.connect_timeout)));

        let session = match first {
            Ok(session) => Ok(session),
            Err(err @ ShellError::AuthRejected(_)) => Err(err),
            Err(e) => {
                tracing::debug!("First connection attempt to {} failed: {}", host, e);
                connector.connect(&host, config).await
            }
        }
        .map_err(|source| DeployError::Connection {
            host: host.identity(),
            source,
        })?;

        Ok(Self::from_session(host, session, config.clone()))
    }

    /// Wrap an already established session
    pub fn from_session(
        host: ResolvedHost,
        session: Box<dyn RemoteSession>,
        config: SshConfig,
    ) -> Self {
        let identity = host.identity();
        Self {
            host,
            identity,
            session,
            config,
            proxy: None,
            closed: false,
        }
    }

    /// The host this client talks to
    pub fn host(&self) -> &ResolvedHost {
        &self.host
    }

    /// `name (address)`
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Run `command` to completion
    ///
    /// With `check_exit_code`, a non-zero status becomes
    /// [`DeployError::Command`] carrying the captured output.
    pub async fn exec(
        &mut self,
        command: &str,
        check_exit_code: bool,
    ) -> Result<CommandOutput, DeployError> {
        let mut channel = self.open(command).await?;

        let mut stdout = OutputLines::new(OutputLevel::Debug);
        let mut stderr = OutputLines::new(self.config.stderr_level);
        let mut exit_status = None;

        loop {
            let event = channel
                .next_event()
                .await
                .map_err(|e| self.shell_error(e))?;
            match event {
                Some(ChannelEvent::Stdout(data)) => stdout.push(&self.identity, &data),
                Some(ChannelEvent::Stderr(data)) => stderr.push(&self.identity, &data),
                Some(ChannelEvent::ExitStatus(code)) => exit_status = Some(code as i32),
                None => break,
            }
        }

        let output = CommandOutput {
            exit_code: exit_status.unwrap_or(-1),
            stdout: stdout.finish(&self.identity),
            stderr: stderr.finish(&self.identity),
        };

        if check_exit_code && !output.success() {
            return Err(DeployError::Command {
                host: self.identity.clone(),
                command: command.to_string(),
                code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    /// Run `command` interactively
    ///
    /// Lines read from `input` are forwarded to the remote stdin. Two
    /// consecutive empty lines detach: the remote process is left running
    /// and `None` is returned. Otherwise the exit status is returned once
    /// the remote side closes the channel.
    pub async fn run<R>(
        &mut self,
        command: &str,
        input: &mut Lines<R>,
    ) -> Result<Option<i32>, DeployError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut channel = self.open(command).await?;
        tracing::info!("{}: to stop, press <Enter> twice", self.identity);

        let mut stdout = OutputLines::new(OutputLevel::Info);
        let mut stderr = OutputLines::new(OutputLevel::Warn);
        let mut exit_status = None;
        let mut input_open = true;
        let mut empty_lines = 0;

        loop {
            let step = tokio::select! {
                event = channel.next_event() => RunStep::Remote(event),
                line = input.next_line(), if input_open => RunStep::Input(line),
            };

            match step {
                RunStep::Remote(event) => match event.map_err(|e| self.shell_error(e))? {
                    Some(ChannelEvent::Stdout(data)) => stdout.push(&self.identity, &data),
                    Some(ChannelEvent::Stderr(data)) => stderr.push(&self.identity, &data),
                    Some(ChannelEvent::ExitStatus(code)) => exit_status = Some(code as i32),
                    None => {
                        stdout.finish(&self.identity);
                        stderr.finish(&self.identity);
                        return Ok(Some(exit_status.unwrap_or(-1)));
                    }
                },
                RunStep::Input(Ok(Some(line))) => {
                    if line.is_empty() {
                        empty_lines += 1;
                        if empty_lines >= 2 {
                            tracing::info!("{}: detached from `{}`", self.identity, command);
                            return Ok(None);
                        }
                    } else {
                        empty_lines = 0;
                    }
                    let mut data = line.into_bytes();
                    data.push(b'\n');
                    channel
                        .send(&data)
                        .await
                        .map_err(|e| self.shell_error(e))?;
                }
                RunStep::Input(Ok(None)) => {
                    input_open = false;
                    if let Err(e) = channel.eof().await {
                        tracing::debug!("{}: {}", self.identity, e);
                    }
                }
                RunStep::Input(Err(e)) => {
                    tracing::warn!("Reading operator input failed: {}", e);
                    input_open = false;
                }
            }
        }
    }

    /// Register with `relay` and forward the device's proxy port to it
    ///
    /// An existing registration is released first.
    pub async fn set_proxy(&mut self, relay: Arc<dyn Relay>) -> Result<(), DeployError> {
        self.clear_proxy().await;

        let registration = relay.register_client(&self.identity).await?;
        let remote_port = relay.remote_port();

        if let Err(e) = self
            .session
            .reverse_forward(remote_port, registration.port())
            .await
        {
            relay.unregister_client(registration).await;
            return Err(self.shell_error(e));
        }

        tracing::debug!(
            "{}: remote port {} relayed to local port {}",
            self.identity,
            remote_port,
            registration.port()
        );
        self.proxy = Some(ProxyBinding {
            relay,
            registration,
            remote_port,
        });
        Ok(())
    }

    /// Tear down the reverse forward and release the relay registration
    pub async fn clear_proxy(&mut self) {
        let Some(binding) = self.proxy.take() else {
            return;
        };

        if let Err(e) = self.session.cancel_reverse_forward(binding.remote_port).await {
            tracing::warn!(
                "{}: failed to cancel forward of port {}: {}",
                self.identity,
                binding.remote_port,
                e
            );
        }
        binding.relay.unregister_client(binding.registration).await;
    }

    /// Create `remote_dir` and its parents
    pub async fn mkdir(&mut self, remote_dir: &str) -> Result<(), DeployError> {
        let command = format!("sudo mkdir -p {}", shell::quote(remote_dir));
        self.exec(&command, true).await?;
        Ok(())
    }

    /// Write `data` to `remote_path` with mode 0644
    pub async fn upload_bytes(&mut self, data: &[u8], remote_path: &str) -> Result<(), DeployError> {
        let now = unix_now();
        let header = FileHeader {
            mode: FileMode::DEFAULT,
            size: data.len() as u64,
            name: remote_path.to_string(),
            mtime: now,
            atime: now,
        };
        let mut payload = data;
        self.send(remote_path, &header, &mut payload).await
    }

    /// Copy one local file to `remote_path`, keeping mode and times
    pub async fn upload_file(&mut self, local: &Path, remote_path: &str) -> Result<(), DeployError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| DeployError::local_io(local, e))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| DeployError::local_io(local, e))?;

        let mtime = metadata.modified().ok().map(unix_secs).unwrap_or_else(unix_now);
        let atime = metadata.accessed().ok().map(unix_secs).unwrap_or(mtime);
        let header = FileHeader {
            mode: local_mode(&metadata),
            size: metadata.len(),
            name: remote_path.to_string(),
            mtime,
            atime,
        };

        tracing::debug!("{}: copying {} to {}", self.identity, local.display(), remote_path);
        self.send(remote_path, &header, &mut file).await
    }

    /// Copy a local directory tree below `remote_dir`
    pub async fn upload_dir(&mut self, local_dir: &Path, remote_dir: &str) -> Result<(), DeployError> {
        let mut pending: Vec<(PathBuf, String)> =
            vec![(local_dir.to_path_buf(), remote_dir.to_string())];

        while let Some((dir, remote)) = pending.pop() {
            self.mkdir(&remote).await?;

            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| DeployError::local_io(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| DeployError::local_io(&dir, e))?
            {
                let path = entry.path();
                let target = shell::join(&remote, &entry.file_name().to_string_lossy());
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| DeployError::local_io(&path, e))?;

                if metadata.is_dir() {
                    pending.push((path, target));
                } else if metadata.is_file() {
                    self.upload_file(&path, &target).await?;
                } else {
                    tracing::debug!("Skipping special file {}", path.display());
                }
            }
        }

        Ok(())
    }

    /// Read `remote_path` into memory
    ///
    /// A file that does not exist yields an empty buffer.
    pub async fn download(&mut self, remote_path: &str) -> Result<Vec<u8>, DeployError> {
        let command = format!("scp -f {}", shell::quote(remote_path));
        let channel = self.open(&command).await?;
        let mut stream = channel.into_stream();
        receive_file(&mut stream, MAX_DOWNLOAD_SIZE)
            .await
            .map_err(|source| self.transfer_error(remote_path, source))
    }

    /// Release the relay registration and disconnect
    pub async fn close(&mut self) -> Result<(), DeployError> {
        if self.closed {
            return Ok(());
        }
        self.clear_proxy().await;
        self.closed = true;
        tracing::info!("Closing session to {}", self.identity);
        self.session.close().await.map_err(|e| self.shell_error(e))
    }

    async fn send<R>(
        &mut self,
        remote_path: &str,
        header: &FileHeader,
        payload: &mut R,
    ) -> Result<(), DeployError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let command = format!("sudo scp -p -t {}", shell::quote(remote_path));
        let channel = self.open(&command).await?;
        let mut stream = channel.into_stream();
        send_file(&mut stream, header, payload)
            .await
            .map_err(|source| self.transfer_error(remote_path, source))
    }

    /// Open a command channel with the fixed terminal and locale environment
    async fn open(&mut self, command: &str) -> Result<Box<dyn CommandChannel>, DeployError> {
        let request = ExecRequest::new(command)
            .with_env("TERM", self.config.terminal_type.as_str())
            .with_env("LC_ALL", self.config.locale.as_str());

        tracing::debug!("{}: {}", self.identity, command);
        let timeout = self.config.channel_timeout;
        let opened = tokio::time::timeout(timeout, self.session.open_command(request)).await;
        match opened {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(self.shell_error(e)),
            Err(_) => Err(self.shell_error(ShellError::Timeout(timeout))),
        }
    }

    fn shell_error(&self, source: ShellError) -> DeployError {
        DeployError::Shell {
            host: self.identity.clone(),
            source,
        }
    }

    fn transfer_error(&self, path: &str, source: TransferError) -> DeployError {
        DeployError::Transfer {
            host: self.identity.clone(),
            path: path.to_string(),
            source,
        }
    }
}

impl std::fmt::Debug for ExecutionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionClient")
            .field("host", &self.identity)
            .field("proxy", &self.proxy.as_ref().map(|p| p.registration.port()))
            .field("closed", &self.closed)
            .finish()
    }
}

enum RunStep {
    Remote(Result<Option<ChannelEvent>, ShellError>),
    Input(std::io::Result<Option<String>>),
}

/// Captures one output stream and logs it line by line
struct OutputLines {
    level: OutputLevel,
    captured: Vec<u8>,
    logged: usize,
}

impl OutputLines {
    fn new(level: OutputLevel) -> Self {
        Self {
            level,
            captured: Vec::new(),
            logged: 0,
        }
    }

    fn push(&mut self, host: &str, data: &[u8]) {
        self.captured.extend_from_slice(data);
        while let Some(pos) = self.captured[self.logged..].iter().position(|b| *b == b'\n') {
            let end = self.logged + pos;
            log_line(self.level, host, &self.captured[self.logged..end]);
            self.logged = end + 1;
        }
    }

    /// Log the unterminated tail and return everything captured
    fn finish(self, host: &str) -> String {
        if self.logged < self.captured.len() {
            log_line(self.level, host, &self.captured[self.logged..]);
        }
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

fn log_line(level: OutputLevel, host: &str, line: &[u8]) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    match level {
        OutputLevel::Trace => tracing::trace!("{}: {}", host, line),
        OutputLevel::Debug => tracing::debug!("{}: {}", host, line),
        OutputLevel::Info => tracing::info!("{}: {}", host, line),
        OutputLevel::Warn => tracing::warn!("{}: {}", host, line),
        OutputLevel::Error => tracing::error!("{}: {}", host, line),
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn unix_now() -> u64 {
    unix_secs(SystemTime::now())
}

#[cfg(unix)]
fn local_mode(metadata: &std::fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    FileMode::new(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn local_mode(_metadata: &std::fs::Metadata) -> FileMode {
    FileMode::DEFAULT
}
