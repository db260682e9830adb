//! Core error types for devfleet

use std::path::PathBuf;
use std::time::Duration;

use df_protocol::TransferError;
use thiserror::Error;

/// Transport-level errors raised by a remote-shell implementation.
///
/// These carry no host identity; the execution client wraps them into a
/// [`DeployError`] before they leave it.
#[derive(Error, Debug)]
pub enum ShellError {
    /// TCP or SSH handshake failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server refused our credentials
    #[error("authentication rejected for user {0}")]
    AuthRejected(String),

    /// Opening or driving a channel failed
    #[error("channel error: {0}")]
    Channel(String),

    /// An operation did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for deployment operations
#[derive(Error, Debug)]
pub enum DeployError {
    /// A target descriptor did not resolve to any address
    #[error("host not found: {name}")]
    Resolution { name: String },

    /// Authentication or transport failure while connecting
    #[error("{host}: connection failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: ShellError,
    },

    /// A checked command exited with a non-zero status
    #[error("{host}: `{command}` exited with status {code}")]
    Command {
        host: String,
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// A file transfer was rejected or cut short
    #[error("{host}: transfer of {path} failed: {source}")]
    Transfer {
        host: String,
        path: String,
        #[source]
        source: TransferError,
    },

    /// Remote-shell failure after the session was established
    #[error("{host}: {source}")]
    Shell {
        host: String,
        #[source]
        source: ShellError,
    },

    /// No port in the relay's range could be bound
    #[error("no free relay port in {first}..={last}: {source}")]
    RelayBind {
        first: u16,
        last: u16,
        #[source]
        source: std::io::Error,
    },

    /// Reading local artifacts failed
    #[error("{path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DeployError {
    /// Host identity attached to the error, if any
    pub fn host(&self) -> Option<&str> {
        match self {
            DeployError::Connection { host, .. }
            | DeployError::Command { host, .. }
            | DeployError::Transfer { host, .. }
            | DeployError::Shell { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Wrap a local I/O failure with the path it concerned
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::LocalIo {
            path: path.into().display().to_string(),
            source,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Reading or writing the config file failed
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
