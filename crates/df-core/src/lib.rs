//! df-core: Core abstractions and configuration for devfleet
//!
//! This crate provides shared types, traits, and configuration structures
//! used by the client, orchestrator, and CLI components.

pub mod config;
pub mod error;
pub mod manifest;
pub mod package;
pub mod shell;
pub mod traits;
pub mod types;

pub use error::{ConfigError, DeployError, ShellError};
pub use manifest::DependencyManifest;
pub use package::{PackageConfig, StartParameter};
pub use traits::{
    ChannelEvent, CommandChannel, Connector, ExecRequest, Relay, RelayRegistration, RemoteSession,
    TransferStream,
};
pub use types::{DiscoveryMethod, Interface, ResolvedHost, TargetDescriptor};
