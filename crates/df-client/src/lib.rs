//! df-client: Device discovery and remote execution for devfleet
//!
//! - [`discovery`] turns target descriptors into resolved hosts
//! - [`ssh`] provides the russh-backed remote session
//! - [`ExecutionClient`] runs commands and transfers files on one host

pub mod client;
pub mod discovery;
pub mod ssh;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{CommandOutput, ExecutionClient};
pub use discovery::{MdnsProbe, MulticastProbe, NameLookup, Resolver, SystemLookup};
pub use ssh::{SshConnector, SshSession};
