//! SSH-backed remote session

mod session;

pub use session::{SshConnector, SshSession};
