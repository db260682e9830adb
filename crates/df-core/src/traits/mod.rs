//! Core trait definitions

mod relay;
mod remote;

pub use relay::{Relay, RelayRegistration};
pub use remote::{
    ChannelEvent, CommandChannel, Connector, ExecRequest, RemoteSession, TransferStream,
};
