//! df-protocol: File transfer protocol for devfleet
//!
//! This crate implements the sink/source protocol spoken by a remote `scp`
//! process over a single command channel. The remote side is started in
//! sink (`scp -t`) or source (`scp -f`) mode and the two ends exchange
//! acknowledgement bytes and newline-terminated control lines.

pub mod codec;
pub mod error;
pub mod message;
pub mod transfer;

pub use codec::{ControlCodec, MAX_LINE_LENGTH};
pub use error::TransferError;
pub use message::{Ack, ControlMessage, FileMode, ACK_FATAL, ACK_OK, ACK_WARNING};
pub use transfer::{receive_file, send_file, FileHeader, MAX_DOWNLOAD_SIZE};
