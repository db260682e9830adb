//! Transfer error types

use thiserror::Error;

/// Errors that can occur while driving a transfer
#[derive(Error, Debug)]
pub enum TransferError {
    /// The remote counterpart answered with an error acknowledgement
    #[error("remote {}: {message}", severity(.fatal))]
    Remote { fatal: bool, message: String },

    /// The stream ended before the protocol completed
    #[error("unexpected end of transfer stream")]
    UnexpectedEof,

    /// A control line could not be parsed
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// Payload exceeds what we are willing to hold in memory
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    /// Local payload was shorter than the announced size
    #[error("payload ended after {sent} of {expected} bytes")]
    ShortPayload { sent: u64, expected: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn severity(fatal: &bool) -> &'static str {
    if *fatal {
        "fatal error"
    } else {
        "error"
    }
}
