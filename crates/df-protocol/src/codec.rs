//! Tokio codec for newline-terminated control lines

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransferError;
use crate::message::ControlMessage;

/// Longest control line we accept, including the newline
pub const MAX_LINE_LENGTH: usize = 4096;

/// Codec for encoding/decoding control lines
#[derive(Debug, Default)]
pub struct ControlCodec {
    /// Bytes already scanned for a newline
    scanned: usize,
}

impl ControlCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = TransferError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        let Some(offset) = newline else {
            if src.len() >= MAX_LINE_LENGTH {
                return Err(TransferError::Malformed(format!(
                    "control line exceeds {} bytes",
                    MAX_LINE_LENGTH
                )));
            }
            // Need more data
            self.scanned = src.len();
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;

        let line = src.split_to(end + 1);
        let text = std::str::from_utf8(&line[..end])
            .map_err(|_| TransferError::Malformed("control line is not UTF-8".to_string()))?;

        ControlMessage::parse_line(text).map(Some)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = TransferError;

    fn encode(&mut self, message: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if let ControlMessage::Copy { name, .. } | ControlMessage::Directory { name, .. } = &message
        {
            if name.is_empty() || name.contains('/') || name.contains('\n') {
                return Err(TransferError::Malformed(format!("bad file name {:?}", name)));
            }
        }

        dst.extend_from_slice(message.to_line().as_bytes());
        Ok(())
    }
}
