//! Acknowledgements and control messages
//!
//! Every step of the protocol is answered with a single acknowledgement
//! byte:
//! - `0`: ok
//! - `1`: error, followed by a newline-terminated diagnostic
//! - `2`: fatal error, followed by a newline-terminated diagnostic
//!
//! Control lines start with a tag byte and end with `\n`:
//! - `T<mtime> 0 <atime> 0`
//! - `C<mode> <size> <name>`
//! - `D<mode> 0 <name>`
//! - `E`

use std::fmt;
use std::str::FromStr;

use crate::error::TransferError;

/// Acknowledgement byte for success
pub const ACK_OK: u8 = 0;
/// Acknowledgement byte for a recoverable error
pub const ACK_WARNING: u8 = 1;
/// Acknowledgement byte for a fatal error
pub const ACK_FATAL: u8 = 2;

/// Decoded acknowledgement from the remote counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Step accepted
    Ok,
    /// Step rejected with a diagnostic
    Warning(String),
    /// Transfer aborted with a diagnostic
    Fatal(String),
    /// Stream ended instead of an acknowledgement
    Closed,
}

impl Ack {
    /// Convert into a result, treating anything but `Ok` as a failure
    pub fn into_result(self) -> Result<(), TransferError> {
        match self {
            Ack::Ok => Ok(()),
            Ack::Warning(message) => Err(TransferError::Remote {
                fatal: false,
                message,
            }),
            Ack::Fatal(message) => Err(TransferError::Remote {
                fatal: true,
                message,
            }),
            Ack::Closed => Err(TransferError::UnexpectedEof),
        }
    }
}

/// Unix permission bits announced in `C` and `D` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    /// Mode used when no better information is available
    pub const DEFAULT: FileMode = FileMode(0o644);

    /// Create a mode, keeping only permission bits
    pub fn new(bits: u32) -> Self {
        Self(bits & 0o7777)
    }

    /// Raw permission bits
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl FromStr for FileMode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 {
            return Err(TransferError::Malformed(format!("bad mode {:?}", s)));
        }
        u32::from_str_radix(s, 8)
            .map(FileMode::new)
            .map_err(|_| TransferError::Malformed(format!("bad mode {:?}", s)))
    }
}

/// A control line exchanged between sender and receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Modification and access time of the next file, in seconds
    Time { mtime: u64, atime: u64 },
    /// A regular file of `size` bytes follows
    Copy {
        mode: FileMode,
        size: u64,
        name: String,
    },
    /// Enter a directory
    Directory { mode: FileMode, name: String },
    /// Leave the current directory
    End,
}

impl ControlMessage {
    /// Tag byte that starts this message on the wire
    pub fn tag(&self) -> u8 {
        match self {
            ControlMessage::Time { .. } => b'T',
            ControlMessage::Copy { .. } => b'C',
            ControlMessage::Directory { .. } => b'D',
            ControlMessage::End => b'E',
        }
    }

    /// Whether `byte` starts a control line
    pub fn is_tag(byte: u8) -> bool {
        matches!(byte, b'T' | b'C' | b'D' | b'E')
    }

    /// Build a `Copy` message, reducing `path` to its final component
    pub fn copy(mode: FileMode, size: u64, path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        ControlMessage::Copy { mode, size, name }
    }

    /// Parse one control line, without its trailing newline
    pub fn parse_line(line: &str) -> Result<Self, TransferError> {
        let mut chars = line.chars();
        let tag = chars
            .next()
            .ok_or_else(|| TransferError::Malformed("empty line".to_string()))?;
        let rest = chars.as_str();

        match tag {
            'T' => {
                let fields: Vec<&str> = rest.split(' ').collect();
                if fields.len() != 4 {
                    return Err(TransferError::Malformed(format!("bad time line {:?}", line)));
                }
                let mtime = parse_number(fields[0], line)?;
                let atime = parse_number(fields[2], line)?;
                Ok(ControlMessage::Time { mtime, atime })
            }
            'C' => {
                let mut fields = rest.splitn(3, ' ');
                let mode = fields.next().unwrap_or_default().parse()?;
                let size = parse_number(fields.next().unwrap_or_default(), line)?;
                let name = parse_name(fields.next(), line)?;
                Ok(ControlMessage::Copy { mode, size, name })
            }
            'D' => {
                let mut fields = rest.splitn(3, ' ');
                let mode = fields.next().unwrap_or_default().parse()?;
                parse_number(fields.next().unwrap_or_default(), line)?;
                let name = parse_name(fields.next(), line)?;
                Ok(ControlMessage::Directory { mode, name })
            }
            'E' if rest.is_empty() => Ok(ControlMessage::End),
            _ => Err(TransferError::Malformed(format!("unknown line {:?}", line))),
        }
    }

    /// Render the message as a wire line, including the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            ControlMessage::Time { mtime, atime } => format!("T{} 0 {} 0\n", mtime, atime),
            ControlMessage::Copy { mode, size, name } => format!("C{} {} {}\n", mode, size, name),
            ControlMessage::Directory { mode, name } => format!("D{} 0 {}\n", mode, name),
            ControlMessage::End => "E\n".to_string(),
        }
    }
}

fn parse_number(field: &str, line: &str) -> Result<u64, TransferError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransferError::Malformed(format!("bad number in {:?}", line)));
    }
    field
        .parse()
        .map_err(|_| TransferError::Malformed(format!("bad number in {:?}", line)))
}

fn parse_name(field: Option<&str>, line: &str) -> Result<String, TransferError> {
    match field {
        Some(name) if !name.is_empty() && !name.contains('/') => Ok(name.to_string()),
        _ => Err(TransferError::Malformed(format!("bad file name in {:?}", line))),
    }
}
