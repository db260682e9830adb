//! Upload and download drivers
//!
//! Both drivers work on any duplex byte stream connected to the stdin and
//! stdout of a remote `scp` process. They never spawn tasks or sleep; each
//! step awaits the bytes it needs.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{ControlCodec, MAX_LINE_LENGTH};
use crate::error::TransferError;
use crate::message::{Ack, ControlMessage, FileMode, ACK_FATAL, ACK_OK, ACK_WARNING};

/// Largest file accepted by [`receive_file`]
pub const MAX_DOWNLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// Size of the chunks used to stream payloads
const CHUNK_SIZE: usize = 16 * 1024;

/// Metadata announced before a file payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Permission bits
    pub mode: FileMode,
    /// Exact payload length in bytes
    pub size: u64,
    /// Target path or file name; only the final component is sent
    pub name: String,
    /// Modification time in seconds since the epoch
    pub mtime: u64,
    /// Access time in seconds since the epoch
    pub atime: u64,
}

/// What the remote side sent where we expected a reply
enum Reply {
    Ack(Ack),
    Control(ControlMessage),
}

/// Send one file to a remote sink (`scp -t`)
///
/// Exactly `header.size` bytes are taken from `payload`, followed by the
/// NUL terminator. The write side of `stream` is shut down on success.
pub async fn send_file<S, R>(
    stream: &mut S,
    header: &FileHeader,
    payload: &mut R,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut codec = ControlCodec::new();

    expect_ack(stream, "connect").await?;

    let time = ControlMessage::Time {
        mtime: header.mtime,
        atime: header.atime,
    };
    write_control(stream, &mut codec, time).await?;
    expect_ack(stream, "time").await?;

    let copy = ControlMessage::copy(header.mode, header.size, &header.name);
    write_control(stream, &mut codec, copy).await?;
    expect_ack(stream, "header").await?;

    let mut remaining = header.size;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = payload.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::ShortPayload {
                sent: header.size - remaining,
                expected: header.size,
            });
        }
        stream.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    stream.write_all(&[ACK_OK]).await?;
    stream.flush().await?;
    expect_ack(stream, "payload").await?;

    stream.shutdown().await?;
    Ok(())
}

/// Receive file contents from a remote source (`scp -f`)
///
/// The contents of every announced file are appended to the result. A
/// source that answers with a recoverable error before sending anything
/// (typically "No such file or directory") yields an empty result.
pub async fn receive_file<S>(stream: &mut S, max_size: u64) -> Result<Vec<u8>, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = ControlCodec::new();
    let mut data = Vec::new();

    send_ready(stream).await?;

    loop {
        match read_reply(stream, &mut codec).await? {
            Reply::Ack(Ack::Ok) | Reply::Ack(Ack::Closed) => break,
            Reply::Ack(Ack::Warning(message)) => {
                tracing::debug!("Remote source: {}", message);
                break;
            }
            Reply::Ack(Ack::Fatal(message)) => {
                tracing::error!("Remote source: {}", message);
                return Err(TransferError::Remote {
                    fatal: true,
                    message,
                });
            }
            Reply::Control(ControlMessage::Time { .. }) => {
                send_ready(stream).await?;
            }
            Reply::Control(ControlMessage::Copy { size, name, .. }) => {
                match (data.len() as u64).checked_add(size) {
                    Some(total) if total <= max_size => {}
                    total => {
                        return Err(TransferError::TooLarge {
                            size: total.unwrap_or(u64::MAX),
                            max: max_size,
                        });
                    }
                }
                tracing::trace!("Receiving {} ({} bytes)", name, size);

                send_ready(stream).await?;
                read_payload(stream, size, &mut data).await?;
                read_ack(stream).await?.into_result()?;
                send_ready(stream).await?;
            }
            Reply::Control(other) => {
                tracing::debug!("Stopping at unexpected control message {:?}", other);
                break;
            }
        }
    }

    // The source may already be gone
    let _ = stream.shutdown().await;
    Ok(data)
}

async fn write_control<S>(
    stream: &mut S,
    codec: &mut ControlCodec,
    message: ControlMessage,
) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    codec.encode(message, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn send_ready<S>(stream: &mut S) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[ACK_OK]).await?;
    stream.flush().await?;
    Ok(())
}

async fn expect_ack<S>(stream: &mut S, step: &str) -> Result<(), TransferError>
where
    S: AsyncRead + Unpin,
{
    let ack = read_ack(stream).await?;
    if let Ack::Warning(message) | Ack::Fatal(message) = &ack {
        tracing::error!("Remote sink rejected {}: {}", step, message);
    }
    ack.into_result()
}

/// Read one acknowledgement, including the diagnostic line of an error
async fn read_ack<S>(stream: &mut S) -> Result<Ack, TransferError>
where
    S: AsyncRead + Unpin,
{
    let Some(byte) = read_byte(stream).await? else {
        return Ok(Ack::Closed);
    };
    match byte {
        ACK_OK => Ok(Ack::Ok),
        ACK_WARNING => Ok(Ack::Warning(read_diagnostic(stream).await?)),
        ACK_FATAL => Ok(Ack::Fatal(read_diagnostic(stream).await?)),
        other => Err(TransferError::Malformed(format!(
            "unexpected acknowledgement byte {:#04x}",
            other
        ))),
    }
}

/// Read either an acknowledgement or a control line
///
/// Acknowledgement bytes are checked first, so a diagnostic is never
/// mistaken for file content.
async fn read_reply<S>(stream: &mut S, codec: &mut ControlCodec) -> Result<Reply, TransferError>
where
    S: AsyncRead + Unpin,
{
    let Some(byte) = read_byte(stream).await? else {
        return Ok(Reply::Ack(Ack::Closed));
    };
    match byte {
        ACK_OK => Ok(Reply::Ack(Ack::Ok)),
        ACK_WARNING => Ok(Reply::Ack(Ack::Warning(read_diagnostic(stream).await?))),
        ACK_FATAL => Ok(Reply::Ack(Ack::Fatal(read_diagnostic(stream).await?))),
        tag if ControlMessage::is_tag(tag) => {
            let mut line = BytesMut::with_capacity(64);
            line.extend_from_slice(&[tag]);
            loop {
                if let Some(message) = codec.decode(&mut line)? {
                    return Ok(Reply::Control(message));
                }
                match read_byte(stream).await? {
                    Some(b) => line.extend_from_slice(&[b]),
                    None => return Err(TransferError::UnexpectedEof),
                }
            }
        }
        other => Err(TransferError::Malformed(format!(
            "unexpected control byte {:#04x}",
            other
        ))),
    }
}

async fn read_byte<S>(stream: &mut S) -> Result<Option<u8>, TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    match stream.read(&mut byte).await? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

async fn read_diagnostic<S>(stream: &mut S) -> Result<String, TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    while let Some(byte) = read_byte(stream).await? {
        if byte == b'\n' || line.len() >= MAX_LINE_LENGTH {
            break;
        }
        line.push(byte);
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

async fn read_payload<S>(stream: &mut S, size: u64, out: &mut Vec<u8>) -> Result<(), TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut remaining = size;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::UnexpectedEof);
        }
        out.extend_from_slice(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn header(size: u64, name: &str) -> FileHeader {
        FileHeader {
            mode: FileMode::DEFAULT,
            size,
            name: name.to_string(),
            mtime: 1_700_000_000,
            atime: 1_700_000_000,
        }
    }

    /// Collect everything the client writes while acknowledging each step
    async fn accepting_sink(mut remote: tokio::io::DuplexStream, acks: usize) -> Vec<u8> {
        let mut received = Vec::new();
        remote.write_all(&[ACK_OK]).await.unwrap();
        let mut buf = [0u8; 4096];
        let mut sent = 1;
        loop {
            let n = remote.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            let newlines = received.iter().filter(|b| **b == b'\n').count();
            let expected = 1 + newlines.min(2) + usize::from(received.ends_with(&[0]));
            while sent < expected.min(acks) {
                remote.write_all(&[ACK_OK]).await.unwrap();
                sent += 1;
            }
        }
        received
    }

    #[tokio::test]
    async fn test_send_file_wire_format() {
        let (mut local, remote) = duplex(64 * 1024);
        let sink = tokio::spawn(accepting_sink(remote, 4));

        let mut payload = &b"hello"[..];
        send_file(&mut local, &header(5, "/tmp/out/greeting"), &mut payload)
            .await
            .unwrap();
        drop(local);

        let received = sink.await.unwrap();
        assert_eq!(
            received,
            b"T1700000000 0 1700000000 0\nC0644 5 greeting\nhello\0".to_vec()
        );
    }

    #[tokio::test]
    async fn test_send_file_fatal_ack() {
        let (mut local, mut remote) = duplex(1024);
        let sink = tokio::spawn(async move {
            remote.write_all(&[ACK_OK]).await.unwrap();
            let mut buf = [0u8; 256];
            let _ = remote.read(&mut buf).await.unwrap();
            remote.write_all(b"\x02scp: /root: Permission denied\n").await.unwrap();
        });

        let mut payload = &b"data"[..];
        let result = send_file(&mut local, &header(4, "file"), &mut payload).await;
        sink.await.unwrap();

        match result {
            Err(TransferError::Remote { fatal, message }) => {
                assert!(fatal);
                assert_eq!(message, "scp: /root: Permission denied");
            }
            other => panic!("Expected remote fatal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_file_remote_closes_early() {
        let (mut local, remote) = duplex(1024);
        drop(remote);

        let mut payload = &b""[..];
        let result = send_file(&mut local, &header(0, "file"), &mut payload).await;
        assert!(matches!(
            result,
            Err(TransferError::UnexpectedEof) | Err(TransferError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_send_file_short_payload() {
        let (mut local, remote) = duplex(64 * 1024);
        let _sink = tokio::spawn(accepting_sink(remote, 3));

        let mut payload = &b"abc"[..];
        let result = send_file(&mut local, &header(10, "file"), &mut payload).await;
        assert!(matches!(
            result,
            Err(TransferError::ShortPayload {
                sent: 3,
                expected: 10
            })
        ));
    }

    #[tokio::test]
    async fn test_receive_file() {
        let (mut local, mut remote) = duplex(1024);
        let source = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"C0644 5 greeting\n").await.unwrap();
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"hello\0").await.unwrap();
            remote.read_exact(&mut byte).await.unwrap();
        });

        let data = receive_file(&mut local, MAX_DOWNLOAD_SIZE).await.unwrap();
        source.await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_receive_missing_file_is_empty() {
        let (mut local, mut remote) = duplex(1024);
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await.unwrap();
            remote
                .write_all(b"\x01scp: /var/lib/x: No such file or directory\n")
                .await
                .unwrap();
        });

        let data = receive_file(&mut local, MAX_DOWNLOAD_SIZE).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_receive_fatal_is_error() {
        let (mut local, mut remote) = duplex(1024);
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"\x02protocol error\n").await.unwrap();
        });

        let result = receive_file(&mut local, MAX_DOWNLOAD_SIZE).await;
        assert!(matches!(
            result,
            Err(TransferError::Remote { fatal: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_truncated_payload() {
        let (mut local, mut remote) = duplex(1024);
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"C0644 10 file\n").await.unwrap();
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"abc").await.unwrap();
        });

        let result = receive_file(&mut local, MAX_DOWNLOAD_SIZE).await;
        assert!(matches!(result, Err(TransferError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_receive_enforces_size_limit() {
        let (mut local, mut remote) = duplex(1024);
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"C0644 2048 big\n").await.unwrap();
            let _ = remote.read(&mut byte).await;
        });

        let result = receive_file(&mut local, 1024).await;
        assert!(matches!(
            result,
            Err(TransferError::TooLarge {
                size: 2048,
                max: 1024
            })
        ));
    }

    #[tokio::test]
    async fn test_receive_limit_counts_earlier_files() {
        let (mut local, mut remote) = duplex(1024);
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"C0644 1 a\n").await.unwrap();
            remote.read_exact(&mut byte).await.unwrap();
            remote.write_all(b"x\0").await.unwrap();
            remote.read_exact(&mut byte).await.unwrap();
            remote
                .write_all(format!("C0644 {} b\n", u64::MAX).as_bytes())
                .await
                .unwrap();
            let _ = remote.read(&mut byte).await;
        });

        let result = receive_file(&mut local, 1024).await;
        assert!(matches!(
            result,
            Err(TransferError::TooLarge {
                size: u64::MAX,
                max: 1024
            })
        ));
    }
}
