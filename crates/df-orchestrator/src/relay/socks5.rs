//! SOCKS5 CONNECT without authentication (RFC 1928)

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::listener::connect_upstream;
use super::ProxyError;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    fn for_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::NotFound => Reply::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Requested destination
#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    Ip(IpAddr),
    Domain(String),
}

/// Serve one SOCKS5 client
pub(super) async fn serve(mut client: TcpStream, connect_timeout: Duration) -> Result<(), ProxyError> {
    negotiate(&mut client).await?;

    let (destination, port) = match read_request(&mut client).await {
        Ok(request) => request,
        Err(RequestError::Reply(reply, message)) => {
            write_reply(&mut client, reply, None).await?;
            return Err(ProxyError::Protocol(message));
        }
        Err(RequestError::Proxy(e)) => return Err(e),
    };

    let host = match &destination {
        Destination::Ip(ip) => ip.to_string(),
        Destination::Domain(name) => name.clone(),
    };

    let mut upstream = match connect_upstream(&host, port, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("SOCKS5 connect to {}:{} failed: {}", host, port, e);
            write_reply(&mut client, Reply::for_error(&e), None).await?;
            return Ok(());
        }
    };

    write_reply(&mut client, Reply::Succeeded, upstream.local_addr().ok()).await?;
    tracing::debug!("SOCKS5 tunnel to {}:{}", host, port);

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Method negotiation; only "no authentication" is offered
async fn negotiate<S>(stream: &mut S) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(ProxyError::Protocol(format!(
            "unsupported SOCKS version {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        stream.shutdown().await?;
        return Err(ProxyError::Protocol(
            "client does not offer unauthenticated access".to_string(),
        ));
    }

    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

enum RequestError {
    Reply(Reply, String),
    Proxy(ProxyError),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Proxy(ProxyError::Io(e))
    }
}

async fn read_request<S>(stream: &mut S) -> Result<(Destination, u16), RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;

    if version != VERSION {
        return Err(RequestError::Proxy(ProxyError::Protocol(format!(
            "unsupported SOCKS version {} in request",
            version
        ))));
    }

    let destination = match address_type {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Destination::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| {
                RequestError::Reply(Reply::GeneralFailure, "domain name is not UTF-8".to_string())
            })?;
            Destination::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Destination::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => {
            return Err(RequestError::Reply(
                Reply::AddressTypeNotSupported,
                format!("address type {:#04x}", other),
            ));
        }
    };
    let port = stream.read_u16().await?;

    if command != CMD_CONNECT {
        return Err(RequestError::Reply(
            Reply::CommandNotSupported,
            format!("command {:#04x}", command),
        ));
    }

    Ok((destination, port))
}

async fn write_reply<S>(
    stream: &mut S,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let mut message = vec![VERSION, reply as u8, 0x00];
    match bound.ip() {
        IpAddr::V4(v4) => {
            message.push(ATYP_IPV4);
            message.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            message.push(ATYP_IPV6);
            message.extend_from_slice(&v6.octets());
        }
    }
    message.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&message).await?;
    stream.flush().await?;
    Ok(())
}
