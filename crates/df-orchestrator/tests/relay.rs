//! Relay behaviour seen from a proxy client

use std::time::Duration;

use df_core::config::{RelayConfig, RelayProtocol};
use df_orchestrator::RelayServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn relay(protocol: RelayProtocol, base_port: u16) -> RelayServer {
    RelayServer::new(RelayConfig {
        protocol,
        base_port,
        port_range: 32,
        remote_port: 8080,
        connect_timeout: Duration::from_secs(2),
    })
}

/// Answers every request with a fixed body, then closes
async fn upstream(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&chunk[..n]);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });
    port
}

async fn exchange(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_unreachable_connect_then_next_request_served() {
    let closed = free_port().await;
    let origin = upstream("Packages.gz").await;
    let relay = relay(RelayProtocol::Http, free_port().await);
    let registration = relay.register_client("sensor-1 (192.168.1.20)").await.unwrap();

    let response = exchange(
        registration.port(),
        &format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n", closed),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502"), "got {:?}", response);

    let response = exchange(
        registration.port(),
        &format!(
            "GET http://127.0.0.1:{}/raspbian/dists/buster/main/Packages.gz HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\r\n",
            origin
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got {:?}", response);
    assert!(response.ends_with("Packages.gz"));

    relay.unregister_client(registration).await;
    assert!(!relay.is_running().await);
}

#[tokio::test]
async fn test_connect_tunnel_carries_bytes() {
    let origin = upstream("tunnelled").await;
    let relay = relay(RelayProtocol::Http, free_port().await);
    let registration = relay.register_client("sensor-1").await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", registration.port()))
        .await
        .unwrap();
    stream
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin).as_bytes())
        .await
        .unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 Connection established\r\n\r\n"));
    assert!(response.ends_with("tunnelled"));

    relay.unregister_client(registration).await;
}

#[tokio::test]
async fn test_socks5_relay_reaches_origin() {
    let origin = upstream("via socks").await;
    let relay = relay(RelayProtocol::Socks5, free_port().await);
    let registration = relay.register_client("sensor-1").await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", registration.port()))
        .await
        .unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&origin.to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0);

    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.ends_with("via socks"));

    relay.unregister_client(registration).await;
}
