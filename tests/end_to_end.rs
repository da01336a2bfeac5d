//! End-to-end tests against a loopback tunnel server.
//!
//! The "remote site" is a plain `ws://` tokio-tungstenite server plus a
//! minimal HTTP responder for the status endpoint, both selected through
//! `TunnelConfig::with_endpoint`.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use webapp_tunnel::{Credential, RelayStats, TunnelConfig, TunnelError, TunnelSession};

#[derive(Debug, Clone, Default)]
struct Handshake {
    path: String,
    authorization: Option<String>,
}

type ServerSocket = WebSocketStream<TcpStream>;

fn config(endpoint: SocketAddr) -> TunnelConfig {
    TunnelConfig::new("127.0.0.1".parse().unwrap(), 0, "contoso", Credential::new("u", "p"))
        .with_endpoint(format!("ws://{}", endpoint))
}

/// Accepts one WebSocket upgrade, recording the request path and credentials.
async fn accept_tunnel(listener: &TcpListener) -> (ServerSocket, Handshake) {
    let (stream, _) = listener.accept().await.unwrap();
    let captured = Arc::new(Mutex::new(Handshake::default()));
    let record = captured.clone();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let mut handshake = record.lock().unwrap();
            handshake.path = req.uri().path().to_string();
            handshake.authorization = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        },
    )
    .await
    .unwrap();
    let handshake = captured.lock().unwrap().clone();
    (ws, handshake)
}

/// Reads messages until the relay closes the tunnel.
async fn drain(ws: &mut ServerSocket) {
    while let Some(Ok(msg)) = ws.next().await {
        if msg.is_close() {
            break;
        }
    }
}

/// Serves one HTTP request with a canned response and returns the raw request.
async fn spawn_status_server(status_line: &'static str, body: &'static str) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        String::from_utf8_lossy(&request).into_owned()
    });
    (addr, handle)
}

#[tokio::test]
async fn test_ping_pong_through_tunnel() {
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut ws, handshake) = accept_tunnel(&tunnel).await;
        let first = ws.next().await.unwrap().unwrap();
        ws.send(Message::Binary(Bytes::from_static(b"PONG"))).await.unwrap();
        drain(&mut ws).await;
        (handshake, first)
    });

    let mut session = TunnelSession::bind(config(tunnel_addr)).await.unwrap();
    let local_addr = session.local_addr().unwrap();
    let relay = tokio::spawn(async move { session.serve_next().await });

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PONG");
    drop(client);

    let stats = relay.await.unwrap().expect("relay should have run");
    assert_eq!(stats, RelayStats { bytes_downloaded: 4, bytes_uploaded: 4 });

    let (handshake, first) = server.await.unwrap();
    assert_eq!(handshake.path, "/AppServiceTunnel/Tunnel.ashx");
    assert_eq!(handshake.authorization.as_deref(), Some("Basic dTpw"));
    assert_eq!(first, Message::Binary(Bytes::from_static(b"PING")));
}

#[tokio::test]
async fn test_remote_close_disconnects_client() {
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept_tunnel(&tunnel).await;
        ws.close(None).await.ok();
        drain(&mut ws).await;
    });

    let mut session = TunnelSession::bind(config(tunnel_addr)).await.unwrap();
    let local_addr = session.local_addr().unwrap();
    let relay = tokio::spawn(async move { session.serve_next().await });

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .expect("client was not disconnected")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let stats = relay.await.unwrap().expect("relay should have run");
    assert_eq!(stats, RelayStats::default());
    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_credentials_drop_client() {
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = tunnel.accept().await.unwrap();
        let result = tokio_tungstenite::accept_hdr_async(
            stream,
            |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder()
                    .status(http::StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            },
        )
        .await;
        assert!(result.is_err());
    });

    let mut session = TunnelSession::bind(config(tunnel_addr)).await.unwrap();
    let local_addr = session.local_addr().unwrap();
    let relay = tokio::spawn(async move { session.serve_next().await });

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    assert!(relay.await.unwrap().is_none());
    let mut buf = Vec::new();
    assert_eq!(client.read_to_end(&mut buf).await.unwrap_or(0), 0);
    server.await.unwrap();
}

#[tokio::test]
async fn test_each_client_gets_a_fresh_tunnel() {
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut handshakes = 0;
        for _ in 0..2 {
            let (mut ws, _) = accept_tunnel(&tunnel).await;
            handshakes += 1;
            // Echo until the relay closes this tunnel
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => ws.send(Message::Binary(data)).await.unwrap(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
        handshakes
    });

    let mut session = TunnelSession::bind(config(tunnel_addr)).await.unwrap();
    let local_addr = session.local_addr().unwrap();
    let runner = tokio::spawn(async move {
        session.run().await;
    });

    for payload in [&b"first"[..], &b"second"[..]] {
        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        drop(client);
    }

    let handshakes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("second tunnel was never closed")
        .unwrap();
    assert_eq!(handshakes, 2);
    runner.abort();
}

#[tokio::test]
async fn test_status_probe_default_port() {
    let (addr, request) = spawn_status_server("200 OK", "SUCCESS: port 2222").await;
    let session = TunnelSession::bind(config(addr)).await.unwrap();

    assert!(session.probe_status().await.unwrap());

    let request = request.await.unwrap().to_lowercase();
    assert!(request.starts_with("get /appservicetunnel/tunnel.ashx?getstatus "));
    assert!(request.contains("authorization: basic dtpw"));
}

#[tokio::test]
async fn test_status_probe_failure_marker_is_independent() {
    let (addr, _request) = spawn_status_server("200 OK", "FAIL: debugger not listening").await;
    let session = TunnelSession::bind(config(addr)).await.unwrap();
    let report = session.fetch_status().await.unwrap();
    assert!(report.failure_reported);
    assert!(!report.default_debug_port);

    let (addr, _request) = spawn_status_server("200 OK", "FAIL: 2222 unreachable").await;
    let session = TunnelSession::bind(config(addr)).await.unwrap();
    assert!(session.probe_status().await.unwrap());
}

#[tokio::test]
async fn test_status_probe_non_200() {
    let (addr, _request) = spawn_status_server("503 Service Unavailable", "").await;
    let session = TunnelSession::bind(config(addr)).await.unwrap();

    match session.probe_status().await {
        Err(TunnelError::ConnectError { url, status, reason }) => {
            assert_eq!(
                &*url,
                format!("http://{}/AppServiceTunnel/Tunnel.ashx?GetStatus", addr).as_str()
            );
            assert_eq!(status, 503);
            assert_eq!(&*reason, "Service Unavailable");
        }
        other => panic!("expected ConnectError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_occupied_port_is_rejected() {
    let occupant = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupant.local_addr().unwrap().port();
    let config = TunnelConfig::new("127.0.0.1".parse().unwrap(), port, "contoso", Credential::new("u", "p"));

    match TunnelSession::bind(config).await {
        Err(TunnelError::PortUnavailable { port: p }) => assert_eq!(p, port),
        Err(e) => panic!("expected PortUnavailable, got {}", e),
        Ok(_) => panic!("bound an occupied port"),
    }
}
