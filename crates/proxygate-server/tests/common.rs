//! Common fixtures for relay integration tests.

use proxygate_server::{Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Starts an upstream that echoes every byte back and returns its address.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Starts an upstream that counts accepted connections and never answers.
pub async fn spawn_counting_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });
    (addr, accepted)
}

/// Relay config listening on an ephemeral loopback port.
pub fn test_config(upstream: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        upstream_addr: upstream.to_string(),
        ..ServerConfig::default()
    }
}

/// Binds the relay without serving. The caller spawns [`Server::run`] after
/// taking any handles it needs.
pub async fn start(config: &ServerConfig) -> (Server, SocketAddr) {
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}
