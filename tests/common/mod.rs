//! Shared utilities for the integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpStream;

/// Router answering `/example` with "it worked".
pub fn example_router() -> Router {
    Router::new().route("/example", get(|| async { "it worked" }))
}

/// Router whose `/slow` handler takes `delay` to answer.
pub fn slow_router(delay: Duration) -> Router {
    example_router().route(
        "/slow",
        get(move || async move {
            tokio::time::sleep(delay).await;
            "done"
        }),
    )
}

/// A loopback address with a port that was free a moment ago.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn testdata(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/testdata/certificate")
        .join(name)
}

pub fn socket_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("graceful-{}-{}.sock", name, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Client that trusts the test certificate authority.
pub fn tls_client() -> reqwest::Client {
    let ca = std::fs::read(testdata("ca.pem")).unwrap();
    reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(&ca).unwrap())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Wait until something accepts connections on `addr`.
pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {addr}");
}

/// Wait until nothing accepts connections on `addr`.
pub async fn wait_for_close(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{addr} still accepting connections");
}

pub async fn get_text(client: &reqwest::Client, url: &str) -> (u16, String) {
    let response = client.get(url).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}
