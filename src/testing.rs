//! Test helpers shared across modules.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use crate::client::ResourceClient;
use crate::credentials::StaticToken;

/// Serve exactly one canned HTTP response on a local port.
///
/// Returns the base URL (`http://127.0.0.1:<port>/api/v1`) and a handle
/// resolving to the raw request the server received.
pub(crate) async fn serve_once(status_line: &'static str, body: &'static str) -> (Url, JoinHandle<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handle = tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = vec![0u8; 8192];
    let n = socket.read(&mut buf).await.unwrap();
    let response = format!(
      "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
      status_line,
      body.len(),
      body
    );
    socket.write_all(response.as_bytes()).await.unwrap();
    socket.shutdown().await.unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
  });
  (Url::parse(&format!("http://{}/api/v1", addr)).unwrap(), handle)
}

pub(crate) fn resource_client(base: Url) -> ResourceClient {
  ResourceClient::new(base, Arc::new(StaticToken::new("t0ken")), Duration::from_secs(5)).unwrap()
}
