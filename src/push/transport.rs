//! Socket abstraction under the push channel, with the WebSocket backend.

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::SyncError;

/// The frames the channel cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  Text(String),
  Close(Option<u16>),
  Other,
}

/// An open socket.
pub trait Connection: Send + 'static {
  /// Next inbound frame. `None` when the stream ended without a close frame.
  fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<Frame, SyncError>>>;

  fn close(&mut self, code: u16) -> BoxFuture<'_, ()>;
}

/// Opens sockets. The URL already carries the credential.
pub trait Connector: Send + Sync + 'static {
  type Conn: Connection;

  fn connect(&self, url: Url) -> BoxFuture<'static, Result<Self::Conn, SyncError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsConnection {
  stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connector for WsConnector {
  type Conn = WsConnection;

  fn connect(&self, url: Url) -> BoxFuture<'static, Result<WsConnection, SyncError>> {
    async move {
      let (stream, _response) = connect_async(url.to_string())
        .await
        .map_err(|e| SyncError::Channel(format!("websocket connect failed: {}", e)))?;
      Ok(WsConnection { stream })
    }
    .boxed()
  }
}

impl Connection for WsConnection {
  fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<Frame, SyncError>>> {
    async move {
      let message = self.stream.next().await?;
      Some(match message {
        Ok(Message::Text(text)) => Ok(Frame::Text(text)),
        Ok(Message::Close(frame)) => Ok(Frame::Close(frame.map(|f| u16::from(f.code)))),
        Ok(_) => Ok(Frame::Other),
        Err(e) => Err(SyncError::Channel(e.to_string())),
      })
    }
    .boxed()
  }

  fn close(&mut self, code: u16) -> BoxFuture<'_, ()> {
    async move {
      let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
      };
      // The peer may already be gone; nothing left to do either way.
      let _ = self.stream.close(Some(frame)).await;
    }
    .boxed()
  }
}
