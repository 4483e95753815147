//! The push channel: a long-lived socket feeding the query cache.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::dispatch::{dispatch, Dispatch};
use super::event::ChannelEvent;
use super::state::{Backoff, ConnectionState};
use super::transport::{Connection, Connector, Frame, WsConnector};
use crate::cache::QueryCache;
use crate::cancel::CancelSignal;
use crate::credentials::CredentialProvider;
use crate::error::SyncError;

/// Close code for a deliberate, normal shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// How a connected session ended.
enum Session {
  /// `disconnect()` was called.
  Stopped,
  /// The server closed the socket (or the stream just ended).
  Closed(Option<u16>),
  Failed(SyncError),
}

struct ChannelInner<C> {
  connector: C,
  credentials: Arc<dyn CredentialProvider>,
  cache: QueryCache,
  url: Url,
  backoff: Backoff,
  state: watch::Sender<ConnectionState>,
  events: broadcast::Sender<ChannelEvent>,
  attempt: AtomicU32,
}

struct Driver {
  stop: CancelSignal,
  task: JoinHandle<()>,
}

/// Keeps a socket open to the push endpoint, reconnecting with exponential
/// backoff, and applies every inbound event to the cache.
pub struct PushChannel<C: Connector = WsConnector> {
  inner: Arc<ChannelInner<C>>,
  driver: Mutex<Option<Driver>>,
}

impl PushChannel<WsConnector> {
  pub fn websocket(
    url: Url,
    credentials: Arc<dyn CredentialProvider>,
    cache: QueryCache,
    backoff: Backoff,
  ) -> Self {
    Self::new(WsConnector, url, credentials, cache, backoff)
  }
}

impl<C: Connector> PushChannel<C> {
  pub fn new(
    connector: C,
    url: Url,
    credentials: Arc<dyn CredentialProvider>,
    cache: QueryCache,
    backoff: Backoff,
  ) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(ChannelInner {
        connector,
        credentials,
        cache,
        url,
        backoff,
        state,
        events,
        attempt: AtomicU32::new(0),
      }),
      driver: Mutex::new(None),
    }
  }

  fn driver(&self) -> MutexGuard<'_, Option<Driver>> {
    self.driver.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start connecting. No-op while the channel is already running.
  ///
  /// Must be called from within a tokio runtime.
  pub fn connect(&self) {
    let mut driver = self.driver();
    if driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
      return;
    }
    self.inner.attempt.store(0, Ordering::SeqCst);
    let stop = CancelSignal::new();
    let task = tokio::spawn(self.inner.clone().drive(stop.clone()));
    *driver = Some(Driver { stop, task });
  }

  /// Close the socket with a normal closure and stop reconnecting.
  ///
  /// Resolves once the channel is `disconnected`.
  pub async fn disconnect(&self) {
    let Some(driver) = self.driver().take() else {
      return;
    };
    driver.stop.cancel();
    let _ = driver.task.await;
  }

  /// Drop the current connection (if any) and start over with a fresh
  /// attempt counter. This is how a channel that gave up is revived.
  pub async fn reconnect(&self) {
    self.disconnect().await;
    self.connect();
  }

  pub fn state(&self) -> ConnectionState {
    *self.inner.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
    self.inner.state.subscribe()
  }

  /// Every event applied to the cache, heartbeats excluded.
  pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
    self.inner.events.subscribe()
  }

  /// Consecutive failed attempts since the last successful open.
  pub fn attempt(&self) -> u32 {
    self.inner.attempt.load(Ordering::SeqCst)
  }
}

impl<C: Connector> Drop for PushChannel<C> {
  fn drop(&mut self) {
    if let Some(driver) = self.driver().take() {
      driver.stop.cancel();
    }
  }
}

impl<C: Connector> ChannelInner<C> {
  fn set_state(&self, next: ConnectionState) {
    self.state.send_if_modified(|state| {
      if *state == next {
        return false;
      }
      info!(from = %state, to = %next, "push channel state changed");
      *state = next;
      true
    });
  }

  async fn drive(self: Arc<Self>, stop: CancelSignal) {
    let mut attempt = 0u32;
    loop {
      self.set_state(ConnectionState::Connecting);
      let opened = tokio::select! {
        biased;
        _ = stop.cancelled() => break,
        opened = self.open() => opened,
      };

      match opened {
        Ok(mut conn) => {
          attempt = 0;
          self.attempt.store(0, Ordering::SeqCst);
          self.set_state(ConnectionState::Connected);

          match self.pump(&mut conn, &stop).await {
            Session::Stopped => {
              conn.close(NORMAL_CLOSURE).await;
              break;
            }
            Session::Closed(Some(NORMAL_CLOSURE)) => {
              info!("push channel closed by server");
              break;
            }
            Session::Closed(code) => {
              info!(code = ?code, "push channel dropped");
              self.set_state(ConnectionState::Disconnected);
            }
            Session::Failed(err) => {
              warn!(error = %err, "push channel failed");
              self.set_state(ConnectionState::Error);
            }
          }
        }
        Err(err) => {
          warn!(error = %err, attempt, "push channel connect failed");
          self.set_state(ConnectionState::Error);
        }
      }

      let Some(delay) = self.backoff.delay(attempt) else {
        warn!(attempts = attempt, "push channel giving up");
        break;
      };
      attempt += 1;
      self.attempt.store(attempt, Ordering::SeqCst);
      debug!(delay_ms = delay.as_millis() as u64, attempt, "reconnect scheduled");

      tokio::select! {
        biased;
        _ = stop.cancelled() => break,
        _ = tokio::time::sleep(delay) => {}
      }
    }
    self.set_state(ConnectionState::Disconnected);
  }

  /// Fetch a token and open the socket. A credential failure counts as a
  /// connect failure.
  async fn open(&self) -> Result<C::Conn, SyncError> {
    let token = self
      .credentials
      .token()
      .await
      .map_err(|e| SyncError::Channel(format!("no credential for push channel: {}", e)))?;
    let mut url = self.url.clone();
    url.query_pairs_mut().append_pair("token", &token);
    self.connector.connect(url).await
  }

  async fn pump(&self, conn: &mut C::Conn, stop: &CancelSignal) -> Session {
    loop {
      let frame = tokio::select! {
        biased;
        _ = stop.cancelled() => return Session::Stopped,
        frame = conn.next_frame() => frame,
      };
      match frame {
        None => return Session::Closed(None),
        Some(Err(err)) => return Session::Failed(err),
        Some(Ok(Frame::Close(code))) => return Session::Closed(code),
        Some(Ok(Frame::Text(text))) => self.handle_text(&text),
        Some(Ok(Frame::Other)) => {}
      }
    }
  }

  fn handle_text(&self, text: &str) {
    let event = match ChannelEvent::parse(text) {
      Ok(event) => event,
      Err(err) => {
        warn!(error = %err, "dropping malformed push frame");
        return;
      }
    };
    if dispatch(&self.cache, &event) == Dispatch::Applied {
      let _ = self.events.send(event);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::compliance::Domain;
  use crate::credentials::StaticToken;
  use futures::future::{BoxFuture, FutureExt};
  use serde_json::json;
  use std::collections::VecDeque;
  use std::time::Duration;
  use tokio::sync::mpsc;
  use tokio::time::Instant;

  type Shared<T> = Arc<Mutex<T>>;

  /// Server side of a fake connection.
  struct Server {
    tx: mpsc::UnboundedSender<Frame>,
    closed_with: Shared<Option<u16>>,
  }

  impl Server {
    fn send(&self, frame: Frame) {
      self.tx.send(frame).unwrap();
    }

    fn closed_with(&self) -> Option<u16> {
      *self.closed_with.lock().unwrap()
    }
  }

  struct FakeConnection {
    rx: mpsc::UnboundedReceiver<Frame>,
    closed_with: Shared<Option<u16>>,
  }

  impl Connection for FakeConnection {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<Frame, SyncError>>> {
      async move { self.rx.recv().await.map(Ok) }.boxed()
    }

    fn close(&mut self, code: u16) -> BoxFuture<'_, ()> {
      *self.closed_with.lock().unwrap() = Some(code);
      async {}.boxed()
    }
  }

  #[derive(Default)]
  struct Script {
    /// `None` refuses the attempt. An empty queue refuses too.
    queued: VecDeque<Option<FakeConnection>>,
    attempts: Vec<(Instant, Url)>,
  }

  #[derive(Clone, Default)]
  struct FakeConnector {
    script: Shared<Script>,
  }

  impl FakeConnector {
    fn refuse_next(&self) {
      self.script.lock().unwrap().queued.push_back(None);
    }

    fn accept_next(&self) -> Server {
      let (tx, rx) = mpsc::unbounded_channel();
      let closed_with = Arc::new(Mutex::new(None));
      self
        .script
        .lock()
        .unwrap()
        .queued
        .push_back(Some(FakeConnection {
          rx,
          closed_with: closed_with.clone(),
        }));
      Server { tx, closed_with }
    }

    fn attempts(&self) -> usize {
      self.script.lock().unwrap().attempts.len()
    }

    fn gaps(&self) -> Vec<Duration> {
      let script = self.script.lock().unwrap();
      script
        .attempts
        .windows(2)
        .map(|pair| pair[1].0 - pair[0].0)
        .collect()
    }

    fn first_url(&self) -> Url {
      self.script.lock().unwrap().attempts[0].1.clone()
    }
  }

  impl Connector for FakeConnector {
    type Conn = FakeConnection;

    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FakeConnection, SyncError>> {
      let mut script = self.script.lock().unwrap();
      script.attempts.push((Instant::now(), url));
      let next = script.queued.pop_front().flatten();
      async move { next.ok_or_else(|| SyncError::Channel("connection refused".into())) }.boxed()
    }
  }

  fn channel_with(fake: &FakeConnector, cache: QueryCache) -> PushChannel<FakeConnector> {
    PushChannel::new(
      fake.clone(),
      Url::parse("wss://push.example.test/events").unwrap(),
      Arc::new(StaticToken::new("s3cret")),
      cache,
      Backoff::new(Duration::from_millis(1000), 5),
    )
  }

  async fn wait_for_state(channel: &PushChannel<FakeConnector>, want: ConnectionState) {
    let mut rx = channel.watch_state();
    rx.wait_for(|s| *s == want).await.unwrap();
  }

  fn ms(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|v| Duration::from_millis(*v)).collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_doubles_then_gives_up() {
    let fake = FakeConnector::default();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(fake.attempts(), 6);
    assert_eq!(fake.gaps(), ms(&[1000, 2000, 4000, 8000, 16000]));
    assert_eq!(channel.state(), ConnectionState::Disconnected);
  }

  #[tokio::test(start_paused = true)]
  async fn test_attempt_counter_resets_on_open() {
    let fake = FakeConnector::default();
    fake.refuse_next();
    fake.refuse_next();
    let server = fake.accept_next();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;
    assert_eq!(channel.attempt(), 0);

    server.send(Frame::Close(Some(4000)));
    wait_for_state(&channel, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(fake.attempts(), 4);
    assert_eq!(fake.gaps(), ms(&[1000, 2000, 1000]));
    channel.disconnect().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_token_travels_as_query_parameter() {
    let fake = FakeConnector::default();
    let _server = fake.accept_next();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;

    let url = fake.first_url();
    assert_eq!(url.path(), "/events");
    assert_eq!(url.query(), Some("token=s3cret"));
    channel.disconnect().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_inbound_events_reach_cache_and_listeners() {
    let cache = QueryCache::new();
    let list = Domain::Applicants.lists().push(0i64);
    cache.write_value(&list, json!({"items": [], "total": 0}));

    let fake = FakeConnector::default();
    let server = fake.accept_next();
    let channel = channel_with(&fake, cache.clone());
    let mut events = channel.events();

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;

    server.send(Frame::Text("{not json".into()));
    server.send(Frame::Text(r#"{"type":"ping"}"#.into()));
    server.send(Frame::Text(r#"{"type":"invoice.paid","entityId":"9"}"#.into()));
    server.send(Frame::Text(
      r#"{"type":"applicant.updated","entityId":"42","payload":{"id":"42","status":"approved"}}"#
        .into(),
    ));

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, "applicant.updated");
    assert_eq!(
      cache.read(&Domain::Applicants.detail("42")).data,
      Some(json!({"id": "42", "status": "approved"}))
    );
    assert!(cache.read(&list).invalidated);
    assert_eq!(channel.state(), ConnectionState::Connected);
    channel.disconnect().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_disconnect_closes_normally_and_stays_down() {
    let fake = FakeConnector::default();
    let server = fake.accept_next();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;
    channel.disconnect().await;

    assert_eq!(server.closed_with(), Some(NORMAL_CLOSURE));
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fake.attempts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disconnect_cancels_pending_reconnect() {
    let fake = FakeConnector::default();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Error).await;
    channel.disconnect().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fake.attempts(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_normal_close_does_not_reconnect() {
    let fake = FakeConnector::default();
    let server = fake.accept_next();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;
    server.send(Frame::Close(Some(NORMAL_CLOSURE)));
    wait_for_state(&channel, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fake.attempts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_stream_reconnects() {
    let fake = FakeConnector::default();
    let server = fake.accept_next();
    let _second = fake.accept_next();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;
    drop(server);
    wait_for_state(&channel, ConnectionState::Disconnected).await;
    wait_for_state(&channel, ConnectionState::Connected).await;

    assert_eq!(fake.attempts(), 2);
    assert_eq!(fake.gaps(), ms(&[1000]));
    channel.disconnect().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_credential_failure_is_a_connect_failure() {
    let fake = FakeConnector::default();
    let channel = PushChannel::new(
      fake.clone(),
      Url::parse("wss://push.example.test/events").unwrap(),
      Arc::new(|| async { Err::<String, _>(SyncError::transport(Some(401), "token expired")) }),
      QueryCache::new(),
      Backoff::new(Duration::from_millis(1000), 2),
    );

    channel.connect();
    wait_for_state(&channel, ConnectionState::Error).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(fake.attempts(), 0);
    assert_eq!(channel.attempt(), 2);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_revives_a_channel_that_gave_up() {
    let fake = FakeConnector::default();
    let channel = channel_with(&fake, QueryCache::new());

    channel.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(channel.attempt(), 5);

    let _server = fake.accept_next();
    channel.reconnect().await;
    wait_for_state(&channel, ConnectionState::Connected).await;
    assert_eq!(channel.attempt(), 0);
    channel.disconnect().await;
  }
}
