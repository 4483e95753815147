//! Fixed-interval refetching of long-running server work.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::cancel::CancelSignal;
use crate::error::SyncError;

type Completion<T> = Box<dyn FnOnce(&T) + Send>;

/// Refreshes a cache entry on a fixed interval until it reaches a terminal
/// state.
#[derive(Clone)]
pub struct Poller {
  cache: QueryCache,
  interval: Duration,
}

impl Poller {
  pub fn new(cache: QueryCache, interval: Duration) -> Self {
    Self { cache, interval }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Load `key` now and then every interval, ignoring freshness, until
  /// `is_terminal` holds for the loaded value.
  pub fn poll<T, L, Fut, P>(&self, key: &CacheKey, loader: L, is_terminal: P) -> PollHandle
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    L: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    P: Fn(&T) -> bool + Send + 'static,
  {
    self.spawn(key, loader, is_terminal, None)
  }

  /// Like [`poll`](Self::poll), calling `on_complete` exactly once with the
  /// terminal value.
  pub fn poll_until<T, L, Fut, P, C>(
    &self,
    key: &CacheKey,
    loader: L,
    is_terminal: P,
    on_complete: C,
  ) -> PollHandle
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    L: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    P: Fn(&T) -> bool + Send + 'static,
    C: FnOnce(&T) + Send + 'static,
  {
    self.spawn(key, loader, is_terminal, Some(Box::new(on_complete)))
  }

  fn spawn<T, L, Fut, P>(
    &self,
    key: &CacheKey,
    loader: L,
    is_terminal: P,
    mut on_complete: Option<Completion<T>>,
  ) -> PollHandle
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    L: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    P: Fn(&T) -> bool + Send + 'static,
  {
    let cache = self.cache.clone();
    let interval = self.interval;
    let key = key.clone();
    let task_key = key.clone();

    let task = tokio::spawn(async move {
      let key = task_key;
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        match cache.refresh::<T, _, _>(&key, &loader).await {
          Ok(value) if is_terminal(&value) => {
            info!(key = %key, "poll reached terminal state");
            if let Some(callback) = on_complete.take() {
              callback(&value);
            }
            return true;
          }
          Ok(_) => debug!(key = %key, "poll tick, not terminal yet"),
          Err(e) if e.is_cancellation() => {
            debug!(key = %key, "poll cancelled");
            return false;
          }
          Err(e) => warn!(key = %key, error = %e, "poll failed, retrying next tick"),
        }
      }
    });

    PollHandle { key, task }
  }
}

/// A running poll. Dropping it stops polling.
pub struct PollHandle {
  key: CacheKey,
  task: JoinHandle<bool>,
}

impl PollHandle {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Wait for polling to end. `true` if a terminal value was reached.
  pub async fn finished(mut self) -> bool {
    (&mut self.task).await.unwrap_or(false)
  }

  pub fn stop(self) {}
}

impl Drop for PollHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};

  fn job_key() -> CacheKey {
    CacheKey::new("jobs").push("detail").push("j-1")
  }

  fn is_terminal(job: &Value) -> bool {
    job["status"] != "pending"
  }

  /// A loader that replays `script`, repeating its last step forever.
  fn scripted(
    script: Vec<Result<Value, SyncError>>,
    calls: Arc<AtomicUsize>,
  ) -> impl Fn(CancelSignal) -> futures::future::Ready<Result<Value, SyncError>> + Send + Sync + 'static {
    move |_| {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(script[n.min(script.len() - 1)].clone())
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_stops_after_terminal_state() {
    let cache = QueryCache::new();
    let poller = Poller::new(cache.clone(), Duration::from_secs(2));
    let calls = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(Mutex::new(Vec::new()));

    let handle = {
      let completed = completed.clone();
      poller.poll_until(
        &job_key(),
        scripted(
          vec![
            Ok(json!({"id": "j-1", "status": "pending"})),
            Ok(json!({"id": "j-1", "status": "pending"})),
            Ok(json!({"id": "j-1", "status": "completed", "result": 7})),
          ],
          calls.clone(),
        ),
        is_terminal,
        move |job: &Value| completed.lock().unwrap().push(job.clone()),
      )
    };

    assert!(handle.finished().await);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
      *completed.lock().unwrap(),
      vec![json!({"id": "j-1", "status": "completed", "result": 7})]
    );
    assert_eq!(cache.read(&job_key()).data.unwrap()["status"], "completed");
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_errors_keep_polling() {
    let cache = QueryCache::new();
    let poller = Poller::new(cache, Duration::from_secs(2));
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = poller.poll(
      &job_key(),
      scripted(
        vec![
          Err(SyncError::transport(Some(502), "bad gateway")),
          Ok(json!({"status": "failed"})),
        ],
        calls.clone(),
      ),
      is_terminal,
    );

    assert!(handle.finished().await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropping_handle_stops_polling() {
    let cache = QueryCache::new();
    let poller = Poller::new(cache, Duration::from_secs(2));
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = poller.poll(
      &job_key(),
      scripted(vec![Ok(json!({"status": "pending"}))], calls.clone()),
      is_terminal,
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    handle.stop();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancellation_ends_the_poll() {
    let cache = QueryCache::new();
    let poller = Poller::new(cache.clone(), Duration::from_secs(2));

    let handle = poller.poll(
      &job_key(),
      |_| std::future::pending::<Result<Value, SyncError>>(),
      is_terminal,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.cancel(&job_key()));

    assert!(!handle.finished().await);
  }
}
