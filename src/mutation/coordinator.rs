//! Optimistic mutations: apply locally, call the server, then reconcile or
//! roll back.

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, warn};

use super::patch::Patch;
use crate::cache::{CacheKey, QueryCache};
use crate::cancel::CancelSignal;
use crate::error::SyncError;

/// A write operation against the server.
///
/// Only [`call`](Operation::call) is required. The other hooks describe how
/// the operation shows up in the cache.
pub trait Operation: Send + Sync + 'static {
  type Input: Serialize + Clone + Send + Sync + 'static;
  type Output: Serialize + Send + 'static;

  fn name(&self) -> &'static str;

  /// The entry this operation edits optimistically and reconciles.
  fn target(&self, _input: &Self::Input) -> Option<CacheKey> {
    None
  }

  /// The speculative new value for the target entry, computed from its
  /// current data. `None` leaves the entry alone.
  fn optimistic(&self, _current: Option<&Value>, _input: &Self::Input) -> Option<Value> {
    None
  }

  /// Issue the network call.
  fn call(
    &self,
    input: Self::Input,
    signal: CancelSignal,
  ) -> BoxFuture<'static, Result<Self::Output, SyncError>>;

  /// The authoritative value to store in the target entry after success.
  fn reconcile(&self, _input: &Self::Input, output: &Self::Output) -> Option<Value> {
    serde_json::to_value(output).ok()
  }

  /// Scopes that become stale once the operation succeeds.
  fn dependents(&self, _input: &Self::Input, _output: &Self::Output) -> Vec<CacheKey> {
    Vec::new()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Pending,
  Success,
  Error,
}

/// What is known about one mutation invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRecord {
  pub id: u64,
  pub name: &'static str,
  pub inputs: Value,
  pub target: Option<CacheKey>,
  pub status: MutationStatus,
  pub error: Option<SyncError>,
}

/// Per-key async locks serializing mutations that share a target.
#[derive(Default)]
struct KeyLocks {
  map: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

enum Acquire {
  Held(OwnedMutexGuard<()>),
  Busy(Arc<tokio::sync::Mutex<()>>),
}

impl KeyLocks {
  fn map(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>> {
    self.map.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn try_acquire(&self, key: &CacheKey) -> Acquire {
    let lock = self.map().entry(key.clone()).or_default().clone();
    match lock.clone().try_lock_owned() {
      Ok(guard) => Acquire::Held(guard),
      Err(_) => Acquire::Busy(lock),
    }
  }

  /// Forget the lock for `key` once nobody holds or waits on it.
  fn release(&self, key: &CacheKey) {
    let mut map = self.map();
    if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
      map.remove(key);
    }
  }
}

struct Shared {
  cache: QueryCache,
  locks: KeyLocks,
  next_id: AtomicU64,
  records: Mutex<HashMap<u64, MutationRecord>>,
  events: broadcast::Sender<MutationRecord>,
}

impl Shared {
  fn records(&self) -> MutexGuard<'_, HashMap<u64, MutationRecord>> {
    self.records.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn finish(&self, id: u64, error: Option<SyncError>) {
    let Some(mut record) = self.records().remove(&id) else {
      return;
    };
    record.status = if error.is_some() {
      MutationStatus::Error
    } else {
      MutationStatus::Success
    };
    record.error = error;
    let _ = self.events.send(record);
  }
}

/// Runs mutations against the server while keeping the cache in step.
#[derive(Clone)]
pub struct MutationCoordinator {
  shared: Arc<Shared>,
}

impl MutationCoordinator {
  pub fn new(cache: QueryCache) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      shared: Arc::new(Shared {
        cache,
        locks: KeyLocks::default(),
        next_id: AtomicU64::new(1),
        records: Mutex::new(HashMap::new()),
        events,
      }),
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.shared.cache
  }

  /// Mutations that have not settled yet.
  pub fn pending(&self) -> Vec<MutationRecord> {
    let mut pending: Vec<_> = self.shared.records().values().cloned().collect();
    pending.sort_by_key(|r| r.id);
    pending
  }

  /// Whether any unsettled mutation targets a key under `scope`.
  pub fn is_mutating(&self, scope: &CacheKey) -> bool {
    self
      .shared
      .records()
      .values()
      .any(|r| r.target.as_ref().is_some_and(|t| t.starts_with(scope)))
  }

  /// Settled mutation records, as they happen.
  pub fn records(&self) -> broadcast::Receiver<MutationRecord> {
    self.shared.events.subscribe()
  }

  /// Run `op` with `input`.
  ///
  /// The optimistic edit is applied before this function returns, so the
  /// cache already shows it while the returned future is pending. If another
  /// mutation on the same target is still outstanding, the edit is applied
  /// once that one settles instead.
  ///
  /// Dropping the returned future before it settles rolls the edit back.
  pub fn mutate<O: Operation>(
    &self,
    op: &Arc<O>,
    input: O::Input,
  ) -> impl Future<Output = Result<O::Output, SyncError>> + Send + 'static {
    let run = self.start(op, input);
    let cache = self.shared.cache.clone();
    async move {
      let (result, dependents) = run.await;
      if !dependents.is_empty() {
        cache.invalidate_many(&dependents);
      }
      result
    }
  }

  /// Apply the optimistic edit now and return the rest of the mutation.
  ///
  /// The future yields the outcome plus the scopes to invalidate; invalidation
  /// is left to the caller so batches can do it once.
  pub(crate) fn start<O: Operation>(
    &self,
    op: &Arc<O>,
    input: O::Input,
  ) -> impl Future<Output = (Result<O::Output, SyncError>, Vec<CacheKey>)> + Send + 'static {
    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
    let target = op.target(&input);
    let record = MutationRecord {
      id,
      name: op.name(),
      inputs: serde_json::to_value(&input).unwrap_or_default(),
      target: target.clone(),
      status: MutationStatus::Pending,
      error: None,
    };
    self.shared.records().insert(id, record);
    debug!(id, name = op.name(), "mutation started");

    let mut pending = PendingMutation {
      shared: self.shared.clone(),
      id,
      target: target.clone(),
      patch: Patch::None,
      signal: CancelSignal::new(),
      guard: None,
      editing: false,
      settled: false,
    };

    let mut busy = None;
    if let Some(key) = &target {
      match self.shared.locks.try_acquire(key) {
        Acquire::Held(guard) => {
          pending.guard = Some(guard);
          pending.apply(op.as_ref(), &input);
        }
        Acquire::Busy(lock) => {
          debug!(id, key = %key, "target busy, deferring optimistic edit");
          busy = Some(lock);
        }
      }
    }

    let op = op.clone();
    async move {
      if let Some(lock) = busy {
        pending.guard = Some(lock.lock_owned().await);
        pending.apply(op.as_ref(), &input);
      }

      match op.call(input.clone(), pending.signal.clone()).await {
        Ok(output) => {
          pending.commit(op.as_ref(), &input, &output);
          let dependents = op.dependents(&input, &output);
          (Ok(output), dependents)
        }
        Err(err) => {
          pending.fail(err.clone());
          (Err(err), Vec::new())
        }
      }
    }
  }
}

/// One mutation between its optimistic edit and its settlement.
///
/// If dropped unsettled, the edit is rolled back and the call cancelled.
struct PendingMutation {
  shared: Arc<Shared>,
  id: u64,
  target: Option<CacheKey>,
  patch: Patch,
  signal: CancelSignal,
  /// Holds the target key for the lifetime of the mutation.
  guard: Option<OwnedMutexGuard<()>>,
  /// Whether the target entry is held in the cache.
  editing: bool,
  settled: bool,
}

impl PendingMutation {
  fn apply<O: Operation>(&mut self, op: &O, input: &O::Input) {
    let Some(key) = &self.target else {
      return;
    };
    let cache = &self.shared.cache;
    let now = cache.now();
    let id = self.id;
    self.patch = cache.hold(key, |entry| match op.optimistic(entry.data.as_ref(), input) {
      Some(next) => Patch::apply(entry, next, id, now),
      None => Patch::None,
    });
    self.editing = true;
  }

  /// Let go of the target entry, undoing the edit when `undo` is set.
  fn release(&mut self, undo: bool) {
    if !std::mem::take(&mut self.editing) {
      return;
    }
    let Some(key) = self.target.clone() else {
      return;
    };
    let patch = std::mem::take(&mut self.patch);
    let rolled_back = self
      .shared
      .cache
      .release(&key, |entry| undo && patch.rollback(entry));
    if rolled_back {
      debug!(id = self.id, key = %key, "optimistic edit rolled back");
    }
  }

  fn commit<O: Operation>(&mut self, op: &O, input: &O::Input, output: &O::Output) {
    if let (Some(key), Some(value)) = (&self.target, op.reconcile(input, output)) {
      self.shared.cache.write_value(key, value);
    }
    self.release(false);
    self.settle(None);
    debug!(id = self.id, "mutation succeeded");
  }

  fn fail(&mut self, err: SyncError) {
    self.release(true);
    if !err.is_cancellation() {
      warn!(id = self.id, error = %err, "mutation failed");
    }
    self.settle(Some(err));
  }

  fn settle(&mut self, error: Option<SyncError>) {
    self.settled = true;
    self.shared.finish(self.id, error);
  }
}

impl Drop for PendingMutation {
  fn drop(&mut self) {
    if !self.settled {
      self.signal.cancel();
      self.release(true);
      self.shared.finish(self.id, Some(SyncError::Cancelled));
    }
    self.guard = None;
    if let Some(key) = &self.target {
      self.shared.locks.release(key);
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::EntryStatus;
  use crate::clock::ManualClock;
  use futures::FutureExt;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::oneshot;

  pub(crate) fn detail(id: &str) -> CacheKey {
    CacheKey::new("applicants").push("detail").push(id)
  }

  pub(crate) fn list_scope() -> CacheKey {
    CacheKey::new("applicants").push("list")
  }

  type Reply = oneshot::Receiver<Result<Value, SyncError>>;

  /// Sets an applicant's status; each call waits on a reply the test sends.
  #[derive(Default)]
  pub(crate) struct SetStatus {
    replies: Mutex<HashMap<String, Reply>>,
  }

  impl SetStatus {
    pub(crate) fn expect(&self, id: &str) -> oneshot::Sender<Result<Value, SyncError>> {
      let (tx, rx) = oneshot::channel();
      self.replies.lock().unwrap().insert(id.to_string(), rx);
      tx
    }
  }

  impl Operation for SetStatus {
    type Input = (String, String);
    type Output = Value;

    fn name(&self) -> &'static str {
      "set_status"
    }

    fn target(&self, (id, _): &Self::Input) -> Option<CacheKey> {
      Some(detail(id))
    }

    fn optimistic(&self, current: Option<&Value>, (_, status): &Self::Input) -> Option<Value> {
      let mut next = current.cloned()?;
      next["status"] = json!(status);
      Some(next)
    }

    fn call(&self, (id, _): Self::Input, _signal: CancelSignal) -> BoxFuture<'static, Result<Value, SyncError>> {
      let reply = self.replies.lock().unwrap().remove(&id);
      async move {
        match reply {
          Some(rx) => rx.await.unwrap_or(Err(SyncError::Cancelled)),
          None => Err(SyncError::transport(Some(404), "unexpected call")),
        }
      }
      .boxed()
    }

    fn dependents(&self, (id, _): &Self::Input, _output: &Value) -> Vec<CacheKey> {
      vec![detail(id), list_scope()]
    }
  }

  fn setup() -> (QueryCache, MutationCoordinator, Arc<SetStatus>) {
    let cache = QueryCache::new();
    let coordinator = MutationCoordinator::new(cache.clone());
    (cache, coordinator, Arc::new(SetStatus::default()))
  }

  fn input(id: &str, status: &str) -> (String, String) {
    (id.to_string(), status.to_string())
  }

  #[tokio::test]
  async fn test_review_applies_optimistically_then_reconciles() {
    let (cache, coordinator, op) = setup();
    cache.write_value(&detail("a1"), json!({"id": "a1", "status": "pending"}));
    let reply = op.expect("a1");

    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    assert_eq!(
      cache.read(&detail("a1")).data,
      Some(json!({"id": "a1", "status": "approved"}))
    );
    assert_eq!(coordinator.pending().len(), 1);
    assert!(coordinator.is_mutating(&CacheKey::new("applicants")));

    let server = json!({"id": "a1", "status": "approved", "reviewedBy": "u7"});
    reply.send(Ok(server.clone())).unwrap();
    assert_eq!(mutation.await.unwrap(), server);

    assert_eq!(cache.read(&detail("a1")).data, Some(server));
    assert!(coordinator.pending().is_empty());
  }

  #[tokio::test]
  async fn test_review_server_error_reverts() {
    let (cache, coordinator, op) = setup();
    cache.write_value(&detail("a1"), json!({"id": "a1", "status": "pending"}));
    let s0 = cache.read(&detail("a1"));
    let reply = op.expect("a1");
    let mut records = coordinator.records();

    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    assert_eq!(cache.read(&detail("a1")).data.unwrap()["status"], "approved");

    reply
      .send(Err(SyncError::transport(Some(500), "internal error")))
      .unwrap();
    let err = mutation.await.unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(cache.read(&detail("a1")), s0);

    let record = records.recv().await.unwrap();
    assert_eq!(record.status, MutationStatus::Error);
    assert_eq!(record.error, Some(err));
  }

  #[tokio::test]
  async fn test_failure_invalidates_nothing() {
    let (cache, coordinator, op) = setup();
    let list = list_scope().push(0i64);
    cache.write_value(&list, json!({"items": [], "total": 0}));
    cache.write_value(&detail("a1"), json!({"status": "pending"}));
    let reply = op.expect("a1");

    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    reply.send(Err(SyncError::transport(Some(500), "boom"))).unwrap();
    let _ = mutation.await;

    assert!(!cache.read(&list).invalidated);
  }

  #[tokio::test]
  async fn test_success_invalidates_dependents() {
    let (cache, coordinator, op) = setup();
    let list = list_scope().push(0i64);
    cache.write_value(&list, json!({"items": [], "total": 0}));
    cache.write_value(&detail("a1"), json!({"status": "pending"}));
    let reply = op.expect("a1");

    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    reply.send(Ok(json!({"status": "approved"}))).unwrap();
    mutation.await.unwrap();

    assert!(cache.read(&list).invalidated);
    let entry = cache.read(&detail("a1"));
    assert!(entry.invalidated);
    assert_eq!(entry.data, Some(json!({"status": "approved"})));
  }

  #[tokio::test]
  async fn test_rollback_ignores_intervening_writes() {
    let (cache, coordinator, op) = setup();
    cache.write_value(&detail("a1"), json!({"status": "pending"}));
    let s0 = cache.read(&detail("a1"));
    let reply = op.expect("a1");

    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    cache.write_value(&detail("a1"), json!({"status": "escalated"}));

    reply.send(Err(SyncError::transport(Some(500), "boom"))).unwrap();
    let _ = mutation.await;
    assert_eq!(cache.read(&detail("a1")), s0);
  }

  #[tokio::test]
  async fn test_dropped_mutation_rolls_back() {
    let (cache, coordinator, op) = setup();
    cache.write_value(&detail("a1"), json!({"status": "pending"}));
    let s0 = cache.read(&detail("a1"));
    let _reply = op.expect("a1");

    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    assert_eq!(cache.read(&detail("a1")).data.unwrap()["status"], "approved");
    drop(mutation);

    assert_eq!(cache.read(&detail("a1")), s0);
    assert!(coordinator.pending().is_empty());
  }

  #[tokio::test]
  async fn test_same_key_mutations_are_serialized() {
    let (cache, coordinator, op) = setup();
    cache.write_value(&detail("a1"), json!({"status": "pending"}));
    let first_reply = op.expect("a1");

    let first = tokio::spawn(coordinator.mutate(&op, input("a1", "approved")));
    tokio::task::yield_now().await;

    // The second edit waits for the first to settle.
    let second = coordinator.mutate(&op, input("a1", "escalated"));
    assert_eq!(cache.read(&detail("a1")).data.unwrap()["status"], "approved");
    let second = tokio::spawn(second);

    first_reply
      .send(Err(SyncError::transport(Some(500), "boom")))
      .unwrap();
    assert!(first.await.unwrap().is_err());

    // Give the second mutation its turn; its call finds no reply and fails.
    let second_result = second.await.unwrap();
    assert_eq!(second_result.unwrap_err().status(), Some(404));

    let entry = cache.read(&detail("a1"));
    assert_eq!(entry.data, Some(json!({"status": "pending"})));
    assert_eq!(entry.status, EntryStatus::Success);
  }

  #[tokio::test]
  async fn test_edit_leaves_live_fetch_to_finish() {
    let (cache, coordinator, op) = setup();
    cache.write_value(&detail("a1"), json!({"status": "pending"}));
    cache.invalidate(&detail("a1"));

    let (load_tx, load_rx) = oneshot::channel();
    let fetch = tokio::spawn({
      let cache = cache.clone();
      async move {
        cache
          .fetch_value(&detail("a1"), move |_| {
            async move { load_rx.await.unwrap_or(Err(SyncError::Cancelled)) }.boxed()
          })
          .await
      }
    });
    while cache.read(&detail("a1")).status != EntryStatus::Loading {
      tokio::task::yield_now().await;
    }

    let reply = op.expect("a1");
    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    load_tx.send(Ok(json!({"status": "pending"}))).unwrap();

    // The caller still gets its answer; the entry keeps the edit.
    assert_eq!(fetch.await.unwrap(), Ok(json!({"status": "pending"})));
    assert_eq!(cache.read(&detail("a1")).data.unwrap()["status"], "approved");

    let server = json!({"status": "approved", "reviewedBy": "u7"});
    reply.send(Ok(server.clone())).unwrap();
    mutation.await.unwrap();
    assert_eq!(cache.read(&detail("a1")).data, Some(server));
  }

  #[tokio::test]
  async fn test_stale_subscribed_entry_waits_for_settlement_to_refetch() {
    let clock = ManualClock::default();
    let cache = QueryCache::builder().clock(clock.clone()).build();
    let coordinator = MutationCoordinator::new(cache.clone());
    let op = Arc::new(SetStatus::default());
    let loads = Arc::new(AtomicUsize::new(0));

    let mut sub = {
      let loads = loads.clone();
      cache.subscribe(&detail("a1"), move |_| {
        let loads = loads.clone();
        async move {
          loads.fetch_add(1, Ordering::SeqCst);
          Ok::<Value, SyncError>(json!({"status": "pending"}))
        }
      })
    };
    sub.wait_for(|e| e.status == EntryStatus::Success).await.unwrap();
    clock.advance(chrono::Duration::seconds(31));

    let reply = op.expect("a1");
    let mutation = coordinator.mutate(&op, input("a1", "approved"));
    for _ in 0..2 {
      assert_eq!(cache.read(&detail("a1")).data.unwrap()["status"], "approved");
      tokio::task::yield_now().await;
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    reply.send(Err(SyncError::transport(Some(500), "boom"))).unwrap();
    assert!(mutation.await.is_err());

    // Rolled back to the stale entry, which now refetches.
    sub.wait_for(|e| e.status == EntryStatus::Success).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(cache.read(&detail("a1")).data.unwrap()["status"], "pending");
  }

  #[tokio::test]
  async fn test_missing_entry_skips_patch() {
    let (cache, coordinator, op) = setup();
    let reply = op.expect("a9");

    let mutation = coordinator.mutate(&op, input("a9", "approved"));
    assert_eq!(cache.read(&detail("a9")).data, None);

    reply.send(Ok(json!({"id": "a9", "status": "approved"}))).unwrap();
    mutation.await.unwrap();
    assert_eq!(
      cache.read(&detail("a9")).data,
      Some(json!({"id": "a9", "status": "approved"}))
    );
  }
}
