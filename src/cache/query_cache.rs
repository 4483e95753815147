//! The query cache: keyed results with staleness, request deduplication,
//! cancellation and subscriber notification.

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryStatus};
use super::key::CacheKey;
use super::storage::{NoopStore, Snapshot, SnapshotStore};
use crate::cancel::CancelSignal;
use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;

/// A type-erased load: produces the JSON form of a resource.
pub type LoadFuture = BoxFuture<'static, Result<Value, SyncError>>;

/// A reusable loader registered by subscribers for background refetches.
pub type Refetcher = Arc<dyn Fn(CancelSignal) -> LoadFuture + Send + Sync>;

type SharedLoad = Shared<LoadFuture>;

/// How long entries stay fresh, per resource domain.
#[derive(Debug, Clone)]
pub struct StalePolicy {
  default: Duration,
  per_domain: HashMap<String, Duration>,
}

impl StalePolicy {
  pub fn new(default: Duration) -> Self {
    Self {
      default,
      per_domain: HashMap::new(),
    }
  }

  pub fn with_domain(mut self, domain: &str, stale_after: Duration) -> Self {
    self.per_domain.insert(domain.to_string(), stale_after);
    self
  }

  pub fn for_key(&self, key: &CacheKey) -> Duration {
    key
      .domain()
      .and_then(|d| self.per_domain.get(d))
      .copied()
      .unwrap_or(self.default)
  }
}

impl Default for StalePolicy {
  fn default() -> Self {
    Self::new(Duration::seconds(30))
  }
}

/// The single in-flight load for a key.
struct Flight {
  generation: u64,
  signal: CancelSignal,
  shared: SharedLoad,
  prior_status: EntryStatus,
  /// Callers awaiting the result. Background loads have none.
  consumers: usize,
}

struct Slot {
  entry: CacheEntry,
  flight: Option<Flight>,
  subscribers: usize,
  refetcher: Option<Refetcher>,
  /// Mutations currently editing this entry. While nonzero, loads never
  /// land in the entry and stale reads do not refetch.
  holds: usize,
  tx: watch::Sender<CacheEntry>,
}

impl Slot {
  fn new(entry: CacheEntry) -> Self {
    let (tx, _) = watch::channel(entry.clone());
    Self {
      entry,
      flight: None,
      subscribers: 0,
      refetcher: None,
      holds: 0,
      tx,
    }
  }

  fn publish(&self) {
    self.tx.send_replace(self.entry.clone());
  }

  /// Drop the in-flight load and put the entry back as it was.
  fn abort_flight(&mut self) -> bool {
    match self.flight.take() {
      Some(flight) => {
        flight.signal.cancel();
        self.entry.status = flight.prior_status;
        self.publish();
        true
      }
      None => false,
    }
  }

  /// Let the in-flight load finish for its waiters without storing its
  /// result in the entry.
  fn detach_flight(&mut self) -> bool {
    match self.flight.take() {
      Some(flight) => {
        if flight.consumers == 0 {
          // Background refetch; nobody is waiting on it.
          flight.signal.cancel();
        }
        if self.entry.status == EntryStatus::Loading {
          self.entry.status = flight.prior_status;
        }
        true
      }
      None => false,
    }
  }

  fn wants_background_refetch(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
    self.subscribers > 0
      && self.holds == 0
      && self.flight.is_none()
      && self.refetcher.is_some()
      && self.entry.is_stale(now)
  }
}

#[derive(Default)]
struct State {
  slots: HashMap<CacheKey, Slot>,
  next_generation: u64,
}

/// Everything a freshly registered flight needs to be driven.
struct Launch {
  key: CacheKey,
  generation: u64,
  signal: CancelSignal,
  tx: oneshot::Sender<Result<Value, SyncError>>,
}

enum Plan {
  Ready(Value),
  Join(SharedLoad, u64),
  Start(SharedLoad, Launch),
}

struct Inner {
  state: Mutex<State>,
  clock: Arc<dyn Clock>,
  policy: StalePolicy,
  store: Arc<dyn SnapshotStore>,
}

/// Keyed store of fetched results.
///
/// Cloning is cheap; every clone shares the same entries. Construct one per
/// process (or per session) and hand it to every component that needs it.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

/// Builder for [`QueryCache`].
pub struct QueryCacheBuilder {
  clock: Arc<dyn Clock>,
  policy: StalePolicy,
  store: Arc<dyn SnapshotStore>,
}

impl QueryCacheBuilder {
  pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  pub fn policy(mut self, policy: StalePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn store(mut self, store: impl SnapshotStore + 'static) -> Self {
    self.store = Arc::new(store);
    self
  }

  pub fn build(self) -> QueryCache {
    QueryCache {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        clock: self.clock,
        policy: self.policy,
        store: self.store,
      }),
    }
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::builder().build()
  }
}

impl QueryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn builder() -> QueryCacheBuilder {
    QueryCacheBuilder {
      clock: Arc::new(SystemClock),
      policy: StalePolicy::default(),
      store: Arc::new(NoopStore),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get (or create) the slot for a key, hydrating it from the snapshot
  /// store on first access.
  fn slot<'a>(&self, state: &'a mut State, key: &CacheKey) -> &'a mut Slot {
    state.slots.entry(key.clone()).or_insert_with(|| {
      let mut entry = CacheEntry::idle(key.clone(), self.inner.policy.for_key(key));
      match self.inner.store.load(key) {
        Ok(Some(snapshot)) => {
          debug!(key = %key, "hydrated entry from snapshot store");
          entry.store_success(snapshot.data, snapshot.fetched_at);
          // Persisted data is last-known, never authoritative for this session.
          entry.invalidated = true;
        }
        Ok(None) => {}
        Err(e) => warn!(key = %key, error = %e, "failed to load snapshot"),
      }
      Slot::new(entry)
    })
  }

  /// Register a new flight on `slot`. The caller must launch it after
  /// releasing the lock.
  fn register_flight(slot: &mut Slot, generation: u64, consumers: usize) -> (SharedLoad, Launch) {
    let signal = CancelSignal::new();
    let (tx, rx) = oneshot::channel();
    let shared = async move { rx.await.unwrap_or(Err(SyncError::Cancelled)) }
      .boxed()
      .shared();

    slot.flight = Some(Flight {
      generation,
      signal: signal.clone(),
      shared: shared.clone(),
      prior_status: slot.entry.status,
      consumers,
    });
    slot.entry.status = EntryStatus::Loading;
    slot.publish();

    let launch = Launch {
      key: slot.entry.key.clone(),
      generation,
      signal,
      tx,
    };
    (shared, launch)
  }

  /// Drive a registered flight to completion on the runtime.
  fn launch(&self, launch: Launch, load: LoadFuture) {
    let Launch {
      key,
      generation,
      signal,
      tx,
    } = launch;

    let handle = match tokio::runtime::Handle::try_current() {
      Ok(handle) => handle,
      Err(_) => {
        warn!(key = %key, "no async runtime available, dropping load");
        self.abort_generation(&key, generation);
        return;
      }
    };

    debug!(key = %key, generation, "load started");
    let cache = self.clone();
    handle.spawn(async move {
      // Dropping `load` on cancellation aborts the underlying request.
      let result = signal.run(load).await;
      cache.settle(&key, generation, &result);
      let _ = tx.send(result);
    });
  }

  fn abort_generation(&self, key: &CacheKey, generation: u64) {
    let mut state = self.lock();
    if let Some(slot) = state.slots.get_mut(key) {
      if slot.flight.as_ref().map(|f| f.generation) == Some(generation) {
        slot.abort_flight();
      }
    }
  }

  /// Store the outcome of a flight, unless it was superseded or cancelled.
  fn settle(&self, key: &CacheKey, generation: u64, result: &Result<Value, SyncError>) {
    let now = self.inner.clock.now();
    let mut state = self.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    if slot.flight.as_ref().map(|f| f.generation) != Some(generation) {
      debug!(key = %key, generation, "discarding late response");
      return;
    }
    let Some(flight) = slot.flight.take() else {
      return;
    };

    match result {
      Ok(data) => {
        slot.entry.store_success(data.clone(), now);
        self.persist(key, data, now);
        debug!(key = %key, "load succeeded");
      }
      Err(e) if e.is_cancellation() => {
        slot.entry.status = flight.prior_status;
      }
      Err(e) => {
        warn!(key = %key, error = %e, "load failed");
        slot.entry.store_failure(e.clone());
      }
    }
    slot.publish();
  }

  fn persist(&self, key: &CacheKey, data: &Value, fetched_at: chrono::DateTime<chrono::Utc>) {
    let snapshot = Snapshot {
      data: data.clone(),
      fetched_at,
    };
    if let Err(e) = self.inner.store.save(key, &snapshot) {
      warn!(key = %key, error = %e, "failed to persist snapshot");
    }
  }

  /// A consumer of `generation` went away before the result arrived.
  fn release_consumer(&self, key: &CacheKey, generation: u64) {
    let mut state = self.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    let abandoned = match slot.flight.as_mut() {
      Some(flight) if flight.generation == generation => {
        flight.consumers = flight.consumers.saturating_sub(1);
        flight.consumers == 0 && slot.subscribers == 0
      }
      _ => false,
    };
    if abandoned {
      debug!(key = %key, generation, "all consumers gone, cancelling load");
      slot.abort_flight();
    }
  }

  fn plan(&self, key: &CacheKey, force: bool) -> Plan {
    let now = self.inner.clock.now();
    let mut state = self.lock();
    state.next_generation += 1;
    let generation = state.next_generation;
    let slot = self.slot(&mut state, key);

    if let Some(flight) = slot.flight.as_mut() {
      flight.consumers += 1;
      return Plan::Join(flight.shared.clone(), flight.generation);
    }
    if slot.holds > 0 {
      // A load now would race the edit; serve what the entry shows.
      if let Some(data) = &slot.entry.data {
        return Plan::Ready(data.clone());
      }
    }
    if !force {
      if let Some(data) = slot.entry.fresh_data(now) {
        return Plan::Ready(data.clone());
      }
    }
    let (shared, launch) = Self::register_flight(slot, generation, 1);
    Plan::Start(shared, launch)
  }

  async fn run_load<F>(&self, key: &CacheKey, force: bool, loader: F) -> Result<Value, SyncError>
  where
    F: FnOnce(CancelSignal) -> LoadFuture,
  {
    let (shared, generation) = match self.plan(key, force) {
      Plan::Ready(data) => return Ok(data),
      Plan::Join(shared, generation) => (shared, generation),
      Plan::Start(shared, launch) => {
        let generation = launch.generation;
        let load = loader(launch.signal.clone());
        self.launch(launch, load);
        (shared, generation)
      }
    };

    let mut guard = ConsumerGuard {
      cache: self,
      key,
      generation,
      armed: true,
    };
    let result = shared.await;
    guard.armed = false;
    result
  }

  /// Return the entry for `key`, creating an idle one if absent.
  ///
  /// Reading a stale entry that has subscribers schedules a background
  /// refetch; the stale data is still returned.
  pub fn read(&self, key: &CacheKey) -> CacheEntry {
    let now = self.inner.clock.now();
    let mut state = self.lock();
    state.next_generation += 1;
    let generation = state.next_generation;
    let slot = self.slot(&mut state, key);

    let background = if slot.wants_background_refetch(now) {
      let refetcher = slot.refetcher.clone();
      let (_, launch) = Self::register_flight(slot, generation, 0);
      refetcher.map(|r| (r, launch))
    } else {
      None
    };
    let entry = slot.entry.clone();
    drop(state);

    if let Some((refetcher, launch)) = background {
      let load = refetcher(launch.signal.clone());
      self.launch(launch, load);
    }
    entry
  }

  /// Fetch raw JSON for `key`, deduplicating with any in-flight load.
  pub async fn fetch_value<F>(&self, key: &CacheKey, loader: F) -> Result<Value, SyncError>
  where
    F: FnOnce(CancelSignal) -> LoadFuture,
  {
    self.run_load(key, false, loader).await
  }

  /// Return fresh cached data, or run `loader` and cache its result.
  ///
  /// Concurrent calls for the same key share a single `loader` invocation.
  /// On failure the previous data is kept and the error is returned.
  pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, loader: F) -> Result<T, SyncError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let value = self.run_load(key, false, erase(loader)).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Like [`fetch`](Self::fetch) but ignores freshness. Still joins an
  /// in-flight load rather than starting a second one.
  pub async fn refresh<T, F, Fut>(&self, key: &CacheKey, loader: F) -> Result<T, SyncError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let value = self.run_load(key, true, erase(loader)).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Set an entry's data directly, without a network round trip.
  pub fn write_value(&self, key: &CacheKey, data: Value) {
    let now = self.inner.clock.now();
    let mut state = self.lock();
    let slot = self.slot(&mut state, key);
    slot.entry.store_success(data.clone(), now);
    slot.publish();
    drop(state);

    self.persist(key, &data, now);
    debug!(key = %key, "entry written");
  }

  /// Typed variant of [`write_value`](Self::write_value).
  pub fn write<T: Serialize>(&self, key: &CacheKey, data: &T) -> Result<(), SyncError> {
    self.write_value(key, serde_json::to_value(data)?);
    Ok(())
  }

  /// Mark every entry under `scope` stale. Returns how many matched.
  pub fn invalidate(&self, scope: &CacheKey) -> usize {
    self.invalidate_many(std::slice::from_ref(scope))
  }

  /// Invalidate several scopes in a single pass over the entries.
  ///
  /// Subscribed entries start a background refetch immediately.
  pub fn invalidate_many(&self, scopes: &[CacheKey]) -> usize {
    let now = self.inner.clock.now();
    let mut launches = Vec::new();
    let mut matched = 0;
    {
      let mut state = self.lock();
      let mut generation = state.next_generation;
      for (key, slot) in state.slots.iter_mut() {
        if !scopes.iter().any(|scope| key.starts_with(scope)) {
          continue;
        }
        matched += 1;
        slot.entry.invalidated = true;
        if slot.wants_background_refetch(now) {
          generation += 1;
          let refetcher = slot.refetcher.clone();
          let (_, launch) = Self::register_flight(slot, generation, 0);
          if let Some(refetcher) = refetcher {
            launches.push((refetcher, launch));
          }
        } else {
          slot.publish();
        }
      }
      state.next_generation = generation;
    }

    debug!(scopes = scopes.len(), matched, refetching = launches.len(), "invalidated");
    for (refetcher, launch) in launches {
      let load = refetcher(launch.signal.clone());
      self.launch(launch, load);
    }
    matched
  }

  /// Subscribe to changes of `key`.
  ///
  /// `loader` becomes the entry's refetcher: it runs now if the entry is
  /// stale, and again whenever the entry is invalidated or read while stale.
  pub fn subscribe<T, F, Fut>(&self, key: &CacheKey, loader: F) -> Subscription
  where
    T: Serialize + Send + 'static,
    F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let refetcher: Refetcher = Arc::new(move |signal| {
      let fut = loader(signal);
      async move { Ok(serde_json::to_value(fut.await?)?) }.boxed()
    });

    let now = self.inner.clock.now();
    let mut state = self.lock();
    state.next_generation += 1;
    let generation = state.next_generation;
    let slot = self.slot(&mut state, key);
    slot.subscribers += 1;
    slot.refetcher = Some(refetcher.clone());
    let rx = slot.tx.subscribe();

    let launch = if slot.wants_background_refetch(now) {
      Some(Self::register_flight(slot, generation, 0).1)
    } else {
      None
    };
    drop(state);

    if let Some(launch) = launch {
      let load = refetcher(launch.signal.clone());
      self.launch(launch, load);
    }

    Subscription {
      cache: self.clone(),
      key: key.clone(),
      rx,
    }
  }

  fn unsubscribe(&self, key: &CacheKey) {
    let mut state = self.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    slot.subscribers = slot.subscribers.saturating_sub(1);
    if slot.subscribers == 0 {
      slot.refetcher = None;
      if slot.flight.as_ref().is_some_and(|f| f.consumers == 0) {
        slot.abort_flight();
      }
    }
  }

  /// Abort the in-flight load for `key`, if any. Waiters receive
  /// [`SyncError::Cancelled`] and the eventual response is discarded.
  pub fn cancel(&self, key: &CacheKey) -> bool {
    let mut state = self.lock();
    match state.slots.get_mut(key) {
      Some(slot) => slot.abort_flight(),
      None => false,
    }
  }

  /// Drop unsubscribed, idle entries not refreshed within `idle_for`.
  pub fn prune(&self, idle_for: Duration) -> usize {
    let now = self.inner.clock.now();
    let mut state = self.lock();
    let before = state.slots.len();
    state.slots.retain(|_, slot| {
      slot.subscribers > 0
        || slot.holds > 0
        || slot.flight.is_some()
        || slot
          .entry
          .fetched_at
          .is_some_and(|at| now - at <= idle_for)
    });
    before - state.slots.len()
  }

  /// Start editing the entry for `key` on behalf of a mutation. Nothing done
  /// through `hold` or `release` is persisted.
  ///
  /// Any in-flight load is detached: its waiters still receive the loaded
  /// value, but the entry keeps the edit. Until the matching
  /// [`release`](Self::release), stale reads and invalidations of this entry
  /// do not refetch.
  pub(crate) fn hold<R>(&self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
    let mut state = self.lock();
    let slot = self.slot(&mut state, key);
    if slot.detach_flight() {
      debug!(key = %key, "detached in-flight load for optimistic edit");
    }
    slot.holds += 1;
    let result = f(&mut slot.entry);
    slot.publish();
    result
  }

  /// Finish an edit started with [`hold`](Self::hold).
  ///
  /// Once the last hold is gone, a subscribed entry that is still stale is
  /// refetched.
  pub(crate) fn release<R>(&self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
    let now = self.inner.clock.now();
    let mut state = self.lock();
    state.next_generation += 1;
    let generation = state.next_generation;
    let slot = self.slot(&mut state, key);
    let result = f(&mut slot.entry);
    slot.holds = slot.holds.saturating_sub(1);

    let mut background = None;
    if slot.holds == 0 {
      // A load started during the edit saw pre-edit server state.
      slot.detach_flight();
      if slot.wants_background_refetch(now) {
        let refetcher = slot.refetcher.clone();
        let (_, launch) = Self::register_flight(slot, generation, 0);
        background = refetcher.map(|r| (r, launch));
      }
    }
    if background.is_none() {
      slot.publish();
    }
    drop(state);

    if let Some((refetcher, launch)) = background {
      debug!(key = %key, "running refetch deferred by edit");
      let load = refetcher(launch.signal.clone());
      self.launch(launch, load);
    }
    result
  }

  pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
    self.inner.clock.now()
  }

  /// Keys currently held, for diagnostics.
  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock().slots.keys().cloned().collect()
  }
}

/// Turn a typed loader into one producing JSON.
fn erase<T, F, Fut>(loader: F) -> impl FnOnce(CancelSignal) -> LoadFuture
where
  T: Serialize + Send + 'static,
  F: FnOnce(CancelSignal) -> Fut,
  Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
{
  move |signal| {
    let fut = loader(signal);
    async move { Ok(serde_json::to_value(fut.await?)?) }.boxed()
  }
}

/// Releases a fetch consumer if its future is dropped before completion.
struct ConsumerGuard<'a> {
  cache: &'a QueryCache,
  key: &'a CacheKey,
  generation: u64,
  armed: bool,
}

impl Drop for ConsumerGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      self.cache.release_consumer(self.key, self.generation);
    }
  }
}

/// A live view of one entry. Dropping it unregisters the refetcher.
pub struct Subscription {
  cache: QueryCache,
  key: CacheKey,
  rx: watch::Receiver<CacheEntry>,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// The entry as of the last notification.
  pub fn current(&self) -> CacheEntry {
    self.rx.borrow().clone()
  }

  /// Wait for the next change. Returns `None` once the entry is gone.
  pub async fn changed(&mut self) -> Option<CacheEntry> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Wait until the entry satisfies `predicate`.
  pub async fn wait_for(&mut self, predicate: impl Fn(&CacheEntry) -> bool) -> Option<CacheEntry> {
    let entry = self.rx.wait_for(|e| predicate(e)).await.ok()?;
    Some(entry.clone())
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cache.unsubscribe(&self.key);
  }
}
