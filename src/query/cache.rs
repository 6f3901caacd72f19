//! The entity cache: a keyed store of server-state snapshots.
//!
//! Every piece of fetched data lives in exactly one [`QueryCache`] entry.
//! Components never touch entries directly; they go through `get`, `set`,
//! `invalidate` and `cancel` (plus the snapshot/restore pair used for
//! optimistic rollback).
//!
//! Entries are type-erased so one cache can hold task pages, infinite page
//! sequences and user profiles side by side. Readers ask for a concrete type
//! and get `None` on a mismatch.
//!
//! All cache state sits behind one `std::sync::Mutex`, which is never held
//! across an `.await`. In-flight fetches run as spawned Tokio tasks and commit
//! their result only if they are still the current fetch for their key and
//! have not been cancelled.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::state::QueryStatus;
use crate::error::{ApiError, QueryError};

pub(crate) type ErasedData = Arc<dyn Any + Send + Sync>;

/// A deduplicated in-flight fetch; every subscriber awaits a clone.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<ErasedData, QueryError>>>;

/// Starts a background refetch of an observed entry after invalidation.
pub(crate) type RefetchHook = Arc<dyn Fn(&QueryCache) + Send + Sync>;

/// Folds a fetched page into whatever the entry holds at commit time.
pub(crate) type Merge = Box<dyn FnOnce(Option<&ErasedData>) -> ErasedData + Send>;

pub(crate) type FetchJob = BoxFuture<'static, Result<Fetched, QueryError>>;

/// Result of a successful fetch job.
pub(crate) enum Fetched {
  Replace(ErasedData),
  Merge(Merge),
}

const EVENT_CAPACITY: usize = 256;

/// Tunables shared by every query run against a cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// How long fetched data is considered fresh
  pub stale_time: Duration,
  /// How long an unobserved entry is kept before eviction
  pub gc_time: Duration,
  /// Extra attempts for a failed read
  pub retry: u32,
  /// Delay before the first retry; doubles on each further attempt
  pub retry_delay: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::from_secs(5 * 60),
      retry: 2,
      retry_delay: Duration::from_secs(1),
    }
  }
}

/// Notifications published on every change to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  Updated(CacheKey),
  Invalidated(CacheKey),
  Removed(CacheKey),
}

impl CacheEvent {
  pub fn key(&self) -> &CacheKey {
    match self {
      CacheEvent::Updated(k) | CacheEvent::Invalidated(k) | CacheEvent::Removed(k) => k,
    }
  }
}

/// What kind of fetch is in flight for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
  /// Initial load or refetch of the whole entry
  Refresh,
  /// Appending the next page of an infinite query
  NextPage,
}

/// Metadata of an entry, without its data.
#[derive(Debug, Clone)]
pub struct EntryState {
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub updated_at: Option<Instant>,
  pub is_stale: bool,
  pub observers: usize,
  pub fetch: Option<FetchKind>,
  pub has_data: bool,
}

/// Data of every entry under a prefix, captured for an exact rollback.
#[derive(Clone, Default)]
pub struct CacheSnapshot {
  entries: Vec<(CacheKey, Option<ErasedData>)>,
}

impl CacheSnapshot {
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.entries.iter().map(|(k, _)| k)
  }
}

impl std::fmt::Debug for CacheSnapshot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheSnapshot")
      .field("keys", &self.keys().collect::<Vec<_>>())
      .finish()
  }
}

struct InFlight {
  id: u64,
  kind: FetchKind,
  token: CancellationToken,
  future: SharedFetch,
}

struct Entry {
  data: Option<ErasedData>,
  status: QueryStatus,
  error: Option<QueryError>,
  updated_at: Option<Instant>,
  /// `None` until the first successful write: no data is always stale
  stale_at: Option<Instant>,
  stale_time: Duration,
  /// Observer id -> refetch hook (`None` for disabled observers)
  observers: HashMap<u64, Option<RefetchHook>>,
  gc: Option<JoinHandle<()>>,
  gc_at: Option<Instant>,
  in_flight: Option<InFlight>,
}

impl Entry {
  fn new(stale_time: Duration) -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      updated_at: None,
      stale_at: None,
      stale_time,
      observers: HashMap::new(),
      gc: None,
      gc_at: None,
      in_flight: None,
    }
  }

  fn is_stale(&self, now: Instant) -> bool {
    self.stale_at.map_or(true, |at| now >= at)
  }

  /// A successful write; any earlier fetch error is cleared.
  fn write(&mut self, data: ErasedData, now: Instant) {
    self.data = Some(data);
    self.error = None;
    self.updated_at = Some(now);
    self.stale_at = Some(now + self.stale_time);
    self.status = if self.in_flight.is_some() {
      QueryStatus::Fetching
    } else {
      QueryStatus::Success
    };
  }

  /// Status to fall back to once nothing is in flight any more.
  fn settled_status(&self) -> QueryStatus {
    if self.error.is_some() {
      QueryStatus::Error
    } else if self.data.is_some() {
      QueryStatus::Success
    } else {
      QueryStatus::Idle
    }
  }

  fn state(&self, now: Instant) -> EntryState {
    EntryState {
      status: self.status,
      error: self.error.clone(),
      updated_at: self.updated_at,
      is_stale: self.is_stale(now),
      observers: self.observers.len(),
      fetch: self.in_flight.as_ref().map(|f| f.kind),
      has_data: self.data.is_some(),
    }
  }
}

struct Inner {
  entries: Mutex<HashMap<CacheKey, Entry>>,
  events: broadcast::Sender<CacheEvent>,
  config: CacheConfig,
  next_id: AtomicU64,
}

/// Process-wide store of server-state snapshots.
///
/// Cheap to clone; all clones share the same entries. Fetching and garbage
/// collection spawn Tokio tasks, so those operations must run inside a
/// runtime.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl QueryCache {
  pub fn new(config: CacheConfig) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(HashMap::new()),
        events,
        config,
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  /// Subscribe to change notifications for every entry.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
    self
      .inner
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }

  pub(crate) fn next_id(&self) -> u64 {
    self.inner.next_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Data of an entry, if present and of type `T`.
  pub fn get<T: Clone + 'static>(&self, key: &CacheKey) -> Option<T> {
    self
      .entries()
      .get(key)?
      .data
      .as_ref()?
      .downcast_ref::<T>()
      .cloned()
  }

  /// Metadata of an entry.
  pub fn state(&self, key: &CacheKey) -> Option<EntryState> {
    let now = Instant::now();
    self.entries().get(key).map(|e| e.state(now))
  }

  /// Metadata and typed data of an entry, read atomically.
  pub fn read<T: Clone + 'static>(&self, key: &CacheKey) -> Option<(EntryState, Option<T>)> {
    let now = Instant::now();
    let entries = self.entries();
    let entry = entries.get(key)?;
    let data = entry
      .data
      .as_ref()
      .and_then(|d| d.downcast_ref::<T>())
      .cloned();
    Some((entry.state(now), data))
  }

  /// Keys of every entry under `prefix`.
  pub fn keys(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self
      .entries()
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Replace an entry's data, creating the entry if needed.
  pub fn set<T: Send + Sync + 'static>(&self, key: CacheKey, data: T) {
    self.set_erased(key, Arc::new(data));
  }

  fn set_erased(&self, key: CacheKey, data: ErasedData) {
    let now = Instant::now();
    {
      let mut entries = self.entries();
      let stale_time = self.inner.config.stale_time;
      let entry = entries
        .entry(key.clone())
        .or_insert_with(|| Entry::new(stale_time));
      entry.write(data, now);
      self.schedule_gc(&key, entry);
    }
    debug!(%key, "cache entry set");
    self.emit(CacheEvent::Updated(key));
  }

  /// Rewrite an entry's data with `f`. Entries that are absent, empty or hold
  /// another type are left alone, as are entries for which `f` returns `None`.
  ///
  /// `f` runs under the cache lock and must not call back into the cache.
  pub fn update<T, F>(&self, key: &CacheKey, f: F) -> bool
  where
    T: Send + Sync + 'static,
    F: FnOnce(&T) -> Option<T>,
  {
    let mut f = Some(f);
    self.update_all::<T, _>(key, |k, old| {
      if k != key {
        return None;
      }
      f.take().and_then(|f| f(old))
    }) > 0
  }

  /// [`update`](Self::update) every entry under `prefix`; returns how many
  /// entries were rewritten.
  pub fn update_all<T, F>(&self, prefix: &CacheKey, mut f: F) -> usize
  where
    T: Send + Sync + 'static,
    F: FnMut(&CacheKey, &T) -> Option<T>,
  {
    let now = Instant::now();
    let mut updated = Vec::new();
    {
      let mut entries = self.entries();
      for (key, entry) in entries.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
        let Some(old) = entry.data.as_ref().and_then(|d| d.downcast_ref::<T>()) else {
          continue;
        };
        if let Some(new) = f(key, old) {
          entry.write(Arc::new(new), now);
          self.schedule_gc(key, entry);
          updated.push(key.clone());
        }
      }
    }
    let count = updated.len();
    for key in updated {
      self.emit(CacheEvent::Updated(key));
    }
    count
  }

  /// Mark every entry under `prefix` stale. Observed entries are refetched
  /// in the background right away, superseding any fetch already in flight.
  pub fn invalidate(&self, prefix: &CacheKey) -> usize {
    let now = Instant::now();
    let mut keys = Vec::new();
    let mut hooks = Vec::new();
    {
      let mut entries = self.entries();
      for (key, entry) in entries.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
        entry.stale_at = Some(now);
        keys.push(key.clone());
        if let Some(hook) = entry.observers.values().flatten().next() {
          hooks.push(hook.clone());
        }
      }
    }
    debug!(%prefix, entries = keys.len(), refetching = hooks.len(), "invalidated");
    for key in &keys {
      self.emit(CacheEvent::Invalidated(key.clone()));
    }
    for hook in hooks {
      hook(self);
    }
    keys.len()
  }

  /// Abort every in-flight fetch under `prefix`. Their results are discarded
  /// even if they arrive later.
  pub fn cancel(&self, prefix: &CacheKey) -> usize {
    let mut cancelled = Vec::new();
    {
      let mut entries = self.entries();
      for (key, entry) in entries.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
        if let Some(fetch) = entry.in_flight.take() {
          fetch.token.cancel();
          entry.status = entry.settled_status();
          cancelled.push(key.clone());
        }
      }
    }
    if !cancelled.is_empty() {
      debug!(%prefix, fetches = cancelled.len(), "cancelled in-flight fetches");
    }
    let count = cancelled.len();
    for key in cancelled {
      self.emit(CacheEvent::Updated(key));
    }
    count
  }

  /// Drop every entry under `prefix`, cancelling their fetches.
  pub fn remove(&self, prefix: &CacheKey) -> usize {
    let removed: Vec<(CacheKey, Entry)> = {
      let mut entries = self.entries();
      let keys: Vec<CacheKey> = entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      keys
        .into_iter()
        .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
        .collect()
    };
    let count = removed.len();
    for (key, entry) in removed {
      release(entry);
      self.emit(CacheEvent::Removed(key));
    }
    count
  }

  /// Capture the data of every entry under `prefix`.
  pub fn snapshot(&self, prefix: &CacheKey) -> CacheSnapshot {
    let entries = self
      .entries()
      .iter()
      .filter(|(k, _)| k.starts_with(prefix))
      .map(|(k, e)| (k.clone(), e.data.clone()))
      .collect();
    CacheSnapshot { entries }
  }

  /// Put back exactly the data captured by [`snapshot`](Self::snapshot).
  /// Entries that were empty at snapshot time are emptied again.
  pub fn restore(&self, snapshot: &CacheSnapshot) {
    let now = Instant::now();
    let mut keys = Vec::new();
    {
      let mut entries = self.entries();
      let stale_time = self.inner.config.stale_time;
      for (key, data) in &snapshot.entries {
        let entry = entries
          .entry(key.clone())
          .or_insert_with(|| Entry::new(stale_time));
        match data {
          Some(data) => entry.write(data.clone(), now),
          None => {
            entry.data = None;
            entry.updated_at = None;
            entry.stale_at = None;
            entry.status = if entry.in_flight.is_some() {
              QueryStatus::Fetching
            } else {
              entry.settled_status()
            };
          }
        }
        self.schedule_gc(key, entry);
        keys.push(key.clone());
      }
    }
    debug!(entries = keys.len(), "restored snapshot");
    for key in keys {
      self.emit(CacheEvent::Updated(key));
    }
  }

  /// Register an observer of `key`. A pending eviction is called off.
  pub(crate) fn attach(&self, key: &CacheKey, observer: u64, refetch: Option<RefetchHook>) {
    let mut entries = self.entries();
    let stale_time = self.inner.config.stale_time;
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| Entry::new(stale_time));
    if let Some(gc) = entry.gc.take() {
      gc.abort();
    }
    entry.gc_at = None;
    entry.observers.insert(observer, refetch);
  }

  /// Unregister an observer; the last one leaving schedules eviction.
  pub(crate) fn detach(&self, key: &CacheKey, observer: u64) {
    let mut entries = self.entries();
    if let Some(entry) = entries.get_mut(key) {
      entry.observers.remove(&observer);
      self.schedule_gc(key, entry);
    }
  }

  /// (Re)start the eviction timer of an unobserved entry. Every write to
  /// an idle entry pushes its eviction a full `gc_time` out.
  fn schedule_gc(&self, key: &CacheKey, entry: &mut Entry) {
    if !entry.observers.is_empty() {
      return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };
    if let Some(gc) = entry.gc.take() {
      gc.abort();
    }
    let cache = Arc::downgrade(&self.inner);
    let gc_time = self.inner.config.gc_time;
    let deadline = Instant::now() + gc_time;
    entry.gc_at = Some(deadline);
    let key = key.clone();
    entry.gc = Some(runtime.spawn(async move {
      tokio::time::sleep_until(deadline).await;
      if let Some(inner) = cache.upgrade() {
        QueryCache { inner }.collect(&key, deadline);
      }
    }));
  }

  fn collect(&self, key: &CacheKey, deadline: Instant) {
    let removed = {
      let mut entries = self.entries();
      match entries.get(key) {
        // A timer that lost the race with a reschedule leaves the entry alone
        Some(entry) if entry.observers.is_empty() && entry.gc_at == Some(deadline) => {
          entries.remove(key)
        }
        _ => None,
      }
    };
    if let Some(mut entry) = removed {
      // This task is the gc task itself
      entry.gc = None;
      release(entry);
      debug!(%key, "evicted idle entry");
      self.emit(CacheEvent::Removed(key.clone()));
    }
  }

  /// The fetch currently in flight for `key`, if any.
  pub(crate) fn in_flight(&self, key: &CacheKey) -> Option<SharedFetch> {
    self
      .entries()
      .get(key)?
      .in_flight
      .as_ref()
      .map(|f| f.future.clone())
  }

  /// Start (or join) a fetch for `key`.
  ///
  /// Without `force`, an in-flight fetch is shared. With `force`, it is
  /// cancelled and superseded. The job runs on a spawned task so the result
  /// is committed even if nobody awaits it.
  pub(crate) fn start_fetch<J>(
    &self,
    key: &CacheKey,
    kind: FetchKind,
    force: bool,
    stale_time: Option<Duration>,
    job: J,
  ) -> SharedFetch
  where
    J: FnOnce(CancellationToken) -> FetchJob + Send + 'static,
  {
    let future = {
      let mut entries = self.entries();
      let default_stale = self.inner.config.stale_time;
      let entry = entries
        .entry(key.clone())
        .or_insert_with(|| Entry::new(default_stale));
      if let Some(stale_time) = stale_time {
        entry.stale_time = stale_time;
      }

      if let Some(current) = &entry.in_flight {
        if !force {
          debug!(%key, fetch = current.id, "joining in-flight fetch");
          return current.future.clone();
        }
        debug!(%key, fetch = current.id, "superseding in-flight fetch");
        current.token.cancel();
      }

      let id = self.next_id();
      let token = CancellationToken::new();
      let cache = self.clone();
      let task_key = key.clone();
      let task_token = token.clone();
      let task = tokio::spawn(async move {
        let job = job(task_token.clone());
        let outcome = tokio::select! {
          biased;
          _ = task_token.cancelled() => Err(Arc::new(ApiError::Cancelled)),
          outcome = job => outcome,
        };
        cache.commit(&task_key, id, &task_token, outcome)
      });
      let future = async move {
        match task.await {
          Ok(result) => result,
          Err(e) => Err(Arc::new(ApiError::Other(format!("fetch task failed: {}", e)))),
        }
      }
      .boxed()
      .shared();

      debug!(%key, fetch = id, ?kind, "fetch started");
      entry.in_flight = Some(InFlight {
        id,
        kind,
        token,
        future: future.clone(),
      });
      entry.status = QueryStatus::Fetching;
      future
    };
    self.emit(CacheEvent::Updated(key.clone()));
    future
  }

  /// Write a finished fetch into its entry, unless it was cancelled or
  /// superseded in the meantime.
  fn commit(
    &self,
    key: &CacheKey,
    id: u64,
    token: &CancellationToken,
    outcome: Result<Fetched, QueryError>,
  ) -> Result<ErasedData, QueryError> {
    let now = Instant::now();
    let result = {
      let mut entries = self.entries();
      let current = entries
        .get_mut(key)
        .filter(|e| e.in_flight.as_ref().is_some_and(|f| f.id == id));
      let entry = match current {
        Some(entry) if !token.is_cancelled() => entry,
        _ => {
          debug!(%key, fetch = id, "discarding result of cancelled fetch");
          return Err(Arc::new(ApiError::Cancelled));
        }
      };
      entry.in_flight = None;

      let result = match outcome {
        Ok(fetched) => {
          let data = match fetched {
            Fetched::Replace(data) => data,
            Fetched::Merge(merge) => merge(entry.data.as_ref()),
          };
          entry.write(data.clone(), now);
          debug!(%key, fetch = id, "fetch committed");
          Ok(data)
        }
        Err(error) => {
          warn!(%key, fetch = id, %error, "fetch failed, keeping previous data");
          entry.error = Some(error.clone());
          entry.status = QueryStatus::Error;
          Err(error)
        }
      };
      self.schedule_gc(key, entry);
      result
    };
    self.emit(CacheEvent::Updated(key.clone()));
    result
  }
}

fn release(entry: Entry) {
  if let Some(fetch) = entry.in_flight {
    fetch.token.cancel();
  }
  if let Some(gc) = entry.gc {
    gc.abort();
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new(CacheConfig::default())
  }
}

impl std::fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryCache")
      .field("entries", &self.entries().len())
      .field("config", &self.inner.config)
      .finish()
  }
}
