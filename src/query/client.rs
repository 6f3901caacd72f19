//! Query executor: fetches data into the cache and hands out observers.
//!
//! Inspired by TanStack Query. A read is identified by a [`CacheKey`] and a
//! [`Fetcher`]; the executor guarantees at most one in-flight call per key,
//! serves fresh data from the cache without touching the network, retries
//! failed reads a few times, and keeps the last good data when a refetch
//! fails.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let observer = client.watch(
//!     cache_key!["tasks", "list", 1u32],
//!     fetcher(move |ctx| {
//!         let api = api.clone();
//!         async move { api.get_tasks(1, 10, None, &ctx.token).await }
//!     }),
//!     QueryOptions::default(),
//! );
//!
//! // In event loop tick
//! if observer.poll_changed() {
//!     render(observer.result());
//! }
//! ```

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{
  CacheConfig, CacheEvent, ErasedData, FetchKind, Fetched, Merge, QueryCache, RefetchHook,
  SharedFetch,
};
use super::key::CacheKey;
use super::mutation::{self, Mutation, MutationCache};
use super::page::{InfiniteData, PaginatedResult};
use super::state::{QueryResult, QueryStatus};
use crate::error::{ApiError, QueryError};

/// Upper bound for the exponential retry back-off.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Everything a fetch function gets to know about the call it serves.
#[derive(Debug, Clone)]
pub struct FetchContext {
  pub key: CacheKey,
  /// Tripped when the fetch is cancelled or superseded; transports should
  /// abort when it fires.
  pub token: CancellationToken,
  /// Cursor of the requested page, for paginated fetchers
  pub page_param: Option<u32>,
  /// Zero on the first attempt, incremented on each retry
  pub attempt: u32,
}

/// A reusable read operation producing `T`.
pub type Fetcher<T> =
  Arc<dyn Fn(FetchContext) -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

/// Fetcher of one page of a cursor-paginated listing.
pub type PageFetcher<T> = Fetcher<PaginatedResult<Vec<T>>>;

/// Box a closure returning a future into a [`Fetcher`].
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
  Arc::new(move |ctx| f(ctx).boxed())
}

/// Per-query options.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// Disabled queries never touch the network and stay `Idle`
  pub enabled: bool,
  /// Overrides the cache-wide freshness window
  pub stale_time: Option<Duration>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: None,
    }
  }
}

impl QueryOptions {
  pub fn enabled(enabled: bool) -> Self {
    Self {
      enabled,
      ..Self::default()
    }
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }
}

/// Options of an infinite (append-mode) query.
#[derive(Debug, Clone, Copy)]
pub struct InfiniteOptions {
  pub enabled: bool,
  /// Cursor of the first page
  pub initial_page: u32,
  pub stale_time: Option<Duration>,
}

impl Default for InfiniteOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      initial_page: 1,
      stale_time: None,
    }
  }
}

/// Entry point to the cache: reads, observers and mutations.
///
/// Cloning is cheap and every clone shares the same cache, so one instance
/// is wired at startup and handed to whoever needs it.
#[derive(Clone, Debug, Default)]
pub struct QueryClient {
  cache: QueryCache,
  mutations: MutationCache,
}

impl QueryClient {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      cache: QueryCache::new(config),
      mutations: MutationCache::new(),
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn mutations(&self) -> &MutationCache {
    &self.mutations
  }

  /// Data for `key`: from the cache when fresh, otherwise from the network
  /// (sharing any fetch already in flight).
  pub async fn fetch<T>(&self, key: CacheKey, fetcher: Fetcher<T>) -> Result<T, QueryError>
  where
    T: Clone + Send + Sync + 'static,
  {
    if let Some((state, Some(data))) = self.cache.read::<T>(&key) {
      if !state.is_stale {
        return Ok(data);
      }
    }
    let fetch = start_query(&self.cache, &key, fetcher, false, None);
    resolve(&self.cache, &key, fetch).await
  }

  /// Warm the cache for `key`. Never fails and never replaces fresh data.
  pub async fn prefetch<T>(&self, key: CacheKey, fetcher: Fetcher<T>)
  where
    T: Clone + Send + Sync + 'static,
  {
    if let Err(error) = self.fetch(key.clone(), fetcher).await {
      debug!(%key, %error, "prefetch failed");
    }
  }

  /// Fetch `key` from the network even if fresh, superseding any fetch in
  /// flight.
  pub async fn refetch<T>(&self, key: CacheKey, fetcher: Fetcher<T>) -> Result<T, QueryError>
  where
    T: Clone + Send + Sync + 'static,
  {
    let fetch = start_query(&self.cache, &key, fetcher, true, None);
    resolve(&self.cache, &key, fetch).await
  }

  /// Mark entries under `prefix` stale, refetching the observed ones.
  pub fn invalidate(&self, prefix: &CacheKey) -> usize {
    self.cache.invalidate(prefix)
  }

  /// Observe `key`, fetching it when enabled and stale.
  pub fn watch<T>(
    &self,
    key: CacheKey,
    fetcher: Fetcher<T>,
    options: QueryOptions,
  ) -> QueryObserver<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    QueryObserver::new(self.cache.clone(), key, fetcher, options)
  }

  /// Observe an infinite query: one key owning an ordered list of pages.
  pub fn watch_infinite<T>(
    &self,
    key: CacheKey,
    fetcher: PageFetcher<T>,
    options: InfiniteOptions,
  ) -> InfiniteQueryObserver<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    InfiniteQueryObserver::new(self.cache.clone(), key, fetcher, options)
  }

  /// Run a write through the mutation lifecycle.
  pub async fn mutate<M: Mutation>(
    &self,
    mutation: &M,
    variables: M::Variables,
  ) -> Result<M::Output, ApiError> {
    mutation::run(&self.cache, &self.mutations, mutation, variables).await
  }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
  base
    .saturating_mul(2u32.saturating_pow(attempt))
    .min(MAX_RETRY_DELAY)
}

/// Call `fetcher` until it succeeds, the retry budget runs out, the error is
/// final, or `token` fires.
async fn with_retry<T>(
  fetcher: &Fetcher<T>,
  key: &CacheKey,
  page_param: Option<u32>,
  token: &CancellationToken,
  config: &CacheConfig,
) -> Result<T, QueryError> {
  let mut attempt = 0;
  loop {
    let ctx = FetchContext {
      key: key.clone(),
      token: token.child_token(),
      page_param,
      attempt,
    };
    match fetcher(ctx).await {
      Ok(data) => return Ok(data),
      Err(error) if attempt < config.retry && error.is_retryable() => {
        let delay = retry_delay(config.retry_delay, attempt);
        warn!(%key, attempt, ?delay, %error, "fetch failed, retrying");
        tokio::select! {
          _ = token.cancelled() => return Err(Arc::new(ApiError::Cancelled)),
          _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
      }
      Err(error) => return Err(Arc::new(error)),
    }
  }
}

fn downcast<T: Clone + 'static>(data: &ErasedData, key: &CacheKey) -> Result<T, QueryError> {
  data.downcast_ref::<T>().cloned().ok_or_else(|| {
    Arc::new(ApiError::Other(format!(
      "cache entry {} holds a different type",
      key
    )))
  })
}

/// Await a fetch; if it was cancelled in favour of a newer fetch, follow that.
async fn resolve<T: Clone + 'static>(
  cache: &QueryCache,
  key: &CacheKey,
  mut fetch: SharedFetch,
) -> Result<T, QueryError> {
  loop {
    match fetch.await {
      Ok(data) => return downcast(&data, key),
      Err(error) if error.is_cancelled() => match cache.in_flight(key) {
        Some(next) => fetch = next,
        None => return Err(error),
      },
      Err(error) => return Err(error),
    }
  }
}

fn start_query<T>(
  cache: &QueryCache,
  key: &CacheKey,
  fetcher: Fetcher<T>,
  force: bool,
  stale_time: Option<Duration>,
) -> SharedFetch
where
  T: Send + Sync + 'static,
{
  let config = cache.config().clone();
  let job_key = key.clone();
  cache.start_fetch(key, FetchKind::Refresh, force, stale_time, move |token| {
    async move {
      let data = with_retry(&fetcher, &job_key, None, &token, &config).await?;
      Ok(Fetched::Replace(Arc::new(data) as ErasedData))
    }
    .boxed()
  })
}

/// Load (or reload) an infinite query: starting from the initial cursor,
/// fetch as many pages as are currently loaded, following each page's `next`.
fn start_infinite<T>(
  cache: &QueryCache,
  key: &CacheKey,
  fetcher: PageFetcher<T>,
  options: InfiniteOptions,
  force: bool,
) -> SharedFetch
where
  T: Clone + Send + Sync + 'static,
{
  let config = cache.config().clone();
  let job_key = key.clone();
  let loaded = cache
    .get::<InfiniteData<T>>(key)
    .map_or(1, |data| data.pages.len().max(1));
  cache.start_fetch(key, FetchKind::Refresh, force, options.stale_time, move |token| {
    async move {
      let mut data = InfiniteData::default();
      let mut cursor = Some(options.initial_page);
      while let Some(param) = cursor {
        if data.pages.len() >= loaded {
          break;
        }
        let page = with_retry(&fetcher, &job_key, Some(param), &token, &config).await?;
        cursor = page.next;
        data.push(param, page);
      }
      Ok(Fetched::Replace(Arc::new(data) as ErasedData))
    }
    .boxed()
  })
}

fn start_next_page<T>(
  cache: &QueryCache,
  key: &CacheKey,
  fetcher: PageFetcher<T>,
  cursor: u32,
  stale_time: Option<Duration>,
) -> SharedFetch
where
  T: Clone + Send + Sync + 'static,
{
  let config = cache.config().clone();
  let job_key = key.clone();
  cache.start_fetch(key, FetchKind::NextPage, false, stale_time, move |token| {
    async move {
      let page = with_retry(&fetcher, &job_key, Some(cursor), &token, &config).await?;
      let merge: Merge = Box::new(move |current: Option<&ErasedData>| {
        let mut data = current
          .and_then(|d| d.downcast_ref::<InfiniteData<T>>())
          .cloned()
          .unwrap_or_default();
        data.push(cursor, page);
        Arc::new(data) as ErasedData
      });
      Ok(Fetched::Merge(merge))
    }
    .boxed()
  })
}

/// True when the event concerns `key`, or when events were missed.
fn drain_events(events: &mut broadcast::Receiver<CacheEvent>, key: &CacheKey) -> bool {
  let mut changed = false;
  loop {
    match events.try_recv() {
      Ok(event) => changed |= event.key() == key,
      Err(TryRecvError::Lagged(_)) => changed = true,
      Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return changed,
    }
  }
}

async fn next_event(events: &mut broadcast::Receiver<CacheEvent>, key: &CacheKey) -> bool {
  loop {
    match events.recv().await {
      Ok(event) if event.key() == key => return true,
      Ok(_) => continue,
      Err(RecvError::Lagged(_)) => return true,
      Err(RecvError::Closed) => return false,
    }
  }
}

/// Reactive handle on one cache entry.
///
/// While alive it keeps the entry from being evicted, refetches it in the
/// background when it is invalidated, and lets the owner poll for changes.
/// Dropping it releases the entry.
pub struct QueryObserver<T> {
  cache: QueryCache,
  id: u64,
  key: CacheKey,
  fetcher: Fetcher<T>,
  options: QueryOptions,
  events: broadcast::Receiver<CacheEvent>,
}

impl<T> QueryObserver<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn new(cache: QueryCache, key: CacheKey, fetcher: Fetcher<T>, options: QueryOptions) -> Self {
    let observer = Self {
      id: cache.next_id(),
      events: cache.subscribe(),
      cache,
      key,
      fetcher,
      options,
    };
    observer.attach();
    observer
  }

  fn attach(&self) {
    let hook = self.options.enabled.then(|| {
      let key = self.key.clone();
      let fetcher = self.fetcher.clone();
      let stale_time = self.options.stale_time;
      Arc::new(move |cache: &QueryCache| {
        start_query(cache, &key, fetcher.clone(), true, stale_time);
      }) as RefetchHook
    });
    self.cache.attach(&self.key, self.id, hook);

    if !self.options.enabled {
      return;
    }
    let stale = self.cache.state(&self.key).map_or(true, |s| s.is_stale);
    if stale {
      debug!(key = %self.key, "observer attached to stale entry, fetching");
      start_query(
        &self.cache,
        &self.key,
        self.fetcher.clone(),
        false,
        self.options.stale_time,
      );
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn is_enabled(&self) -> bool {
    self.options.enabled
  }

  /// Current data, status and error of the observed entry.
  pub fn result(&self) -> QueryResult<T> {
    let Some((state, data)) = self.cache.read::<T>(&self.key) else {
      return QueryResult::idle();
    };
    let status = if !self.options.enabled && data.is_none() {
      QueryStatus::Idle
    } else {
      state.status
    };
    QueryResult {
      data,
      status,
      error: state.error,
      is_stale: state.is_stale,
      updated_at: state.updated_at,
    }
  }

  /// Point the observer at another key (e.g. another page). The old entry
  /// is released and the new one fetched if stale.
  pub fn set_key(&mut self, key: CacheKey) {
    if key == self.key {
      return;
    }
    self.cache.detach(&self.key, self.id);
    self.key = key;
    self.attach();
  }

  pub fn set_enabled(&mut self, enabled: bool) {
    if enabled == self.options.enabled {
      return;
    }
    self.options.enabled = enabled;
    self.cache.detach(&self.key, self.id);
    self.attach();
  }

  /// Re-target the observer at a different query in one step.
  pub fn set_query(&mut self, key: CacheKey, fetcher: Fetcher<T>, options: QueryOptions) {
    self.cache.detach(&self.key, self.id);
    self.key = key;
    self.fetcher = fetcher;
    self.options = options;
    self.attach();
  }

  /// Fetch from the network now, superseding any fetch in flight.
  pub async fn refetch(&self) -> Result<T, QueryError> {
    let fetch = start_query(
      &self.cache,
      &self.key,
      self.fetcher.clone(),
      true,
      self.options.stale_time,
    );
    resolve(&self.cache, &self.key, fetch).await
  }

  /// Non-blocking: true if the entry changed since the last poll.
  /// Call this in your event loop tick handler.
  pub fn poll_changed(&mut self) -> bool {
    drain_events(&mut self.events, &self.key)
  }

  /// Wait for the next change to the entry. Returns false once the cache
  /// is gone.
  pub async fn changed(&mut self) -> bool {
    next_event(&mut self.events, &self.key).await
  }
}

impl<T> Drop for QueryObserver<T> {
  fn drop(&mut self) {
    self.cache.detach(&self.key, self.id);
  }
}

impl<T> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

/// Cloneable trigger for loading the next page of an infinite query.
///
/// Visibility callbacks hold one of these rather than the observer itself.
pub struct NextPage<T> {
  cache: QueryCache,
  key: CacheKey,
  fetcher: PageFetcher<T>,
  options: InfiniteOptions,
}

impl<T> Clone for NextPage<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      key: self.key.clone(),
      fetcher: self.fetcher.clone(),
      options: self.options,
    }
  }
}

impl<T> NextPage<T>
where
  T: Clone + Send + Sync + 'static,
{
  /// Append the page after the last loaded one.
  ///
  /// A no-op (returning `Ok(false)`) when the query is disabled, nothing is
  /// loaded yet, the last page has no `next`, or any fetch for the key is
  /// already in flight. Safe to call on every visibility event.
  pub async fn fetch(&self) -> Result<bool, QueryError> {
    if !self.options.enabled {
      return Ok(false);
    }
    let Some((state, Some(data))) = self.cache.read::<InfiniteData<T>>(&self.key) else {
      return Ok(false);
    };
    if state.fetch.is_some() {
      debug!(key = %self.key, "fetch already in flight, not loading next page");
      return Ok(false);
    }
    let Some(cursor) = data.next_page_param() else {
      return Ok(false);
    };
    debug!(key = %self.key, cursor, "loading next page");
    let fetch = start_next_page(
      &self.cache,
      &self.key,
      self.fetcher.clone(),
      cursor,
      self.options.stale_time,
    );
    resolve::<InfiniteData<T>>(&self.cache, &self.key, fetch).await?;
    Ok(true)
  }
}

/// Reactive handle on an infinite query.
pub struct InfiniteQueryObserver<T> {
  next: NextPage<T>,
  id: u64,
  events: broadcast::Receiver<CacheEvent>,
}

impl<T> InfiniteQueryObserver<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn new(
    cache: QueryCache,
    key: CacheKey,
    fetcher: PageFetcher<T>,
    options: InfiniteOptions,
  ) -> Self {
    let observer = Self {
      id: cache.next_id(),
      events: cache.subscribe(),
      next: NextPage {
        cache,
        key,
        fetcher,
        options,
      },
    };
    observer.attach();
    observer
  }

  fn attach(&self) {
    let next = &self.next;
    let hook = next.options.enabled.then(|| {
      let key = next.key.clone();
      let fetcher = next.fetcher.clone();
      let options = next.options;
      Arc::new(move |cache: &QueryCache| {
        start_infinite(cache, &key, fetcher.clone(), options, true);
      }) as RefetchHook
    });
    next.cache.attach(&next.key, self.id, hook);

    if !next.options.enabled {
      return;
    }
    let stale = next.cache.state(&next.key).map_or(true, |s| s.is_stale);
    if stale {
      start_infinite(
        &next.cache,
        &next.key,
        next.fetcher.clone(),
        next.options,
        false,
      );
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.next.key
  }

  pub fn result(&self) -> QueryResult<InfiniteData<T>> {
    let next = &self.next;
    let Some((state, data)) = next.cache.read::<InfiniteData<T>>(&next.key) else {
      return QueryResult::idle();
    };
    let status = if !next.options.enabled && data.is_none() {
      QueryStatus::Idle
    } else {
      state.status
    };
    QueryResult {
      data,
      status,
      error: state.error,
      is_stale: state.is_stale,
      updated_at: state.updated_at,
    }
  }

  pub fn pages(&self) -> Vec<PaginatedResult<Vec<T>>> {
    self
      .result()
      .data
      .map(|data| data.pages)
      .unwrap_or_default()
  }

  /// Items of every loaded page, concatenated in page order.
  pub fn items(&self) -> Vec<T> {
    self
      .result()
      .data
      .map(|data| data.flatten())
      .unwrap_or_default()
  }

  pub fn has_next_page(&self) -> bool {
    self
      .next
      .cache
      .get::<InfiniteData<T>>(&self.next.key)
      .is_some_and(|data| data.has_next_page())
  }

  pub fn is_fetching_next_page(&self) -> bool {
    self
      .next
      .cache
      .state(&self.next.key)
      .is_some_and(|s| s.fetch == Some(FetchKind::NextPage))
  }

  /// See [`NextPage::fetch`].
  pub async fn fetch_next_page(&self) -> Result<bool, QueryError> {
    self.next.fetch().await
  }

  /// A detached trigger for [`fetch_next_page`](Self::fetch_next_page).
  pub fn next_page(&self) -> NextPage<T> {
    self.next.clone()
  }

  pub fn set_key(&mut self, key: CacheKey) {
    if key == self.next.key {
      return;
    }
    self.next.cache.detach(&self.next.key, self.id);
    self.next.key = key;
    self.attach();
  }

  pub fn set_enabled(&mut self, enabled: bool) {
    if enabled == self.next.options.enabled {
      return;
    }
    self.next.options.enabled = enabled;
    self.next.cache.detach(&self.next.key, self.id);
    self.attach();
  }

  /// Reload every loaded page from the first cursor.
  pub async fn refetch(&self) -> Result<InfiniteData<T>, QueryError> {
    let next = &self.next;
    let fetch = start_infinite(&next.cache, &next.key, next.fetcher.clone(), next.options, true);
    resolve(&next.cache, &next.key, fetch).await
  }

  pub fn poll_changed(&mut self) -> bool {
    drain_events(&mut self.events, &self.next.key)
  }

  pub async fn changed(&mut self) -> bool {
    next_event(&mut self.events, &self.next.key).await
  }
}

impl<T> Drop for InfiniteQueryObserver<T> {
  fn drop(&mut self) {
    self.next.cache.detach(&self.next.key, self.id);
  }
}
