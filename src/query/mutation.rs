//! Mutation coordinator: runs writes through an explicit lifecycle.
//!
//! A write is described by a [`Mutation`]. The coordinator drives it through
//! the same transitions every time:
//!
//! 1. `on_begin` runs before the network call. It typically cancels queries
//!    under the affected prefix, snapshots the cache and applies an
//!    optimistic patch. Whatever it returns is the rollback context.
//! 2. `execute` performs the network write.
//! 3. `on_success` or `on_failure` reconciles the cache with the outcome.
//! 4. `on_settle` always runs last, usually to invalidate the broader prefix.
//!
//! While a call is in flight its variables are recorded in the
//! [`MutationCache`] under the mutation key, so any number of observers can
//! ask whether the key (or one specific item) is pending.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::cache::QueryCache;
use super::key::CacheKey;
use super::state::MutationStatus;
use crate::error::ApiError;

/// A write operation with optimistic hooks.
///
/// Hooks are synchronous so their ordering is fixed: `on_settle` can never
/// overtake `on_success`/`on_failure` of the same call. Every hook after
/// `on_begin` sees the context it returned.
#[async_trait]
pub trait Mutation: Send + Sync {
  type Variables: Clone + Send + Sync + 'static;
  type Output: Send;
  /// Rollback data captured by `on_begin`, owned by a single call.
  type Context: Send;

  /// Key shared by every call of this mutation; observers read status by it.
  fn key(&self) -> CacheKey;

  async fn execute(
    &self,
    variables: Self::Variables,
    token: CancellationToken,
  ) -> Result<Self::Output, ApiError>;

  fn on_begin(&self, cache: &QueryCache, variables: &Self::Variables) -> Self::Context;

  fn on_success(
    &self,
    _cache: &QueryCache,
    _output: &Self::Output,
    _variables: &Self::Variables,
    _context: &Self::Context,
  ) {
  }

  fn on_failure(
    &self,
    _cache: &QueryCache,
    _error: &ApiError,
    _variables: &Self::Variables,
    _context: &Self::Context,
  ) {
  }

  fn on_settle(
    &self,
    _cache: &QueryCache,
    _output: Option<&Self::Output>,
    _error: Option<&ApiError>,
    _variables: &Self::Variables,
    _context: &Self::Context,
  ) {
  }
}

/// One call of a mutation.
#[derive(Clone)]
struct MutationRecord {
  id: u64,
  variables: Arc<dyn Any + Send + Sync>,
  status: MutationStatus,
}

#[derive(Default)]
struct Registry {
  next_id: u64,
  records: HashMap<CacheKey, Vec<MutationRecord>>,
}

/// In-flight and most recent mutation calls, by mutation key.
#[derive(Clone, Default)]
pub struct MutationCache {
  registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for MutationCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MutationCache")
      .field("keys", &self.registry().records.len())
      .finish()
  }
}

impl MutationCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn registry(&self) -> MutexGuard<'_, Registry> {
    self
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Record a new pending call. Settled calls under the same key are
  /// superseded and dropped.
  fn begin<V: Send + Sync + 'static>(&self, key: &CacheKey, variables: V) -> u64 {
    let mut registry = self.registry();
    registry.next_id += 1;
    let id = registry.next_id;
    let records = registry.records.entry(key.clone()).or_default();
    records.retain(|r| r.status == MutationStatus::Pending);
    records.push(MutationRecord {
      id,
      variables: Arc::new(variables),
      status: MutationStatus::Pending,
    });
    id
  }

  /// Mark a call settled; only the newest settled call is kept.
  fn settle(&self, key: &CacheKey, id: u64, status: MutationStatus) {
    let mut registry = self.registry();
    if let Some(records) = registry.records.get_mut(key) {
      if let Some(record) = records.iter_mut().find(|r| r.id == id) {
        record.status = status;
      }
      let newest_settled = records
        .iter()
        .filter(|r| r.status != MutationStatus::Pending)
        .map(|r| r.id)
        .max();
      records.retain(|r| r.status == MutationStatus::Pending || Some(r.id) == newest_settled);
    }
  }

  pub fn is_pending(&self, key: &CacheKey) -> bool {
    self.pending_count(key) > 0
  }

  pub fn pending_count(&self, key: &CacheKey) -> usize {
    self.registry().records.get(key).map_or(0, |records| {
      records
        .iter()
        .filter(|r| r.status == MutationStatus::Pending)
        .count()
    })
  }

  /// Variables of every pending call under `key`, oldest first.
  pub fn pending_variables<V: Clone + 'static>(&self, key: &CacheKey) -> Vec<V> {
    self.registry().records.get(key).map_or_else(Vec::new, |records| {
      records
        .iter()
        .filter(|r| r.status == MutationStatus::Pending)
        .filter_map(|r| r.variables.downcast_ref::<V>().cloned())
        .collect()
    })
  }

  /// True while some pending call under `key` has variables matching `pred`.
  ///
  /// Lets a view disable only the control of the item being mutated rather
  /// than every control sharing the key.
  pub fn is_item_pending<V, F>(&self, key: &CacheKey, pred: F) -> bool
  where
    V: 'static,
    F: Fn(&V) -> bool,
  {
    self.registry().records.get(key).is_some_and(|records| {
      records
        .iter()
        .filter(|r| r.status == MutationStatus::Pending)
        .filter_map(|r| r.variables.downcast_ref::<V>())
        .any(pred)
    })
  }

  /// Status of the most recent call under `key`.
  pub fn status(&self, key: &CacheKey) -> MutationStatus {
    self
      .registry()
      .records
      .get(key)
      .and_then(|records| records.iter().max_by_key(|r| r.id))
      .map_or(MutationStatus::Idle, |r| r.status)
  }
}

/// One call in flight. Owns the rollback context until the call settles.
///
/// If the mutate future is dropped before the network call finishes, the
/// call settles as cancelled: `on_failure` and `on_settle` still run, so
/// the optimistic patch never outlives its call.
struct Call<'a, M: Mutation> {
  cache: &'a QueryCache,
  mutations: &'a MutationCache,
  mutation: &'a M,
  key: CacheKey,
  id: u64,
  variables: M::Variables,
  context: Option<M::Context>,
  settled: bool,
}

impl<M: Mutation> Call<'_, M> {
  fn settle(&mut self, outcome: Result<&M::Output, &ApiError>) {
    if let Some(context) = self.context.take() {
      match outcome {
        Ok(output) => {
          self
            .mutation
            .on_success(self.cache, output, &self.variables, &context);
          info!("mutation succeeded");
        }
        Err(error) => {
          warn!(%error, "mutation failed, rolling back");
          self
            .mutation
            .on_failure(self.cache, error, &self.variables, &context);
        }
      }
      self.mutation.on_settle(
        self.cache,
        outcome.ok(),
        outcome.err(),
        &self.variables,
        &context,
      );
    }
    let status = if outcome.is_ok() {
      MutationStatus::Success
    } else {
      MutationStatus::Error
    };
    self.mutations.settle(&self.key, self.id, status);
    self.settled = true;
  }
}

impl<M: Mutation> Drop for Call<'_, M> {
  fn drop(&mut self) {
    if !self.settled {
      self.settle(Err(&ApiError::Cancelled));
    }
  }
}

/// Run `mutation` with `variables` through its full lifecycle.
///
/// The network error, if any, is returned to the caller after rollback and
/// settlement have run. Writes are never retried.
pub async fn run<M: Mutation>(
  cache: &QueryCache,
  mutations: &MutationCache,
  mutation: &M,
  variables: M::Variables,
) -> Result<M::Output, ApiError> {
  let key = mutation.key();
  let span = info_span!("mutation", key = %key);

  async move {
    let mut call = Call {
      cache,
      mutations,
      mutation,
      id: mutations.begin(&key, variables.clone()),
      key,
      variables,
      context: None,
      settled: false,
    };
    let token = CancellationToken::new();
    let _abort_on_drop = token.clone().drop_guard();

    debug!("begin");
    call.context = Some(mutation.on_begin(cache, &call.variables));

    let outcome = mutation.execute(call.variables.clone(), token).await;
    call.settle(outcome.as_ref());
    outcome
  }
  .instrument(span)
  .await
}
