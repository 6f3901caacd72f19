//! Lifecycle states exposed to query and mutation observers.

use tokio::time::Instant;

use crate::error::QueryError;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  /// No fetch has been started (or the query is disabled)
  #[default]
  Idle,
  /// A fetch is in flight; previously fetched data, if any, is still served
  Fetching,
  /// The last fetch (or an explicit `set`) succeeded
  Success,
  /// The last fetch failed; previously fetched data is retained
  Error,
}

/// What an observer sees when it reads a query.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
  pub data: Option<T>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub is_stale: bool,
  pub updated_at: Option<Instant>,
}

impl<T> QueryResult<T> {
  pub(crate) fn idle() -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      is_stale: true,
      updated_at: None,
    }
  }

  /// First load: fetching with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Fetching && self.data.is_none()
  }

  pub fn is_fetching(&self) -> bool {
    self.status == QueryStatus::Fetching
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }
}

/// Lifecycle of one mutation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}
