//! Error types shared by the query engine and the task API.

use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by a network read or write.
#[derive(Debug, Error)]
pub enum ApiError {
  /// The server answered with a non-2xx status.
  #[error("request to {url} failed with status {status}")]
  Status {
    status: StatusCode,
    url: String,
    body: String,
  },
  /// The request never produced a response (connection refused, timeout, ...).
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),
  /// The response body was not the JSON we expected.
  #[error("failed to decode response: {0}")]
  Decode(#[from] serde_json::Error),
  /// The request was aborted through its cancellation token.
  #[error("request was cancelled")]
  Cancelled,
  #[error("{0}")]
  Other(String),
}

impl ApiError {
  /// HTTP status of the failed response, if the server answered at all.
  pub fn status(&self) -> Option<StatusCode> {
    match self {
      ApiError::Status { status, .. } => Some(*status),
      ApiError::Transport(e) => e.status(),
      _ => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, ApiError::Cancelled)
  }

  /// Whether a read that failed this way is worth another attempt.
  ///
  /// Client errors (4xx other than 408/429), decode failures and
  /// cancellations are final.
  pub fn is_retryable(&self) -> bool {
    match self {
      ApiError::Status { status, .. } => {
        status.is_server_error()
          || *status == StatusCode::REQUEST_TIMEOUT
          || *status == StatusCode::TOO_MANY_REQUESTS
      }
      ApiError::Transport(_) | ApiError::Other(_) => true,
      ApiError::Decode(_) | ApiError::Cancelled => false,
    }
  }
}

/// Error stored in a cache entry and shared with every subscriber of a fetch.
pub type QueryError = Arc<ApiError>;

/// Errors surfaced by task-list actions.
#[derive(Debug, Error)]
pub enum TodoError {
  /// A gated write was attempted without an authenticated session.
  #[error("user is not logged in")]
  NotLoggedIn,
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error(transparent)]
  Query(#[from] QueryError),
}
