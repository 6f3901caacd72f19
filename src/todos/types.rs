//! Wire types of the task API.

use serde::{Deserialize, Serialize};

use crate::query::PaginatedResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
  pub id: String,
  pub text: String,
  pub done: bool,
  #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
}

impl Todo {
  /// Apply the fields present in `patch`.
  pub fn apply(&mut self, patch: &TodoPatch) {
    if let Some(done) = patch.done {
      self.done = done;
    }
    if let Some(text) = &patch.text {
      self.text = text.clone();
    }
  }
}

/// Partial update of one task. `id` selects the task and is not sent as a
/// field change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TodoPatch {
  #[serde(skip)]
  pub id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub done: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
}

impl TodoPatch {
  pub fn done(id: impl Into<String>, done: bool) -> Self {
    Self {
      id: id.into(),
      done: Some(done),
      text: None,
    }
  }
}

/// One page of tasks.
pub type TodoPage = PaginatedResult<Vec<Todo>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  pub login: String,
  #[serde(default, skip_serializing)]
  pub password: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  pub login: String,
  pub password: String,
}

impl Credentials {
  pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      login: login.into(),
      password: password.into(),
    }
  }
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credentials")
      .field("login", &self.login)
      .field("password", &"***")
      .finish()
  }
}
