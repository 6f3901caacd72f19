//! Cache keys of the task-list domain.
//!
//! Everything task related lives under [`tasks`] so a single invalidation
//! reaches every page and the infinite feed.

use crate::cache_key;
use crate::query::{CacheKey, KeyPart};

/// Root of every task entry.
pub fn tasks() -> CacheKey {
  cache_key!["tasks"]
}

/// Prefix of every list entry, paged or infinite.
pub fn lists() -> CacheKey {
  tasks().with("list")
}

/// One page of the (optionally user-scoped) list.
pub fn page(page: u32, per_page: u32, user_id: Option<&str>) -> CacheKey {
  let mut params = vec![
    ("page", KeyPart::from(page)),
    ("perPage", KeyPart::from(per_page)),
  ];
  if let Some(user_id) = user_id {
    params.push(("userId", KeyPart::from(user_id)));
  }
  lists().with(KeyPart::map(params))
}

/// The infinite feed.
pub fn feed(per_page: u32) -> CacheKey {
  lists()
    .with("infinite")
    .with(KeyPart::map([("perPage", KeyPart::from(per_page))]))
}

pub fn user(id: &str) -> CacheKey {
  cache_key!["users", id]
}

/// Mutation keys.
pub fn create_todo() -> CacheKey {
  cache_key!["create-todo"]
}

pub fn toggle_todo() -> CacheKey {
  cache_key!["toggle-todo"]
}

pub fn delete_todo() -> CacheKey {
  cache_key!["delete-todo"]
}

pub fn login() -> CacheKey {
  cache_key!["login"]
}
