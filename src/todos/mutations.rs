//! Create, toggle and delete tasks.
//!
//! Create and toggle are optimistic: the cached lists change before the
//! request is sent and are put back exactly as they were if it fails.
//! Delete waits for the server. Every write invalidates all task entries
//! once it settles.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::api::TaskApi;
use super::keys;
use super::queries::TodoQueries;
use super::types::{Todo, TodoPage, TodoPatch};
use crate::error::{ApiError, TodoError};
use crate::query::{
  CacheKey, CacheSnapshot, InfiniteData, KeyPart, Mutation, QueryCache, QueryClient,
};
use crate::session::SessionStore;

/// User a list entry is scoped to, if its key carries one.
fn list_owner(key: &CacheKey) -> Option<&str> {
  match key.parts().last() {
    Some(KeyPart::Map(params)) => match params.get("userId") {
      Some(KeyPart::Str(id)) => Some(id),
      _ => None,
    },
    _ => None,
  }
}

/// Run `f` over the items of every cached list page, paged and infinite.
///
/// `f` gets the list key, the page's items and whether the page is the last
/// one of its listing, and returns whether it changed anything.
fn patch_lists<F>(cache: &QueryCache, mut f: F) -> usize
where
  F: FnMut(&CacheKey, &mut Vec<Todo>, bool) -> bool,
{
  let pages = cache.update_all::<TodoPage, _>(&keys::lists(), |key, page| {
    let mut page = page.clone();
    let last = page.is_last();
    f(key, &mut page.data, last).then_some(page)
  });

  let feeds = cache.update_all::<InfiniteData<Todo>, _>(&keys::lists(), |key, feed| {
    let mut feed = feed.clone();
    let loaded = feed.pages.len();
    let mut changed = false;
    for (i, page) in feed.pages.iter_mut().enumerate() {
      let last = i + 1 == loaded && page.is_last();
      changed |= f(key, &mut page.data, last);
    }
    changed.then_some(feed)
  });

  pages + feeds
}

/// Swap every cached copy of `todo` for this one.
fn replace_todo(cache: &QueryCache, todo: &Todo) -> usize {
  patch_lists(cache, |_, items, _| {
    let mut changed = false;
    for item in items.iter_mut().filter(|item| item.id == todo.id) {
      *item = todo.clone();
      changed = true;
    }
    changed
  })
}

pub struct CreateTodo {
  pub api: TaskApi,
}

#[async_trait]
impl Mutation for CreateTodo {
  type Variables = Todo;
  type Output = Todo;
  type Context = CacheSnapshot;

  fn key(&self) -> CacheKey {
    keys::create_todo()
  }

  async fn execute(&self, todo: Todo, token: CancellationToken) -> Result<Todo, ApiError> {
    self.api.create_task(&todo, &token).await
  }

  /// Append the new task to the last page of every listing that could show
  /// it.
  fn on_begin(&self, cache: &QueryCache, todo: &Todo) -> CacheSnapshot {
    cache.cancel(&keys::tasks());
    let snapshot = cache.snapshot(&keys::lists());

    let patched = patch_lists(cache, |key, items, last| {
      let visible = list_owner(key).map_or(true, |owner| Some(owner) == todo.user_id.as_deref());
      if last && visible {
        items.push(todo.clone());
      }
      last && visible
    });
    debug!(id = %todo.id, lists = patched, "optimistically appended task");
    snapshot
  }

  fn on_success(&self, cache: &QueryCache, created: &Todo, _: &Todo, _: &CacheSnapshot) {
    replace_todo(cache, created);
  }

  fn on_failure(&self, cache: &QueryCache, _: &ApiError, _: &Todo, snapshot: &CacheSnapshot) {
    cache.restore(snapshot);
  }

  fn on_settle(
    &self,
    cache: &QueryCache,
    _: Option<&Todo>,
    _: Option<&ApiError>,
    _: &Todo,
    _: &CacheSnapshot,
  ) {
    cache.invalidate(&keys::tasks());
  }
}

pub struct ToggleTodo {
  pub api: TaskApi,
}

#[async_trait]
impl Mutation for ToggleTodo {
  type Variables = TodoPatch;
  type Output = Todo;
  type Context = CacheSnapshot;

  fn key(&self) -> CacheKey {
    keys::toggle_todo()
  }

  async fn execute(&self, patch: TodoPatch, token: CancellationToken) -> Result<Todo, ApiError> {
    self.api.update_task(&patch, &token).await
  }

  fn on_begin(&self, cache: &QueryCache, patch: &TodoPatch) -> CacheSnapshot {
    cache.cancel(&keys::tasks());
    let snapshot = cache.snapshot(&keys::lists());

    patch_lists(cache, |_, items, _| {
      let mut changed = false;
      for item in items.iter_mut().filter(|item| item.id == patch.id) {
        item.apply(patch);
        changed = true;
      }
      changed
    });
    snapshot
  }

  fn on_success(&self, cache: &QueryCache, updated: &Todo, _: &TodoPatch, _: &CacheSnapshot) {
    replace_todo(cache, updated);
  }

  fn on_failure(
    &self,
    cache: &QueryCache,
    _: &ApiError,
    _: &TodoPatch,
    snapshot: &CacheSnapshot,
  ) {
    cache.restore(snapshot);
  }

  fn on_settle(
    &self,
    cache: &QueryCache,
    _: Option<&Todo>,
    _: Option<&ApiError>,
    _: &TodoPatch,
    _: &CacheSnapshot,
  ) {
    cache.invalidate(&keys::tasks());
  }
}

pub struct DeleteTodo {
  pub api: TaskApi,
}

#[async_trait]
impl Mutation for DeleteTodo {
  /// Id of the task to delete
  type Variables = String;
  type Output = ();
  type Context = ();

  fn key(&self) -> CacheKey {
    keys::delete_todo()
  }

  async fn execute(&self, id: String, token: CancellationToken) -> Result<(), ApiError> {
    self.api.delete_task(&id, &token).await
  }

  fn on_begin(&self, _: &QueryCache, _: &String) {}

  fn on_success(&self, cache: &QueryCache, _: &(), id: &String, _: &()) {
    patch_lists(cache, |_, items, _| {
      let before = items.len();
      items.retain(|item| &item.id != id);
      items.len() != before
    });
  }

  fn on_settle(
    &self,
    cache: &QueryCache,
    _: Option<&()>,
    _: Option<&ApiError>,
    _: &String,
    _: &(),
  ) {
    cache.invalidate(&keys::tasks());
  }
}

/// Task writes as the user triggers them, plus their pending state.
#[derive(Clone)]
pub struct TodoActions {
  client: QueryClient,
  api: TaskApi,
  queries: TodoQueries,
  session: SessionStore,
}

impl TodoActions {
  pub fn new(client: QueryClient, api: TaskApi, session: SessionStore) -> Self {
    let queries = TodoQueries::new(client.clone(), api.clone());
    Self {
      client,
      api,
      queries,
      session,
    }
  }

  /// Create a task owned by the logged-in user.
  ///
  /// Fails with [`TodoError::NotLoggedIn`] without a session.
  pub async fn create(&self, text: &str) -> Result<Todo, TodoError> {
    let user_id = self.session.current_user_id().ok_or(TodoError::NotLoggedIn)?;
    let user = self.queries.fetch_user(&user_id).await?;

    let todo = Todo {
      id: Uuid::new_v4().to_string(),
      text: format!("{}. Owner: {}", text, user.login),
      done: false,
      user_id: Some(user_id),
    };
    let mutation = CreateTodo {
      api: self.api.clone(),
    };
    let created = self.client.mutate(&mutation, todo).await?;
    info!(id = %created.id, "task created");
    Ok(created)
  }

  /// Flip the `done` flag of `todo`.
  pub async fn toggle(&self, todo: &Todo) -> Result<Todo, TodoError> {
    self.set_done(&todo.id, !todo.done).await
  }

  pub async fn set_done(&self, id: &str, done: bool) -> Result<Todo, TodoError> {
    let mutation = ToggleTodo {
      api: self.api.clone(),
    };
    Ok(self.client.mutate(&mutation, TodoPatch::done(id, done)).await?)
  }

  pub async fn delete(&self, id: &str) -> Result<(), TodoError> {
    let mutation = DeleteTodo {
      api: self.api.clone(),
    };
    self.client.mutate(&mutation, id.to_string()).await?;
    info!(%id, "task deleted");
    Ok(())
  }

  pub fn is_creating(&self) -> bool {
    self.client.mutations().is_pending(&keys::create_todo())
  }

  /// True only while a toggle of this very task is in flight.
  pub fn is_toggle_pending(&self, id: &str) -> bool {
    self
      .client
      .mutations()
      .is_item_pending(&keys::toggle_todo(), |patch: &TodoPatch| patch.id == id)
  }

  /// True only while a delete of this very task is in flight.
  pub fn is_delete_pending(&self, id: &str) -> bool {
    self
      .client
      .mutations()
      .is_item_pending(&keys::delete_todo(), |pending: &String| pending == id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{CacheConfig, PaginatedResult};
  use crate::storage::MemoryStore;
  use httpmock::Method::{DELETE, GET, PATCH, POST};
  use httpmock::MockServer;
  use serde_json::json;
  use std::sync::Arc;
  use std::time::Duration;
  use url::Url;

  fn todo(id: &str, done: bool) -> Todo {
    Todo {
      id: id.into(),
      text: format!("task {}", id),
      done,
      user_id: Some("u1".into()),
    }
  }

  fn single_page(items: Vec<Todo>) -> TodoPage {
    PaginatedResult {
      first: 1,
      prev: None,
      next: None,
      last: 1,
      pages: 1,
      items: items.len() as u32,
      data: items,
    }
  }

  struct Fixture {
    server: MockServer,
    client: QueryClient,
    session: SessionStore,
    actions: TodoActions,
  }

  async fn fixture() -> Fixture {
    let server = MockServer::start_async().await;
    let api = TaskApi::new(&Url::parse(&server.base_url()).unwrap()).unwrap();
    let client = QueryClient::new(CacheConfig {
      retry: 0,
      ..CacheConfig::default()
    });
    let session = SessionStore::rehydrate(Arc::new(MemoryStore::new()));
    let actions = TodoActions::new(client.clone(), api, session.clone());
    Fixture {
      server,
      client,
      session,
      actions,
    }
  }

  #[tokio::test]
  async fn test_toggle_is_optimistic_and_rolls_back_exactly() {
    let fx = fixture().await;
    let key = keys::page(1, 10, Some("u1"));
    fx.client
      .cache()
      .set(key.clone(), single_page(vec![todo("1", false)]));
    fx.server
      .mock_async(|when, then| {
        when.method(PATCH).path("/tasks/1");
        then.status(500).delay(Duration::from_millis(50));
      })
      .await;

    let actions = fx.actions.clone();
    let call = tokio::spawn(async move { actions.set_done("1", true).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let optimistic = fx.client.cache().get::<TodoPage>(&key).unwrap();
    assert_eq!(optimistic.data, vec![todo("1", true)]);
    assert!(fx.actions.is_toggle_pending("1"));

    let result = call.await.unwrap();
    assert!(matches!(result, Err(TodoError::Api(_))));
    let restored = fx.client.cache().get::<TodoPage>(&key).unwrap();
    assert_eq!(restored.data, vec![todo("1", false)]);
    assert!(!fx.actions.is_toggle_pending("1"));
  }

  #[tokio::test]
  async fn test_toggle_keeps_server_copy() {
    let fx = fixture().await;
    let key = keys::page(1, 10, Some("u1"));
    fx.client
      .cache()
      .set(key.clone(), single_page(vec![todo("1", false)]));
    fx.server
      .mock_async(|when, then| {
        when.method(PATCH).path("/tasks/1").json_body(json!({ "done": true }));
        then
          .status(200)
          .json_body(json!({ "id": "1", "text": "server text", "done": true, "userId": "u1" }));
      })
      .await;

    let updated = fx.actions.toggle(&todo("1", false)).await.unwrap();

    assert_eq!(updated.text, "server text");
    let page = fx.client.cache().get::<TodoPage>(&key).unwrap();
    assert_eq!(page.data[0].text, "server text");
    assert!(fx.client.cache().state(&key).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_delete_pending_is_scoped_per_item() {
    let fx = fixture().await;
    let key = keys::page(1, 10, None);
    fx.client.cache().set(
      key.clone(),
      single_page(vec![todo("a", false), todo("b", false)]),
    );
    fx.server
      .mock_async(|when, then| {
        when.method(DELETE).path("/tasks/a");
        then.status(200).delay(Duration::from_millis(20));
      })
      .await;
    fx.server
      .mock_async(|when, then| {
        when.method(DELETE).path("/tasks/b");
        then.status(200).delay(Duration::from_millis(80));
      })
      .await;

    let (a, b) = (fx.actions.clone(), fx.actions.clone());
    let delete_a = tokio::spawn(async move { a.delete("a").await });
    let delete_b = tokio::spawn(async move { b.delete("b").await });

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(fx.actions.is_delete_pending("a"));
    assert!(fx.actions.is_delete_pending("b"));
    assert!(!fx.actions.is_delete_pending("c"));

    delete_a.await.unwrap().unwrap();
    assert!(!fx.actions.is_delete_pending("a"));
    assert!(fx.actions.is_delete_pending("b"));
    let page = fx.client.cache().get::<TodoPage>(&key).unwrap();
    assert_eq!(page.data, vec![todo("b", false)]);

    delete_b.await.unwrap().unwrap();
    assert!(!fx.actions.is_delete_pending("b"));
    assert!(fx.client.cache().get::<TodoPage>(&key).unwrap().data.is_empty());
  }

  #[tokio::test]
  async fn test_create_requires_login() {
    let fx = fixture().await;
    let error = fx.actions.create("milk").await.unwrap_err();
    assert!(matches!(error, TodoError::NotLoggedIn));
  }

  #[tokio::test]
  async fn test_create_appends_owner_and_rolls_back_on_failure() {
    let fx = fixture().await;
    fx.session.sign_in("u1");
    fx.client.cache().set(
      keys::user("u1"),
      crate::todos::User {
        id: "u1".into(),
        login: "ann".into(),
        password: None,
      },
    );
    let own = keys::page(1, 10, Some("u1"));
    let other = keys::page(1, 10, Some("u2"));
    fx.client
      .cache()
      .set(own.clone(), single_page(vec![todo("1", false)]));
    fx.client.cache().set(other.clone(), single_page(vec![]));
    fx.server
      .mock_async(|when, then| {
        when.method(POST).path("/tasks");
        then.status(500).delay(Duration::from_millis(50));
      })
      .await;

    let actions = fx.actions.clone();
    let call = tokio::spawn(async move { actions.create("milk").await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(fx.actions.is_creating());
    let optimistic = fx.client.cache().get::<TodoPage>(&own).unwrap();
    assert_eq!(optimistic.data.len(), 2);
    assert_eq!(optimistic.data[1].text, "milk. Owner: ann");
    assert_eq!(optimistic.data[1].user_id.as_deref(), Some("u1"));
    assert!(fx.client.cache().get::<TodoPage>(&other).unwrap().data.is_empty());

    assert!(call.await.unwrap().is_err());
    assert!(!fx.actions.is_creating());
    let restored = fx.client.cache().get::<TodoPage>(&own).unwrap();
    assert_eq!(restored.data, vec![todo("1", false)]);
  }

  #[tokio::test]
  async fn test_settled_write_refetches_observed_list_once() {
    let fx = fixture().await;
    let list = fx
      .server
      .mock_async(|when, then| {
        when.method(GET).path("/tasks");
        then.status(200).json_body(json!({
          "first": 1, "prev": null, "next": null, "last": 1, "pages": 1, "items": 1,
          "data": [{ "id": "1", "text": "task 1", "done": false, "userId": "u1" }]
        }));
      })
      .await;
    fx.server
      .mock_async(|when, then| {
        when.method(DELETE).path("/tasks/1");
        then.status(200);
      })
      .await;

    let queries = TodoQueries::new(fx.client.clone(), fx.actions.api.clone());
    let mut observer = queries.watch_page(1, Some("u1"));
    while !observer.result().is_success() {
      observer.changed().await;
    }
    assert_eq!(list.calls_async().await, 1);

    fx.actions.delete("1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(list.calls_async().await, 2);
  }
}
