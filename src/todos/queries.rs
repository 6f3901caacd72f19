//! Reads of the task-list domain.

use tracing::debug;

use super::api::TaskApi;
use super::keys;
use super::types::{Todo, TodoPage, User};
use crate::error::QueryError;
use crate::query::{
  fetcher, CacheKey, Fetcher, InfiniteOptions, InfiniteQueryObserver, PageFetcher, QueryClient,
  QueryObserver, QueryOptions,
};

/// Default page size of task listings.
pub const DEFAULT_PER_PAGE: u32 = 10;

/// Query definitions for tasks and users, bound to one client and API.
#[derive(Clone, Debug)]
pub struct TodoQueries {
  client: QueryClient,
  api: TaskApi,
  per_page: u32,
}

impl TodoQueries {
  pub fn new(client: QueryClient, api: TaskApi) -> Self {
    Self {
      client,
      api,
      per_page: DEFAULT_PER_PAGE,
    }
  }

  pub fn with_per_page(mut self, per_page: u32) -> Self {
    self.per_page = per_page.max(1);
    self
  }

  pub fn per_page(&self) -> u32 {
    self.per_page
  }

  pub fn page_key(&self, page: u32, user_id: Option<&str>) -> CacheKey {
    keys::page(page, self.per_page, user_id)
  }

  pub fn page_fetcher(&self, page: u32, user_id: Option<&str>) -> Fetcher<TodoPage> {
    let api = self.api.clone();
    let per_page = self.per_page;
    let user_id = user_id.map(str::to_string);
    fetcher(move |ctx| {
      let api = api.clone();
      let user_id = user_id.clone();
      async move {
        api
          .get_tasks(page, per_page, user_id.as_deref(), &ctx.token)
          .await
      }
    })
  }

  /// One page of the user's tasks. Disabled (and idle) without a user.
  pub fn watch_page(&self, page: u32, user_id: Option<&str>) -> QueryObserver<TodoPage> {
    self.client.watch(
      self.page_key(page, user_id),
      self.page_fetcher(page, user_id),
      QueryOptions::enabled(user_id.is_some()),
    )
  }

  /// Move `observer` to another page or user.
  pub fn show_page(
    &self,
    observer: &mut QueryObserver<TodoPage>,
    page: u32,
    user_id: Option<&str>,
  ) {
    observer.set_query(
      self.page_key(page, user_id),
      self.page_fetcher(page, user_id),
      QueryOptions::enabled(user_id.is_some()),
    );
  }

  fn feed_fetcher(&self) -> PageFetcher<Todo> {
    let api = self.api.clone();
    let per_page = self.per_page;
    fetcher(move |ctx| {
      let api = api.clone();
      async move {
        let page = ctx.page_param.unwrap_or(1);
        api.get_tasks(page, per_page, None, &ctx.token).await
      }
    })
  }

  /// The infinite feed of all tasks, starting at page 1.
  pub fn watch_feed(&self, enabled: bool) -> InfiniteQueryObserver<Todo> {
    self.client.watch_infinite(
      keys::feed(self.per_page),
      self.feed_fetcher(),
      InfiniteOptions {
        enabled,
        ..InfiniteOptions::default()
      },
    )
  }

  pub fn user_fetcher(&self, id: &str) -> Fetcher<User> {
    let api = self.api.clone();
    let id = id.to_string();
    fetcher(move |ctx| {
      let api = api.clone();
      let id = id.clone();
      async move { api.get_user(&id, &ctx.token).await }
    })
  }

  /// Profile of `id`, from the cache when fresh.
  pub async fn fetch_user(&self, id: &str) -> Result<User, QueryError> {
    self.client.fetch(keys::user(id), self.user_fetcher(id)).await
  }

  /// Profile of the logged-in user. Disabled without a user.
  pub fn watch_user(&self, user_id: Option<&str>) -> QueryObserver<User> {
    let id = user_id.unwrap_or_default();
    self.client.watch(
      keys::user(id),
      self.user_fetcher(id),
      QueryOptions::enabled(user_id.is_some()),
    )
  }

  /// Move `observer` to another user's profile.
  pub fn show_user(&self, observer: &mut QueryObserver<User>, user_id: Option<&str>) {
    let id = user_id.unwrap_or_default();
    observer.set_query(
      keys::user(id),
      self.user_fetcher(id),
      QueryOptions::enabled(user_id.is_some()),
    );
  }

  /// Warm the cache for a logged-in user: profile and first page.
  pub async fn prefetch_todo_list(&self, user_id: Option<&str>) {
    let Some(user_id) = user_id else {
      return;
    };
    debug!(%user_id, "prefetching task list");
    tokio::join!(
      self.client.prefetch(keys::user(user_id), self.user_fetcher(user_id)),
      self.client.prefetch(
        self.page_key(1, Some(user_id)),
        self.page_fetcher(1, Some(user_id)),
      ),
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{CacheConfig, QueryStatus};
  use httpmock::Method::GET;
  use httpmock::MockServer;
  use serde_json::json;
  use url::Url;

  fn queries(server: &MockServer) -> TodoQueries {
    let api = TaskApi::new(&Url::parse(&server.base_url()).unwrap()).unwrap();
    let client = QueryClient::new(CacheConfig {
      retry: 0,
      ..CacheConfig::default()
    });
    TodoQueries::new(client, api)
  }

  fn page_body(page: u32, last: u32) -> serde_json::Value {
    json!({
      "first": 1,
      "prev": if page > 1 { json!(page - 1) } else { json!(null) },
      "next": if page < last { json!(page + 1) } else { json!(null) },
      "last": last, "pages": last, "items": last,
      "data": [{ "id": format!("t{}", page), "text": "x", "done": false }]
    })
  }

  #[tokio::test]
  async fn test_page_is_gated_on_user() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when.method(GET).path("/tasks").query_param("_userId", "u1");
        then.status(200).json_body(page_body(1, 1));
      })
      .await;
    let queries = queries(&server);

    let mut observer = queries.watch_page(1, None);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(observer.result().status, QueryStatus::Idle);
    assert_eq!(mock.calls_async().await, 0);

    queries.show_page(&mut observer, 1, Some("u1"));
    while !observer.result().is_success() {
      observer.changed().await;
    }
    assert_eq!(observer.result().data.unwrap().data[0].id, "t1");
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_feed_appends_pages_in_order() {
    let server = MockServer::start_async().await;
    for page in 1..=2u32 {
      server
        .mock_async(|when, then| {
          when
            .method(GET)
            .path("/tasks")
            .query_param("_page", page.to_string());
          then.status(200).json_body(page_body(page, 2));
        })
        .await;
    }
    let queries = queries(&server);

    let mut feed = queries.watch_feed(true);
    while feed.result().data.is_none() {
      feed.changed().await;
    }
    assert!(feed.has_next_page());
    feed.fetch_next_page().await.unwrap();

    let ids: Vec<String> = feed.items().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec!["t1", "t2"]);
    assert!(!feed.has_next_page());
  }

  #[tokio::test]
  async fn test_prefetch_fills_cache_and_skips_fresh_data() {
    let server = MockServer::start_async().await;
    let user = server
      .mock_async(|when, then| {
        when.method(GET).path("/users/u1");
        then.status(200).json_body(json!({ "id": "u1", "login": "ann" }));
      })
      .await;
    let tasks = server
      .mock_async(|when, then| {
        when.method(GET).path("/tasks").query_param("_userId", "u1");
        then.status(200).json_body(page_body(1, 1));
      })
      .await;
    let queries = queries(&server);

    queries.prefetch_todo_list(None).await;
    assert_eq!(user.calls_async().await, 0);

    queries.prefetch_todo_list(Some("u1")).await;
    queries.prefetch_todo_list(Some("u1")).await;
    user.assert_async().await;
    tasks.assert_async().await;

    assert_eq!(queries.fetch_user("u1").await.unwrap().login, "ann");
    user.assert_async().await;
  }

  #[tokio::test]
  async fn test_prefetch_swallows_errors() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(GET);
        then.status(500);
      })
      .await;
    let queries = queries(&server);

    queries.prefetch_todo_list(Some("u1")).await;
    let state = queries
      .client
      .cache()
      .state(&keys::user("u1"))
      .unwrap();
    assert_eq!(state.status, QueryStatus::Error);
  }
}
