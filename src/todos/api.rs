//! HTTP client for the task server (json-server conventions).

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::types::{Credentials, Todo, TodoPage, TodoPatch, User};
use crate::error::ApiError;

/// Task API client. Cheap to clone.
#[derive(Clone, Debug)]
pub struct TaskApi {
  http: Client,
  base: String,
}

impl TaskApi {
  pub fn new(base_url: &Url) -> Result<Self, ApiError> {
    let http = Client::builder()
      .user_agent(concat!("taskq/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self {
      http,
      base: base_url.as_str().trim_end_matches('/').to_string(),
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base, path)
  }

  /// Send `request`, aborting when `token` fires. Non-2xx responses become
  /// [`ApiError::Status`] carrying the response body.
  async fn send(
    &self,
    request: RequestBuilder,
    token: &CancellationToken,
  ) -> Result<Vec<u8>, ApiError> {
    let call = async {
      let response = request.send().await?;
      let status = response.status();
      let url = response.url().to_string();
      debug!(%url, %status, "response");
      if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status { status, url, body });
      }
      Ok(response.bytes().await?.to_vec())
    };

    tokio::select! {
      biased;
      _ = token.cancelled() => Err(ApiError::Cancelled),
      result = call => result,
    }
  }

  async fn json<T: DeserializeOwned>(
    &self,
    request: RequestBuilder,
    token: &CancellationToken,
  ) -> Result<T, ApiError> {
    let body = self.send(request, token).await?;
    Ok(serde_json::from_slice(&body)?)
  }

  /// One page of tasks, optionally only those of `user_id`.
  pub async fn get_tasks(
    &self,
    page: u32,
    per_page: u32,
    user_id: Option<&str>,
    token: &CancellationToken,
  ) -> Result<TodoPage, ApiError> {
    let mut query = vec![
      ("_page", page.to_string()),
      ("_per_page", per_page.to_string()),
    ];
    if let Some(user_id) = user_id {
      query.push(("_userId", user_id.to_string()));
    }
    let request = self.http.get(self.url("/tasks")).query(&query);
    self.json(request, token).await
  }

  pub async fn create_task(
    &self,
    todo: &Todo,
    token: &CancellationToken,
  ) -> Result<Todo, ApiError> {
    let request = self.http.post(self.url("/tasks")).json(todo);
    self.json(request, token).await
  }

  pub async fn update_task(
    &self,
    patch: &TodoPatch,
    token: &CancellationToken,
  ) -> Result<Todo, ApiError> {
    let request = self
      .http
      .patch(self.url(&format!("/tasks/{}", patch.id)))
      .json(patch);
    self.json(request, token).await
  }

  pub async fn delete_task(&self, id: &str, token: &CancellationToken) -> Result<(), ApiError> {
    let request = self.http.delete(self.url(&format!("/tasks/{}", id)));
    self.send(request, token).await?;
    Ok(())
  }

  pub async fn get_user(&self, id: &str, token: &CancellationToken) -> Result<User, ApiError> {
    let request = self.http.get(self.url(&format!("/users/{}", id)));
    self.json(request, token).await
  }

  /// The user matching `credentials`, if any.
  pub async fn find_user(
    &self,
    credentials: &Credentials,
    token: &CancellationToken,
  ) -> Result<Option<User>, ApiError> {
    let request = self.http.get(self.url("/users")).query(&[
      ("login", credentials.login.as_str()),
      ("password", credentials.password.as_str()),
    ]);
    let users: Vec<User> = self.json(request, token).await?;
    Ok(users.into_iter().next())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use httpmock::Method::{DELETE, GET, PATCH, POST};
  use httpmock::MockServer;
  use reqwest::StatusCode;
  use serde_json::json;

  fn api(server: &MockServer) -> TaskApi {
    TaskApi::new(&Url::parse(&server.base_url()).unwrap()).unwrap()
  }

  fn page_body() -> serde_json::Value {
    json!({
      "first": 1, "prev": null, "next": 2, "last": 2, "pages": 2, "items": 3,
      "data": [
        { "id": "1", "text": "first", "done": false, "userId": "u1" },
        { "id": "2", "text": "second", "done": true, "userId": "u1" }
      ]
    })
  }

  #[tokio::test]
  async fn test_get_tasks_sends_paging_params() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when
          .method(GET)
          .path("/tasks")
          .query_param("_page", "1")
          .query_param("_per_page", "10")
          .query_param("_userId", "u1");
        then.status(200).json_body(page_body());
      })
      .await;

    let page = api(&server)
      .get_tasks(1, 10, Some("u1"), &CancellationToken::new())
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(page.next, Some(2));
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[1].text, "second");
  }

  #[tokio::test]
  async fn test_non_success_status_is_typed() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(GET).path("/users/missing");
        then.status(404).body("not found");
      })
      .await;

    let error = api(&server)
      .get_user("missing", &CancellationToken::new())
      .await
      .unwrap_err();

    assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    match error {
      ApiError::Status { body, url, .. } => {
        assert_eq!(body, "not found");
        assert!(url.ends_with("/users/missing"));
      }
      other => panic!("expected status error, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_invalid_json_is_a_decode_error() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(GET).path("/tasks");
        then.status(200).body("<html>");
      })
      .await;

    let error = api(&server)
      .get_tasks(1, 10, None, &CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(error, ApiError::Decode(_)));
  }

  #[tokio::test]
  async fn test_writes_use_json_server_routes() {
    let server = MockServer::start_async().await;
    let created = server
      .mock_async(|when, then| {
        when.method(POST).path("/tasks").json_body(json!({
          "id": "n1", "text": "milk. Owner: ann", "done": false, "userId": "u1"
        }));
        then.status(201).json_body(json!({
          "id": "n1", "text": "milk. Owner: ann", "done": false, "userId": "u1"
        }));
      })
      .await;
    let patched = server
      .mock_async(|when, then| {
        when
          .method(PATCH)
          .path("/tasks/n1")
          .json_body(json!({ "done": true }));
        then.status(200).json_body(json!({
          "id": "n1", "text": "milk. Owner: ann", "done": true, "userId": "u1"
        }));
      })
      .await;
    let deleted = server
      .mock_async(|when, then| {
        when.method(DELETE).path("/tasks/n1");
        then.status(200).body("");
      })
      .await;

    let api = api(&server);
    let token = CancellationToken::new();
    let todo = Todo {
      id: "n1".into(),
      text: "milk. Owner: ann".into(),
      done: false,
      user_id: Some("u1".into()),
    };

    assert_eq!(api.create_task(&todo, &token).await.unwrap(), todo);
    let updated = api
      .update_task(&TodoPatch::done("n1", true), &token)
      .await
      .unwrap();
    assert!(updated.done);
    api.delete_task("n1", &token).await.unwrap();

    created.assert_async().await;
    patched.assert_async().await;
    deleted.assert_async().await;
  }

  #[tokio::test]
  async fn test_find_user_takes_first_match() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when
          .method(GET)
          .path("/users")
          .query_param("login", "ann")
          .query_param("password", "secret");
        then
          .status(200)
          .json_body(json!([{ "id": "u1", "login": "ann", "password": "secret" }]));
      })
      .await;
    server
      .mock_async(|when, then| {
        when
          .method(GET)
          .path("/users")
          .query_param("login", "ann")
          .query_param("password", "wrong");
        then.status(200).json_body(json!([]));
      })
      .await;

    let api = api(&server);
    let token = CancellationToken::new();

    let user = api
      .find_user(&Credentials::new("ann", "secret"), &token)
      .await
      .unwrap();
    assert_eq!(user.map(|u| u.id).as_deref(), Some("u1"));

    let nobody = api
      .find_user(&Credentials::new("ann", "wrong"), &token)
      .await
      .unwrap();
    assert!(nobody.is_none());
  }

  #[tokio::test]
  async fn test_cancelled_token_aborts_request() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(GET).path("/tasks");
        then
          .status(200)
          .delay(std::time::Duration::from_secs(5))
          .json_body(page_body());
      })
      .await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
      canceller.cancel();
    });

    let error = api(&server)
      .get_tasks(1, 10, None, &token)
      .await
      .unwrap_err();
    assert!(error.is_cancelled());
  }
}
