//! The authenticated user, shared by everything that gates on it.
//!
//! The user id survives restarts through a [`KeyValueStore`]; at startup it
//! is read back synchronously, so a returning user never sees a logged-out
//! state while the first fetches run.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::query::{CacheKey, Mutation, QueryCache, QueryClient};
use crate::storage::KeyValueStore;
use crate::todos::{keys, Credentials, TaskApi, User};

/// Storage key of the persisted user id.
pub const USER_ID_KEY: &str = "userId";

/// Shown when the server knows no user with the given credentials.
pub const LOGIN_ERROR_MESSAGE: &str = "Invalid login or password";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
  pub user_id: Option<String>,
  pub login_error: Option<String>,
}

/// Process-wide session cell with change notifications.
#[derive(Clone)]
pub struct SessionStore {
  state: Arc<watch::Sender<Session>>,
  storage: Arc<dyn KeyValueStore>,
}

impl SessionStore {
  /// Restore the session from `storage`. No network call is made.
  pub fn rehydrate(storage: Arc<dyn KeyValueStore>) -> Self {
    let user_id = match storage.get(USER_ID_KEY) {
      Ok(user_id) => user_id,
      Err(error) => {
        warn!(%error, "failed to read persisted session, starting logged out");
        None
      }
    };
    if let Some(user_id) = &user_id {
      info!(%user_id, "restored session");
    }
    let (state, _) = watch::channel(Session {
      user_id,
      login_error: None,
    });
    Self {
      state: Arc::new(state),
      storage,
    }
  }

  pub fn current_user_id(&self) -> Option<String> {
    self.state.borrow().user_id.clone()
  }

  pub fn session(&self) -> Session {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<Session> {
    self.state.subscribe()
  }

  /// Record a successful login and persist it.
  pub fn sign_in(&self, user_id: &str) {
    self.state.send_modify(|session| {
      session.user_id = Some(user_id.to_string());
      session.login_error = None;
    });
    if let Err(error) = self.storage.set(USER_ID_KEY, user_id) {
      warn!(%error, "failed to persist session");
    }
  }

  pub fn set_login_error(&self, message: Option<&str>) {
    self.state.send_modify(|session| {
      session.login_error = message.map(str::to_string);
    });
  }

  /// Forget the user. A pending login error is left as it is.
  pub fn logout(&self) {
    self.state.send_modify(|session| session.user_id = None);
    if let Err(error) = self.storage.remove(USER_ID_KEY) {
      warn!(%error, "failed to clear persisted session");
    }
    info!("logged out");
  }

  /// Log in through the `["login"]` mutation.
  ///
  /// Unknown credentials are not an error: they set
  /// [`LOGIN_ERROR_MESSAGE`] on the session. Transport failures are
  /// returned.
  pub async fn login(
    &self,
    client: &QueryClient,
    api: &TaskApi,
    credentials: Credentials,
  ) -> Result<Session, ApiError> {
    let mutation = LoginMutation { api: api.clone() };
    match client.mutate(&mutation, credentials).await? {
      Some(user) => {
        info!(user_id = %user.id, "logged in");
        self.sign_in(&user.id);
      }
      None => {
        warn!("login rejected");
        self.set_login_error(Some(LOGIN_ERROR_MESSAGE));
      }
    }
    Ok(self.session())
  }

  /// True while a login call is in flight.
  pub fn is_logging_in(client: &QueryClient) -> bool {
    client.mutations().is_pending(&keys::login())
  }
}

impl std::fmt::Debug for SessionStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionStore")
      .field("session", &*self.state.borrow())
      .finish_non_exhaustive()
  }
}

struct LoginMutation {
  api: TaskApi,
}

#[async_trait]
impl Mutation for LoginMutation {
  type Variables = Credentials;
  type Output = Option<User>;
  type Context = ();

  fn key(&self) -> CacheKey {
    keys::login()
  }

  async fn execute(
    &self,
    credentials: Credentials,
    token: CancellationToken,
  ) -> Result<Option<User>, ApiError> {
    self.api.find_user(&credentials, &token).await
  }

  fn on_begin(&self, _: &QueryCache, _: &Credentials) {}

  /// The profile is known now; seed it so nobody fetches it again.
  fn on_success(&self, cache: &QueryCache, user: &Option<User>, _: &Credentials, _: &()) {
    if let Some(user) = user {
      cache.set(keys::user(&user.id), user.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::CacheConfig;
  use crate::storage::{MemoryStore, SqliteStore};
  use httpmock::Method::GET;
  use httpmock::MockServer;
  use serde_json::json;
  use url::Url;

  async fn server_with_user() -> MockServer {
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
    server
  }

  fn api(server: &MockServer) -> TaskApi {
    TaskApi::new(&Url::parse(&server.base_url()).unwrap()).unwrap()
  }

  #[tokio::test]
  async fn test_session_survives_restart_without_network() {
    let server = server_with_user().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");
    let client = QueryClient::new(CacheConfig::default());

    {
      let storage = Arc::new(SqliteStore::open(&path).unwrap());
      let session = SessionStore::rehydrate(storage);
      session
        .login(&client, &api(&server), Credentials::new("ann", "secret"))
        .await
        .unwrap();
    }

    drop(server);
    let restarted = SessionStore::rehydrate(Arc::new(SqliteStore::open(&path).unwrap()));
    assert_eq!(restarted.current_user_id().as_deref(), Some("u1"));
  }

  #[tokio::test]
  async fn test_login_seeds_user_profile() {
    let server = server_with_user().await;
    let client = QueryClient::new(CacheConfig::default());
    let session = SessionStore::rehydrate(Arc::new(MemoryStore::new()));

    let result = session
      .login(&client, &api(&server), Credentials::new("ann", "secret"))
      .await
      .unwrap();

    assert_eq!(result.user_id.as_deref(), Some("u1"));
    let user = client.cache().get::<User>(&keys::user("u1")).unwrap();
    assert_eq!(user.login, "ann");
    assert!(!client.cache().state(&keys::user("u1")).unwrap().is_stale);
    assert!(!SessionStore::is_logging_in(&client));
  }

  #[tokio::test]
  async fn test_failed_login_sets_message_without_error() {
    let server = server_with_user().await;
    let client = QueryClient::new(CacheConfig::default());
    let session = SessionStore::rehydrate(Arc::new(MemoryStore::new()));

    let result = session
      .login(&client, &api(&server), Credentials::new("ann", "wrong"))
      .await
      .unwrap();

    assert_eq!(result.user_id, None);
    assert_eq!(result.login_error.as_deref(), Some(LOGIN_ERROR_MESSAGE));
  }

  #[tokio::test]
  async fn test_successful_login_clears_previous_error() {
    let server = server_with_user().await;
    let client = QueryClient::new(CacheConfig::default());
    let session = SessionStore::rehydrate(Arc::new(MemoryStore::new()));
    let api = api(&server);

    session
      .login(&client, &api, Credentials::new("ann", "wrong"))
      .await
      .unwrap();
    let result = session
      .login(&client, &api, Credentials::new("ann", "secret"))
      .await
      .unwrap();

    assert_eq!(result.login_error, None);
  }

  #[test]
  fn test_logout_keeps_login_error() {
    let storage = Arc::new(MemoryStore::new());
    let session = SessionStore::rehydrate(storage.clone());
    session.sign_in("u1");
    session.set_login_error(Some(LOGIN_ERROR_MESSAGE));

    session.logout();

    let state = session.session();
    assert_eq!(state.user_id, None);
    assert_eq!(state.login_error.as_deref(), Some(LOGIN_ERROR_MESSAGE));
    assert_eq!(storage.get(USER_ID_KEY).unwrap(), None);
  }

  #[tokio::test]
  async fn test_subscribers_see_changes() {
    let session = SessionStore::rehydrate(Arc::new(MemoryStore::new()));
    let mut changes = session.subscribe();

    session.sign_in("u1");
    changes.changed().await.unwrap();
    assert_eq!(changes.borrow_and_update().user_id.as_deref(), Some("u1"));
  }
}
