use crate::commands::{self, COMMANDS};
use crate::event::{Event, EventHandler};
use color_eyre::Result;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use taskq::config::Config;
use taskq::cursor::{fetch_next_page_on_visible, CursorController, ElementHandle, Viewport};
use taskq::query::{InfiniteQueryObserver, QueryClient, QueryObserver, QueryResult};
use taskq::session::{Session, SessionStore, LOGIN_ERROR_MESSAGE};
use taskq::storage::SqliteStore;
use taskq::todos::{keys, Credentials, TaskApi, Todo, TodoActions, TodoPage, TodoQueries, User};
use tokio::sync::{mpsc, watch};
use tracing::info;

/// What the shell is showing
enum View {
  /// One page of the user's tasks
  Page {
    number: u32,
    tasks: QueryObserver<TodoPage>,
  },
  /// All tasks, loaded page by page as the end comes into view
  Feed {
    tasks: InfiniteQueryObserver<Todo>,
    /// Kept alive so the sentinel stays observed
    _cursor: CursorController,
    sentinel: ElementHandle,
  },
}

/// Main application state
pub struct App {
  client: QueryClient,
  api: TaskApi,
  session: SessionStore,
  session_rx: watch::Receiver<Session>,
  queries: TodoQueries,
  actions: TodoActions,

  /// Where the feed's sentinel row is reported visible
  viewport: Arc<Viewport>,

  view: View,
  user: QueryObserver<User>,

  /// Pending mutation counts at the last render
  pending: (usize, usize, usize),

  /// Event sender for async tasks
  event_tx: mpsc::UnboundedSender<Event>,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  pub fn new(config: Config, base_url: Option<&str>) -> Result<Self> {
    let base_url = config.base_url(base_url)?;
    let api = TaskApi::new(&base_url)?;
    let storage = SqliteStore::open(&config.storage_path()?)?;
    let session = SessionStore::rehydrate(Arc::new(storage));
    let client = QueryClient::new(config.cache_config());
    let queries =
      TodoQueries::new(client.clone(), api.clone()).with_per_page(config.tasks.per_page);
    let actions = TodoActions::new(client.clone(), api.clone(), session.clone());
    info!(%base_url, "starting");

    let user_id = session.current_user_id();
    let view = View::Page {
      number: 1,
      tasks: queries.watch_page(1, user_id.as_deref()),
    };
    let user = queries.watch_user(user_id.as_deref());
    let (tx, _rx) = mpsc::unbounded_channel();

    Ok(Self {
      session_rx: session.subscribe(),
      client,
      api,
      session,
      queries,
      actions,
      viewport: Arc::new(Viewport::new()),
      view,
      user,
      pending: (0, 0, 0),
      event_tx: tx,
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_millis(100));
    self.event_tx = events.sender();

    self.prefetch();
    println!("taskq: type help for commands");
    self.render();
    prompt();

    while !self.should_quit {
      match events.next().await {
        Some(event) => self.handle_event(event),
        None => break,
      }
    }

    Ok(())
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Line(line) => {
        self.execute(&line);
        if !self.should_quit {
          prompt();
        }
      }
      Event::Eof => self.should_quit = true,
      Event::Tick => self.tick(),
      Event::Notice(msg) => {
        println!("{}", msg);
        prompt();
      }
      Event::Error(msg) => {
        println!("error: {}", msg);
        prompt();
      }
    }
  }

  /// Pick up session and cache changes, re-rendering if anything moved.
  fn tick(&mut self) {
    let session_changed = self.session_rx.has_changed().unwrap_or(false);
    if session_changed {
      let session = self.session_rx.borrow_and_update().clone();
      self.on_session_change(&session);
    }

    let view_changed = match &mut self.view {
      View::Page { tasks, .. } => tasks.poll_changed(),
      View::Feed { tasks, .. } => tasks.poll_changed(),
    };
    self.user.poll_changed();

    let pending = self.pending_counts();
    if session_changed || view_changed || pending != self.pending {
      self.render();
      prompt();
    }
  }

  fn on_session_change(&mut self, session: &Session) {
    let user_id = session.user_id.as_deref();
    self.queries.show_user(&mut self.user, user_id);
    match &mut self.view {
      View::Page { number, tasks } => self.queries.show_page(tasks, *number, user_id),
      View::Feed { tasks, .. } => tasks.set_enabled(user_id.is_some()),
    }
    self.prefetch();
  }

  fn prefetch(&self) {
    let queries = self.queries.clone();
    let user_id = self.session.current_user_id();
    tokio::spawn(async move { queries.prefetch_todo_list(user_id.as_deref()).await });
  }

  /// Run `task` in the background and report its outcome as an event.
  fn spawn<F>(&self, task: F)
  where
    F: Future<Output = std::result::Result<String, String>> + Send + 'static,
  {
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      let event = match task.await {
        Ok(msg) => Event::Notice(msg),
        Err(msg) => Event::Error(msg),
      };
      let _ = tx.send(event);
    });
  }

  fn execute(&mut self, line: &str) {
    let Some((word, args)) = commands::split(line) else {
      return;
    };
    let cmd = match commands::resolve(word) {
      Ok(cmd) => cmd,
      Err(e) => {
        println!("{}", e);
        return;
      }
    };

    match cmd.name {
      "login" => self.login(args),
      "logout" => self.session.logout(),
      "whoami" => self.whoami(),
      "page" => self.show_page(args),
      "feed" => self.show_feed(),
      "more" => self.more(),
      "add" => self.add(args),
      "toggle" => self.toggle(args),
      "delete" => self.delete(args),
      "help" => help(),
      "quit" => self.should_quit = true,
      _ => {}
    }
  }

  fn login(&self, args: &str) {
    let mut parts = args.split_whitespace();
    let (Some(login), Some(password), None) = (parts.next(), parts.next(), parts.next()) else {
      println!("usage: login <login> <password>");
      return;
    };
    let credentials = Credentials::new(login, password);
    let session = self.session.clone();
    let client = self.client.clone();
    let api = self.api.clone();
    self.spawn(async move {
      match session.login(&client, &api, credentials).await {
        Ok(Session {
          user_id: Some(id), ..
        }) => Ok(format!("logged in as user {}", id)),
        Ok(Session { login_error, .. }) => {
          Err(login_error.unwrap_or_else(|| LOGIN_ERROR_MESSAGE.to_string()))
        }
        Err(e) => Err(e.to_string()),
      }
    });
  }

  fn whoami(&self) {
    if SessionStore::is_logging_in(&self.client) {
      println!("logging in...");
      return;
    }
    let session = self.session.session();
    let Some(user_id) = session.user_id else {
      match session.login_error {
        Some(error) => println!("not logged in ({})", error),
        None => println!("not logged in"),
      }
      return;
    };
    let user = self.user.result();
    match user.data {
      Some(user) => println!("{} (user {})", user.login, user.id),
      None if user.is_error() => println!("user {} (profile unavailable)", user_id),
      None => println!("user {} (loading profile...)", user_id),
    }
  }

  fn show_page(&mut self, args: &str) {
    let number = match args.parse::<u32>() {
      Ok(n) if n >= 1 => n,
      _ => {
        println!("usage: page <n>, n >= 1");
        return;
      }
    };
    let user_id = self.session.current_user_id();
    match &mut self.view {
      View::Page {
        number: current,
        tasks,
      } => {
        *current = number;
        self.queries.show_page(tasks, number, user_id.as_deref());
      }
      View::Feed { .. } => {
        self.view = View::Page {
          number,
          tasks: self.queries.watch_page(number, user_id.as_deref()),
        };
      }
    }
    self.render();
  }

  fn show_feed(&mut self) {
    let logged_in = self.session.current_user_id().is_some();
    let tasks = self.queries.watch_feed(logged_in);
    let sentinel = ElementHandle::new();
    let mut cursor = CursorController::new(self.viewport.clone());
    cursor.attach(sentinel, fetch_next_page_on_visible(tasks.next_page()));
    self.view = View::Feed {
      tasks,
      _cursor: cursor,
      sentinel,
    };
    self.render();
  }

  /// Scroll to the end of the feed: the sentinel row comes into view and
  /// leaves it again once rendered.
  fn more(&self) {
    let View::Feed {
      tasks, sentinel, ..
    } = &self.view
    else {
      println!("more only works in the feed (type feed)");
      return;
    };
    if !tasks.has_next_page() && tasks.result().data.is_some() {
      println!("(end of list)");
      return;
    }
    self.viewport.report(*sentinel, true);
    self.viewport.report(*sentinel, false);
  }

  fn add(&self, text: &str) {
    if text.is_empty() {
      println!("usage: add <text>");
      return;
    }
    let actions = self.actions.clone();
    let text = text.to_string();
    self.spawn(async move {
      actions
        .create(&text)
        .await
        .map(|todo| format!("created {}", todo.id))
        .map_err(|e| e.to_string())
    });
  }

  fn toggle(&self, id: &str) {
    let Some(todo) = self.visible_todos().into_iter().find(|t| t.id == id) else {
      println!("no task {} on screen", id);
      return;
    };
    let actions = self.actions.clone();
    self.spawn(async move {
      actions
        .toggle(&todo)
        .await
        .map(|todo| {
          let state = if todo.done { "done" } else { "not done" };
          format!("{} is {}", todo.id, state)
        })
        .map_err(|e| e.to_string())
    });
  }

  fn delete(&self, id: &str) {
    if id.is_empty() {
      println!("usage: delete <id>");
      return;
    }
    let actions = self.actions.clone();
    let id = id.to_string();
    self.spawn(async move {
      actions
        .delete(&id)
        .await
        .map(|()| format!("deleted {}", id))
        .map_err(|e| e.to_string())
    });
  }

  fn visible_todos(&self) -> Vec<Todo> {
    match &self.view {
      View::Page { tasks, .. } => tasks.result().data.map(|p| p.data).unwrap_or_default(),
      View::Feed { tasks, .. } => tasks.items(),
    }
  }

  fn pending_counts(&self) -> (usize, usize, usize) {
    let mutations = self.client.mutations();
    (
      mutations.pending_count(&keys::create_todo()),
      mutations.pending_count(&keys::toggle_todo()),
      mutations.pending_count(&keys::delete_todo()),
    )
  }

  fn render(&mut self) {
    self.pending = self.pending_counts();
    let logged_in = self.session.current_user_id().is_some();
    let out = match &self.view {
      View::Page { number, tasks } => {
        render_page(*number, &tasks.result(), &self.actions, logged_in)
      }
      View::Feed { tasks, .. } => render_feed(tasks, &self.actions, logged_in),
    };
    println!();
    print!("{}", out);
  }
}

fn prompt() {
  print!("> ");
  let _ = std::io::stdout().flush();
}

fn help() {
  for cmd in COMMANDS {
    let aliases = if cmd.aliases.is_empty() {
      String::new()
    } else {
      format!(" ({})", cmd.aliases.join(", "))
    };
    println!("  {:<26} {}{}", cmd.usage, cmd.description, aliases);
  }
}

fn render_todo(todo: &Todo, actions: &TodoActions) -> String {
  let marker = if actions.is_delete_pending(&todo.id) {
    "  ...deleting"
  } else if actions.is_toggle_pending(&todo.id) {
    "  ...saving"
  } else {
    ""
  };
  let check = if todo.done { 'x' } else { ' ' };
  format!("  [{}] {}  ({}){}\n", check, todo.text, todo.id, marker)
}

fn status_suffix<T>(result: &QueryResult<T>, actions: &TodoActions) -> String {
  let mut suffix = String::new();
  if result.is_fetching() && result.data.is_some() {
    suffix.push_str("  (refreshing)");
  }
  if let Some(error) = result.error() {
    suffix.push_str(&format!("  (error: {})", error));
  }
  if actions.is_creating() {
    suffix.push_str("  (creating...)");
  }
  suffix
}

fn render_page(
  number: u32,
  result: &QueryResult<TodoPage>,
  actions: &TodoActions,
  logged_in: bool,
) -> String {
  if !logged_in {
    return "Log in to see your tasks: login <login> <password>\n".to_string();
  }
  let mut out = format!("Tasks, page {}{}\n", number, status_suffix(result, actions));
  let Some(page) = result.data() else {
    out.push_str(if result.is_error() {
      "  failed to load\n"
    } else {
      "  loading...\n"
    });
    return out;
  };
  if page.data.is_empty() {
    out.push_str("  no tasks\n");
  }
  for todo in &page.data {
    out.push_str(&render_todo(todo, actions));
  }
  out.push_str(&format!(
    "  page {} of {}, {} tasks{}\n",
    number,
    page.last,
    page.items,
    page.next.map(|n| format!(", next: page {}", n)).unwrap_or_default()
  ));
  out
}

fn render_feed(
  tasks: &InfiniteQueryObserver<Todo>,
  actions: &TodoActions,
  logged_in: bool,
) -> String {
  if !logged_in {
    return "Log in to see the feed: login <login> <password>\n".to_string();
  }
  let result = tasks.result();
  let mut out = format!("All tasks{}\n", status_suffix(&result, actions));
  let Some(feed) = result.data() else {
    out.push_str(if result.is_error() {
      "  failed to load\n"
    } else {
      "  loading...\n"
    });
    return out;
  };
  for todo in feed.items() {
    out.push_str(&render_todo(todo, actions));
  }
  if tasks.is_fetching_next_page() {
    out.push_str("  loading more...\n");
  } else if feed.has_next_page() {
    out.push_str("  (type more to load the next page)\n");
  } else {
    out.push_str("  (end of list)\n");
  }
  out
}
