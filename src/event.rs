use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// A line typed at the prompt
  Line(String),
  /// Standard input was closed
  Eof,
  /// Periodic tick for query polling and re-rendering
  Tick,
  /// A background action finished
  Notice(String),
  /// A background action failed
  Error(String),
}

/// Event handler that produces events from standard input and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn line reader
    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        let event = match lines.next_line().await {
          Ok(Some(line)) => Event::Line(line),
          Ok(None) | Err(_) => Event::Eof,
        };
        let eof = matches!(event, Event::Eof);
        if input_tx.send(event).is_err() || eof {
          break;
        }
      }
    });

    // Spawn ticker
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for background tasks to report back on
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
