mod app;
mod commands;
mod event;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use taskq::{config, logging};

#[derive(Parser, Debug)]
#[command(name = "taskq")]
#[command(about = "A terminal client for a paginated task list")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/taskq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the task API (overrides TASKQ_BASE_URL and the config file)
  #[arg(short, long)]
  base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Keep the guard alive so buffered log lines are flushed on exit
  let _guard = logging::init(&logging::default_dir()?)?;

  // Initialize and run the app
  let mut app = app::App::new(config, args.base_url.as_deref())?;
  app.run().await?;

  Ok(())
}
