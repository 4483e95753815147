mod commands;
mod config;
mod logging;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "casesync")]
#[command(about = "Keep a local view of compliance review data in sync with the server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/casesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let ctx = commands::Context::new(config)?;
  commands::run(args.command, ctx).await?;

  Ok(())
}
