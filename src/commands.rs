//! Subcommand handlers.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use casesync::cache::{QueryCache, SqliteStore};
use casesync::client::ResourceClient;
use casesync::compliance::types::Decision;
use casesync::compliance::{ComplianceClient, ComplianceQuery, ComplianceSync};
use casesync::credentials::{CredentialProvider, EnvToken};
use casesync::push::PushChannel;

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Open the push channel and print every event it delivers
  Watch,
  /// Poll a job until it completes or fails
  Job {
    id: String,
  },
  /// Fetch and print an applicant
  Applicant {
    id: String,
  },
  /// Record a review decision for one applicant
  Review {
    id: String,
    /// approve, reject or escalate
    decision: Decision,
    #[arg(short, long)]
    notes: Option<String>,
  },
  /// Apply one decision to many applicants
  BulkReview {
    decision: Decision,
    #[arg(required = true)]
    ids: Vec<String>,
  },
}

/// Everything a command needs, built once from the configuration.
pub struct Context {
  config: Config,
  credentials: Arc<dyn CredentialProvider>,
  sync: ComplianceSync,
}

impl Context {
  pub fn new(config: Config) -> Result<Self> {
    // Fail early with a readable message instead of on the first request.
    EnvToken::lookup()?;
    let credentials: Arc<dyn CredentialProvider> = Arc::new(EnvToken);

    let http = ResourceClient::new(config.base_url()?, credentials.clone(), config.request_timeout())?;

    let mut cache = QueryCache::builder().policy(config.stale_policy());
    if config.cache.persist {
      match SqliteStore::open() {
        Ok(store) => cache = cache.store(store),
        Err(e) => warn!(error = %e, "snapshot store unavailable, running without persistence"),
      }
    }

    let sync = ComplianceSync::new(
      ComplianceClient::new(http),
      cache.build(),
      config.poll_intervals(),
    );

    Ok(Self {
      config,
      credentials,
      sync,
    })
  }
}

fn print_json(value: &impl Serialize) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", text);
  Ok(())
}

pub async fn run(command: Command, ctx: Context) -> Result<()> {
  match command {
    Command::Watch => watch(&ctx).await,
    Command::Job { id } => {
      let handle = ctx.sync.poll_job(&id, |job| info!(id = %job.id, status = ?job.status, "job finished"));
      tokio::select! {
        finished = handle.finished() => {
          if !finished {
            return Err(eyre!("Polling for job {} was cancelled", id));
          }
        }
        _ = tokio::signal::ctrl_c() => return Ok(()),
      }
      let entry = ctx.sync.cache().read(&ComplianceQuery::Job { id }.key());
      print_json(&entry.data)
    }
    Command::Applicant { id } => print_json(&ctx.sync.applicant(&id).await?),
    Command::Review { id, decision, notes } => {
      print_json(&ctx.sync.review(&id, decision, notes).await?)
    }
    Command::BulkReview { decision, ids } => {
      let outcome = ctx.sync.bulk_review(&ids, decision).await;
      print_json(&outcome)?;
      if outcome.failed > 0 {
        return Err(eyre!("{} of {} reviews failed", outcome.failed, outcome.total));
      }
      Ok(())
    }
  }
}

async fn watch(ctx: &Context) -> Result<()> {
  let channel = PushChannel::websocket(
    ctx.config.push_url()?,
    ctx.credentials.clone(),
    ctx.sync.cache().clone(),
    ctx.config.backoff(),
  );
  let mut events = channel.events();
  let mut state = channel.watch_state();
  channel.connect();

  loop {
    tokio::select! {
      event = events.recv() => match event {
        Ok(event) => print_json(&event)?,
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "event listener fell behind"),
        Err(RecvError::Closed) => break,
      },
      changed = state.changed() => {
        if changed.is_err() {
          break;
        }
        let current = *state.borrow_and_update();
        eprintln!("push channel {}", current);
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  channel.disconnect().await;
  Ok(())
}
