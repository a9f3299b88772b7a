use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use tether::api::SyncRound;
use tether::{Config, OfflineClient};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Offline-first sync agent for a personal data API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tether/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Deliver all pending writes and unsynced traces once
  Drain,
  /// Show how much work is still pending
  Status,
  /// Reset trace uploads interrupted mid-flight
  Sweep,
  /// Sweep and drain periodically until interrupted
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = tether::logging::init(&tether::db::data_dir()?.join("logs"))?;

  let client = OfflineClient::new(&config)?;

  match args.command {
    Command::Drain => {
      let round = client.drain_all().await?;
      log_round(&round);
    }
    Command::Status => {
      let summary = client.pending_summary()?;
      for (kind, count) in &summary.posts {
        println!("{:<10} pending writes:  {}", kind, count);
      }
      for (kind, count) in &summary.deletes {
        println!("{:<10} pending deletes: {}", kind, count);
      }
      println!(
        "traces     unsynced: {}  syncing: {}  synced: {}  rejected: {}",
        summary.traces.unsynced,
        summary.traces.syncing,
        summary.traces.synced,
        summary.traces.rejected
      );
    }
    Command::Sweep => {
      let reset = client.sweep_stale()?;
      println!("reset {} stale uploads", reset);
    }
    Command::Run => {
      let mut ticker = tokio::time::interval(Duration::from_secs(config.sync.interval_secs));
      info!(interval_secs = config.sync.interval_secs, "sync agent started");
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if let Err(e) = client.sweep_stale() {
              error!(error = %e, "stale sweep failed");
            }
            match client.drain_all().await {
              Ok(round) => log_round(&round),
              Err(e) => error!(error = %e, "sync round failed"),
            }
          }
          _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            break;
          }
        }
      }
    }
  }

  Ok(())
}

fn log_round(round: &SyncRound) {
  for report in round.drains.iter().filter(|r| r.attempted > 0) {
    info!(
      kind = %report.kind,
      op = report.op.suffix(),
      delivered = report.delivered.len(),
      failed = report.failures.len(),
      "drained"
    );
  }
  info!(
    claimed = round.traces.claimed,
    synced = round.traces.synced,
    failed = round.traces.failed,
    rejected = round.traces.rejected,
    offline = round.traces.skipped_offline,
    "traces uploaded"
  );
}
