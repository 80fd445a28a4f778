use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use nix::sys::statvfs::statvfs;
use nix::unistd::geteuid;
use tracing::{error, info};

use ntt_copier::config::{WorkerConfig, MIN_ARCHIVE_FREE_BYTES};
use ntt_copier::db;
use ntt_copier::types::MediumId;
use ntt_copier::worker::{self, WorkerOptions};

/// Content-addressed filesystem-image copy worker.
#[derive(Parser)]
#[command(name = "ntt-copier")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the claim/analyze/execute loop until the queue drains or a limit
    /// or shutdown signal is reached.
    Copy {
        #[arg(long)]
        medium_id: String,
        #[arg(long, default_value_t = 100)]
        batch_size: i64,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value = "worker-1")]
        worker_id: String,
    },
    /// Print queue depth for a medium without doing any work.
    Stats {
        #[arg(long)]
        medium_id: String,
    },
    /// Run the startup max-retries sweep standalone.
    Sweep {
        #[arg(long)]
        medium_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    if !geteuid().is_root() {
        error!("ntt-copier must run as root to access raw device images and by-hash storage");
        return Ok(ExitCode::FAILURE);
    }

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;

    match cli.command {
        Command::Copy {
            medium_id,
            batch_size,
            limit,
            dry_run,
            worker_id,
        } => {
            preflight(&config)?;

            let mut client = postgres::Client::connect(&config.db_url, postgres::NoTls)?;
            let shutdown = worker::install_shutdown_flag()?;
            let opts = WorkerOptions {
                medium_id: MediumId::new(medium_id),
                worker_id,
                batch_size,
                limit,
                dry_run,
            };

            let processed = worker::run(&mut client, &config, &opts, &shutdown)?;
            info!(processed, shutdown = shutdown.load(Ordering::Relaxed), "copy run finished");
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { medium_id } => {
            let mut client = postgres::Client::connect(&config.db_url, postgres::NoTls)?;
            let stats = db::queue_stats(&mut client, &medium_id)?;
            println!(
                "total={} copied={} claimed={} failed={}",
                stats.total, stats.copied, stats.claimed, stats.failed
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { medium_id } => {
            let mut client = postgres::Client::connect(&config.db_url, postgres::NoTls)?;
            let swept = ntt_copier::claim::sweep_max_retries(&mut client, &MediumId::new(medium_id))?;
            info!(swept, "max-retries sweep complete");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Validate the archive root has enough free space before starting a run.
fn preflight(config: &WorkerConfig) -> anyhow::Result<()> {
    let stats = statvfs(&config.archive_root)?;
    let free_bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    if free_bytes < MIN_ARCHIVE_FREE_BYTES {
        anyhow::bail!(
            "archive root {} has {} bytes free, below the {} byte minimum",
            config.archive_root.display(),
            free_bytes,
            MIN_ARCHIVE_FREE_BYTES
        );
    }
    Ok(())
}
