//! myrient-dl CLI - download titles and run their preparation pipelines
//!
//! Usage:
//!   myrient-dl get <url>... [--platform ps3] [--jobs 2]
//!   myrient-dl config

use clap::{Parser, Subcommand};
use myrient_dl::{Config, Event, JobId, JobSnapshot, MyrientDownloader, Platform, Title, utils};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "myrient-dl")]
#[command(about = "Resumable downloader and preparation pipeline for disc images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON config file
    #[arg(short, long, global = true, env = "MYRIENT_DL_CONFIG")]
    config: Option<PathBuf>,

    /// Download directory (overrides the config file)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more titles and run their pipelines to completion
    Get {
        /// Download URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Platform, which fixes the stage pipeline: ps3, psn or other
        #[arg(short, long, default_value = "other")]
        platform: String,

        /// Maximum concurrent jobs (overrides the config file)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(output) = cli.output {
        config.download.download_dir = output;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Get {
            urls,
            platform,
            jobs,
        } => {
            if let Some(jobs) = jobs {
                config.queue.max_concurrent_jobs = jobs;
            }
            let platform = Platform::from_str(&platform)?;
            run_get(config, urls, platform).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config '{}': {e}", path.display()))?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(Config::default()),
    }
}

async fn run_get(
    config: Config,
    urls: Vec<String>,
    platform: Platform,
) -> Result<(), Box<dyn std::error::Error>> {
    let downloader = MyrientDownloader::new(config).await?;
    let mut events = downloader.subscribe();

    let mut pending: HashSet<JobId> = HashSet::new();
    for url in urls {
        let name = utils::file_name_from_url(&url)?;
        let id = downloader
            .submit(
                Title {
                    name,
                    url,
                    approximate_size: None,
                },
                platform,
            )
            .await?;
        pending.insert(id);
    }

    let mut failed = 0usize;
    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, shutting down (partial downloads are kept)");
                downloader.shutdown().await;
                for snapshot in downloader.jobs().await {
                    eprintln!("{}", summary_line(&snapshot));
                }
                std::process::exit(130);
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "event stream lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match event {
            Event::Progress {
                id,
                bytes_done,
                bytes_total,
                speed_bps,
                ..
            } => {
                let eta = utils::eta(bytes_done, bytes_total, speed_bps)
                    .map(utils::format_eta)
                    .unwrap_or_else(|| "--:--".to_string());
                let total = bytes_total
                    .map(utils::format_size)
                    .unwrap_or_else(|| "?".to_string());
                print!(
                    "\r[{id}] {} / {total}  {}  eta {eta}    ",
                    utils::format_size(bytes_done),
                    utils::format_speed(speed_bps),
                );
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            Event::StageStarted { id, stage, .. } => {
                println!("[{id}] stage: {stage}");
            }
            Event::StageSkipped { id, stage, reason, .. } => {
                println!("[{id}] stage {stage} skipped ({reason})");
            }
            Event::ToolOutput { id, line, .. } => {
                tracing::debug!(job = %id, "{line}");
            }
            Event::Complete { id, path } => {
                println!("\n[{id}] done: {}", path.display());
                pending.remove(&id);
            }
            Event::Failed {
                id, stage, error, ..
            } => {
                eprintln!("\n[{id}] failed in {stage} stage: {error}");
                failed += 1;
                pending.remove(&id);
            }
            Event::Cancelled { id } => {
                eprintln!("\n[{id}] cancelled");
                failed += 1;
                pending.remove(&id);
            }
            _ => {}
        }
    }

    downloader.shutdown().await;
    // Give the runtime a beat to flush task teardown logs
    tokio::time::sleep(Duration::from_millis(10)).await;

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// One-line job summary printed when a session is interrupted
fn summary_line(snapshot: &JobSnapshot) -> String {
    let total = snapshot
        .bytes_total
        .map(utils::format_size)
        .unwrap_or_else(|| "?".to_string());
    format!(
        "[{}] {} {} ({} / {total})",
        snapshot.id,
        snapshot.status,
        snapshot.name,
        utils::format_size(snapshot.bytes_done),
    )
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use myrient_dl::Status;

    #[test]
    fn summary_line_names_id_status_and_progress() {
        let snapshot = JobSnapshot {
            id: JobId::new(3),
            name: "Game (USA).iso".to_string(),
            status: Status::Cancelled,
            stage_index: 0,
            stage: None,
            stage_count: 1,
            bytes_done: 1536,
            bytes_total: Some(4096),
            error: None,
            destination: "/downloads/game/Game (USA).iso".into(),
            created_at: chrono::Utc::now(),
            finished_at: None,
        };

        assert_eq!(
            summary_line(&snapshot),
            "[3] cancelled Game (USA).iso (1.50 KiB / 4.00 KiB)"
        );
    }
}
