use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liveness_core::{spawn_engine, SessionOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod replay;

#[derive(Parser)]
#[command(name = "liveness", version, about = "Challenge-response liveness verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session against a recorded landmark trace (JSON lines)
    Replay {
        trace: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        settle_ms: Option<u64>,
        #[arg(long)]
        blink_reset_ms: Option<u64>,
        #[arg(long)]
        frame_interval_ms: Option<u64>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Require both eyes to close for the blink challenge
        #[arg(long)]
        reject_wink: bool,
        /// Size of the blank frames used for records without an image
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Write the result JSON here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Thresholds {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Replay {
            trace,
            config,
            settle_ms,
            blink_reset_ms,
            frame_interval_ms,
            timeout_ms,
            reject_wink,
            width,
            height,
            output,
        } => {
            let mut config = config::load(config.as_deref())?;
            let timings = &mut config.timings;
            if let Some(ms) = settle_ms {
                timings.settle_delay_ms = ms;
            }
            if let Some(ms) = blink_reset_ms {
                timings.blink_reset_delay_ms = ms;
            }
            if let Some(ms) = frame_interval_ms {
                timings.frame_interval_ms = ms;
            }
            if timeout_ms.is_some() {
                timings.session_timeout_ms = timeout_ms;
            }
            if reject_wink {
                config.thresholds.accept_single_eye_closure = false;
            }

            let records = Arc::new(replay::load_trace(&trace)?);
            tracing::info!(path = %trace.display(), frames = records.len(), "trace loaded");

            let source_records = records.clone();
            let engine = spawn_engine(
                move || Ok(replay::TraceSource::new(source_records, width, height)),
                move || Ok(replay::TraceDetector::new(records)),
                config,
            )?;

            let runner = engine.clone();
            let mut session = tokio::spawn(async move { runner.run_session().await });
            let outcome = tokio::select! {
                joined = &mut session => joined.context("session task failed")??,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted; cancelling session");
                    engine.cancel().await?;
                    session.await.context("session task failed")??
                }
            };

            let (json, passed) = match &outcome {
                SessionOutcome::Completed(result) => {
                    tracing::info!(success = result.success(), "session completed");
                    (serde_json::to_string_pretty(result)?, result.success())
                }
                SessionOutcome::Cancelled { reason, reached } => {
                    let json = serde_json::json!({ "cancelled": reason, "reached": reached });
                    (serde_json::to_string_pretty(&json)?, false)
                }
            };

            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
            Ok(if passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Thresholds { config } => {
            let config = config::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
