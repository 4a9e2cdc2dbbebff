//! Quiesce CLI - qs command

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli_lib::config::{Config, SchedulerMode};
use cli_lib::pipeline;
use cli_lib::report::ReportSink;
use durable::DurableScheduler;
use engine::{DebounceEngine, EngineConfig, Scheduler, Sink};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

/// Quiesce - coalesce bursts of messages into per-sender batch reports
#[derive(Parser)]
#[command(name = "qs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Debounce envelope lines from stdin into per-sender reports
    Run {
        /// Quiet period in milliseconds (overrides the config file)
        #[arg(long)]
        quiet_ms: Option<u64>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use the durable scheduler with its job store at this path
        #[arg(long)]
        durable: Option<PathBuf>,

        /// Append logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            quiet_ms,
            config,
            durable,
            log_file,
        } => run(quiet_ms, config, durable, log_file).await,
        Commands::Config { config } => {
            let config = Config::load(config.as_deref())?;
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

async fn run(
    quiet_ms: Option<u64>,
    config_path: Option<PathBuf>,
    durable_path: Option<PathBuf>,
    log_file: Option<PathBuf>,
) -> Result<()> {
    let _log_guard = init_tracing(log_file.as_deref())?;

    let mut config = Config::load(config_path.as_deref())?;
    if let Some(quiet_ms) = quiet_ms {
        config.engine.quiet_period_ms = quiet_ms;
    }
    if let Some(path) = durable_path {
        config.scheduler.mode = SchedulerMode::Durable;
        config.scheduler.path = Some(path);
    }

    let sink: Arc<dyn Sink> = Arc::new(ReportSink::stdout());
    let engine_config = EngineConfig {
        quiet_period: config.quiet_period(),
    };

    let engine = match config.scheduler.mode {
        SchedulerMode::Timer => DebounceEngine::new(engine_config, sink),
        SchedulerMode::Durable => {
            let path = config
                .scheduler
                .path
                .clone()
                .context("scheduler mode is durable but no job store path is set")?;
            let scheduler = DurableScheduler::open(&path)?;
            let engine = DebounceEngine::with_scheduler(
                engine_config,
                sink,
                Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            );
            scheduler.attach(engine.handle());
            engine
        }
    };

    info!(
        quiet_period_ms = config.engine.quiet_period_ms,
        "reading envelopes from stdin"
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stats = tokio::select! {
        stats = pipeline::run(stdin, &engine) => Some(stats?),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            None
        }
    };

    // Deliver whatever is still inside its quiet period so nothing
    // buffered is lost on shutdown.
    let drained = engine.drain_all().await;

    match stats {
        Some(stats) => eprintln!(
            "{} {} accepted, {} rejected, {} batch(es) drained at shutdown",
            "done:".green().bold(),
            stats.accepted,
            stats.rejected,
            drained
        ),
        None => eprintln!(
            "{} {} batch(es) drained at shutdown",
            "interrupted:".yellow().bold(),
            drained
        ),
    }
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().context("log file path has no file name")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            // Reports own stdout; keep logs on stderr.
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
