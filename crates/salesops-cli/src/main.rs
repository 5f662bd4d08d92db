mod input;
mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use salesops_pipeline::service::DEFAULT_HISTORY_LIMIT;
use salesops_pipeline::{
    CancellationToken, HistoryKind, OperationResult, OperationStatus, PipelineService,
};
use serde::Serialize;
use settings::{init_logging, load_config, ConfigOverrides};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "salesops")]
#[command(about = "Recurring sales forecast pipeline", long_about = None)]
struct Cli {
    /// YAML file with pipeline settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(flatten)]
    overrides: ConfigOverrides,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append cleaned observations (JSON lines, `-` for stdin) to the raw stream
    Load { file: PathBuf },
    /// Run the pipeline once if the stream has rows past the watermark
    Trigger,
    /// Poll for new data and run the pipeline until interrupted
    Watch,
    /// Compare the newest candidate against production
    Evaluate,
    /// Compare feature statistics against the drift baseline
    Drift {
        /// Record the current statistics as the new baseline instead
        #[arg(long, default_value_t = false)]
        rebaseline: bool,
    },
    /// Show the model currently serving
    Production,
    /// Consistent health snapshot of registry, stream and drift
    Status,
    /// Newest-first rows from one of the history tables
    History {
        /// models, comparisons, drift, runs or triggers
        #[arg(long, default_value = "runs")]
        table: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// Clear a halt recorded after a registry invariant violation
    Resume,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!(event = "cli_error", error = %format!("{err:#}"));
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), &cli.overrides, |key| {
        std::env::var(key).ok()
    })?;
    let service = PipelineService::open(config)
        .context("Failed to open pipeline store (check --db or SALESOPS_DB_PATH)")?;

    match cli.command {
        Commands::Load { file } => {
            let batch = input::read_observations(&file)?;
            emit(&service.load_batch(batch.observations, batch.rejected_lines.len()))
        }
        Commands::Trigger => emit(&service.trigger_pipeline_if_new_data()),
        Commands::Watch => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(watch_loop(Arc::new(service)))
        }
        Commands::Evaluate => emit(&service.run_promotion_evaluation()),
        Commands::Drift { rebaseline } => {
            if rebaseline {
                emit(&service.reset_drift_baseline())
            } else {
                emit(&service.run_drift_check())
            }
        }
        Commands::Production => emit(&service.get_production_model()),
        Commands::Status => emit(&service.status()),
        Commands::History { table, limit } => {
            let kind: HistoryKind = table.parse()?;
            emit(&service.history(kind, limit))
        }
        Commands::Resume => emit(&service.resume()),
    }
}

/// Ticks every poll interval until Ctrl-C. An interrupt mid-run cancels the
/// run at its next stage boundary.
async fn watch_loop(service: Arc<PipelineService>) -> Result<ExitCode> {
    let interval = service.config().poll_interval().max(Duration::from_secs(1));
    let cancel = CancellationToken::new();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "watch_interrupt");
            signal_cancel.cancel();
            let _ = shutdown_tx.send(true);
        }
    });

    info!(event = "watch_start", poll_interval_secs = interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        if cancel.is_cancelled() {
            break;
        }

        let worker = service.clone();
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || worker.trigger_pipeline_with(&token))
            .await
            .context("Pipeline worker panicked")?;

        match result.status {
            OperationStatus::Skipped => {}
            OperationStatus::Halted => {
                print_json(&result)?;
                warn!(event = "watch_stop", reason = %result.message);
                return Ok(exit_code(result.status));
            }
            _ => print_json(&result)?,
        }
    }

    info!(event = "watch_stop", reason = "interrupted");
    Ok(ExitCode::SUCCESS)
}

fn emit<T: Serialize>(result: &OperationResult<T>) -> Result<ExitCode> {
    print_json(result)?;
    Ok(exit_code(result.status))
}

fn print_json<T: Serialize>(result: &OperationResult<T>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(result).context("Failed to encode result")?;
    println!("{rendered}");
    Ok(())
}

fn exit_code(status: OperationStatus) -> ExitCode {
    match status {
        OperationStatus::Ok | OperationStatus::Skipped => ExitCode::SUCCESS,
        OperationStatus::Failed => ExitCode::from(1),
        OperationStatus::Busy | OperationStatus::NoSignal => ExitCode::from(2),
        OperationStatus::Halted => ExitCode::from(3),
    }
}
