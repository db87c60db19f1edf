use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::{LimitOptions, Scope, Strategy};
use floodgate::service::{AdmissionService, CleanupWorker};

/// Admission control engine.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Configuration file (YAML); environment variables prefixed with
    /// FLOODGATE__ override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume units for a key and print the decision
    Hit {
        key: String,
        #[command(flatten)]
        limit: LimitArgs,
    },
    /// Print the status of a key without consuming anything
    Status {
        key: String,
        #[command(flatten)]
        limit: LimitArgs,
    },
    /// Clear all counting state for a key
    Clear {
        key: String,
        /// Who requested the clear, for the audit log
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Run one cleanup pass and print the number of records removed
    Sweep,
    /// Run the periodic cleanup worker until interrupted
    Run,
}

#[derive(Debug, Args)]
struct LimitArgs {
    #[arg(long)]
    max_requests: Option<u64>,
    #[arg(long)]
    window_ms: Option<u64>,
    /// fixed_window, sliding_window or token_bucket
    #[arg(long)]
    strategy: Option<Strategy>,
    #[arg(long)]
    amount: Option<u64>,
    /// Recorded with the key's state
    #[arg(long)]
    user_id: Option<String>,
}

impl LimitArgs {
    fn options(&self) -> LimitOptions {
        LimitOptions {
            max_requests: self.max_requests,
            window_ms: self.window_ms,
            strategy: self.strategy,
            amount: self.amount,
            scope: Scope {
                user_id: self.user_id.clone(),
                ..Scope::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Floodgate");

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    info!(
        store = ?config.store.kind,
        cache = ?config.cache.kind,
        strategy = %config.limits.strategy,
        "Configuration loaded"
    );

    let service = Arc::new(AdmissionService::from_config(&config).await?);

    match cli.command {
        Command::Hit { key, limit } => {
            let status = service.increment_limit(&key, &limit.options()).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Status { key, limit } => {
            let status = service.check_limit(&key, &limit.options()).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Clear { key, user_id } => {
            let existed = service.clear_limit(&key, user_id.as_deref()).await?;
            println!("{}", serde_json::json!({ "key": key, "cleared": existed }));
        }
        Command::Sweep => {
            let removed = service.cleanup().await?;
            println!("{}", serde_json::json!({ "removed": removed }));
        }
        Command::Run => {
            let worker = CleanupWorker::spawn(service.clone(), config.cleanup.interval());
            shutdown_signal().await;
            worker.stop().await;
        }
    }

    service.shutdown().await;
    info!("Floodgate stopped");
    Ok(())
}

/// Install the log subscriber. `RUST_LOG` overrides the default `info` level.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
