use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use session_orchestrator::api::session_routes;
use session_orchestrator::config::OrchestratorConfig;
use session_orchestrator::dispatcher::Dispatcher;
use session_orchestrator::llm::{LlmConfig, create_anthropic_stepper};
use session_orchestrator::notify::StatusNotifier;
use session_orchestrator::queue::TaskQueue;
use session_orchestrator::store::LibSqlBackend;
use session_orchestrator::watchdog::{Watchdog, WatchdogConfig};
use session_orchestrator::worker::{WorkerConfig, WorkerDeps, spawn_workers};

#[derive(Debug, Parser)]
#[command(name = "session-orchestrator", version, about = "Asynchronous session orchestration")]
struct Cli {
    /// Database file shared by every process (overrides ORCH_DB_PATH).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP/WebSocket API that creates and watches sessions.
    RunDispatcher {
        /// Listen port (overrides ORCH_HTTP_PORT).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Drain the task queue and run sessions.
    RunWorker {
        /// Concurrent delivery loops (overrides ORCH_WORKER_CONCURRENCY).
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Sweep for over-age sessions, stuck sessions and dead letters.
    RunWatchdog {
        /// Run a single sweep, print the report as JSON and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let mut config = OrchestratorConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = cli.db_path {
        config.db_path = path;
    }

    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let queue: Arc<dyn TaskQueue> = Arc::new(db.task_queue(config.queue_settings()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Command::RunDispatcher { port } => {
            let port = port.unwrap_or(config.http_port);
            let dispatcher = Dispatcher::new(db.clone(), queue, db.clone());
            let notifier = StatusNotifier::new(db.clone(), db.clone(), db.changes(), config.poll_interval);
            let app = session_routes(dispatcher, notifier);

            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("Failed to bind port {port}"))?;
            tracing::info!(port, "Dispatcher API listening");

            let mut shutdown = shutdown_rx;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
                .context("HTTP server failed")?;
        }

        Command::RunWorker { concurrency } => {
            let llm_config = LlmConfig::from_env()?;
            let stepper = Arc::new(create_anthropic_stepper(&llm_config)?);
            let deps = WorkerDeps {
                sessions: db.clone(),
                events: db.clone(),
                queue,
                threads: db.clone(),
                stepper,
            };
            let concurrency = concurrency.unwrap_or(config.worker_concurrency).max(1);
            tracing::info!(
                concurrency,
                visibility_timeout_secs = config.visibility_timeout.as_secs(),
                "Worker pool starting"
            );

            let handles = spawn_workers(
                deps,
                WorkerConfig::from_config(&config),
                concurrency,
                shutdown_rx,
            );
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Worker task panicked");
                }
            }
        }

        Command::RunWatchdog { once } => {
            let watchdog = Watchdog::new(
                db.clone(),
                db.clone(),
                queue,
                WatchdogConfig::from_config(&config),
            );
            if once {
                let report = watchdog.sweep().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                watchdog.spawn(shutdown_rx).await?;
            }
        }
    }

    Ok(())
}

/// Log to stderr, or to a daily rolling file under `ORCH_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("ORCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
