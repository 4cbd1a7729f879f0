//! docstream entrypoint.
//!
//! `serve` runs the HTTP API, `worker` runs the job worker pool, `sweep` reconciles orphaned
//! blobs, and `standalone` runs all three in one process over in-memory infrastructure.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docstream::{
    api, config, logging, queue::JobQueue, runtime::Runtime, service::Pipeline, worker::WorkerPool,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "docstream",
    about = "Asynchronous document ingestion with semantic search"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve,
    /// Consume jobs from the broker.
    Worker,
    /// Delete blobs that no job refers to.
    Sweep {
        /// Keep sweeping at the configured interval instead of exiting after one pass.
        #[arg(long)]
        watch: bool,
    },
    /// API, workers and sweeper in one process with in-memory queue, blobs and index.
    Standalone,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("docstream: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    logging::init_tracing();
    let config = config::init_config().context("failed to load configuration")?;
    let cancel = shutdown_token();

    match cli.command {
        Command::Serve => {
            let Runtime {
                pipeline,
                sweeper,
                queue,
                ..
            } = Runtime::connect(config)
                .await
                .context("failed to start API server")?;
            let sweeping = tokio::spawn(sweeper.run(config.orphan_sweep_interval, cancel.clone()));
            let served = serve(config, pipeline, cancel.clone()).await;
            cancel.cancel();
            let _ = sweeping.await;
            close_queue(queue.as_ref()).await;
            served?;
        }
        Command::Worker => {
            let runtime = Runtime::connect(config)
                .await
                .context("failed to start workers")?;
            let pool = WorkerPool::spawn(
                runtime.worker.clone(),
                config.worker_count,
                config.worker_prefetch,
                cancel.clone(),
            );
            pool.join().await;
            close_queue(runtime.queue.as_ref()).await;
        }
        Command::Sweep { watch } => {
            let runtime = Runtime::connect(config)
                .await
                .context("failed to start sweeper")?;
            if watch {
                runtime
                    .sweeper
                    .run(config.orphan_sweep_interval, cancel.clone())
                    .await;
            } else {
                let report = runtime
                    .sweeper
                    .run_once()
                    .await
                    .context("orphan sweep failed")?;
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Command::Standalone => {
            let Runtime {
                pipeline,
                worker,
                sweeper,
                queue,
                metrics,
            } = Runtime::standalone(config)
                .await
                .context("failed to start standalone pipeline")?;
            let pool = WorkerPool::spawn(
                worker.clone(),
                config.worker_count,
                config.worker_prefetch,
                cancel.clone(),
            );
            let sweeping = tokio::spawn(sweeper.run(config.orphan_sweep_interval, cancel.clone()));
            let served = serve(config, pipeline, cancel.clone()).await;
            cancel.cancel();
            pool.join().await;
            let _ = sweeping.await;
            close_queue(queue.as_ref()).await;
            tracing::info!(metrics = ?metrics.snapshot(), "Standalone pipeline stopped");
            served?;
        }
    }
    Ok(())
}

async fn serve(
    config: &config::Config,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = api::create_router(pipeline);
    let (listener, port) = bind_listener(config.server_port)
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server terminated unexpectedly")
}

async fn close_queue(queue: &dyn JobQueue) {
    if let Err(err) = queue.close().await {
        tracing::warn!(error = %err, "Failed to close job queue");
    }
}

/// Token cancelled on ctrl-c.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(err) => tracing::error!(error = %err, "Failed to listen for ctrl-c"),
        }
        trigger.cancel();
    });
    cancel
}

async fn bind_listener(server_port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
