//! vibevault-worker: runs metadata enrichment for saved links.
//!
//! In poll mode the process scans the job store; in push mode it consumes
//! job signals from Redis. Either way a reconciler sweeps stuck jobs, and
//! SIGINT/SIGTERM stop intake and wait for in-flight jobs.

mod config;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vibevault_db::{Database, PoolConfig};
use vibevault_jobs::{
    ConsumerBuilder, ConsumerConfig, FetcherConfig, HttpFetcher, JobProducer, JobRepository,
    LinkRepository, MessageQueue, MetadataHandler, Reconciler, ReconcilerConfig, RedisQueue,
    WorkerBuilder, WorkerConfig, WorkerHandle,
};

use crate::config::{Args, Mode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, daily rotation)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "vibevault=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "vibevault_worker=info,vibevault_jobs=info,vibevault_db=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("vibevault-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    let policy = args.policy();
    info!(
        subsystem = "worker",
        op = "startup",
        mode = ?args.mode,
        %policy,
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Starting vibevault-worker"
    );

    let db = Database::connect_with_config(&args.database_url, PoolConfig::from_env()).await?;
    if args.migrate {
        info!("Running database migrations...");
        db.migrate().await?;
        info!("Database migrations complete");
    }

    let jobs: Arc<dyn JobRepository> = Arc::new(db.jobs.clone());
    let links: Arc<dyn LinkRepository> = Arc::new(db.links.clone());
    let fetcher = Arc::new(HttpFetcher::new(FetcherConfig::from_env())?);
    let handler = MetadataHandler::new(links.clone(), fetcher);
    let mut reconciler = Reconciler::new(
        jobs.clone(),
        links.clone(),
        policy,
        ReconcilerConfig::from_env(),
    );

    let mut handles: Vec<(&str, WorkerHandle)> = Vec::new();
    match args.mode {
        Mode::Poll => {
            let worker = WorkerBuilder::new(jobs.clone())
                .with_config(WorkerConfig::from_env())
                .with_policy(policy)
                .with_handler(handler)
                .build();
            handles.push(("poll runner", worker.start()));
        }
        Mode::Push => {
            let config = ConsumerConfig::from_env();
            let redis = RedisQueue::connect(&args.redis_url).await?;
            // Deliveries left unacked by a previous process go back first.
            let recovered = redis.recover_processing(&config.queue_name).await?;
            if recovered > 0 {
                warn!(
                    queue = %config.queue_name,
                    recovered,
                    "Recovered unacknowledged deliveries"
                );
            }
            let queue: Arc<dyn MessageQueue> = Arc::new(redis);

            reconciler = reconciler.with_producer(
                JobProducer::new(jobs.clone(), links.clone())
                    .with_queue(queue.clone(), config.queue_name.clone()),
            );
            let consumer = ConsumerBuilder::new(jobs.clone(), queue)
                .with_config(config)
                .with_policy(policy)
                .with_handler(handler)
                .build();
            handles.push(("push runner", consumer.start()));
        }
    }

    if args.no_reconciler {
        info!("Reconciler disabled");
    } else {
        handles.push(("reconciler", reconciler.start()));
    }

    wait_for_shutdown_signal().await;

    for (name, handle) in &handles {
        if let Err(e) = handle.shutdown().await {
            error!(component = %name, error = %e, "Shutdown did not complete cleanly");
        }
    }

    info!(subsystem = "worker", op = "shutdown", "vibevault-worker stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
