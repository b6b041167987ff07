#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use imgpress_core::{Compressor, TinifyClient};
use server::config::{CliArgs, Mode, ServerConfig};
use server::pool::{PooledCompressor, manager::WorkerPool};
use server::service::handler::CompressService;
use server::telemetry::init_telemetry;
use server::watcher::FolderWatcher;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let client = TinifyClient::new(config.tinify.clone())?;
    if let Err(e) = client.check_ready() {
        tracing::warn!("{e}. Compression requests will fail until it is set.");
    }

    let client: Arc<dyn Compressor> = Arc::new(client);
    let pool = Arc::new(WorkerPool::spawn(
        Arc::clone(&client),
        config.num_workers,
        config.shutdown_timeout,
    ));
    let compressor = Arc::new(PooledCompressor::new(Arc::clone(&pool), client));
    let service = CompressService::new(config.clone(), pool.clone(), compressor);

    let watcher_token = CancellationToken::new();
    let watcher = match config.mode {
        Mode::Local => {
            let watcher = FolderWatcher::new(
                service.orchestrator().clone(),
                pool,
                config.watch.clone(),
                config.default_format,
            );
            Some(watcher.spawn(watcher_token.clone()).await?)
        }
        Mode::Online => None,
    };

    let listener = TcpListener::bind(config.server_addr.as_str()).await?;
    log_startup_info(&config.server_addr, &config);

    let res = axum::serve(listener, service.clone().router())
        .with_graceful_shutdown(shutdown_signal(service, watcher_token))
        .await;

    if let Some(watcher) = watcher {
        if let Err(e) = watcher.await {
            tracing::error!("Folder watcher panicked: {e}");
        }
    }

    match &res {
        Ok(()) => tracing::info!("Service shut down successfully"),
        Err(e) => tracing::error!("Server error: {e}"),
    }

    providers.shutdown();
    Ok(res?)
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting image compressor on {} with full config: {:#?}",
            addr,
            config
        );
    } else {
        tracing::info!(
            "Starting image compressor on {} in {:?} mode with {} workers (credential set: {})",
            addr,
            config.mode,
            config.num_workers,
            config.has_credential()
        );
    }
}

async fn shutdown_signal(service: CompressService, watcher_token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Stop picking up new files
    watcher_token.cancel();

    // 2. Drain in-flight batches and stop the workers
    if let Err(e) = service.shutdown().await {
        tracing::error!("Error during service shutdown: {e:?}");
    }
}
