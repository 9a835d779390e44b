use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chromalife::config::{Config, ConfigError};
use chromalife::engine::Engine;
use chromalife::hub::Hub;
use chromalife::server::{router, AppState};
use chromalife::storage::{FileSeedStore, SeedStore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("could not bind port: {0}")]
    Bind(std::io::Error),

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("startup failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Wires config, storage, driver, hub and the HTTP surface together, then
/// waits for shutdown. Returns whether the run ended cleanly.
async fn run() -> Result<bool, StartupError> {
    let config = Config::from_env()?;
    info!(
        world_size = config.world_size,
        port = config.port,
        "starting chromalife"
    );

    let store: Arc<dyn SeedStore> = Arc::new(FileSeedStore::new(&config.db_url));
    let seed = match store.load_seed() {
        Ok(seed) => seed,
        Err(e) => {
            warn!("could not load stored seed, starting empty: {e}");
            None
        }
    };

    let cancel = CancellationToken::new();
    let (engine, snapshots) = Engine::new(config.world_size, seed.as_deref());
    let hub = Arc::new(Hub::new());

    tokio::spawn(Arc::clone(&engine).run(cancel.clone()));
    tokio::spawn(Arc::clone(&hub).run(snapshots, cancel.clone()));

    let state = AppState {
        engine: Arc::clone(&engine),
        hub,
        store,
        world_size: config.world_size,
        cancel: cancel.clone(),
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(StartupError::Bind)?;
    let addr = listener.local_addr().map_err(StartupError::Bind)?;
    info!(%addr, "listening");

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let shutdown = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    });

    tokio::select! {
        // The server ended on its own; surface whatever happened.
        result = &mut server => {
            cancel.cancel();
            if let Ok(Err(e)) = result {
                return Err(StartupError::Serve(e));
            }
        }
        _ = cancel.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(Ok(Err(e))) => return Err(StartupError::Serve(e)),
                Ok(_) => {}
                Err(_) => {
                    warn!("graceful shutdown timed out; aborting remaining sessions");
                    server.abort();
                }
            }
        }
    }

    info!("shut down");
    Ok(!engine.failed())
}
