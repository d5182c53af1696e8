use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::Backend;
use services::{
    image_repository::ImageRepository, locator::LocatorCodec, object_store::build_store,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("image_gateway=info")),
        )
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-gateway with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if cfg.store.backend == Backend::FileSystem && !Path::new(&cfg.store.storage_dir).exists() {
        fs::create_dir_all(&cfg.store.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.store.storage_dir);
    }

    // --- Initialize core service ---
    let store = build_store(&cfg.store)?;
    let locators = match &cfg.public_base_url {
        Some(base_url) => LocatorCodec::public(base_url, &cfg.store.bucket),
        None => LocatorCodec::bare(),
    };
    let repository =
        ImageRepository::new(store, locators).with_update_strategy(cfg.update_strategy);
    tracing::info!(
        backend = repository.store().backend(),
        update_strategy = %cfg.update_strategy,
        "Object store ready"
    );

    // --- Build router ---
    let state = AppState::new(repository, cfg.store.request_timeout);
    let shutdown = state.shutdown.clone();
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

/// Resolve on Ctrl-C, cancelling every in-flight request scope.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cancelling in-flight requests");
    shutdown.cancel();
}
