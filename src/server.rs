use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::rest::{self, AppState};
use crate::config::Config;
use crate::domain::crypto::{ensure_data_dir, SecretCipher};
use crate::domain::engine::AutomationEngine;
use crate::domain::registry::InstallationRegistry;
use crate::domain::store::ClusterStore;
use crate::shell::{RemoteShell, SshShell};

pub async fn run(config: Config) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.daemon.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "kubeforge daemon starting");

    // Shared services
    ensure_data_dir(&config.store.data_dir)?;
    let cipher = SecretCipher::load(config.store.secret.as_deref(), &config.store.key_file())?;
    let store = Arc::new(ClusterStore::new(config.store.clusters_file(), cipher));
    let shell: Arc<dyn RemoteShell> = Arc::new(SshShell);
    let engine = AutomationEngine::new(shell, config.engine.clone());
    let registry = InstallationRegistry::new(engine, store.clone(), config.registry.clone());

    let app_state = AppState {
        registry: registry.clone(),
        store: store.clone(),
        started: Instant::now(),
    };

    // The dashboard is served from a different origin during development.
    let app = rest::router(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let http_addr = &config.daemon.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    // Spawn retention sweep loop
    if config.registry.sweep_interval_secs > 0 {
        let sweep_registry = registry.clone();
        let interval_secs = config.registry.sweep_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // Skip the immediate first tick; nothing can be expired yet.
            interval.tick().await;
            loop {
                interval.tick().await;
                sweep_registry.sweep();
            }
        });
    }

    // Run HTTP server with graceful shutdown
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("kubeforge daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
