use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use tablehold::audit::{AuditFile, AuditSink, MemorySink};
use tablehold::cache::InMemoryCache;
use tablehold::config::Config;
use tablehold::engine::{Dataset, Engine, InMemoryStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    tablehold::observability::init(config.metrics_port)?;

    let store = match &config.seed_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let data: Dataset = serde_json::from_str(&raw)?;
            info!(
                "seeding {} venues, {} tables, {} bookings from {}",
                data.venues.len(),
                data.tables.len(),
                data.bookings.len(),
                path.display()
            );
            InMemoryStore::from_dataset(data).await
        }
        None => InMemoryStore::new(),
    };

    let audit: Arc<dyn AuditSink> = match &config.audit_log {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let (file, prior) = AuditFile::resume(path)?;
            info!(
                "audit log {}: {} prior events{}",
                file.path().display(),
                prior.len(),
                prior.last().map_or(String::new(), |e| format!(", last at {}", e.at))
            );
            Arc::new(file)
        }
        None => Arc::new(MemorySink::new()),
    };

    let engine = Arc::new(Engine::new(
        Arc::new(store),
        Arc::new(InMemoryCache::new(config.engine.cache_ttl_ms)),
        audit,
        config.engine.clone(),
    ));

    tokio::spawn(tablehold::reaper::run_reaper(
        engine.clone(),
        Duration::from_secs(config.reaper_interval_secs.max(1)),
    ));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("tablehold listening on {addr}");
    info!("  hold: {} min", config.engine.hold_minutes());
    info!(
        "  audit log: {}",
        config
            .audit_log
            .as_ref()
            .map_or("in-memory".to_string(), |p| p.display().to_string())
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, tablehold::http::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("tablehold stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
    info!("shutdown signal received, draining requests");
}
