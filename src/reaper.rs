use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that marks lapsed holds released and prunes old rows.
/// Hygiene only: every reader already treats a lapsed hold as free.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        match engine.reap_expired(now).await {
            Ok(0) => debug!("reaper: nothing expired"),
            Ok(n) => info!("reaped {n} expired holds"),
            Err(e) => warn!("reaper pass failed: {e}"),
        }
    }
}
