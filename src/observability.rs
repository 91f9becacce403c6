use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: endpoint, status.
pub const REQUESTS_TOTAL: &str = "tablehold_requests_total";

/// Histogram: request latency in seconds. Labels: endpoint.
pub const REQUEST_DURATION_SECONDS: &str = "tablehold_request_duration_seconds";

// ── Holds ───────────────────────────────────────────────────────

pub const LOCKS_CREATED_TOTAL: &str = "tablehold_locks_created_total";

/// Counter: create attempts refused because the slot was already held.
pub const LOCKS_CONFLICTED_TOTAL: &str = "tablehold_locks_conflicted_total";

pub const LOCKS_EXTENDED_TOTAL: &str = "tablehold_locks_extended_total";
pub const LOCKS_RELEASED_TOTAL: &str = "tablehold_locks_released_total";

/// Counter: lapsed holds marked released by the reaper.
pub const LOCKS_REAPED_TOTAL: &str = "tablehold_locks_reaped_total";

// ── Availability cache ──────────────────────────────────────────

pub const CACHE_HITS_TOTAL: &str = "tablehold_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "tablehold_cache_misses_total";
pub const CACHE_INVALIDATIONS_TOTAL: &str = "tablehold_cache_invalidations_total";

// ── Allocation & bookings ───────────────────────────────────────

/// Counter: allocation decisions. Labels: pass (priority, join_group, efficiency, none).
pub const ALLOCATIONS_TOTAL: &str = "tablehold_allocations_total";

pub const BOOKINGS_COMMITTED_TOTAL: &str = "tablehold_bookings_committed_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "tablehold_bookings_cancelled_total";

// ── Audit log ───────────────────────────────────────────────────

/// Histogram: audit group-commit flush duration in seconds.
pub const AUDIT_FLUSH_DURATION_SECONDS: &str = "tablehold_audit_flush_duration_seconds";

/// Histogram: audit group-commit batch size (events per flush).
pub const AUDIT_FLUSH_BATCH_SIZE: &str = "tablehold_audit_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Collapse a request path to its route so labels stay low-cardinality.
pub fn endpoint_label(path: &str) -> &'static str {
    match path {
        "/locks/create" => "lock_create",
        "/locks/extend" => "lock_extend",
        "/locks/release" => "lock_release",
        "/tables/allocate" => "table_allocate",
        "/bookings/commit" => "booking_commit",
        "/bookings/cancel" => "booking_cancel",
        "/health" => "health",
        p if p.starts_with("/availability/") => "availability",
        _ => "other",
    }
}
