use std::net::SocketAddr;

// ── Cache ───────────────────────────────────────────────────────

/// Counter: `get` calls served from a live entry. Labels: key.
pub const CACHE_HITS_TOTAL: &str = "washline_cache_hits_total";

/// Counter: `get` calls that had to load or join a load. Labels: key.
pub const CACHE_MISSES_TOTAL: &str = "washline_cache_misses_total";

/// Counter: loader invocations actually started. Labels: key.
pub const CACHE_LOADS_TOTAL: &str = "washline_cache_loads_total";

/// Counter: loader invocations that failed. Labels: key.
pub const CACHE_LOAD_FAILURES_TOTAL: &str = "washline_cache_load_failures_total";

/// Counter: failed loads answered with the previous value.
pub const CACHE_STALE_FALLBACKS_TOTAL: &str = "washline_cache_stale_fallbacks_total";

/// Counter: entries removed by invalidation.
pub const CACHE_INVALIDATIONS_TOTAL: &str = "washline_cache_invalidations_total";

// ── Store ───────────────────────────────────────────────────────

/// Counter: store calls retried after a transient failure. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "washline_store_retries_total";

/// Counter: external modifications noticed by the change detector.
pub const CHANGE_DETECTIONS_TOTAL: &str = "washline_change_detections_total";

// ── Scheduler ───────────────────────────────────────────────────

/// Counter: notifications delivered. Labels: kind.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "washline_notifications_sent_total";

/// Counter: notifications the notifier failed to deliver. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "washline_notifications_failed_total";

/// Counter: bookings removed after their completion notice.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "washline_bookings_completed_total";

/// Counter: overdue bookings removed by the catch-up sweep.
pub const BOOKINGS_SWEPT_TOTAL: &str = "washline_bookings_swept_total";

/// Histogram: scheduler tick duration in seconds.
pub const TICK_DURATION_SECONDS: &str = "washline_tick_duration_seconds";

// ── Lifecycle ───────────────────────────────────────────────────

/// Counter: booking transitions. Labels: transition, outcome.
pub const TRANSITIONS_TOTAL: &str = "washline_transitions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
