use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservd_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: resources created.
pub const RESOURCES_CREATED_TOTAL: &str = "reservd_resources_created_total";

/// Counter: reservations accepted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "reservd_reservations_created_total";

/// Counter: reservation requests refused. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "reservd_reservations_rejected_total";

/// Histogram: time spent waiting for a resource's serialization scope.
pub const RESERVE_LOCK_WAIT_SECONDS: &str = "reservd_reserve_lock_wait_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "reservd_tenants_active";

/// Counter: queries refused because their database could not be opened.
pub const TENANT_ERRORS_TOTAL: &str = "reservd_tenant_errors_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "reservd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectReservations { .. } => "select_reservations",
        Command::Health => "health",
    }
}
