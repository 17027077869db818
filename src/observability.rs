use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: slot searches served.
pub const SLOT_SEARCHES_TOTAL: &str = "drivetime_slot_searches_total";

/// Histogram: slot search latency in seconds.
pub const SLOT_SEARCH_DURATION_SECONDS: &str = "drivetime_slot_search_duration_seconds";

/// Histogram: slots returned per search.
pub const SLOTS_RETURNED: &str = "drivetime_slots_returned";

/// Counter: conflicts found by advisory detection. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "drivetime_conflicts_total";

/// Counter: bookings committed through `book_lesson`.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "drivetime_bookings_committed_total";

/// Counter: commits refused because they would double-book someone.
pub const COMMITS_REJECTED_TOTAL: &str = "drivetime_commits_rejected_total";

/// Counter: bookings materialized from recurrence patterns.
pub const OCCURRENCES_GENERATED_TOTAL: &str = "drivetime_occurrences_generated_total";

/// Counter: pattern occurrences left unbooked because of a double booking.
pub const OCCURRENCES_SKIPPED_TOTAL: &str = "drivetime_occurrences_skipped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "drivetime_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "drivetime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "drivetime_wal_flush_batch_size";

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
