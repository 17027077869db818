use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

const COMPACT_POLL: Duration = Duration::from_secs(30);

/// Compact the WAL once it has grown by `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "WAL compacted");
    Ok(true)
}

/// One maintenance pass: drop notification channels nobody listens to,
/// then compact if the WAL has grown past `threshold`.
pub async fn sweep(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let pruned = engine.notify.prune();
    if pruned > 0 {
        debug!(pruned, "idle notification channels dropped");
    }
    compact_if_needed(engine, threshold).await
}

/// Materialize whatever active patterns are missing. Returns the number of
/// bookings created.
pub async fn top_up_patterns(engine: &Engine) -> Result<usize, EngineError> {
    let reports = engine.generate_all().await?;
    let created: usize = reports.iter().map(|r| r.created.len()).sum();
    let skipped: usize = reports.iter().map(|r| r.skipped.len()).sum();
    if created > 0 || skipped > 0 {
        info!(patterns = reports.len(), created, skipped, "recurring lessons topped up");
    }
    Ok(created)
}

/// Background task that keeps the WAL and the notification hub from
/// growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = interval(COMPACT_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Background task that re-expands recurrence patterns every `every`.
/// The first pass runs one period after start.
pub async fn run_pattern_topup(engine: Arc<Engine>, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = top_up_patterns(&engine).await {
            warn!("pattern top-up failed: {e}");
        }
    }
}
