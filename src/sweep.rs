use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::{Ms, Ownership, DAY_MS};
use crate::observability;

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_overdue: usize,
    pub already_overdue: usize,
    pub failed: usize,
    pub needing_return: usize,
}

/// One pass: materialize overdue bookings, then list borrowed gear that
/// should already be back with its owner. Safe to run repeatedly.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let started = Instant::now();
    let overdue = engine.mark_overdue().await;

    let now = engine.now();
    let needing_return = engine.resources_needing_return().await;
    for r in &needing_return {
        if let Ownership::OnLoan {
            owner,
            return_due: Some(due),
        } = &r.ownership
        {
            let days: Ms = (now - due) / DAY_MS;
            warn!(
                "resource {} ({}) is {days} days past its return date to {owner}",
                r.id,
                r.name.as_deref().unwrap_or("unnamed"),
            );
        }
    }

    let report = SweepReport {
        marked_overdue: overdue.marked,
        already_overdue: overdue.already_overdue,
        failed: overdue.failed,
        needing_return: needing_return.len(),
    };
    metrics::gauge!(observability::SWEEP_NEEDING_RETURN).set(report.needing_return as f64);
    metrics::histogram!(observability::SWEEP_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    info!(
        "sweep: {} marked overdue, {} already overdue, {} failed, {} owed back",
        report.marked_overdue, report.already_overdue, report.failed, report.needing_return
    );
    report
}

/// Background task running `sweep_once` every `period`.
pub async fn run_sweep(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// Background task that snapshots the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            debug!("compactor: {appends} appends since last compaction");
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
