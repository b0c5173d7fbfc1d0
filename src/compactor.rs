use std::time::Duration;

use tracing::{info, warn};

use crate::ledger::WalLedger;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once the log has grown by `threshold` appends. Returns whether
/// it ran.
pub async fn compact_if_due(ledger: &WalLedger, threshold: u64) -> bool {
    let appends = ledger.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match ledger.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(ledger: WalLedger, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&ledger, threshold).await;
    }
}
