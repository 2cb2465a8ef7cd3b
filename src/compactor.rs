use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::DurableStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that compacts a tenant's WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<DurableStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns true if a compaction ran.
pub(crate) async fn compact_if_due(store: &DurableStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            // Retried on the next tick
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
