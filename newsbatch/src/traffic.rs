use anyhow::Result;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::storage::Store;

/// Counter key holding the total of all visits. Never a valid IP address.
pub const TOTAL_VISITS_KEY: &str = "TOTAL_PV";

/// Buffered visits that trigger a flush
pub const DEFAULT_FLUSH_THRESHOLD: i64 = 10;

#[derive(Debug, Default)]
struct PendingVisits {
    total: i64,
    per_ip: HashMap<String, i64>,
}

/// Result of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Visits drained from the buffer
    pub visits: i64,
    /// Counter rows written, the total row included
    pub rows_written: usize,
    pub rows_failed: usize,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        self.visits == 0
    }
}

/// Buffers per-request visit counts in memory and writes them to the store in bulk.
///
/// Unflushed visits are lost if the process exits without calling [`flush`](Self::flush).
pub struct TrafficAggregator {
    store: Arc<dyn Store>,
    threshold: i64,
    pending: Mutex<PendingVisits>,
}

impl TrafficAggregator {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Self::with_threshold(store, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_threshold(store: Arc<dyn Store>, threshold: i64) -> Arc<Self> {
        Arc::new(Self {
            store,
            threshold: threshold.max(1),
            pending: Mutex::new(PendingVisits::default()),
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingVisits> {
        // Counters stay consistent even if a holder panicked
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one visit from `ip`. Never does I/O; when the buffer reaches the threshold a
    /// flush task is spawned on the current Tokio runtime.
    pub fn record_visit(self: &Arc<Self>, ip: &str) {
        let should_flush = {
            let mut pending = self.lock_pending();
            pending.total += 1;
            *pending.per_ip.entry(ip.to_string()).or_insert(0) += 1;
            pending.total >= self.threshold
        };

        if !should_flush {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let aggregator = Arc::clone(self);
                handle.spawn(async move {
                    aggregator.flush().await;
                });
            }
            Err(_) => warn!("no tokio runtime available, visit flush deferred"),
        }
    }

    /// Visits buffered and not yet flushed
    pub fn pending_visits(&self) -> i64 {
        self.lock_pending().total
    }

    /// Drain the buffer into the store.
    ///
    /// A no-op when nothing is buffered, so redundant concurrent flushes are harmless.
    /// A failed row is logged and its delta dropped; other rows are still written.
    pub async fn flush(&self) -> FlushReport {
        let (visits, per_ip) = {
            let mut pending = self.lock_pending();
            if pending.total == 0 {
                return FlushReport::default();
            }
            let taken = mem::take(&mut *pending);
            (taken.total, taken.per_ip)
        };

        let mut report = FlushReport {
            visits,
            ..Default::default()
        };

        match self
            .store
            .upsert_increment_counter(TOTAL_VISITS_KEY, visits)
            .await
        {
            Ok(()) => {
                report.rows_written += 1;
                info!("flushed {} visits to total counter", visits);
            }
            Err(e) => {
                report.rows_failed += 1;
                error!("failed to update total visits (+{}): {:#}", visits, e);
            }
        }

        for (ip, count) in per_ip {
            match self.store.upsert_increment_counter(&ip, count).await {
                Ok(()) => {
                    report.rows_written += 1;
                    debug!("flushed {} visits for {}", count, ip);
                }
                Err(e) => {
                    report.rows_failed += 1;
                    error!("failed to update visits for {} (+{}): {:#}", ip, count, e);
                }
            }
        }

        report
    }

    /// Persisted total visit count; buffered visits are not included.
    pub async fn total_visits(&self) -> Result<i64> {
        Ok(self
            .store
            .find_counter(TOTAL_VISITS_KEY)
            .await?
            .map(|c| c.count)
            .unwrap_or(0))
    }
}
