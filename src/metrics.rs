use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime counters for the pipeline.
///
/// Purpose:
/// - Track active source loops
/// - Track tick outcomes (fetched / rate limited / failed)
/// - Track event bus throughput and drops
/// - Track router and notifier output
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update from any task
/// - Owned by the pipeline and shared through `Arc`
///
/// Per-source accounting lives in the monitor; these counters are
/// process-wide totals for the periodic `[METRICS]` log line.
#[derive(Default)]
pub struct RuntimeMetrics {
    // Scheduler
    pub sources_active: AtomicUsize,
    pub ticks: AtomicUsize,
    pub rate_limited_skips: AtomicUsize,
    pub fetch_errors: AtomicUsize,

    // Event bus
    pub events_published: AtomicUsize,
    pub events_dropped: AtomicUsize,

    // Router
    pub records_processed: AtomicUsize,
    pub entities_upserted: AtomicUsize,
    pub normalization_errors: AtomicUsize,
    pub storage_errors: AtomicUsize,
    pub prediction_errors: AtomicUsize,

    // Notifier
    pub notifications_sent: AtomicUsize,
    pub notifications_dropped: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }

    /// One-line summary, low noise, for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "[METRICS] src={} ticks={} limited={} fetch_err={} pub={} dropped={} processed={} upserted={} norm_err={} store_err={} pred_err={} notify={} notify_dropped={}",
            Self::get(&self.sources_active),
            Self::get(&self.ticks),
            Self::get(&self.rate_limited_skips),
            Self::get(&self.fetch_errors),
            Self::get(&self.events_published),
            Self::get(&self.events_dropped),
            Self::get(&self.records_processed),
            Self::get(&self.entities_upserted),
            Self::get(&self.normalization_errors),
            Self::get(&self.storage_errors),
            Self::get(&self.prediction_errors),
            Self::get(&self.notifications_sent),
            Self::get(&self.notifications_dropped),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reflects_counters() {
        let m = RuntimeMetrics::default();
        RuntimeMetrics::incr(&m.ticks);
        RuntimeMetrics::incr(&m.ticks);
        RuntimeMetrics::incr(&m.events_dropped);

        let line = m.summary();
        assert!(line.starts_with("[METRICS]"));
        assert!(line.contains("ticks=2"));
        assert!(line.contains("dropped=1"));
    }
}
