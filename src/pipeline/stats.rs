// Analytics counters: tallies from every pipeline stage.
//
// Each stage bumps its own counters; readers take a `snapshot()` for the
// periodic stats log and the status command. Counters are plain atomics, the
// last-error slots sit behind a std Mutex that is never held across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub webhook_received: AtomicU64,
    pub webhook_rejected: AtomicU64,
    pub polled: AtomicU64,
    pub poll_errors: AtomicU64,
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub backpressure_waits: AtomicU64,
    pub enriched: AtomicU64,
    pub enrichment_failed: AtomicU64,
    pub enrichment_ms_total: AtomicU64,
    pub media_fetched: AtomicU64,
    pub media_failed: AtomicU64,
    pub delivered: AtomicU64,
    pub delivery_failed: AtomicU64,
    pub delivery_retries: AtomicU64,
    last_errors: Mutex<LastErrors>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LastErrors {
    pub polling: Option<StageError>,
    pub enrichment: Option<StageError>,
    pub delivery: Option<StageError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub message: String,
    pub at: String,
}

#[derive(Debug, Clone, Copy)]
pub enum Stage {
    Polling,
    Enrichment,
    Delivery,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub webhook_received: u64,
    pub webhook_rejected: u64,
    pub polled: u64,
    pub poll_errors: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub backpressure_waits: u64,
    pub enriched: u64,
    pub enrichment_failed: u64,
    /// Mean wall time of a finished enrichment, in milliseconds.
    pub enrichment_avg_ms: u64,
    pub media_fetched: u64,
    pub media_failed: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub delivery_retries: u64,
    pub last_errors: LastErrors,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self, stage: Stage, message: impl Into<String>) {
        let entry = StageError {
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.last_errors.lock().unwrap_or_else(PoisonError::into_inner);
        match stage {
            Stage::Polling => errors.polling = Some(entry),
            Stage::Enrichment => errors.enrichment = Some(entry),
            Stage::Delivery => errors.delivery = Some(entry),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let finished = load(&self.enriched) + load(&self.enrichment_failed);
        let enrichment_avg_ms = if finished == 0 {
            0
        } else {
            load(&self.enrichment_ms_total) / finished
        };

        StatsSnapshot {
            webhook_received: load(&self.webhook_received),
            webhook_rejected: load(&self.webhook_rejected),
            polled: load(&self.polled),
            poll_errors: load(&self.poll_errors),
            accepted: load(&self.accepted),
            duplicates: load(&self.duplicates),
            backpressure_waits: load(&self.backpressure_waits),
            enriched: load(&self.enriched),
            enrichment_failed: load(&self.enrichment_failed),
            enrichment_avg_ms,
            media_fetched: load(&self.media_fetched),
            media_failed: load(&self.media_failed),
            delivered: load(&self.delivered),
            delivery_failed: load(&self.delivery_failed),
            delivery_retries: load(&self.delivery_retries),
            last_errors: self
                .last_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_and_average() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.enriched);
        PipelineStats::incr(&stats.enrichment_failed);
        PipelineStats::add(&stats.enrichment_ms_total, 300);
        PipelineStats::incr(&stats.accepted);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.enrichment_avg_ms, 150);
        assert!(snap.last_errors.delivery.is_none());
    }

    #[test]
    fn test_last_error_overwrites() {
        let stats = PipelineStats::new();
        stats.record_error(Stage::Delivery, "first");
        stats.record_error(Stage::Delivery, "second");
        let snap = stats.snapshot();
        assert_eq!(snap.last_errors.delivery.unwrap().message, "second");
    }
}
