use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::RuntimeMetrics;
use crate::schema::{CollectedRecord, CollectionError, DataKind, Sport};

/// Closed set of events flowing through the pipeline.
///
/// - CollectionSuccess: a source produced a record (scheduler)
/// - CollectionError:   a tick failed or timed out (scheduler)
/// - ProcessedUpdate:   the router finished a record (router)
///
/// Records are shared behind `Arc` so fan-out to several
/// subscribers does not copy payloads.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    CollectionSuccess(Arc<CollectedRecord>),
    CollectionError(CollectionError),
    ProcessedUpdate(ProcessedUpdate),
}

impl PipelineEvent {
    pub fn source_id(&self) -> &str {
        match self {
            PipelineEvent::CollectionSuccess(r) => &r.source_id,
            PipelineEvent::CollectionError(e) => &e.source_id,
            PipelineEvent::ProcessedUpdate(u) => &u.source_id,
        }
    }
}

/// Emitted once per processed record for downstream subscribers
/// (UI streams, notification hub).
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedUpdate {
    pub record_id: Uuid,
    pub source_id: String,
    pub kind: DataKind,
    pub sport: Sport,

    /// Kind-specific update name, e.g. "player_updated"
    pub update: &'static str,

    /// External ids of the entities stored from this record
    pub entity_ids: Vec<String>,

    pub failed: usize,
    pub processed_at: DateTime<Utc>,
}

/// Fan-out event bus.
///
/// Each subscriber owns a bounded queue. Publishing:
/// - never blocks the producer (`try_send`)
/// - drops the event for a subscriber whose queue is full
/// - forgets subscribers whose receiver was dropped
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<PipelineEvent>>>,
    capacity: usize,
    metrics: Arc<RuntimeMetrics>,
}

impl EventBus {
    pub fn new(capacity: usize, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            metrics,
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: PipelineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                RuntimeMetrics::incr(&self.metrics.events_dropped);
                warn!("event bus subscriber full, dropping event for '{}'", event.source_id());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        RuntimeMetrics::incr(&self.metrics.events_published);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(source: &str) -> PipelineEvent {
        PipelineEvent::CollectionError(CollectionError::new(source, "boom"))
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let bus = EventBus::new(8, Arc::new(RuntimeMetrics::default()));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(error_event("s1"));

        assert_eq!(a.recv().await.unwrap().source_id(), "s1");
        assert_eq!(b.recv().await.unwrap().source_id(), "s1");
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let metrics = Arc::new(RuntimeMetrics::default());
        let bus = EventBus::new(1, metrics.clone());
        let mut rx = bus.subscribe();

        bus.publish(error_event("first"));
        bus.publish(error_event("second"));

        assert_eq!(RuntimeMetrics::get(&metrics.events_dropped), 1);
        assert_eq!(rx.recv().await.unwrap().source_id(), "first");
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = EventBus::new(4, Arc::new(RuntimeMetrics::default()));
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        drop(rx);

        bus.publish(error_event("s"));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
