//! Processing router.
//!
//! Consumes `CollectionSuccess` events, normalizes every entity of
//! the record, upserts it, asks the prediction service about the
//! kinds that feed predictions, and announces the processed record.
//!
//! Failures are isolated per entity. A bad entity or a failed write
//! never aborts the rest of the batch; failed writes are parked in
//! a bounded replay queue.

pub mod normalize;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use crate::bus::{EventBus, PipelineEvent, ProcessedUpdate};
use crate::collaborators::{EventSink, Notification, PREDICTION_KIND, PredictionService, Storage};
use crate::error::NormalizationError;
use crate::metrics::RuntimeMetrics;
use crate::schema::{CollectedRecord, DataKind};

use normalize::{NormalizedEntity, entity_list, normalize};

const DEFAULT_REPLAY_CAPACITY: usize = 1_000;

/// Work that failed against a collaborator and can be retried.
#[derive(Debug, Clone)]
pub enum PendingWork {
    Upsert {
        kind: String,
        external_id: String,
        fields: Value,
    },
    Predict {
        kind: DataKind,
        external_id: String,
        features: Value,
    },
}

/// Outcome of processing one record.
#[derive(Debug, Clone)]
pub struct ProcessingReport {
    pub record: CollectedRecord,
    pub upserted: usize,
    pub predictions: usize,

    /// (entity index, error) for every malformed entity
    pub normalization_errors: Vec<(usize, NormalizationError)>,

    /// External ids left unprocessed because a collaborator failed
    pub unprocessed: Vec<String>,

    pub update: ProcessedUpdate,
}

pub struct Router {
    storage: Arc<dyn Storage>,
    prediction: Option<Arc<dyn PredictionService>>,
    sink: Arc<dyn EventSink>,
    bus: Arc<EventBus>,
    metrics: Arc<RuntimeMetrics>,
    replay: Mutex<VecDeque<PendingWork>>,
    replay_capacity: usize,
}

impl Router {
    pub fn new(
        storage: Arc<dyn Storage>,
        prediction: Option<Arc<dyn PredictionService>>,
        sink: Arc<dyn EventSink>,
        bus: Arc<EventBus>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            storage,
            prediction,
            sink,
            bus,
            metrics,
            replay: Mutex::new(VecDeque::new()),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }

    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity.max(1);
        self
    }

    pub fn has_prediction_service(&self) -> bool {
        self.prediction.is_some()
    }

    pub async fn storage_reachable(&self) -> bool {
        self.storage.probe().await
    }

    /// None when no prediction service is configured.
    pub async fn prediction_reachable(&self) -> Option<bool> {
        match &self.prediction {
            Some(p) => Some(p.probe().await),
            None => None,
        }
    }

    /// Consumes events until `shutdown` fires, then drains whatever
    /// is still queued before returning.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PipelineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event).await;
                    }
                    break;
                }
            }
        }
        debug!("router stopped");
    }

    async fn handle_event(&self, event: PipelineEvent) {
        if let PipelineEvent::CollectionSuccess(record) = event {
            self.process(Arc::unwrap_or_clone(record)).await;
        }
    }

    /// Processes one collected record. Never fails as a whole.
    pub async fn process(&self, mut record: CollectedRecord) -> ProcessingReport {
        let mut normalization_errors = Vec::new();
        let mut unprocessed = Vec::new();
        let mut entity_ids = Vec::new();
        let mut upserted = 0;
        let mut predictions = 0;

        let entities = match entity_list(record.kind, &record.payload) {
            Ok(entities) => entities,
            Err(e) => {
                warn!("record {} from '{}': {}", record.id, record.source_id, e);
                RuntimeMetrics::incr(&self.metrics.normalization_errors);
                normalization_errors.push((0, e));
                Vec::new()
            }
        };

        for (idx, raw) in entities.iter().enumerate() {
            let entity = match normalize(record.kind, record.sport, raw) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(
                        "record {} from '{}': entity #{} skipped: {}",
                        record.id, record.source_id, idx, e
                    );
                    RuntimeMetrics::incr(&self.metrics.normalization_errors);
                    normalization_errors.push((idx, e));
                    continue;
                }
            };

            match self.store_entity(record.kind, &entity).await {
                EntityOutcome::Stored { predicted } => {
                    upserted += 1;
                    predictions += usize::from(predicted);
                    entity_ids.push(entity.external_id);
                }
                EntityOutcome::StoredWithoutPrediction => {
                    upserted += 1;
                    unprocessed.push(entity.external_id.clone());
                    entity_ids.push(entity.external_id);
                }
                EntityOutcome::Failed => unprocessed.push(entity.external_id),
            }
        }

        record.processed = true;
        RuntimeMetrics::incr(&self.metrics.records_processed);

        let update = ProcessedUpdate {
            record_id: record.id,
            source_id: record.source_id.clone(),
            kind: record.kind,
            sport: record.sport,
            update: record.kind.update_name(),
            entity_ids,
            failed: normalization_errors.len() + unprocessed.len(),
            processed_at: Utc::now(),
        };

        info!(
            "processed {} record from '{}': {} upserted, {} malformed, {} unprocessed",
            record.kind,
            record.source_id,
            upserted,
            normalization_errors.len(),
            unprocessed.len()
        );

        self.bus.publish(PipelineEvent::ProcessedUpdate(update.clone()));
        self.sink.notify(Notification::RecordUpdated(update.clone()));

        ProcessingReport {
            record,
            upserted,
            predictions,
            normalization_errors,
            unprocessed,
            update,
        }
    }

    async fn store_entity(&self, kind: DataKind, entity: &NormalizedEntity) -> EntityOutcome {
        if let Err(e) = self
            .storage
            .upsert_entity(kind.as_str(), &entity.external_id, &entity.fields)
            .await
        {
            error!("upsert {} '{}' failed: {}", kind, entity.external_id, e);
            RuntimeMetrics::incr(&self.metrics.storage_errors);
            self.park(PendingWork::Upsert {
                kind: kind.as_str().to_string(),
                external_id: entity.external_id.clone(),
                fields: entity.fields.clone(),
            });
            return EntityOutcome::Failed;
        }
        RuntimeMetrics::incr(&self.metrics.entities_upserted);

        let (Some(service), Some(features)) = (&self.prediction, &entity.features) else {
            return EntityOutcome::Stored { predicted: false };
        };
        if !kind.feeds_predictions() {
            return EntityOutcome::Stored { predicted: false };
        }

        if self.predict_and_store(service.as_ref(), kind, &entity.external_id, features).await {
            EntityOutcome::Stored { predicted: true }
        } else {
            EntityOutcome::StoredWithoutPrediction
        }
    }

    /// Returns false (and parks the work) if either the prediction
    /// or its upsert failed.
    async fn predict_and_store(
        &self,
        service: &dyn PredictionService,
        kind: DataKind,
        external_id: &str,
        features: &Value,
    ) -> bool {
        let result = match service.predict(kind.as_str(), features).await {
            Ok(r) => r,
            Err(e) => {
                warn!("prediction for {} '{}' failed: {}", kind, external_id, e);
                RuntimeMetrics::incr(&self.metrics.prediction_errors);
                self.park(PendingWork::Predict {
                    kind,
                    external_id: external_id.to_string(),
                    features: features.clone(),
                });
                return false;
            }
        };

        let prediction_id = format!("{kind}:{external_id}");
        let fields = json!({
            "kind": kind,
            "entity_id": external_id,
            "value": result.value,
            "confidence": result.confidence,
            "generated_at": Utc::now(),
        });

        if let Err(e) = self
            .storage
            .upsert_entity(PREDICTION_KIND, &prediction_id, &fields)
            .await
        {
            error!("upsert prediction '{}' failed: {}", prediction_id, e);
            RuntimeMetrics::incr(&self.metrics.storage_errors);
            self.park(PendingWork::Upsert {
                kind: PREDICTION_KIND.to_string(),
                external_id: prediction_id,
                fields,
            });
            return false;
        }
        true
    }

    fn park(&self, work: PendingWork) {
        let mut queue = self.replay.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.replay_capacity {
            queue.pop_front();
            warn!("replay queue full, oldest pending write discarded");
        }
        queue.push_back(work);
    }

    pub fn pending_replays(&self) -> usize {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Re-attempts every parked write once. Work that fails again is
    /// parked again. Returns the number of items that succeeded.
    pub async fn replay_pending(&self) -> usize {
        let pending: Vec<_> = self
            .replay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut succeeded = 0;
        for work in pending {
            let ok = match &work {
                PendingWork::Upsert { kind, external_id, fields } => {
                    match self.storage.upsert_entity(kind, external_id, fields).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!("replay of '{}' failed again: {}", external_id, e);
                            self.park(work.clone());
                            false
                        }
                    }
                }
                PendingWork::Predict { kind, external_id, features } => match &self.prediction {
                    // predict_and_store parks on failure itself
                    Some(service) => {
                        self.predict_and_store(service.as_ref(), *kind, external_id, features)
                            .await
                    }
                    None => false,
                },
            };
            succeeded += usize::from(ok);
        }

        if succeeded > 0 {
            info!("replayed {} pending write(s)", succeeded);
        }
        succeeded
    }
}

enum EntityOutcome {
    Stored { predicted: bool },
    StoredWithoutPrediction,
    Failed,
}
