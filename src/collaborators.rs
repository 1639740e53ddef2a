//! Contracts for the external collaborators of the pipeline.
//!
//! - Storage:           durable entity upserts (keyed by external id)
//! - PredictionService: predict(kind, features) -> value + confidence
//! - EventSink:         fire-and-forget notifications (UI / hub)
//!
//! The pipeline never depends on a concrete backend; the shipped
//! implementations below are wired in by `main` from configuration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::OnceCell;

use crate::bus::ProcessedUpdate;
use crate::config::{PredictionConfig, StorageConfig};
use crate::error::{PredictionError, StorageError};
use crate::monitor::Alert;

/// Kind tag used when storing predictions next to entities.
pub const PREDICTION_KIND: &str = "prediction";

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn upsert_entity(&self, kind: &str, external_id: &str, fields: &Value) -> Result<(), StorageError>;

    /// Cheap reachability probe used by the health check.
    async fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    #[serde(alias = "prediction")]
    pub value: f64,
    pub confidence: f64,
}

#[async_trait::async_trait]
pub trait PredictionService: Send + Sync {
    async fn predict(&self, kind: &str, features: &Value) -> Result<PredictionResult, PredictionError>;

    async fn probe(&self) -> bool;
}

/// Notifications pushed to the event sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    RecordUpdated(ProcessedUpdate),
    Alert(Alert),
}

/// Fire-and-forget receiver of notifications.
///
/// CONTRACT:
/// - `notify` must return immediately
/// - delivery failures are the sink's business; the pipeline never
///   waits on or retries against a sink
pub trait EventSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _notification: Notification) {}
}

// ------------------------------------------------------------
// In-memory storage
// ------------------------------------------------------------
//
// Used when no Redis is configured, and by tests. Individual
// external ids can be marked as failing to exercise the router's
// replay path.
//
#[derive(Default)]
pub struct MemoryStorage {
    entities: Mutex<HashMap<(String, String), Value>>,
    failing_ids: Mutex<HashSet<String>>,
    upserts: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &str, external_id: &str) -> Option<Value> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind.to_string(), external_id.to_string()))
            .cloned()
    }

    /// Number of distinct stored entities of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(k, _)| k == kind)
            .count()
    }

    /// Total successful upsert calls.
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::Relaxed)
    }

    pub fn fail_for(&self, external_id: &str, failing: bool) {
        let mut ids = self.failing_ids.lock().unwrap_or_else(PoisonError::into_inner);
        if failing {
            ids.insert(external_id.to_string());
        } else {
            ids.remove(external_id);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn upsert_entity(&self, kind: &str, external_id: &str, fields: &Value) -> Result<(), StorageError> {
        if self
            .failing_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(external_id)
        {
            return Err(StorageError::Unavailable(format!("write rejected for {external_id}")));
        }

        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind.to_string(), external_id.to_string()), fields.clone());
        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn probe(&self) -> bool {
        !self.unreachable.load(Ordering::Relaxed)
    }
}

// ------------------------------------------------------------
// Redis storage
// ------------------------------------------------------------
//
// Layout:
// - {prefix}:{kind}:{external_id}  -> JSON document
// - {prefix}:{kind}:ids            -> set of external ids
//
// The multiplexed connection is opened lazily on first use and
// shared by every caller.
//
pub struct RedisStorage {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    prefix: String,
}

impl RedisStorage {
    pub fn new(cfg: &StorageConfig) -> Result<Self, StorageError> {
        Ok(Self {
            client: redis::Client::open(cfg.redis_url.as_str())?,
            conn: OnceCell::new(),
            prefix: cfg.key_prefix.clone(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StorageError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }

    fn entity_key(&self, kind: &str, external_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, external_id)
    }
}

#[async_trait::async_trait]
impl Storage for RedisStorage {
    async fn upsert_entity(&self, kind: &str, external_id: &str, fields: &Value) -> Result<(), StorageError> {
        let body = serde_json::to_string(fields)?;
        let mut conn = self.connection().await?;

        let _: () = conn.set(self.entity_key(kind, external_id), body).await?;
        let _: () = conn
            .sadd(format!("{}:{}:ids", self.prefix, kind), external_id)
            .await?;
        Ok(())
    }

    async fn probe(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

// ------------------------------------------------------------
// HTTP prediction service
// ------------------------------------------------------------
//
// POST {url}  body: { "kind": ..., "features": {...} }
// response:        { "value" | "prediction": f64, "confidence": f64 }
//
pub struct HttpPredictionService {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpPredictionService {
    pub fn new(cfg: &PredictionConfig) -> Result<Self, PredictionError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: cfg.url.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        })
    }
}

#[async_trait::async_trait]
impl PredictionService for HttpPredictionService {
    async fn predict(&self, kind: &str, features: &Value) -> Result<PredictionResult, PredictionError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({ "kind": kind, "features": features }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PredictionError::Status(status.as_u16()));
        }

        let mut result: PredictionResult = resp.json().await?;
        if !result.value.is_finite() || !result.confidence.is_finite() {
            return Err(PredictionError::Service("non-finite prediction".to_string()));
        }
        result.confidence = result.confidence.clamp(0.0, 1.0);
        Ok(result)
    }

    /// Any HTTP answer below 500 counts as reachable.
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }
}
