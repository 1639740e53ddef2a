use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::schema::FetchMechanism;

/// Everything an adapter needs to perform one retrieval.
///
/// Built by the scheduler from the source configuration on
/// every tick.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_id: String,
    pub url: String,
    pub mechanism: FetchMechanism,
    pub hints: Option<Value>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn for_source(cfg: &SourceConfig, timeout: Duration) -> Self {
        Self {
            source_id: cfg.id.clone(),
            url: cfg.url.clone(),
            mechanism: cfg.mechanism,
            hints: cfg.hints.clone(),
            headers: cfg.headers.clone(),
            timeout,
        }
    }
}

/// FetchAdapter is the abstraction layer between:
/// - The generic collector scheduler
/// - The concrete retrieval mechanism (HTTP, headless render, crawl)
///
/// Each implementation must:
/// - Retrieve the URL using its mechanism
/// - Return the raw structured payload as JSON
/// - Report failures as `FetchError`, never panic
///
/// DESIGN GOALS:
/// - Zero source-specific logic outside adapters
/// - One adapter per fetch mechanism
/// - Uniform output format (serde_json::Value)
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Adapter instances are shared across all source loops
///
#[async_trait::async_trait]
pub trait FetchAdapter: Send + Sync {

    /// Returns the canonical adapter name, used for logging.
    fn name(&self) -> &'static str;

    /// Retrieves one payload.
    ///
    /// CONTRACT:
    /// - Should honour `request.timeout`; the scheduler enforces it
    ///   as well and drops the future when it elapses
    /// - Must not retry internally, the next tick is the retry
    ///
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError>;

    /// Cheap reachability probe used by the health check.
    async fn probe(&self) -> bool {
        true
    }
}
