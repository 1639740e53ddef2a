use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;

use super::adapter::{FetchAdapter, FetchRequest};
use crate::error::FetchError;

/// Canned response for one URL.
#[derive(Debug, Clone)]
pub enum FixtureResponse {
    /// Return the payload immediately
    Payload(Value),

    /// Return the payload after a delay
    Delayed(Duration, Value),

    /// Fail with an adapter error
    Fail(String),

    /// Never complete (exercises scheduler timeouts)
    Hang,
}

/// In-process adapter serving canned payloads keyed by URL.
///
/// Used for demo mode and tests. The pipeline logic is identical
/// to a real adapter; only the retrieval is simulated.
#[derive(Default)]
pub struct FixtureAdapter {
    responses: Mutex<HashMap<String, FixtureResponse>>,
    calls: Mutex<HashMap<String, usize>>,
    unreachable: AtomicBool,
}

impl FixtureAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: impl Into<String>, response: FixtureResponse) -> Self {
        self.set(url, response);
        self
    }

    pub fn set(&self, url: impl Into<String>, response: FixtureResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), response);
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Makes `probe` report the adapter layer as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl FetchAdapter for FixtureAdapter {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(request.url.clone())
            .or_default() += 1;

        let response = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.url)
            .cloned();

        match response {
            Some(FixtureResponse::Payload(v)) => Ok(v),
            Some(FixtureResponse::Delayed(delay, v)) => {
                tokio::time::sleep(delay).await;
                Ok(v)
            }
            Some(FixtureResponse::Fail(msg)) => Err(FetchError::Adapter(msg)),
            Some(FixtureResponse::Hang) => {
                std::future::pending::<()>().await;
                Err(FetchError::Adapter("unreachable".to_string()))
            }
            None => Err(FetchError::Adapter(format!("no fixture for {}", request.url))),
        }
    }

    async fn probe(&self) -> bool {
        !self.unreachable.load(Ordering::Relaxed)
    }
}
