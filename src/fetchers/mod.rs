//! Fetch adapter registry and factory
//!
//! This module provides:
//! - The `FetchAdapter` contract
//! - Adapters for every fetch mechanism (http, render service, fixtures)
//! - `AdapterRegistry`, resolving the adapter for a source's mechanism
//!
//! All mechanism-specific logic must live in dedicated adapter modules.
//! The scheduler interacts exclusively through the `FetchAdapter` trait.

pub mod adapter;
pub mod fixture;
pub mod http;
pub mod render;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use log::warn;

pub use adapter::{FetchAdapter, FetchRequest};
pub use fixture::{FixtureAdapter, FixtureResponse};
pub use http::HttpAdapter;
pub use render::RenderServiceAdapter;

use crate::config::Config;
use crate::error::FetchError;
use crate::schema::FetchMechanism;

/// Maps each fetch mechanism to the adapter serving it.
///
/// THREADING:
/// - Adapters are wrapped in `Arc`
/// - The same adapter instance is shared by every source loop
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<FetchMechanism, Arc<dyn FetchAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the production registry from configuration.
    ///
    /// - http             -> HttpAdapter
    /// - browser / crawl  -> RenderServiceAdapter (only if configured)
    pub fn from_config(cfg: &Config) -> Result<Self, FetchError> {
        let mut registry = Self::new().with(FetchMechanism::Http, Arc::new(HttpAdapter::new()?));

        match &cfg.render_service {
            Some(render_cfg) => {
                let render: Arc<dyn FetchAdapter> = Arc::new(RenderServiceAdapter::new(render_cfg)?);
                registry = registry
                    .with(FetchMechanism::Browser, render.clone())
                    .with(FetchMechanism::Crawl, render);
            }
            None => warn!("no render service configured: browser/crawl sources will fail"),
        }

        Ok(registry)
    }

    /// Serves every mechanism with the same adapter.
    pub fn uniform(adapter: Arc<dyn FetchAdapter>) -> Self {
        let mut registry = Self::new();
        for mechanism in [FetchMechanism::Http, FetchMechanism::Browser, FetchMechanism::Crawl] {
            registry.adapters.insert(mechanism, adapter.clone());
        }
        registry
    }

    pub fn with(mut self, mechanism: FetchMechanism, adapter: Arc<dyn FetchAdapter>) -> Self {
        self.adapters.insert(mechanism, adapter);
        self
    }

    pub fn get(&self, mechanism: FetchMechanism) -> Option<Arc<dyn FetchAdapter>> {
        self.adapters.get(&mechanism).cloned()
    }

    /// True if every registered adapter answers its probe.
    /// Adapters shared by several mechanisms are probed once.
    pub async fn probe_all(&self) -> bool {
        let mut seen: Vec<&Arc<dyn FetchAdapter>> = Vec::new();
        for adapter in self.adapters.values() {
            if !seen.iter().any(|a| Arc::ptr_eq(a, adapter)) {
                seen.push(adapter);
            }
        }

        join_all(seen.into_iter().map(|a| a.probe()))
            .await
            .into_iter()
            .all(|ok| ok)
    }
}
