use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use log::info;
use url::Url;

use crate::config::SourceConfig;
use crate::error::ConfigError;

/// A registered source plus its revision.
///
/// The revision is bumped on every mutation. The scheduler records
/// the revision a loop was started with and restarts the loop when
/// the registry moves past it.
#[derive(Debug, Clone)]
pub struct RegisteredSource {
    pub config: SourceConfig,
    pub revision: u64,
}

/// Holds the declarative configuration of every data source.
///
/// Sources are never removed: disabling a source stops its loop
/// but keeps the entry (and its metrics) around.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, RegisteredSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source, replacing any entry with the same id.
    ///
    /// Returns the new revision of the entry.
    pub fn register(&self, config: SourceConfig) -> Result<u64, ConfigError> {
        validate(&config)?;

        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let revision = sources.get(&config.id).map_or(1, |prev| prev.revision + 1);

        if revision > 1 {
            info!("source '{}' re-registered (revision {})", config.id, revision);
        }

        sources.insert(config.id.clone(), RegisteredSource { config, revision });
        Ok(revision)
    }

    pub fn get(&self, id: &str) -> Result<RegisteredSource, ConfigError> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))
    }

    /// All sources, highest priority first, then by id.
    pub fn all(&self) -> Vec<RegisteredSource> {
        let mut all: Vec<_> = self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        all.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.sources.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<u64, ConfigError> {
        self.update(id, |cfg| cfg.enabled = enabled)
    }

    pub fn update_interval(&self, id: &str, interval: Duration) -> Result<u64, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidSource {
                id: id.to_string(),
                reason: "interval must be greater than zero".to_string(),
            });
        }
        self.update(id, |cfg| cfg.interval = interval)
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut SourceConfig)) -> Result<u64, ConfigError> {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let entry = sources
            .get_mut(id)
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;

        apply(&mut entry.config);
        entry.revision += 1;
        Ok(entry.revision)
    }
}

fn validate(config: &SourceConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSource {
        id: config.id.clone(),
        reason: reason.to_string(),
    };

    if config.id.trim().is_empty() {
        return Err(invalid("id must not be empty"));
    }
    if Url::parse(&config.url).is_err() {
        return Err(invalid("url is not a valid absolute URL"));
    }
    if config.interval.is_zero() {
        return Err(invalid("interval must be greater than zero"));
    }
    Ok(())
}
