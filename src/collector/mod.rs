/// Collector module
///
/// This module groups all logic responsible for:
/// - Starting one independent loop per enabled source
/// - Restarting loops when a source's registry entry changes
/// - Stopping every loop and waiting for it to exit
///
/// The collector layer acts as the orchestration layer between:
/// - The source registry and rate limiter (inputs)
/// - Fetch adapters (retrieval)
/// - The event bus (output)
///
/// Design notes:
/// - Mechanism-specific logic MUST NOT live here
/// - A slow or failing source never blocks another: every source
///   has its own task, timer and timeout
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use log::{info, warn};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::{
    bus::EventBus,
    error::ConfigError,
    fetchers::AdapterRegistry,
    metrics::RuntimeMetrics,
    rate_limiter::RateLimiter,
    registry::{RegisteredSource, SourceRegistry},
};
use runner::{LoopContext, run_source_loop};

/// A running source loop.
struct SourceLoop {
    /// Registry revision the loop was started with
    revision: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SourceLoop {
    /// Cancels the loop and waits for its task to exit.
    async fn shutdown(self, id: &str) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.handle.await {
            warn!("source '{}' loop ended abnormally: {}", id, e);
        }
    }
}

/// Owns one loop per enabled source.
pub struct Scheduler {
    registry: Arc<SourceRegistry>,
    limiter: Arc<RateLimiter>,
    adapters: AdapterRegistry,
    bus: Arc<EventBus>,
    metrics: Arc<RuntimeMetrics>,
    default_timeout: Duration,

    loops: Mutex<HashMap<String, SourceLoop>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SourceRegistry>,
        limiter: Arc<RateLimiter>,
        adapters: AdapterRegistry,
        bus: Arc<EventBus>,
        metrics: Arc<RuntimeMetrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            limiter,
            adapters,
            bus,
            metrics,
            default_timeout,
            loops: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Launches the loops of all enabled sources.
    ///
    /// Calling `start` while already running is a no-op.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            info!("scheduler already running");
            return;
        }

        for source in self.registry.all() {
            if source.config.enabled {
                let id = source.config.id.clone();
                loops.insert(id, self.spawn_loop(source));
            }
        }

        info!("scheduler started with {} source loop(s)", loops.len());
    }

    /// Cancels every loop and waits until all of them have exited.
    ///
    /// After `stop` returns no further collection events are
    /// published.
    pub async fn stop(&self) {
        let mut loops = self.loops.lock().await;
        self.running.store(false, Ordering::SeqCst);

        let drained: Vec<_> = loops.drain().collect();
        let count = drained.len();

        join_all(drained.into_iter().map(|(id, l)| async move { l.shutdown(&id).await })).await;

        info!("scheduler stopped ({} source loop(s) joined)", count);
    }

    /// Brings the loop of `id` in line with its registry entry.
    ///
    /// - entry disabled          -> loop stopped
    /// - entry revision changed  -> old loop joined, new loop started
    /// - enabled but not running -> loop started
    ///
    /// No-op while the scheduler is stopped; `start` picks up the
    /// latest configuration.
    ///
    /// `running` only changes with `loops` held, so it is checked
    /// after the lock: a reconcile queued behind `stop` must not
    /// spawn a loop once `stop` has returned.
    pub async fn reconcile(&self, id: &str) -> Result<(), ConfigError> {
        self.registry.get(id)?;

        let mut loops = self.loops.lock().await;
        if !self.is_running() {
            return Ok(());
        }

        // Re-read under the lock so the newest revision wins
        let source = self.registry.get(id)?;

        let up_to_date = loops
            .get(id)
            .is_some_and(|l| l.revision == source.revision && !l.handle.is_finished());
        if source.config.enabled && up_to_date {
            return Ok(());
        }

        if let Some(old) = loops.remove(id) {
            old.shutdown(id).await;
        }

        if source.config.enabled {
            loops.insert(id.to_string(), self.spawn_loop(source));
        }

        Ok(())
    }

    /// Ids of sources with a live loop.
    pub async fn active_sources(&self) -> Vec<String> {
        let loops = self.loops.lock().await;
        let mut ids: Vec<_> = loops
            .iter()
            .filter(|(_, l)| !l.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn spawn_loop(&self, source: RegisteredSource) -> SourceLoop {
        let (cancel, cancel_rx) = watch::channel(false);
        let ctx = LoopContext::new(
            source.config,
            self.default_timeout,
            self.adapters.clone(),
            self.limiter.clone(),
            self.bus.clone(),
            self.metrics.clone(),
        );

        SourceLoop {
            revision: source.revision,
            cancel,
            handle: tokio::spawn(run_source_loop(ctx, cancel_rx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PipelineEvent;
    use crate::config::{RateLimitConfig, SourceConfig};
    use crate::fetchers::{FixtureAdapter, FixtureResponse};
    use crate::schema::{DataKind, Sport};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<SourceRegistry>,
        scheduler: Scheduler,
        events: mpsc::Receiver<PipelineEvent>,
    }

    fn harness(fixture: Arc<FixtureAdapter>) -> Harness {
        let metrics = Arc::new(RuntimeMetrics::default());
        let bus = Arc::new(EventBus::new(10_000, metrics.clone()));
        let events = bus.subscribe();
        let registry = Arc::new(SourceRegistry::new());
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            default_ceiling: 1_000,
            ..Default::default()
        }));

        let scheduler = Scheduler::new(
            registry.clone(),
            limiter,
            AdapterRegistry::uniform(fixture),
            bus,
            metrics,
            Duration::from_secs(30),
        );

        Harness { registry, scheduler, events }
    }

    fn source(id: &str, url: &str) -> SourceConfig {
        SourceConfig::new(id, url, Sport::Nfl, DataKind::GameUpdates, Duration::from_secs(1))
    }

    fn drain(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let fixture = Arc::new(FixtureAdapter::new());
        let h = harness(fixture);
        h.registry.register(source("a", "https://a.example/games")).unwrap();

        h.scheduler.start().await;
        h.scheduler.start().await;

        assert_eq!(h.scheduler.active_sources().await, vec!["a"]);
        h.scheduler.stop().await;
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn no_events_after_stop() {
        let fixture = Arc::new(
            FixtureAdapter::new()
                .with("https://a.example/games", FixtureResponse::Payload(json!({ "games": [] })))
                .with(
                    "https://b.example/games",
                    FixtureResponse::Delayed(Duration::from_millis(700), json!([])),
                ),
        );
        let mut h = harness(fixture);
        h.registry.register(source("a", "https://a.example/games")).unwrap();
        h.registry.register(source("b", "https://b.example/games")).unwrap();

        h.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(5_300)).await;
        h.scheduler.stop().await;

        assert!(!drain(&mut h.events).is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut h.events).is_empty());
        assert!(h.scheduler.active_sources().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_one_source_leaves_others_running() {
        let fixture = Arc::new(
            FixtureAdapter::new()
                .with("https://a.example/games", FixtureResponse::Payload(json!([])))
                .with("https://b.example/games", FixtureResponse::Payload(json!([]))),
        );
        let h = harness(fixture.clone());
        h.registry.register(source("a", "https://a.example/games")).unwrap();
        h.registry.register(source("b", "https://b.example/games")).unwrap();

        h.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        h.registry.set_enabled("a", false).unwrap();
        h.scheduler.reconcile("a").await.unwrap();
        let a_calls = fixture.calls("https://a.example/games");
        let b_calls = fixture.calls("https://b.example/games");

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fixture.calls("https://a.example/games"), a_calls);
        assert!(fixture.calls("https://b.example/games") >= b_calls + 4);
        assert_eq!(h.scheduler.active_sources().await, vec!["b"]);

        h.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn re_registration_restarts_the_loop_with_new_config() {
        let fixture = Arc::new(
            FixtureAdapter::new()
                .with("https://a.example/games", FixtureResponse::Payload(json!([])))
                .with("https://a.example/v2/games", FixtureResponse::Payload(json!([]))),
        );
        let h = harness(fixture.clone());
        h.registry.register(source("a", "https://a.example/games")).unwrap();
        h.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        h.registry.register(source("a", "https://a.example/v2/games")).unwrap();
        h.scheduler.reconcile("a").await.unwrap();
        let old_calls = fixture.calls("https://a.example/games");

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(fixture.calls("https://a.example/games"), old_calls);
        assert!(fixture.calls("https://a.example/v2/games") >= 3);
        assert_eq!(h.scheduler.active_sources().await, vec!["a"]);

        h.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_queued_behind_stop_spawns_nothing() {
        let fixture = Arc::new(
            FixtureAdapter::new()
                .with("https://a.example/games", FixtureResponse::Payload(json!([])))
                .with("https://b.example/games", FixtureResponse::Payload(json!([]))),
        );
        let mut h = harness(fixture.clone());
        h.registry.register(source("a", "https://a.example/games")).unwrap();
        h.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        // disable holds the lock while joining "a"; stop and the
        // reconcile of "b" both queue behind it, stop first
        h.registry.set_enabled("a", false).unwrap();
        h.registry.register(source("b", "https://b.example/games")).unwrap();
        let (disabled, (), added) = tokio::join!(
            h.scheduler.reconcile("a"),
            h.scheduler.stop(),
            h.scheduler.reconcile("b"),
        );
        disabled.unwrap();
        added.unwrap();
        drain(&mut h.events);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!h.scheduler.is_running());
        assert!(h.scheduler.active_sources().await.is_empty());
        assert_eq!(fixture.calls("https://b.example/games"), 0);
        assert!(drain(&mut h.events).is_empty());

        // the next start picks "b" up
        h.scheduler.start().await;
        assert_eq!(h.scheduler.active_sources().await, vec!["b"]);
        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn reconcile_unknown_source_fails() {
        let h = harness(Arc::new(FixtureAdapter::new()));
        assert!(matches!(
            h.scheduler.reconcile("missing").await,
            Err(ConfigError::NotFound(_))
        ));
    }
}
