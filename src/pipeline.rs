// ------------------------------------------------------------
// Pipeline
// ------------------------------------------------------------
//
// Explicitly constructed owner of every component:
//
//   registry -> scheduler -> bus -> { router, monitor }
//
// Lifecycle:
// - `start` subscribes the router and monitor to the bus, starts
//   every enabled source loop and the background ticks
// - `stop` joins the source loops first, then lets the router and
//   monitor drain what is already queued before joining them
//
// Both are idempotent. Monitor state survives a stop/start cycle.
//
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::{
    bus::{EventBus, PipelineEvent},
    collaborators::{EventSink, PredictionService, Storage},
    collector::Scheduler,
    config::{Config, SourceConfig},
    error::ConfigError,
    fetchers::AdapterRegistry,
    metrics::RuntimeMetrics,
    monitor::{HealthCheckResult, HealthProbes, Monitor, PipelineMetrics, SourceMetrics},
    rate_limiter::RateLimiter,
    registry::SourceRegistry,
    router::Router,
    schema::{CollectionError, DataKind, FetchMechanism, Sport},
};

/// External collaborators handed to the pipeline.
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub prediction: Option<Arc<dyn PredictionService>>,
    pub sink: Arc<dyn EventSink>,
    pub adapters: AdapterRegistry,
}

/// One line of `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub name: String,
    pub sport: Sport,
    pub kind: DataKind,
    pub mechanism: FetchMechanism,
    pub enabled: bool,
    pub active: bool,
    pub interval_secs: u64,
    pub priority: i32,
    pub metrics: Option<SourceMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub total_sources: usize,
    pub active_sources: usize,

    /// Ordered by priority, then id
    pub sources: Vec<SourceStatus>,
}

/// Background tasks that live between `start` and `stop`.
struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Pipeline {
    registry: Arc<SourceRegistry>,
    limiter: Arc<RateLimiter>,
    bus: Arc<EventBus>,
    metrics: Arc<RuntimeMetrics>,
    scheduler: Arc<Scheduler>,
    router: Arc<Router>,
    monitor: Arc<Monitor>,
    background: Mutex<Option<Background>>,
}

impl Pipeline {
    pub fn new(cfg: &Config, collaborators: Collaborators) -> Result<Self, ConfigError> {
        Self::with_metrics(cfg, collaborators, Arc::new(RuntimeMetrics::default()))
    }

    /// Like `new`, sharing `metrics` with collaborators built by the
    /// caller (e.g. the notifier pool).
    pub fn with_metrics(
        cfg: &Config,
        collaborators: Collaborators,
        metrics: Arc<RuntimeMetrics>,
    ) -> Result<Self, ConfigError> {
        let registry = Arc::new(SourceRegistry::new());
        for source in &cfg.sources {
            registry.register(source.clone())?;
        }

        let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
        let bus = Arc::new(EventBus::new(cfg.scheduler.event_buffer, metrics.clone()));

        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            limiter.clone(),
            collaborators.adapters,
            bus.clone(),
            metrics.clone(),
            cfg.scheduler.default_timeout(),
        ));

        let router = Arc::new(Router::new(
            collaborators.storage,
            collaborators.prediction,
            collaborators.sink.clone(),
            bus.clone(),
            metrics.clone(),
        ));

        let monitor = Arc::new(Monitor::new(
            cfg.monitor.clone(),
            registry.clone(),
            limiter.clone(),
            collaborators.sink,
        ));

        Ok(Self {
            registry,
            limiter,
            bus,
            metrics,
            scheduler,
            router,
            monitor,
            background: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn runtime_metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Starts the source loops and the background tasks.
    ///
    /// A second call while running only logs.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            info!("pipeline already running");
            return;
        }

        // Subscribe before the first loop can publish
        let router_rx = self.bus.subscribe();
        let monitor_rx = self.bus.subscribe();

        self.monitor.mark_started();
        self.scheduler.start().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let cfg = self.monitor.config().clone();

        let handles = vec![
            tokio::spawn(self.router.clone().run(router_rx, shutdown_rx.clone())),
            tokio::spawn(self.monitor.clone().run(monitor_rx, shutdown_rx.clone())),
            tokio::spawn(metrics_tick(self.monitor.clone(), cfg.metrics_interval(), shutdown_rx.clone())),
            tokio::spawn(health_tick(
                Probes {
                    scheduler: self.scheduler.clone(),
                    router: self.router.clone(),
                },
                self.monitor.clone(),
                cfg.health_interval(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(metrics_reporter(self.metrics.clone(), cfg.metrics_log_interval(), shutdown_rx)),
        ];

        *background = Some(Background { shutdown, handles });
        info!("pipeline started ({} sources registered)", self.registry.len());
    }

    /// Stops every source loop, then drains and joins the router and
    /// monitor. No collection event is published after this returns.
    pub async fn stop(&self) {
        let mut background = self.background.lock().await;
        let Some(bg) = background.take() else {
            info!("pipeline not running");
            return;
        };

        self.scheduler.stop().await;

        let _ = bg.shutdown.send(true);
        for result in join_all(bg.handles).await {
            if let Err(e) = result {
                warn!("pipeline task ended abnormally: {}", e);
            }
        }

        info!("pipeline stopped");
    }

    pub async fn get_status(&self) -> PipelineStatus {
        let active = self.scheduler.active_sources().await;

        let sources: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .map(|entry| {
                let cfg = entry.config;
                SourceStatus {
                    active: active.binary_search(&cfg.id).is_ok(),
                    metrics: self.monitor.source_metrics(&cfg.id),
                    name: cfg.display_name().to_string(),
                    sport: cfg.sport,
                    kind: cfg.kind,
                    mechanism: cfg.mechanism,
                    enabled: cfg.enabled,
                    interval_secs: cfg.interval.as_secs(),
                    priority: cfg.priority,
                    id: cfg.id,
                }
            })
            .collect();

        PipelineStatus {
            running: self.is_running(),
            total_sources: sources.len(),
            active_sources: active.len(),
            sources,
        }
    }

    /// Metrics as of the last metrics tick.
    pub fn get_metrics(&self) -> PipelineMetrics {
        self.monitor.get_metrics()
    }

    /// Result of the last health tick; None before the first one.
    pub fn get_health(&self) -> Option<HealthCheckResult> {
        self.monitor.get_health()
    }

    /// Runs the probes and a health evaluation right now.
    pub async fn check_health(&self) -> HealthCheckResult {
        let probes = Probes {
            scheduler: self.scheduler.clone(),
            router: self.router.clone(),
        };
        self.monitor.evaluate_health(probes.gather().await)
    }

    pub fn get_error_history(&self, within: Duration) -> Vec<CollectionError> {
        self.monitor.get_error_history(within)
    }

    pub fn get_source_performance(&self) -> Vec<SourceMetrics> {
        self.monitor.get_source_performance()
    }

    /// Registers (or replaces) a source and starts its loop if the
    /// pipeline is running.
    pub async fn add_source(&self, config: SourceConfig) -> Result<(), ConfigError> {
        let id = config.id.clone();
        self.registry.register(config)?;
        self.scheduler.reconcile(&id).await
    }

    pub async fn set_source_enabled(&self, id: &str, enabled: bool) -> Result<(), ConfigError> {
        self.registry.set_enabled(id, enabled)?;
        self.scheduler.reconcile(id).await
    }

    pub async fn update_source_interval(&self, id: &str, interval: Duration) -> Result<(), ConfigError> {
        self.registry.update_interval(id, interval)?;
        self.scheduler.reconcile(id).await
    }

    /// A fresh receiver of every bus event published from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    pub fn pending_replays(&self) -> usize {
        self.router.pending_replays()
    }

    pub async fn replay_pending(&self) -> usize {
        self.router.replay_pending().await
    }
}

/// Handles needed to probe collaborators from a background task.
struct Probes {
    scheduler: Arc<Scheduler>,
    router: Arc<Router>,
}

impl Probes {
    async fn gather(&self) -> HealthProbes {
        let (storage, prediction, adapters) = tokio::join!(
            self.router.storage_reachable(),
            self.router.prediction_reachable(),
            self.scheduler.adapters().probe_all(),
        );

        HealthProbes {
            pipeline_running: self.scheduler.is_running(),
            storage_reachable: storage,
            prediction_service_reachable: prediction,
            fetch_adapters_reachable: adapters,
        }
    }
}

async fn metrics_tick(monitor: Arc<Monitor>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                monitor.refresh_metrics();
            }
        }
    }
}

/// Evaluates health on every tick and retries parked writes.
async fn health_tick(
    probes: Probes,
    monitor: Arc<Monitor>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let result = monitor.evaluate_health(probes.gather().await);
                debug!("health {:?} ({} issue(s))", result.status, result.issues.len());

                if probes.router.pending_replays() > 0 {
                    probes.router.replay_pending().await;
                }
            }
        }
    }
}

/// Periodic, low-noise `[METRICS]` line.
async fn metrics_reporter(metrics: Arc<RuntimeMetrics>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => info!("{}", metrics.summary()),
        }
    }
}
