/// Pipeline monitor
///
/// Observes the same bus events as the router and keeps:
/// - Per-source accounting (`SourceMetrics`)
/// - A bounded buffer of recent collection errors
/// - The last computed `PipelineMetrics` and `HealthCheckResult`
///
/// DESIGN:
/// - State is written only by the monitor's consumer task and the
///   metrics/health ticks; every getter is a pure read
/// - Probing collaborators is the caller's job (see `HealthProbes`),
///   so health evaluation itself is synchronous and deterministic
pub mod health;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub use health::{Alert, AlertLevel, HealthCheckResult, HealthProbes, HealthStatus};

use crate::bus::PipelineEvent;
use crate::collaborators::{EventSink, Notification};
use crate::config::MonitorConfig;
use crate::rate_limiter::{RateLimitSnapshot, RateLimiter};
use crate::registry::SourceRegistry;
use crate::schema::{CollectedRecord, CollectionError};
use crate::util::origin_key;

/// Trailing window used for the error rate.
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Accounting for one source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceMetrics {
    pub source_id: String,

    /// successes + failures; rate-limited skips are not requests
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub records_collected: u64,
    pub avg_latency_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl SourceMetrics {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    fn record_success(&mut self, record: &CollectedRecord) {
        self.requests += 1;
        self.successes += 1;
        self.records_collected += record.record_count as u64;

        let latency = record.latency.as_secs_f64() * 1_000.0;
        self.avg_latency_ms += (latency - self.avg_latency_ms) / self.successes as f64;
        self.last_success = Some(record.collected_at);
    }

    fn record_failure(&mut self, error: &CollectionError) {
        self.requests += 1;
        self.failures += 1;
        self.last_failure = Some(error.timestamp);
        self.last_error = Some(error.message.clone());
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

/// Pipeline-wide aggregates, recomputed on every metrics tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub uptime_secs: u64,
    pub total_sources: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_records: u64,

    /// Collection errors within the trailing 60 s
    pub errors_last_minute: usize,

    /// 1.0 until the first request
    pub success_rate: f64,

    /// Records collected per minute of uptime
    pub throughput_per_minute: f64,

    pub avg_latency_ms: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MonitorState {
    started_at: Option<Instant>,
    sources: HashMap<String, SourceMetrics>,
    errors: VecDeque<CollectionError>,
    metrics: PipelineMetrics,
    health: Option<HealthCheckResult>,
    last_status: Option<HealthStatus>,
    flagged_sources: HashSet<String>,
}

pub struct Monitor {
    cfg: MonitorConfig,
    registry: Arc<SourceRegistry>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn EventSink>,
    state: RwLock<MonitorState>,
}

impl Monitor {
    pub fn new(
        cfg: MonitorConfig,
        registry: Arc<SourceRegistry>,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cfg,
            registry,
            limiter,
            sink,
            state: RwLock::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    fn read(&self) -> RwLockReadGuard<'_, MonitorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MonitorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the uptime clock. Later calls keep the first start.
    pub fn mark_started(&self) {
        let mut state = self.write();
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }
    }

    /// Consumes bus events until `shutdown` fires, then drains what
    /// is already queued.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PipelineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.record(&event),
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(event) = events.try_recv() {
                        self.record(&event);
                    }
                    break;
                }
            }
        }
        debug!("monitor consumer stopped");
    }

    /// Applies one bus event to the per-source accounting.
    pub fn record(&self, event: &PipelineEvent) {
        let mut state = self.write();
        match event {
            PipelineEvent::CollectionSuccess(record) => {
                state
                    .sources
                    .entry(record.source_id.clone())
                    .or_insert_with(|| SourceMetrics::new(&record.source_id))
                    .record_success(record);
            }
            PipelineEvent::CollectionError(error) => {
                state
                    .sources
                    .entry(error.source_id.clone())
                    .or_insert_with(|| SourceMetrics::new(&error.source_id))
                    .record_failure(error);

                state.errors.push_back(error.clone());
                while state.errors.len() > self.cfg.max_error_buffer {
                    state.errors.pop_front();
                }
            }
            PipelineEvent::ProcessedUpdate(_) => {}
        }
    }

    /// Metrics tick: prunes the error buffer, recomputes aggregates
    /// and refreshes per-source rate-limit snapshots.
    pub fn refresh_metrics(&self) -> PipelineMetrics {
        let registered = self.registry.all();
        let mut state = self.write();

        prune_errors(&mut state.errors, self.cfg.error_retention());

        for source in &registered {
            let id = &source.config.id;
            let snapshot = self.limiter.snapshot(&origin_key(&source.config.url));
            state
                .sources
                .entry(id.clone())
                .or_insert_with(|| SourceMetrics::new(id))
                .rate_limit = snapshot;
        }

        let metrics = compute_metrics(&state, registered.len());
        state.metrics = metrics.clone();
        metrics
    }

    /// Health tick: evaluates thresholds against fresh metrics and
    /// the given probe results, stores the result and raises alerts.
    pub fn evaluate_health(&self, probes: HealthProbes) -> HealthCheckResult {
        let metrics = self.refresh_metrics();
        let checks = probes.checks();

        let mut issues: Vec<String> = checks
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| format!("check failed: {name}"))
            .collect();

        if metrics.errors_last_minute > self.cfg.max_errors_per_minute {
            issues.push(format!(
                "error rate {}/min above threshold {}/min",
                metrics.errors_last_minute, self.cfg.max_errors_per_minute
            ));
        }

        if metrics.total_requests >= self.cfg.min_sample_size
            && metrics.success_rate < self.cfg.min_success_rate
        {
            issues.push(format!(
                "success rate {:.2} below threshold {:.2}",
                metrics.success_rate, self.cfg.min_success_rate
            ));
        }

        let mut state = self.write();

        let mut unhealthy_sources: Vec<String> = state
            .sources
            .values()
            .filter(|m| m.successes == 0 && m.failures >= self.cfg.source_failure_threshold)
            .map(|m| m.source_id.clone())
            .collect();
        unhealthy_sources.sort();

        let result = HealthCheckResult {
            status: HealthStatus::for_issues(issues.len()),
            checks,
            issues,
            unhealthy_sources,
            timestamp: Utc::now(),
        };

        let mut alerts = Vec::new();

        let previous = state.last_status.replace(result.status);
        if !result.status.is_healthy() && previous.is_none_or(|s| s.is_healthy()) {
            warn!("pipeline health {:?}: {}", result.status, result.issues.join("; "));
            alerts.push(Alert::new(
                AlertLevel::Warning,
                None,
                format!("pipeline {:?}: {}", result.status, result.issues.join("; ")),
            ));
        } else if result.status.is_healthy() && previous.is_some_and(|s| !s.is_healthy()) {
            info!("pipeline health recovered");
            alerts.push(Alert::new(AlertLevel::Info, None, "pipeline healthy again"));
        }

        for id in &result.unhealthy_sources {
            if state.flagged_sources.insert(id.clone()) {
                let failures = state.sources.get(id).map_or(0, |m| m.failures);
                warn!("source '{}' unhealthy: {} failures, no success", id, failures);
                alerts.push(Alert::new(
                    AlertLevel::Critical,
                    Some(id.clone()),
                    format!("source failing: {failures} failures without a success"),
                ));
            }
        }
        state.flagged_sources.retain(|id| result.unhealthy_sources.contains(id));

        state.health = Some(result.clone());
        drop(state);

        for alert in alerts {
            self.sink.notify(Notification::Alert(alert));
        }

        result
    }

    pub fn get_metrics(&self) -> PipelineMetrics {
        self.read().metrics.clone()
    }

    /// None until the first health tick.
    pub fn get_health(&self) -> Option<HealthCheckResult> {
        self.read().health.clone()
    }

    /// Buffered collection errors newer than `within`, oldest first.
    pub fn get_error_history(&self, within: Duration) -> Vec<CollectionError> {
        let cutoff = cutoff(within);
        self.read()
            .errors
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Per-source metrics sorted by source id.
    pub fn get_source_performance(&self) -> Vec<SourceMetrics> {
        let mut sources: Vec<_> = self.read().sources.values().cloned().collect();
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        sources
    }

    pub fn source_metrics(&self, id: &str) -> Option<SourceMetrics> {
        self.read().sources.get(id).cloned()
    }
}

fn cutoff(within: Duration) -> DateTime<Utc> {
    let within = chrono::Duration::from_std(within).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(within)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn prune_errors(errors: &mut VecDeque<CollectionError>, retention: Duration) {
    let cutoff = cutoff(retention);
    while errors.front().is_some_and(|e| e.timestamp < cutoff) {
        errors.pop_front();
    }
}

fn compute_metrics(state: &MonitorState, total_sources: usize) -> PipelineMetrics {
    let uptime = state.started_at.map(|t| t.elapsed()).unwrap_or_default();

    let mut m = PipelineMetrics {
        uptime_secs: uptime.as_secs(),
        total_sources,
        ..Default::default()
    };

    let mut latency_weighted = 0.0;
    for s in state.sources.values() {
        m.total_requests += s.requests;
        m.total_successes += s.successes;
        m.total_failures += s.failures;
        m.total_records += s.records_collected;
        latency_weighted += s.avg_latency_ms * s.successes as f64;
    }

    let window_start = cutoff(ERROR_RATE_WINDOW);
    m.errors_last_minute = state.errors.iter().filter(|e| e.timestamp >= window_start).count();

    m.success_rate = if m.total_requests == 0 {
        1.0
    } else {
        m.total_successes as f64 / m.total_requests as f64
    };

    if m.total_successes > 0 {
        m.avg_latency_ms = latency_weighted / m.total_successes as f64;
    }

    let minutes = uptime.as_secs_f64() / 60.0;
    if minutes > 0.0 {
        m.throughput_per_minute = m.total_records as f64 / minutes;
    }

    m.updated_at = Some(Utc::now());
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, SourceConfig};
    use crate::schema::{DataKind, Sport};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl EventSink for RecordingSink {
        fn notify(&self, notification: Notification) {
            if let Notification::Alert(a) = notification {
                self.alerts.lock().unwrap().push(a);
            }
        }
    }

    fn monitor(cfg: MonitorConfig) -> (Monitor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(SourceRegistry::new());
        registry
            .register(SourceConfig::new(
                "espn",
                "https://site.api.espn.com/nba",
                Sport::Nba,
                DataKind::GameUpdates,
                Duration::from_secs(5),
            ))
            .unwrap();
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        (Monitor::new(cfg, registry, limiter, sink.clone()), sink)
    }

    fn all_up() -> HealthProbes {
        HealthProbes {
            pipeline_running: true,
            storage_reachable: true,
            prediction_service_reachable: Some(true),
            fetch_adapters_reachable: true,
        }
    }

    fn success(source: &str, records: usize) -> PipelineEvent {
        let payload = json!((0..records).map(|i| json!({ "id": i })).collect::<Vec<_>>());
        PipelineEvent::CollectionSuccess(Arc::new(CollectedRecord::new(
            source,
            DataKind::GameUpdates,
            Sport::Nba,
            payload,
            Duration::from_millis(40),
        )))
    }

    fn failure(source: &str) -> PipelineEvent {
        PipelineEvent::CollectionError(CollectionError::new(source, "HTTP 503"))
    }

    #[test]
    fn events_update_source_metrics() {
        let (m, _) = monitor(MonitorConfig::default());
        m.record(&success("espn", 3));
        m.record(&success("espn", 2));
        m.record(&failure("espn"));

        let s = m.source_metrics("espn").unwrap();
        assert_eq!(s.requests, 3);
        assert_eq!(s.successes, 2);
        assert_eq!(s.failures, 1);
        assert_eq!(s.records_collected, 5);
        assert!((s.avg_latency_ms - 40.0).abs() < 1e-6);
        assert_eq!(s.last_error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn healthy_when_nothing_is_wrong() {
        let (m, sink) = monitor(MonitorConfig::default());
        m.record(&success("espn", 1));

        let health = m.evaluate_health(all_up());
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
        assert!(sink.alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn eleven_errors_in_a_minute_degrade_health() {
        let cfg = MonitorConfig {
            min_sample_size: 1_000,
            ..Default::default()
        };
        let (m, sink) = monitor(cfg);
        for _ in 0..11 {
            m.record(&failure("espn"));
        }

        let health = m.evaluate_health(all_up());
        assert_ne!(health.status, HealthStatus::Healthy);
        assert_eq!(health.issues.len(), 1);
        assert_eq!(sink.alerts.lock().unwrap()[0].level, AlertLevel::Warning);
    }

    #[test]
    fn failed_checks_and_thresholds_make_it_unhealthy() {
        let (m, _) = monitor(MonitorConfig::default());
        for _ in 0..11 {
            m.record(&failure("espn"));
        }
        let probes = HealthProbes {
            storage_reachable: false,
            ..all_up()
        };

        // storage + error rate + success rate
        let health = m.evaluate_health(probes);
        assert_eq!(health.issues.len(), 3);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn failing_source_is_flagged_once() {
        let cfg = MonitorConfig {
            max_errors_per_minute: 100,
            min_sample_size: 100,
            ..Default::default()
        };
        let (m, sink) = monitor(cfg);
        for _ in 0..5 {
            m.record(&failure("espn"));
        }

        let health = m.evaluate_health(all_up());
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.unhealthy_sources, vec!["espn".to_string()]);

        m.evaluate_health(all_up());
        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].source_id.as_deref(), Some("espn"));
    }

    #[test]
    fn one_success_clears_the_source_signal() {
        let (m, _) = monitor(MonitorConfig {
            max_errors_per_minute: 100,
            ..Default::default()
        });
        for _ in 0..6 {
            m.record(&failure("espn"));
        }
        m.record(&success("espn", 1));
        assert!(m.evaluate_health(all_up()).unhealthy_sources.is_empty());
    }

    fn failure_aged(source: &str, age_secs: i64) -> PipelineEvent {
        let mut error = CollectionError::new(source, "HTTP 503");
        error.timestamp = Utc::now() - chrono::TimeDelta::seconds(age_secs);
        PipelineEvent::CollectionError(error)
    }

    #[test]
    fn old_errors_leave_the_rate_window_and_expire() {
        let (m, _) = monitor(MonitorConfig::default());
        m.record(&failure_aged("espn", 400));
        m.record(&failure_aged("espn", 90));
        m.record(&failure("espn"));

        assert_eq!(m.get_error_history(Duration::from_secs(60)).len(), 1);
        assert_eq!(m.get_error_history(Duration::from_secs(3_600)).len(), 3);

        let metrics = m.refresh_metrics();
        assert_eq!(metrics.errors_last_minute, 1);

        // retention is 300 s: only the 400 s old entry is pruned
        assert_eq!(m.get_error_history(Duration::from_secs(3_600)).len(), 2);
    }

    #[test]
    fn errors_older_than_a_minute_do_not_degrade_health() {
        let (m, _) = monitor(MonitorConfig {
            min_sample_size: 1_000,
            ..Default::default()
        });
        for _ in 0..11 {
            m.record(&failure_aged("espn", 90));
        }

        let health = m.evaluate_health(all_up());
        assert_eq!(m.get_metrics().errors_last_minute, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn error_buffer_is_capped() {
        let (m, _) = monitor(MonitorConfig {
            max_error_buffer: 3,
            ..Default::default()
        });
        for _ in 0..10 {
            m.record(&failure("espn"));
        }
        assert_eq!(m.get_error_history(Duration::from_secs(60)).len(), 3);
    }

    #[test]
    fn metrics_tick_refreshes_rate_limit_snapshots() {
        let (m, _) = monitor(MonitorConfig::default());
        m.limiter.allow("https://site.api.espn.com");

        let metrics = m.refresh_metrics();
        assert_eq!(metrics.total_sources, 1);
        assert_eq!(metrics.success_rate, 1.0);

        let snapshot = m.source_metrics("espn").unwrap().rate_limit.unwrap();
        assert_eq!(snapshot.count, 1);
    }
}
