use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, timeout};

use crate::{
    bus::{EventBus, PipelineEvent},
    config::SourceConfig,
    error::FetchError,
    fetchers::{AdapterRegistry, FetchRequest},
    metrics::RuntimeMetrics,
    rate_limiter::RateLimiter,
    schema::{CollectedRecord, CollectionError},
    util::origin_key,
};

/// Everything one source loop needs, cloned out of the scheduler
/// when the loop is spawned.
///
/// The loop owns its copy of the source configuration. A config
/// change is applied by restarting the loop, never by mutating a
/// running one.
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub source: SourceConfig,
    pub origin: String,
    pub timeout: Duration,
    pub adapters: AdapterRegistry,
    pub limiter: Arc<RateLimiter>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<RuntimeMetrics>,
}

impl LoopContext {
    pub fn new(
        source: SourceConfig,
        default_timeout: Duration,
        adapters: AdapterRegistry,
        limiter: Arc<RateLimiter>,
        bus: Arc<EventBus>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            origin: origin_key(&source.url),
            timeout: source.effective_timeout(default_timeout),
            source,
            adapters,
            limiter,
            bus,
            metrics,
        }
    }
}

/// Runs the periodic loop of exactly one source.
///
/// This loop:
/// - Ticks on the source's interval (missed ticks are skipped)
/// - Runs one collection attempt per tick
/// - Exits as soon as `cancel` changes or its sender is dropped
///
/// GUARANTEES:
/// - An in-flight fetch is dropped on cancellation, so nothing is
///   published after the loop has been asked to stop
/// - Events of one source are published in fetch-completion order
///   because a tick never starts before the previous one finished
///
pub(crate) async fn run_source_loop(ctx: LoopContext, mut cancel: watch::Receiver<bool>) {
    let mut ticker = interval(ctx.source.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    ctx.metrics.sources_active.fetch_add(1, Ordering::Relaxed);
    info!(
        "source '{}' loop started ({:?} interval, {} via {})",
        ctx.source.id, ctx.source.interval, ctx.origin, ctx.source.mechanism
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = run_tick(&ctx) => {}
        }
    }

    ctx.metrics.sources_active.fetch_sub(1, Ordering::Relaxed);
    info!("source '{}' loop stopped", ctx.source.id);
}

/// One scheduled attempt to fetch from the source.
///
/// Outcomes:
/// - Rate limited -> skipped silently, no event
/// - Success      -> CollectionSuccess
/// - Failure      -> CollectionError (the next tick is the retry)
///
pub(crate) async fn run_tick(ctx: &LoopContext) {
    RuntimeMetrics::incr(&ctx.metrics.ticks);

    if !ctx.limiter.allow(&ctx.origin) {
        RuntimeMetrics::incr(&ctx.metrics.rate_limited_skips);
        debug!("source '{}' rate limited on {}, skipping tick", ctx.source.id, ctx.origin);
        return;
    }

    let started = Instant::now();
    let outcome = match ctx.adapters.get(ctx.source.mechanism) {
        Some(adapter) => {
            let request = FetchRequest::for_source(&ctx.source, ctx.timeout);
            match timeout(ctx.timeout, adapter.fetch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(ctx.timeout)),
            }
        }
        None => Err(FetchError::UnsupportedMechanism(ctx.source.mechanism.to_string())),
    };

    let event = match outcome {
        Ok(payload) => {
            let record = CollectedRecord::new(
                ctx.source.id.clone(),
                ctx.source.kind,
                ctx.source.sport,
                payload,
                started.elapsed(),
            );
            debug!(
                "source '{}' collected {} {} entities in {:?}",
                record.source_id, record.record_count, record.kind, record.latency
            );
            PipelineEvent::CollectionSuccess(Arc::new(record))
        }
        Err(e) => {
            RuntimeMetrics::incr(&ctx.metrics.fetch_errors);
            warn!("source '{}' fetch failed: {}", ctx.source.id, e);
            PipelineEvent::CollectionError(CollectionError::new(ctx.source.id.clone(), e.to_string()))
        }
    };

    ctx.bus.publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::fetchers::{FixtureAdapter, FixtureResponse};
    use crate::schema::{DataKind, Sport};
    use serde_json::json;

    const URL: &str = "https://stats.example.com/nba/players";

    fn context(fixture: Arc<FixtureAdapter>, ceiling: u32) -> (LoopContext, tokio::sync::mpsc::Receiver<PipelineEvent>) {
        let metrics = Arc::new(RuntimeMetrics::default());
        let bus = Arc::new(EventBus::new(64, metrics.clone()));
        let rx = bus.subscribe();
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            default_ceiling: ceiling,
            ..Default::default()
        }));
        let source = SourceConfig::new("s1", URL, Sport::Nba, DataKind::PlayerStats, Duration::from_secs(5));

        let ctx = LoopContext::new(
            source,
            Duration::from_secs(30),
            AdapterRegistry::uniform(fixture),
            limiter,
            bus,
            metrics,
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn successful_tick_publishes_record() {
        let fixture = Arc::new(FixtureAdapter::new().with(
            URL,
            FixtureResponse::Payload(json!({ "players": [{}, {}, {}] })),
        ));
        let (ctx, mut rx) = context(fixture, 10);

        run_tick(&ctx).await;

        match rx.try_recv().unwrap() {
            PipelineEvent::CollectionSuccess(record) => {
                assert_eq!(record.source_id, "s1");
                assert_eq!(record.record_count, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn failing_tick_publishes_error() {
        let fixture = Arc::new(FixtureAdapter::new().with(URL, FixtureResponse::Fail("503".into())));
        let (ctx, mut rx) = context(fixture, 10);

        run_tick(&ctx).await;

        assert!(matches!(rx.try_recv().unwrap(), PipelineEvent::CollectionError(_)));
        assert_eq!(RuntimeMetrics::get(&ctx.metrics.fetch_errors), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fetch_times_out() {
        let fixture = Arc::new(FixtureAdapter::new().with(URL, FixtureResponse::Hang));
        let (ctx, mut rx) = context(fixture, 10);

        run_tick(&ctx).await;

        match rx.try_recv().unwrap() {
            PipelineEvent::CollectionError(e) => assert!(e.message.contains("timed out")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limited_tick_emits_nothing() {
        let fixture = Arc::new(FixtureAdapter::new().with(URL, FixtureResponse::Payload(json!([]))));
        let (ctx, mut rx) = context(fixture.clone(), 1);

        run_tick(&ctx).await;
        run_tick(&ctx).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(fixture.calls(URL), 1);
        assert_eq!(RuntimeMetrics::get(&ctx.metrics.rate_limited_skips), 1);
    }
}
