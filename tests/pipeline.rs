use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use sportsfeed_collector::{
    Collaborators, Config, DataKind, Pipeline, PipelineEvent, SourceConfig, Sport,
    collaborators::{MemoryStorage, NullSink},
    config::RateLimitConfig,
    error::ConfigError,
    fetchers::{AdapterRegistry, FixtureAdapter, FixtureResponse},
    metrics::RuntimeMetrics,
    monitor::HealthStatus,
};

const GAMES_URL: &str = "https://stats.example.com/nfl/games";
const ODDS_URL: &str = "https://odds.example.net/nfl";
const PLAYERS_URL: &str = "https://players.example.org/nba";
const BROKEN_URL: &str = "https://broken.example.io/scores";

fn games() -> Value {
    json!({ "games": [{ "id": "g1", "home_team": "KC", "away_team": "BUF", "status": "in_progress" }] })
}

fn odds() -> Value {
    json!([{ "game_id": "g1", "bookmaker": "acme", "home_moneyline": -150, "away_moneyline": "+130" }])
}

struct Harness {
    pipeline: Pipeline,
    fixture: Arc<FixtureAdapter>,
    storage: Arc<MemoryStorage>,
}

fn harness(sources: Vec<SourceConfig>, origins: HashMap<String, u32>) -> Harness {
    let fixture = Arc::new(
        FixtureAdapter::new()
            .with(GAMES_URL, FixtureResponse::Payload(games()))
            .with(ODDS_URL, FixtureResponse::Payload(odds()))
            .with(BROKEN_URL, FixtureResponse::Fail("HTTP 502".to_string())),
    );
    let storage = Arc::new(MemoryStorage::new());

    let config = Config {
        sources,
        rate_limits: RateLimitConfig {
            default_ceiling: 1_000,
            origins,
            ..Default::default()
        },
        ..Default::default()
    };

    let pipeline = Pipeline::new(
        &config,
        Collaborators {
            storage: storage.clone(),
            prediction: None,
            sink: Arc::new(NullSink),
            adapters: AdapterRegistry::uniform(fixture.clone()),
        },
    )
    .unwrap();

    Harness { pipeline, fixture, storage }
}

fn source(id: &str, url: &str, kind: DataKind, every: Duration) -> SourceConfig {
    SourceConfig::new(id, url, Sport::Nfl, kind, every)
}

fn drain(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn rate_limited_source_over_three_minutes() {
    let h = harness(
        vec![source("s1", GAMES_URL, DataKind::GameUpdates, Duration::from_secs(1))],
        HashMap::from([("https://stats.example.com".to_string(), 2)]),
    );

    h.pipeline.start().await;
    tokio::time::sleep(Duration::from_secs(180)).await;
    h.pipeline.stop().await;

    let perf = h.pipeline.get_source_performance();
    let s1 = perf.iter().find(|m| m.source_id == "s1").unwrap();

    assert!(s1.successes >= 2);
    assert!(s1.successes <= 6, "got {} successes", s1.successes);
    assert_eq!(s1.requests, s1.successes);
    assert_eq!(s1.failures, 0);
    assert_eq!(h.fixture.calls(GAMES_URL) as u64, s1.successes);

    let metrics = h.pipeline.runtime_metrics();
    assert!(RuntimeMetrics::get(&metrics.rate_limited_skips) > 100);
    assert_eq!(h.storage.upserts() as u64, s1.successes);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_published_after_stop() {
    let h = harness(
        vec![
            source("games", GAMES_URL, DataKind::GameUpdates, Duration::from_secs(1)),
            source("odds", ODDS_URL, DataKind::Odds, Duration::from_secs(2)),
        ],
        HashMap::new(),
    );
    let mut events = h.pipeline.subscribe();

    h.pipeline.start().await;
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    h.pipeline.stop().await;

    let before = drain(&mut events);
    assert!(before.iter().any(|e| matches!(e, PipelineEvent::CollectionSuccess(_))));
    assert!(before.iter().any(|e| matches!(e, PipelineEvent::ProcessedUpdate(_))));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(drain(&mut events).is_empty());
    assert!(!h.pipeline.is_running());

    // second stop is a no-op
    h.pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_a_source_does_not_touch_the_others() {
    let h = harness(
        vec![
            source("games", GAMES_URL, DataKind::GameUpdates, Duration::from_secs(1)),
            source("odds", ODDS_URL, DataKind::Odds, Duration::from_secs(1)),
        ],
        HashMap::new(),
    );

    h.pipeline.start().await;
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    h.pipeline.set_source_enabled("games", false).await.unwrap();
    let games_calls = h.fixture.calls(GAMES_URL);
    let odds_calls = h.fixture.calls(ODDS_URL);

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.fixture.calls(GAMES_URL), games_calls);
    assert!(h.fixture.calls(ODDS_URL) >= odds_calls + 4);

    let status = h.pipeline.get_status().await;
    assert!(status.running);
    assert_eq!(status.total_sources, 2);
    assert_eq!(status.active_sources, 1);
    let games = status.sources.iter().find(|s| s.id == "games").unwrap();
    assert!(!games.enabled && !games.active);

    h.pipeline.set_source_enabled("games", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(h.fixture.calls(GAMES_URL) > games_calls);

    h.pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_entity_is_isolated_end_to_end() {
    let mut players: Vec<Value> = (0..9)
        .map(|i| json!({ "id": format!("p{i}"), "name": format!("Player {i}"), "stats": { "pts": i } }))
        .collect();
    players.push(json!({ "name": "no id" }));

    let h = harness(
        vec![SourceConfig::new("players", PLAYERS_URL, Sport::Nba, DataKind::PlayerStats, Duration::from_secs(60))],
        HashMap::new(),
    );
    h.fixture.set(PLAYERS_URL, FixtureResponse::Payload(json!({ "players": players })));

    h.pipeline.start().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.pipeline.stop().await;

    assert_eq!(h.storage.count("player_stats"), 9);
    let metrics = h.pipeline.runtime_metrics();
    assert_eq!(RuntimeMetrics::get(&metrics.normalization_errors), 1);
    assert_eq!(RuntimeMetrics::get(&metrics.records_processed), 1);

    let perf = h.pipeline.get_source_performance();
    assert_eq!(perf[0].records_collected, 10);
}

#[tokio::test(start_paused = true)]
async fn failing_source_is_reported_unhealthy() {
    let h = harness(
        vec![
            source("broken", BROKEN_URL, DataKind::GameUpdates, Duration::from_secs(1)),
            source("odds", ODDS_URL, DataKind::Odds, Duration::from_secs(60)),
        ],
        HashMap::new(),
    );

    h.pipeline.start().await;
    tokio::time::sleep(Duration::from_millis(11_500)).await;

    let health = h.pipeline.check_health().await;
    assert_ne!(health.status, HealthStatus::Healthy);
    assert_eq!(health.unhealthy_sources, vec!["broken".to_string()]);
    assert!(health.checks["pipeline_running"]);
    assert!(!health.checks.contains_key("prediction_service_reachable"));

    let errors = h.pipeline.get_error_history(Duration::from_secs(60));
    assert!(errors.len() >= 11);
    assert!(errors.iter().all(|e| e.source_id == "broken"));

    h.pipeline.stop().await;
    assert!(h.pipeline.get_health().is_some());
}

#[tokio::test(start_paused = true)]
async fn sources_can_be_added_and_retuned_while_running() {
    let h = harness(vec![], HashMap::new());
    h.pipeline.start().await;
    h.pipeline.start().await;

    h.pipeline
        .add_source(source("odds", ODDS_URL, DataKind::Odds, Duration::from_secs(10)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(h.fixture.calls(ODDS_URL), 1);

    h.pipeline.update_source_interval("odds", Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert!(h.fixture.calls(ODDS_URL) >= 4);

    assert!(matches!(
        h.pipeline.update_source_interval("missing", Duration::from_secs(1)).await,
        Err(ConfigError::NotFound(_))
    ));
    assert!(matches!(
        h.pipeline.update_source_interval("odds", Duration::ZERO).await,
        Err(ConfigError::InvalidSource { .. })
    ));

    h.pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn source_added_during_stop_never_runs() {
    let h = harness(
        vec![source("games", GAMES_URL, DataKind::GameUpdates, Duration::from_secs(1))],
        HashMap::new(),
    );
    let mut events = h.pipeline.subscribe();

    h.pipeline.start().await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let (disabled, (), added) = tokio::join!(
        h.pipeline.set_source_enabled("games", false),
        h.pipeline.stop(),
        h.pipeline.add_source(source("odds", ODDS_URL, DataKind::Odds, Duration::from_secs(1))),
    );
    disabled.unwrap();
    added.unwrap();
    drain(&mut events);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!h.pipeline.is_running());
    assert_eq!(h.fixture.calls(ODDS_URL), 0);
    assert!(drain(&mut events).is_empty());

    let status = h.pipeline.get_status().await;
    assert_eq!(status.active_sources, 0);
    assert_eq!(status.total_sources, 2);
}

#[test]
fn invalid_source_in_config_is_rejected() {
    let config = Config {
        sources: vec![source("bad", "not a url", DataKind::News, Duration::from_secs(5))],
        ..Default::default()
    };
    let result = Pipeline::new(
        &config,
        Collaborators {
            storage: Arc::new(MemoryStorage::new()),
            prediction: None,
            sink: Arc::new(NullSink),
            adapters: AdapterRegistry::new(),
        },
    );
    assert!(matches!(result, Err(ConfigError::InvalidSource { .. })));
}
