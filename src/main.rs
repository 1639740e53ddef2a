// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::env;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use rustls::crypto::{CryptoProvider, ring};

use sportsfeed_collector::{
    Collaborators, Config, Pipeline,
    collaborators::{
        EventSink, HttpPredictionService, MemoryStorage, NullSink, PredictionService, RedisStorage,
        Storage,
    },
    fetchers::AdapterRegistry,
    metrics::RuntimeMetrics,
    notifier::NotifierPool,
};

const DEFAULT_CONFIG_PATH: &str = "config.json";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the cryptography backend (rustls)
// - Load configuration
// - Wire the collaborators (storage, predictions, notifier)
// - Run the pipeline until ctrl-c, then stop it cleanly
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider,
    // installed once, before the first TLS connection.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // --------------------------------------------------------
    // Config path: first CLI argument, then SPORTSFEED_CONFIG,
    // then ./config.json
    //
    // NOTE:
    // - The config file may contain credentials (hub key,
    //   render service token). Keep it out of version control.
    // --------------------------------------------------------
    let path = env::args()
        .nth(1)
        .or_else(|| env::var("SPORTSFEED_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::from_file(&path)?;
    info!("loaded {} source(s) from {}", config.sources.len(), path);

    let debug = config.debug.as_ref().is_some_and(|d| d.log.unwrap_or(false));
    let metrics = Arc::new(RuntimeMetrics::default());

    // --------------------------------------------------------
    // Collaborators
    // --------------------------------------------------------
    let storage: Arc<dyn Storage> = match &config.storage {
        Some(cfg) => Arc::new(RedisStorage::new(cfg).context("invalid storage config")?),
        None => {
            warn!("no storage configured, entities are kept in memory only");
            Arc::new(MemoryStorage::new())
        }
    };

    let prediction: Option<Arc<dyn PredictionService>> = match &config.prediction {
        Some(cfg) => Some(Arc::new(
            HttpPredictionService::new(cfg).context("invalid prediction config")?,
        )),
        None => {
            info!("no prediction service configured, predictions disabled");
            None
        }
    };

    let sink: Arc<dyn EventSink> = match &config.notifier {
        Some(cfg) => Arc::new(NotifierPool::new(cfg, debug, metrics.clone())),
        None => Arc::new(NullSink),
    };

    let adapters = AdapterRegistry::from_config(&config).context("failed to build fetch adapters")?;

    let pipeline = Pipeline::with_metrics(
        &config,
        Collaborators {
            storage,
            prediction,
            sink,
            adapters,
        },
        metrics,
    )?;

    pipeline.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    pipeline.stop().await;

    Ok(())
}
