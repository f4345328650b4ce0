use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

mod api;
pub use api::Api;

pub mod aggregation;
pub mod metrics;
pub mod multiplier;
pub mod overrides;
pub mod races;
pub mod rounds;
pub mod store;

use aggregation::RaceCache;
use metrics::{CoreMetrics, CoreMetricsSnapshot, HttpMetrics, ProcessMonitor};
use multiplier::MultiplierGenerator;
use overrides::OverrideStore;
use races::{RaceManager, RaceManagerConfig};
use rounds::RoundOrchestrator;
use store::Store;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub store_path: PathBuf,
    pub multiplier_config_path: PathBuf,
    pub countdown_config_path: PathBuf,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("updraft.db"),
            multiplier_config_path: PathBuf::from("multiplierConfig.json"),
            countdown_config_path: PathBuf::from("gameCountdownConfig.json"),
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            http_body_limit_bytes: Some(10 * 1024 * 1024),
        }
    }
}

/// The assembled core: owned collaborators handed to route handlers, never
/// process globals.
pub struct App {
    pub config: AppConfig,
    store: Arc<Store>,
    cache: Arc<RaceCache>,
    races: Arc<RaceManager>,
    rounds: Arc<RoundOrchestrator>,
    overrides: OverrideStore,
    generator: Arc<MultiplierGenerator>,
    core_metrics: Arc<CoreMetrics>,
    http_metrics: HttpMetrics,
    process_monitor: ProcessMonitor,
    started_at: u64,
}

impl App {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store =
            Arc::new(Store::open(&config.store_path).context("open persistent store")?);
        let core_metrics = Arc::new(CoreMetrics::default());
        let generator = Arc::new(MultiplierGenerator::from_file(
            &config.multiplier_config_path,
        ));
        let cache = Arc::new(RaceCache::new(
            Arc::clone(&store),
            Arc::clone(&core_metrics),
        ));
        let races = Arc::new(RaceManager::new(
            RaceManagerConfig::default(),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&core_metrics),
        ));
        let rounds = Arc::new(RoundOrchestrator::new(
            Arc::clone(&generator),
            config.countdown_config_path.clone(),
            Arc::clone(&core_metrics),
        ));

        Ok(Self {
            config,
            store,
            cache,
            races,
            rounds,
            overrides: OverrideStore::new(),
            generator,
            core_metrics,
            http_metrics: HttpMetrics::default(),
            process_monitor: ProcessMonitor::new(),
            started_at: now_ms(),
        })
    }

    /// Spawn the round clock, the race lifecycle, and the cache's background
    /// flush/sync/cleanup tasks.
    pub fn start(&self) {
        self.rounds.start();
        self.races.start();
        self.cache.start_background_tasks();
    }

    /// Best-effort shutdown: flush the pending debounced config write
    /// synchronously, then drain queued session saves.
    pub async fn shutdown(&self) {
        if let Err(err) = self.rounds.save_config_now() {
            tracing::warn!("Final countdown config save failed: {err}");
        }
        self.cache.flush_pending().await;
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<RaceCache> {
        &self.cache
    }

    pub fn races(&self) -> &Arc<RaceManager> {
        &self.races
    }

    pub fn rounds(&self) -> &Arc<RoundOrchestrator> {
        &self.rounds
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    pub fn generator(&self) -> &MultiplierGenerator {
        &self.generator
    }

    pub(crate) fn core_metrics(&self) -> &Arc<CoreMetrics> {
        &self.core_metrics
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn core_metrics_snapshot(&self) -> CoreMetricsSnapshot {
        self.core_metrics.snapshot()
    }

    pub fn process_usage(&self) -> metrics::ProcessUsage {
        self.process_monitor.usage()
    }

    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at)
    }
}
