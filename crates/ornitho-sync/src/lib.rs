//! Sync pipeline: paginated fetch -> merge -> reconcile -> notify -> persist.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ornitho_adapters::{
    CachedNameLookup, ListingConfig, NameLookup, OrnithoListingSource, PageSource, TableNameLookup,
};
use ornitho_storage::{HttpClientConfig, HttpFetcher, PolitenessDelay, SightingStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod merge;
mod notify;
mod reconcile;

pub use merge::{merge_sightings, MergedSightings, SightingMerger, SightingStream};
pub use notify::{ConsoleNotifier, Notifier, RecordingNotifier};
pub use reconcile::{
    Reconciliation, ReconcilePolicy, ReconcileRun, ReconciliationEngine, RunOutcome, Step,
    DEFAULT_MAX_NOTIFICATIONS,
};

pub const CRATE_NAME: &str = "ornitho-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub listing: ListingConfig,
    pub state_file: PathBuf,
    pub names_file: PathBuf,
    pub policy: ReconcilePolicy,
    /// Bound applied whenever the single-cursor policy is selected.
    pub max_notifications: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub politeness: PolitenessDelay,
    /// 0 means unbounded.
    pub name_cache_capacity: usize,
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listing: ListingConfig::default(),
            state_file: PathBuf::from("./state/last_sent.json"),
            names_file: PathBuf::from("./names.yaml"),
            policy: ReconcilePolicy::default(),
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
            user_agent: "ornitho-notify/0.1".to_string(),
            http_timeout_secs: 20,
            politeness: PolitenessDelay::default(),
            name_cache_capacity: 0,
            dry_run: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let policy = match std::env::var("ORNITHO_POLICY") {
            Ok(name) => name
                .parse::<ReconcilePolicy>()
                .map_err(anyhow::Error::msg)
                .context("reading ORNITHO_POLICY")?,
            Err(_) => defaults.policy,
        };
        let max_notifications = env_parse("ORNITHO_MAX_NOTIFICATIONS", defaults.max_notifications);

        Ok(Self {
            listing: ListingConfig {
                base_url: std::env::var("ORNITHO_BASE_URL").unwrap_or(defaults.listing.base_url),
                days_offset: env_parse("ORNITHO_DAYS_OFFSET", defaults.listing.days_offset),
                items_per_page: env_parse("ORNITHO_ITEMS_PER_PAGE", defaults.listing.items_per_page),
                max_pages: env_parse("ORNITHO_MAX_PAGES", defaults.listing.max_pages),
            },
            state_file: std::env::var("ORNITHO_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            names_file: std::env::var("ORNITHO_NAMES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.names_file),
            policy: policy.with_max_notifications(max_notifications),
            max_notifications,
            user_agent: std::env::var("ORNITHO_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("ORNITHO_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            politeness: PolitenessDelay {
                min: Duration::from_millis(env_parse(
                    "ORNITHO_POLITENESS_MIN_MS",
                    defaults.politeness.min.as_millis() as u64,
                )),
                max: Duration::from_millis(env_parse(
                    "ORNITHO_POLITENESS_MAX_MS",
                    defaults.politeness.max.as_millis() as u64,
                )),
            },
            name_cache_capacity: env_parse("ORNITHO_NAME_CACHE_CAPACITY", defaults.name_cache_capacity),
            dry_run: std::env::var("ORNITHO_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        })
    }

    /// Switch policy, keeping the configured notification bound.
    pub fn set_policy(&mut self, policy: ReconcilePolicy) {
        self.policy = policy.with_max_notifications(self.max_notifications);
    }

    pub fn set_max_notifications(&mut self, max_notifications: usize) {
        self.max_notifications = max_notifications;
        self.policy = self.policy.with_max_notifications(max_notifications);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub policy: String,
    pub pages_fetched: usize,
    pub records: usize,
    pub observed: usize,
    pub notified: usize,
    pub state_saved: bool,
    pub ended_on_miss: bool,
    pub dry_run: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn PageSource>,
    lookup: Box<dyn NameLookup>,
    store: SightingStore,
    engine: ReconciliationEngine,
}

impl SyncPipeline {
    /// Pipeline against the live listing, with the YAML name table.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = OrnithoListingSource::http(http, config.listing.clone(), config.politeness);
        let table = TableNameLookup::from_yaml_file(&config.names_file)?;
        let lookup: Box<dyn NameLookup> = if config.name_cache_capacity == 0 {
            Box::new(CachedNameLookup::new(table))
        } else {
            Box::new(CachedNameLookup::bounded(table, config.name_cache_capacity))
        };
        Ok(Self::from_parts(config, Box::new(source), lookup))
    }

    pub fn from_parts(
        config: SyncConfig,
        source: Box<dyn PageSource>,
        lookup: Box<dyn NameLookup>,
    ) -> Self {
        let store = SightingStore::new(config.state_file.clone());
        let engine = ReconciliationEngine::new(config.policy);
        Self {
            config,
            source,
            lookup,
            store,
            engine,
        }
    }

    pub fn store(&self) -> &SightingStore {
        &self.store
    }

    pub async fn run_once(&mut self, notifier: &mut dyn Notifier) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, policy = self.engine.policy().name());
        self.run_inner(run_id, notifier).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, notifier: &mut dyn Notifier) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let dry_run = self.config.dry_run;
        let prior = self.store.load().await?;
        info!(
            state_file = %self.store.path().display(),
            prior_entries = prior.history().len(),
            "loaded sent state"
        );

        let mut run = self.engine.begin(prior);
        let mut stream = SightingStream::new(&mut *self.source).with_lookup(&*self.lookup);
        let mut state_saved = false;

        while !run.is_stopped() {
            let next = match stream.next().await {
                Ok(next) => next,
                Err(err) => {
                    if state_saved {
                        warn!(
                            notified = run.notified(),
                            "fetch failed after the cursor was saved; older sightings of this run will not be notified"
                        );
                    }
                    return Err(err).context("reading listing");
                }
            };
            let Some(sighting) = next else {
                break;
            };

            let step = run.observe(sighting);
            if let Some(cursor) = run.take_pending_save() {
                if !dry_run {
                    self.store.save(&cursor).await?;
                    state_saved = true;
                }
            }
            match step {
                Step::Notify(sighting) => notifier.notify(&sighting)?,
                Step::Skip => {}
                Step::Stop => break,
            }
        }

        let pages_fetched = stream.pages_fetched();
        let records = stream.records_pulled();
        let ended_on_miss = stream.ended_on_miss();
        drop(stream);

        let outcome = run.finish();
        if outcome.changed && !state_saved && !dry_run {
            self.store.save(&outcome.state).await?;
            state_saved = true;
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            policy: self.engine.policy().name().to_string(),
            pages_fetched,
            records,
            observed: outcome.observed,
            notified: outcome.notified,
            state_saved,
            ended_on_miss,
            dry_run,
        };
        info!(
            pages = summary.pages_fetched,
            observed = summary.observed,
            notified = summary.notified,
            state_saved = summary.state_saved,
            "sync run finished"
        );
        Ok(summary)
    }
}

pub async fn run_sync_once_from_env(notifier: &mut dyn Notifier) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let mut pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(notifier).await
}
