//! Campaign orchestration: env configuration, backend wiring, runs and run reports.

mod campaign;
mod orchestrator;
mod report;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use flp_adapters::{DiscoverySource, FeedSource, FixtureSource, DEFAULT_FEED_URL};
use flp_core::FitTier;
use flp_proposals::{AnthropicProposalGenerator, ProposalConfig, ProposalGenerator, TemplateProposalGenerator};
use flp_scoring::ProfileCatalog;
use flp_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, LeadStore, LocalTracker, NotionConfig,
    NotionTracker, PgTracker, StoreConfig, TrackerBackend,
};
use tracing::info;

pub use campaign::{CampaignMode, CampaignRegistry};
pub use orchestrator::{
    retry_pending_upserts, CampaignOrchestrator, CampaignRunReport, CancelHandle, ConfigReport,
    FailureStage, LeadSummary, OrchestratorConfig, PendingUpsert, RunFailure, RunState,
};
pub use report::{
    daily_brief, read_run_report, recent_runs_markdown, write_run_reports, DAILY_BRIEF_FILE,
    RUN_SUMMARY_FILE,
};

pub const CRATE_NAME: &str = "flp-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Local,
    Notion,
    Postgres,
}

impl std::str::FromStr for TrackerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "file" => Ok(TrackerKind::Local),
            "notion" => Ok(TrackerKind::Notion),
            "postgres" | "pg" => Ok(TrackerKind::Postgres),
            other => bail!("unknown tracker backend {other:?} (expected local, notion or postgres)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub tracker: String,
    pub tracker_path: PathBuf,
    pub database_url: Option<String>,
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
    pub feed_url: String,
    pub fixtures_dir: Option<PathBuf>,
    pub request_delay_ms: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cache_lookback_days: i64,
    pub store_retries: usize,
    pub proposals_enabled: bool,
    pub proposal_min_tier: FitTier,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_opt(name).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = env_opt("FLP_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            tracker: env_opt("FLP_TRACKER").unwrap_or_else(|| "local".to_string()),
            tracker_path: env_opt("FLP_TRACKER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data").join("tracker.json")),
            database_url: env_opt("DATABASE_URL"),
            notion_token: env_opt("NOTION_TOKEN"),
            notion_database_id: env_opt("NOTION_DATABASE_ID"),
            feed_url: env_opt("FLP_FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            fixtures_dir: env_opt("FLP_FIXTURES_DIR").map(PathBuf::from),
            request_delay_ms: env_parse("FLP_REQUEST_DELAY_MS", 2000),
            user_agent: env_opt("FLP_USER_AGENT").unwrap_or_else(|| "flp-bot/0.1".to_string()),
            http_timeout_secs: env_parse("FLP_HTTP_TIMEOUT_SECS", 30),
            cache_lookback_days: env_parse("FLP_CACHE_LOOKBACK_DAYS", 30),
            store_retries: env_parse("FLP_STORE_RETRIES", 1),
            proposals_enabled: env_opt("FLP_PROPOSALS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "on"))
                .unwrap_or(false),
            proposal_min_tier: env_parse("FLP_PROPOSAL_MIN_TIER", FitTier::High),
            workspace_root,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            cache_lookback: ChronoDuration::try_days(self.cache_lookback_days.max(0))
                .unwrap_or_else(|| StoreConfig::default().cache_lookback),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            request_delay: Duration::from_millis(self.request_delay_ms),
            store_retry: BackoffPolicy {
                max_retries: self.store_retries,
                ..defaults.store_retry
            },
            proposal_min_tier: self.proposal_min_tier,
        }
    }
}

pub async fn build_tracker(config: &SyncConfig) -> Result<Box<dyn TrackerBackend>> {
    let kind: TrackerKind = config.tracker.parse()?;
    let tracker: Box<dyn TrackerBackend> = match kind {
        TrackerKind::Local => Box::new(LocalTracker::open(&config.tracker_path).await?),
        TrackerKind::Notion => {
            let token = config
                .notion_token
                .clone()
                .context("NOTION_TOKEN is required for the notion tracker")?;
            let database_id = config
                .notion_database_id
                .clone()
                .context("NOTION_DATABASE_ID is required for the notion tracker")?;
            Box::new(NotionTracker::new(NotionConfig::new(token, database_id))?)
        }
        TrackerKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres tracker")?;
            Box::new(PgTracker::connect(url).await?)
        }
    };
    info!(tracker = tracker.backend_name(), "tracker ready");
    Ok(tracker)
}

pub async fn open_store(config: &SyncConfig) -> Result<LeadStore> {
    Ok(LeadStore::from_boxed(build_tracker(config).await?, config.store_config()))
}

/// Fixture directory when configured, the live feed otherwise.
pub fn build_source(config: &SyncConfig) -> Result<Box<dyn DiscoverySource>> {
    if let Some(dir) = &config.fixtures_dir {
        return Ok(Box::new(FixtureSource::new(dir.clone())));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Box::new(FeedSource::new(http, config.feed_url.clone())))
}

/// Hosted model when an api key is configured, templates otherwise.
pub fn build_proposal_generator(config: ProposalConfig) -> Result<Box<dyn ProposalGenerator>> {
    if config.api_key.is_some() {
        Ok(Box::new(AnthropicProposalGenerator::new(config)?))
    } else {
        Ok(Box::new(TemplateProposalGenerator))
    }
}

#[derive(Debug, Clone)]
pub struct CampaignRunOutput {
    pub report: CampaignRunReport,
    pub reports_dir: PathBuf,
}

/// One full run from environment configuration, with reports written to the workspace.
pub async fn run_campaign_from_env(mode: &str, cancel: CancelHandle) -> Result<CampaignRunOutput> {
    let config = SyncConfig::from_env();
    let registry = CampaignRegistry::load_or_default(&config.workspace_root)?;
    let catalog = ProfileCatalog::load_or_default(&config.workspace_root)?;
    let (mode, configs) = registry.resolve(mode);

    let mut orchestrator = CampaignOrchestrator::new(
        build_source(&config)?,
        open_store(&config).await?,
        catalog,
        config.orchestrator_config(),
    )
    .with_cancel_handle(cancel);
    if config.proposals_enabled {
        orchestrator = orchestrator.with_proposals(build_proposal_generator(ProposalConfig::from_env())?);
    }

    let report = orchestrator.run(mode, configs).await;
    let stats = orchestrator.store().stats().await.ok();
    let reports_dir = write_run_reports(&config.workspace_root, &report, stats.as_ref()).await?;
    Ok(CampaignRunOutput { report, reports_dir })
}

#[derive(Debug, Clone)]
pub struct PendingRetryOutput {
    pub saved: usize,
    pub still_pending: Vec<RunFailure>,
}

/// Re-upsert the listings a recorded run could not save, reading them back from its run summary.
pub async fn retry_pending_from_env(run_id: &str) -> Result<PendingRetryOutput> {
    let config = SyncConfig::from_env();
    let report = read_run_report(&config.workspace_root, run_id).await?;
    let mut store = open_store(&config).await?;
    let (saved, still_pending) =
        retry_pending_upserts(&mut store, config.orchestrator_config().store_retry, &report).await;
    Ok(PendingRetryOutput {
        saved: saved.len(),
        still_pending,
    })
}
