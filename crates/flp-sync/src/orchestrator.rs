use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flp_adapters::{extract_listing, DiscoverySource};
use flp_core::{FitScore, FitTier, ListingRecord, SearchConfig};
use flp_proposals::{generate_or_degrade, ProposalGenerator, ProposalOutcome, TemplateProposalGenerator};
use flp_scoring::ProfileCatalog;
use flp_storage::{BackoffPolicy, LeadStore, StoreError, UpsertDisposition, UpsertOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::campaign::CampaignMode;

/// Cooperative stop flag shared between the orchestrator and whoever hosts it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running { config_index: usize, config: String },
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Suspension between consecutive discovery calls.
    pub request_delay: Duration,
    /// Retries of a single upsert after a retryable tracker failure.
    pub store_retry: BackoffPolicy,
    /// Draft proposals for newly created leads at or above this tier.
    pub proposal_min_tier: FitTier,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(2),
            store_retry: BackoffPolicy {
                max_retries: 1,
                ..BackoffPolicy::default()
            },
            proposal_min_tier: FitTier::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Discovery,
    Extraction,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub config: String,
    pub stage: FailureStage,
    pub identity: Option<String>,
    pub message: String,
    /// Set on store failures: the write that did not land, ready to be upserted again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingUpsert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpsert {
    pub listing: ListingRecord,
    pub score: FitScore,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigReport {
    pub name: String,
    pub query: String,
    pub discovered: usize,
    pub stored: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSummary {
    pub identity: String,
    pub title: String,
    pub budget: String,
    pub config: String,
    pub best_profile: Option<String>,
    pub fit_tier: FitTier,
    pub confidence: f64,
    pub pain_points: Vec<String>,
    pub reasoning: String,
    pub disposition: UpsertDisposition,
    pub proposal: Option<ProposalOutcome>,
}

/// What one orchestrator run did. Never silently partial: every skipped item is in `failures`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRunReport {
    pub run_id: Uuid,
    pub mode: CampaignMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub cancelled: bool,
    pub tracker: String,
    pub discovered: usize,
    pub created: usize,
    pub merged: usize,
    pub score_improved: usize,
    pub degraded_duplicate_checks: usize,
    pub proposals_drafted: usize,
    pub configs: Vec<ConfigReport>,
    pub failures: Vec<RunFailure>,
    pub leads: Vec<LeadSummary>,
}

impl CampaignRunReport {
    pub fn stored(&self) -> usize {
        self.created + self.merged
    }

    pub fn high_fit(&self) -> impl Iterator<Item = &LeadSummary> {
        self.leads.iter().filter(|lead| lead.fit_tier == FitTier::High)
    }

    /// Store failures that still carry their listing, with the configuration that found them.
    pub fn pending_upserts(&self) -> impl Iterator<Item = (&str, &PendingUpsert)> {
        self.failures
            .iter()
            .filter_map(|failure| failure.pending.as_ref().map(|pending| (failure.config.as_str(), pending)))
    }
}

/// Runs search configurations through discovery, extraction, scoring and the lead store.
///
/// Every external collaborator is injected, so the whole run can be driven by fakes.
pub struct CampaignOrchestrator {
    source: Box<dyn DiscoverySource>,
    store: LeadStore,
    catalog: ProfileCatalog,
    proposals: Option<Box<dyn ProposalGenerator>>,
    fallback: TemplateProposalGenerator,
    config: OrchestratorConfig,
    cancel: CancelHandle,
    state: RunState,
}

impl CampaignOrchestrator {
    pub fn new(
        source: Box<dyn DiscoverySource>,
        store: LeadStore,
        catalog: ProfileCatalog,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            source,
            store,
            catalog,
            proposals: None,
            fallback: TemplateProposalGenerator,
            config,
            cancel: CancelHandle::new(),
            state: RunState::Idle,
        }
    }

    pub fn with_proposals(mut self, generator: Box<dyn ProposalGenerator>) -> Self {
        self.proposals = Some(generator);
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn store(&self) -> &LeadStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut LeadStore {
        &mut self.store
    }

    pub fn into_store(self) -> LeadStore {
        self.store
    }

    /// Run `configs` in order. Per-configuration and per-listing failures are collected, not
    /// raised; the run is `Failed` only when every configuration failed discovery.
    pub async fn run(&mut self, mode: CampaignMode, configs: &[SearchConfig]) -> CampaignRunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("campaign_run", %run_id, mode = mode.as_str(), source = self.source.source_name());
        self.run_inner(run_id, mode, configs).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, mode: CampaignMode, configs: &[SearchConfig]) -> CampaignRunReport {
        let started_at = Utc::now();
        let mut report = CampaignRunReport {
            run_id,
            mode,
            started_at,
            finished_at: started_at,
            state: RunState::Idle,
            cancelled: false,
            tracker: self.store.backend_name().to_string(),
            discovered: 0,
            created: 0,
            merged: 0,
            score_improved: 0,
            degraded_duplicate_checks: 0,
            proposals_drafted: 0,
            configs: Vec::with_capacity(configs.len()),
            failures: Vec::new(),
            leads: Vec::new(),
        };
        info!(configs = configs.len(), "campaign run started");
        self.store.begin_run(started_at).await;

        let mut discovery_failures = 0usize;
        for (config_index, config) in configs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if config_index > 0 && !self.polite_delay().await {
                report.cancelled = true;
                break;
            }
            self.state = RunState::Running {
                config_index,
                config: config.name.clone(),
            };

            let span = info_span!("search_config", config = %config.name);
            let config_report = self.run_config(config, &mut report).instrument(span).await;
            if config_report.error.is_some() {
                discovery_failures += 1;
            }
            report.configs.push(config_report);
            if report.cancelled {
                break;
            }
        }

        let all_failed = !report.configs.is_empty() && discovery_failures == report.configs.len();
        self.state = if all_failed {
            RunState::Failed
        } else {
            RunState::Completed
        };
        report.state = self.state.clone();
        report.finished_at = Utc::now();
        info!(
            state = ?report.state,
            discovered = report.discovered,
            created = report.created,
            merged = report.merged,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "campaign run finished"
        );
        report
    }

    /// Sleep for the request delay; `false` if cancelled while waiting.
    async fn polite_delay(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.request_delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn run_config(&mut self, config: &SearchConfig, report: &mut CampaignRunReport) -> ConfigReport {
        let mut config_report = ConfigReport {
            name: config.name.clone(),
            query: config.query.clone(),
            ..Default::default()
        };

        let items = match self.source.discover(config).await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "discovery failed; continuing with next configuration");
                config_report.error = Some(err.to_string());
                report.failures.push(RunFailure {
                    config: config.name.clone(),
                    stage: FailureStage::Discovery,
                    identity: None,
                    message: err.to_string(),
                    pending: None,
                });
                return config_report;
            }
        };
        config_report.discovered = items.len();
        report.discovered += items.len();
        info!(items = items.len(), "discovered");

        for item in &items {
            let listing = extract_listing(item, &config.name, Utc::now());
            if !listing.is_storable() {
                report.failures.push(RunFailure {
                    config: config.name.clone(),
                    stage: FailureStage::Extraction,
                    identity: (!listing.identity.is_empty()).then(|| listing.identity.clone()),
                    message: listing.extraction_notes.join("; "),
                    pending: None,
                });
            } else {
                let score = self.catalog.score(&listing);
                let stored =
                    upsert_with_retry(&mut self.store, self.config.store_retry, &listing, &score, &config.name).await;
                match stored {
                    Ok(outcome) => {
                        config_report.stored += 1;
                        let proposal = self.maybe_draft(&listing, &score, &outcome).await;
                        record_stored(report, &listing, &score, &config.name, outcome, proposal);
                    }
                    Err(err) => {
                        warn!(identity = %listing.identity, error = %err, "upsert failed");
                        report.failures.push(store_failure(&config.name, listing, score, &err));
                    }
                }
            }
            if self.cancel.is_cancelled() {
                info!("cancellation requested; stopping after current listing");
                report.cancelled = true;
                break;
            }
        }
        config_report
    }

    async fn maybe_draft(
        &self,
        listing: &ListingRecord,
        score: &FitScore,
        outcome: &UpsertOutcome,
    ) -> Option<ProposalOutcome> {
        let generator = self.proposals.as_deref()?;
        if !outcome.is_new() || score.fit_tier < self.config.proposal_min_tier {
            return None;
        }
        let fallback: &dyn ProposalGenerator = &self.fallback;
        Some(generate_or_degrade(generator, Some(fallback), listing, score).await)
    }
}

async fn upsert_with_retry(
    store: &mut LeadStore,
    policy: BackoffPolicy,
    listing: &ListingRecord,
    score: &FitScore,
    campaign: &str,
) -> Result<UpsertOutcome, StoreError> {
    let mut attempt = 0;
    loop {
        match store.upsert(listing, score, campaign, Utc::now()).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(identity = %listing.identity, error = %err, attempt, ?delay, "retrying upsert");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn store_failure(config: &str, listing: ListingRecord, score: FitScore, err: &StoreError) -> RunFailure {
    RunFailure {
        config: config.to_string(),
        stage: FailureStage::Store,
        identity: Some(listing.identity.clone()),
        message: err.to_string(),
        pending: Some(PendingUpsert { listing, score }),
    }
}

/// Upsert again every listing a run could not save. Returns the outcomes that landed and the
/// failures that are still pending.
pub async fn retry_pending_upserts(
    store: &mut LeadStore,
    policy: BackoffPolicy,
    report: &CampaignRunReport,
) -> (Vec<UpsertOutcome>, Vec<RunFailure>) {
    let mut saved = Vec::new();
    let mut still_pending = Vec::new();
    for (config, pending) in report.pending_upserts() {
        match upsert_with_retry(store, policy, &pending.listing, &pending.score, config).await {
            Ok(outcome) => saved.push(outcome),
            Err(err) => {
                warn!(identity = %pending.listing.identity, error = %err, "pending upsert still failing");
                still_pending.push(store_failure(config, pending.listing.clone(), pending.score.clone(), &err));
            }
        }
    }
    info!(saved = saved.len(), pending = still_pending.len(), "retried pending upserts");
    (saved, still_pending)
}

fn record_stored(
    report: &mut CampaignRunReport,
    listing: &ListingRecord,
    score: &FitScore,
    config: &str,
    outcome: UpsertOutcome,
    proposal: Option<ProposalOutcome>,
) {
    match outcome.disposition {
        UpsertDisposition::Created => report.created += 1,
        UpsertDisposition::Merged { score_improved, .. } => {
            report.merged += 1;
            if score_improved {
                report.score_improved += 1;
            }
        }
    }
    if outcome.duplicate_check_degraded {
        report.degraded_duplicate_checks += 1;
    }
    if proposal.is_some() {
        report.proposals_drafted += 1;
    }
    report.leads.push(LeadSummary {
        identity: outcome.identity,
        title: listing.title.clone(),
        budget: listing.budget.to_string(),
        config: config.to_string(),
        best_profile: score.best_profile.clone(),
        fit_tier: score.fit_tier,
        confidence: score.confidence,
        pain_points: score.extracted_pain_points.clone(),
        reasoning: score.reasoning.clone(),
        disposition: outcome.disposition,
        proposal,
    });
}
