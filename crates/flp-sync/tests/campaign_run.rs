use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flp_adapters::{split_discovery_body, AdapterError, DiscoverySource, FixtureSource, RawItem};
use flp_core::{FitScore, FitTier, ListingRecord, PipelineStatus, SearchConfig};
use flp_proposals::{ProposalError, ProposalGenerator, ProposalOutcome};
use flp_scoring::ProfileCatalog;
use flp_storage::{
    BackoffPolicy, LeadPatch, LeadStore, LocalTracker, StoreConfig, TrackedLead, TrackerBackend,
    TrackerError, UpsertDisposition,
};
use flp_sync::{
    read_run_report, recent_runs_markdown, retry_pending_upserts, write_run_reports, CampaignMode,
    CampaignOrchestrator, CampaignRegistry, CancelHandle, FailureStage, OrchestratorConfig, RunState,
    DAILY_BRIEF_FILE, RUN_SUMMARY_FILE,
};
use tempfile::tempdir;

const COO: &str = "https://www.upwork.com/jobs/Fractional-COO_~01coo";

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feeds")
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        request_delay: Duration::ZERO,
        store_retry: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        proposal_min_tier: FitTier::High,
    }
}

fn orchestrator(source: impl DiscoverySource + 'static, tracker: impl TrackerBackend + 'static) -> CampaignOrchestrator {
    CampaignOrchestrator::new(
        Box::new(source),
        LeadStore::new(tracker, StoreConfig::default()),
        ProfileCatalog::default_catalog(),
        fast_config(),
    )
}

fn full_mode() -> Vec<SearchConfig> {
    CampaignRegistry::default_registry()
        .configs(CampaignMode::Full)
        .to_vec()
}

#[tokio::test]
async fn full_mode_over_fixtures_tolerates_partial_failure() {
    let tracker = Arc::new(LocalTracker::in_memory());
    let mut orchestrator = orchestrator(FixtureSource::new(fixtures_dir()), tracker.clone());

    let report = orchestrator.run(CampaignMode::Full, &full_mode()).await;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(orchestrator.state(), &RunState::Completed);
    assert!(!report.cancelled);
    assert_eq!(report.configs.len(), 4);
    assert_eq!(report.discovered, 7);
    assert_eq!(report.created, 5);
    assert_eq!(report.merged, 1);
    assert_eq!(report.stored(), 6);

    let stages = report.failures.iter().map(|f| (f.config.as_str(), f.stage)).collect::<Vec<_>>();
    assert_eq!(
        stages,
        vec![
            ("executive_suite", FailureStage::Extraction),
            ("revenue_operations", FailureStage::Discovery),
        ]
    );
    assert!(report.configs[2].error.is_some());

    let coo = report.leads.iter().find(|l| l.identity == COO).unwrap();
    assert_eq!(coo.best_profile.as_deref(), Some("team_leadership"));
    assert_eq!(coo.fit_tier, FitTier::High);
    assert_eq!(coo.pain_points, vec!["team issues"]);
    assert_eq!(
        report.leads.iter().filter(|l| l.identity == COO).map(|l| l.disposition).collect::<Vec<_>>(),
        vec![
            UpsertDisposition::Created,
            UpsertDisposition::Merged {
                score_improved: false,
                status_changed: false
            }
        ]
    );

    assert_eq!(tracker.query_all().await.unwrap().len(), 5);
}

#[tokio::test]
async fn rerun_merges_instead_of_duplicating_and_keeps_manual_status() {
    let tracker = Arc::new(LocalTracker::in_memory());
    let mut orchestrator = orchestrator(FixtureSource::new(fixtures_dir()), tracker.clone());
    let configs = full_mode();

    orchestrator.run(CampaignMode::Full, &configs).await;
    let marked = orchestrator
        .store_mut()
        .mark_status(&format!("{COO}?utm_campaign=manual"), PipelineStatus::Won, Utc::now())
        .await
        .unwrap();
    assert_eq!(marked, flp_storage::MarkOutcome::Updated);

    let second = orchestrator.run(CampaignMode::Full, &configs).await;
    assert_eq!(second.created, 0);
    assert_eq!(second.merged, 6);
    assert_eq!(tracker.query_all().await.unwrap().len(), 5);

    let coo = orchestrator.store_mut().find(COO).await.unwrap().unwrap();
    assert_eq!(coo.status, Some(PipelineStatus::Won));
}

#[tokio::test]
async fn tracker_file_survives_between_runs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data").join("tracker.json");

    let tracker = LocalTracker::open(&path).await.unwrap();
    let mut first = orchestrator(FixtureSource::new(fixtures_dir()), tracker);
    first.run(CampaignMode::Executive, &full_mode()[..1]).await;
    assert!(path.exists());

    let reopened = LocalTracker::open(&path).await.unwrap();
    let mut second = orchestrator(FixtureSource::new(fixtures_dir()), reopened);
    let report = second.run(CampaignMode::Executive, &full_mode()[..1]).await;
    assert_eq!(report.created, 0);
    assert_eq!(report.merged, 3);
}

struct DownSource;

#[async_trait]
impl DiscoverySource for DownSource {
    fn source_name(&self) -> &'static str {
        "down"
    }

    async fn discover(&self, config: &SearchConfig) -> Result<Vec<RawItem>, AdapterError> {
        Err(AdapterError::Message(format!("{} unreachable", config.name)))
    }
}

#[tokio::test]
async fn run_fails_only_when_every_configuration_fails() {
    let mut orchestrator = orchestrator(DownSource, LocalTracker::in_memory());
    let report = orchestrator.run(CampaignMode::Full, &full_mode()).await;
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failures.len(), 4);
    assert_eq!(report.discovered, 0);

    let empty = orchestrator.run(CampaignMode::Quick, &[]).await;
    assert_eq!(empty.state, RunState::Completed);
}

/// Serves the executive fixture and requests cancellation while doing so.
struct CancellingSource {
    cancel: CancelHandle,
    body: String,
}

#[async_trait]
impl DiscoverySource for CancellingSource {
    fn source_name(&self) -> &'static str {
        "cancelling"
    }

    async fn discover(&self, _config: &SearchConfig) -> Result<Vec<RawItem>, AdapterError> {
        self.cancel.cancel();
        Ok(split_discovery_body(&self.body))
    }
}

#[tokio::test]
async fn cancellation_takes_effect_after_the_current_listing() {
    let cancel = CancelHandle::new();
    let source = CancellingSource {
        cancel: cancel.clone(),
        body: std::fs::read_to_string(fixtures_dir().join("executive_suite.xml")).unwrap(),
    };
    let mut orchestrator = orchestrator(source, LocalTracker::in_memory()).with_cancel_handle(cancel);

    let report = orchestrator.run(CampaignMode::Full, &full_mode()).await;
    assert!(report.cancelled);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.configs.len(), 1);
    assert_eq!(report.discovered, 4);
    assert_eq!(report.created, 1);
    assert_eq!(report.leads[0].identity, COO);
}

struct EmptySource;

#[async_trait]
impl DiscoverySource for EmptySource {
    fn source_name(&self) -> &'static str {
        "empty"
    }

    async fn discover(&self, _config: &SearchConfig) -> Result<Vec<RawItem>, AdapterError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn cancellation_interrupts_the_request_delay() {
    let mut orchestrator = CampaignOrchestrator::new(
        Box::new(EmptySource),
        LeadStore::new(LocalTracker::in_memory(), StoreConfig::default()),
        ProfileCatalog::default_catalog(),
        OrchestratorConfig {
            request_delay: Duration::from_secs(3600),
            ..fast_config()
        },
    );
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.run(CampaignMode::Full, &full_mode()),
    )
    .await
    .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.configs.len(), 1);
}

/// Local tracker whose first `failures` creates are rate limited.
struct FlakyTracker {
    inner: LocalTracker,
    failures: AtomicUsize,
}

impl FlakyTracker {
    fn new(failures: usize) -> Self {
        Self {
            inner: LocalTracker::in_memory(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl TrackerBackend for FlakyTracker {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
        self.inner.query_since(since).await
    }

    async fn query_by_identity(&self, identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
        self.inner.query_by_identity(identity).await
    }

    async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
        self.inner.query_all().await
    }

    async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TrackerError::RateLimited);
        }
        self.inner.create(lead).await
    }

    async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError> {
        self.inner.patch(record_id, patch).await
    }
}

#[tokio::test]
async fn retryable_store_failures_are_retried_once() {
    let configs = &full_mode()[..1];

    let mut recovered = orchestrator(FixtureSource::new(fixtures_dir()), FlakyTracker::new(1));
    let report = recovered.run(CampaignMode::Executive, configs).await;
    assert_eq!(report.created, 2);
    assert!(report.failures.iter().all(|f| f.stage != FailureStage::Store));

    let mut exhausted = orchestrator(FixtureSource::new(fixtures_dir()), FlakyTracker::new(2));
    let report = exhausted.run(CampaignMode::Executive, configs).await;
    assert_eq!(report.state, RunState::Completed);
    let store_failures = report
        .failures
        .iter()
        .filter(|f| f.stage == FailureStage::Store)
        .collect::<Vec<_>>();
    assert_eq!(store_failures.len(), 1);
    assert_eq!(store_failures[0].identity.as_deref(), Some(COO));
    // The repeated COO item later in the feed creates the entry the first attempt could not.
    assert_eq!(report.created, 2);
    assert_eq!(report.merged, 0);

    let pending = store_failures[0].pending.as_ref().unwrap();
    assert_eq!(pending.listing.identity, COO);
    assert_eq!(pending.score.fit_tier, FitTier::High);
    let (saved, still_pending) =
        retry_pending_upserts(exhausted.store_mut(), fast_config().store_retry, &report).await;
    assert!(still_pending.is_empty());
    assert_eq!(saved.len(), 1);
    assert!(matches!(saved[0].disposition, UpsertDisposition::Merged { .. }));
}

#[tokio::test]
async fn unsaved_listings_survive_the_run_report() {
    let dir = tempdir().unwrap();
    let tracker = Arc::new(FlakyTracker::new(usize::MAX));
    let mut orchestrator = orchestrator(FixtureSource::new(fixtures_dir()), tracker.clone());
    let report = orchestrator.run(CampaignMode::Executive, &full_mode()[..1]).await;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.stored(), 0);
    assert!(report.leads.is_empty());
    let store_failures = report
        .failures
        .iter()
        .filter(|f| f.stage == FailureStage::Store)
        .count();
    assert!(store_failures > 0);
    assert_eq!(report.pending_upserts().count(), store_failures);
    assert!(report
        .pending_upserts()
        .any(|(config, pending)| config == "executive_suite" && pending.listing.identity == COO));

    write_run_reports(dir.path(), &report, None).await.unwrap();
    let recorded = read_run_report(dir.path(), &report.run_id.to_string()).await.unwrap();
    assert_eq!(recorded.pending_upserts().count(), store_failures);

    tracker.failures.store(0, Ordering::SeqCst);
    let (saved, still_pending) =
        retry_pending_upserts(orchestrator.store_mut(), fast_config().store_retry, &recorded).await;
    assert!(still_pending.is_empty());
    assert_eq!(saved.len(), store_failures);
    assert!(tracker.query_by_identity(COO).await.unwrap().is_some());
}

struct OfflineGenerator;

#[async_trait]
impl ProposalGenerator for OfflineGenerator {
    fn generator_name(&self) -> &'static str {
        "offline"
    }

    async fn generate(&self, _listing: &ListingRecord, _score: &FitScore) -> Result<String, ProposalError> {
        Err(ProposalError::MissingApiKey)
    }
}

#[tokio::test]
async fn proposals_degrade_without_failing_the_run() {
    let mut orchestrator = orchestrator(FixtureSource::new(fixtures_dir()), LocalTracker::in_memory())
        .with_proposals(Box::new(OfflineGenerator));
    let report = orchestrator.run(CampaignMode::Executive, &full_mode()[..1]).await;

    let drafted = report.leads.iter().filter(|l| l.proposal.is_some()).collect::<Vec<_>>();
    assert_eq!(report.proposals_drafted, drafted.len());
    assert!(drafted
        .iter()
        .all(|l| l.fit_tier == FitTier::High && l.disposition == UpsertDisposition::Created));

    let coo = drafted.iter().find(|l| l.identity == COO).unwrap();
    match coo.proposal.as_ref().unwrap() {
        ProposalOutcome::Degraded { fallback, reason } => {
            assert!(fallback.as_deref().unwrap().contains("Fractional COO needed"));
            assert!(reason.contains("no api key"));
        }
        other => panic!("expected degraded proposal, got {other:?}"),
    }
}

#[tokio::test]
async fn run_reports_are_written_per_run() {
    let dir = tempdir().unwrap();
    let mut orchestrator = orchestrator(FixtureSource::new(fixtures_dir()), LocalTracker::in_memory());
    let report = orchestrator.run(CampaignMode::Full, &full_mode()).await;
    let stats = orchestrator.store().stats().await.unwrap();

    let reports_dir = write_run_reports(dir.path(), &report, Some(&stats)).await.unwrap();
    assert_eq!(reports_dir, dir.path().join("reports").join(report.run_id.to_string()));

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(reports_dir.join(RUN_SUMMARY_FILE)).unwrap()).unwrap();
    assert_eq!(summary["run"]["created"], 5);
    assert_eq!(summary["run"]["mode"], "full");
    assert_eq!(summary["pipeline_stats"]["total"], 5);

    let brief = std::fs::read_to_string(reports_dir.join(DAILY_BRIEF_FILE)).unwrap();
    assert!(brief.contains("- New leads: 5"));
    assert!(brief.contains("revenue_operations (`revenue operations director`): failed"));
    assert!(brief.contains("[Fractional COO needed]"));

    let index = recent_runs_markdown(3, dir.path()).unwrap();
    assert!(index.contains(&report.run_id.to_string()));
    assert!(index.contains("- mode: full"));
}
