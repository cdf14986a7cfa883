use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flp_core::{canonical_identity, FitScore, FitTier, ListingRecord, PipelineStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tracker::{LeadPatch, ScoreUpdate, TrackedLead, TrackerBackend, TrackerError};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How far back the identity cache is warmed at the start of a run.
    pub cache_lookback: ChronoDuration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_lookback: ChronoDuration::days(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {identity:?} cannot be stored: {reason}")]
    Unstorable { identity: String, reason: String },
    #[error("tracker write failed for {identity}: {source}")]
    Write {
        identity: String,
        #[source]
        source: TrackerError,
    },
    #[error("tracker query failed: {0}")]
    Query(#[from] TrackerError),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Write { source, .. } => source.is_retryable(),
            StoreError::Query(source) => source.is_retryable(),
            StoreError::Unstorable { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpsertDisposition {
    Created,
    Merged {
        score_improved: bool,
        status_changed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub record_id: String,
    pub identity: String,
    pub disposition: UpsertDisposition,
    /// The duplicate check failed and the listing was treated as new.
    pub duplicate_check_degraded: bool,
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self.disposition, UpsertDisposition::Created)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Updated,
    NotFound,
}

/// Merge of a rediscovered listing into an existing entry.
///
/// Provenance (`last_seen`, `campaign`) always follows the latest discovery. Score fields move
/// only on a strictly higher confidence. Status is touched only while the entry has none or is
/// still `Prospecting`.
pub fn merge_patch(
    existing: &TrackedLead,
    score: &FitScore,
    campaign: &str,
    now: DateTime<Utc>,
) -> (LeadPatch, UpsertDisposition) {
    let score_improved = score.confidence > existing.confidence;
    let mut patch = LeadPatch {
        last_seen: Some(now),
        campaign: Some(campaign.to_string()),
        ..Default::default()
    };
    if score_improved {
        patch.score = Some(ScoreUpdate {
            confidence: score.confidence,
            fit_tier: score.fit_tier,
            best_profile: score.best_profile.clone(),
        });
    }

    let next_status = match existing.status {
        None if score_improved => Some(PipelineStatus::Updated),
        None => Some(PipelineStatus::Prospecting),
        Some(PipelineStatus::Prospecting) if score_improved => Some(PipelineStatus::Updated),
        Some(_) => None,
    };
    let status_changed = next_status.is_some();
    if let Some(status) = next_status {
        patch.status = Some(status);
        patch.status_updated_at = Some(now);
    }

    (
        patch,
        UpsertDisposition::Merged {
            score_improved,
            status_changed,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total: usize,
    pub prospecting: usize,
    pub updated: usize,
    pub proposals_submitted: usize,
    pub interviews: usize,
    pub won: usize,
    pub lost: usize,
    pub high_fit: usize,
    pub proposal_rate: f64,
    pub interview_rate: f64,
    pub win_rate: f64,
}

fn percent_of(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}

impl PipelineStats {
    pub fn from_leads(leads: &[TrackedLead]) -> Self {
        let mut stats = PipelineStats {
            total: leads.len(),
            ..Default::default()
        };
        for lead in leads {
            match lead.status {
                Some(PipelineStatus::Prospecting) => stats.prospecting += 1,
                Some(PipelineStatus::Updated) => stats.updated += 1,
                Some(PipelineStatus::ProposalSubmitted) => stats.proposals_submitted += 1,
                Some(PipelineStatus::Interview) => stats.interviews += 1,
                Some(PipelineStatus::Won) => stats.won += 1,
                Some(PipelineStatus::Lost) => stats.lost += 1,
                None => {}
            }
            if lead.fit_tier == FitTier::High {
                stats.high_fit += 1;
            }
        }
        stats.proposal_rate = percent_of(stats.proposals_submitted, stats.total);
        stats.interview_rate = percent_of(stats.interviews, stats.proposals_submitted.max(1));
        stats.win_rate = percent_of(stats.won, stats.proposals_submitted.max(1));
        stats
    }
}

/// Deduplicating store over a tracker backend, keyed by canonical identity.
///
/// Assumes it is the only writer to the tracker while a run is in progress.
pub struct LeadStore {
    backend: Box<dyn TrackerBackend>,
    config: StoreConfig,
    cache: HashMap<String, TrackedLead>,
    warm_attempted: bool,
}

impl LeadStore {
    pub fn new(backend: impl TrackerBackend + 'static, config: StoreConfig) -> Self {
        Self::from_boxed(Box::new(backend), config)
    }

    pub fn from_boxed(backend: Box<dyn TrackerBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            cache: HashMap::new(),
            warm_attempted: false,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.warm_attempted = false;
    }

    /// Drop whatever the cache holds and rebuild it from recent tracker entries.
    pub async fn begin_run(&mut self, now: DateTime<Utc>) {
        self.invalidate();
        self.warm(now).await;
    }

    async fn warm(&mut self, now: DateTime<Utc>) {
        self.warm_attempted = true;
        let since = now
            .checked_sub_signed(self.config.cache_lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self.backend.query_since(since).await {
            Ok(leads) => {
                for lead in leads {
                    self.cache.insert(lead.identity.clone(), lead);
                }
                info!(
                    backend = self.backend.backend_name(),
                    cached = self.cache.len(),
                    "identity cache warmed"
                );
            }
            Err(err) => {
                warn!(error = %err, "could not warm identity cache; falling back to per-listing lookups");
            }
        }
    }

    /// Cache first; on a miss, one targeted query against the tracker.
    pub async fn find(&mut self, identity: &str) -> Result<Option<TrackedLead>, StoreError> {
        let identity = normalize(identity);
        if let Some(lead) = self.cache.get(&identity) {
            return Ok(Some(lead.clone()));
        }
        if !self.warm_attempted {
            self.warm(Utc::now()).await;
            if let Some(lead) = self.cache.get(&identity) {
                return Ok(Some(lead.clone()));
            }
        }
        let found = self.backend.query_by_identity(&identity).await?;
        if let Some(lead) = &found {
            self.cache.insert(identity, lead.clone());
        }
        Ok(found)
    }

    pub async fn upsert(
        &mut self,
        listing: &ListingRecord,
        score: &FitScore,
        campaign: &str,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        if !listing.is_storable() {
            let reason = if listing.extraction_failed {
                "extraction failed"
            } else {
                "missing identity"
            };
            return Err(StoreError::Unstorable {
                identity: listing.identity.clone(),
                reason: reason.to_string(),
            });
        }
        let identity = listing.identity.clone();

        let (existing, duplicate_check_degraded) = match self.find(&identity).await {
            Ok(existing) => (existing, false),
            Err(err) => {
                warn!(%identity, error = %err, "duplicate check failed; assuming no duplicate");
                (None, true)
            }
        };

        let Some(existing) = existing else {
            let mut lead = TrackedLead::new(listing, score, campaign, now);
            let record_id = self
                .backend
                .create(&lead)
                .await
                .map_err(|source| StoreError::Write {
                    identity: identity.clone(),
                    source,
                })?;
            debug!(%identity, %record_id, "created tracker entry");
            lead.record_id = record_id.clone();
            self.cache.insert(identity.clone(), lead);
            return Ok(UpsertOutcome {
                record_id,
                identity,
                disposition: UpsertDisposition::Created,
                duplicate_check_degraded,
            });
        };

        let (patch, disposition) = merge_patch(&existing, score, campaign, now);
        self.backend
            .patch(&existing.record_id, &patch)
            .await
            .map_err(|source| StoreError::Write {
                identity: identity.clone(),
                source,
            })?;
        debug!(%identity, record_id = %existing.record_id, ?disposition, "merged tracker entry");

        let mut merged = existing;
        patch.apply_to(&mut merged);
        let record_id = merged.record_id.clone();
        self.cache.insert(identity.clone(), merged);
        Ok(UpsertOutcome {
            record_id,
            identity,
            disposition,
            duplicate_check_degraded,
        })
    }

    /// Manual status change; this is the only path that may move a sticky status.
    pub async fn mark_status(
        &mut self,
        identity: &str,
        status: PipelineStatus,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError> {
        let patch = LeadPatch {
            status: Some(status),
            status_updated_at: Some(now),
            ..Default::default()
        };
        self.patch_existing(identity, patch).await
    }

    pub async fn record_proposal(
        &mut self,
        identity: &str,
        word_count: u32,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError> {
        let patch = LeadPatch {
            status: Some(PipelineStatus::ProposalSubmitted),
            status_updated_at: Some(now),
            proposal_date: Some(now),
            proposal_word_count: Some(word_count),
            ..Default::default()
        };
        self.patch_existing(identity, patch).await
    }

    async fn patch_existing(&mut self, identity: &str, patch: LeadPatch) -> Result<MarkOutcome, StoreError> {
        let identity = normalize(identity);
        let Some(mut lead) = self.find(&identity).await? else {
            return Ok(MarkOutcome::NotFound);
        };
        match self.backend.patch(&lead.record_id, &patch).await {
            Ok(()) => {}
            Err(TrackerError::NotFound(_)) => {
                self.cache.remove(&identity);
                return Ok(MarkOutcome::NotFound);
            }
            Err(source) => {
                return Err(StoreError::Write {
                    identity: identity.clone(),
                    source,
                })
            }
        }
        patch.apply_to(&mut lead);
        self.cache.insert(identity, lead);
        Ok(MarkOutcome::Updated)
    }

    pub async fn stats(&self) -> Result<PipelineStats, StoreError> {
        let leads = self.backend.query_all().await?;
        Ok(PipelineStats::from_leads(&leads))
    }

    pub async fn all_leads(&self) -> Result<Vec<TrackedLead>, StoreError> {
        Ok(self.backend.query_all().await?)
    }
}

/// Links typed by a user may still carry tracking params; anything unparseable is used verbatim.
fn normalize(identity: &str) -> String {
    canonical_identity(identity).unwrap_or_else(|_| identity.trim().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use flp_core::{BudgetFit, DurationFit};

    use super::*;
    use crate::tracker::LocalTracker;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    fn listing(link: &str, campaign: &str) -> ListingRecord {
        let mut record = ListingRecord::empty(campaign, ts(1));
        record.identity = canonical_identity(link).unwrap();
        record.title = "Fractional COO for scaling startup".into();
        record
    }

    fn fit(confidence: f64, profile: &str) -> FitScore {
        let raw_score = confidence * 10.0;
        FitScore {
            best_profile: Some(profile.to_string()),
            raw_score,
            fit_tier: FitTier::from_score(raw_score),
            confidence,
            extracted_pain_points: vec![],
            profile_scores: vec![],
            budget_fit: BudgetFit::NotSpecified,
            hourly_rate_match: false,
            duration_fit: DurationFit::NotSpecified,
            reasoning: String::new(),
        }
    }

    fn store(tracker: Arc<LocalTracker>) -> LeadStore {
        LeadStore::new(tracker, StoreConfig::default())
    }

    #[tokio::test]
    async fn oversized_lookback_warms_from_the_beginning() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let item = listing("https://www.upwork.com/jobs/~01a", "executive_suite");
        let score = fit(0.8, "team_leadership");
        store(tracker.clone())
            .upsert(&item, &score, "executive_suite", ts(1))
            .await
            .unwrap();

        let mut wide = LeadStore::new(
            tracker,
            StoreConfig {
                cache_lookback: ChronoDuration::MAX,
            },
        );
        wide.begin_run(ts(2)).await;
        let again = wide.upsert(&item, &score, "executive_suite", ts(2)).await.unwrap();
        assert!(!again.is_new());
    }

    #[tokio::test]
    async fn repeated_upsert_only_refreshes_last_seen() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let mut store = store(tracker.clone());
        let item = listing("https://www.upwork.com/jobs/~01a", "executive_suite");
        let score = fit(0.8, "team_leadership");

        let first = store.upsert(&item, &score, "executive_suite", ts(1)).await.unwrap();
        let before = tracker.query_all().await.unwrap();
        let second = store.upsert(&item, &score, "executive_suite", ts(2)).await.unwrap();
        let after = tracker.query_all().await.unwrap();

        assert!(first.is_new());
        assert_eq!(
            second.disposition,
            UpsertDisposition::Merged {
                score_improved: false,
                status_changed: false
            }
        );
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(after.len(), 1);
        let mut expected = before[0].clone();
        expected.last_seen = ts(2);
        assert_eq!(after[0], expected);
    }

    #[tokio::test]
    async fn stored_confidence_is_the_running_maximum() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let mut store = store(tracker.clone());
        let item = listing("https://www.upwork.com/jobs/~01a", "quick");

        for (day, confidence) in [(1, 0.4), (2, 0.9), (3, 0.6), (4, 0.9)] {
            store
                .upsert(&item, &fit(confidence, "scaling_startup"), "quick", ts(day))
                .await
                .unwrap();
        }

        let leads = tracker.query_all().await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].confidence, 0.9);
        assert_eq!(leads[0].fit_tier, FitTier::High);
        assert_eq!(leads[0].status, Some(PipelineStatus::Updated));
    }

    #[tokio::test]
    async fn manual_status_survives_rediscovery() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let mut store = store(tracker.clone());
        let item = listing("https://www.upwork.com/jobs/~01a", "quick");
        store.upsert(&item, &fit(0.3, "scaling_startup"), "quick", ts(1)).await.unwrap();

        let outcome = store
            .mark_status("https://www.upwork.com/jobs/~01a?utm_source=mail", PipelineStatus::Won, ts(2))
            .await
            .unwrap();
        assert_eq!(outcome, MarkOutcome::Updated);

        store.upsert(&item, &fit(1.0, "team_leadership"), "full", ts(3)).await.unwrap();
        let lead = tracker.query_all().await.unwrap().remove(0);
        assert_eq!(lead.status, Some(PipelineStatus::Won));
        assert_eq!(lead.confidence, 1.0);
        assert_eq!(lead.campaign, "full");
    }

    #[tokio::test]
    async fn tracking_params_and_campaigns_merge_into_one_entry() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let mut store = store(tracker.clone());
        let a = listing(
            "https://www.upwork.com/jobs/COO_~01a/?source=rss&utm_campaign=exec",
            "executive_suite",
        );
        let b = listing("https://www.upwork.com/jobs/COO_~01a?referrer_url_path=%2Fnx", "strategic_consulting");

        store.upsert(&a, &fit(0.7, "team_leadership"), "executive_suite", ts(1)).await.unwrap();
        store
            .upsert(&b, &fit(0.5, "strategic_consulting"), "strategic_consulting", ts(2))
            .await
            .unwrap();

        let leads = tracker.query_all().await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].campaign, "strategic_consulting");
        assert_eq!(leads[0].confidence, 0.7);
        assert_eq!(leads[0].best_profile.as_deref(), Some("team_leadership"));
    }

    #[tokio::test]
    async fn mark_status_and_proposal_on_unknown_identity_report_not_found() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let mut store = store(tracker);
        let missing = "https://www.upwork.com/jobs/~missing";
        assert_eq!(
            store.mark_status(missing, PipelineStatus::Lost, ts(1)).await.unwrap(),
            MarkOutcome::NotFound
        );
        assert_eq!(
            store.record_proposal(missing, 250, ts(1)).await.unwrap(),
            MarkOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn record_proposal_feeds_pipeline_stats() {
        let tracker = Arc::new(LocalTracker::in_memory());
        let mut store = store(tracker);
        for (n, confidence) in [(1, 0.9), (2, 0.5), (3, 0.2), (4, 0.75)] {
            let item = listing(&format!("https://www.upwork.com/jobs/~0{n}"), "quick");
            store.upsert(&item, &fit(confidence, "scaling_startup"), "quick", ts(1)).await.unwrap();
        }
        store
            .record_proposal("https://www.upwork.com/jobs/~01", 312, ts(2))
            .await
            .unwrap();
        store
            .record_proposal("https://www.upwork.com/jobs/~04", 280, ts(2))
            .await
            .unwrap();
        store
            .mark_status("https://www.upwork.com/jobs/~04", PipelineStatus::Interview, ts(3))
            .await
            .unwrap();

        let lead = store.find("https://www.upwork.com/jobs/~01").await.unwrap().unwrap();
        assert_eq!(lead.proposal_word_count, Some(312));
        assert_eq!(lead.proposal_date, Some(ts(2)));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.prospecting, 2);
        assert_eq!(stats.proposals_submitted, 1);
        assert_eq!(stats.interviews, 1);
        assert_eq!(stats.high_fit, 2);
        assert_eq!(stats.proposal_rate, 25.0);
        assert_eq!(stats.interview_rate, 100.0);
        assert_eq!(stats.win_rate, 0.0);
    }

    #[tokio::test]
    async fn extraction_failures_are_not_stored() {
        let mut store = store(Arc::new(LocalTracker::in_memory()));
        let failed = ListingRecord::failed("quick", ts(1), "unparseable item");
        let err = store
            .upsert(&failed, &fit(0.9, "scaling_startup"), "quick", ts(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unstorable { .. }));
        assert!(!err.is_retryable());
    }

    /// Tracker whose queries always fail; writes delegate to an in-memory tracker.
    struct BlindTracker {
        inner: LocalTracker,
        query_calls: AtomicUsize,
    }

    #[async_trait]
    impl TrackerBackend for BlindTracker {
        fn backend_name(&self) -> &'static str {
            "blind"
        }

        async fn query_since(&self, _since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::Connectivity("offline".into()))
        }

        async fn query_by_identity(&self, _identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::RateLimited)
        }

        async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
            self.inner.query_all().await
        }

        async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError> {
            self.inner.create(lead).await
        }

        async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError> {
            self.inner.patch(record_id, patch).await
        }
    }

    #[tokio::test]
    async fn failed_duplicate_check_falls_back_to_create() {
        let tracker = Arc::new(BlindTracker {
            inner: LocalTracker::in_memory(),
            query_calls: AtomicUsize::new(0),
        });
        let mut store = LeadStore::new(tracker.clone(), StoreConfig::default());
        let item = listing("https://www.upwork.com/jobs/~01a", "quick");

        let outcome = store.upsert(&item, &fit(0.6, "scaling_startup"), "quick", ts(1)).await.unwrap();
        assert!(outcome.is_new());
        assert!(outcome.duplicate_check_degraded);
        assert_eq!(tracker.query_calls.load(Ordering::SeqCst), 2);

        let again = store.upsert(&item, &fit(0.6, "scaling_startup"), "quick", ts(2)).await.unwrap();
        assert!(!again.is_new());
        assert!(!again.duplicate_check_degraded);
    }

    /// Tracker that refuses every write.
    struct ReadOnlyTracker;

    #[async_trait]
    impl TrackerBackend for ReadOnlyTracker {
        fn backend_name(&self) -> &'static str {
            "read-only"
        }

        async fn query_since(&self, _since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
            Ok(vec![])
        }

        async fn query_by_identity(&self, _identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
            Ok(None)
        }

        async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
            Ok(vec![])
        }

        async fn create(&self, _lead: &TrackedLead) -> Result<String, TrackerError> {
            Err(TrackerError::Http {
                status: 503,
                body: "maintenance".into(),
            })
        }

        async fn patch(&self, record_id: &str, _patch: &LeadPatch) -> Result<(), TrackerError> {
            Err(TrackerError::NotFound(record_id.to_string()))
        }
    }

    #[tokio::test]
    async fn write_failures_surface_as_retryable_errors() {
        let mut store = LeadStore::new(ReadOnlyTracker, StoreConfig::default());
        let item = listing("https://www.upwork.com/jobs/~01a", "quick");
        let err = store
            .upsert(&item, &fit(0.6, "scaling_startup"), "quick", ts(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.cached_len(), 0);
    }

    #[test]
    fn merge_keeps_higher_existing_score() {
        let existing = TrackedLead::new(
            &listing("https://www.upwork.com/jobs/~01a", "quick"),
            &fit(0.9, "team_leadership"),
            "quick",
            ts(1),
        );
        let (patch, disposition) = merge_patch(&existing, &fit(0.4, "scaling_startup"), "full", ts(2));
        assert!(patch.score.is_none());
        assert!(patch.status.is_none());
        assert_eq!(patch.campaign.as_deref(), Some("full"));
        assert_eq!(
            disposition,
            UpsertDisposition::Merged {
                score_improved: false,
                status_changed: false
            }
        );
    }
}
