use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flp_core::{FitScore, FitTier, ListingRecord, PipelineStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Persisted view of a lead, as the tracker sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedLead {
    pub record_id: String,
    pub identity: String,
    pub title: String,
    pub budget_text: String,
    pub campaign: String,
    pub confidence: f64,
    pub fit_tier: FitTier,
    pub best_profile: Option<String>,
    pub status: Option<PipelineStatus>,
    pub date_added: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub status_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub proposal_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub proposal_word_count: Option<u32>,
}

impl TrackedLead {
    /// Fresh entry for a first discovery; `record_id` is assigned by the backend.
    pub fn new(listing: &ListingRecord, score: &FitScore, campaign: &str, now: DateTime<Utc>) -> Self {
        Self {
            record_id: String::new(),
            identity: listing.identity.clone(),
            title: listing.title.chars().take(100).collect(),
            budget_text: listing.budget.to_string(),
            campaign: campaign.to_string(),
            confidence: score.confidence,
            fit_tier: score.fit_tier,
            best_profile: score.best_profile.clone(),
            status: Some(PipelineStatus::Prospecting),
            date_added: now,
            last_seen: now,
            status_updated_at: None,
            proposal_date: None,
            proposal_word_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub confidence: f64,
    pub fit_tier: FitTier,
    pub best_profile: Option<String>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeadPatch {
    pub last_seen: Option<DateTime<Utc>>,
    pub campaign: Option<String>,
    pub score: Option<ScoreUpdate>,
    pub status: Option<PipelineStatus>,
    pub status_updated_at: Option<DateTime<Utc>>,
    pub proposal_date: Option<DateTime<Utc>>,
    pub proposal_word_count: Option<u32>,
}

impl LeadPatch {
    pub fn apply_to(&self, lead: &mut TrackedLead) {
        if let Some(ts) = self.last_seen {
            lead.last_seen = ts;
        }
        if let Some(campaign) = &self.campaign {
            lead.campaign = campaign.clone();
        }
        if let Some(score) = &self.score {
            lead.confidence = score.confidence;
            lead.fit_tier = score.fit_tier;
            lead.best_profile = score.best_profile.clone();
        }
        if let Some(status) = self.status {
            lead.status = Some(status);
        }
        if let Some(ts) = self.status_updated_at {
            lead.status_updated_at = Some(ts);
        }
        if let Some(ts) = self.proposal_date {
            lead.proposal_date = Some(ts);
        }
        if let Some(count) = self.proposal_word_count {
            lead.proposal_word_count = Some(count);
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker unreachable: {0}")]
    Connectivity(String),
    #[error("tracker rejected credentials (http {status})")]
    Auth { status: u16 },
    #[error("tracker rate limited")]
    RateLimited,
    #[error("tracker returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("tracker record {0} not found")]
    NotFound(String),
    #[error("malformed tracker payload: {0}")]
    Decode(String),
    #[error("tracker storage: {0:#}")]
    Storage(anyhow::Error),
}

impl TrackerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackerError::Connectivity(_) | TrackerError::RateLimited => true,
            TrackerError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Record store addressable by identity: create, patch, query.
#[async_trait]
pub trait TrackerBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Entries added at or after `since`; used to warm the identity cache.
    async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError>;

    async fn query_by_identity(&self, identity: &str) -> Result<Option<TrackedLead>, TrackerError>;

    async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError>;

    /// Returns the backend-assigned record id.
    async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError>;

    async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError>;
}

#[async_trait]
impl<T: TrackerBackend + ?Sized> TrackerBackend for Arc<T> {
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
        (**self).query_since(since).await
    }

    async fn query_by_identity(&self, identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
        (**self).query_by_identity(identity).await
    }

    async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
        (**self).query_all().await
    }

    async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError> {
        (**self).create(lead).await
    }

    async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError> {
        (**self).patch(record_id, patch).await
    }
}

/// Tracker kept in memory and, when opened from a path, mirrored to a JSON file.
#[derive(Debug)]
pub struct LocalTracker {
    path: Option<PathBuf>,
    rows: Mutex<BTreeMap<String, TrackedLead>>,
}

impl LocalTracker {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut rows = BTreeMap::new();
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking tracker file {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading tracker file {}", path.display()))?;
            let leads: Vec<TrackedLead> = serde_json::from_str(&text)
                .with_context(|| format!("parsing tracker file {}", path.display()))?;
            for lead in leads {
                rows.insert(lead.record_id.clone(), lead);
            }
        }
        Ok(Self {
            path: Some(path),
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whole-file rewrite via temp file + rename so a crash never leaves a torn tracker.
    async fn persist(&self, rows: &BTreeMap<String, TrackedLead>) -> Result<(), TrackerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_rows_atomically(path, rows)
            .await
            .map_err(TrackerError::Storage)
    }
}

async fn write_rows_atomically(path: &Path, rows: &BTreeMap<String, TrackedLead>) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating tracker directory {}", parent.display()))?;

    let leads = rows.values().collect::<Vec<_>>();
    let bytes = serde_json::to_vec_pretty(&leads).context("serializing tracker rows")?;
    let temp_path = parent.join(format!(".{}.tracker.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp tracker file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp tracker file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp tracker file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming tracker {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[async_trait]
impl TrackerBackend for LocalTracker {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|lead| lead.date_added >= since)
            .cloned()
            .collect())
    }

    async fn query_by_identity(&self, identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
        let rows = self.rows.lock().await;
        Ok(rows.values().find(|lead| lead.identity == identity).cloned())
    }

    async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
        let rows = self.rows.lock().await;
        Ok(rows.values().cloned().collect())
    }

    async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError> {
        let mut rows = self.rows.lock().await;
        let record_id = Uuid::new_v4().to_string();
        let mut stored = lead.clone();
        stored.record_id = record_id.clone();
        rows.insert(record_id.clone(), stored);
        if let Err(err) = self.persist(&rows).await {
            rows.remove(&record_id);
            return Err(err);
        }
        Ok(record_id)
    }

    async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError> {
        let mut rows = self.rows.lock().await;
        let Some(lead) = rows.get_mut(record_id) else {
            return Err(TrackerError::NotFound(record_id.to_string()));
        };
        let previous = lead.clone();
        patch.apply_to(lead);
        if let Err(err) = self.persist(&rows).await {
            rows.insert(record_id.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }
}
