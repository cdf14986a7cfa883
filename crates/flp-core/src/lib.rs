//! Core domain model for the freelance lead pipeline: listings, profiles, scores, statuses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "flp-core";

/// Upper bound on stored description length, in characters.
pub const DESCRIPTION_LIMIT: usize = 800;

/// Origin used to resolve relative posting links found in result tiles.
pub const MARKETPLACE_ORIGIN: &str = "https://www.upwork.com";

const TRACKING_PARAMS: &[&str] = &[
    "source",
    "ref",
    "referrer",
    "referrer_url_path",
    "frkey",
    "gclid",
    "fbclid",
    "_navtype",
    "_modalinfo",
    "pagetitle",
    "mc_cid",
    "mc_eid",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("posting link is empty")]
    Empty,
    #[error("posting link {link:?} is not a valid url: {reason}")]
    Invalid { link: String, reason: String },
    #[error("posting link {0:?} is not http(s)")]
    UnsupportedScheme(String),
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Normalize a posting link into the dedup key: absolute, no fragment, no tracking params.
pub fn canonical_identity(link: &str) -> Result<String, IdentityError> {
    let trimmed = link.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }
    let invalid = |reason: String| IdentityError::Invalid {
        link: trimmed.to_string(),
        reason,
    };
    let origin = Url::parse(MARKETPLACE_ORIGIN).map_err(|e| invalid(e.to_string()))?;
    let mut url = origin.join(trimmed).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(IdentityError::UnsupportedScheme(trimmed.to_string()));
    }

    url.set_fragment(None);
    let kept = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept.iter());
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Ok(url.to_string())
}

/// Marketplace posting id (`~01abc...`) embedded in a canonical identity, if any.
pub fn posting_id(identity: &str) -> Option<String> {
    let url = Url::parse(identity).ok()?;
    let segments = url.path_segments()?;
    segments
        .filter_map(|segment| segment.find('~').map(|at| &segment[at..]))
        .find(|id| id.len() > 1)
        .map(ToString::to_string)
}

/// Truncate on a char boundary; the flag reports whether anything was cut.
pub fn truncate_description(text: &str, limit: usize) -> (String, bool) {
    if text.chars().count() <= limit {
        return (text.to_string(), false);
    }
    let mut out = text.chars().take(limit).collect::<String>();
    out.push_str("...");
    (out, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Hourly,
    Fixed,
}

/// Normalized budget. Raw text survives only as [`Evidence`] on the listing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Budget {
    Hourly { min: f64, max: Option<f64> },
    Fixed { amount: f64 },
    #[default]
    Unspecified,
}

impl Budget {
    /// First numeric value: hourly minimum or fixed amount.
    pub fn first_amount(&self) -> Option<f64> {
        match self {
            Budget::Hourly { min, .. } => Some(*min),
            Budget::Fixed { amount } => Some(*amount),
            Budget::Unspecified => None,
        }
    }

    pub fn kind(&self) -> Option<BudgetKind> {
        match self {
            Budget::Hourly { .. } => Some(BudgetKind::Hourly),
            Budget::Fixed { .. } => Some(BudgetKind::Fixed),
            Budget::Unspecified => None,
        }
    }

    pub fn is_specified(&self) -> bool {
        !matches!(self, Budget::Unspecified)
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Budget::Hourly { min, max: Some(max) } => write!(f, "${min}-${max}/hr"),
            Budget::Hourly { min, max: None } => write!(f, "${min}/hr"),
            Budget::Fixed { amount } => write!(f, "${amount} fixed"),
            Budget::Unspecified => f.write_str("Not specified"),
        }
    }
}

/// Provenance pointer for a normalized value: which pattern/selector matched what text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub selector_or_pattern: String,
    pub snippet: String,
    pub extractor_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientSignal {
    pub rating: Option<f64>,
    pub spent: Option<String>,
    pub payment_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PostedTime {
    At(DateTime<Utc>),
    Raw(String),
    #[default]
    Unknown,
}

impl PostedTime {
    /// RSS `pubDate` (RFC 2822) or RFC 3339; anything else is kept verbatim.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return PostedTime::Unknown;
        }
        if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
            return PostedTime::At(ts.with_timezone(&Utc));
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return PostedTime::At(ts.with_timezone(&Utc));
        }
        PostedTime::Raw(text.to_string())
    }
}

/// Canonical job posting produced by the extractor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub identity: String,
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub description_truncated: bool,
    pub budget: Budget,
    pub budget_evidence: Option<Evidence>,
    pub skills: Vec<String>,
    pub posted_time: PostedTime,
    pub client: ClientSignal,
    pub source_campaign: String,
    pub discovered_at: DateTime<Utc>,
    pub extraction_failed: bool,
    pub extraction_notes: Vec<String>,
}

impl ListingRecord {
    pub fn empty(source_campaign: &str, discovered_at: DateTime<Utc>) -> Self {
        Self {
            identity: String::new(),
            external_id: None,
            title: String::new(),
            description: String::new(),
            description_truncated: false,
            budget: Budget::Unspecified,
            budget_evidence: None,
            skills: Vec::new(),
            posted_time: PostedTime::Unknown,
            client: ClientSignal::default(),
            source_campaign: source_campaign.to_string(),
            discovered_at,
            extraction_failed: false,
            extraction_notes: Vec::new(),
        }
    }

    /// Partial record for markup that could not be parsed at all.
    pub fn failed(source_campaign: &str, discovered_at: DateTime<Utc>, note: impl Into<String>) -> Self {
        let mut record = Self::empty(source_campaign, discovered_at);
        record.extraction_failed = true;
        record.extraction_notes.push(note.into());
        record
    }

    /// Lowercased `title + " " + description`, the text every profile is scored against.
    pub fn scoring_text(&self) -> String {
        format!("{} {}", self.title, self.description).to_lowercase()
    }

    pub fn is_storable(&self) -> bool {
        !self.extraction_failed && !self.identity.trim().is_empty()
    }
}

/// One entry of the ideal-client-profile catalog. Phrases are lowercase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcpProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub company_size_signals: Vec<String>,
    /// Hourly-rate-equivalent `(min, max)`.
    pub budget_range: (f64, f64),
    #[serde(default)]
    pub ideal_duration_signals: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FitTier {
    Low,
    Medium,
    High,
}

impl FitTier {
    pub const HIGH_THRESHOLD: f64 = 7.0;
    pub const MEDIUM_THRESHOLD: f64 = 5.0;

    pub fn from_score(raw_score: f64) -> Self {
        if raw_score >= Self::HIGH_THRESHOLD {
            FitTier::High
        } else if raw_score >= Self::MEDIUM_THRESHOLD {
            FitTier::Medium
        } else {
            FitTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FitTier::Low => "Low",
            FitTier::Medium => "Medium",
            FitTier::High => "High",
        }
    }
}

impl fmt::Display for FitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FitTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(FitTier::Low),
            "medium" => Ok(FitTier::Medium),
            "high" => Ok(FitTier::High),
            other => Err(format!("unknown fit tier {other:?}")),
        }
    }
}

/// Per-term contributions of a single profile's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    pub keywords: f64,
    pub pain_points: f64,
    pub company_size: f64,
    pub budget: f64,
    pub duration: f64,
    pub military: f64,
    pub leadership: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.keywords
            + self.pain_points
            + self.company_size
            + self.budget
            + self.duration
            + self.military
            + self.leadership
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileScore {
    pub profile: String,
    pub breakdown: ScoreBreakdown,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetFit {
    Excellent,
    Good,
    Acceptable,
    TooLow,
    Unclear,
    NotSpecified,
}

impl BudgetFit {
    pub fn label(&self) -> &'static str {
        match self {
            BudgetFit::Excellent => "Excellent budget fit",
            BudgetFit::Good => "Good budget fit",
            BudgetFit::Acceptable => "Acceptable budget",
            BudgetFit::TooLow => "Budget too low",
            BudgetFit::Unclear => "Budget unclear",
            BudgetFit::NotSpecified => "Budget not specified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationFit {
    LongTerm,
    MediumTerm,
    ShortTerm,
    Unclear,
    NotSpecified,
}

impl DurationFit {
    pub fn label(&self) -> &'static str {
        match self {
            DurationFit::LongTerm => "Ideal duration (long-term)",
            DurationFit::MediumTerm => "Good duration (medium-term)",
            DurationFit::ShortTerm => "Short-term (consider for high rate)",
            DurationFit::Unclear => "Duration unclear",
            DurationFit::NotSpecified => "Duration not specified",
        }
    }
}

/// Derived match of a listing against the profile catalog. Recomputed on every discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitScore {
    pub best_profile: Option<String>,
    pub raw_score: f64,
    pub fit_tier: FitTier,
    pub confidence: f64,
    pub extracted_pain_points: Vec<String>,
    pub profile_scores: Vec<ProfileScore>,
    pub budget_fit: BudgetFit,
    pub hourly_rate_match: bool,
    pub duration_fit: DurationFit,
    pub reasoning: String,
}

impl FitScore {
    /// Saturating `raw / 10`, capped at 1.0. Not a probability.
    pub fn confidence_for(raw_score: f64) -> f64 {
        (raw_score / 10.0).min(1.0)
    }
}

/// Persisted pipeline status vocabulary. String forms are stable across trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    Prospecting,
    Updated,
    #[serde(rename = "Proposal Submitted")]
    ProposalSubmitted,
    Interview,
    Won,
    Lost,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 6] = [
        PipelineStatus::Prospecting,
        PipelineStatus::Updated,
        PipelineStatus::ProposalSubmitted,
        PipelineStatus::Interview,
        PipelineStatus::Won,
        PipelineStatus::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Prospecting => "Prospecting",
            PipelineStatus::Updated => "Updated",
            PipelineStatus::ProposalSubmitted => "Proposal Submitted",
            PipelineStatus::Interview => "Interview",
            PipelineStatus::Won => "Won",
            PipelineStatus::Lost => "Lost",
        }
    }

    /// A human decision downstream of discovery; rediscovery must never overwrite it.
    pub fn is_sticky(&self) -> bool {
        !matches!(self, PipelineStatus::Prospecting | PipelineStatus::Updated)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        PipelineStatus::ALL
            .into_iter()
            .find(|status| status.as_str().to_ascii_lowercase() == normalized)
            .ok_or_else(|| format!("unknown pipeline status {s:?}"))
    }
}

/// One named search: a query string plus marketplace filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub budget_min: Option<u32>,
    #[serde(default)]
    pub job_type: Option<String>,
}
