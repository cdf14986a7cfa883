//! Proposal drafting for scored listings.
//!
//! Two generators sit behind [`ProposalGenerator`]: a profile-keyed template generator that
//! never fails, and a hosted-model generator that calls a messages API. Callers go through
//! [`generate_or_degrade`], which turns any generation failure into a degraded outcome instead
//! of an error.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use flp_core::{FitScore, ListingRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "flp-proposals";

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "claude-3-sonnet-20240229";
pub const API_VERSION: &str = "2023-06-01";

/// Characters of the listing description passed into the prompt.
const PROMPT_DESCRIPTION_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("no api key configured for hosted proposal generation")]
    MissingApiKey,
    #[error("proposal request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("proposal api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("proposal api response had no text content")]
    EmptyResponse,
}

/// The `generate` capability: listing plus score in, proposal prose out.
#[async_trait]
pub trait ProposalGenerator: Send + Sync {
    fn generator_name(&self) -> &'static str;

    async fn generate(&self, listing: &ListingRecord, score: &FitScore) -> Result<String, ProposalError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Generated {
        text: String,
        generator: String,
    },
    /// Primary generation failed. `fallback` is template text, or `None` when unavailable.
    Degraded {
        fallback: Option<String>,
        reason: String,
    },
}

impl ProposalOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            ProposalOutcome::Generated { text, .. } => Some(text.as_str()),
            ProposalOutcome::Degraded { fallback, .. } => fallback.as_deref(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.text().map(word_count).unwrap_or(0)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ProposalOutcome::Degraded { .. })
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Run `primary`; on failure fall back to `fallback` if given. Never returns an error.
pub async fn generate_or_degrade(
    primary: &dyn ProposalGenerator,
    fallback: Option<&dyn ProposalGenerator>,
    listing: &ListingRecord,
    score: &FitScore,
) -> ProposalOutcome {
    match primary.generate(listing, score).await {
        Ok(text) if !text.trim().is_empty() => ProposalOutcome::Generated {
            text,
            generator: primary.generator_name().to_string(),
        },
        Ok(_) => degrade(fallback, listing, score, ProposalError::EmptyResponse.to_string()).await,
        Err(err) => {
            warn!(
                generator = primary.generator_name(),
                identity = %listing.identity,
                error = %err,
                "proposal generation failed"
            );
            degrade(fallback, listing, score, err.to_string()).await
        }
    }
}

async fn degrade(
    fallback: Option<&dyn ProposalGenerator>,
    listing: &ListingRecord,
    score: &FitScore,
    reason: String,
) -> ProposalOutcome {
    let fallback = match fallback {
        Some(generator) => generator.generate(listing, score).await.ok(),
        None => None,
    };
    ProposalOutcome::Degraded { fallback, reason }
}

/// Profile-keyed templates. Unknown or missing profiles get the general template.
#[derive(Debug, Clone, Default)]
pub struct TemplateProposalGenerator;

impl TemplateProposalGenerator {
    pub fn render(&self, listing: &ListingRecord, score: &FitScore) -> String {
        let title = if listing.title.trim().is_empty() {
            "this opportunity"
        } else {
            listing.title.trim()
        };
        let focus = match score.extracted_pain_points.first() {
            Some(pain) => format!("The {pain} you describe is the part I would tackle first."),
            None => "I would start by mapping where execution is stalling today.".to_string(),
        };
        let body = match score.best_profile.as_deref() {
            Some("scaling_startup") => format!(
                "You are scaling past founder-led operations and need systems that keep pace with growth.\n\n\
                 For {title} I would run a short diagnostic of bottlenecks, put decision rights and accountability \
                 in place, and build the operating cadence that lets the team grow without the founder in every loop.\n\n\
                 {focus}"
            ),
            Some("operations_overhaul") => format!(
                "Your {title} posting reads like an operation that has outgrown its processes.\n\n\
                 I step into manual, disorganized workflows and turn them into documented, measurable systems: \
                 rapid diagnosis first, then automation where it pays, then the metrics to keep it honest.\n\n\
                 {focus}"
            ),
            Some("team_leadership") => format!(
                "You need leadership that shows up in results, not another generic coaching engagement.\n\n\
                 For {title} I would work directly with your leaders on structure, accountability and delegation, \
                 while putting the performance rhythms in place that hold the team to it.\n\n\
                 {focus}"
            ),
            Some("sales_operations") | Some("revenue_leadership") => format!(
                "You have revenue foundations and now need predictable, data-driven growth.\n\n\
                 For {title} I would assess pipeline efficiency and conversion bottlenecks, tighten the sales process \
                 and CRM discipline, and build forecasting you can actually plan against.\n\n\
                 {focus}"
            ),
            Some("strategic_consulting") => format!(
                "You need strategic clarity that turns into decisions, not a slide deck that sits in a drawer.\n\n\
                 For {title} I would map the competitive landscape, sharpen positioning, and lay out a roadmap with \
                 milestones, owners and the metrics that tell you it is working.\n\n\
                 {focus}"
            ),
            Some("crisis_management") => format!(
                "Your {title} situation is where fast, calm stabilization matters most.\n\n\
                 My approach: identify the critical failure points within days, stabilize them immediately, and \
                 build the accountability structure that stops them coming back.\n\n\
                 {focus}"
            ),
            _ => format!(
                "Your {title} posting lines up with my background in operational excellence and business transformation.\n\n\
                 I build scalable operating systems, lead teams through change, and keep the focus on measurable outcomes.\n\n\
                 {focus}"
            ),
        };
        format!("{body}\n\nWould you be open to a short call to discuss the specifics?")
    }
}

#[async_trait]
impl ProposalGenerator for TemplateProposalGenerator {
    fn generator_name(&self) -> &'static str {
        "template"
    }

    async fn generate(&self, listing: &ListingRecord, score: &FitScore) -> Result<String, ProposalError> {
        Ok(self.render(listing, score))
    }
}

#[derive(Debug, Clone)]
pub struct ProposalConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
        }
    }
}

impl ProposalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .or_else(|_| std::env::var("CLAUDE_API_KEY"))
                .ok()
                .filter(|key| !key.trim().is_empty()),
            model: std::env::var("FLP_PROPOSAL_MODEL").unwrap_or(defaults.model),
            ..defaults
        }
    }
}

/// Hosted-model generator over the messages API.
#[derive(Debug, Clone)]
pub struct AnthropicProposalGenerator {
    client: reqwest::Client,
    config: ProposalConfig,
}

impl AnthropicProposalGenerator {
    pub fn new(config: ProposalConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building proposal api client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ProposalGenerator for AnthropicProposalGenerator {
    fn generator_name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, listing: &ListingRecord, score: &FitScore) -> Result<String, ProposalError> {
        let api_key = self.config.api_key.as_deref().ok_or(ProposalError::MissingApiKey)?;
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{ "role": "user", "content": build_prompt(listing, score) }],
        });
        let url = format!("{}/messages", self.config.api_base.trim_end_matches('/'));
        debug!(%url, model = %self.config.model, identity = %listing.identity, "requesting proposal");

        let response = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProposalError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let payload: JsonValue = response.json().await?;
        message_text(&payload).ok_or(ProposalError::EmptyResponse)
    }
}

/// Concatenated `text` blocks of a messages API response.
pub fn message_text(payload: &JsonValue) -> Option<String> {
    let text = payload
        .get("content")?
        .as_array()?
        .iter()
        .filter(|block| block.get("type").and_then(JsonValue::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(JsonValue::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub fn build_prompt(listing: &ListingRecord, score: &FitScore) -> String {
    let description = listing
        .description
        .chars()
        .take(PROMPT_DESCRIPTION_CHARS)
        .collect::<String>();
    let pain_points = if score.extracted_pain_points.is_empty() {
        "none identified".to_string()
    } else {
        score.extracted_pain_points.join(", ")
    };
    let profile = score.best_profile.as_deref().unwrap_or("general");
    format!(
        "Write a freelance proposal for this executive-level opportunity.\n\n\
         JOB DETAILS:\n\
         Title: {title}\n\
         Description: {description}\n\
         Budget: {budget}\n\n\
         FIT ANALYSIS:\n\
         Profile match: {profile}\n\
         Pain points: {pain_points}\n\
         Fit level: {tier} (confidence {confidence:.0}%)\n\
         Reasoning: {reasoning}\n\n\
         REQUIREMENTS:\n\
         - 120-150 words, no greeting, open with the value to this client\n\
         - one specific insight about their {profile} challenge\n\
         - three or four concrete deliverables\n\
         - a single call to action at the end\n\
         - no buzzwords, no overselling\n",
        title = listing.title,
        budget = listing.budget,
        tier = score.fit_tier,
        confidence = score.confidence * 100.0,
        reasoning = score.reasoning,
    )
}
