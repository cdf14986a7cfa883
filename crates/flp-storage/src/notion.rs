use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flp_core::{FitTier, PipelineStatus};
use reqwest::{Response, StatusCode};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::http::{classify_reqwest_error, RetryDisposition};
use crate::tracker::{LeadPatch, TrackedLead, TrackerBackend, TrackerError};

const PROP_TITLE: &str = "Job Title";
const PROP_URL: &str = "Job URL";
const PROP_BUDGET: &str = "Budget";
const PROP_CAMPAIGN: &str = "Campaign";
const PROP_DATE_ADDED: &str = "Date Added";
const PROP_LAST_SEEN: &str = "Last Seen";
const PROP_STATUS: &str = "Status";
const PROP_STATUS_UPDATED: &str = "Status Updated";
const PROP_CONFIDENCE: &str = "Confidence";
const PROP_FIT_LEVEL: &str = "Fit Level";
const PROP_INDUSTRY_MATCH: &str = "Industry Match";
const PROP_PROPOSAL_DATE: &str = "Proposal Date";
const PROP_PROPOSAL_WORDS: &str = "Proposal Word Count";

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
    pub api_base: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl NotionConfig {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            database_id: database_id.into(),
            api_base: "https://api.notion.com/v1".to_string(),
            api_version: "2022-06-28".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Tracker backed by a Notion database; one page per lead, keyed by the `Job URL` property.
#[derive(Debug, Clone)]
pub struct NotionTracker {
    client: reqwest::Client,
    config: NotionConfig,
}

impl NotionTracker {
    pub fn new(config: NotionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building notion client: {e}"))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<JsonValue, TrackerError> {
        let response = request
            .bearer_auth(&self.config.token)
            .header("Notion-Version", &self.config.api_version)
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response).await?;
        response
            .json::<JsonValue>()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))
    }

    async fn query(&self, filter: Option<JsonValue>, limit: Option<u32>) -> Result<Vec<TrackedLead>, TrackerError> {
        let mut leads = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = Map::new();
            body.insert("page_size".into(), json!(limit.unwrap_or(PAGE_SIZE).min(PAGE_SIZE)));
            if let Some(filter) = &filter {
                body.insert("filter".into(), filter.clone());
            }
            if let Some(cursor) = &cursor {
                body.insert("start_cursor".into(), json!(cursor));
            }

            let path = format!("databases/{}/query", self.config.database_id);
            let page = self
                .send(self.client.post(self.url(&path)).json(&JsonValue::Object(body)))
                .await?;

            for result in page.get("results").and_then(JsonValue::as_array).into_iter().flatten() {
                match page_to_lead(result) {
                    Some(lead) => leads.push(lead),
                    None => debug!("skipping notion page without a job url"),
                }
            }

            let reached_limit = limit.is_some_and(|l| leads.len() >= l as usize);
            let next = page
                .get("next_cursor")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            let has_more = page.get("has_more").and_then(JsonValue::as_bool).unwrap_or(false);
            match next {
                Some(next) if has_more && !reached_limit => cursor = Some(next),
                _ => break,
            }
        }
        Ok(leads)
    }
}

fn request_error(err: reqwest::Error) -> TrackerError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => TrackerError::Connectivity(err.to_string()),
        RetryDisposition::NonRetryable => TrackerError::Decode(err.to_string()),
    }
}

async fn check_status(response: Response) -> Result<Response, TrackerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TrackerError::Auth {
            status: status.as_u16(),
        },
        StatusCode::TOO_MANY_REQUESTS => TrackerError::RateLimited,
        StatusCode::NOT_FOUND => TrackerError::NotFound(body),
        _ => TrackerError::Http {
            status: status.as_u16(),
            body,
        },
    })
}

fn percent(confidence: f64) -> f64 {
    (confidence * 1000.0).round() / 10.0
}

fn rich_text(content: &str) -> JsonValue {
    json!({ "rich_text": [{ "text": { "content": content } }] })
}

fn select(name: &str) -> JsonValue {
    json!({ "select": { "name": name } })
}

fn date(ts: DateTime<Utc>) -> JsonValue {
    json!({ "date": { "start": ts.to_rfc3339() } })
}

fn lead_properties(lead: &TrackedLead) -> JsonValue {
    let mut props = Map::new();
    props.insert(
        PROP_TITLE.into(),
        json!({ "title": [{ "text": { "content": lead.title } }] }),
    );
    props.insert(PROP_URL.into(), json!({ "url": lead.identity }));
    props.insert(PROP_BUDGET.into(), rich_text(&lead.budget_text));
    props.insert(PROP_CAMPAIGN.into(), select(&lead.campaign));
    props.insert(PROP_DATE_ADDED.into(), date(lead.date_added));
    props.insert(PROP_LAST_SEEN.into(), date(lead.last_seen));
    if let Some(status) = lead.status {
        props.insert(PROP_STATUS.into(), select(status.as_str()));
    }
    props.insert(PROP_CONFIDENCE.into(), json!({ "number": percent(lead.confidence) }));
    props.insert(PROP_FIT_LEVEL.into(), select(lead.fit_tier.as_str()));
    let industry = lead.best_profile.as_deref().unwrap_or("No strong match");
    props.insert(
        PROP_INDUSTRY_MATCH.into(),
        rich_text(&industry.chars().take(2000).collect::<String>()),
    );
    JsonValue::Object(props)
}

fn patch_properties(patch: &LeadPatch) -> JsonValue {
    let mut props = Map::new();
    if let Some(ts) = patch.last_seen {
        props.insert(PROP_LAST_SEEN.into(), date(ts));
    }
    if let Some(campaign) = &patch.campaign {
        props.insert(PROP_CAMPAIGN.into(), select(campaign));
    }
    if let Some(score) = &patch.score {
        props.insert(PROP_CONFIDENCE.into(), json!({ "number": percent(score.confidence) }));
        props.insert(PROP_FIT_LEVEL.into(), select(score.fit_tier.as_str()));
        let industry = score.best_profile.as_deref().unwrap_or("No strong match");
        props.insert(PROP_INDUSTRY_MATCH.into(), rich_text(industry));
    }
    if let Some(status) = patch.status {
        props.insert(PROP_STATUS.into(), select(status.as_str()));
    }
    if let Some(ts) = patch.status_updated_at {
        props.insert(PROP_STATUS_UPDATED.into(), date(ts));
    }
    if let Some(ts) = patch.proposal_date {
        props.insert(PROP_PROPOSAL_DATE.into(), date(ts));
    }
    if let Some(count) = patch.proposal_word_count {
        props.insert(PROP_PROPOSAL_WORDS.into(), json!({ "number": count }));
    }
    JsonValue::Object(props)
}

fn prop<'a>(page: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    page.get("properties")?.get(name)
}

fn prop_text(page: &JsonValue, name: &str) -> Option<String> {
    let value = prop(page, name)?;
    let kind = value.get("type").and_then(JsonValue::as_str).unwrap_or("rich_text");
    let parts = value.get(kind)?.as_array()?;
    let text = parts
        .iter()
        .filter_map(|part| {
            part.get("plain_text")
                .or_else(|| part.get("text").and_then(|t| t.get("content")))
                .and_then(JsonValue::as_str)
        })
        .collect::<String>();
    Some(text)
}

fn prop_select(page: &JsonValue, name: &str) -> Option<String> {
    prop(page, name)?
        .get("select")?
        .get("name")?
        .as_str()
        .map(ToString::to_string)
}

fn prop_number(page: &JsonValue, name: &str) -> Option<f64> {
    prop(page, name)?.get("number")?.as_f64()
}

fn prop_date(page: &JsonValue, name: &str) -> Option<DateTime<Utc>> {
    let start = prop(page, name)?.get("date")?.get("start")?.as_str()?;
    DateTime::parse_from_rfc3339(start)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn page_to_lead(page: &JsonValue) -> Option<TrackedLead> {
    let record_id = page.get("id")?.as_str()?.to_string();
    let identity = prop(page, PROP_URL)?.get("url")?.as_str()?.to_string();
    let created = page
        .get("created_time")
        .and_then(JsonValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let date_added = prop_date(page, PROP_DATE_ADDED).unwrap_or(created);
    Some(TrackedLead {
        record_id,
        identity,
        title: prop_text(page, PROP_TITLE).unwrap_or_default(),
        budget_text: prop_text(page, PROP_BUDGET).unwrap_or_default(),
        campaign: prop_select(page, PROP_CAMPAIGN).unwrap_or_default(),
        confidence: prop_number(page, PROP_CONFIDENCE).map(|p| p / 100.0).unwrap_or(0.0),
        fit_tier: prop_select(page, PROP_FIT_LEVEL)
            .and_then(|s| s.parse::<FitTier>().ok())
            .unwrap_or(FitTier::Low),
        best_profile: prop_text(page, PROP_INDUSTRY_MATCH)
            .filter(|s| !s.is_empty() && s != "No strong match"),
        status: prop_select(page, PROP_STATUS).and_then(|s| s.parse::<PipelineStatus>().ok()),
        date_added,
        last_seen: prop_date(page, PROP_LAST_SEEN).unwrap_or(date_added),
        status_updated_at: prop_date(page, PROP_STATUS_UPDATED),
        proposal_date: prop_date(page, PROP_PROPOSAL_DATE),
        proposal_word_count: prop_number(page, PROP_PROPOSAL_WORDS).map(|n| n as u32),
    })
}

#[async_trait]
impl TrackerBackend for NotionTracker {
    fn backend_name(&self) -> &'static str {
        "notion"
    }

    async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedLead>, TrackerError> {
        let filter = json!({
            "property": PROP_DATE_ADDED,
            "date": { "on_or_after": since.to_rfc3339() }
        });
        self.query(Some(filter), None).await
    }

    async fn query_by_identity(&self, identity: &str) -> Result<Option<TrackedLead>, TrackerError> {
        let filter = json!({
            "property": PROP_URL,
            "url": { "equals": identity }
        });
        Ok(self.query(Some(filter), Some(1)).await?.into_iter().next())
    }

    async fn query_all(&self) -> Result<Vec<TrackedLead>, TrackerError> {
        self.query(None, None).await
    }

    async fn create(&self, lead: &TrackedLead) -> Result<String, TrackerError> {
        let body = json!({
            "parent": { "database_id": self.config.database_id },
            "properties": lead_properties(lead),
        });
        let page = self.send(self.client.post(self.url("pages")).json(&body)).await?;
        page.get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| TrackerError::Decode("created page has no id".into()))
    }

    async fn patch(&self, record_id: &str, patch: &LeadPatch) -> Result<(), TrackerError> {
        let body = json!({ "properties": patch_properties(patch) });
        let path = format!("pages/{record_id}");
        self.send(self.client.patch(self.url(&path)).json(&body)).await?;
        Ok(())
    }
}
