use std::path::PathBuf;

use async_trait::async_trait;
use flp_core::SearchConfig;
use flp_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::extract::{split_html_tiles, split_rss_items, RawItem};

pub const DEFAULT_FEED_URL: &str = "https://www.upwork.com/ab/feed/jobs/rss";

const FEED_ACCEPT: &str = "application/rss+xml, application/xml, text/xml;q=0.9, text/html;q=0.5";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid discovery url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// The `fetch` capability: run one search configuration, return its raw items.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn discover(&self, config: &SearchConfig) -> Result<Vec<RawItem>, AdapterError>;
}

/// Search URL for one configuration: query, newest first, first 50 results, optional filters.
pub fn build_search_url(base: &str, config: &SearchConfig) -> Result<Url, AdapterError> {
    let mut url = Url::parse(base).map_err(|e| AdapterError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("q", &config.query);
        query.append_pair("sort", "recency");
        query.append_pair("paging", "0;50");
        if let Some(min) = config.budget_min {
            query.append_pair("budget", &format!("[{min} TO *]"));
        }
        if let Some(job_type) = &config.job_type {
            query.append_pair("job_type", job_type);
        }
    }
    Ok(url)
}

/// Split a fetched body into raw items: RSS when it looks like a feed, result tiles otherwise.
pub fn split_discovery_body(body: &str) -> Vec<RawItem> {
    let head = body.chars().take(512).collect::<String>().to_ascii_lowercase();
    if head.contains("<rss") || head.contains("<feed") || body.contains("<item") {
        split_rss_items(body)
    } else {
        split_html_tiles(body)
    }
}

/// Live marketplace feed, fetched through the shared retrying HTTP client.
#[derive(Debug, Clone)]
pub struct FeedSource {
    http: HttpFetcher,
    base_url: String,
}

impl FeedSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DiscoverySource for FeedSource {
    fn source_name(&self) -> &'static str {
        "feed"
    }

    async fn discover(&self, config: &SearchConfig) -> Result<Vec<RawItem>, AdapterError> {
        let url = build_search_url(&self.base_url, config)?;
        let response = self
            .http
            .fetch_text(&config.name, url.as_str(), FEED_ACCEPT)
            .await?;
        let items = split_discovery_body(&response.body);
        info!(config = %config.name, items = items.len(), status = %response.status, "feed fetched");
        Ok(items)
    }
}

/// Offline discovery from captured pages: `<dir>/<config name>.xml` or `.html`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, config: &SearchConfig) -> [PathBuf; 2] {
        [
            self.dir.join(format!("{}.xml", config.name)),
            self.dir.join(format!("{}.html", config.name)),
        ]
    }
}

#[async_trait]
impl DiscoverySource for FixtureSource {
    fn source_name(&self) -> &'static str {
        "fixture"
    }

    async fn discover(&self, config: &SearchConfig) -> Result<Vec<RawItem>, AdapterError> {
        for path in self.candidates(config) {
            match tokio::fs::read_to_string(&path).await {
                Ok(body) => {
                    let items = split_discovery_body(&body);
                    debug!(path = %path.display(), items = items.len(), "fixture loaded");
                    return Ok(items);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(AdapterError::Fixture {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Err(AdapterError::Message(format!(
            "no fixture for search configuration {} in {}",
            config.name,
            self.dir.display()
        )))
    }
}
