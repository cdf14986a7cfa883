//! Listing extraction from raw feed/page markup, plus the discovery sources that produce that markup.

mod discovery;
mod extract;

pub use discovery::{
    build_search_url, split_discovery_body, AdapterError, DiscoverySource, FeedSource,
    FixtureSource, DEFAULT_FEED_URL,
};
pub use extract::{
    clean_description, extract_budget, extract_client_signal, extract_listing,
    extract_pain_points, extract_skills, html_to_text, split_html_tiles, split_rss_items,
    RawItem, EXTRACTOR_VERSION, PAIN_POINT_CATALOG,
};

pub const CRATE_NAME: &str = "flp-adapters";
