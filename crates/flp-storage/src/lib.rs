//! Tracker persistence, deduplicating lead store, and HTTP fetch utilities.

mod http;
mod notion;
mod postgres;
mod store;
mod tracker;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use notion::{NotionConfig, NotionTracker};
pub use postgres::PgTracker;
pub use store::{
    merge_patch, LeadStore, MarkOutcome, PipelineStats, StoreConfig, StoreError,
    UpsertDisposition, UpsertOutcome,
};
pub use tracker::{LeadPatch, LocalTracker, ScoreUpdate, TrackedLead, TrackerBackend, TrackerError};

pub const CRATE_NAME: &str = "flp-storage";
