//! Ideal-client-profile catalog and the keyword-weighted profile scorer.

mod catalog;
mod scorer;

pub use catalog::{CatalogError, ProfileCatalog, ProfileSummary};
pub use scorer::{
    budget_fit, duration_fit, hourly_rate_match, score, score_profile, LEADERSHIP_TERMS,
    MILITARY_TERMS, MIN_HOURLY_RATE,
};

pub const CRATE_NAME: &str = "flp-scoring";

impl ProfileCatalog {
    /// Score against this catalog snapshot.
    pub fn score(&self, listing: &flp_core::ListingRecord) -> flp_core::FitScore {
        score(listing, self.profiles())
    }
}
