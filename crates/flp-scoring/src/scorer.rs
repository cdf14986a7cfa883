use flp_adapters::extract_pain_points;
use flp_core::{
    Budget, BudgetFit, DurationFit, FitScore, FitTier, IcpProfile, ListingRecord, ProfileScore,
    ScoreBreakdown,
};

pub const KEYWORD_WEIGHT: f64 = 1.5;
pub const PAIN_POINT_WEIGHT: f64 = 2.0;
pub const COMPANY_SIZE_WEIGHT: f64 = 1.0;
pub const BUDGET_IN_RANGE_BONUS: f64 = 2.0;
pub const BUDGET_ABOVE_MIN_BONUS: f64 = 1.0;
pub const DURATION_BONUS: f64 = 1.0;
pub const MILITARY_BONUS: f64 = 3.0;
pub const LEADERSHIP_BONUS: f64 = 1.0;

/// Hourly floor for `hourly_rate_match`.
pub const MIN_HOURLY_RATE: f64 = 50.0;

pub const MILITARY_TERMS: &[&str] = &["military", "veteran"];
pub const LEADERSHIP_TERMS: &[&str] = &["lead", "manager", "director", "head of", "senior"];

const LONG_TERM_TERMS: &[&str] = &["ongoing", "long-term", "permanent", "months"];
const MEDIUM_TERM_TERMS: &[&str] = &["weeks", "month", "3-6 months"];
const SHORT_TERM_TERMS: &[&str] = &["urgent", "asap", "quick", "days"];

fn count_present(phrases: &[String], text: &str) -> usize {
    phrases.iter().filter(|p| text.contains(p.as_str())).count()
}

fn any_present<S: AsRef<str>>(phrases: &[S], text: &str) -> bool {
    phrases.iter().any(|p| text.contains(p.as_ref()))
}

/// Weighted term counts of one profile against lowercased listing text.
///
/// Fixed-price amounts are compared against the hourly range as-is, with no unit conversion.
pub fn score_profile(profile: &IcpProfile, text: &str, budget_amount: Option<f64>) -> ScoreBreakdown {
    let budget = match budget_amount {
        Some(amount) if amount >= profile.budget_range.0 && amount <= profile.budget_range.1 => {
            BUDGET_IN_RANGE_BONUS
        }
        Some(amount) if amount >= profile.budget_range.0 => BUDGET_ABOVE_MIN_BONUS,
        _ => 0.0,
    };
    ScoreBreakdown {
        keywords: KEYWORD_WEIGHT * count_present(&profile.keywords, text) as f64,
        pain_points: PAIN_POINT_WEIGHT * count_present(&profile.pain_points, text) as f64,
        company_size: COMPANY_SIZE_WEIGHT * count_present(&profile.company_size_signals, text) as f64,
        budget,
        duration: if any_present(profile.ideal_duration_signals.as_slice(), text) {
            DURATION_BONUS
        } else {
            0.0
        },
        military: if any_present(MILITARY_TERMS, text) {
            MILITARY_BONUS
        } else {
            0.0
        },
        leadership: if any_present(LEADERSHIP_TERMS, text) {
            LEADERSHIP_BONUS
        } else {
            0.0
        },
    }
}

pub fn budget_fit(listing: &ListingRecord) -> BudgetFit {
    match listing.budget.first_amount() {
        Some(amount) if amount >= 100.0 => BudgetFit::Excellent,
        Some(amount) if amount >= 60.0 => BudgetFit::Good,
        Some(amount) if amount >= 30.0 => BudgetFit::Acceptable,
        Some(_) => BudgetFit::TooLow,
        None if listing.budget_evidence.is_some() => BudgetFit::Unclear,
        None => BudgetFit::NotSpecified,
    }
}

pub fn hourly_rate_match(budget: &Budget) -> bool {
    matches!(budget, Budget::Hourly { min, .. } if *min >= MIN_HOURLY_RATE)
}

pub fn duration_fit(description: &str) -> DurationFit {
    if description.trim().is_empty() {
        return DurationFit::NotSpecified;
    }
    let text = description.to_lowercase();
    if any_present(LONG_TERM_TERMS, &text) {
        DurationFit::LongTerm
    } else if any_present(MEDIUM_TERM_TERMS, &text) {
        DurationFit::MediumTerm
    } else if any_present(SHORT_TERM_TERMS, &text) {
        DurationFit::ShortTerm
    } else {
        DurationFit::Unclear
    }
}

fn reasoning(best: Option<&IcpProfile>, raw_score: f64, text: &str) -> String {
    let Some(profile) = best else {
        return "No strong ICP match found. Consider if fits general consulting skills.".to_string();
    };
    let mut out = format!("Best match: {} ({}). ", profile.name, profile.description);
    out.push_str(match FitTier::from_score(raw_score) {
        FitTier::High => "Strong alignment with expertise and ICP. High priority for application.",
        FitTier::Medium => "Good fit with some relevant elements. Worth investigating further.",
        FitTier::Low => "Limited fit. Consider only if other factors are compelling.",
    });
    if any_present(MILITARY_TERMS, text) {
        out.push_str(" Military/veteran background explicitly valued.");
    }
    if any_present(&["scaling", "growth", "operations"], text) {
        out.push_str(" Clear operational challenges that match this experience.");
    }
    out
}

/// Score a listing against every profile, in catalog order.
///
/// The winner is the first profile with the strictly greatest positive score; ties keep the
/// earlier profile. Pure: the same listing and catalog always produce the same result.
pub fn score(listing: &ListingRecord, profiles: &[IcpProfile]) -> FitScore {
    let text = listing.scoring_text();
    let budget_amount = listing.budget.first_amount();

    let mut best: Option<&IcpProfile> = None;
    let mut best_score = 0.0;
    let mut profile_scores = Vec::with_capacity(profiles.len());

    for profile in profiles {
        let breakdown = score_profile(profile, &text, budget_amount);
        let total = breakdown.total();
        if total > best_score {
            best_score = total;
            best = Some(profile);
        }
        profile_scores.push(ProfileScore {
            profile: profile.name.clone(),
            breakdown,
            total,
        });
    }

    FitScore {
        best_profile: best.map(|p| p.name.clone()),
        raw_score: best_score,
        fit_tier: FitTier::from_score(best_score),
        confidence: FitScore::confidence_for(best_score),
        extracted_pain_points: extract_pain_points(&listing.description),
        profile_scores,
        budget_fit: budget_fit(listing),
        hourly_rate_match: hourly_rate_match(&listing.budget),
        duration_fit: duration_fit(&listing.description),
        reasoning: reasoning(best, best_score, &text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProfileCatalog;
    use chrono::{TimeZone, Utc};
    use flp_core::Evidence;

    fn listing(title: &str, description: &str, budget: Budget) -> ListingRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        let mut record = ListingRecord::empty("executive_suite", at);
        record.identity = "https://www.upwork.com/jobs/~01a".into();
        record.title = title.into();
        record.description = description.into();
        record.budget = budget;
        record
    }

    fn coo_listing() -> ListingRecord {
        listing(
            "Fractional COO needed",
            "military veteran leadership background valued, $120/hr, ongoing",
            Budget::Hourly { min: 120.0, max: None },
        )
    }

    fn total_for(score: &FitScore, profile: &str) -> f64 {
        score
            .profile_scores
            .iter()
            .find(|s| s.profile == profile)
            .map(|s| s.total)
            .unwrap()
    }

    #[test]
    fn fractional_coo_scenario_selects_team_leadership() {
        let catalog = ProfileCatalog::default_catalog();
        let score = score(&coo_listing(), catalog.profiles());

        assert_eq!(score.best_profile.as_deref(), Some("team_leadership"));
        assert_eq!(score.raw_score, 13.5);
        assert_eq!(score.fit_tier, FitTier::High);
        assert_eq!(score.confidence, 1.0);
        assert_eq!(total_for(&score, "scaling_startup"), 7.0);
        assert_eq!(total_for(&score, "operations_overhaul"), 6.0);
        assert_eq!(score.extracted_pain_points, vec!["team issues"]);
        assert!(score.hourly_rate_match);
        assert_eq!(score.budget_fit, BudgetFit::Excellent);
        assert_eq!(score.duration_fit, DurationFit::LongTerm);
        assert!(score.reasoning.starts_with("Best match: team_leadership"));
        assert!(score.reasoning.contains("Military/veteran background explicitly valued."));

        let team = &score.profile_scores[2].breakdown;
        assert_eq!(team.keywords, 4.5);
        assert_eq!(team.pain_points, 2.0);
        assert_eq!(team.budget, 2.0);
        assert_eq!(team.military, 3.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let catalog = ProfileCatalog::default_catalog();
        let listing = coo_listing();
        assert_eq!(score(&listing, catalog.profiles()), score(&listing, catalog.profiles()));
    }

    #[test]
    fn ties_go_to_the_earlier_profile() {
        let mut twin = ProfileCatalog::default_catalog().profiles()[0].clone();
        twin.name = "twin".into();
        let mut profiles = vec![twin];
        profiles.extend(ProfileCatalog::default_catalog().profiles().iter().cloned());

        let listing = listing("Startup founder needs operations help", "", Budget::Unspecified);
        let result = score(&listing, &profiles);
        assert_eq!(result.best_profile.as_deref(), Some("twin"));
        assert_eq!(total_for(&result, "twin"), total_for(&result, "scaling_startup"));
    }

    #[test]
    fn empty_catalog_and_zero_scores_have_no_match() {
        let listing = listing("Bookkeeping", "reconcile invoices", Budget::Unspecified);
        let empty = score(&listing, &[]);
        assert_eq!(empty.best_profile, None);
        assert_eq!(empty.fit_tier, FitTier::Low);
        assert_eq!(empty.raw_score, 0.0);
        assert!(empty.profile_scores.is_empty());

        let catalog = ProfileCatalog::default_catalog();
        let none = score(&listing, catalog.profiles());
        assert_eq!(none.best_profile, None);
        assert_eq!(none.confidence, 0.0);
        assert!(none.reasoning.starts_with("No strong ICP match"));
        assert_eq!(none.budget_fit, BudgetFit::NotSpecified);
    }

    #[test]
    fn fixed_budget_is_compared_without_conversion() {
        let catalog = ProfileCatalog::default_catalog();
        let profile = &catalog.profiles()[0];
        let breakdown = score_profile(profile, "anything", Budget::Fixed { amount: 5000.0 }.first_amount());
        assert_eq!(breakdown.budget, BUDGET_ABOVE_MIN_BONUS);
        let breakdown = score_profile(profile, "anything", Some(100.0));
        assert_eq!(breakdown.budget, BUDGET_IN_RANGE_BONUS);
        let breakdown = score_profile(profile, "anything", Some(40.0));
        assert_eq!(breakdown.budget, 0.0);
    }

    #[test]
    fn budget_and_duration_classification() {
        let mut marker_only = listing("Ops", "", Budget::Unspecified);
        marker_only.budget_evidence = Some(Evidence {
            selector_or_pattern: "budget/hourly_marker".into(),
            snippet: "Hourly".into(),
            extractor_version: "test".into(),
        });
        assert_eq!(budget_fit(&marker_only), BudgetFit::Unclear);
        assert_eq!(
            budget_fit(&listing("Ops", "", Budget::Hourly { min: 25.0, max: None })),
            BudgetFit::TooLow
        );
        assert!(!hourly_rate_match(&Budget::Fixed { amount: 900.0 }));
        assert!(!hourly_rate_match(&Budget::Hourly { min: 45.0, max: Some(80.0) }));

        assert_eq!(duration_fit("a few weeks of work"), DurationFit::MediumTerm);
        assert_eq!(duration_fit("need this ASAP"), DurationFit::ShortTerm);
        assert_eq!(duration_fit("details on call"), DurationFit::Unclear);
        assert_eq!(duration_fit(""), DurationFit::NotSpecified);
    }
}
