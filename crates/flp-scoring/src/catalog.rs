use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use flp_core::IcpProfile;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("profile #{index} has an empty name")]
    EmptyName { index: usize },
    #[error("profile {0:?} appears more than once")]
    DuplicateName(String),
    #[error("profile {name:?} has invalid budget range ({min}, {max})")]
    InvalidBudgetRange { name: String, min: f64, max: f64 },
    #[error("parsing profile catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    profiles: Vec<IcpProfile>,
}

/// Display row for `profiles` listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub description: String,
    pub budget_range: String,
    pub ideal_duration: Vec<String>,
}

/// Ordered, validated ICP catalog. Order is the scoring tie-break and is never changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileCatalog {
    profiles: Vec<IcpProfile>,
}

fn lowercase_all(phrases: &mut [String]) {
    for phrase in phrases {
        *phrase = phrase.trim().to_lowercase();
    }
}

impl ProfileCatalog {
    pub fn new(mut profiles: Vec<IcpProfile>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for (index, profile) in profiles.iter_mut().enumerate() {
            profile.name = profile.name.trim().to_string();
            if profile.name.is_empty() {
                return Err(CatalogError::EmptyName { index });
            }
            if !seen.insert(profile.name.clone()) {
                return Err(CatalogError::DuplicateName(profile.name.clone()));
            }
            let (min, max) = profile.budget_range;
            if !(min.is_finite() && max.is_finite()) || min < 0.0 || min > max {
                return Err(CatalogError::InvalidBudgetRange {
                    name: profile.name.clone(),
                    min,
                    max,
                });
            }
            lowercase_all(&mut profile.keywords);
            lowercase_all(&mut profile.pain_points);
            lowercase_all(&mut profile.company_size_signals);
            lowercase_all(&mut profile.ideal_duration_signals);
        }
        Ok(Self { profiles })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        Self::new(file.profiles)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    /// `profiles.yaml` under the workspace root when present, the built-in catalog otherwise.
    pub fn load_or_default(workspace_root: &Path) -> anyhow::Result<Self> {
        let path = workspace_root.join("profiles.yaml");
        if path.exists() {
            let catalog = Self::load(&path)?;
            info!(path = %path.display(), profiles = catalog.len(), "loaded profile catalog");
            Ok(catalog)
        } else {
            Ok(Self::default_catalog())
        }
    }

    pub fn profiles(&self) -> &[IcpProfile] {
        &self.profiles
    }

    pub fn get(&self, name: &str) -> Option<&IcpProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn summary(&self) -> Vec<ProfileSummary> {
        self.profiles
            .iter()
            .map(|p| ProfileSummary {
                name: p.name.clone(),
                description: p.description.clone(),
                budget_range: format!("${}-{}/hr", p.budget_range.0, p.budget_range.1),
                ideal_duration: p.ideal_duration_signals.clone(),
            })
            .collect()
    }

    pub fn default_catalog() -> Self {
        Self {
            profiles: default_profiles(),
        }
    }
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::default_catalog()
    }
}

fn phrases(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn profile(
    name: &str,
    description: &str,
    keywords: &[&str],
    pain_points: &[&str],
    company_size_signals: &[&str],
    budget_range: (f64, f64),
    ideal_duration_signals: &[&str],
) -> IcpProfile {
    IcpProfile {
        name: name.to_string(),
        description: description.to_string(),
        keywords: phrases(keywords),
        pain_points: phrases(pain_points),
        company_size_signals: phrases(company_size_signals),
        budget_range,
        ideal_duration_signals: phrases(ideal_duration_signals),
    }
}

fn default_profiles() -> Vec<IcpProfile> {
    vec![
        profile(
            "scaling_startup",
            "20-50 person companies transitioning from founder-led chaos",
            &["startup", "scale", "growth", "systems", "processes", "operations", "founder"],
            &["scaling", "operations", "systems", "processes", "team building"],
            &["20-50", "small team", "growing team"],
            (75.0, 150.0),
            &["months", "ongoing", "long-term"],
        ),
        profile(
            "operations_overhaul",
            "Companies needing operational structure and efficiency",
            &["operations", "efficiency", "process improvement", "workflow", "automation"],
            &["inefficient", "manual processes", "chaos", "disorganized"],
            &["medium", "growing", "established"],
            (60.0, 120.0),
            &["weeks", "months"],
        ),
        profile(
            "team_leadership",
            "Leadership roles leveraging military experience",
            &["leadership", "team lead", "manager", "director", "military", "veteran"],
            &["team management", "leadership", "structure", "discipline"],
            &["any"],
            (80.0, 200.0),
            &["months", "ongoing", "permanent"],
        ),
        profile(
            "sales_operations",
            "Revenue operations roles built on enterprise sales experience",
            &[
                "sales operations",
                "revenue operations",
                "crm",
                "sales process",
                "revenue",
                "sales director",
                "cmo",
                "cro",
                "cso",
            ],
            &["sales efficiency", "process", "data", "pipeline", "forecasting", "revenue growth"],
            &["medium", "large", "enterprise", "scaling"],
            (75.0, 200.0),
            &["months", "ongoing"],
        ),
        profile(
            "revenue_leadership",
            "Fractional CMO/CRO/CSO roles combining operational discipline with sales expertise",
            &[
                "fractional cmo",
                "fractional cro",
                "fractional cso",
                "revenue operations",
                "sales transformation",
                "marketing operations",
            ],
            &[
                "revenue growth",
                "sales performance",
                "marketing efficiency",
                "lead generation",
                "conversion optimization",
            ],
            &["startup", "scaling", "medium"],
            (100.0, 250.0),
            &["months", "ongoing", "fractional"],
        ),
        profile(
            "strategic_consulting",
            "High-level strategic work: GTM, business plans, pitch decks",
            &[
                "go to market",
                "gtm strategy",
                "business plan",
                "pitch deck",
                "strategic planning",
                "market entry",
                "business strategy",
            ],
            &[
                "market entry",
                "strategic direction",
                "investor readiness",
                "growth planning",
                "competitive positioning",
            ],
            &["startup", "scaling", "established"],
            (100.0, 300.0),
            &["weeks", "months", "project-based"],
        ),
        profile(
            "crisis_management",
            "Companies in chaos needing military-style order",
            &["crisis", "urgent", "chaos", "fix", "stabilize", "emergency"],
            &["crisis", "urgent fix", "stabilization", "rapid improvement"],
            &["any"],
            (100.0, 250.0),
            &["weeks", "urgent"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_catalog_order_is_preserved() {
        let names = ProfileCatalog::default_catalog()
            .profiles()
            .iter()
            .map(|p| p.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "scaling_startup",
                "operations_overhaul",
                "team_leadership",
                "sales_operations",
                "revenue_leadership",
                "strategic_consulting",
                "crisis_management",
            ]
        );
    }

    #[test]
    fn default_catalog_passes_validation() {
        let catalog = ProfileCatalog::default_catalog();
        let revalidated = ProfileCatalog::new(catalog.profiles().to_vec()).unwrap();
        assert_eq!(revalidated, catalog);
    }

    #[test]
    fn yaml_catalog_is_normalized_and_validated() {
        let yaml = r#"
version: 1
profiles:
  - name: interim_ops
    description: Interim operations lead
    keywords: ["Interim COO", " Operations "]
    budget_range: [90, 180]
    ideal_duration_signals: [Months]
"#;
        let catalog = ProfileCatalog::from_yaml_str(yaml).unwrap();
        let profile = catalog.get("interim_ops").unwrap();
        assert_eq!(profile.keywords, vec!["interim coo", "operations"]);
        assert_eq!(profile.ideal_duration_signals, vec!["months"]);
        assert!(profile.pain_points.is_empty());

        let duplicate = r#"
profiles:
  - { name: a, budget_range: [1, 2] }
  - { name: a, budget_range: [1, 2] }
"#;
        assert!(matches!(
            ProfileCatalog::from_yaml_str(duplicate),
            Err(CatalogError::DuplicateName(_))
        ));

        let inverted = "profiles:\n  - { name: b, budget_range: [200, 100] }\n";
        assert!(matches!(
            ProfileCatalog::from_yaml_str(inverted),
            Err(CatalogError::InvalidBudgetRange { .. })
        ));
    }

    #[test]
    fn workspace_file_overrides_builtin_catalog() {
        let dir = tempdir().unwrap();
        assert_eq!(ProfileCatalog::load_or_default(dir.path()).unwrap().len(), 7);

        std::fs::write(
            dir.path().join("profiles.yaml"),
            "profiles:\n  - { name: only, budget_range: [50, 100] }\n",
        )
        .unwrap();
        let catalog = ProfileCatalog::load_or_default(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);

        std::fs::write(dir.path().join("profiles.yaml"), "profiles: [").unwrap();
        assert!(ProfileCatalog::load_or_default(dir.path()).is_err());
    }

    #[test]
    fn summary_formats_budget_range() {
        let summary = ProfileCatalog::default_catalog().summary();
        assert_eq!(summary[0].budget_range, "$75-150/hr");
        assert_eq!(summary[0].ideal_duration, vec!["months", "ongoing", "long-term"]);
    }
}
