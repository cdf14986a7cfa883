use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use flp_core::SearchConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignMode {
    Full,
    Executive,
    Strategic,
    Coaching,
    Quick,
}

impl CampaignMode {
    pub const ALL: [CampaignMode; 5] = [
        CampaignMode::Full,
        CampaignMode::Executive,
        CampaignMode::Strategic,
        CampaignMode::Coaching,
        CampaignMode::Quick,
    ];

    /// Mode used when an unknown name is requested.
    pub const DEFAULT: CampaignMode = CampaignMode::Quick;

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignMode::Full => "full",
            CampaignMode::Executive => "executive",
            CampaignMode::Strategic => "strategic",
            CampaignMode::Coaching => "coaching",
            CampaignMode::Quick => "quick",
        }
    }

    /// Lenient parse for the CLI/config surface: unknown names fall back to [`Self::DEFAULT`].
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(mode = name, fallback = Self::DEFAULT.as_str(), "unknown campaign mode");
            Self::DEFAULT
        })
    }
}

impl fmt::Display for CampaignMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        CampaignMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == name)
            .ok_or_else(|| format!("unknown campaign mode {s:?}"))
    }
}

#[derive(Debug, Deserialize)]
struct CampaignsFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    modes: BTreeMap<String, Vec<SearchConfig>>,
}

/// Mode to ordered search configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignRegistry {
    modes: BTreeMap<CampaignMode, Vec<SearchConfig>>,
}

fn search(name: &str, query: &str, budget_min: u32) -> SearchConfig {
    SearchConfig {
        name: name.to_string(),
        query: query.to_string(),
        budget_min: Some(budget_min),
        job_type: None,
    }
}

impl CampaignRegistry {
    pub fn default_registry() -> Self {
        let coaching = search("coaching_mentoring", "executive coaching OR business mentor", 50);
        let modes = BTreeMap::from([
            (
                CampaignMode::Full,
                vec![
                    search("executive_suite", "fractional COO OR interim COO", 80),
                    search("strategic_consulting", "business strategy consultant", 60),
                    search("revenue_operations", "revenue operations director", 70),
                    coaching.clone(),
                ],
            ),
            (
                CampaignMode::Executive,
                vec![search(
                    "executive_suite",
                    "fractional COO OR interim CEO OR fractional CEO",
                    100,
                )],
            ),
            (
                CampaignMode::Strategic,
                vec![search(
                    "strategic_consulting",
                    "business strategy OR strategic consulting",
                    60,
                )],
            ),
            (CampaignMode::Coaching, vec![coaching]),
            (
                CampaignMode::Quick,
                vec![search("high_value", "fractional OR interim", 80)],
            ),
        ]);
        Self { modes }
    }

    /// Modes named in the YAML replace the built-in configurations for that mode only.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CampaignsFile = serde_yaml::from_str(yaml).context("parsing campaigns")?;
        let mut registry = Self::default_registry();
        for (name, configs) in file.modes {
            let mode: CampaignMode = name.parse().map_err(anyhow::Error::msg)?;
            if let Some(config) = configs.iter().find(|c| c.name.trim().is_empty() || c.query.trim().is_empty()) {
                bail!("campaign mode {mode} has a search configuration without name or query: {config:?}");
            }
            registry.modes.insert(mode, configs);
        }
        Ok(registry)
    }

    /// `campaigns.yaml` under the workspace root when present, the built-in registry otherwise.
    pub fn load_or_default(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("campaigns.yaml");
        if !path.exists() {
            return Ok(Self::default_registry());
        }
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let registry =
            Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "loaded campaign registry");
        Ok(registry)
    }

    pub fn configs(&self, mode: CampaignMode) -> &[SearchConfig] {
        self.modes.get(&mode).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resolve a mode name, falling back to the default mode for unknown names.
    pub fn resolve(&self, name: &str) -> (CampaignMode, &[SearchConfig]) {
        let mode = CampaignMode::parse_or_default(name);
        (mode, self.configs(mode))
    }
}

impl Default for CampaignRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(configs: &[SearchConfig]) -> Vec<&str> {
        configs.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn full_mode_runs_every_campaign_in_order() {
        let registry = CampaignRegistry::default_registry();
        assert_eq!(
            names(registry.configs(CampaignMode::Full)),
            vec![
                "executive_suite",
                "strategic_consulting",
                "revenue_operations",
                "coaching_mentoring"
            ]
        );
        assert_eq!(registry.configs(CampaignMode::Executive)[0].budget_min, Some(100));
    }

    #[test]
    fn unknown_mode_falls_back_to_quick() {
        let registry = CampaignRegistry::default_registry();
        let (mode, configs) = registry.resolve("everything");
        assert_eq!(mode, CampaignMode::Quick);
        assert_eq!(names(configs), vec!["high_value"]);
        assert_eq!(registry.resolve(" Coaching ").0, CampaignMode::Coaching);
    }

    #[test]
    fn yaml_overrides_only_named_modes() {
        let yaml = r#"
version: 1
modes:
  quick:
    - name: interim_only
      query: interim COO
      budget_min: 120
      job_type: hourly
"#;
        let registry = CampaignRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(names(registry.configs(CampaignMode::Quick)), vec!["interim_only"]);
        assert_eq!(
            registry.configs(CampaignMode::Quick)[0].job_type.as_deref(),
            Some("hourly")
        );
        assert_eq!(registry.configs(CampaignMode::Full).len(), 4);

        assert!(CampaignRegistry::from_yaml_str("modes:\n  weekly: []\n").is_err());
        assert!(CampaignRegistry::from_yaml_str("modes:\n  quick:\n    - { name: x, query: ' ' }\n").is_err());
    }

    #[test]
    fn workspace_file_is_optional() {
        let dir = tempdir().unwrap();
        assert_eq!(
            CampaignRegistry::load_or_default(dir.path()).unwrap(),
            CampaignRegistry::default_registry()
        );
        std::fs::write(dir.path().join("campaigns.yaml"), "modes: [").unwrap();
        assert!(CampaignRegistry::load_or_default(dir.path()).is_err());
    }
}
