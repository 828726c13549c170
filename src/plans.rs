//! Plan catalog: hosting plans, locations, and the plan recommender.
//!
//! The catalog is static data loaded once from a TOML file. Plans map a
//! marketing name to the RAM the order needs; locations map a storefront key
//! to the panel's location `short` code.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanCatalogError {
    #[error("Failed to read plan catalog: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse plan catalog: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid plan catalog: {0}")]
    ValidationError(String),
}

/// Stripe product identifiers for a plan, per environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StripeProducts {
    pub staging: Option<String>,
    pub production: Option<String>,
}

/// A purchasable hosting plan.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    pub name: String,
    pub title: String,
    pub ram_gb: i64,

    /// Display price per ISO currency code.
    #[serde(default)]
    pub display_price: BTreeMap<String, f64>,

    #[serde(default)]
    pub stripe: StripeProducts,

    #[serde(default)]
    pub bullets: Vec<String>,

    /// Whether the plan appears in the default storefront grid.
    #[serde(default)]
    pub show_default: bool,

    /// Modpack slugs this plan is sold under (empty for generic plans).
    #[serde(default)]
    pub modpacks: Vec<String>,

    /// Location keys the plan can be ordered in.
    #[serde(default)]
    pub locations: Vec<String>,

    #[serde(default)]
    pub ribbon: Option<String>,
}

impl Plan {
    /// RAM requirement in MiB, as submitted to the panel.
    pub fn ram_mb(&self) -> i64 {
        self.ram_gb * 1024
    }
}

/// A sellable region.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Location {
    pub key: String,
    pub title: String,
    pub flag: String,

    /// The panel location `short` code this region maps to.
    pub panel_location: String,
}

/// One weighted recommender answer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightedAnswer {
    pub label: String,
    pub weight: i64,
}

/// Score threshold mapping to a plan. Entries must be ordered by
/// min_score ascending; the recommender picks the last entry whose
/// min_score is <= the computed score.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoreThreshold {
    pub min_score: i64,
    pub plan: String,
}

/// Plan recommender inputs and thresholds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Recommender {
    #[serde(default)]
    pub players: Vec<WeightedAnswer>,
    #[serde(default)]
    pub versions: Vec<WeightedAnswer>,
    #[serde(default)]
    pub types: Vec<WeightedAnswer>,
    #[serde(default)]
    pub score_thresholds: Vec<ScoreThreshold>,
}

/// A modpack landing-page definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Modpack {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub heading: String,
    #[serde(default)]
    pub description: String,
    pub starting_plan: String,
}

/// The full plan catalog.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlanCatalog {
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub recommender: Recommender,
    #[serde(default)]
    pub modpacks: Vec<Modpack>,
}

impl PlanCatalog {
    /// Load the catalog from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, PlanCatalogError> {
        let content = std::fs::read_to_string(path)?;
        let catalog: Self = toml::from_str(&content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), PlanCatalogError> {
        for plan in &self.plans {
            if plan.ram_gb < 1 {
                return Err(PlanCatalogError::ValidationError(format!(
                    "plan '{}' must have at least 1 GB of RAM",
                    plan.name
                )));
            }
            for key in &plan.locations {
                if self.location(key).is_none() {
                    return Err(PlanCatalogError::ValidationError(format!(
                        "plan '{}' references unknown location '{}'",
                        plan.name, key
                    )));
                }
            }
        }

        let mut last_score = i64::MIN;
        for threshold in &self.recommender.score_thresholds {
            if threshold.min_score < last_score {
                return Err(PlanCatalogError::ValidationError(
                    "recommender.score_thresholds must be ordered by min_score".to_string(),
                ));
            }
            last_score = threshold.min_score;
            if self.plan(&threshold.plan).is_none() {
                return Err(PlanCatalogError::ValidationError(format!(
                    "score threshold references unknown plan '{}'",
                    threshold.plan
                )));
            }
        }

        Ok(())
    }

    /// Look up a plan by name.
    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.name == name)
    }

    /// Look up a location by storefront key.
    pub fn location(&self, key: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.key == key)
    }

    /// Plans sold in the given location.
    pub fn plans_for_location(&self, key: &str) -> Vec<&Plan> {
        self.plans
            .iter()
            .filter(|p| p.locations.iter().any(|l| l == key))
            .collect()
    }

    /// Smallest RAM requirement across plans sold in a location, used to
    /// decide whether the location is orderable at all.
    pub fn min_ram_mb_for_location(&self, key: &str) -> Option<i64> {
        self.plans_for_location(key)
            .iter()
            .map(|p| p.ram_mb())
            .min()
    }

    /// Map answer labels to a recommended plan name.
    ///
    /// Unknown labels contribute zero weight. The score is clamped to a
    /// minimum of 1 so the weakest answers land on the smallest plan, and
    /// the last threshold whose min_score is <= the score wins.
    pub fn recommend(&self, players: &str, version: &str, server_type: &str) -> Option<&str> {
        let score = Self::weight_for(&self.recommender.players, players)
            + Self::weight_for(&self.recommender.versions, version)
            + Self::weight_for(&self.recommender.types, server_type);

        self.recommend_for_score(score.max(1))
    }

    fn recommend_for_score(&self, score: i64) -> Option<&str> {
        self.recommender
            .score_thresholds
            .iter()
            .rev()
            .find(|t| t.min_score <= score)
            .map(|t| t.plan.as_str())
    }

    fn weight_for(answers: &[WeightedAnswer], label: &str) -> i64 {
        answers
            .iter()
            .find(|a| a.label == label)
            .map(|a| a.weight)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        let toml = r#"
[[plans]]
name = "parrot"
title = "Parrot"
ram_gb = 1
show_default = true
locations = ["de", "fi"]

[plans.display_price]
USD = 4.5
EUR = 4.0

[[plans]]
name = "rabbit"
title = "Rabbit"
ram_gb = 2
show_default = true
locations = ["de"]

[[plans]]
name = "guardian"
title = "Guardian"
ram_gb = 12
locations = ["de"]

[[locations]]
key = "de"
title = "Germany (EU)"
flag = "de"
panel_location = "eu.de"

[[locations]]
key = "fi"
title = "Finland (EU)"
flag = "fi"
panel_location = "eu.fi"

[recommender]
players = [
  { label = "1-5", weight = 0 },
  { label = "50+", weight = 5 },
]
versions = [
  { label = "1.17+", weight = 3 },
]
types = [
  { label = "Forge Modpack", weight = 3 },
]
score_thresholds = [
  { min_score = 1, plan = "parrot" },
  { min_score = 2, plan = "rabbit" },
  { min_score = 9, plan = "guardian" },
]
"#;
        let catalog: PlanCatalog = toml::from_str(toml).unwrap();
        catalog.validate().unwrap();
        catalog
    }

    #[test]
    fn test_ram_mb() {
        let catalog = catalog();
        assert_eq!(catalog.plan("rabbit").unwrap().ram_mb(), 2048);
        assert!(catalog.plan("nope").is_none());
    }

    #[test]
    fn test_recommend_picks_last_matching_threshold() {
        let catalog = catalog();
        // 0 + 3 + 0 = 3 -> last threshold with min_score <= 3 is "rabbit"
        assert_eq!(catalog.recommend("1-5", "1.17+", "unknown"), Some("rabbit"));
        // 5 + 3 + 3 = 11 -> exceeds 9, matches "guardian"
        assert_eq!(
            catalog.recommend("50+", "1.17+", "Forge Modpack"),
            Some("guardian")
        );
    }

    #[test]
    fn test_recommend_clamps_weakest_answers_to_smallest_plan() {
        let catalog = catalog();
        // score 0 is clamped to 1 and matches the first threshold
        assert_eq!(catalog.recommend("1-5", "none", "none"), Some("parrot"));
    }

    #[test]
    fn test_location_filtering() {
        let catalog = catalog();
        let fi_plans = catalog.plans_for_location("fi");
        assert_eq!(fi_plans.len(), 1);
        assert_eq!(fi_plans[0].name, "parrot");
        assert_eq!(catalog.min_ram_mb_for_location("de"), Some(1024));
        assert_eq!(catalog.min_ram_mb_for_location("us"), None);
    }

    #[test]
    fn test_validate_rejects_unknown_location() {
        let toml = r#"
[[plans]]
name = "parrot"
title = "Parrot"
ram_gb = 1
locations = ["mars"]
"#;
        let catalog: PlanCatalog = toml::from_str(toml).unwrap();
        assert!(catalog.validate().is_err());
    }
}
