// Configuration module for the advisor
// Handles TOML parsing, defaults and validation of AdvisorConfig

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::classifier::{BottleneckWeightTable, DEFAULT_NEGLIGIBLE_THRESHOLD};
use crate::core::estimator::{default_heuristic_curves, HeuristicCurve};
use crate::core::ranker::{default_catalog, PriorityThresholds, TransformationTemplate};
use crate::error::{AdvisorError, Result};

/// How speedup estimates are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    /// Learned model required; a missing artifact is a configuration error
    Learned,
    /// Heuristic curves only
    Heuristic,
    /// Learned model when an artifact loads, heuristic otherwise
    #[default]
    Auto,
}

/// Immutable configuration passed into the advisor at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default)]
    pub bottleneck_weight_table: BottleneckWeightTable,
    #[serde(default = "default_catalog")]
    pub transformation_catalog: Vec<TransformationTemplate>,
    #[serde(default = "default_negligible_threshold")]
    pub negligible_threshold: f64,
    #[serde(default)]
    pub priority_thresholds: PriorityThresholds,
    #[serde(default)]
    pub model_strategy: ModelStrategy,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_model_timeout")]
    pub model_timeout_seconds: f64,
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub max_recommendations: Option<usize>,
    #[serde(default = "default_heuristic_curves")]
    pub heuristic_curves: Vec<HeuristicCurve>,
}

// Default functions for serde
fn default_negligible_threshold() -> f64 {
    DEFAULT_NEGLIGIBLE_THRESHOLD
}

fn default_model_timeout() -> f64 {
    5.0
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            bottleneck_weight_table: BottleneckWeightTable::default(),
            transformation_catalog: default_catalog(),
            negligible_threshold: default_negligible_threshold(),
            priority_thresholds: PriorityThresholds::default(),
            model_strategy: ModelStrategy::default(),
            model_path: None,
            model_timeout_seconds: default_model_timeout(),
            strict_mode: false,
            max_recommendations: None,
            heuristic_curves: default_heuristic_curves(),
        }
    }
}

impl AdvisorConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AdvisorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.model_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.negligible_threshold) {
            return Err(AdvisorError::Config(format!(
                "negligible_threshold must be in [0, 1), got {}",
                self.negligible_threshold
            )));
        }

        self.priority_thresholds.validate()?;

        if !self.model_timeout_seconds.is_finite() || self.model_timeout_seconds <= 0.0 {
            return Err(AdvisorError::Config(format!(
                "model_timeout_seconds must be positive, got {}",
                self.model_timeout_seconds
            )));
        }

        if self.model_strategy == ModelStrategy::Learned && self.model_path.is_none() {
            return Err(AdvisorError::Config(
                "model_strategy = \"learned\" requires model_path".to_string(),
            ));
        }

        if self.max_recommendations == Some(0) {
            return Err(AdvisorError::Config(
                "max_recommendations must be at least 1 when set".to_string(),
            ));
        }

        for (category, weights) in self.bottleneck_weight_table.iter() {
            if let Some((feature, w)) = weights.iter().find(|(_, w)| **w < 0.0) {
                return Err(AdvisorError::Config(format!(
                    "weight for {}.{} is negative ({})",
                    category, feature, w
                )));
            }
        }

        let mut curve_categories = BTreeSet::new();
        for curve in &self.heuristic_curves {
            curve.validate()?;
            if !curve_categories.insert(curve.category) {
                return Err(AdvisorError::Config(format!(
                    "duplicate heuristic curve for {}",
                    curve.category
                )));
            }
        }

        let mut template_ids = BTreeSet::new();
        for template in &self.transformation_catalog {
            if !curve_categories.contains(&template.category) {
                return Err(AdvisorError::UnsupportedCategory(template.category));
            }
            if !template_ids.insert(template.template_id.as_str()) {
                return Err(AdvisorError::Config(format!(
                    "duplicate template id `{}`",
                    template.template_id
                )));
            }
        }

        Ok(())
    }
}
