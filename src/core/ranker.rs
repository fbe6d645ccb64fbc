// Recommendation ranking
// impact = weight * (speedup - 1) * confidence, tiered by fixed thresholds

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::core::classifier::{
    BottleneckBreakdown, BottleneckCategory, DEFAULT_NEGLIGIBLE_THRESHOLD, SCORE_TIE_EPSILON,
};
use crate::core::estimator::SpeedupEstimate;
use crate::error::{AdvisorError, Result};

/// Catalog entry describing a candidate code change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationTemplate {
    pub template_id: String,
    pub category: BottleneckCategory,
    pub description: String,
}

impl TransformationTemplate {
    pub fn new(template_id: impl Into<String>, category: BottleneckCategory, description: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            category,
            description: description.into(),
        }
    }
}

/// Built-in transformation catalog
pub fn default_catalog() -> Vec<TransformationTemplate> {
    use BottleneckCategory::*;
    vec![
        TransformationTemplate::new(
            "global_memory_coalesce",
            MemoryDivergence,
            "Reorganize global memory accesses so adjacent threads touch adjacent addresses",
        ),
        TransformationTemplate::new(
            "shared_memory_staging",
            MemoryDivergence,
            "Stage reused global data through shared memory tiles",
        ),
        TransformationTemplate::new(
            "memory_transaction_reduction",
            MemoryDivergence,
            "Use vectorized loads and stores to cut the number of memory transactions",
        ),
        TransformationTemplate::new(
            "block_increase",
            Occupancy,
            "Launch more thread blocks or more threads per block to fill idle warp slots",
        ),
        TransformationTemplate::new(
            "register_reduction",
            Occupancy,
            "Reduce registers per thread with launch bounds so more warps fit per multiprocessor",
        ),
        TransformationTemplate::new(
            "loop_unroll",
            InstructionScheduling,
            "Unroll hot loops to expose independent instructions to the scheduler",
        ),
        TransformationTemplate::new(
            "code_reorder",
            InstructionScheduling,
            "Move long-latency loads ahead of their first use to hide latency",
        ),
        TransformationTemplate::new(
            "strength_reduction",
            InstructionScheduling,
            "Replace expensive arithmetic such as division and modulo with cheaper equivalents",
        ),
        TransformationTemplate::new(
            "warp_balance",
            Synchronization,
            "Balance work across warps to shorten waits at block barriers",
        ),
        TransformationTemplate::new(
            "warp_level_sync",
            Synchronization,
            "Replace block-wide barriers with warp-level primitives where data stays within a warp",
        ),
        TransformationTemplate::new(
            "kernel_fusion",
            Algorithmic,
            "Fuse producer and consumer kernels to raise arithmetic intensity",
        ),
        TransformationTemplate::new(
            "work_reduction",
            Algorithmic,
            "Reduce redundant computation per output element",
        ),
    ]
}

/// Priority tier, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        };
        f.write_str(name)
    }
}

/// Lower bounds on impact score for each tier.
///
/// Candidates scoring below `low` are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityThresholds {
    #[serde(default = "default_critical")]
    pub critical: f64,
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default)]
    pub low: f64,
}

fn default_critical() -> f64 {
    0.30
}

fn default_high() -> f64 {
    0.15
}

fn default_medium() -> f64 {
    0.05
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            critical: default_critical(),
            high: default_high(),
            medium: default_medium(),
            low: 0.0,
        }
    }
}

impl PriorityThresholds {
    pub fn validate(&self) -> Result<()> {
        let ordered = [self.critical, self.high, self.medium, self.low];
        if ordered.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(AdvisorError::Config(
                "priority thresholds must be finite and non-negative".to_string(),
            ));
        }
        if ordered.windows(2).any(|w| w[0] < w[1]) {
            return Err(AdvisorError::Config(format!(
                "priority thresholds must be descending, got {:?}",
                ordered
            )));
        }
        Ok(())
    }

    pub fn tier(&self, impact_score: f64) -> Option<Priority> {
        if impact_score >= self.critical {
            Some(Priority::Critical)
        } else if impact_score >= self.high {
            Some(Priority::High)
        } else if impact_score >= self.medium {
            Some(Priority::Medium)
        } else if impact_score >= self.low {
            Some(Priority::Low)
        } else {
            None
        }
    }
}

/// Ranked optimization advice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub category: BottleneckCategory,
    pub description: String,
    pub priority: Priority,
    pub estimated_speedup: SpeedupEstimate,
    pub confidence: f64,
    pub impact_score: f64,
}

/// Ranker output
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Ranking {
    pub recommendations: Vec<Recommendation>,
    /// Set when `max_recommendations` cut the list
    pub truncated: bool,
}

/// `weight * (point_estimate - 1) * confidence`
pub fn impact_score(weight: f64, estimate: &SpeedupEstimate) -> f64 {
    weight * estimate.gain() * estimate.confidence
}

/// Dedup key: trimmed, lower-cased, whitespace collapsed
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

struct Candidate {
    catalog_index: usize,
    recommendation: Recommendation,
}

impl Candidate {
    /// Higher impact first; impacts within `SCORE_TIE_EPSILON` fall back to
    /// category order, then catalog order
    fn precedes(&self, other: &Self) -> bool {
        let (a, b) = (self.recommendation.impact_score, other.recommendation.impact_score);
        if (a - b).abs() <= SCORE_TIE_EPSILON {
            (self.recommendation.category, self.catalog_index)
                < (other.recommendation.category, other.catalog_index)
        } else {
            a > b
        }
    }
}

/// Insertion sort on [`Candidate::precedes`]; the near-tie relation is not
/// transitive, so the order is built the same way as the dominance order.
fn rank_order(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut ordered: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let position = ordered
            .iter()
            .position(|existing| candidate.precedes(existing))
            .unwrap_or(ordered.len());
        ordered.insert(position, candidate);
    }
    ordered
}

/// Deterministic recommendation ranker
#[derive(Debug, Clone)]
pub struct RecommendationRanker {
    thresholds: PriorityThresholds,
    negligible_threshold: f64,
    max_recommendations: Option<usize>,
}

impl Default for RecommendationRanker {
    fn default() -> Self {
        Self::new(PriorityThresholds::default(), DEFAULT_NEGLIGIBLE_THRESHOLD)
    }
}

impl RecommendationRanker {
    pub fn new(thresholds: PriorityThresholds, negligible_threshold: f64) -> Self {
        Self {
            thresholds,
            negligible_threshold,
            max_recommendations: None,
        }
    }

    pub fn with_max_recommendations(mut self, max: Option<usize>) -> Self {
        self.max_recommendations = max;
        self
    }

    pub fn rank(
        &self,
        breakdown: &BottleneckBreakdown,
        estimates: &BTreeMap<BottleneckCategory, SpeedupEstimate>,
        catalog: &[TransformationTemplate],
    ) -> Result<Ranking> {
        if breakdown.no_bottleneck_detected {
            return Ok(Ranking::default());
        }

        let mut candidates = Vec::new();
        for (catalog_index, template) in catalog.iter().enumerate() {
            let weight = breakdown.weight(template.category);
            if weight <= self.negligible_threshold {
                continue;
            }

            let estimate = estimates
                .get(&template.category)
                .ok_or(AdvisorError::UnsupportedCategory(template.category))?;
            let impact = impact_score(weight, estimate);

            let Some(priority) = self.thresholds.tier(impact) else {
                debug!("Dropping {} with impact {:.4}", template.template_id, impact);
                continue;
            };

            candidates.push(Candidate {
                catalog_index,
                recommendation: Recommendation {
                    id: template.template_id.clone(),
                    category: template.category,
                    description: template.description.clone(),
                    priority,
                    estimated_speedup: estimate.clone(),
                    confidence: estimate.confidence,
                    impact_score: impact,
                },
            });
        }

        let mut seen = HashSet::new();
        let mut recommendations: Vec<Recommendation> = rank_order(candidates)
            .into_iter()
            .filter(|c| {
                let key = (
                    c.recommendation.category,
                    normalize_description(&c.recommendation.description),
                );
                seen.insert(key)
            })
            .map(|c| c.recommendation)
            .collect();

        let mut truncated = false;
        if let Some(max) = self.max_recommendations {
            if recommendations.len() > max {
                debug!("Truncating {} recommendations to {}", recommendations.len(), max);
                recommendations.truncate(max);
                truncated = true;
            }
        }

        Ok(Ranking {
            recommendations,
            truncated,
        })
    }
}
