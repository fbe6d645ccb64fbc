//! Bottleneck attribution
//!
//! Scores each [`BottleneckCategory`] with a fixed linear combination of
//! feature values and normalizes the clipped scores into a breakdown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::core::features::{FeatureName, FeatureRecord};
use crate::error::AdvisorError;

/// Scores closer than this are ordered by category declaration order
pub const SCORE_TIE_EPSILON: f64 = 1e-3;

/// Tolerance on the sum of breakdown weights
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// Default score under which a category is considered noise
pub const DEFAULT_NEGLIGIBLE_THRESHOLD: f64 = 0.02;

/// Class of performance-limiting behavior.
///
/// Declaration order is the stable tie-break order used by the classifier
/// and the ranker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckCategory {
    MemoryDivergence,
    Occupancy,
    InstructionScheduling,
    Synchronization,
    Algorithmic,
}

impl BottleneckCategory {
    pub const ALL: [BottleneckCategory; 5] = [
        BottleneckCategory::MemoryDivergence,
        BottleneckCategory::Occupancy,
        BottleneckCategory::InstructionScheduling,
        BottleneckCategory::Synchronization,
        BottleneckCategory::Algorithmic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BottleneckCategory::MemoryDivergence => "memory_divergence",
            BottleneckCategory::Occupancy => "occupancy",
            BottleneckCategory::InstructionScheduling => "instruction_scheduling",
            BottleneckCategory::Synchronization => "synchronization",
            BottleneckCategory::Algorithmic => "algorithmic",
        }
    }

    /// Position in declaration order
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for BottleneckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BottleneckCategory {
    type Err = AdvisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AdvisorError::Config(format!("unknown bottleneck category `{}`", s)))
    }
}

/// Per-category linear weights over feature values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, BTreeMap<String, f64>>")]
pub struct BottleneckWeightTable(BTreeMap<BottleneckCategory, BTreeMap<FeatureName, f64>>);

impl BottleneckWeightTable {
    pub fn new(table: BTreeMap<BottleneckCategory, BTreeMap<FeatureName, f64>>) -> Self {
        Self(table)
    }

    pub fn weights(&self, category: BottleneckCategory) -> Option<&BTreeMap<FeatureName, f64>> {
        self.0.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BottleneckCategory, &BTreeMap<FeatureName, f64>)> {
        self.0.iter()
    }
}

impl Default for BottleneckWeightTable {
    fn default() -> Self {
        use BottleneckCategory::*;
        use FeatureName::*;

        let rows: [(BottleneckCategory, &[(FeatureName, f64)]); 5] = [
            (
                MemoryDivergence,
                &[
                    (MemoryStallFraction, 1.0),
                    (WarpDivergenceRatio, 0.5),
                    (UncoalescedAccessRatio, 0.5),
                ],
            ),
            (Occupancy, &[(OccupancyDeficit, 0.8)]),
            (
                InstructionScheduling,
                &[(ExecutionStallFraction, 1.0), (InstructionLatencyAvg, 0.005)],
            ),
            (Synchronization, &[(SyncStallFraction, 1.0)]),
            (
                Algorithmic,
                &[(ComputeUtilization, 0.4), (DramBandwidthUtilization, 0.3)],
            ),
        ];

        Self(
            rows.into_iter()
                .map(|(category, weights)| (category, weights.iter().copied().collect()))
                .collect(),
        )
    }
}

impl TryFrom<BTreeMap<String, BTreeMap<String, f64>>> for BottleneckWeightTable {
    type Error = AdvisorError;

    fn try_from(raw: BTreeMap<String, BTreeMap<String, f64>>) -> Result<Self, Self::Error> {
        let mut table = BTreeMap::new();
        for (category, row) in raw {
            let category: BottleneckCategory = category.parse()?;
            let mut weights = BTreeMap::new();
            for (feature, weight) in row {
                if !weight.is_finite() {
                    return Err(AdvisorError::Config(format!(
                        "weight for {}.{} is not finite",
                        category, feature
                    )));
                }
                weights.insert(feature.parse::<FeatureName>()?, weight);
            }
            table.insert(category, weights);
        }
        Ok(Self(table))
    }
}

/// Fractional attribution of stall behavior to categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckBreakdown {
    pub weights: BTreeMap<BottleneckCategory, f64>,
    /// Categories by descending weight; empty when nothing was detected
    pub dominance: Vec<BottleneckCategory>,
    pub no_bottleneck_detected: bool,
}

impl BottleneckBreakdown {
    /// The state emitted for noise-dominated input
    pub fn none_detected() -> Self {
        Self {
            weights: BottleneckCategory::ALL.iter().map(|c| (*c, 0.0)).collect(),
            dominance: Vec::new(),
            no_bottleneck_detected: true,
        }
    }

    pub fn weight(&self, category: BottleneckCategory) -> f64 {
        self.weights.get(&category).copied().unwrap_or(0.0)
    }

    pub fn dominant(&self) -> Option<BottleneckCategory> {
        self.dominance.first().copied()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Check the sum-to-one / all-zero invariant
    pub fn is_consistent(&self) -> bool {
        if self.no_bottleneck_detected {
            self.weights.values().all(|w| *w == 0.0)
        } else {
            (self.total_weight() - 1.0).abs() <= WEIGHT_SUM_EPSILON
                && self.weights.values().all(|w| (0.0..=1.0).contains(w))
        }
    }
}

/// Rule-based bottleneck classifier
#[derive(Debug, Clone)]
pub struct BottleneckClassifier {
    weights: BottleneckWeightTable,
    negligible_threshold: f64,
}

impl Default for BottleneckClassifier {
    fn default() -> Self {
        Self::new(BottleneckWeightTable::default(), DEFAULT_NEGLIGIBLE_THRESHOLD)
    }
}

impl BottleneckClassifier {
    pub fn new(weights: BottleneckWeightTable, negligible_threshold: f64) -> Self {
        Self {
            weights,
            negligible_threshold,
        }
    }

    /// Clipped linear scores per category. Imputed features contribute nothing.
    pub fn raw_scores(&self, features: &FeatureRecord) -> BTreeMap<BottleneckCategory, f64> {
        BottleneckCategory::ALL
            .iter()
            .map(|category| {
                let score: f64 = self
                    .weights
                    .weights(*category)
                    .map(|row| {
                        row.iter()
                            .filter(|(feature, _)| !features.is_missing(**feature))
                            .map(|(feature, weight)| weight * features.get(*feature))
                            .sum()
                    })
                    .unwrap_or(0.0);
                (*category, score.max(0.0))
            })
            .collect()
    }

    pub fn classify(&self, features: &FeatureRecord) -> BottleneckBreakdown {
        let scores = self.raw_scores(features);
        debug!("Raw bottleneck scores: {:?}", scores);

        if scores.values().all(|s| *s <= self.negligible_threshold) {
            debug!("All scores within negligible threshold {}", self.negligible_threshold);
            return BottleneckBreakdown::none_detected();
        }

        let total: f64 = scores.values().sum();
        let weights = scores.iter().map(|(c, s)| (*c, s / total)).collect();

        BottleneckBreakdown {
            weights,
            dominance: dominance_order(&scores),
            no_bottleneck_detected: false,
        }
    }
}

/// Insertion sort on "strictly higher score, else earlier category when tied".
/// The tie relation is not transitive, so a library sort is not used here.
fn dominance_order(scores: &BTreeMap<BottleneckCategory, f64>) -> Vec<BottleneckCategory> {
    let precedes = |a: &(BottleneckCategory, f64), b: &(BottleneckCategory, f64)| {
        if (a.1 - b.1).abs() <= SCORE_TIE_EPSILON {
            a.0 < b.0
        } else {
            a.1 > b.1
        }
    };

    let mut ordered: Vec<(BottleneckCategory, f64)> = Vec::with_capacity(scores.len());
    for entry in scores.iter().map(|(c, s)| (*c, *s)) {
        let position = ordered
            .iter()
            .position(|existing| precedes(&entry, existing))
            .unwrap_or(ordered.len());
        ordered.insert(position, entry);
    }
    ordered.into_iter().map(|(c, _)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(values: &[(FeatureName, f64)]) -> FeatureRecord {
        FeatureRecord::from_values(values.iter().copied())
    }

    #[test]
    fn test_memory_bound_kernel() {
        let features = record(&[
            (FeatureName::MemoryStallFraction, 0.8),
            (FeatureName::OccupancyRatio, 0.9),
            (FeatureName::OccupancyDeficit, 0.1),
        ]);
        let breakdown = BottleneckClassifier::default().classify(&features);

        assert!(!breakdown.no_bottleneck_detected);
        assert!(breakdown.weight(BottleneckCategory::MemoryDivergence) >= 0.6);
        assert_eq!(breakdown.dominant(), Some(BottleneckCategory::MemoryDivergence));
        assert!(breakdown.is_consistent());
    }

    #[test]
    fn test_all_missing_is_no_bottleneck() {
        let breakdown = BottleneckClassifier::default().classify(&FeatureRecord::all_defaults());
        assert!(breakdown.no_bottleneck_detected);
        assert_eq!(breakdown.total_weight(), 0.0);
        assert!(breakdown.dominance.is_empty());
        assert!(breakdown.is_consistent());
    }

    #[test]
    fn test_negligible_scores() {
        let features = record(&[(FeatureName::SyncStallFraction, 0.01)]);
        let breakdown = BottleneckClassifier::default().classify(&features);
        assert!(breakdown.no_bottleneck_detected);
    }

    #[test]
    fn test_tie_break_uses_declaration_order() {
        let features = record(&[
            (FeatureName::SyncStallFraction, 0.3),
            (FeatureName::ExecutionStallFraction, 0.3005),
        ]);
        let breakdown = BottleneckClassifier::default().classify(&features);
        assert_eq!(
            &breakdown.dominance[..2],
            &[BottleneckCategory::InstructionScheduling, BottleneckCategory::Synchronization]
        );

        let features = record(&[
            (FeatureName::SyncStallFraction, 0.3005),
            (FeatureName::ExecutionStallFraction, 0.3),
        ]);
        let breakdown = BottleneckClassifier::default().classify(&features);
        assert_eq!(breakdown.dominant(), Some(BottleneckCategory::InstructionScheduling));
    }

    #[test]
    fn test_weights_sum_to_one() {
        let features = record(&[
            (FeatureName::MemoryStallFraction, 0.35),
            (FeatureName::ExecutionStallFraction, 0.2),
            (FeatureName::SyncStallFraction, 0.1),
            (FeatureName::OccupancyDeficit, 0.5),
            (FeatureName::InstructionLatencyAvg, 24.0),
            (FeatureName::ComputeUtilization, 0.7),
            (FeatureName::DramBandwidthUtilization, 0.6),
        ]);
        let breakdown = BottleneckClassifier::default().classify(&features);
        assert!((breakdown.total_weight() - 1.0).abs() <= WEIGHT_SUM_EPSILON);
        assert_eq!(breakdown.dominance.len(), BottleneckCategory::ALL.len());
    }

    #[test]
    fn test_negative_scores_clipped() {
        let mut table = BTreeMap::new();
        table.insert(
            BottleneckCategory::Algorithmic,
            BTreeMap::from([(FeatureName::ComputeUtilization, -1.0)]),
        );
        table.insert(
            BottleneckCategory::Occupancy,
            BTreeMap::from([(FeatureName::OccupancyDeficit, 1.0)]),
        );
        let classifier = BottleneckClassifier::new(BottleneckWeightTable::new(table), 0.02);
        let features = record(&[
            (FeatureName::ComputeUtilization, 0.9),
            (FeatureName::OccupancyDeficit, 0.4),
        ]);
        let breakdown = classifier.classify(&features);
        assert_eq!(breakdown.weight(BottleneckCategory::Algorithmic), 0.0);
        assert!((breakdown.weight(BottleneckCategory::Occupancy) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weight_table_from_strings() {
        let raw = BTreeMap::from([(
            "occupancy".to_string(),
            BTreeMap::from([("occupancy_deficit".to_string(), 0.5)]),
        )]);
        let table = BottleneckWeightTable::try_from(raw).unwrap();
        assert_eq!(
            table.weights(BottleneckCategory::Occupancy).unwrap()[&FeatureName::OccupancyDeficit],
            0.5
        );

        let bad = BTreeMap::from([("latency".to_string(), BTreeMap::new())]);
        assert!(BottleneckWeightTable::try_from(bad).is_err());
    }
}
