//! Canonical per-invocation feature record

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::AdvisorError;

/// Lowest average instruction latency a streaming multiprocessor can report
pub const MIN_INSTRUCTION_LATENCY_CYCLES: f64 = 4.0;

/// Value domain of a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// Fraction in [0, 1]
    Ratio,
    /// Non-negative cycle count
    Cycles,
}

/// The fixed set of features every record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    MemoryStallFraction,
    ExecutionStallFraction,
    SyncStallFraction,
    OccupancyRatio,
    OccupancyDeficit,
    WarpDivergenceRatio,
    UncoalescedAccessRatio,
    InstructionLatencyAvg,
    ComputeUtilization,
    DramBandwidthUtilization,
}

impl FeatureName {
    /// Every feature, in feature-vector order
    pub const ALL: [FeatureName; 10] = [
        FeatureName::MemoryStallFraction,
        FeatureName::ExecutionStallFraction,
        FeatureName::SyncStallFraction,
        FeatureName::OccupancyRatio,
        FeatureName::OccupancyDeficit,
        FeatureName::WarpDivergenceRatio,
        FeatureName::UncoalescedAccessRatio,
        FeatureName::InstructionLatencyAvg,
        FeatureName::ComputeUtilization,
        FeatureName::DramBandwidthUtilization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureName::MemoryStallFraction => "memory_stall_fraction",
            FeatureName::ExecutionStallFraction => "execution_stall_fraction",
            FeatureName::SyncStallFraction => "sync_stall_fraction",
            FeatureName::OccupancyRatio => "occupancy_ratio",
            FeatureName::OccupancyDeficit => "occupancy_deficit",
            FeatureName::WarpDivergenceRatio => "warp_divergence_ratio",
            FeatureName::UncoalescedAccessRatio => "uncoalesced_access_ratio",
            FeatureName::InstructionLatencyAvg => "instruction_latency_avg",
            FeatureName::ComputeUtilization => "compute_utilization",
            FeatureName::DramBandwidthUtilization => "dram_bandwidth_utilization",
        }
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureName::InstructionLatencyAvg => FeatureKind::Cycles,
            _ => FeatureKind::Ratio,
        }
    }

    /// Value imputed when the feature cannot be derived
    pub fn default_value(&self) -> f64 {
        match self.kind() {
            FeatureKind::Ratio => 0.0,
            FeatureKind::Cycles => MIN_INSTRUCTION_LATENCY_CYCLES,
        }
    }

    /// Clamp a derived value into the feature's domain
    pub fn clamp_value(&self, value: f64) -> f64 {
        match self.kind() {
            FeatureKind::Ratio => value.clamp(0.0, 1.0),
            FeatureKind::Cycles => value.max(0.0),
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureName {
    type Err = AdvisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| AdvisorError::Config(format!("unknown feature `{}`", s)))
    }
}

/// Normalized summary of one kernel invocation.
///
/// Every [`FeatureName`] is present. Features that could not be derived hold
/// their default and are listed in `missing_features`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    values: BTreeMap<FeatureName, f64>,
    missing: BTreeSet<FeatureName>,
}

impl FeatureRecord {
    /// Build a record from derived values; absent or non-finite entries are
    /// imputed and flagged missing.
    pub fn from_values(derived: impl IntoIterator<Item = (FeatureName, f64)>) -> Self {
        let mut supplied: BTreeMap<FeatureName, f64> = derived
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .collect();

        let mut values = BTreeMap::new();
        let mut missing = BTreeSet::new();
        for name in FeatureName::ALL {
            match supplied.remove(&name) {
                Some(v) => {
                    values.insert(name, name.clamp_value(v));
                }
                None => {
                    values.insert(name, name.default_value());
                    missing.insert(name);
                }
            }
        }

        Self { values, missing }
    }

    /// Record where nothing could be derived
    pub fn all_defaults() -> Self {
        Self::from_values(std::iter::empty())
    }

    pub fn get(&self, name: FeatureName) -> f64 {
        self.values
            .get(&name)
            .copied()
            .unwrap_or_else(|| name.default_value())
    }

    pub fn is_missing(&self, name: FeatureName) -> bool {
        self.missing.contains(&name)
    }

    pub fn missing_features(&self) -> &BTreeSet<FeatureName> {
        &self.missing
    }

    /// Values in [`FeatureName::ALL`] order
    pub fn to_vector(&self) -> Vec<f64> {
        FeatureName::ALL.iter().map(|n| self.get(*n)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureName, f64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

impl Serialize for FeatureRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("FeatureRecord", 2)?;
        state.serialize_field("features", &self.values)?;
        state.serialize_field("missing_features", &self.missing)?;
        state.end()
    }
}
