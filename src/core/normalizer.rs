//! Counter normalization
//!
//! Turns a batch of raw profiler counters into a [`FeatureRecord`] using a
//! fixed derivation table. Duplicated counters are averaged per scope, and a
//! counter seen at several scopes is read from the widest one.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::core::features::{FeatureName, FeatureRecord};
use crate::core::sample::{CounterSample, CounterScope, CounterUnit};
use crate::error::{AdvisorError, Result};

/// Raw counters understood by the derivation table, with the unit each must carry
pub const KNOWN_COUNTERS: &[(&str, CounterUnit)] = &[
    ("total_cycles", CounterUnit::Cycles),
    ("stalled_cycles_memory", CounterUnit::Cycles),
    ("stalled_cycles_execution", CounterUnit::Cycles),
    ("stalled_cycles_sync", CounterUnit::Cycles),
    ("occupancy_ratio", CounterUnit::Ratio),
    ("active_warps", CounterUnit::Count),
    ("max_warps", CounterUnit::Count),
    ("warp_divergence_ratio", CounterUnit::Ratio),
    ("divergent_branches", CounterUnit::Count),
    ("total_branches", CounterUnit::Count),
    ("global_bytes_requested", CounterUnit::Bytes),
    ("global_bytes_transferred", CounterUnit::Bytes),
    ("total_latency_cycles", CounterUnit::Cycles),
    ("instructions_executed", CounterUnit::Count),
    ("compute_utilization", CounterUnit::Ratio),
    ("dram_bandwidth_utilization", CounterUnit::Ratio),
];

#[derive(Debug, Clone, Copy)]
enum Formula {
    Direct(&'static str),
    Quotient(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy)]
struct Alternative {
    formula: Formula,
    /// Report `1 - value` instead of the value
    complement: bool,
}

const fn direct(counter: &'static str) -> Alternative {
    Alternative { formula: Formula::Direct(counter), complement: false }
}

const fn quotient(numerator: &'static str, denominator: &'static str) -> Alternative {
    Alternative { formula: Formula::Quotient(numerator, denominator), complement: false }
}

const fn complement(alt: Alternative) -> Alternative {
    Alternative { formula: alt.formula, complement: true }
}

struct DerivationRule {
    feature: FeatureName,
    /// Tried in order, first computable one wins
    alternatives: &'static [Alternative],
    /// A zero base value means the profiler did not capture the quantity
    zero_is_unmeasured: bool,
}

const OCCUPANCY_DIRECT: Alternative = direct("occupancy_ratio");
const OCCUPANCY_FROM_WARPS: Alternative = quotient("active_warps", "max_warps");

static DERIVATION_RULES: &[DerivationRule] = &[
    DerivationRule {
        feature: FeatureName::MemoryStallFraction,
        alternatives: &[quotient("stalled_cycles_memory", "total_cycles")],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::ExecutionStallFraction,
        alternatives: &[quotient("stalled_cycles_execution", "total_cycles")],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::SyncStallFraction,
        alternatives: &[quotient("stalled_cycles_sync", "total_cycles")],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::OccupancyRatio,
        alternatives: &[OCCUPANCY_DIRECT, OCCUPANCY_FROM_WARPS],
        zero_is_unmeasured: true,
    },
    DerivationRule {
        feature: FeatureName::OccupancyDeficit,
        alternatives: &[complement(OCCUPANCY_DIRECT), complement(OCCUPANCY_FROM_WARPS)],
        zero_is_unmeasured: true,
    },
    DerivationRule {
        feature: FeatureName::WarpDivergenceRatio,
        alternatives: &[
            direct("warp_divergence_ratio"),
            quotient("divergent_branches", "total_branches"),
        ],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::UncoalescedAccessRatio,
        alternatives: &[complement(quotient("global_bytes_requested", "global_bytes_transferred"))],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::InstructionLatencyAvg,
        alternatives: &[quotient("total_latency_cycles", "instructions_executed")],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::ComputeUtilization,
        alternatives: &[direct("compute_utilization")],
        zero_is_unmeasured: false,
    },
    DerivationRule {
        feature: FeatureName::DramBandwidthUtilization,
        alternatives: &[direct("dram_bandwidth_utilization")],
        zero_is_unmeasured: false,
    },
];

/// Unit the derivation table expects for a counter, if it knows the counter
pub fn expected_unit(counter_name: &str) -> Option<CounterUnit> {
    KNOWN_COUNTERS
        .iter()
        .find(|(name, _)| *name == counter_name)
        .map(|(_, unit)| *unit)
}

enum Evaluation {
    Value(f64),
    /// All inputs present but the formula is undefined for them
    Degenerate,
    /// At least one input counter absent
    Absent(Vec<&'static str>),
}

/// Aggregated counter values for one kernel invocation
#[derive(Debug, Default)]
struct CounterTable {
    values: BTreeMap<String, f64>,
}

impl CounterTable {
    fn build(samples: &[CounterSample]) -> Self {
        let mut grouped: BTreeMap<(&str, CounterScope), (f64, usize)> = BTreeMap::new();
        for sample in samples {
            let entry = grouped
                .entry((sample.counter_name.as_str(), sample.scope))
                .or_insert((0.0, 0));
            entry.0 += sample.value;
            entry.1 += 1;
        }

        let mut values: BTreeMap<String, (CounterScope, f64)> = BTreeMap::new();
        for ((name, scope), (sum, count)) in grouped {
            if count > 1 {
                debug!("Averaged {} duplicate samples of {} at {:?} scope", count, name, scope);
            }
            let mean = sum / count as f64;
            match values.get(name) {
                Some((existing, _)) if *existing >= scope => {}
                _ => {
                    values.insert(name.to_string(), (scope, mean));
                }
            }
        }

        Self {
            values: values.into_iter().map(|(k, (_, v))| (k, v)).collect(),
        }
    }

    fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    fn evaluate(&self, alt: &Alternative, zero_is_unmeasured: bool) -> Evaluation {
        let base = match alt.formula {
            Formula::Direct(counter) => match self.get(counter) {
                Some(v) => Some(v),
                None => return Evaluation::Absent(vec![counter]),
            },
            Formula::Quotient(num, den) => {
                let absent: Vec<&'static str> = [num, den]
                    .into_iter()
                    .filter(|c| self.get(c).is_none())
                    .collect();
                if !absent.is_empty() {
                    return Evaluation::Absent(absent);
                }
                let (n, d) = (self.get(num).unwrap_or(0.0), self.get(den).unwrap_or(0.0));
                if d == 0.0 {
                    None
                } else {
                    Some(n / d)
                }
            }
        };

        match base {
            Some(v) if v.is_finite() && !(zero_is_unmeasured && v == 0.0) => {
                Evaluation::Value(if alt.complement { 1.0 - v } else { v })
            }
            _ => Evaluation::Degenerate,
        }
    }
}

/// Stateless counter normalizer
#[derive(Debug, Clone, Default)]
pub struct CounterNormalizer {
    strict_mode: bool,
}

impl CounterNormalizer {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Derive the feature record for one kernel invocation
    pub fn normalize(&self, samples: &[CounterSample]) -> Result<FeatureRecord> {
        validate_samples(samples)?;
        let table = CounterTable::build(samples);

        let mut derived = Vec::with_capacity(DERIVATION_RULES.len());
        let mut absent_counters: BTreeSet<&'static str> = BTreeSet::new();

        for rule in DERIVATION_RULES {
            let mut degenerate = false;
            let mut rule_absent = Vec::new();
            let mut value = None;

            for alt in rule.alternatives {
                match table.evaluate(alt, rule.zero_is_unmeasured) {
                    Evaluation::Value(v) => {
                        value = Some(v);
                        break;
                    }
                    Evaluation::Degenerate => degenerate = true,
                    Evaluation::Absent(counters) => rule_absent.extend(counters),
                }
            }

            match value {
                Some(v) => {
                    trace!("{} = {:.4}", rule.feature, v);
                    derived.push((rule.feature, v));
                }
                None if degenerate => {
                    debug!("{} is undefined for the captured counters, using default", rule.feature);
                }
                None => {
                    debug!("{} has no source counters, using default", rule.feature);
                    absent_counters.extend(rule_absent);
                }
            }
        }

        if self.strict_mode && !absent_counters.is_empty() {
            let names: Vec<&str> = absent_counters.into_iter().collect();
            return Err(AdvisorError::invalid_sample(
                names.join(", "),
                "required counter missing in strict mode",
            ));
        }

        let record = FeatureRecord::from_values(derived);
        debug!(
            "Normalized {} samples into {} features ({} missing)",
            samples.len(),
            FeatureName::ALL.len(),
            record.missing_features().len()
        );
        Ok(record)
    }
}

fn validate_samples(samples: &[CounterSample]) -> Result<()> {
    for sample in samples {
        let name = &sample.counter_name;
        if !sample.value.is_finite() {
            return Err(AdvisorError::invalid_sample(name, "value is not finite"));
        }

        let Some(expected) = expected_unit(name) else {
            debug!("Ignoring counter {} unknown to the derivation table", name);
            continue;
        };

        if sample.unit != expected {
            return Err(AdvisorError::invalid_sample(
                name,
                format!("expected unit {}, got {}", expected, sample.unit),
            ));
        }
        if sample.value < 0.0 {
            return Err(AdvisorError::invalid_sample(name, "negative value"));
        }
        if sample.unit == CounterUnit::Ratio && sample.value > 1.0 {
            return Err(AdvisorError::invalid_sample(
                name,
                format!("ratio {} outside [0, 1]", sample.value),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::MIN_INSTRUCTION_LATENCY_CYCLES;

    fn cycles(name: &str, value: f64) -> CounterSample {
        CounterSample::kernel(name, value, CounterUnit::Cycles)
    }

    fn ratio(name: &str, value: f64) -> CounterSample {
        CounterSample::kernel(name, value, CounterUnit::Ratio)
    }

    #[test]
    fn test_memory_stall_fraction() {
        let samples = vec![
            cycles("stalled_cycles_memory", 800.0),
            cycles("total_cycles", 1000.0),
            ratio("occupancy_ratio", 0.9),
        ];
        let record = CounterNormalizer::new(false).normalize(&samples).unwrap();
        assert!((record.get(FeatureName::MemoryStallFraction) - 0.8).abs() < 1e-12);
        assert!((record.get(FeatureName::OccupancyRatio) - 0.9).abs() < 1e-12);
        assert!((record.get(FeatureName::OccupancyDeficit) - 0.1).abs() < 1e-12);
        assert!(!record.is_missing(FeatureName::MemoryStallFraction));
        assert!(record.is_missing(FeatureName::WarpDivergenceRatio));
    }

    #[test]
    fn test_duplicates_are_averaged() {
        let samples = vec![
            cycles("stalled_cycles_memory", 600.0),
            cycles("stalled_cycles_memory", 400.0),
            cycles("total_cycles", 1000.0),
        ];
        let record = CounterNormalizer::default().normalize(&samples).unwrap();
        assert!((record.get(FeatureName::MemoryStallFraction) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_widest_scope_wins() {
        let samples = vec![
            CounterSample::new("occupancy_ratio", 0.2, CounterUnit::Ratio, CounterScope::Warp),
            CounterSample::new("occupancy_ratio", 0.7, CounterUnit::Ratio, CounterScope::Kernel),
            CounterSample::new("occupancy_ratio", 0.4, CounterUnit::Ratio, CounterScope::Block),
        ];
        let record = CounterNormalizer::default().normalize(&samples).unwrap();
        assert!((record.get(FeatureName::OccupancyRatio) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_fallback_alternative() {
        let samples = vec![
            CounterSample::kernel("active_warps", 16.0, CounterUnit::Count),
            CounterSample::kernel("max_warps", 64.0, CounterUnit::Count),
        ];
        let record = CounterNormalizer::default().normalize(&samples).unwrap();
        assert!((record.get(FeatureName::OccupancyRatio) - 0.25).abs() < 1e-12);
        assert!((record.get(FeatureName::OccupancyDeficit) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_division_by_zero_defaults() {
        let samples = vec![
            cycles("total_latency_cycles", 0.0),
            CounterSample::kernel("instructions_executed", 0.0, CounterUnit::Count),
            cycles("stalled_cycles_memory", 0.0),
            cycles("total_cycles", 0.0),
        ];
        let record = CounterNormalizer::new(true).normalize(&samples);
        // strict mode still rejects the other absent counters
        assert!(record.is_err());

        let record = CounterNormalizer::new(false).normalize(&samples).unwrap();
        assert_eq!(record.get(FeatureName::InstructionLatencyAvg), MIN_INSTRUCTION_LATENCY_CYCLES);
        assert!(record.is_missing(FeatureName::InstructionLatencyAvg));
        assert!(record.is_missing(FeatureName::MemoryStallFraction));
    }

    #[test]
    fn test_zero_occupancy_is_unmeasured() {
        let samples = vec![ratio("occupancy_ratio", 0.0)];
        let record = CounterNormalizer::default().normalize(&samples).unwrap();
        assert!(record.is_missing(FeatureName::OccupancyRatio));
        assert!(record.is_missing(FeatureName::OccupancyDeficit));
        assert_eq!(record.get(FeatureName::OccupancyDeficit), 0.0);
    }

    #[test]
    fn test_unit_mismatch_rejected() {
        let samples = vec![CounterSample::kernel("total_cycles", 10.0, CounterUnit::Bytes)];
        let err = CounterNormalizer::default().normalize(&samples).unwrap_err();
        assert!(matches!(err, AdvisorError::InvalidSample { ref counter, .. } if counter == "total_cycles"));
    }

    #[test]
    fn test_out_of_range_ratio_rejected() {
        let samples = vec![ratio("compute_utilization", 85.0)];
        assert!(CounterNormalizer::default().normalize(&samples).is_err());

        let samples = vec![cycles("total_cycles", f64::INFINITY)];
        assert!(CounterNormalizer::default().normalize(&samples).is_err());
    }

    #[test]
    fn test_unknown_counters_ignored() {
        let samples = vec![CounterSample::kernel("l2_tex_hit_rate", 250.0, CounterUnit::Bytes)];
        let record = CounterNormalizer::default().normalize(&samples).unwrap();
        assert_eq!(record.missing_features().len(), FeatureName::ALL.len());
    }

    #[test]
    fn test_strict_mode_names_missing_counter() {
        let samples: Vec<CounterSample> = KNOWN_COUNTERS
            .iter()
            .filter(|(name, _)| *name != "stalled_cycles_sync")
            .map(|(name, unit)| CounterSample::kernel(*name, 0.5, *unit))
            .collect();
        let err = CounterNormalizer::new(true).normalize(&samples).unwrap_err();
        assert!(err.to_string().contains("stalled_cycles_sync"));
    }

    #[test]
    fn test_strict_mode_accepts_complete_batch() {
        let samples: Vec<CounterSample> = KNOWN_COUNTERS
            .iter()
            .map(|(name, unit)| CounterSample::kernel(*name, 0.5, *unit))
            .collect();
        let record = CounterNormalizer::new(true).normalize(&samples).unwrap();
        assert!(record.missing_features().is_empty());
    }
}
