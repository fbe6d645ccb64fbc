//! End-to-end tests for the analysis pipeline

use gpa::{
    Advisor, AdvisorConfig, AdvisorError, BottleneckCategory, CounterSample, CounterUnit, EstimateSource,
    FeatureName, Priority, SampleBatch,
};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn fixture_batches() -> Vec<SampleBatch> {
    SampleBatch::load(&fixture("kernels.json")).expect("fixture should parse")
}

fn memory_bound() -> SampleBatch {
    fixture_batches().remove(0)
}

#[test]
fn test_memory_bound_kernel() {
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let report = advisor.analyze(&memory_bound()).unwrap();

    let breakdown = report.breakdown();
    assert!(!breakdown.no_bottleneck_detected);
    assert_eq!(breakdown.dominant(), Some(BottleneckCategory::MemoryDivergence));
    assert!((breakdown.total_weight() - 1.0).abs() < 1e-6);

    let top = report.top_recommendation().expect("memory-bound kernel should get advice");
    assert_eq!(top.category, BottleneckCategory::MemoryDivergence);
    assert!(matches!(top.priority, Priority::Critical | Priority::High));
    assert!(top.estimated_speedup.point_estimate > 1.0);

    for rec in report.recommendations() {
        let est = &rec.estimated_speedup;
        assert!(est.interval_low <= est.point_estimate && est.point_estimate <= est.interval_high);
        assert!(est.point_estimate >= 1.0);
        assert!((0.0..=1.0).contains(&rec.confidence));
    }

    let impacts: Vec<f64> = report.recommendations().iter().map(|r| r.impact_score).collect();
    assert!(impacts.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_widest_scope_and_duplicate_averaging() {
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let report = advisor.analyze(&fixture_batches()[1]).unwrap();

    let features = report.feature_record();
    assert_eq!(features.get(FeatureName::SyncStallFraction), 0.5);
    assert_eq!(features.get(FeatureName::OccupancyRatio), 0.5);
    assert!(features.is_missing(FeatureName::ExecutionStallFraction));
    assert_eq!(report.breakdown().dominant(), Some(BottleneckCategory::Synchronization));
}

#[test]
fn test_all_counters_missing_non_strict() {
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let report = advisor.analyze(&SampleBatch::new("empty", Vec::new())).unwrap();

    assert_eq!(report.feature_record().missing_features().len(), FeatureName::ALL.len());
    assert_eq!(report.feature_record().get(FeatureName::InstructionLatencyAvg), 4.0);
    assert!(report.breakdown().no_bottleneck_detected);
    assert!(report.breakdown().dominance.is_empty());
    assert!(report.recommendations().is_empty());
}

#[test]
fn test_all_counters_zero() {
    let samples = vec![
        CounterSample::kernel("total_cycles", 0.0, CounterUnit::Cycles),
        CounterSample::kernel("stalled_cycles_memory", 0.0, CounterUnit::Cycles),
        CounterSample::kernel("occupancy_ratio", 0.0, CounterUnit::Ratio),
    ];
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let report = advisor.analyze(&SampleBatch::new("zeros", samples)).unwrap();

    assert!(report.breakdown().no_bottleneck_detected);
    assert!(report.recommendations().is_empty());
}

#[test]
fn test_strict_mode_rejects_missing_counter() {
    let config = AdvisorConfig {
        strict_mode: true,
        ..AdvisorConfig::default()
    };
    let advisor = Advisor::new(config).unwrap();
    let batch = SampleBatch::new(
        "partial",
        vec![
            CounterSample::kernel("total_cycles", 1000.0, CounterUnit::Cycles),
            CounterSample::kernel("stalled_cycles_memory", 700.0, CounterUnit::Cycles),
        ],
    );

    match advisor.analyze(&batch) {
        Err(AdvisorError::InvalidSample { counter, .. }) => {
            assert!(counter.contains("stalled_cycles_sync"));
        }
        other => panic!("expected InvalidSample, got {:?}", other),
    }
}

#[test]
fn test_unit_mismatch_is_rejected() {
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let batch = SampleBatch::new(
        "bad_units",
        vec![CounterSample::kernel("total_cycles", 1000.0, CounterUnit::Bytes)],
    );
    assert!(matches!(
        advisor.analyze(&batch),
        Err(AdvisorError::InvalidSample { .. })
    ));
}

#[test]
fn test_analysis_is_deterministic() {
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let batch = memory_bound();

    let first = advisor.analyze(&batch).unwrap();
    let second = advisor.analyze(&batch).unwrap();

    assert_eq!(first.recommendations(), second.recommendations());
    assert_eq!(first.breakdown(), second.breakdown());
    assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
}

#[test]
fn test_learned_model_with_partial_coverage() {
    let mut model_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        model_file,
        r#"{{
            "kind": "linear",
            "name": "memory_only",
            "categories": {{
                "memory_divergence": {{ "intercept": 0.5877866649, "residual_variance": 0.01 }}
            }}
        }}"#
    )
    .unwrap();

    let config = AdvisorConfig {
        model_path: Some(model_file.path().to_path_buf()),
        ..AdvisorConfig::default()
    };
    let advisor = Advisor::new(config).unwrap();
    assert_eq!(advisor.estimation_strategy(), EstimateSource::Learned);

    let report = advisor.analyze(&memory_bound()).unwrap();
    let top = report.top_recommendation().unwrap();
    assert_eq!(top.category, BottleneckCategory::MemoryDivergence);
    assert_eq!(top.estimated_speedup.source, EstimateSource::Learned);
    assert_eq!(top.priority, Priority::Critical);
    assert!((top.estimated_speedup.point_estimate - 1.8).abs() < 1e-6);

    for rec in report.recommendations() {
        if rec.category != BottleneckCategory::MemoryDivergence {
            assert_eq!(rec.estimated_speedup.source, EstimateSource::Heuristic);
            assert!(rec.confidence <= 0.6);
        }
    }
}

#[test]
fn test_report_json_shape() {
    let advisor = Advisor::new(AdvisorConfig::default()).unwrap();
    let report = advisor.analyze(&memory_bound()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();

    assert_eq!(json["kernel_id"], "spmv_csr");
    assert!(json["feature_record"]["features"]["memory_stall_fraction"].is_number());
    assert_eq!(json["breakdown"]["dominance"][0], "memory_divergence");
    assert!(json["recommendations"][0]["priority"].is_string());
    assert!(json.get("truncated").is_none());
}
