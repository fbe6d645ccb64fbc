//! Report assembly
//!
//! Packages the outputs of one analysis run into an immutable [`Report`].
//! Assembly either fully succeeds or fails; no partial report is produced.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::classifier::BottleneckBreakdown;
use crate::core::features::{FeatureName, FeatureRecord};
use crate::core::ranker::{Priority, Ranking, Recommendation};
use crate::error::{AdvisorError, Result};

/// Result of analyzing one kernel invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    kernel_id: String,
    feature_record: FeatureRecord,
    breakdown: BottleneckBreakdown,
    recommendations: Vec<Recommendation>,
    /// Milliseconds since the Unix epoch
    generated_at: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
}

#[derive(Serialize)]
struct FingerprintView<'a> {
    kernel_id: &'a str,
    feature_record: &'a FeatureRecord,
    breakdown: &'a BottleneckBreakdown,
    recommendations: &'a [Recommendation],
    truncated: bool,
}

impl Report {
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn feature_record(&self) -> &FeatureRecord {
        &self.feature_record
    }

    pub fn breakdown(&self) -> &BottleneckBreakdown {
        &self.breakdown
    }

    pub fn recommendations(&self) -> &[Recommendation] {
        &self.recommendations
    }

    pub fn generated_at(&self) -> u64 {
        self.generated_at
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn top_recommendation(&self) -> Option<&Recommendation> {
        self.recommendations.first()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// SHA-256 over everything except `generated_at`
    pub fn fingerprint(&self) -> Result<String> {
        let view = FingerprintView {
            kernel_id: &self.kernel_id,
            feature_record: &self.feature_record,
            breakdown: &self.breakdown,
            recommendations: &self.recommendations,
            truncated: self.truncated,
        };
        let bytes = serde_json::to_vec(&view)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Human-readable summary
    pub fn render_text(&self) -> String {
        self.render_styled(|_, text| text.to_string())
    }

    /// Same layout as [`Report::render_text`], with `style` applied to each
    /// highlighted fragment
    pub fn render_styled(&self, style: impl Fn(TextRole, &str) -> String) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} {}", style(TextRole::Heading, "Kernel:"), self.kernel_id);

        let missing = self.feature_record.missing_features();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(FeatureName::as_str).collect();
            let _ = writeln!(out, "{} {}", style(TextRole::Warning, "Imputed features:"), names.join(", "));
        }

        let _ = writeln!(out, "\n{}", style(TextRole::Section, "Bottleneck breakdown:"));
        if self.breakdown.no_bottleneck_detected {
            out.push_str("  • No attributable bottleneck detected\n");
        } else {
            for category in &self.breakdown.dominance {
                let _ = writeln!(
                    out,
                    "  • {:<24} {:>5.1}%",
                    category.as_str(),
                    self.breakdown.weight(*category) * 100.0
                );
            }
        }

        let _ = writeln!(out, "\n{}", style(TextRole::Section, "Recommendations:"));
        if self.recommendations.is_empty() {
            out.push_str("  • None\n");
        }
        for (i, rec) in self.recommendations.iter().enumerate() {
            let est = &rec.estimated_speedup;
            let label = rec.priority.to_string();
            let _ = writeln!(
                out,
                "  {}. [{}] {} ({})\n     {:.2}x (range {:.2}x - {:.2}x), confidence {:.0}%, impact {:.3}",
                i + 1,
                style(TextRole::Priority(rec.priority), &label),
                rec.description,
                rec.category,
                est.point_estimate,
                est.interval_low,
                est.interval_high,
                rec.confidence * 100.0,
                rec.impact_score
            );
        }
        if self.truncated {
            let _ = writeln!(out, "  {}", style(TextRole::Note, "(list truncated)"));
        }

        out
    }
}

/// Kind of fragment handed to the styling hook of [`Report::render_styled`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRole {
    Heading,
    Section,
    Warning,
    Priority(Priority),
    Note,
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a report stamped with the current time
pub fn assemble(
    kernel_id: &str,
    feature_record: FeatureRecord,
    breakdown: BottleneckBreakdown,
    ranking: Ranking,
) -> Result<Report> {
    assemble_at(kernel_id, feature_record, breakdown, ranking, now_millis())
}

/// Build a report with an explicit timestamp
pub fn assemble_at(
    kernel_id: &str,
    feature_record: FeatureRecord,
    breakdown: BottleneckBreakdown,
    ranking: Ranking,
    generated_at: u64,
) -> Result<Report> {
    if !breakdown.is_consistent() {
        return Err(AdvisorError::InconsistentState(format!(
            "breakdown for {} violates the weight invariant (total {})",
            kernel_id,
            breakdown.total_weight()
        )));
    }

    for rec in &ranking.recommendations {
        if breakdown.weight(rec.category) <= 0.0 {
            return Err(AdvisorError::InconsistentState(format!(
                "recommendation {} references category {} absent from the breakdown",
                rec.id, rec.category
            )));
        }
        if !rec.estimated_speedup.is_valid() {
            return Err(AdvisorError::InconsistentState(format!(
                "recommendation {} carries an invalid speedup estimate",
                rec.id
            )));
        }
    }

    Ok(Report {
        kernel_id: kernel_id.to_string(),
        feature_record,
        breakdown,
        recommendations: ranking.recommendations,
        generated_at,
        truncated: ranking.truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{BottleneckCategory, BottleneckClassifier};
    use crate::core::estimator::{EstimateSource, SpeedupEstimate};

    fn memory_features() -> FeatureRecord {
        FeatureRecord::from_values([
            (FeatureName::MemoryStallFraction, 0.8),
            (FeatureName::OccupancyDeficit, 0.1),
        ])
    }

    fn recommendation(category: BottleneckCategory, point: f64) -> Recommendation {
        Recommendation {
            id: "global_memory_coalesce".to_string(),
            category,
            description: "Coalesce accesses".to_string(),
            priority: Priority::High,
            estimated_speedup: SpeedupEstimate {
                point_estimate: point,
                interval_low: point - 0.35,
                interval_high: point + 0.35,
                confidence: 0.5,
                source: EstimateSource::Heuristic,
            },
            confidence: 0.5,
            impact_score: 0.2,
        }
    }

    fn ranking(recs: Vec<Recommendation>) -> Ranking {
        Ranking { recommendations: recs, truncated: false }
    }

    #[test]
    fn test_assemble_idempotent_except_timestamp() {
        let features = memory_features();
        let breakdown = BottleneckClassifier::default().classify(&features);
        let recs = ranking(vec![recommendation(BottleneckCategory::MemoryDivergence, 1.6)]);

        let a = assemble_at("k", features.clone(), breakdown.clone(), recs.clone(), 1).unwrap();
        let b = assemble_at("k", features, breakdown, recs, 2).unwrap();

        assert_ne!(a, b);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.recommendations(), b.recommendations());
    }

    #[test]
    fn test_unknown_category_is_inconsistent() {
        let features = memory_features();
        let breakdown = BottleneckClassifier::default().classify(&features);
        let recs = ranking(vec![recommendation(BottleneckCategory::Synchronization, 1.6)]);
        let err = assemble("k", features, breakdown, recs).unwrap_err();
        assert!(matches!(err, AdvisorError::InconsistentState(_)));
    }

    #[test]
    fn test_recommendation_without_bottleneck_is_inconsistent() {
        let recs = ranking(vec![recommendation(BottleneckCategory::MemoryDivergence, 1.6)]);
        let err = assemble(
            "k",
            FeatureRecord::all_defaults(),
            BottleneckBreakdown::none_detected(),
            recs,
        )
        .unwrap_err();
        assert!(matches!(err, AdvisorError::InconsistentState(_)));
    }

    #[test]
    fn test_invalid_estimate_is_inconsistent() {
        let features = memory_features();
        let breakdown = BottleneckClassifier::default().classify(&features);
        let recs = ranking(vec![recommendation(BottleneckCategory::MemoryDivergence, 0.7)]);
        assert!(assemble("k", features, breakdown, recs).is_err());
    }

    #[test]
    fn test_json_field_names() {
        let report = assemble(
            "bfs_kernel",
            FeatureRecord::all_defaults(),
            BottleneckBreakdown::none_detected(),
            Ranking::default(),
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["breakdown", "feature_record", "generated_at", "kernel_id", "recommendations"]
        );
        assert!(report.render_text().contains("No attributable bottleneck"));
    }

    #[test]
    fn test_styled_rendering_shares_layout() {
        let features = memory_features();
        let breakdown = BottleneckClassifier::default().classify(&features);
        let recs = ranking(vec![recommendation(BottleneckCategory::MemoryDivergence, 1.6)]);
        let report = assemble_at("k", features, breakdown, recs, 0).unwrap();

        let plain = report.render_text();
        let marked = report.render_styled(|role, text| match role {
            TextRole::Priority(_) => format!("<{}>", text),
            _ => text.to_string(),
        });

        assert_eq!(marked.replace("<HIGH>", "HIGH"), plain);
        assert!(marked.contains("[<HIGH>] Coalesce accesses"));
    }

    #[test]
    fn test_truncated_flag_serialized_when_set() {
        let features = memory_features();
        let breakdown = BottleneckClassifier::default().classify(&features);
        let recs = Ranking {
            recommendations: vec![recommendation(BottleneckCategory::MemoryDivergence, 1.6)],
            truncated: true,
        };
        let report = assemble("k", features, breakdown, recs).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["truncated"], true);
        assert!(report.render_text().contains("truncated"));
    }
}
