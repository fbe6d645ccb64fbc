//! Cross-kernel comparison of finished reports

use serde::Serialize;
use std::fmt::Write as _;

use crate::core::classifier::BottleneckCategory;
use crate::core::ranker::Priority;
use crate::core::report::Report;

/// Headline numbers for one kernel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelComparison {
    pub kernel_id: String,
    pub dominant_category: Option<BottleneckCategory>,
    pub best_recommendation: Option<String>,
    pub best_speedup: Option<f64>,
    pub top_priority: Option<Priority>,
    pub best_impact: f64,
}

/// Kernels ordered by how much there is to gain
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Comparison {
    pub kernels: Vec<KernelComparison>,
}

impl KernelComparison {
    fn from_report(report: &Report) -> Self {
        let top = report.top_recommendation();
        let best_speedup = report
            .recommendations()
            .iter()
            .map(|r| r.estimated_speedup.point_estimate)
            .max_by(f64::total_cmp);

        Self {
            kernel_id: report.kernel_id().to_string(),
            dominant_category: report.breakdown().dominant(),
            best_recommendation: top.map(|r| r.id.clone()),
            best_speedup,
            top_priority: top.map(|r| r.priority),
            best_impact: top.map(|r| r.impact_score).unwrap_or(0.0),
        }
    }
}

/// Summarize reports, highest best-impact first, ties by kernel id
pub fn compare_reports(reports: &[Report]) -> Comparison {
    let mut kernels: Vec<KernelComparison> = reports.iter().map(KernelComparison::from_report).collect();
    kernels.sort_by(|a, b| {
        b.best_impact
            .total_cmp(&a.best_impact)
            .then_with(|| a.kernel_id.cmp(&b.kernel_id))
    });
    Comparison { kernels }
}

impl Comparison {
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:<24} {:<28} {:>8} {:>9}",
            "KERNEL", "BOTTLENECK", "BEST RECOMMENDATION", "SPEEDUP", "PRIORITY"
        );
        for k in &self.kernels {
            let _ = writeln!(
                out,
                "{:<24} {:<24} {:<28} {:>8} {:>9}",
                k.kernel_id,
                k.dominant_category.map(|c| c.as_str()).unwrap_or("-"),
                k.best_recommendation.as_deref().unwrap_or("-"),
                k.best_speedup
                    .map(|s| format!("{:.2}x", s))
                    .unwrap_or_else(|| "-".to_string()),
                k.top_priority
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
        out
    }
}
