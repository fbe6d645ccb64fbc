//! gpa - GPU kernel performance advisor
//!
//! Turns raw hardware performance counters captured for a kernel invocation
//! into a bottleneck breakdown and a ranked list of optimization
//! recommendations, each with an estimated speedup and confidence.

/// Error handling and result types
pub mod error;
/// Pipeline stages: normalization, classification, estimation, ranking and reporting
pub mod core;
/// Advisor configuration
pub mod config;
/// Pipeline orchestration and batch analysis
pub mod advisor;
/// Cross-kernel comparison
pub mod compare;

pub use crate::advisor::{Advisor, BatchOutcome};
pub use crate::compare::{compare_reports, Comparison, KernelComparison};
pub use crate::config::{AdvisorConfig, ModelStrategy};
pub use crate::core::classifier::{BottleneckBreakdown, BottleneckCategory, BottleneckClassifier};
pub use crate::core::estimator::{
    EstimateSource, ModelArtifact, Prediction, SpeedupEstimate, SpeedupEstimator, SpeedupModel,
};
pub use crate::core::features::{FeatureName, FeatureRecord};
pub use crate::core::normalizer::CounterNormalizer;
pub use crate::core::ranker::{Priority, Recommendation, RecommendationRanker, TransformationTemplate};
pub use crate::core::report::{Report, TextRole};
pub use crate::core::sample::{CounterSample, CounterScope, CounterUnit, SampleBatch, SampleDocument};
pub use crate::error::{AdvisorError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
