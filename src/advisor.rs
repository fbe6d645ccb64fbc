//! Analysis pipeline
//!
//! Samples flow through normalization, classification, estimation and
//! ranking before being packaged into a [`Report`]. Each stage is a pure
//! function of its inputs and the configuration fixed at construction, so a
//! single [`Advisor`] can serve many kernels concurrently.

use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{AdvisorConfig, ModelStrategy};
use crate::core::classifier::{BottleneckCategory, BottleneckClassifier};
use crate::core::estimator::{EstimateSource, ModelArtifact, SpeedupEstimator, SpeedupModel, TimedModel};
use crate::core::normalizer::CounterNormalizer;
use crate::core::ranker::RecommendationRanker;
use crate::core::report::{self, Report};
use crate::core::sample::SampleBatch;
use crate::error::Result;

/// Outcome of one kernel in a batch run
#[derive(Debug)]
pub struct BatchOutcome {
    pub kernel_id: String,
    pub result: Result<Report>,
}

/// Performance advisor for GPU kernel invocations
#[derive(Debug, Clone)]
pub struct Advisor {
    config: Arc<AdvisorConfig>,
    normalizer: CounterNormalizer,
    classifier: BottleneckClassifier,
    estimator: SpeedupEstimator,
    ranker: RecommendationRanker,
}

impl Advisor {
    /// Build an advisor, loading the learned model when the strategy asks for one
    pub fn new(config: AdvisorConfig) -> Result<Self> {
        config.validate()?;
        let model = resolve_model(&config);
        Ok(Self::build(Arc::new(config), model))
    }

    /// Build an advisor around an already constructed model
    pub fn with_model(config: AdvisorConfig, model: Arc<dyn SpeedupModel>) -> Result<Self> {
        config.validate()?;
        let timed: Arc<dyn SpeedupModel> = Arc::new(TimedModel::new(model, config.model_timeout()));
        Ok(Self::build(Arc::new(config), Some(timed)))
    }

    fn build(config: Arc<AdvisorConfig>, model: Option<Arc<dyn SpeedupModel>>) -> Self {
        let mut estimator = SpeedupEstimator::heuristic(config.heuristic_curves.iter().cloned());
        if let Some(model) = model {
            estimator = estimator.with_model(model);
        }

        Self {
            normalizer: CounterNormalizer::new(config.strict_mode),
            classifier: BottleneckClassifier::new(
                config.bottleneck_weight_table.clone(),
                config.negligible_threshold,
            ),
            estimator,
            ranker: RecommendationRanker::new(config.priority_thresholds, config.negligible_threshold)
                .with_max_recommendations(config.max_recommendations),
            config,
        }
    }

    pub fn config(&self) -> &AdvisorConfig {
        &self.config
    }

    /// Strategy used for estimates before any per-call fallback
    pub fn estimation_strategy(&self) -> EstimateSource {
        self.estimator.strategy()
    }

    /// Analyze one kernel invocation
    pub fn analyze(&self, batch: &SampleBatch) -> Result<Report> {
        let start = Instant::now();

        let features = self.normalizer.normalize(&batch.samples)?;
        let breakdown = self.classifier.classify(&features);

        let catalog_categories: BTreeSet<BottleneckCategory> = self
            .config
            .transformation_catalog
            .iter()
            .map(|t| t.category)
            .collect();
        let targeted = breakdown
            .weights
            .iter()
            .filter(|(category, weight)| {
                **weight > self.config.negligible_threshold && catalog_categories.contains(*category)
            })
            .map(|(category, _)| *category);
        let estimates = self.estimator.estimate_all(&features, targeted)?;

        let ranking = self
            .ranker
            .rank(&breakdown, &estimates, &self.config.transformation_catalog)?;
        let report = report::assemble(&batch.kernel_id, features, breakdown, ranking)?;

        info!(
            "Analyzed {} in {:?}: {} recommendation(s), dominant {}",
            batch.kernel_id,
            start.elapsed(),
            report.recommendations().len(),
            report
                .breakdown()
                .dominant()
                .map(|c| c.as_str())
                .unwrap_or("none")
        );

        Ok(report)
    }

    /// Analyze many kernels in parallel; results keep input order
    pub fn analyze_batch(&self, batches: &[SampleBatch]) -> Vec<BatchOutcome> {
        let outcomes: Vec<BatchOutcome> = batches
            .par_iter()
            .map(|batch| BatchOutcome {
                kernel_id: batch.kernel_id.clone(),
                result: self.analyze(batch),
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            warn!("{} of {} kernel(s) failed analysis", failed, outcomes.len());
        }
        outcomes
    }
}

fn resolve_model(config: &AdvisorConfig) -> Option<Arc<dyn SpeedupModel>> {
    let path = match (config.model_strategy, &config.model_path) {
        (ModelStrategy::Heuristic, _) => return None,
        (_, Some(path)) => path,
        (_, None) => {
            debug!("No model artifact configured, using heuristic estimates");
            return None;
        }
    };

    match ModelArtifact::load(path) {
        Ok(artifact) => {
            info!("Loaded speedup model {} from {}", artifact.name(), path.display());
            let inner: Arc<dyn SpeedupModel> = Arc::new(artifact);
            Some(Arc::new(TimedModel::new(inner, config.model_timeout())))
        }
        Err(e) => {
            warn!(
                "Could not load speedup model from {}: {}; using heuristic estimates",
                path.display(),
                e
            );
            None
        }
    }
}
