//! Speedup estimation
//!
//! Two interchangeable strategies answer `estimate(features, category)`:
//! a learned model behind the [`SpeedupModel`] capability, and a heuristic
//! curve per category. The learned path is bounded by a timeout and falls
//! back to the heuristic on any failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::classifier::BottleneckCategory;
use crate::core::features::{FeatureKind, FeatureName, FeatureRecord};
use crate::error::{AdvisorError, Result};

/// Confidence never exceeds this when the heuristic answers for a failed model
pub const FALLBACK_CONFIDENCE_CEILING: f64 = 0.6;

/// Fixed confidence of the heuristic strategy
pub const HEURISTIC_CONFIDENCE: f64 = 0.5;

/// Half-width of the heuristic's fixed interval, in speedup units
pub const HEURISTIC_INTERVAL_HALF_WIDTH: f64 = 0.35;

/// Upper bound on confidence derived from model variance
pub const LEARNED_CONFIDENCE_CEILING: f64 = 0.95;

/// Two-sided 95% normal quantile
const INTERVAL_Z: f64 = 1.96;

/// Length of the vector handed to [`SpeedupModel::predict`]
pub const FEATURE_VECTOR_LEN: usize = FeatureName::ALL.len() + BottleneckCategory::ALL.len();

/// Which strategy produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Learned,
    Heuristic,
}

/// Predicted speedup ratio with its uncertainty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedupEstimate {
    pub point_estimate: f64,
    pub interval_low: f64,
    pub interval_high: f64,
    pub confidence: f64,
    pub source: EstimateSource,
}

impl SpeedupEstimate {
    /// Finite bounds with `interval_low <= point_estimate <= interval_high`,
    /// point at least 1.0, confidence in [0, 1]
    pub fn is_valid(&self) -> bool {
        self.point_estimate.is_finite()
            && self.interval_low.is_finite()
            && self.interval_high.is_finite()
            && self.point_estimate >= 1.0
            && self.interval_low <= self.point_estimate
            && self.point_estimate <= self.interval_high
            && (0.0..=1.0).contains(&self.confidence)
    }

    /// A point estimate of exactly 1.0 signals no measurable benefit
    pub fn has_benefit(&self) -> bool {
        self.point_estimate > 1.0
    }

    /// Predicted fractional gain, `point_estimate - 1`
    pub fn gain(&self) -> f64 {
        self.point_estimate - 1.0
    }
}

/// Raw answer of a model.
///
/// `point_estimate` is the speedup ratio; `variance` is the variance of its
/// natural logarithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub point_estimate: f64,
    pub variance: f64,
}

/// Inference-time capability required from any speedup model
pub trait SpeedupModel: Send + Sync + fmt::Debug {
    /// Identifier used in logs
    fn name(&self) -> &str;

    /// Predict from a feature vector laid out by [`feature_vector`]
    fn predict(&self, feature_vector: &[f64]) -> Result<Prediction>;
}

/// Feature values in [`FeatureName::ALL`] order followed by a one-hot category
pub fn feature_vector(features: &FeatureRecord, category: BottleneckCategory) -> Vec<f64> {
    let mut vector = features.to_vector();
    vector.extend(
        BottleneckCategory::ALL
            .iter()
            .map(|c| if *c == category { 1.0 } else { 0.0 }),
    );
    vector
}

/// Recover the category from the one-hot tail of a feature vector
pub fn decode_category(feature_vector: &[f64]) -> Result<BottleneckCategory> {
    if feature_vector.len() != FEATURE_VECTOR_LEN {
        return Err(AdvisorError::ModelUnavailable(format!(
            "feature vector has {} entries, expected {}",
            feature_vector.len(),
            FEATURE_VECTOR_LEN
        )));
    }
    let one_hot = &feature_vector[FeatureName::ALL.len()..];
    one_hot
        .iter()
        .position(|v| *v == 1.0)
        .map(|i| BottleneckCategory::ALL[i])
        .ok_or_else(|| AdvisorError::ModelUnavailable("feature vector has no category set".into()))
}

/// Per-category regression on log speedup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRegression {
    pub intercept: f64,
    #[serde(default)]
    pub weights: BTreeMap<FeatureName, f64>,
    pub residual_variance: f64,
}

/// Linear model: `ln(speedup) = intercept + sum(weight * feature)` per category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSpeedupModel {
    #[serde(default = "default_linear_name")]
    pub name: String,
    pub categories: BTreeMap<BottleneckCategory, CategoryRegression>,
}

fn default_linear_name() -> String {
    "linear".to_string()
}

impl SpeedupModel for LinearSpeedupModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, feature_vector: &[f64]) -> Result<Prediction> {
        let category = decode_category(feature_vector)?;
        let regression = self.categories.get(&category).ok_or_else(|| {
            AdvisorError::ModelUnavailable(format!("model {} has no row for {}", self.name, category))
        })?;

        let log_speedup = regression.intercept
            + FeatureName::ALL
                .iter()
                .zip(feature_vector)
                .map(|(name, value)| regression.weights.get(name).copied().unwrap_or(0.0) * value)
                .sum::<f64>();

        Ok(Prediction {
            point_estimate: log_speedup.exp(),
            variance: regression.residual_variance,
        })
    }
}

/// Averages members in log space; variance is the mean member variance plus
/// the spread of member means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    #[serde(default = "default_ensemble_name")]
    pub name: String,
    pub members: Vec<ModelArtifact>,
}

fn default_ensemble_name() -> String {
    "ensemble".to_string()
}

impl SpeedupModel for EnsembleModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, feature_vector: &[f64]) -> Result<Prediction> {
        let predictions: Vec<Prediction> = self
            .members
            .iter()
            .filter_map(|m| match m.predict(feature_vector) {
                Ok(p) if p.point_estimate > 0.0 => Some(p),
                Ok(_) => None,
                Err(e) => {
                    debug!("Ensemble member {} failed: {}", m.name(), e);
                    None
                }
            })
            .collect();

        if predictions.is_empty() {
            return Err(AdvisorError::ModelUnavailable(format!(
                "no member of {} produced a prediction",
                self.name
            )));
        }

        let n = predictions.len() as f64;
        let log_means: Vec<f64> = predictions.iter().map(|p| p.point_estimate.ln()).collect();
        let mean = log_means.iter().sum::<f64>() / n;
        let within = predictions.iter().map(|p| p.variance).sum::<f64>() / n;
        let between = log_means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;

        Ok(Prediction {
            point_estimate: mean.exp(),
            variance: within + between,
        })
    }
}

/// Closed registry of model artifacts, selected by the `kind` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Linear(LinearSpeedupModel),
    Ensemble(EnsembleModel),
}

impl ModelArtifact {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

impl SpeedupModel for ModelArtifact {
    fn name(&self) -> &str {
        match self {
            ModelArtifact::Linear(m) => m.name(),
            ModelArtifact::Ensemble(m) => m.name(),
        }
    }

    fn predict(&self, feature_vector: &[f64]) -> Result<Prediction> {
        match self {
            ModelArtifact::Linear(m) => m.predict(feature_vector),
            ModelArtifact::Ensemble(m) => m.predict(feature_vector),
        }
    }
}

/// Timed-out workers allowed to linger before calls fail fast
pub const DEFAULT_MAX_STALLED_WORKERS: usize = 4;

const WORKER_RUNNING: u8 = 0;
const WORKER_DONE: u8 = 1;
const WORKER_ABANDONED: u8 = 2;

/// Runs a model on a worker thread with a deadline.
///
/// A call that misses the deadline is retried `retries` times before the
/// model is reported unavailable. Model errors are not retried.
///
/// Threads cannot be cancelled, so a worker that misses its deadline keeps
/// running until the model returns. Such stalled workers are counted across
/// clones; once `max_stalled` of them are alive, calls report the model
/// unavailable without spawning another thread.
#[derive(Debug, Clone)]
pub struct TimedModel {
    inner: Arc<dyn SpeedupModel>,
    timeout: Duration,
    retries: u32,
    max_stalled: usize,
    stalled: Arc<AtomicUsize>,
}

impl TimedModel {
    pub fn new(inner: Arc<dyn SpeedupModel>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            retries: 1,
            max_stalled: DEFAULT_MAX_STALLED_WORKERS,
            stalled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_stalled_workers(mut self, max_stalled: usize) -> Self {
        self.max_stalled = max_stalled;
        self
    }

    /// Workers that missed their deadline and have not returned yet
    pub fn stalled_workers(&self) -> usize {
        self.stalled.load(Ordering::Acquire)
    }

    fn predict_once(&self, feature_vector: &[f64]) -> Option<Result<Prediction>> {
        let stalled = self.stalled_workers();
        if stalled >= self.max_stalled {
            return Some(Err(AdvisorError::ModelUnavailable(format!(
                "{} has {} stalled worker(s) still running",
                self.inner.name(),
                stalled
            ))));
        }

        let (tx, rx) = mpsc::channel();
        let model = Arc::clone(&self.inner);
        let vector = feature_vector.to_vec();
        let state = Arc::new(AtomicU8::new(WORKER_RUNNING));
        let worker_state = Arc::clone(&state);
        let worker_stalled = Arc::clone(&self.stalled);

        let spawned = std::thread::Builder::new()
            .name("gpa-model".to_string())
            .spawn(move || {
                let result = model.predict(&vector);
                let finished = worker_state.compare_exchange(
                    WORKER_RUNNING,
                    WORKER_DONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if finished.is_err() {
                    worker_stalled.fetch_sub(1, Ordering::AcqRel);
                }
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            return Some(Err(AdvisorError::ModelUnavailable(format!(
                "failed to start inference worker: {}",
                e
            ))));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Count before publishing the abandonment so the worker never decrements first
                self.stalled.fetch_add(1, Ordering::AcqRel);
                let abandoned = state.compare_exchange(
                    WORKER_RUNNING,
                    WORKER_ABANDONED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if abandoned.is_ok() {
                    return None;
                }
                // Answered right at the deadline; the send follows immediately
                self.stalled.fetch_sub(1, Ordering::AcqRel);
                rx.recv().ok()
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(AdvisorError::ModelUnavailable(
                "inference worker exited without an answer".to_string(),
            ))),
        }
    }
}

impl SpeedupModel for TimedModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn predict(&self, feature_vector: &[f64]) -> Result<Prediction> {
        for attempt in 0..=self.retries {
            match self.predict_once(feature_vector) {
                Some(result) => return result,
                None => warn!(
                    "Model {} timed out after {:?} (attempt {}/{})",
                    self.inner.name(),
                    self.timeout,
                    attempt + 1,
                    self.retries + 1
                ),
            }
        }
        Err(AdvisorError::ModelUnavailable(format!(
            "{} timed out after {} attempts",
            self.inner.name(),
            self.retries + 1
        )))
    }
}

/// Amdahl-style curve: removing a fraction `r` of the stall share `f`
/// yields `1 / (1 - r * f)`, capped at `max_speedup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicCurve {
    pub category: BottleneckCategory,
    pub driver: FeatureName,
    pub recoverable_fraction: f64,
    pub max_speedup: f64,
}

impl HeuristicCurve {
    pub fn new(
        category: BottleneckCategory,
        driver: FeatureName,
        recoverable_fraction: f64,
        max_speedup: f64,
    ) -> Self {
        Self {
            category,
            driver,
            recoverable_fraction,
            max_speedup,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.kind() != FeatureKind::Ratio {
            return Err(AdvisorError::Config(format!(
                "heuristic driver {} for {} must be a ratio feature",
                self.driver, self.category
            )));
        }
        if !(0.0..1.0).contains(&self.recoverable_fraction) {
            return Err(AdvisorError::Config(format!(
                "recoverable_fraction for {} must be in [0, 1)",
                self.category
            )));
        }
        if self.max_speedup.is_nan() || self.max_speedup < 1.0 {
            return Err(AdvisorError::Config(format!(
                "max_speedup for {} must be at least 1.0",
                self.category
            )));
        }
        Ok(())
    }

    /// Point speedup for a driver value; a missing driver gives exactly 1.0
    pub fn point(&self, features: &FeatureRecord) -> f64 {
        if features.is_missing(self.driver) {
            return 1.0;
        }
        let removed = self.recoverable_fraction * features.get(self.driver);
        let speedup = if removed >= 1.0 {
            self.max_speedup
        } else {
            1.0 / (1.0 - removed)
        };
        speedup.clamp(1.0, self.max_speedup)
    }
}

/// Default curve per category
pub fn default_heuristic_curves() -> Vec<HeuristicCurve> {
    use BottleneckCategory::*;
    vec![
        HeuristicCurve::new(MemoryDivergence, FeatureName::MemoryStallFraction, 0.5, 4.0),
        HeuristicCurve::new(Occupancy, FeatureName::OccupancyDeficit, 0.4, 2.0),
        HeuristicCurve::new(InstructionScheduling, FeatureName::ExecutionStallFraction, 0.4, 2.5),
        HeuristicCurve::new(Synchronization, FeatureName::SyncStallFraction, 0.6, 3.0),
        HeuristicCurve::new(Algorithmic, FeatureName::ComputeUtilization, 0.3, 2.0),
    ]
}

/// Speedup estimator holding the heuristic curves and an optional learned model
#[derive(Debug, Clone)]
pub struct SpeedupEstimator {
    curves: BTreeMap<BottleneckCategory, HeuristicCurve>,
    model: Option<Arc<dyn SpeedupModel>>,
}

impl Default for SpeedupEstimator {
    fn default() -> Self {
        Self::heuristic(default_heuristic_curves())
    }
}

impl SpeedupEstimator {
    /// Heuristic-only estimator
    pub fn heuristic(curves: impl IntoIterator<Item = HeuristicCurve>) -> Self {
        Self {
            curves: curves.into_iter().map(|c| (c.category, c)).collect(),
            model: None,
        }
    }

    /// Use a learned model first; the heuristic stays as fallback
    pub fn with_model(mut self, model: Arc<dyn SpeedupModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn strategy(&self) -> EstimateSource {
        if self.model.is_some() {
            EstimateSource::Learned
        } else {
            EstimateSource::Heuristic
        }
    }

    pub fn supports(&self, category: BottleneckCategory) -> bool {
        self.curves.contains_key(&category)
    }

    pub fn estimate(&self, features: &FeatureRecord, category: BottleneckCategory) -> Result<SpeedupEstimate> {
        let curve = self
            .curves
            .get(&category)
            .ok_or(AdvisorError::UnsupportedCategory(category))?;

        let Some(model) = &self.model else {
            return Ok(heuristic_estimate(curve, features, HEURISTIC_CONFIDENCE));
        };

        let learned = model
            .predict(&feature_vector(features, category))
            .and_then(|prediction| learned_estimate(prediction, model.name()));

        match learned {
            Ok(estimate) => Ok(estimate),
            Err(e) => {
                warn!("Falling back to heuristic for {}: {}", category, e);
                Ok(heuristic_estimate(
                    curve,
                    features,
                    HEURISTIC_CONFIDENCE.min(FALLBACK_CONFIDENCE_CEILING),
                ))
            }
        }
    }

    /// Estimates for several categories
    pub fn estimate_all(
        &self,
        features: &FeatureRecord,
        categories: impl IntoIterator<Item = BottleneckCategory>,
    ) -> Result<BTreeMap<BottleneckCategory, SpeedupEstimate>> {
        categories
            .into_iter()
            .map(|c| self.estimate(features, c).map(|e| (c, e)))
            .collect()
    }
}

fn heuristic_estimate(curve: &HeuristicCurve, features: &FeatureRecord, confidence: f64) -> SpeedupEstimate {
    let point = curve.point(features);
    SpeedupEstimate {
        point_estimate: point,
        interval_low: point - HEURISTIC_INTERVAL_HALF_WIDTH,
        interval_high: point + HEURISTIC_INTERVAL_HALF_WIDTH,
        confidence,
        source: EstimateSource::Heuristic,
    }
}

fn learned_estimate(prediction: Prediction, model_name: &str) -> Result<SpeedupEstimate> {
    let Prediction { point_estimate, variance } = prediction;
    if !point_estimate.is_finite() || point_estimate <= 0.0 || !variance.is_finite() || variance < 0.0 {
        return Err(AdvisorError::ModelUnavailable(format!(
            "{} returned an invalid prediction ({}, {})",
            model_name, point_estimate, variance
        )));
    }

    let sigma = variance.sqrt();
    let spread = (INTERVAL_Z * sigma).exp();
    let point = point_estimate.max(1.0);
    let interval_low = (point_estimate / spread).min(point);
    let interval_high = (point_estimate * spread).max(point);

    if !spread.is_finite() || !interval_low.is_finite() || !interval_high.is_finite() {
        return Err(AdvisorError::ModelUnavailable(format!(
            "{} returned a variance too large for a finite interval ({})",
            model_name, variance
        )));
    }

    Ok(SpeedupEstimate {
        point_estimate: point,
        interval_low,
        interval_high,
        confidence: (-2.0 * sigma).exp().min(LEARNED_CONFIDENCE_CEILING),
        source: EstimateSource::Learned,
    })
}
