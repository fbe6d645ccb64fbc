//! Error types for the GPU performance advisor

use thiserror::Error;

use crate::core::classifier::BottleneckCategory;

/// Main error type for advisor operations
#[derive(Error, Debug)]
pub enum AdvisorError {
    /// Malformed or mismatched-unit counter input; analysis of the kernel aborts
    #[error("Invalid counter sample `{counter}`: {reason}")]
    InvalidSample {
        /// Counter name the problem was found on
        counter: String,
        /// What was wrong with it
        reason: String,
    },

    /// No estimator strategy is registered for a category referenced by the catalog
    #[error("No speedup strategy registered for category `{0}`")]
    UnsupportedCategory(BottleneckCategory),

    /// Internal invariant violated while assembling a report
    #[error("Inconsistent advisor state: {0}")]
    InconsistentState(String),

    /// Learned model could not answer; always converted to a heuristic fallback
    #[error("Speedup model unavailable: {0}")]
    ModelUnavailable(String),

    /// Configuration value out of range or contradictory
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while reading inputs, configuration or model artifacts
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse failure
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for advisor operations
pub type Result<T> = std::result::Result<T, AdvisorError>;

impl AdvisorError {
    /// Shorthand for an [`AdvisorError::InvalidSample`]
    pub fn invalid_sample(counter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSample {
            counter: counter.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is handled inside the engine rather than surfaced
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }

    /// Check if this error points at a configuration problem rather than bad input
    pub fn is_configuration_fault(&self) -> bool {
        matches!(self, Self::UnsupportedCategory(_) | Self::Config(_) | Self::Toml(_))
    }
}
