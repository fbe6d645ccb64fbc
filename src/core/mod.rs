//! Analysis stages of the advisor pipeline

pub mod sample;
pub mod features;
pub mod normalizer;
pub mod classifier;
pub mod estimator;
pub mod ranker;
pub mod report;
