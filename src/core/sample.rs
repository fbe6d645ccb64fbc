// Counter samples as delivered by the profiler collaborator
// One sample per counter reading; batches are keyed by kernel invocation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::Result;

/// Unit a counter value is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterUnit {
    Cycles,
    Bytes,
    Count,
    Ratio,
}

impl fmt::Display for CounterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CounterUnit::Cycles => "cycles",
            CounterUnit::Bytes => "bytes",
            CounterUnit::Count => "count",
            CounterUnit::Ratio => "ratio",
        };
        f.write_str(name)
    }
}

/// Granularity a counter was collected at.
///
/// Variants are declared narrowest first so that `Ord` ranks the widest scope highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterScope {
    Warp,
    Block,
    Kernel,
}

/// One raw measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    pub counter_name: String,
    pub value: f64,
    pub unit: CounterUnit,
    pub scope: CounterScope,
}

impl CounterSample {
    pub fn new(counter_name: impl Into<String>, value: f64, unit: CounterUnit, scope: CounterScope) -> Self {
        Self {
            counter_name: counter_name.into(),
            value,
            unit,
            scope,
        }
    }

    /// Kernel-scope sample, the common case for CUPTI metric exports
    pub fn kernel(counter_name: impl Into<String>, value: f64, unit: CounterUnit) -> Self {
        Self::new(counter_name, value, unit, CounterScope::Kernel)
    }
}

/// All samples captured for one kernel invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub kernel_id: String,
    pub samples: Vec<CounterSample>,
}

impl SampleBatch {
    pub fn new(kernel_id: impl Into<String>, samples: Vec<CounterSample>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            samples,
        }
    }

    /// Parse either a single batch object or an array of batches
    pub fn parse_many(json: &str) -> Result<Vec<SampleBatch>> {
        Ok(SampleDocument::parse(json)?.into_batches())
    }

    /// Load batches from a JSON file
    pub fn load(path: &Path) -> Result<Vec<SampleBatch>> {
        Ok(SampleDocument::load(path)?.into_batches())
    }
}

/// A samples file as written: one batch object or an array of batches
#[derive(Debug, Clone, PartialEq)]
pub enum SampleDocument {
    Single(SampleBatch),
    Many(Vec<SampleBatch>),
}

impl SampleDocument {
    pub fn parse(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let document = if value.is_array() {
            SampleDocument::Many(serde_json::from_value(value)?)
        } else {
            SampleDocument::Single(serde_json::from_value(value)?)
        };
        Ok(document)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// True when the input was an array, even of one element
    pub fn is_many(&self) -> bool {
        matches!(self, SampleDocument::Many(_))
    }

    pub fn batches(&self) -> &[SampleBatch] {
        match self {
            SampleDocument::Single(batch) => std::slice::from_ref(batch),
            SampleDocument::Many(batches) => batches,
        }
    }

    pub fn into_batches(self) -> Vec<SampleBatch> {
        match self {
            SampleDocument::Single(batch) => vec![batch],
            SampleDocument::Many(batches) => batches,
        }
    }
}
