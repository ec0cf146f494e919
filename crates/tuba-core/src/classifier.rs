//! Batch readiness thresholds and classification.
//!
//! A batch is ready for distillation when its sugar content, alcohol
//! content and temperature all sit inside the configured thresholds. The
//! thresholds are policy, not batch history: readiness is recomputed from the
//! current measurements every time it is asked for.
//!
//! # Example
//!
//! ```
//! use tuba_core::{ReadinessPolicy, Readiness};
//!
//! let policy = ReadinessPolicy::default();
//! assert_eq!(policy.classify(16.0, 22.0, 30.0), Readiness::Ready);
//! assert_eq!(policy.classify(14.9, 22.0, 30.0), Readiness::NotReady);
//! assert_eq!(policy.classify(16.0, 22.0, f64::NAN), Readiness::NotReady);
//! ```

use serde::{Deserialize, Serialize};

use tuba_types::{Batch, Readiness};

use crate::error::{Error, Result};

/// Thresholds a batch must meet to be considered ready.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Minimum sugar content in °Bx (inclusive).
    pub brix_min: f64,
    /// Minimum alcohol content in percent (inclusive).
    pub alcohol_min: f64,
    /// Lowest acceptable temperature in °C (inclusive).
    pub temperature_min: f64,
    /// Highest acceptable temperature in °C (inclusive).
    pub temperature_max: f64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            brix_min: 15.0,
            alcohol_min: 20.0,
            temperature_min: 28.0,
            temperature_max: 35.0,
        }
    }
}

impl ReadinessPolicy {
    /// Classify a set of measurements.
    ///
    /// Missing values are passed as NaN and always yield
    /// [`Readiness::NotReady`]. NaN fails every comparison, so no separate
    /// check is needed.
    #[must_use]
    pub fn classify(&self, brix: f64, alcohol: f64, temperature: f64) -> Readiness {
        let ready = brix >= self.brix_min
            && alcohol >= self.alcohol_min
            && temperature >= self.temperature_min
            && temperature <= self.temperature_max;

        if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    /// Classify measurements that may be absent.
    #[must_use]
    pub fn classify_optional(
        &self,
        brix: Option<f64>,
        alcohol: Option<f64>,
        temperature: Option<f64>,
    ) -> Readiness {
        self.classify(
            brix.unwrap_or(f64::NAN),
            alcohol.unwrap_or(f64::NAN),
            temperature.unwrap_or(f64::NAN),
        )
    }

    /// Classify a batch from its current measurements.
    #[must_use]
    pub fn classify_batch(&self, batch: &Batch) -> Readiness {
        self.classify_optional(batch.brix, batch.alcohol, batch.temperature)
    }

    /// Count ready and not-ready batches.
    #[must_use]
    pub fn summarize(&self, batches: &[Batch]) -> ReadinessSummary {
        let ready = batches
            .iter()
            .filter(|b| self.classify_batch(b).is_ready())
            .count();
        ReadinessSummary {
            total: batches.len(),
            ready,
            not_ready: batches.len() - ready,
        }
    }

    /// Check the policy for inverted or non-finite bounds.
    pub fn validate(&self) -> Result<()> {
        let values = [
            self.brix_min,
            self.alcohol_min,
            self.temperature_min,
            self.temperature_max,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig(
                "readiness thresholds must be finite numbers".to_string(),
            ));
        }
        if self.temperature_min > self.temperature_max {
            return Err(Error::InvalidConfig(format!(
                "temperature_min ({}) must not exceed temperature_max ({})",
                self.temperature_min, self.temperature_max
            )));
        }
        Ok(())
    }
}

/// Dashboard counts of ready and not-ready batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadinessSummary {
    pub total: usize,
    pub ready: usize,
    pub not_ready: usize,
}

/// Classify with the production policy.
#[must_use]
pub fn classify(brix: f64, alcohol: f64, temperature: f64) -> Readiness {
    ReadinessPolicy::default().classify(brix, alcohol, temperature)
}
