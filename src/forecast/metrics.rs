//! Forecast Error Metrics
//!
//! MSE, MAE, RMSE and MAPE over forecast/actual pairs, plus the horizon
//! buckets the evaluation groups them by. Errors are accumulated one pair
//! at a time so a long evaluation never holds every residual in memory.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Running sums for one (model, variable, bucket) cell
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorAccumulator {
    samples: usize,
    sum_squared: f64,
    sum_absolute: f64,
    sum_percentage: f64,
    mape_samples: usize,
    mape_excluded: usize,
    max_error: f64,
}

impl ErrorAccumulator {
    /// Add one pair; `|actual| <= mape_epsilon` is left out of MAPE
    pub fn push(&mut self, actual: f64, predicted: f64, mape_epsilon: f64) {
        let error = predicted - actual;
        self.samples += 1;
        self.sum_squared += error * error;
        self.sum_absolute += error.abs();
        self.max_error = self.max_error.max(error.abs());

        if actual.abs() > mape_epsilon {
            self.sum_percentage += error.abs() / actual.abs();
            self.mape_samples += 1;
        } else {
            self.mape_excluded += 1;
        }
    }

    pub fn merge(&mut self, other: &ErrorAccumulator) {
        self.samples += other.samples;
        self.sum_squared += other.sum_squared;
        self.sum_absolute += other.sum_absolute;
        self.sum_percentage += other.sum_percentage;
        self.mape_samples += other.mape_samples;
        self.mape_excluded += other.mape_excluded;
        self.max_error = self.max_error.max(other.max_error);
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// `None` until at least one pair was pushed
    pub fn finish(&self) -> Option<ForecastMetrics> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        let mse = self.sum_squared / n;
        Some(ForecastMetrics {
            mse,
            mae: self.sum_absolute / n,
            rmse: mse.sqrt(),
            mape: (self.mape_samples > 0)
                .then(|| self.sum_percentage / self.mape_samples as f64 * 100.0),
            sample_count: self.samples,
            mape_samples: self.mape_samples,
            mape_excluded: self.mape_excluded,
            max_error: self.max_error,
        })
    }
}

/// Forecast accuracy metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Squared Error
    pub mse: f64,
    /// Mean Absolute Error
    pub mae: f64,
    /// Root Mean Square Error
    pub rmse: f64,
    /// Mean Absolute Percentage Error (%), absent when every actual value was near zero
    pub mape: Option<f64>,
    /// Number of pairs evaluated
    pub sample_count: usize,
    /// Pairs that entered the MAPE
    pub mape_samples: usize,
    /// Pairs left out of the MAPE for a near-zero actual value
    pub mape_excluded: usize,
    /// Largest absolute error observed
    pub max_error: f64,
}

impl ForecastMetrics {
    /// Calculate metrics from actual and predicted values
    pub fn calculate(
        actual: &[f64],
        predicted: &[f64],
        mape_epsilon: f64,
    ) -> Result<Self, ForecastMetricsError> {
        if actual.len() != predicted.len() {
            return Err(ForecastMetricsError::DimensionMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }

        let mut acc = ErrorAccumulator::default();
        for (a, p) in actual.iter().zip(predicted) {
            acc.push(*a, *p, mape_epsilon);
        }
        acc.finish().ok_or(ForecastMetricsError::EmptyData)
    }
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MSE={:.3}, MAE={:.3}, RMSE={:.3}, ",
            self.mse, self.mae, self.rmse
        )?;
        match self.mape {
            Some(mape) => write!(f, "MAPE={mape:.2}%")?,
            None => write!(f, "MAPE=n/a")?,
        }
        write!(f, " (n={}, excluded={})", self.sample_count, self.mape_excluded)
    }
}

/// Forecast metrics calculation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForecastMetricsError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,
}

/// Contiguous lead-time buckets given by inclusive upper bounds in hours
///
/// `[24, 48, 72]` yields 1-24h, 25-48h and 49-72h.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct HorizonBuckets {
    bounds: Vec<usize>,
}

impl HorizonBuckets {
    pub fn new(bounds: Vec<usize>) -> Result<Self, String> {
        if bounds.is_empty() {
            return Err("at least one horizon bucket is required".to_string());
        }
        if bounds[0] == 0 || bounds.windows(2).any(|w| w[1] <= w[0]) {
            return Err(format!("bucket bounds must be positive and increasing: {bounds:?}"));
        }
        Ok(Self { bounds })
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Largest lead time covered
    pub fn max_lead(&self) -> usize {
        self.bounds.last().copied().unwrap_or(0)
    }

    /// Bucket index for a 1-based lead time, `None` past the last bound
    pub fn bucket_of(&self, lead: usize) -> Option<usize> {
        if lead == 0 {
            return None;
        }
        self.bounds.iter().position(|&upper| lead <= upper)
    }

    /// Labels such as `"1-24h"`
    pub fn labels(&self) -> Vec<String> {
        let mut lower = 1;
        self.bounds
            .iter()
            .map(|&upper| {
                let label = format!("{lower}-{upper}h");
                lower = upper + 1;
                label
            })
            .collect()
    }
}

impl Default for HorizonBuckets {
    fn default() -> Self {
        Self {
            bounds: vec![24, 48, 72],
        }
    }
}

impl TryFrom<Vec<usize>> for HorizonBuckets {
    type Error = String;

    fn try_from(bounds: Vec<usize>) -> Result<Self, Self::Error> {
        Self::new(bounds)
    }
}

impl From<HorizonBuckets> for Vec<usize> {
    fn from(buckets: HorizonBuckets) -> Self {
        buckets.bounds
    }
}
