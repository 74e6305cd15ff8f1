//! Model families and the uniform prediction interface
//!
//! Every family implements [`ModelAdapter`]:
//! - attention sequence model (direct multi-horizon)
//! - univariate classical model (one recursive AR model per variable)
//! - multivariate classical model (joint recursive VAR)
//! - recurrent model (GRU, autoregressive or direct head)
//!
//! Adapters hold immutable learned parameters; `predict` keeps all of its
//! intermediate state on the stack, so one adapter can serve concurrent
//! requests without locking.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{Feature, FEATURE_COUNT};
use crate::error::{ForecastError, Result};

pub mod artifact;
pub mod models;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

/// Model family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelFamily {
    Attention,
    UnivariateClassical,
    MultivariateClassical,
    Recurrent,
}

/// How a model produces the steps after the first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PredictionMode {
    /// All H steps from one pass
    Direct,
    /// Each step is fed back as input for the next
    Autoregressive,
}

/// Declared input/output shape of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub input_window: usize,
    pub output_window: usize,
    pub output_features: Vec<Feature>,
}

impl ModelSpec {
    pub fn output_count(&self) -> usize {
        self.output_features.len()
    }

    /// Column indices of the outputs within the 7-feature input
    pub fn output_indices(&self) -> Vec<usize> {
        self.output_features.iter().map(|f| f.index()).collect()
    }

    /// Reject a spec that disagrees with the pipeline windowing
    pub fn check_pipeline(&self, shape: &PipelineShape) -> Result<()> {
        if self.input_window != shape.input_window || self.output_window != shape.output_window {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "model declares L={} H={}, pipeline uses L={} H={}",
                self.input_window, self.output_window, shape.input_window, shape.output_window
            )));
        }
        if self.output_features.is_empty() || self.output_features.len() > FEATURE_COUNT {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "model declares {} output variables",
                self.output_features.len()
            )));
        }
        Ok(())
    }

    /// Validate an input window against the declared input length
    pub fn check_input(&self, input: &ArrayView2<'_, f64>) -> Result<()> {
        if input.dim() != (self.input_window, FEATURE_COUNT) {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "expected {}x{} input window, got {}x{}",
                self.input_window,
                FEATURE_COUNT,
                input.nrows(),
                input.ncols()
            )));
        }
        Ok(())
    }
}

/// Window lengths the pipeline is configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineShape {
    pub input_window: usize,
    pub output_window: usize,
}

/// Uniform prediction interface over model families
pub trait ModelAdapter: Send + Sync + fmt::Debug {
    fn family(&self) -> ModelFamily;

    fn spec(&self) -> &ModelSpec;

    fn prediction_mode(&self) -> PredictionMode;

    /// Map an L×7 normalized input window to an H×K normalized forecast
    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Per-step standard deviation (H×K, normalized units), when the family
    /// can estimate it
    fn horizon_uncertainty(&self) -> Option<Array2<f64>> {
        None
    }
}

/// Dense layer with PyTorch layout: `weight` is out×in
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl Dense {
    pub fn from_parts(name: &str, weight: Vec<Vec<f64>>, bias: Vec<f64>) -> Result<Self> {
        let weight = matrix_from_rows(name, weight)?;
        if bias.len() != weight.nrows() {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "{name}: bias has {} entries for {} outputs",
                bias.len(),
                weight.nrows()
            )));
        }
        Ok(Self {
            weight,
            bias: Array1::from(bias),
        })
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Apply to every row of `x` (T×in → T×out)
    pub fn forward(&self, x: &ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    pub fn forward_vec(&self, x: &ArrayView1<'_, f64>) -> Array1<f64> {
        self.weight.dot(x) + &self.bias
    }

    pub(crate) fn expect_dims(&self, name: &str, input: usize, output: usize) -> Result<()> {
        if self.in_dim() != input || self.out_dim() != output {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "{name}: expected {output}x{input}, got {}x{}",
                self.out_dim(),
                self.in_dim()
            )));
        }
        Ok(())
    }
}

/// Serialized dense layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseWeights {
    pub weight: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl DenseWeights {
    pub fn build(self, name: &str) -> Result<Dense> {
        Dense::from_parts(name, self.weight, self.bias)
    }
}

/// Build a matrix from row vectors, rejecting ragged input
pub fn matrix_from_rows(name: &str, rows: Vec<Vec<f64>>) -> Result<Array2<f64>> {
    let n_rows = rows.len();
    let n_cols = rows.first().map(Vec::len).unwrap_or(0);
    if n_rows == 0 || n_cols == 0 {
        return Err(ForecastError::ModelShapeMismatch(format!("{name}: empty matrix")));
    }
    if rows.iter().any(|r| r.len() != n_cols) {
        return Err(ForecastError::ModelShapeMismatch(format!("{name}: ragged rows")));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| ForecastError::ModelShapeMismatch(format!("{name}: {e}")))
}
