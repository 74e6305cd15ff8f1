//! Multivariate classical model
//!
//! Vector autoregression over the output variables:
//! `y_t = c + Σ_i A_i · y_{t-i}` with `y` the K-vector of outputs and each
//! `A_i` a K×K matrix, so every variable's forecast depends on the lagged
//! values of all of them. All K series are stepped forward together.

use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::ml::{matrix_from_rows, ModelAdapter, ModelFamily, ModelSpec, PredictionMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarWeights {
    pub intercept: Vec<f64>,
    /// `A_1..A_p`, most recent lag first, each K×K (row = predicted variable)
    pub lags: Vec<Vec<Vec<f64>>>,
}

/// VAR(p) over the declared output variables
#[derive(Debug, Clone)]
pub struct MultivariateModel {
    spec: ModelSpec,
    columns: Vec<usize>,
    intercept: Array1<f64>,
    lags: Vec<Array2<f64>>,
}

impl MultivariateModel {
    pub fn from_weights(spec: ModelSpec, weights: VarWeights) -> Result<Self> {
        let k = spec.output_count();
        if weights.intercept.len() != k {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "intercept has {} entries for {k} outputs",
                weights.intercept.len()
            )));
        }
        let p = weights.lags.len();
        if p == 0 || p > spec.input_window {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "VAR order {p} outside 1..={}",
                spec.input_window
            )));
        }

        let lags = weights
            .lags
            .into_iter()
            .enumerate()
            .map(|(i, rows)| {
                let name = format!("lags[{i}]");
                let m = matrix_from_rows(&name, rows)?;
                if m.dim() != (k, k) {
                    return Err(ForecastError::ModelShapeMismatch(format!(
                        "{name}: expected {k}x{k}, got {}x{}",
                        m.nrows(),
                        m.ncols()
                    )));
                }
                Ok(m)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            columns: spec.output_indices(),
            spec,
            intercept: Array1::from(weights.intercept),
            lags,
        })
    }

    pub fn order(&self) -> usize {
        self.lags.len()
    }
}

impl ModelAdapter for MultivariateModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::MultivariateClassical
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        PredictionMode::Autoregressive
    }

    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.spec.check_input(&input)?;

        let p = self.order();
        let horizon = self.spec.output_window;
        let k = self.columns.len();

        // rows: the last p observed output vectors followed by the forecasts
        let mut state = Array2::zeros((p + horizon, k));
        let recent = input.slice(s![input.nrows() - p.., ..]);
        for (j, &column) in self.columns.iter().enumerate() {
            state.slice_mut(s![..p, j]).assign(&recent.column(column));
        }

        for t in p..p + horizon {
            let mut next = self.intercept.clone();
            for (i, a) in self.lags.iter().enumerate() {
                next += &a.dot(&state.row(t - 1 - i));
            }
            state.row_mut(t).assign(&next);
        }

        Ok(state.slice_move(s![p.., ..]))
    }
}
