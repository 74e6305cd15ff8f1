//! Recurrent model
//!
//! GRU cell run step by step over the input window. The final hidden state
//! feeds either a direct head (all H steps at once) or an autoregressive
//! head that predicts one step, feeds it back as the next input and
//! advances the cell again.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::domain::FEATURE_COUNT;
use crate::error::{ForecastError, Result};
use crate::ml::{Dense, DenseWeights, ModelAdapter, ModelFamily, ModelSpec, PredictionMode};

/// Serialized GRU parameters, gates stacked in `r, z, n` order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentWeights {
    pub hidden_size: usize,
    /// `weight_ih` (3h×7) with `bias_ih`
    pub input: DenseWeights,
    /// `weight_hh` (3h×h) with `bias_hh`
    pub hidden: DenseWeights,
    /// h→H·K for direct mode, h→K for autoregressive mode
    pub head: DenseWeights,
}

#[derive(Debug, Clone)]
struct GruCell {
    size: usize,
    input: Dense,
    hidden: Dense,
}

impl GruCell {
    fn step(&self, x: &ArrayView1<'_, f64>, h: &Array1<f64>) -> Array1<f64> {
        let gi = self.input.forward_vec(x);
        let gh = self.hidden.forward_vec(&h.view());
        let n = self.size;

        let mut next = Array1::zeros(n);
        for j in 0..n {
            let r = sigmoid(gi[j] + gh[j]);
            let z = sigmoid(gi[n + j] + gh[n + j]);
            let candidate = (gi[2 * n + j] + r * gh[2 * n + j]).tanh();
            next[j] = (1.0 - z) * candidate + z * h[j];
        }
        next
    }

    fn encode(&self, input: &ArrayView2<'_, f64>) -> Array1<f64> {
        input
            .rows()
            .into_iter()
            .fold(Array1::zeros(self.size), |h, x| self.step(&x, &h))
    }
}

/// GRU forecaster with a direct or autoregressive head
#[derive(Debug, Clone)]
pub struct RecurrentModel {
    spec: ModelSpec,
    mode: PredictionMode,
    cell: GruCell,
    head: Dense,
    columns: Vec<usize>,
}

impl RecurrentModel {
    pub fn from_weights(
        spec: ModelSpec,
        mode: PredictionMode,
        weights: RecurrentWeights,
    ) -> Result<Self> {
        let h = weights.hidden_size;
        if h == 0 {
            return Err(ForecastError::ModelShapeMismatch("hidden_size is zero".into()));
        }
        let input = weights.input.build("input")?;
        input.expect_dims("input", FEATURE_COUNT, 3 * h)?;
        let hidden = weights.hidden.build("hidden")?;
        hidden.expect_dims("hidden", h, 3 * h)?;

        let head = weights.head.build("head")?;
        let head_out = match mode {
            PredictionMode::Direct => spec.output_window * spec.output_count(),
            PredictionMode::Autoregressive => spec.output_count(),
        };
        head.expect_dims("head", h, head_out)?;

        Ok(Self {
            columns: spec.output_indices(),
            spec,
            mode,
            cell: GruCell {
                size: h,
                input,
                hidden,
            },
            head,
        })
    }

    fn unroll(&self, input: &ArrayView2<'_, f64>, mut h: Array1<f64>) -> Array2<f64> {
        let horizon = self.spec.output_window;
        let mut out = Array2::zeros((horizon, self.columns.len()));
        // non-output features stay at their last observed value
        let mut feedback = input.row(input.nrows() - 1).to_owned();

        for step in 0..horizon {
            let y = self.head.forward_vec(&h.view());
            out.row_mut(step).assign(&y);
            if step + 1 < horizon {
                for (k, &column) in self.columns.iter().enumerate() {
                    feedback[column] = y[k];
                }
                h = self.cell.step(&feedback.view(), &h);
            }
        }
        out
    }
}

impl ModelAdapter for RecurrentModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::Recurrent
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        self.mode
    }

    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.spec.check_input(&input)?;
        let h = self.cell.encode(&input);

        match self.mode {
            PredictionMode::Direct => {
                let flat = self.head.forward_vec(&h.view());
                Array2::from_shape_vec(
                    (self.spec.output_window, self.spec.output_count()),
                    flat.to_vec(),
                )
                .map_err(|e| ForecastError::ModelShapeMismatch(e.to_string()))
            }
            PredictionMode::Autoregressive => Ok(self.unroll(&input, h)),
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
