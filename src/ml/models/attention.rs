//! Attention sequence model
//!
//! Transformer encoder over the full input window followed by a pooled
//! projection to every future step at once:
//!
//! input projection → sinusoidal position encoding → N encoder layers
//! (multi-head self-attention, GELU feed-forward, post-norm residuals) →
//! mean over time → two-layer GELU head → H×K.
//!
//! Dropout is the identity at inference and is not represented.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

use crate::domain::FEATURE_COUNT;
use crate::error::{ForecastError, Result};
use crate::ml::{Dense, DenseWeights, ModelAdapter, ModelFamily, ModelSpec, PredictionMode};

const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNormWeights {
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderLayerWeights {
    pub query: DenseWeights,
    pub key: DenseWeights,
    pub value: DenseWeights,
    pub out: DenseWeights,
    pub norm1: LayerNormWeights,
    pub feed_forward1: DenseWeights,
    pub feed_forward2: DenseWeights,
    pub norm2: LayerNormWeights,
}

/// Serialized attention model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionWeights {
    pub model_dim: usize,
    pub num_heads: usize,
    pub input_proj: DenseWeights,
    pub layers: Vec<EncoderLayerWeights>,
    pub head_hidden: DenseWeights,
    pub head_out: DenseWeights,
}

#[derive(Debug, Clone)]
struct LayerNorm {
    gamma: Array1<f64>,
    beta: Array1<f64>,
}

impl LayerNorm {
    fn build(name: &str, w: LayerNormWeights, dim: usize) -> Result<Self> {
        if w.gamma.len() != dim || w.beta.len() != dim {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "{name}: expected {dim} parameters, got {}/{}",
                w.gamma.len(),
                w.beta.len()
            )));
        }
        Ok(Self {
            gamma: Array1::from(w.gamma),
            beta: Array1::from(w.beta),
        })
    }

    fn forward(&self, x: &mut Array2<f64>) {
        for mut row in x.rows_mut() {
            let n = row.len() as f64;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let denom = (var + LAYER_NORM_EPS).sqrt();
            for ((v, g), b) in row.iter_mut().zip(&self.gamma).zip(&self.beta) {
                *v = (*v - mean) / denom * g + b;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    query: Dense,
    key: Dense,
    value: Dense,
    out: Dense,
    norm1: LayerNorm,
    feed_forward1: Dense,
    feed_forward2: Dense,
    norm2: LayerNorm,
}

impl EncoderLayer {
    fn build(index: usize, w: EncoderLayerWeights, dim: usize) -> Result<Self> {
        let name = |part: &str| format!("layers[{index}].{part}");
        let query = w.query.build(&name("query"))?;
        let key = w.key.build(&name("key"))?;
        let value = w.value.build(&name("value"))?;
        let out = w.out.build(&name("out"))?;
        for (part, dense) in [("query", &query), ("key", &key), ("value", &value), ("out", &out)] {
            dense.expect_dims(&name(part), dim, dim)?;
        }
        let feed_forward1 = w.feed_forward1.build(&name("feed_forward1"))?;
        let hidden = feed_forward1.out_dim();
        feed_forward1.expect_dims(&name("feed_forward1"), dim, hidden)?;
        let feed_forward2 = w.feed_forward2.build(&name("feed_forward2"))?;
        feed_forward2.expect_dims(&name("feed_forward2"), hidden, dim)?;
        Ok(Self {
            query,
            key,
            value,
            out,
            norm1: LayerNorm::build(&name("norm1"), w.norm1, dim)?,
            feed_forward1,
            feed_forward2,
            norm2: LayerNorm::build(&name("norm2"), w.norm2, dim)?,
        })
    }

    fn forward(&self, x: Array2<f64>, num_heads: usize) -> Array2<f64> {
        let attended = self.self_attention(&x.view(), num_heads);
        let mut x = x + attended;
        self.norm1.forward(&mut x);

        let mut hidden = self.feed_forward1.forward(&x.view());
        hidden.mapv_inplace(gelu);
        let mut x = x + self.feed_forward2.forward(&hidden.view());
        self.norm2.forward(&mut x);
        x
    }

    fn self_attention(&self, x: &ArrayView2<'_, f64>, num_heads: usize) -> Array2<f64> {
        let q = self.query.forward(x);
        let k = self.key.forward(x);
        let v = self.value.forward(x);
        let head_dim = q.ncols() / num_heads;
        let scale = (head_dim as f64).sqrt();

        let mut context = Array2::zeros(q.dim());
        for h in 0..num_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let mut scores = q.slice(s![.., cols.clone()]).dot(&k.slice(s![.., cols.clone()]).t()) / scale;
            softmax_rows(&mut scores);
            let context_h = scores.dot(&v.slice(s![.., cols.clone()]));
            context.slice_mut(s![.., cols]).assign(&context_h);
        }
        self.out.forward(&context.view())
    }
}

/// Direct multi-horizon attention model
#[derive(Debug, Clone)]
pub struct AttentionModel {
    spec: ModelSpec,
    num_heads: usize,
    input_proj: Dense,
    positional: Array2<f64>,
    layers: Vec<EncoderLayer>,
    head_hidden: Dense,
    head_out: Dense,
}

impl AttentionModel {
    pub fn from_weights(spec: ModelSpec, weights: AttentionWeights) -> Result<Self> {
        let dim = weights.model_dim;
        if dim == 0 || weights.num_heads == 0 || dim % weights.num_heads != 0 {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "model_dim {dim} is not divisible into {} heads",
                weights.num_heads
            )));
        }

        let input_proj = weights.input_proj.build("input_proj")?;
        input_proj.expect_dims("input_proj", FEATURE_COUNT, dim)?;

        let layers = weights
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, w)| EncoderLayer::build(i, w, dim))
            .collect::<Result<Vec<_>>>()?;

        let head_hidden = weights.head_hidden.build("head_hidden")?;
        head_hidden.expect_dims("head_hidden", dim, head_hidden.out_dim())?;
        let head_out = weights.head_out.build("head_out")?;
        head_out.expect_dims(
            "head_out",
            head_hidden.out_dim(),
            spec.output_window * spec.output_count(),
        )?;

        Ok(Self {
            positional: positional_encoding(spec.input_window, dim),
            spec,
            num_heads: weights.num_heads,
            input_proj,
            layers,
            head_hidden,
            head_out,
        })
    }
}

impl ModelAdapter for AttentionModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::Attention
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        PredictionMode::Direct
    }

    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.spec.check_input(&input)?;

        let mut x = self.input_proj.forward(&input) + &self.positional;
        for layer in &self.layers {
            x = layer.forward(x, self.num_heads);
        }

        let pooled = x
            .mean_axis(Axis(0))
            .ok_or_else(|| ForecastError::ModelShapeMismatch("empty input window".into()))?;
        let mut hidden = self.head_hidden.forward_vec(&pooled.view());
        hidden.mapv_inplace(gelu);
        let flat = self.head_out.forward_vec(&hidden.view());

        Array2::from_shape_vec(
            (self.spec.output_window, self.spec.output_count()),
            flat.to_vec(),
        )
        .map_err(|e| ForecastError::ModelShapeMismatch(e.to_string()))
    }
}

/// `pe[pos, 2i] = sin(pos·w_i)`, `pe[pos, 2i+1] = cos(pos·w_i)`, `w_i = 10000^(-2i/d)`
fn positional_encoding(len: usize, dim: usize) -> Array2<f64> {
    let mut pe = Array2::zeros((len, dim));
    for pos in 0..len {
        for i in (0..dim).step_by(2) {
            let rate = (-(i as f64) * (10000.0f64).ln() / dim as f64).exp();
            let angle = pos as f64 * rate;
            pe[[pos, i]] = angle.sin();
            if i + 1 < dim {
                pe[[pos, i + 1]] = angle.cos();
            }
        }
    }
    pe
}

fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}

fn gelu(x: f64) -> f64 {
    0.5 * x * (1.0 + erf(x / std::f64::consts::SQRT_2))
}
