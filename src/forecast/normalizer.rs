//! Feature scaling
//!
//! Parameters are fit once over a training span and then shared read-only.
//! The same parameter set that produced a model's training inputs has to be
//! used to denormalize that model's outputs.

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::domain::{Feature, ObservationSeries};
use crate::error::{ForecastError, Result};

/// Scaling method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMethod {
    /// (x - min) / (max - min)
    #[default]
    MinMax,
    /// (x - mean) / std
    Standard,
}

/// Normalizer behaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerOptions {
    pub method: ScalingMethod,
    /// Floor for a degenerate column's range; `None` rejects such columns
    pub epsilon: Option<f64>,
    /// Clamp min-max transformed values to [0, 1]
    pub clamp: bool,
}

/// Per-feature scaling parameters, immutable once fit or loaded
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationParameters {
    features: Vec<Feature>,
    method: ScalingMethod,
    /// min (min-max) or mean (standard)
    offsets: Vec<f64>,
    /// max - min (min-max) or std (standard)
    scales: Vec<f64>,
}

impl NormalizationParameters {
    /// Build parameters from explicit offsets and scales
    pub fn new(
        features: Vec<Feature>,
        method: ScalingMethod,
        offsets: Vec<f64>,
        scales: Vec<f64>,
        epsilon: Option<f64>,
    ) -> Result<Self> {
        if offsets.len() != features.len() || scales.len() != features.len() {
            return Err(ForecastError::Normalization(format!(
                "parameter count mismatch: {} features, {} offsets, {} scales",
                features.len(),
                offsets.len(),
                scales.len()
            )));
        }
        let scales = scales
            .into_iter()
            .zip(&features)
            .map(|(scale, feature)| floor_scale(*feature, scale, epsilon))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            features,
            method,
            offsets,
            scales,
        })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn method(&self) -> ScalingMethod {
        self.method
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// (offset, scale) for a feature
    pub fn get(&self, feature: Feature) -> Option<(f64, f64)> {
        let i = self.features.iter().position(|f| *f == feature)?;
        Some((self.offsets[i], self.scales[i]))
    }

    /// Parameters restricted to `features`, in that order
    pub fn select(&self, features: &[Feature]) -> Result<Self> {
        let mut offsets = Vec::with_capacity(features.len());
        let mut scales = Vec::with_capacity(features.len());
        for feature in features {
            let (offset, scale) = self.get(*feature).ok_or_else(|| {
                ForecastError::Normalization(format!("no scaling parameters for '{feature}'"))
            })?;
            offsets.push(offset);
            scales.push(scale);
        }
        Ok(Self {
            features: features.to_vec(),
            method: self.method,
            offsets,
            scales,
        })
    }

    /// Load a persisted parameter blob
    pub fn load(path: impl AsRef<Path>, epsilon: Option<f64>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ForecastError::Normalization(format!("cannot read {}: {e}", path.display()))
        })?;
        let blob: ScalerBlob = serde_json::from_str(&text).map_err(|e| {
            ForecastError::Normalization(format!("invalid scaler {}: {e}", path.display()))
        })?;
        Self::from_blob(blob, epsilon)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.to_blob())
            .map_err(|e| ForecastError::Normalization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| {
            ForecastError::Normalization(format!("cannot write {}: {e}", path.display()))
        })
    }

    fn from_blob(blob: ScalerBlob, epsilon: Option<f64>) -> Result<Self> {
        match blob {
            ScalerBlob::MinMax {
                features,
                method,
                min_values,
                max_values,
                ..
            } => {
                check_method(method, ScalingMethod::MinMax)?;
                if min_values.len() != max_values.len() {
                    return Err(ForecastError::Normalization(format!(
                        "{} min values but {} max values",
                        min_values.len(),
                        max_values.len()
                    )));
                }
                let scales = min_values
                    .iter()
                    .zip(&max_values)
                    .map(|(lo, hi)| hi - lo)
                    .collect();
                Self::new(
                    resolve_features(&features)?,
                    ScalingMethod::MinMax,
                    min_values,
                    scales,
                    epsilon,
                )
            }
            ScalerBlob::Standard {
                features,
                method,
                means,
                scales,
            } => {
                check_method(method, ScalingMethod::Standard)?;
                Self::new(
                    resolve_features(&features)?,
                    ScalingMethod::Standard,
                    means,
                    scales,
                    epsilon,
                )
            }
        }
    }

    fn to_blob(&self) -> ScalerBlob {
        let features = self.features.iter().map(|f| f.name().to_string()).collect();
        match self.method {
            ScalingMethod::MinMax => ScalerBlob::MinMax {
                features,
                method: Some(ScalingMethod::MinMax),
                min_values: self.offsets.clone(),
                max_values: self
                    .offsets
                    .iter()
                    .zip(&self.scales)
                    .map(|(lo, range)| lo + range)
                    .collect(),
                ranges: Some(self.scales.clone()),
            },
            ScalingMethod::Standard => ScalerBlob::Standard {
                features,
                method: Some(ScalingMethod::Standard),
                means: self.offsets.clone(),
                scales: self.scales.clone(),
            },
        }
    }
}

/// On-disk layout; the min-max form matches the training-side scaling file,
/// which carries no `method` field
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ScalerBlob {
    MinMax {
        features: Vec<String>,
        #[serde(default)]
        method: Option<ScalingMethod>,
        min_values: Vec<f64>,
        max_values: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ranges: Option<Vec<f64>>,
    },
    Standard {
        features: Vec<String>,
        #[serde(default)]
        method: Option<ScalingMethod>,
        means: Vec<f64>,
        scales: Vec<f64>,
    },
}

fn check_method(declared: Option<ScalingMethod>, layout: ScalingMethod) -> Result<()> {
    match declared {
        Some(method) if method != layout => Err(ForecastError::Normalization(format!(
            "scaler declares {method:?} but carries {layout:?} parameters"
        ))),
        _ => Ok(()),
    }
}

fn resolve_features(names: &[String]) -> Result<Vec<Feature>> {
    names
        .iter()
        .map(|name| {
            Feature::from_column(name).ok_or_else(|| {
                ForecastError::Normalization(format!("unknown feature '{name}' in scaler"))
            })
        })
        .collect()
}

fn floor_scale(feature: Feature, scale: f64, epsilon: Option<f64>) -> Result<f64> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(ForecastError::Normalization(format!(
            "invalid scale {scale} for '{feature}'"
        )));
    }
    match epsilon {
        Some(eps) if scale < eps => Ok(eps),
        None if scale == 0.0 => Err(ForecastError::Normalization(format!(
            "degenerate column '{feature}': zero range"
        ))),
        _ => Ok(scale),
    }
}

/// Fits parameters and applies element-wise transforms
#[derive(Debug, Clone, Default)]
pub struct FeatureNormalizer {
    options: NormalizerOptions,
}

impl FeatureNormalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Fit parameters for all seven features over `series` only
    pub fn fit(&self, series: &ObservationSeries) -> Result<NormalizationParameters> {
        if series.is_empty() {
            return Err(ForecastError::Normalization(
                "cannot fit on an empty series".to_string(),
            ));
        }
        let matrix = series.to_matrix();
        let (offsets, scales) = match self.options.method {
            ScalingMethod::MinMax => {
                let mins: Vec<f64> = matrix
                    .axis_iter(Axis(1))
                    .map(|col| col.fold(f64::INFINITY, |a, &b| a.min(b)))
                    .collect();
                let ranges = matrix
                    .axis_iter(Axis(1))
                    .zip(&mins)
                    .map(|(col, lo)| col.fold(f64::NEG_INFINITY, |a, &b| a.max(b)) - lo)
                    .collect();
                (mins, ranges)
            }
            ScalingMethod::Standard => {
                let n = matrix.nrows() as f64;
                let means: Vec<f64> = matrix
                    .axis_iter(Axis(1))
                    .map(|col| col.sum() / n)
                    .collect();
                let stds = matrix
                    .axis_iter(Axis(1))
                    .zip(&means)
                    .map(|(col, mean)| {
                        (col.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt()
                    })
                    .collect();
                (means, stds)
            }
        };
        debug!(method = ?self.options.method, observations = series.len(), "fit normalization parameters");
        NormalizationParameters::new(
            Feature::ALL.to_vec(),
            self.options.method,
            offsets,
            scales,
            self.options.epsilon,
        )
    }

    pub fn transform(&self, values: &[f64], params: &NormalizationParameters) -> Result<Vec<f64>> {
        check_len(values.len(), params)?;
        Ok(values
            .iter()
            .zip(params.offsets.iter().zip(&params.scales))
            .map(|(x, (offset, scale))| self.clamp(params.method, (x - offset) / scale))
            .collect())
    }

    pub fn inverse_transform(
        &self,
        values: &[f64],
        params: &NormalizationParameters,
    ) -> Result<Vec<f64>> {
        check_len(values.len(), params)?;
        Ok(values
            .iter()
            .zip(params.offsets.iter().zip(&params.scales))
            .map(|(z, (offset, scale))| z * scale + offset)
            .collect())
    }

    /// Transform every row of an N×F matrix
    pub fn transform_matrix(
        &self,
        matrix: ArrayView2<'_, f64>,
        params: &NormalizationParameters,
    ) -> Result<Array2<f64>> {
        check_len(matrix.ncols(), params)?;
        let mut out = matrix.to_owned();
        for mut row in out.rows_mut() {
            for (j, x) in row.iter_mut().enumerate() {
                *x = self.clamp(params.method, (*x - params.offsets[j]) / params.scales[j]);
            }
        }
        Ok(out)
    }

    pub fn inverse_transform_matrix(
        &self,
        matrix: ArrayView2<'_, f64>,
        params: &NormalizationParameters,
    ) -> Result<Array2<f64>> {
        check_len(matrix.ncols(), params)?;
        let mut out = matrix.to_owned();
        for mut row in out.rows_mut() {
            for (j, z) in row.iter_mut().enumerate() {
                *z = *z * params.scales[j] + params.offsets[j];
            }
        }
        Ok(out)
    }

    fn clamp(&self, method: ScalingMethod, z: f64) -> f64 {
        if self.options.clamp && method == ScalingMethod::MinMax {
            z.clamp(0.0, 1.0)
        } else {
            z
        }
    }
}

fn check_len(len: usize, params: &NormalizationParameters) -> Result<()> {
    if len != params.len() {
        return Err(ForecastError::Normalization(format!(
            "expected {} values, got {}",
            params.len(),
            len
        )));
    }
    Ok(())
}
