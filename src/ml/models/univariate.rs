//! Univariate classical model
//!
//! One AR(p) process per output variable, each reading only its own column
//! of the input window. Forecasts are produced recursively and the forecast
//! error standard deviation grows with the horizon through the ψ-weights of
//! each process.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::domain::Feature;
use crate::error::{ForecastError, Result};
use crate::ml::{ModelAdapter, ModelFamily, ModelSpec, PredictionMode};

/// Serialized AR(p) component: `y_t = c + Σ φ_i · y_{t-i} + ε`, `ε ~ N(0, σ²)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArComponentWeights {
    pub feature: Feature,
    pub intercept: f64,
    /// `φ_1..φ_p`, most recent lag first
    pub coefficients: Vec<f64>,
    pub sigma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnivariateWeights {
    pub components: Vec<ArComponentWeights>,
}

#[derive(Debug, Clone)]
struct ArComponent {
    column: usize,
    intercept: f64,
    coefficients: Vec<f64>,
}

impl ArComponent {
    /// Recursive H-step forecast from the tail of `history`
    fn forecast(&self, history: &[f64], horizon: usize) -> Vec<f64> {
        let p = self.coefficients.len();
        let mut buffer: Vec<f64> = history[history.len() - p..].to_vec();
        let mut out = Vec::with_capacity(horizon);
        for _ in 0..horizon {
            let n = buffer.len();
            let next = self.intercept
                + self
                    .coefficients
                    .iter()
                    .enumerate()
                    .map(|(i, phi)| phi * buffer[n - 1 - i])
                    .sum::<f64>();
            buffer.push(next);
            out.push(next);
        }
        out
    }
}

/// Per-variable AR(p) ensemble
#[derive(Debug, Clone)]
pub struct UnivariateModel {
    spec: ModelSpec,
    components: Vec<ArComponent>,
    uncertainty: Array2<f64>,
}

impl UnivariateModel {
    pub fn from_weights(spec: ModelSpec, weights: UnivariateWeights) -> Result<Self> {
        let declared: Vec<Feature> = weights.components.iter().map(|c| c.feature).collect();
        if declared != spec.output_features {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "components {declared:?} do not match declared outputs {:?}",
                spec.output_features
            )));
        }

        let horizon = spec.output_window;
        let mut uncertainty = Array2::zeros((horizon, spec.output_count()));
        let mut components = Vec::with_capacity(weights.components.len());

        for (k, c) in weights.components.into_iter().enumerate() {
            let p = c.coefficients.len();
            if p == 0 || p > spec.input_window {
                return Err(ForecastError::ModelShapeMismatch(format!(
                    "{}: AR order {p} outside 1..={}",
                    c.feature, spec.input_window
                )));
            }
            if !c.sigma.is_finite() || c.sigma < 0.0 {
                return Err(ForecastError::ModelShapeMismatch(format!(
                    "{}: invalid residual sigma {}",
                    c.feature, c.sigma
                )));
            }

            for (h, std) in horizon_std(&c.coefficients, c.sigma, horizon)
                .into_iter()
                .enumerate()
            {
                uncertainty[[h, k]] = std;
            }
            components.push(ArComponent {
                column: c.feature.index(),
                intercept: c.intercept,
                coefficients: c.coefficients,
            });
        }

        Ok(Self {
            spec,
            components,
            uncertainty,
        })
    }
}

impl ModelAdapter for UnivariateModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::UnivariateClassical
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        PredictionMode::Autoregressive
    }

    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.spec.check_input(&input)?;

        let horizon = self.spec.output_window;
        let mut out = Array2::zeros((horizon, self.components.len()));
        for (k, component) in self.components.iter().enumerate() {
            let history = input.column(component.column).to_vec();
            for (h, value) in component.forecast(&history, horizon).into_iter().enumerate() {
                out[[h, k]] = value;
            }
        }
        Ok(out)
    }

    fn horizon_uncertainty(&self) -> Option<Array2<f64>> {
        Some(self.uncertainty.clone())
    }
}

/// `std_h = σ · sqrt(Σ_{j<h} ψ_j²)` with `ψ_0 = 1`, `ψ_j = Σ_i φ_i ψ_{j-i}`
fn horizon_std(coefficients: &[f64], sigma: f64, horizon: usize) -> Vec<f64> {
    let mut psi = Vec::with_capacity(horizon);
    let mut cumulative = 0.0;
    let mut out = Vec::with_capacity(horizon);
    for j in 0..horizon {
        let value = if j == 0 {
            1.0
        } else {
            coefficients
                .iter()
                .take(j)
                .enumerate()
                .map(|(i, phi)| phi * psi[j - 1 - i])
                .sum()
        };
        psi.push(value);
        cumulative += value * value;
        out.push(sigma * cumulative.sqrt());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FEATURE_COUNT;
    use approx::assert_abs_diff_eq;

    fn spec(outputs: Vec<Feature>) -> ModelSpec {
        ModelSpec {
            input_window: 6,
            output_window: 4,
            output_features: outputs,
        }
    }

    fn ar1(feature: Feature, phi: f64, intercept: f64) -> ArComponentWeights {
        ArComponentWeights {
            feature,
            intercept,
            coefficients: vec![phi],
            sigma: 0.1,
        }
    }

    #[test]
    fn test_ar1_recursion() {
        let model = UnivariateModel::from_weights(
            spec(vec![Feature::Temperature]),
            UnivariateWeights {
                components: vec![ar1(Feature::Temperature, 0.5, 1.0)],
            },
        )
        .unwrap();

        let mut input = Array2::zeros((6, FEATURE_COUNT));
        input[[5, Feature::Temperature.index()]] = 4.0;
        let out = model.predict(input.view()).unwrap();

        // 1 + 0.5·4 = 3, 1 + 0.5·3 = 2.5, ...
        let expected = [3.0, 2.5, 2.25, 2.125];
        for (h, e) in expected.iter().enumerate() {
            assert_abs_diff_eq!(out[[h, 0]], *e, epsilon = 1e-12);
        }
        assert_eq!(model.prediction_mode(), PredictionMode::Autoregressive);
    }

    #[test]
    fn test_columns_are_independent() {
        let model = UnivariateModel::from_weights(
            spec(vec![Feature::Temperature, Feature::WindSpeed]),
            UnivariateWeights {
                components: vec![
                    ar1(Feature::Temperature, 1.0, 0.0),
                    ar1(Feature::WindSpeed, 1.0, 0.0),
                ],
            },
        )
        .unwrap();

        let mut input = Array2::from_elem((6, FEATURE_COUNT), 9.0);
        input[[5, Feature::Temperature.index()]] = 0.2;
        input[[5, Feature::WindSpeed.index()]] = 0.7;
        let out = model.predict(input.view()).unwrap();
        assert!(out.column(0).iter().all(|v| (*v - 0.2).abs() < 1e-12));
        assert!(out.column(1).iter().all(|v| (*v - 0.7).abs() < 1e-12));
    }

    #[test]
    fn test_uncertainty_grows_with_horizon() {
        let std = horizon_std(&[0.8, 0.1], 1.0, 5);
        assert_abs_diff_eq!(std[0], 1.0);
        // ψ_1 = 0.8
        assert_abs_diff_eq!(std[1], (1.0f64 + 0.64).sqrt(), epsilon = 1e-12);
        // ψ_2 = 0.8·0.8 + 0.1·1
        assert_abs_diff_eq!(std[2], (1.64f64 + 0.74 * 0.74).sqrt(), epsilon = 1e-12);
        assert!(std.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_components_must_match_outputs() {
        let err = UnivariateModel::from_weights(
            spec(vec![Feature::Temperature, Feature::WindSpeed]),
            UnivariateWeights {
                components: vec![ar1(Feature::Temperature, 0.5, 0.0)],
            },
        )
        .unwrap_err();
        assert!(matches!(err, ForecastError::ModelShapeMismatch(_)));
    }

    #[test]
    fn test_order_longer_than_window() {
        let mut c = ar1(Feature::Temperature, 0.5, 0.0);
        c.coefficients = vec![0.1; 7];
        assert!(UnivariateModel::from_weights(
            spec(vec![Feature::Temperature]),
            UnivariateWeights { components: vec![c] },
        )
        .is_err());
    }
}
