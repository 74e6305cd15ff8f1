//! Hand-written adapter doubles and fixtures for unit tests

use chrono::{Duration, TimeZone, Utc};
use ndarray::{Array2, ArrayView2};

use crate::domain::{Feature, Observation, ObservationSeries, FEATURE_COUNT};
use crate::error::{ForecastError, Result};
use crate::forecast::normalizer::{NormalizationParameters, ScalingMethod};
use crate::ml::{ModelAdapter, ModelFamily, ModelSpec, PredictionMode};

pub(crate) fn spec(input_window: usize, output_window: usize, outputs: &[Feature]) -> ModelSpec {
    ModelSpec {
        input_window,
        output_window,
        output_features: outputs.to_vec(),
    }
}

/// Repeats the last observed value of every output
#[derive(Debug)]
pub(crate) struct PersistenceModel {
    pub spec: ModelSpec,
}

impl ModelAdapter for PersistenceModel {
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
        let last = input.row(input.nrows() - 1);
        let columns = self.spec.output_indices();
        Ok(Array2::from_shape_fn(
            (self.spec.output_window, columns.len()),
            |(_, k)| last[columns[k]],
        ))
    }
}

/// Same normalized value everywhere
#[derive(Debug)]
pub(crate) struct ConstantModel {
    pub spec: ModelSpec,
    pub value: f64,
}

impl ModelAdapter for ConstantModel {
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
        Ok(Array2::from_elem(
            (self.spec.output_window, self.spec.output_count()),
            self.value,
        ))
    }
}

/// Returns one step fewer than it declares
#[derive(Debug)]
pub(crate) struct TruncatingModel {
    pub spec: ModelSpec,
}

impl ModelAdapter for TruncatingModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::Recurrent
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        PredictionMode::Direct
    }

    fn predict(&self, _input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Ok(Array2::zeros((
            self.spec.output_window.saturating_sub(1),
            self.spec.output_count(),
        )))
    }
}

/// Always fails at prediction time
#[derive(Debug)]
pub(crate) struct FailingModel {
    pub spec: ModelSpec,
}

impl ModelAdapter for FailingModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::MultivariateClassical
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        PredictionMode::Autoregressive
    }

    fn predict(&self, _input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Err(ForecastError::unavailable("failing", "weights went missing"))
    }
}

/// Panics instead of returning an error
#[derive(Debug)]
pub(crate) struct PanickingModel {
    pub spec: ModelSpec,
}

impl ModelAdapter for PanickingModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::Recurrent
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prediction_mode(&self) -> PredictionMode {
        PredictionMode::Direct
    }

    fn predict(&self, _input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        panic!("corrupted weights")
    }
}

/// Min-max parameters spanning typical physical ranges
pub(crate) fn weather_parameters() -> NormalizationParameters {
    NormalizationParameters::new(
        Feature::ALL.to_vec(),
        ScalingMethod::MinMax,
        vec![-30.0, 0.0, -40.0, 0.0, 950.0, 0.0, 0.0],
        vec![70.0, 100.0, 70.0, 80.0, 100.0, 100.0, 6.0],
        None,
    )
    .expect("valid parameters")
}

/// Hourly series starting 2024-01-01T00:00Z with values from `f(hour)`
pub(crate) fn hourly_series(
    n: usize,
    f: impl Fn(usize) -> [f64; FEATURE_COUNT],
) -> ObservationSeries {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid start");
    let observations = (0..n)
        .map(|i| Observation::new(start + Duration::hours(i as i64), f(i)))
        .collect();
    ObservationSeries::new(observations).expect("valid series")
}

/// Smooth daily cycle in every variable
pub(crate) fn diurnal(hour: usize) -> [f64; FEATURE_COUNT] {
    let phase = (hour % 24) as f64 / 24.0 * std::f64::consts::TAU;
    let t = 12.0 + 6.0 * phase.sin();
    let rh = 65.0 - 15.0 * phase.sin();
    [t, rh, t - 5.0, 12.0 + 4.0 * phase.cos(), 1013.0, 40.0, 0.6]
}
