use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{ForecastError, Result};

/// Number of features carried by every observation
pub const FEATURE_COUNT: usize = 7;

/// Observed weather variable, in the fixed column order of the feature vector
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    /// Air temperature at 2 m (°C)
    Temperature,
    /// Relative humidity at 2 m (%)
    RelativeHumidity,
    /// Dew point at 2 m (°C)
    DewPoint,
    /// Wind speed at 10 m (km/h)
    WindSpeed,
    /// Mean sea level pressure (hPa)
    PressureMsl,
    /// Total cloud cover (%)
    CloudCover,
    /// Vapour-pressure deficit (kPa)
    VapourPressureDeficit,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::Temperature,
        Feature::RelativeHumidity,
        Feature::DewPoint,
        Feature::WindSpeed,
        Feature::PressureMsl,
        Feature::CloudCover,
        Feature::VapourPressureDeficit,
    ];

    /// Column index in the feature vector
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Resolve a table column header to a feature.
    ///
    /// Accepts the canonical snake_case names and the provider-style names
    /// used by hourly weather exports. A trailing unit suffix such as
    /// `" (km/h)"` is ignored.
    pub fn from_column(header: &str) -> Option<Feature> {
        let name = header
            .split('(')
            .next()
            .unwrap_or(header)
            .trim()
            .to_ascii_lowercase();
        match name.as_str() {
            "temperature" | "temperature_2m" | "temp" => Some(Feature::Temperature),
            "relative_humidity" | "relative_humidity_2m" | "humidity" => {
                Some(Feature::RelativeHumidity)
            }
            "dew_point" | "dew_point_2m" | "dewpoint" => Some(Feature::DewPoint),
            "wind_speed" | "wind_speed_10m" => Some(Feature::WindSpeed),
            "pressure_msl" | "pressure" => Some(Feature::PressureMsl),
            "cloud_cover" | "cloudcover" => Some(Feature::CloudCover),
            "vapour_pressure_deficit" | "vapor_pressure_deficit" | "vpd" => {
                Some(Feature::VapourPressureDeficit)
            }
            _ => None,
        }
    }
}

/// Vapour-pressure deficit in kPa from temperature (°C) and relative humidity (%)
pub fn vapour_pressure_deficit(temperature_c: f64, relative_humidity: f64) -> f64 {
    let svp = 0.611 * ((17.27 * temperature_c) / (temperature_c + 237.3)).exp();
    svp * (1.0 - relative_humidity / 100.0)
}

/// One hourly observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub values: [f64; FEATURE_COUNT],
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, values: [f64; FEATURE_COUNT]) -> Self {
        Self { timestamp, values }
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }
}

/// Ordered, validated hourly observation series in physical units
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservationSeries {
    observations: Vec<Observation>,
}

impl ObservationSeries {
    /// Build a series, rejecting non-increasing timestamps and non-finite values
    pub fn new(observations: Vec<Observation>) -> Result<Self> {
        for (i, obs) in observations.iter().enumerate() {
            if let Some(j) = obs.values.iter().position(|v| !v.is_finite()) {
                return Err(ForecastError::DataValidation(format!(
                    "observation {} has a non-finite value for '{}'",
                    i,
                    Feature::ALL[j]
                )));
            }
            if i > 0 {
                let prev = observations[i - 1].timestamp;
                if obs.timestamp == prev {
                    return Err(ForecastError::DataValidation(format!(
                        "duplicate timestamp {} at observation {}",
                        obs.timestamp, i
                    )));
                }
                if obs.timestamp < prev {
                    return Err(ForecastError::DataValidation(format!(
                        "timestamp {} at observation {} precedes {}",
                        obs.timestamp, i, prev
                    )));
                }
            }
        }
        Ok(Self { observations })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn first(&self) -> Option<&Observation> {
        self.observations.first()
    }

    pub fn last(&self) -> Option<&Observation> {
        self.observations.last()
    }

    /// Contiguous sub-span; the range is clamped to the series bounds
    pub fn slice(&self, range: Range<usize>) -> ObservationSeries {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            observations: self.observations[start..end].to_vec(),
        }
    }

    /// Split into (training span, held-out span) at `index`
    pub fn split_at(&self, index: usize) -> (ObservationSeries, ObservationSeries) {
        (self.slice(0..index), self.slice(index..self.len()))
    }

    /// The most recent `count` observations (or all of them)
    pub fn tail(&self, count: usize) -> ObservationSeries {
        self.slice(self.len().saturating_sub(count)..self.len())
    }

    /// Row-major N×7 matrix of feature values
    pub fn to_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.len(), FEATURE_COUNT));
        for (mut row, obs) in matrix.rows_mut().into_iter().zip(&self.observations) {
            for (cell, value) in row.iter_mut().zip(obs.values.iter()) {
                *cell = *value;
            }
        }
        matrix
    }
}
