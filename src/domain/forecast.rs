use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::Feature;
use crate::error::{ErrorKind, ForecastError};

/// Location a forecast was requested for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

/// One forecast hour in physical units
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    /// 1-based hours ahead of the last observation
    pub hour: usize,
    pub timestamp: DateTime<Utc>,
    /// Values aligned with [`ForecastResult::features`]
    pub values: Vec<f64>,
}

/// Mean, maximum and minimum of one variable over the forecast horizon
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub feature: Feature,
    pub mean: f64,
    pub max: f64,
    pub min: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSummary {
    pub variables: Vec<VariableSummary>,
}

impl ForecastSummary {
    /// Summarize points in a single pass over the horizon
    pub fn from_points(features: &[Feature], points: &[ForecastPoint]) -> Self {
        let k = features.len();
        let mut sums = vec![0.0; k];
        let mut maxs = vec![f64::NEG_INFINITY; k];
        let mut mins = vec![f64::INFINITY; k];

        for point in points {
            for (j, value) in point.values.iter().enumerate().take(k) {
                sums[j] += value;
                maxs[j] = maxs[j].max(*value);
                mins[j] = mins[j].min(*value);
            }
        }

        let n = points.len().max(1) as f64;
        let variables = features
            .iter()
            .enumerate()
            .map(|(j, &feature)| VariableSummary {
                feature,
                mean: sums[j] / n,
                max: maxs[j],
                min: mins[j],
            })
            .collect();
        Self { variables }
    }

    pub fn get(&self, feature: Feature) -> Option<&VariableSummary> {
        self.variables.iter().find(|v| v.feature == feature)
    }
}

/// A finished multi-horizon forecast
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastResult {
    pub request_id: uuid::Uuid,
    pub model_id: String,
    pub features: Vec<Feature>,
    pub points: Vec<ForecastPoint>,
    pub summary: ForecastSummary,
    /// Timestamp of the last observation the forecast is anchored on
    pub base_time: DateTime<Utc>,
}

impl ForecastResult {
    pub fn horizon(&self) -> usize {
        self.points.len()
    }

    /// All values of one variable in horizon order
    pub fn series(&self, feature: Feature) -> Option<Vec<f64>> {
        let j = self.features.iter().position(|f| *f == feature)?;
        Some(self.points.iter().map(|p| p.values[j]).collect())
    }
}

/// Hourly entry on the wire: `{hour, temperature, relative_humidity, ...}`
struct HourlyEntry<'a> {
    features: &'a [Feature],
    point: &'a ForecastPoint,
}

impl Serialize for HourlyEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.features.len() + 1))?;
        map.serialize_entry("hour", &self.point.hour)?;
        for (feature, value) in self.features.iter().zip(&self.point.values) {
            map.serialize_entry(feature.name(), value)?;
        }
        map.end()
    }
}

impl Serialize for ForecastSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.variables.len() * 3))?;
        for v in &self.variables {
            map.serialize_entry(&format!("avg_{}", v.feature), &v.mean)?;
            map.serialize_entry(&format!("max_{}", v.feature), &v.max)?;
            map.serialize_entry(&format!("min_{}", v.feature), &v.min)?;
        }
        map.end()
    }
}

/// `predictions` block of a successful response
#[derive(Debug, Clone)]
pub struct Predictions {
    result: ForecastResult,
}

impl Serialize for Predictions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let hourly: Vec<HourlyEntry<'_>> = self
            .result
            .points
            .iter()
            .map(|point| HourlyEntry {
                features: &self.result.features,
                point,
            })
            .collect();
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("hourly", &hourly)?;
        map.serialize_entry("summary", &self.result.summary)?;
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Forecast response handed to the serving layer
///
/// On failure only the stable [`ErrorKind`] is carried; error detail stays
/// in the logs.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastResponse {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Predictions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub location: Location,
    pub timestamp: DateTime<Utc>,
}

impl ForecastResponse {
    pub fn from_result(
        location: Location,
        result: std::result::Result<ForecastResult, ForecastError>,
    ) -> Self {
        let timestamp = Utc::now();
        match result {
            Ok(result) => Self {
                status: ResponseStatus::Success,
                predictions: Some(Predictions { result }),
                error: None,
                location,
                timestamp,
            },
            Err(err) => Self {
                status: ResponseStatus::Error,
                predictions: None,
                error: Some(err.kind()),
                location,
                timestamp,
            },
        }
    }

    pub fn result(&self) -> Option<&ForecastResult> {
        self.predictions.as_ref().map(|p| &p.result)
    }
}
