//! Per-request forecast state machine
//!
//! `Idle → WindowReady → Predicted → Denormalized → Done`, with `Error`
//! reachable from every state and terminal. A request is one synchronous
//! pass; nothing is retried.

use chrono::Duration;
use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, debug_span, info, warn};
use uuid::Uuid;

use super::normalizer::FeatureNormalizer;
use super::window::WindowBuilder;
use crate::config::Config;
use crate::domain::{
    Feature, ForecastPoint, ForecastResponse, ForecastResult, ForecastSummary, Location,
    ObservationSeries,
};
use crate::error::{ErrorKind, ForecastError, Result};
use crate::ml::registry::{ModelHandle, ModelRegistry};
use crate::ml::PipelineShape;

/// Where a request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    WindowReady,
    Predicted,
    Denormalized,
    Done,
    Error(ErrorKind),
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Done | EngineState::Error(_))
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::WindowReady => write!(f, "window_ready"),
            EngineState::Predicted => write!(f, "predicted"),
            EngineState::Denormalized => write!(f, "denormalized"),
            EngineState::Done => write!(f, "done"),
            EngineState::Error(kind) => write!(f, "error({kind})"),
        }
    }
}

/// Physical ranges forecasts are clipped to
pub fn physical_bounds(feature: Feature) -> Option<(f64, f64)> {
    match feature {
        Feature::Temperature => Some((-50.0, 50.0)),
        Feature::RelativeHumidity => Some((0.0, 100.0)),
        Feature::WindSpeed => Some((0.0, 100.0)),
        _ => None,
    }
}

/// Engine settings shared by every request
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub shape: PipelineShape,
    /// Variables a served forecast must carry, in response order
    pub output_features: Vec<Feature>,
    pub normalizer: FeatureNormalizer,
    pub clip_to_physical_bounds: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shape: config.pipeline.shape(),
            output_features: config.pipeline.output_features.clone(),
            normalizer: FeatureNormalizer::new(config.normalizer.clone()),
            clip_to_physical_bounds: config.engine.physical_bounds,
        }
    }

    pub fn windows(&self) -> WindowBuilder {
        WindowBuilder::new(self.shape.input_window, self.shape.output_window)
    }
}

/// Outcome of one request with the states it passed through
#[derive(Debug)]
pub struct EngineRun {
    pub request_id: Uuid,
    pub result: Result<ForecastResult>,
    pub trace: Vec<EngineState>,
}

impl EngineRun {
    pub fn final_state(&self) -> EngineState {
        self.trace.last().copied().unwrap_or(EngineState::Idle)
    }
}

/// Serves forecasts from the models of a shared registry
#[derive(Debug, Clone)]
pub struct ForecastEngine {
    registry: Arc<ModelRegistry>,
    settings: Arc<EngineSettings>,
}

impl ForecastEngine {
    pub fn new(registry: Arc<ModelRegistry>, settings: EngineSettings) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Forecast the next H hours after the end of `history`
    pub fn forecast(&self, model_id: &str, history: &ObservationSeries) -> Result<ForecastResult> {
        self.forecast_traced(model_id, history).result
    }

    pub fn forecast_traced(&self, model_id: &str, history: &ObservationSeries) -> EngineRun {
        let request_id = Uuid::new_v4();
        let span = debug_span!("forecast", %request_id, model = model_id);
        let _guard = span.enter();

        let mut request = Request {
            state: EngineState::Idle,
            trace: vec![EngineState::Idle],
        };
        let result = request.run(self, model_id, history, request_id);
        match &result {
            Ok(r) => info!(model = model_id, horizon = r.horizon(), "forecast served"),
            Err(e) => warn!(model = model_id, kind = %e.kind(), error = %e, "forecast failed"),
        }
        EngineRun {
            request_id,
            result,
            trace: request.trace,
        }
    }

    /// Response-boundary view: only a stable error kind escapes
    pub fn respond(
        &self,
        model_id: &str,
        location: Location,
        history: &ObservationSeries,
    ) -> ForecastResponse {
        ForecastResponse::from_result(location, self.forecast(model_id, history))
    }
}

struct Request {
    state: EngineState,
    trace: Vec<EngineState>,
}

impl Request {
    fn advance(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "engine transition");
        self.state = next;
        self.trace.push(next);
    }

    fn fail<T>(&mut self, error: ForecastError) -> Result<T> {
        self.advance(EngineState::Error(error.kind()));
        Err(error)
    }

    fn run(
        &mut self,
        engine: &ForecastEngine,
        model_id: &str,
        history: &ObservationSeries,
        request_id: Uuid,
    ) -> Result<ForecastResult> {
        let settings = &engine.settings;
        let base_time = match history.last() {
            Some(obs) => obs.timestamp,
            None => {
                return self.fail(ForecastError::InsufficientHistory {
                    required: settings.shape.input_window,
                    available: 0,
                })
            }
        };

        let raw = history.to_matrix();
        let window = match settings.windows().latest_window(raw.view()) {
            Ok(w) => w,
            Err(e) => return self.fail(e),
        };
        self.advance(EngineState::WindowReady);

        let predicted = engine
            .registry
            .get(model_id)
            .and_then(|handle| predict_window(&handle, settings, window.input).map(|z| (handle, z)));
        let (handle, normalized) = match predicted {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        self.advance(EngineState::Predicted);

        let physical = match to_physical(&handle, settings, normalized.view()) {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        self.advance(EngineState::Denormalized);

        match assemble(&handle, settings, physical, base_time, request_id) {
            Ok(result) => {
                self.advance(EngineState::Done);
                Ok(result)
            }
            Err(e) => self.fail(e),
        }
    }
}

/// Normalize a raw L×7 window and run the model on it
pub(crate) fn predict_window(
    handle: &ModelHandle,
    settings: &EngineSettings,
    raw: ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    let input = handle.normalize_input(&settings.normalizer, raw)?;
    handle.predict(input.view())
}

/// Denormalize an H×K forecast and clip it to physical bounds when enabled
pub(crate) fn to_physical(
    handle: &ModelHandle,
    settings: &EngineSettings,
    normalized: ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    let mut physical = handle.denormalize_output(&settings.normalizer, normalized)?;
    if settings.clip_to_physical_bounds {
        for (k, feature) in handle.output_features().iter().enumerate() {
            if let Some((lo, hi)) = physical_bounds(*feature) {
                physical.column_mut(k).mapv_inplace(|v| v.clamp(lo, hi));
            }
        }
    }
    Ok(physical)
}

fn assemble(
    handle: &ModelHandle,
    settings: &EngineSettings,
    physical: Array2<f64>,
    base_time: chrono::DateTime<chrono::Utc>,
    request_id: Uuid,
) -> Result<ForecastResult> {
    let outputs = handle.output_features();
    let columns = settings
        .output_features
        .iter()
        .map(|feature| {
            outputs.iter().position(|f| f == feature).ok_or_else(|| {
                ForecastError::ModelShapeMismatch(format!(
                    "model '{}' does not forecast '{feature}'",
                    handle.id()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let points: Vec<ForecastPoint> = physical
        .rows()
        .into_iter()
        .enumerate()
        .map(|(step, row)| ForecastPoint {
            hour: step + 1,
            timestamp: base_time + Duration::hours(step as i64 + 1),
            values: columns.iter().map(|&k| row[k]).collect(),
        })
        .collect();
    let summary = ForecastSummary::from_points(&settings.output_features, &points);

    Ok(ForecastResult {
        request_id,
        model_id: handle.id().to_string(),
        features: settings.output_features.clone(),
        points,
        summary,
        base_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResponseStatus;
    use crate::forecast::normalizer::NormalizerOptions;
    use crate::ml::testing::{
        diurnal, hourly_series, spec, weather_parameters, ConstantModel, FailingModel,
        PersistenceModel, TruncatingModel,
    };
    use crate::ml::ModelAdapter;
    use approx::assert_abs_diff_eq;

    const OUTPUTS: [Feature; 3] = [
        Feature::Temperature,
        Feature::RelativeHumidity,
        Feature::WindSpeed,
    ];

    fn settings() -> EngineSettings {
        EngineSettings {
            shape: PipelineShape {
                input_window: 168,
                output_window: 72,
            },
            output_features: OUTPUTS.to_vec(),
            normalizer: FeatureNormalizer::new(NormalizerOptions::default()),
            clip_to_physical_bounds: true,
        }
    }

    fn engine(models: Vec<(&str, Box<dyn ModelAdapter>, bool)>) -> ForecastEngine {
        let mut registry = ModelRegistry::new(settings().shape, None);
        for (id, adapter, with_params) in models {
            let params = with_params.then(weather_parameters);
            registry.register(ModelHandle::new(id, adapter, params)).unwrap();
        }
        ForecastEngine::new(Arc::new(registry), settings())
    }

    fn persistence() -> Box<dyn ModelAdapter> {
        Box::new(PersistenceModel {
            spec: spec(168, 72, &OUTPUTS),
        })
    }

    #[test]
    fn test_successful_forecast_walks_every_state() {
        let engine = engine(vec![("persist", persistence(), true)]);
        let history = hourly_series(200, diurnal);

        let run = engine.forecast_traced("persist", &history);
        assert_eq!(
            run.trace,
            vec![
                EngineState::Idle,
                EngineState::WindowReady,
                EngineState::Predicted,
                EngineState::Denormalized,
                EngineState::Done
            ]
        );
        let result = run.result.unwrap();
        assert_eq!(result.request_id, run.request_id);
        assert_eq!(result.horizon(), 72);
        assert_eq!(result.features, OUTPUTS.to_vec());

        let last = history.last().unwrap();
        for (i, point) in result.points.iter().enumerate() {
            assert_eq!(point.hour, i + 1);
            assert_eq!(point.timestamp, last.timestamp + Duration::hours(i as i64 + 1));
            assert_abs_diff_eq!(point.values[0], last.get(Feature::Temperature), epsilon = 1e-9);
            assert_abs_diff_eq!(point.values[2], last.get(Feature::WindSpeed), epsilon = 1e-9);
        }
        let t = result.summary.get(Feature::Temperature).unwrap();
        assert_abs_diff_eq!(t.mean, last.get(Feature::Temperature), epsilon = 1e-9);
    }

    #[test]
    fn test_short_history_fails_before_prediction() {
        let engine = engine(vec![("persist", persistence(), true)]);
        let run = engine.forecast_traced("persist", &hourly_series(100, diurnal));
        assert_eq!(
            run.final_state(),
            EngineState::Error(ErrorKind::InsufficientHistory)
        );
        assert_eq!(run.trace.len(), 2);
        assert!(matches!(
            run.result,
            Err(ForecastError::InsufficientHistory {
                required: 168,
                available: 100
            })
        ));
    }

    #[test]
    fn test_exactly_input_window_is_enough() {
        let engine = engine(vec![("persist", persistence(), true)]);
        assert!(engine.forecast("persist", &hourly_series(168, diurnal)).is_ok());
    }

    #[test]
    fn test_empty_history() {
        let engine = engine(vec![("persist", persistence(), true)]);
        let err = engine
            .forecast("persist", &ObservationSeries::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientHistory);
    }

    #[test]
    fn test_unknown_model_is_unavailable() {
        let engine = engine(vec![]);
        let run = engine.forecast_traced("missing", &hourly_series(200, diurnal));
        assert_eq!(
            run.trace,
            vec![
                EngineState::Idle,
                EngineState::WindowReady,
                EngineState::Error(ErrorKind::ModelUnavailable)
            ]
        );
    }

    #[test]
    fn test_adapter_errors_surface_unchanged() {
        let engine = engine(vec![
            (
                "short",
                Box::new(TruncatingModel {
                    spec: spec(168, 72, &OUTPUTS),
                }),
                true,
            ),
            (
                "failing",
                Box::new(FailingModel {
                    spec: spec(168, 72, &OUTPUTS),
                }),
                true,
            ),
        ]);
        let history = hourly_series(200, diurnal);
        assert_eq!(
            engine.forecast("short", &history).unwrap_err().kind(),
            ErrorKind::ModelShapeMismatch
        );
        assert_eq!(
            engine.forecast("failing", &history).unwrap_err().kind(),
            ErrorKind::ModelUnavailable
        );
    }

    #[test]
    fn test_missing_parameters_fail_after_prediction() {
        let engine = engine(vec![("bare", persistence(), false)]);
        let run = engine.forecast_traced("bare", &hourly_series(200, diurnal));
        assert_eq!(
            run.trace,
            vec![
                EngineState::Idle,
                EngineState::WindowReady,
                EngineState::Predicted,
                EngineState::Error(ErrorKind::Normalization)
            ]
        );
        assert_eq!(run.result.unwrap_err().kind(), ErrorKind::Normalization);
    }

    #[test]
    fn test_partial_parameters_never_reach_the_engine() {
        let partial = weather_parameters().select(&OUTPUTS).unwrap();
        let mut registry = ModelRegistry::new(settings().shape, None);
        assert!(registry
            .register(ModelHandle::new("partial", persistence(), Some(partial)))
            .is_err());
        let engine = ForecastEngine::new(Arc::new(registry), settings());

        let run = engine.forecast_traced("partial", &hourly_series(200, diurnal));
        assert_eq!(
            run.trace,
            vec![
                EngineState::Idle,
                EngineState::WindowReady,
                EngineState::Error(ErrorKind::Normalization)
            ]
        );
        assert!(!engine.registry().status()["partial"].is_available());
    }

    #[test]
    fn test_outputs_clipped_to_physical_bounds() {
        // normalized 2.0 is far above every min-max range
        let engine = engine(vec![(
            "hot",
            Box::new(ConstantModel {
                spec: spec(168, 72, &OUTPUTS),
                value: 2.0,
            }),
            true,
        )]);
        let result = engine
            .forecast("hot", &hourly_series(200, diurnal))
            .unwrap();
        let summary = &result.summary;
        assert_eq!(summary.get(Feature::Temperature).unwrap().max, 50.0);
        assert_eq!(summary.get(Feature::RelativeHumidity).unwrap().max, 100.0);
        assert_eq!(summary.get(Feature::WindSpeed).unwrap().max, 100.0);
    }

    #[test]
    fn test_model_missing_a_served_variable() {
        let engine = engine(vec![(
            "temp_only",
            Box::new(PersistenceModel {
                spec: spec(168, 72, &[Feature::Temperature]),
            }),
            true,
        )]);
        let err = engine
            .forecast("temp_only", &hourly_series(200, diurnal))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelShapeMismatch);
    }

    #[test]
    fn test_response_hides_error_detail() {
        let engine = engine(vec![]);
        let location = Location {
            latitude: 59.33,
            longitude: 18.07,
            name: None,
        };
        let response = engine.respond("missing", location, &hourly_series(200, diurnal));
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error, Some(ErrorKind::ModelUnavailable));
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("not registered"));
    }

    #[test]
    fn test_concurrent_requests_share_one_handle() {
        let engine = engine(vec![("persist", persistence(), true)]);
        let history = Arc::new(hourly_series(240, diurnal));

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let engine = engine.clone();
                    let history = Arc::clone(&history);
                    s.spawn(move || engine.forecast("persist", &history))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let first = results[0].as_ref().unwrap();
        for r in &results {
            let r = r.as_ref().unwrap();
            assert_eq!(r.points, first.points);
        }
        // each request gets its own id
        assert_ne!(
            results[0].as_ref().unwrap().request_id,
            results[1].as_ref().unwrap().request_id
        );
    }
}
