//! Loaded models and their scaling parameters
//!
//! The registry is filled once through `&mut` methods and then shared
//! behind an `Arc`. Handles are immutable; a model whose artifact could not
//! be loaded stays listed with its error so callers can report it.

use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::Feature;
use crate::error::{ErrorKind, ForecastError, Result};
use crate::forecast::normalizer::{FeatureNormalizer, NormalizationParameters};
use crate::ml::artifact::{self, ModelConfigRecord};
use crate::ml::{ModelAdapter, ModelFamily, ModelSpec, PipelineShape, PredictionMode};

/// Scaling derived once from a handle's parameters
#[derive(Debug, Clone)]
struct Scaling {
    inputs: NormalizationParameters,
    outputs: NormalizationParameters,
}

/// A loaded model with the parameters it was trained with
#[derive(Debug)]
pub struct ModelHandle {
    id: String,
    adapter: Box<dyn ModelAdapter>,
    parameters: Option<Arc<NormalizationParameters>>,
    scaling: std::result::Result<Scaling, ForecastError>,
}

impl ModelHandle {
    pub fn new(
        id: impl Into<String>,
        adapter: Box<dyn ModelAdapter>,
        parameters: Option<NormalizationParameters>,
    ) -> Self {
        let id = id.into();
        let scaling = match &parameters {
            Some(params) => params
                .select(&Feature::ALL)
                .and_then(|inputs| {
                    let outputs = params.select(&adapter.spec().output_features)?;
                    Ok(Scaling { inputs, outputs })
                }),
            None => Err(ForecastError::Normalization(format!(
                "model '{id}' has no normalization parameters"
            ))),
        };
        Self {
            id,
            adapter,
            parameters: parameters.map(Arc::new),
            scaling,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter(&self) -> &dyn ModelAdapter {
        self.adapter.as_ref()
    }

    pub fn spec(&self) -> &ModelSpec {
        self.adapter.spec()
    }

    pub fn family(&self) -> ModelFamily {
        self.adapter.family()
    }

    pub fn prediction_mode(&self) -> PredictionMode {
        self.adapter.prediction_mode()
    }

    pub fn output_features(&self) -> &[Feature] {
        &self.spec().output_features
    }

    pub fn parameters(&self) -> Option<&Arc<NormalizationParameters>> {
        self.parameters.as_ref()
    }

    fn scaling(&self) -> Result<&Scaling> {
        self.scaling.as_ref().map_err(|e| e.clone())
    }

    /// Parameters that are present must cover every input and output
    pub fn check_scaling(&self) -> Result<()> {
        match (&self.parameters, &self.scaling) {
            (Some(_), Err(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Scale a raw L×7 window into the model's input space.
    ///
    /// Without parameters the window reaches the model unscaled and the
    /// request fails once the output has to be denormalized.
    pub fn normalize_input(
        &self,
        normalizer: &FeatureNormalizer,
        raw: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>> {
        match (&self.scaling, &self.parameters) {
            (Ok(scaling), _) => normalizer.transform_matrix(raw, &scaling.inputs),
            (Err(_), None) => Ok(raw.to_owned()),
            (Err(e), Some(_)) => Err(e.clone()),
        }
    }

    /// Run the adapter and check it honoured its declared H×K shape
    pub fn predict(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let spec = self.spec();
        let out = self.adapter.predict(input)?;
        let expected = (spec.output_window, spec.output_count());
        if out.dim() != expected {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "model '{}' produced {}x{}, declared {}x{}",
                self.id,
                out.nrows(),
                out.ncols(),
                expected.0,
                expected.1
            )));
        }
        Ok(out)
    }

    /// Map an H×K normalized forecast back to physical units
    pub fn denormalize_output(
        &self,
        normalizer: &FeatureNormalizer,
        normalized: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>> {
        normalizer.inverse_transform_matrix(normalized, &self.scaling()?.outputs)
    }

    /// Per-step forecast standard deviation in physical units
    pub fn horizon_uncertainty(&self) -> Result<Option<Array2<f64>>> {
        let Some(mut std) = self.adapter.horizon_uncertainty() else {
            return Ok(None);
        };
        let outputs = &self.scaling()?.outputs;
        for (k, feature) in outputs.features().iter().enumerate() {
            let (_, scale) = outputs.get(*feature).unwrap_or((0.0, 1.0));
            std.column_mut(k).mapv_inplace(|s| s * scale);
        }
        Ok(Some(std))
    }
}

/// Availability of one registered model
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    Available {
        family: ModelFamily,
        mode: PredictionMode,
        outputs: Vec<Feature>,
    },
    Unavailable {
        kind: ErrorKind,
        detail: String,
    },
}

impl ModelStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, ModelStatus::Available { .. })
    }
}

#[derive(Debug)]
enum ModelEntry {
    Loaded {
        handle: Arc<ModelHandle>,
        source: Option<PathBuf>,
    },
    Failed {
        source: Option<PathBuf>,
        error: ForecastError,
    },
}

/// Model id → loaded handle or load failure, in id order
#[derive(Debug)]
pub struct ModelRegistry {
    shape: PipelineShape,
    epsilon: Option<f64>,
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// `epsilon` is forwarded to scaler loading for degenerate columns
    pub fn new(shape: PipelineShape, epsilon: Option<f64>) -> Self {
        Self {
            shape,
            epsilon,
            entries: BTreeMap::new(),
        }
    }

    pub fn shape(&self) -> PipelineShape {
        self.shape
    }

    /// Register an in-memory model; a rejected model stays listed as unavailable
    pub fn register(&mut self, handle: ModelHandle) -> Result<Arc<ModelHandle>> {
        self.insert(handle, None)
    }

    fn insert(&mut self, handle: ModelHandle, source: Option<PathBuf>) -> Result<Arc<ModelHandle>> {
        let checked = handle
            .spec()
            .check_pipeline(&self.shape)
            .and_then(|()| handle.check_scaling());
        if let Err(error) = checked {
            return Err(self.record_failure(handle.id().to_string(), source, error));
        }

        let handle = Arc::new(handle);
        info!(model = handle.id(), family = %handle.family(), "registered model");
        self.entries.insert(
            handle.id().to_string(),
            ModelEntry::Loaded {
                handle: Arc::clone(&handle),
                source,
            },
        );
        Ok(handle)
    }

    fn record_failure(
        &mut self,
        id: String,
        source: Option<PathBuf>,
        error: ForecastError,
    ) -> ForecastError {
        warn!(model = %id, kind = %error.kind(), error = %error, "model unavailable");
        self.entries.insert(
            id,
            ModelEntry::Failed {
                source,
                error: error.clone(),
            },
        );
        error
    }

    /// Load a model from its config record; a failure is recorded, not fatal
    pub fn load(&mut self, record_path: impl AsRef<Path>) -> Result<Arc<ModelHandle>> {
        let record_path = record_path.as_ref();
        let (id, loaded) = match ModelConfigRecord::load(record_path) {
            Ok(record) => {
                let id = record.id.clone();
                let base = record_path.parent().unwrap_or_else(|| Path::new("."));
                (id, artifact::load_from_record(record, base, &self.shape, self.epsilon))
            }
            Err(e) => (artifact::file_stem(record_path), Err(e)),
        };

        let source = Some(record_path.to_path_buf());
        match loaded {
            Ok(loaded) => self.insert(ModelHandle::new(id, loaded.adapter, loaded.scaler), source),
            Err(error) => Err(self.record_failure(id, source, error)),
        }
    }

    /// Load every record; returns how many loaded
    pub fn load_all<P: AsRef<Path>>(&mut self, record_paths: impl IntoIterator<Item = P>) -> usize {
        let mut loaded = 0;
        for path in record_paths {
            if self.load(path).is_ok() {
                loaded += 1;
            }
        }
        info!(loaded, registered = self.entries.len(), "model registry ready");
        loaded
    }

    /// Re-read a model from the record it was loaded from
    pub fn reload(&mut self, id: &str) -> Result<Arc<ModelHandle>> {
        let source = match self.entries.get(id) {
            Some(ModelEntry::Failed {
                source: Some(source),
                ..
            })
            | Some(ModelEntry::Loaded {
                source: Some(source),
                ..
            }) => source.clone(),
            Some(ModelEntry::Failed { error, .. }) => return Err(error.clone()),
            Some(ModelEntry::Loaded { handle, .. }) => return Ok(Arc::clone(handle)),
            None => return Err(ForecastError::unavailable(id, "not registered")),
        };
        self.load(source)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ModelHandle>> {
        match self.entries.get(id) {
            Some(ModelEntry::Loaded { handle, .. }) => Ok(Arc::clone(handle)),
            Some(ModelEntry::Failed { error, .. }) => Err(error.clone()),
            None => Err(ForecastError::unavailable(id, "not registered")),
        }
    }

    /// Availability of every registered model, in id order
    pub fn status(&self) -> BTreeMap<String, ModelStatus> {
        self.entries
            .iter()
            .map(|(id, entry)| {
                let status = match entry {
                    ModelEntry::Loaded { handle, .. } => ModelStatus::Available {
                        family: handle.family(),
                        mode: handle.prediction_mode(),
                        outputs: handle.output_features().to_vec(),
                    },
                    ModelEntry::Failed { error, .. } => ModelStatus::Unavailable {
                        kind: error.kind(),
                        detail: error.to_string(),
                    },
                };
                (id.clone(), status)
            })
            .collect()
    }

    /// Every entry: the handle, or the reason it is unavailable
    pub fn entries(&self) -> impl Iterator<Item = (&str, Result<Arc<ModelHandle>>)> + '_ {
        self.entries
            .keys()
            .map(move |id| (id.as_str(), self.get(id)))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
