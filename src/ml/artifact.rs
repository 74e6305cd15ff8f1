//! Model artifacts on disk
//!
//! A model is described by a JSON config record naming its family, window
//! lengths, variables and the paths of its weights and scaler blobs. Paths
//! are resolved relative to the record. Blob format follows the extension:
//! `.json` is read with serde_json, `.bin` with bincode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::domain::Feature;
use crate::error::{ForecastError, Result};
use crate::forecast::normalizer::NormalizationParameters;
use crate::ml::models::{
    AttentionModel, AttentionWeights, MultivariateModel, RecurrentModel, RecurrentWeights,
    UnivariateModel, UnivariateWeights, VarWeights,
};
use crate::ml::{ModelAdapter, ModelFamily, ModelSpec, PipelineShape, PredictionMode};

fn all_features() -> Vec<Feature> {
    Feature::ALL.to_vec()
}

/// Model config record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigRecord {
    pub id: String,
    pub family: ModelFamily,
    pub input_window: usize,
    pub output_window: usize,
    #[serde(default = "all_features")]
    pub input_features: Vec<Feature>,
    pub output_features: Vec<Feature>,
    #[serde(default)]
    pub prediction_mode: Option<PredictionMode>,
    pub weights: PathBuf,
    /// Scaler the model was trained with; without it the model cannot
    /// normalize inputs or denormalize outputs
    #[serde(default)]
    pub scaler: Option<PathBuf>,
}

impl ModelConfigRecord {
    /// Read a record; failures are reported against the file stem
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let model = file_stem(path);
        let text = std::fs::read_to_string(path)
            .map_err(|e| ForecastError::unavailable(&model, format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| {
            ForecastError::unavailable(&model, format!("invalid record {}: {e}", path.display()))
        })
    }

    pub fn spec(&self) -> ModelSpec {
        ModelSpec {
            input_window: self.input_window,
            output_window: self.output_window,
            output_features: self.output_features.clone(),
        }
    }

    /// Active prediction mode; recurrent records must declare one
    pub fn mode(&self) -> Result<PredictionMode> {
        let natural = match self.family {
            ModelFamily::Attention => PredictionMode::Direct,
            ModelFamily::UnivariateClassical | ModelFamily::MultivariateClassical => {
                PredictionMode::Autoregressive
            }
            ModelFamily::Recurrent => {
                return self.prediction_mode.ok_or_else(|| {
                    ForecastError::unavailable(
                        &self.id,
                        "recurrent model must declare prediction_mode",
                    )
                });
            }
        };
        match self.prediction_mode {
            Some(declared) if declared != natural => Err(ForecastError::unavailable(
                &self.id,
                format!("{} model cannot run in {declared} mode", self.family),
            )),
            _ => Ok(natural),
        }
    }

    /// Check the record against the pipeline before touching any blob
    pub fn validate(&self, shape: &PipelineShape) -> Result<()> {
        if self.input_features != Feature::ALL {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "model '{}' expects inputs {:?}, pipeline provides {:?}",
                self.id,
                self.input_features,
                Feature::ALL
            )));
        }
        let mut outputs = self.output_features.clone();
        outputs.sort();
        outputs.dedup();
        if outputs.len() != self.output_features.len() {
            return Err(ForecastError::ModelShapeMismatch(format!(
                "model '{}' repeats an output variable",
                self.id
            )));
        }
        self.spec().check_pipeline(shape)?;
        self.mode().map(|_| ())
    }

    fn resolve(&self, base: &Path, blob: &Path) -> PathBuf {
        if blob.is_absolute() {
            blob.to_path_buf()
        } else {
            base.join(blob)
        }
    }
}

/// Adapter and scaler read from one record
#[derive(Debug)]
pub struct LoadedArtifact {
    pub record: ModelConfigRecord,
    pub adapter: Box<dyn ModelAdapter>,
    pub scaler: Option<NormalizationParameters>,
}

/// Load and validate a model from its config record
pub fn load_artifact(
    record_path: impl AsRef<Path>,
    shape: &PipelineShape,
    epsilon: Option<f64>,
) -> Result<LoadedArtifact> {
    let record_path = record_path.as_ref();
    let record = ModelConfigRecord::load(record_path)?;
    let base = record_path.parent().unwrap_or_else(|| Path::new("."));
    load_from_record(record, base, shape, epsilon)
}

/// Load the blobs of an already parsed record; `base` anchors relative paths
pub fn load_from_record(
    record: ModelConfigRecord,
    base: &Path,
    shape: &PipelineShape,
    epsilon: Option<f64>,
) -> Result<LoadedArtifact> {
    record.validate(shape)?;

    let weights_path = record.resolve(base, &record.weights);
    let adapter = build_adapter(&record, &weights_path)?;

    let scaler = match &record.scaler {
        Some(path) => {
            let path = record.resolve(base, path);
            Some(NormalizationParameters::load(&path, epsilon).map_err(|e| {
                ForecastError::unavailable(&record.id, format!("scaler: {e}"))
            })?)
        }
        None => None,
    };

    info!(
        model = %record.id,
        family = %record.family,
        mode = %adapter.prediction_mode(),
        outputs = record.output_features.len(),
        "loaded model artifact"
    );
    Ok(LoadedArtifact {
        record,
        adapter,
        scaler,
    })
}

fn build_adapter(record: &ModelConfigRecord, weights: &Path) -> Result<Box<dyn ModelAdapter>> {
    let spec = record.spec();
    let adapter: Box<dyn ModelAdapter> = match record.family {
        ModelFamily::Attention => {
            let w: AttentionWeights = load_blob(&record.id, weights)?;
            Box::new(AttentionModel::from_weights(spec, w)?)
        }
        ModelFamily::UnivariateClassical => {
            let w: UnivariateWeights = load_blob(&record.id, weights)?;
            Box::new(UnivariateModel::from_weights(spec, w)?)
        }
        ModelFamily::MultivariateClassical => {
            let w: VarWeights = load_blob(&record.id, weights)?;
            Box::new(MultivariateModel::from_weights(spec, w)?)
        }
        ModelFamily::Recurrent => {
            let w: RecurrentWeights = load_blob(&record.id, weights)?;
            Box::new(RecurrentModel::from_weights(spec, record.mode()?, w)?)
        }
    };
    Ok(adapter)
}

/// Read a blob as JSON or bincode depending on its extension
pub fn load_blob<T: DeserializeOwned>(model: &str, path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| ForecastError::unavailable(model, format!("{}: {e}", path.display())))?;
    debug!(model, path = %path.display(), bytes = bytes.len(), "read model blob");

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_slice(&bytes).map_err(|e| {
            ForecastError::unavailable(model, format!("corrupt blob {}: {e}", path.display()))
        }),
        Some("bin") => bincode::deserialize(&bytes).map_err(|e| {
            ForecastError::unavailable(model, format!("corrupt blob {}: {e}", path.display()))
        }),
        other => Err(ForecastError::unavailable(
            model,
            format!("unsupported blob format {other:?} for {}", path.display()),
        )),
    }
}

/// Write a blob in the format implied by the extension
pub fn save_blob<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let model = file_stem(path);
    let bytes = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_vec_pretty(value)
            .map_err(|e| ForecastError::unavailable(&model, e.to_string()))?,
        Some("bin") => bincode::serialize(value)
            .map_err(|e| ForecastError::unavailable(&model, e.to_string()))?,
        other => {
            return Err(ForecastError::unavailable(
                &model,
                format!("unsupported blob format {other:?}"),
            ))
        }
    };
    std::fs::write(path, bytes)
        .map_err(|e| ForecastError::unavailable(&model, format!("{}: {e}", path.display())))
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
