use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the forecast pipeline.
///
/// Every variant maps to a stable [`ErrorKind`]; the detail text is for
/// logs and operators and must not cross the response boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("Data validation error: {0}")]
    DataValidation(String),

    #[error("Insufficient history: need {required} observations, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Model '{model}' unavailable: {detail}")]
    ModelUnavailable { model: String, detail: String },

    #[error("Model shape mismatch: {0}")]
    ModelShapeMismatch(String),

    #[error("Model '{model}' is not comparable: {detail}")]
    IncomparableModels { model: String, detail: String },
}

/// Stable error discriminant exposed to callers of the core.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    DataValidation,
    InsufficientHistory,
    Normalization,
    ModelUnavailable,
    ModelShapeMismatch,
    IncomparableModels,
}

impl ForecastError {
    /// Get the stable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForecastError::DataValidation(_) => ErrorKind::DataValidation,
            ForecastError::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
            ForecastError::Normalization(_) => ErrorKind::Normalization,
            ForecastError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            ForecastError::ModelShapeMismatch(_) => ErrorKind::ModelShapeMismatch,
            ForecastError::IncomparableModels { .. } => ErrorKind::IncomparableModels,
        }
    }

    pub(crate) fn unavailable(model: impl Into<String>, detail: impl Into<String>) -> Self {
        ForecastError::ModelUnavailable {
            model: model.into(),
            detail: detail.into(),
        }
    }
}

/// Result type with the pipeline error
pub type Result<T> = std::result::Result<T, ForecastError>;
