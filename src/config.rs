use anyhow::{ensure, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

use crate::domain::{Feature, Location};
use crate::forecast::metrics::HorizonBuckets;
use crate::forecast::normalizer::NormalizerOptions;
use crate::ml::PipelineShape;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub pipeline: PipelineConfig,
    pub normalizer: NormalizerOptions,
    pub engine: EngineConfig,
    #[validate(nested)]
    pub evaluation: EvaluationConfig,
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    #[validate(range(min = 1))]
    pub input_window: usize,
    #[validate(range(min = 1))]
    pub output_window: usize,
    /// Variables every served forecast carries
    #[validate(length(min = 1, max = 7))]
    pub output_features: Vec<Feature>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_window: 168,
            output_window: 72,
            output_features: vec![
                Feature::Temperature,
                Feature::RelativeHumidity,
                Feature::WindSpeed,
            ],
        }
    }
}

impl PipelineConfig {
    pub fn shape(&self) -> PipelineShape {
        PipelineShape {
            input_window: self.input_window,
            output_window: self.output_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Clip temperature, humidity and wind to physical ranges
    pub physical_bounds: bool,
    /// Model the binary serves a forecast from after evaluating
    pub production_model: Option<String>,
    pub location: Option<Location>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            physical_bounds: true,
            production_model: None,
            location: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EvaluationConfig {
    pub buckets: HorizonBuckets,
    /// Actual values with `|y|` at or below this are left out of MAPE
    #[validate(range(min = 0.0))]
    pub mape_epsilon: f64,
    /// Relative RMSE drop from first to last bucket tolerated before flagging
    #[validate(range(min = 0.0))]
    pub degradation_tolerance: f64,
    #[validate(length(min = 1, max = 7))]
    pub required_features: Vec<Feature>,
    pub parallel: bool,
    /// Length of the held-out tail the binary evaluates on
    #[validate(range(min = 1))]
    pub holdout_hours: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            buckets: HorizonBuckets::default(),
            mape_epsilon: 0.1,
            degradation_tolerance: 0.1,
            required_features: vec![
                Feature::Temperature,
                Feature::RelativeHumidity,
                Feature::WindSpeed,
            ],
            parallel: true,
            holdout_hours: 720,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Model config records, one per model
    pub models: Vec<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("WXF__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract()?;
        config.check()?;
        Ok(config)
    }

    /// Field ranges plus the cross-section rules
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        ensure!(
            self.evaluation.buckets.max_lead() <= self.pipeline.output_window,
            "horizon buckets reach {}h but the pipeline forecasts {}h",
            self.evaluation.buckets.max_lead(),
            self.pipeline.output_window
        );
        if let Some(epsilon) = self.normalizer.epsilon {
            ensure!(epsilon > 0.0, "normalizer epsilon must be positive, got {epsilon}");
        }
        Ok(())
    }
}
