//! Held-out model comparison
//!
//! Every registered model is run over every window of one held-out span.
//! Errors are accumulated per variable and per lead-time bucket in physical
//! units, models are ranked by pooled RMSE (ties by MAE) and each model gets
//! a horizon-degradation curve. A model that cannot be evaluated is listed
//! with its error kind instead of aborting the comparison.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use ndarray::ArrayView2;
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::engine::{predict_window, to_physical, EngineSettings};
use super::metrics::{ErrorAccumulator, ForecastMetrics, HorizonBuckets};
use crate::config::Config;
use crate::domain::{Feature, ObservationSeries};
use crate::error::{ErrorKind, ForecastError, Result};
use crate::ml::registry::{ModelHandle, ModelRegistry};
use crate::ml::{ModelFamily, PredictionMode};

/// Harness settings
#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    pub engine: EngineSettings,
    pub buckets: HorizonBuckets,
    pub mape_epsilon: f64,
    /// Relative RMSE drop from first to last bucket tolerated before flagging
    pub degradation_tolerance: f64,
    /// Variables every compared model has to forecast
    pub required_features: Vec<Feature>,
}

impl EvaluationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: EngineSettings::from_config(config),
            buckets: config.evaluation.buckets.clone(),
            mape_epsilon: config.evaluation.mape_epsilon,
            degradation_tolerance: config.evaluation.degradation_tolerance,
            required_features: config.evaluation.required_features.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketMetrics {
    pub bucket: String,
    pub metrics: ForecastMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableEvaluation {
    pub feature: Feature,
    pub overall: ForecastMetrics,
    pub buckets: Vec<BucketMetrics>,
}

/// Pooled RMSE of one bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradationPoint {
    pub bucket: String,
    pub rmse: f64,
}

/// Mean forecast standard deviation of one bucket, physical units
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketUncertainty {
    pub bucket: String,
    pub std: BTreeMap<Feature, f64>,
}

/// Everything measured for one model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelEvaluation {
    pub model_id: String,
    pub family: ModelFamily,
    pub prediction_mode: PredictionMode,
    pub windows: usize,
    /// Pooled over all required variables and buckets
    pub aggregate: ForecastMetrics,
    pub variables: Vec<VariableEvaluation>,
    pub degradation: Vec<DegradationPoint>,
    /// Last bucket beat the first by more than the tolerance
    pub degradation_flag: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<Vec<BucketUncertainty>>,
}

/// Per-model line of the report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelOutcome {
    Evaluated(ModelEvaluation),
    /// Never loaded, or failing at run time
    Unavailable {
        model_id: String,
        kind: ErrorKind,
        detail: String,
    },
    /// Loaded but not comparable with the others
    Excluded {
        model_id: String,
        kind: ErrorKind,
        detail: String,
    },
}

impl ModelOutcome {
    /// Evaluation errors: a failing adapter is unavailable, anything else excluded
    fn from_result(model_id: &str, result: Result<ModelEvaluation>) -> Self {
        match result {
            Ok(evaluation) => ModelOutcome::Evaluated(evaluation),
            Err(error) if error.kind() == ErrorKind::ModelUnavailable => {
                Self::unavailable(model_id, error)
            }
            Err(error) => {
                let kind = error.kind();
                warn!(model = model_id, %kind, error = %error, "model left out of comparison");
                ModelOutcome::Excluded {
                    model_id: model_id.to_string(),
                    kind,
                    detail: error.to_string(),
                }
            }
        }
    }

    /// A model that never produced an evaluation, with the kind it failed with
    fn unavailable(model_id: &str, error: ForecastError) -> Self {
        let kind = error.kind();
        warn!(model = model_id, %kind, error = %error, "model unavailable for comparison");
        ModelOutcome::Unavailable {
            model_id: model_id.to_string(),
            kind,
            detail: error.to_string(),
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            ModelOutcome::Evaluated(e) => &e.model_id,
            ModelOutcome::Unavailable { model_id, .. } | ModelOutcome::Excluded { model_id, .. } => {
                model_id
            }
        }
    }

    pub fn evaluation(&self) -> Option<&ModelEvaluation> {
        match self {
            ModelOutcome::Evaluated(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedModel {
    pub rank: usize,
    pub model_id: String,
    pub rmse: f64,
    pub mae: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldoutSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub observations: usize,
    pub windows: usize,
}

/// Ranked comparison of every registered model over one held-out span
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub holdout: HoldoutSpan,
    pub required_features: Vec<Feature>,
    pub buckets: Vec<String>,
    pub ranking: Vec<RankedModel>,
    pub models: Vec<ModelOutcome>,
}

impl EvaluationReport {
    fn new(
        holdout: HoldoutSpan,
        settings: &EvaluationSettings,
        mut models: Vec<ModelOutcome>,
    ) -> Self {
        models.sort_by(|a, b| a.model_id().cmp(b.model_id()));
        let ranking = models
            .iter()
            .filter_map(ModelOutcome::evaluation)
            .sorted_by_key(|e| {
                (
                    OrderedFloat(e.aggregate.rmse),
                    OrderedFloat(e.aggregate.mae),
                    e.model_id.clone(),
                )
            })
            .enumerate()
            .map(|(i, e)| RankedModel {
                rank: i + 1,
                model_id: e.model_id.clone(),
                rmse: e.aggregate.rmse,
                mae: e.aggregate.mae,
            })
            .collect();

        Self {
            holdout,
            required_features: settings.required_features.clone(),
            buckets: settings.buckets.labels(),
            ranking,
            models,
        }
    }

    pub fn outcome(&self, model_id: &str) -> Option<&ModelOutcome> {
        self.models.iter().find(|m| m.model_id() == model_id)
    }

    pub fn best(&self) -> Option<&RankedModel> {
        self.ranking.first()
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Held-out span {} .. {} ({} observations, {} windows), variables: {}",
            self.holdout.start.format("%Y-%m-%d %H:%M"),
            self.holdout.end.format("%Y-%m-%d %H:%M"),
            self.holdout.observations,
            self.holdout.windows,
            self.required_features.iter().join(", ")
        )?;
        writeln!(
            f,
            "{:<5} {:<24} {:>10} {:>10}  {}",
            "rank",
            "model",
            "rmse",
            "mae",
            self.buckets.iter().map(|b| format!("{b:>10}")).join(" ")
        )?;
        for ranked in &self.ranking {
            let curve = self
                .outcome(&ranked.model_id)
                .and_then(ModelOutcome::evaluation)
                .map(|e| {
                    let flag = if e.degradation_flag { "  !" } else { "" };
                    let points = e
                        .degradation
                        .iter()
                        .map(|p| format!("{:>10.3}", p.rmse))
                        .join(" ");
                    format!("{points}{flag}")
                })
                .unwrap_or_default();
            writeln!(
                f,
                "{:<5} {:<24} {:>10.3} {:>10.3}  {}",
                ranked.rank, ranked.model_id, ranked.rmse, ranked.mae, curve
            )?;
        }
        for outcome in &self.models {
            match outcome {
                ModelOutcome::Evaluated(_) => {}
                ModelOutcome::Unavailable { model_id, kind, .. } => {
                    writeln!(f, "{:<5} {:<24} unavailable ({kind})", "-", model_id)?
                }
                ModelOutcome::Excluded { model_id, kind, .. } => {
                    writeln!(f, "{:<5} {:<24} excluded ({kind})", "-", model_id)?
                }
            }
        }
        Ok(())
    }
}

/// Runs model comparisons over held-out data
#[derive(Debug, Clone)]
pub struct EvaluationHarness {
    settings: Arc<EvaluationSettings>,
}

impl EvaluationHarness {
    pub fn new(settings: EvaluationSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    /// Evaluate one model over every window of `holdout`
    pub fn evaluate_model(
        &self,
        handle: &ModelHandle,
        holdout: &ObservationSeries,
    ) -> Result<ModelEvaluation> {
        let raw = holdout.to_matrix();
        self.check_holdout(raw.nrows())?;
        self.evaluate_matrix(handle, raw.view())
    }

    /// Compare every registered model, one after the other
    pub fn compare(
        &self,
        registry: &ModelRegistry,
        holdout: &ObservationSeries,
    ) -> Result<EvaluationReport> {
        let raw = holdout.to_matrix();
        let span = self.holdout_span(holdout)?;

        let outcomes = registry
            .entries()
            .map(|(id, handle)| match handle {
                Ok(h) => ModelOutcome::from_result(id, self.evaluate_matrix(&h, raw.view())),
                Err(error) => ModelOutcome::unavailable(id, error),
            })
            .collect();
        Ok(self.finish(span, outcomes))
    }

    /// Compare every registered model on the blocking pool, one task per model
    pub async fn compare_parallel(
        &self,
        registry: Arc<ModelRegistry>,
        holdout: &ObservationSeries,
    ) -> Result<EvaluationReport> {
        let raw = Arc::new(holdout.to_matrix());
        let span = self.holdout_span(holdout)?;

        let mut outcomes = Vec::with_capacity(registry.len());
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for (id, handle) in registry.entries() {
            let id = id.to_string();
            match handle {
                Ok(handle) => {
                    pending.insert(id.clone());
                    let harness = self.clone();
                    let raw = Arc::clone(&raw);
                    tasks.spawn_blocking(move || {
                        let result = catch_unwind(AssertUnwindSafe(|| {
                            harness.evaluate_matrix(&handle, raw.view())
                        }))
                        .unwrap_or_else(|_| {
                            Err(ForecastError::unavailable(&id, "evaluation panicked"))
                        });
                        (id, result)
                    });
                }
                Err(error) => outcomes.push(ModelOutcome::unavailable(&id, error)),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    pending.remove(&id);
                    outcomes.push(ModelOutcome::from_result(&id, result));
                }
                Err(e) => warn!(error = %e, "evaluation task did not complete"),
            }
        }
        // a task lost to the runtime still gets a row in the report
        outcomes.extend(pending.into_iter().map(|id| {
            let error = ForecastError::unavailable(&id, "evaluation task did not complete");
            ModelOutcome::unavailable(&id, error)
        }));
        Ok(self.finish(span, outcomes))
    }

    fn finish(&self, span: HoldoutSpan, outcomes: Vec<ModelOutcome>) -> EvaluationReport {
        let report = EvaluationReport::new(span, &self.settings, outcomes);
        info!(
            models = report.models.len(),
            ranked = report.ranking.len(),
            best = report.best().map(|r| r.model_id.as_str()).unwrap_or("-"),
            "evaluation complete"
        );
        report
    }

    fn holdout_span(&self, holdout: &ObservationSeries) -> Result<HoldoutSpan> {
        self.check_holdout(holdout.len())?;
        match (holdout.first(), holdout.last()) {
            (Some(first), Some(last)) => Ok(HoldoutSpan {
                start: first.timestamp,
                end: last.timestamp,
                observations: holdout.len(),
                windows: self.settings.engine.windows().window_count(holdout.len()),
            }),
            _ => Err(self.too_short(0)),
        }
    }

    fn check_holdout(&self, n: usize) -> Result<()> {
        if self.settings.engine.windows().window_count(n) == 0 {
            return Err(self.too_short(n));
        }
        Ok(())
    }

    fn too_short(&self, available: usize) -> ForecastError {
        let shape = self.settings.engine.shape;
        ForecastError::InsufficientHistory {
            required: shape.input_window + shape.output_window,
            available,
        }
    }

    fn comparable(&self, handle: &ModelHandle) -> Result<Vec<usize>> {
        let outputs = handle.output_features();
        let missing: Vec<Feature> = self
            .settings
            .required_features
            .iter()
            .filter(|f| !outputs.contains(*f))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ForecastError::IncomparableModels {
                model: handle.id().to_string(),
                detail: format!(
                    "does not forecast {}",
                    missing.iter().join(", ")
                ),
            });
        }
        Ok(self
            .settings
            .required_features
            .iter()
            .filter_map(|f| outputs.iter().position(|o| o == f))
            .collect())
    }

    fn evaluate_matrix(
        &self,
        handle: &ModelHandle,
        raw: ArrayView2<'_, f64>,
    ) -> Result<ModelEvaluation> {
        let settings = &self.settings;
        let columns = self.comparable(handle)?;
        handle.spec().check_pipeline(&settings.engine.shape)?;

        let required = &settings.required_features;
        let n_buckets = settings.buckets.len();
        let mut cells = vec![vec![ErrorAccumulator::default(); n_buckets]; required.len()];
        let mut windows = 0;

        for window in settings.engine.windows().build(raw) {
            let Some(target) = window.target else {
                continue;
            };
            let normalized = predict_window(handle, &settings.engine, window.input)?;
            let forecast = to_physical(handle, &settings.engine, normalized.view())?;

            for (v, (feature, &k)) in required.iter().zip(&columns).enumerate() {
                let truth = target.column(feature.index());
                for (step, (actual, predicted)) in
                    truth.iter().zip(forecast.column(k).iter()).enumerate()
                {
                    if let Some(b) = settings.buckets.bucket_of(step + 1) {
                        cells[v][b].push(*actual, *predicted, settings.mape_epsilon);
                    }
                }
            }
            windows += 1;
        }
        debug!(model = handle.id(), windows, "evaluated windows");

        self.summarize(handle, &columns, cells, windows)
    }

    fn summarize(
        &self,
        handle: &ModelHandle,
        columns: &[usize],
        cells: Vec<Vec<ErrorAccumulator>>,
        windows: usize,
    ) -> Result<ModelEvaluation> {
        let settings = &self.settings;
        let labels = settings.buckets.labels();
        let empty = || ForecastError::InsufficientHistory {
            required: settings.engine.shape.input_window + settings.engine.shape.output_window,
            available: 0,
        };

        let mut pooled = ErrorAccumulator::default();
        let mut per_bucket = vec![ErrorAccumulator::default(); labels.len()];
        let mut variables = Vec::with_capacity(cells.len());

        for (feature, row) in settings.required_features.iter().zip(&cells) {
            let mut overall = ErrorAccumulator::default();
            let mut buckets = Vec::with_capacity(row.len());
            for ((label, cell), bucket_total) in labels.iter().zip(row).zip(&mut per_bucket) {
                overall.merge(cell);
                bucket_total.merge(cell);
                if let Some(metrics) = cell.finish() {
                    buckets.push(BucketMetrics {
                        bucket: label.clone(),
                        metrics,
                    });
                }
            }
            pooled.merge(&overall);
            variables.push(VariableEvaluation {
                feature: *feature,
                overall: overall.finish().ok_or_else(empty)?,
                buckets,
            });
        }

        let degradation: Vec<DegradationPoint> = labels
            .iter()
            .zip(&per_bucket)
            .filter_map(|(label, acc)| {
                acc.finish().map(|m| DegradationPoint {
                    bucket: label.clone(),
                    rmse: m.rmse,
                })
            })
            .collect();
        let degradation_flag = match (degradation.first(), degradation.last()) {
            (Some(first), Some(last)) if degradation.len() > 1 => {
                last.rmse < first.rmse * (1.0 - settings.degradation_tolerance)
            }
            _ => false,
        };
        if degradation_flag {
            warn!(
                model = handle.id(),
                "long-horizon error below short-horizon error; check for leakage"
            );
        }

        Ok(ModelEvaluation {
            model_id: handle.id().to_string(),
            family: handle.family(),
            prediction_mode: handle.prediction_mode(),
            windows,
            aggregate: pooled.finish().ok_or_else(empty)?,
            variables,
            degradation,
            degradation_flag,
            uncertainty: self.bucket_uncertainty(handle, columns)?,
        })
    }

    fn bucket_uncertainty(
        &self,
        handle: &ModelHandle,
        columns: &[usize],
    ) -> Result<Option<Vec<BucketUncertainty>>> {
        let Some(std) = handle.horizon_uncertainty()? else {
            return Ok(None);
        };
        let settings = &self.settings;
        let labels = settings.buckets.labels();
        let mut sums = vec![vec![0.0; columns.len()]; labels.len()];
        let mut counts = vec![0usize; labels.len()];

        for (step, row) in std.rows().into_iter().enumerate() {
            if let Some(b) = settings.buckets.bucket_of(step + 1) {
                for (v, &k) in columns.iter().enumerate() {
                    sums[b][v] += row[k];
                }
                counts[b] += 1;
            }
        }

        Ok(Some(
            labels
                .into_iter()
                .zip(sums.iter().zip(&counts))
                .filter(|(_, (_, count))| **count > 0)
                .map(|(bucket, (sum, &count))| BucketUncertainty {
                    bucket,
                    std: settings
                        .required_features
                        .iter()
                        .enumerate()
                        .map(|(v, f)| (*f, sum[v] / count as f64))
                        .collect(),
                })
                .collect(),
        ))
    }
}
