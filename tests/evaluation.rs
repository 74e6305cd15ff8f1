//! Model comparison over held-out data
//!
//! One model per family plus models that must be kept out of the ranking:
//! a model forecasting too few variables, one without a scaler and one
//! whose artifact is missing.

mod support;

use std::sync::Arc;

use weather_forecaster::domain::{Feature, ObservationSeries};
use weather_forecaster::forecast::{
    EvaluationHarness, EvaluationReport, EvaluationSettings, FeatureNormalizer, ModelOutcome,
    NormalizationParameters,
};
use weather_forecaster::ml::models::{AttentionModel, MultivariateModel, UnivariateModel};
use weather_forecaster::ml::registry::{ModelHandle, ModelRegistry};
use weather_forecaster::ml::{ModelAdapter, ModelSpec};
use weather_forecaster::{ErrorKind, ForecastError};

use support::*;

fn spec(outputs: &[Feature]) -> ModelSpec {
    ModelSpec {
        input_window: INPUT_WINDOW,
        output_window: OUTPUT_WINDOW,
        output_features: outputs.to_vec(),
    }
}

fn handle(
    id: &str,
    adapter: impl ModelAdapter + 'static,
    scaler: Option<&NormalizationParameters>,
) -> ModelHandle {
    ModelHandle::new(id, Box::new(adapter), scaler.cloned())
}

struct Bench {
    registry: Arc<ModelRegistry>,
    holdout: ObservationSeries,
    harness: EvaluationHarness,
}

/// Ten days of training data for the scaler, ten held out
fn bench() -> Bench {
    let config = small_config();
    let series = synthetic_series(480, 3, 0.3);
    let (train, holdout) = series.split_at(240);
    let scaler = FeatureNormalizer::new(config.normalizer.clone())
        .fit(&train)
        .unwrap();
    let k = SERVED.len();

    let mut registry = ModelRegistry::new(config.pipeline.shape(), None);
    let models = vec![
        handle(
            "ar_persistence",
            UnivariateModel::from_weights(spec(&SERVED), persistence_ar(&SERVED)).unwrap(),
            Some(&scaler),
        ),
        handle(
            "var_identity",
            MultivariateModel::from_weights(spec(&SERVED), identity_var(k)).unwrap(),
            Some(&scaler),
        ),
        handle(
            "attention_constant",
            AttentionModel::from_weights(spec(&SERVED), constant_attention(k, 0.5)).unwrap(),
            Some(&scaler),
        ),
        handle(
            "ar_temperature_only",
            UnivariateModel::from_weights(
                spec(&[Feature::Temperature]),
                persistence_ar(&[Feature::Temperature]),
            )
            .unwrap(),
            Some(&scaler),
        ),
        handle(
            "var_unscaled",
            MultivariateModel::from_weights(spec(&SERVED), identity_var(k)).unwrap(),
            None,
        ),
    ];
    for model in models {
        registry.register(model).unwrap();
    }
    assert!(registry.load("artifacts/ghost.json").is_err());

    Bench {
        registry: Arc::new(registry),
        holdout,
        harness: EvaluationHarness::new(EvaluationSettings::from_config(&config)),
    }
}

fn excluded_kind(report: &EvaluationReport, id: &str) -> ErrorKind {
    match report.outcome(id) {
        Some(ModelOutcome::Excluded { kind, .. }) => *kind,
        other => panic!("{id}: expected exclusion, got {other:?}"),
    }
}

#[test]
fn test_comparison_ranks_only_comparable_models() {
    let bench = bench();
    let report = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();

    assert_eq!(report.models.len(), 6);
    let ranked: Vec<&str> = report.ranking.iter().map(|r| r.model_id.as_str()).collect();
    assert_eq!(ranked.len(), 3);
    for id in ["ar_persistence", "var_identity", "attention_constant"] {
        assert!(ranked.contains(&id), "{id} missing from {ranked:?}");
    }

    assert_eq!(
        excluded_kind(&report, "ar_temperature_only"),
        ErrorKind::IncomparableModels
    );
    assert_eq!(excluded_kind(&report, "var_unscaled"), ErrorKind::Normalization);
    match report.outcome("ghost") {
        Some(ModelOutcome::Unavailable { kind, .. }) => {
            assert_eq!(*kind, ErrorKind::ModelUnavailable)
        }
        other => panic!("expected unavailable, got {other:?}"),
    }
}

#[test]
fn test_ranking_order_and_ties() {
    let bench = bench();
    let report = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();

    for (i, entry) in report.ranking.iter().enumerate() {
        assert_eq!(entry.rank, i + 1);
    }
    for pair in report.ranking.windows(2) {
        assert!(pair[0].rmse <= pair[1].rmse);
    }

    // identical persistence forecasts tie on every metric and fall back to id order
    let position = |id: &str| report.ranking.iter().position(|r| r.model_id == id).unwrap();
    let ar = &report.ranking[position("ar_persistence")];
    let var = &report.ranking[position("var_identity")];
    assert_eq!(ar.rmse, var.rmse);
    assert_eq!(ar.mae, var.mae);
    assert_eq!(position("var_identity"), position("ar_persistence") + 1);
    assert_eq!(report.best().map(|r| r.rank), Some(1));
}

#[test]
fn test_sample_counts_cover_every_window() {
    let bench = bench();
    let report = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();

    let windows = bench.holdout.len() + 1 - INPUT_WINDOW - OUTPUT_WINDOW;
    assert_eq!(report.holdout.windows, windows);
    assert_eq!(report.holdout.observations, 240);
    assert_eq!(report.buckets, vec!["1-4h", "5-8h", "9-12h"]);

    let eval = report.outcome("attention_constant").unwrap().evaluation().unwrap();
    assert_eq!(eval.windows, windows);
    assert_eq!(eval.aggregate.sample_count, windows * OUTPUT_WINDOW * SERVED.len());
    assert!(eval.aggregate.rmse >= eval.aggregate.mae);
    assert_eq!(eval.variables.len(), SERVED.len());
    for variable in &eval.variables {
        let overall = &variable.overall;
        assert_eq!(overall.sample_count, windows * OUTPUT_WINDOW);
        assert_eq!(overall.mape_samples + overall.mape_excluded, overall.sample_count);
        let bucketed: usize = variable.buckets.iter().map(|b| b.metrics.sample_count).sum();
        assert_eq!(bucketed, overall.sample_count);
    }
}

#[test]
fn test_persistence_error_grows_with_lead_time() {
    let bench = bench();
    let report = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();
    let eval = report.outcome("ar_persistence").unwrap().evaluation().unwrap();

    assert_eq!(eval.degradation.len(), 3);
    let first = eval.degradation.first().unwrap().rmse;
    let last = eval.degradation.last().unwrap().rmse;
    assert!(last > first, "first {first}, last {last}");
    assert!(!eval.degradation_flag);
}

#[test]
fn test_uncertainty_only_for_models_that_carry_it() {
    let bench = bench();
    let report = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();

    let ar = report.outcome("ar_persistence").unwrap().evaluation().unwrap();
    let buckets = ar.uncertainty.as_ref().unwrap();
    assert_eq!(buckets.len(), 3);
    for feature in SERVED {
        let stds: Vec<f64> = buckets.iter().map(|b| b.std[&feature]).collect();
        assert!(stds.windows(2).all(|w| w[1] > w[0]), "{feature}: {stds:?}");
    }

    let attention = report.outcome("attention_constant").unwrap().evaluation().unwrap();
    assert!(attention.uncertainty.is_none());
}

#[test]
fn test_short_holdout_rejected() {
    let bench = bench();
    let err = bench
        .harness
        .compare(&bench.registry, &bench.holdout.tail(30))
        .unwrap_err();
    assert_eq!(
        err,
        ForecastError::InsufficientHistory {
            required: INPUT_WINDOW + OUTPUT_WINDOW,
            available: 30
        }
    );
}

#[test]
fn test_report_serializes_with_status_tags() {
    let bench = bench();
    let report = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();
    let json = serde_json::to_value(&report).unwrap();

    let statuses: Vec<&str> = json["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == "evaluated").count(), 3);
    assert_eq!(statuses.iter().filter(|s| **s == "excluded").count(), 2);
    assert_eq!(statuses.iter().filter(|s| **s == "unavailable").count(), 1);

    let table = report.to_string();
    assert!(table.contains("ar_persistence"));
    assert!(table.contains("ghost"));
}

#[tokio::test]
async fn test_parallel_comparison_matches_sequential() {
    let bench = bench();
    let sequential = bench.harness.compare(&bench.registry, &bench.holdout).unwrap();
    let parallel = bench
        .harness
        .compare_parallel(Arc::clone(&bench.registry), &bench.holdout)
        .await
        .unwrap();
    assert_eq!(parallel, sequential);
}
