use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use weather_forecaster::config::Config;
use weather_forecaster::forecast::{
    EngineSettings, EvaluationHarness, EvaluationSettings, ForecastEngine,
};
use weather_forecaster::ingest::DataIngestor;
use weather_forecaster::ml::registry::{ModelRegistry, ModelStatus};
use weather_forecaster::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;
    let csv_path = std::env::args()
        .nth(1)
        .context("usage: weather-forecaster <observations.csv>")?;

    let series = DataIngestor::new()
        .from_csv_path(&csv_path)
        .with_context(|| format!("reading {csv_path}"))?;
    info!(path = %csv_path, observations = series.len(), "observations ingested");

    let mut registry = ModelRegistry::new(cfg.pipeline.shape(), cfg.normalizer.epsilon);
    let loaded = registry.load_all(&cfg.artifacts.models);
    if loaded == 0 {
        warn!(configured = cfg.artifacts.models.len(), "no model could be loaded");
    }
    for (id, status) in registry.status() {
        if let ModelStatus::Unavailable { kind, detail } = status {
            warn!(model = %id, %kind, %detail, "model unavailable");
        }
    }
    let registry = Arc::new(registry);

    let holdout = series.tail(cfg.evaluation.holdout_hours.min(series.len()));
    let harness = EvaluationHarness::new(EvaluationSettings::from_config(&cfg));
    let report = if cfg.evaluation.parallel {
        harness
            .compare_parallel(Arc::clone(&registry), &holdout)
            .await?
    } else {
        harness.compare(&registry, &holdout)?
    };
    eprintln!("{report}");
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(model) = &cfg.engine.production_model {
        let location = cfg
            .engine
            .location
            .clone()
            .context("engine.location is required to serve a forecast")?;
        let engine = ForecastEngine::new(registry, EngineSettings::from_config(&cfg));
        let response = engine.respond(model, location, &series);
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    Ok(())
}
