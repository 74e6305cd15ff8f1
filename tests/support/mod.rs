//! Shared fixtures for the integration suites: synthetic hourly weather,
//! CSV export and model artifacts written the way a training job would.
#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::{Path, PathBuf};

use weather_forecaster::config::Config;
use weather_forecaster::domain::{
    vapour_pressure_deficit, Feature, Observation, ObservationSeries, FEATURE_COUNT,
};
use weather_forecaster::forecast::HorizonBuckets;
use weather_forecaster::ml::artifact::{save_blob, ModelConfigRecord};
use weather_forecaster::ml::models::{
    ArComponentWeights, AttentionWeights, EncoderLayerWeights, LayerNormWeights,
    RecurrentWeights, UnivariateWeights, VarWeights,
};
use weather_forecaster::ml::{DenseWeights, ModelFamily, PredictionMode};

pub const INPUT_WINDOW: usize = 24;
pub const OUTPUT_WINDOW: usize = 12;

pub const SERVED: [Feature; 3] = [
    Feature::Temperature,
    Feature::RelativeHumidity,
    Feature::WindSpeed,
];

/// Config for a one-day window and a twelve-hour horizon
pub fn small_config() -> Config {
    let mut config = Config::default();
    config.pipeline.input_window = INPUT_WINDOW;
    config.pipeline.output_window = OUTPUT_WINDOW;
    config.pipeline.output_features = SERVED.to_vec();
    config.evaluation.buckets = HorizonBuckets::new(vec![4, 8, 12]).expect("valid buckets");
    config.evaluation.required_features = SERVED.to_vec();
    config.check().expect("valid config");
    config
}

/// Diurnal weather with seeded Gaussian noise, hourly from 2024-03-01T00:00Z
pub fn synthetic_series(hours: usize, seed: u64, noise_std: f64) -> ObservationSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_std).expect("valid noise");
    let start = Utc
        .with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
        .single()
        .expect("valid start");

    let observations = (0..hours)
        .map(|i| {
            let day = (i % 24) as f64 / 24.0 * std::f64::consts::TAU;
            let synoptic = i as f64 / 96.0 * std::f64::consts::TAU;
            let t = 10.0 + 6.0 * day.sin() + 2.0 * synoptic.sin() + noise.sample(&mut rng);
            let rh = (70.0 - 18.0 * day.sin() + 3.0 * noise.sample(&mut rng)).clamp(5.0, 100.0);
            let dew = t - (100.0 - rh) / 5.0;
            let wind = (14.0 + 5.0 * day.cos() + noise.sample(&mut rng)).max(0.0);
            let pressure = 1012.0 + 6.0 * synoptic.cos() + 0.3 * noise.sample(&mut rng);
            let cloud = (45.0 + 25.0 * synoptic.sin() + 4.0 * noise.sample(&mut rng))
                .clamp(0.0, 100.0);
            let values: [f64; FEATURE_COUNT] = [
                t,
                rh,
                dew,
                wind,
                pressure,
                cloud,
                vapour_pressure_deficit(t, rh),
            ];
            Observation::new(start + Duration::hours(i as i64), values)
        })
        .collect();
    ObservationSeries::new(observations).expect("valid series")
}

/// Provider-style CSV export without the derived VPD column
pub fn write_csv(dir: &Path, series: &ObservationSeries) -> PathBuf {
    let path = dir.join("observations.csv");
    let mut writer = csv::Writer::from_path(&path).expect("create csv");
    writer
        .write_record([
            "time",
            "temperature_2m (°C)",
            "relative_humidity_2m (%)",
            "dew_point_2m (°C)",
            "wind_speed_10m (km/h)",
            "pressure_msl (hPa)",
            "cloud_cover (%)",
        ])
        .expect("write header");
    for obs in series.observations() {
        let mut row = vec![obs.timestamp.format("%Y-%m-%dT%H:%M").to_string()];
        row.extend(obs.values[..6].iter().map(|v| format!("{v:.6}")));
        writer.write_record(&row).expect("write row");
    }
    writer.flush().expect("flush csv");
    path
}

/// Write a config record next to its weights blob and return the record path
pub fn write_record(
    dir: &Path,
    id: &str,
    family: ModelFamily,
    mode: Option<PredictionMode>,
    outputs: &[Feature],
    weights: &str,
    scaler: Option<&str>,
) -> PathBuf {
    let record = ModelConfigRecord {
        id: id.to_string(),
        family,
        input_window: INPUT_WINDOW,
        output_window: OUTPUT_WINDOW,
        input_features: Feature::ALL.to_vec(),
        output_features: outputs.to_vec(),
        prediction_mode: mode,
        weights: PathBuf::from(weights),
        scaler: scaler.map(PathBuf::from),
    };
    let path = dir.join(format!("{id}.model.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&record).expect("encode record"))
        .expect("write record");
    path
}

pub fn write_weights<T: serde::Serialize>(dir: &Path, file: &str, weights: &T) {
    save_blob(&dir.join(file), weights).expect("write weights");
}

fn dense(rows: usize, cols: usize, bias: f64) -> DenseWeights {
    DenseWeights {
        weight: vec![vec![0.0; cols]; rows],
        bias: vec![bias; rows],
    }
}

/// AR(1) with unit coefficient: repeats the last normalized value
pub fn persistence_ar(outputs: &[Feature]) -> UnivariateWeights {
    UnivariateWeights {
        components: outputs
            .iter()
            .map(|&feature| ArComponentWeights {
                feature,
                intercept: 0.0,
                coefficients: vec![1.0],
                sigma: 0.02,
            })
            .collect(),
    }
}

/// VAR(1) with identity lag matrix
pub fn identity_var(k: usize) -> VarWeights {
    let identity = (0..k)
        .map(|i| (0..k).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    VarWeights {
        intercept: vec![0.0; k],
        lags: vec![identity],
    }
}

/// GRU whose autoregressive head ignores the hidden state
pub fn constant_gru(k: usize, value: f64) -> RecurrentWeights {
    let hidden = 2;
    RecurrentWeights {
        hidden_size: hidden,
        input: dense(3 * hidden, FEATURE_COUNT, 0.0),
        hidden: dense(3 * hidden, hidden, 0.0),
        head: dense(k, hidden, value),
    }
}

/// Encoder whose output head ignores the pooled representation
pub fn constant_attention(k: usize, value: f64) -> AttentionWeights {
    let dim = 4;
    let norm = || LayerNormWeights {
        gamma: vec![1.0; dim],
        beta: vec![0.0; dim],
    };
    AttentionWeights {
        model_dim: dim,
        num_heads: 2,
        input_proj: dense(dim, FEATURE_COUNT, 0.0),
        layers: vec![EncoderLayerWeights {
            query: dense(dim, dim, 0.0),
            key: dense(dim, dim, 0.0),
            value: dense(dim, dim, 0.0),
            out: dense(dim, dim, 0.0),
            norm1: norm(),
            feed_forward1: dense(8, dim, 0.0),
            feed_forward2: dense(dim, 8, 0.0),
            norm2: norm(),
        }],
        head_hidden: dense(6, dim, 0.0),
        head_out: dense(OUTPUT_WINDOW * k, 6, value),
    }
}
