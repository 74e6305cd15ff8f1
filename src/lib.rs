//! Hourly multivariate weather forecasting core
//!
//! Observations are ingested into a validated hourly series, normalized with
//! the parameters a model was trained with, sliced into input windows and
//! handed to one of several model families. The engine serves a single
//! 72-hour forecast; the evaluation harness compares every registered model
//! over a held-out span.

pub mod config;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod ingest;
pub mod ml;
pub mod telemetry;

pub use error::{ErrorKind, ForecastError, Result};
