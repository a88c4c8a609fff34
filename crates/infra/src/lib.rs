//! Infrastructure layer: job stores, brokers, workers, config.

pub mod config;
pub mod jobs;
pub mod queue;


pub use config::{AnalyzerKind, AppConfig, ConfigError};
