use thiserror::Error;
use crate::sources::SourceError;

/// Errors surfaced by the file and network jobs. The metric derivation itself never fails.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("required column missing: {0}")]
    MissingColumn(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),
}
