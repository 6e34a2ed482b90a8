use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinancialOpsError {
    #[error("Failed to parse statement file: {0}")]
    Parse(String),

    #[error("Unsupported statement file type: {0}")]
    UnsupportedFileType(String),

    #[error("Invalid month identifier '{0}': expected YYYY-MM")]
    InvalidMonth(String),

    #[error("Unknown metric key: {0}")]
    UnknownMetric(String),

    #[error("Metric '{0}' is derived from a calculation and cannot be stored directly")]
    DerivedMetricWrite(String),

    #[error("Invalid forecast weights: {0}")]
    InvalidForecastWeights(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FinancialOpsError>;
