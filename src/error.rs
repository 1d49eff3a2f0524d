use thiserror::Error;

/// Domain failures that callers may want to tell apart after they have been
/// wrapped into `anyhow::Error`.
#[derive(Debug, Error)]
pub enum CurateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("outside recognition polygon: {0}")]
    GeofenceRejection(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),
}

impl CurateError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn insufficient(message: impl Into<String>) -> Self {
        Self::InsufficientData(message.into())
    }
}
