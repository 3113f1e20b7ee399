use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are the only failures treated as fatal at startup; everything
/// downstream degrades or is surfaced as a typed result instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load failed: {0}")]
    Load(String),

    #[error("invalid search weights: semantic {semantic} + keyword {keyword} must sum to 1.0")]
    WeightSum { semantic: f64, keyword: f64 },

    #[error("context layer ratios sum to {sum}, expected 1.0")]
    RatioSum { sum: f64 },

    #[error("{field} must be in [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("embedding dimension mismatch: model produces {model_dim}, store holds {store_dim}")]
    EmbeddingDim { model_dim: usize, store_dim: usize },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
