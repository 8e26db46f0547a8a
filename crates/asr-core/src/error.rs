//! Error types for RustASR.

use thiserror::Error;

/// Main error type for ASR operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Нарушение контракта по формам тензоров (batch, длины, маски).
    #[error("Shape error: {0}")]
    Shape(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message() {
        let err = AsrError::Shape("decode ожидает batch=1, получено 4".into());
        assert_eq!(err.to_string(), "Shape error: decode ожидает batch=1, получено 4");
    }

    #[test]
    fn test_candle_error_converts() {
        fn fails() -> AsrResult<()> {
            Err(candle_core::Error::Msg("boom".into()))?
        }
        assert!(matches!(fails(), Err(AsrError::Candle(_))));
    }
}
