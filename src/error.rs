use thiserror::Error;

/// Errors produced by the fingerprinting pipeline, the index builder and the store
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// Bad STFT, peak extraction or matcher arguments. Never retried.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A single file could not be decoded into PCM samples
    #[error("failed to decode {path}: {message}")]
    Decode { path: String, message: String },

    /// Reading or writing the persisted index failed
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl FingerprintError {
    pub(crate) fn decode(path: &str, message: impl ToString) -> Self {
        FingerprintError::Decode {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<redis::RedisError> for FingerprintError {
    fn from(err: redis::RedisError) -> Self {
        FingerprintError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FingerprintError>;
