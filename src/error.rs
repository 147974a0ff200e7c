//! Error type for model construction, state loading and weight tying

use candle_core::{DType, Shape};

#[derive(thiserror::Error, Debug)]
pub enum ControlLoraError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("state dict mismatch: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    StateDict {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("shape mismatch for {path}: model has {expected:?}, state dict has {actual:?}")]
    ShapeMismatch {
        path: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("cannot tie {path}: no such parameter in the adapted network")]
    TieTarget { path: String },

    #[error("cannot tie {path}: {ours:?}/{our_dtype:?} vs {theirs:?}/{their_dtype:?}")]
    TieMismatch {
        path: String,
        ours: Shape,
        our_dtype: DType,
        theirs: Shape,
        their_dtype: DType,
    },

    #[error("latent conditioning is enabled but no encoder is bound, call bind_encoder first")]
    EncoderNotBound,

    #[error("missing forward input: {0}")]
    MissingInput(&'static str),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, ControlLoraError>;

pub(crate) fn config_err(msg: impl Into<String>) -> ControlLoraError {
    ControlLoraError::Config(msg.into())
}
