//! Error taxonomy shared by every stage of a training run.

use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

/// Errors raised while configuring, feeding, training or persisting the encoder.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Loss name other than `cross` or `distance`.
    #[error("unsupported loss `{0}`, expected `cross` or `distance`")]
    UnsupportedLoss(String),

    /// Hyperparameter preset name that is not registered.
    #[error("unknown hyperparameter preset `{0}`")]
    UnknownPreset(String),

    /// A resolved configuration that violates a structural constraint.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Layered settings could not be merged or deserialized.
    #[error("failed to resolve settings: {0}")]
    Settings(#[from] config::ConfigError),

    /// A mask position was requested for a zero-length sequence.
    #[error("cannot sample a mask position from an empty sequence")]
    EmptySequence,

    /// A record whose fields disagree in length or shape.
    #[error("malformed record {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },

    /// Category id absent from the grouping table.
    #[error("category {0} has no group in the lookup table")]
    UnknownCategory(i64),

    /// Host-side tensor readback failed.
    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("checkpoint recorder failed: {0}")]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Finalization needs the best-weights artifact written during validation.
    #[error("best weights not found at {}", .0.display())]
    MissingBestWeights(PathBuf),

    /// An epoch observer reported a failure.
    #[error("epoch observer failed at epoch {epoch}: {reason}")]
    Observer { epoch: usize, reason: String },
}

impl EncoderError {
    pub fn malformed(index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            index,
            reason: reason.into(),
        }
    }
}

impl From<burn::tensor::DataError> for EncoderError {
    fn from(err: burn::tensor::DataError) -> Self {
        Self::TensorData(format!("{:?}", err))
    }
}

pub type Result<T> = std::result::Result<T, EncoderError>;
