//! Error types for the VoiceAAE trainer

use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a training run.
///
/// Library functions return `anyhow::Result`; these variants are what ends up
/// inside it, so callers can `downcast_ref::<TrainError>()` to tell a bad
/// config apart from a diverged run.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Missing or out-of-range configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A loss evaluated to NaN or infinity
    #[error("Non-finite {loss} at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, loss: &'static str },

    /// A gradient norm evaluated to NaN or infinity before clipping
    #[error("Non-finite gradient norm for {group} at iteration {iteration}")]
    NonFiniteGradient { iteration: usize, group: &'static str },

    /// Checkpoint save, delete or load failed
    #[error("Checkpoint error at {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    /// The sample stream cannot produce triplets
    #[error("Sample stream error: {0}")]
    Stream(String),
}

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        TrainError::Config(msg.into())
    }

    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        TrainError::Checkpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
