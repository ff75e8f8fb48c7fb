//! Error types for both workflows
//!
//! The inference taxonomy distinguishes the failure modes that matter when
//! reading logs: a missing base model, a bad adapter file, no usable device,
//! tokenizer trouble, a failed forward pass, or a failed image write.

use std::path::PathBuf;

/// Errors raised by the inference workflow.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("failed to load model component {component}: {message}")]
    ModelLoad {
        component: &'static str,
        message: String,
    },

    #[error("adapter load failure: {0}")]
    AdapterLoad(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("tokenizer failure: {0}")]
    Tokenizer(String),

    #[error("generation failed: {0}")]
    Generation(#[from] candle_core::Error),

    #[error("image encoding failed: {0}")]
    ImageEncode(String),

    #[error("failed to write image {path:?}: {source}")]
    ImageWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors raised by the training wrapper before the child process runs.
///
/// Failures inside the child itself are not represented here; they surface
/// only through the captured output, as the wrapper does not turn the
/// child's exit status into an error.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// Display text doubles as the user-facing message.
    #[error("PROMPT is not set. Exiting.")]
    EmptyPrompt,

    #[error("could not determine home directory")]
    NoHomeDir,

    #[error("failed to stage accelerate config {path:?}: {source}")]
    ConfigStaging {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to launch training process: {0}")]
    Launch(std::io::Error),
}
