use thiserror::Error;

/// Error type returned by a stage's `process`.
pub type StageError = Box<dyn std::error::Error + Send + Sync>;

/// Pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage '{stage}' failed: {cause}")]
    StageFailure { stage: String, cause: String },

    #[error("no stage named '{0}'")]
    UnknownStage(String),

    #[error("invalid params for stage '{stage}': {cause}")]
    InvalidParams { stage: String, cause: String },

    #[error("stage '{stage}' received data of the wrong type")]
    TypeMismatch { stage: String },
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
