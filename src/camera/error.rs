use thiserror::Error;

/// Frame source and camera control errors.
///
/// Every variant is recoverable from the vision loop's point of view: the
/// iteration is skipped and the loop carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("frame not ready from {0}")]
    NotReady(String),

    #[error("camera disconnected: {0}")]
    Disconnected(String),

    #[error("control write failed: {0}")]
    ControlWrite(String),

    #[error("invalid video mode index {index} ({available} modes available)")]
    InvalidVideoMode { index: usize, available: usize },
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CameraError>;
