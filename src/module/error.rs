use std::time::Duration;

use thiserror::Error;

use crate::module::vision::ModuleState;

/// Module lifecycle errors.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module '{camera}' cannot {action} while {state:?}")]
    InvalidTransition {
        camera: String,
        action: &'static str,
        state: ModuleState,
    },

    #[error("module '{camera}' did not stop within {waited:?}")]
    StopTimeout { camera: String, waited: Duration },

    #[error("failed to spawn loop thread for '{camera}': {source}")]
    Spawn {
        camera: String,
        #[source]
        source: std::io::Error,
    },

    #[error("a module for camera '{0}' already exists")]
    DuplicateCamera(String),

    #[error("no module for camera '{0}'")]
    UnknownCamera(String),

    #[error("module manager is shutting down")]
    ShuttingDown,
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, ModuleError>;
