use thiserror::Error;

use crate::camera::calibration::CalibrationCoefficients;
use crate::camera::types::CameraId;
use crate::module::settings::VisionModuleSettings;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// Where per-camera settings and calibrations live between runs.
///
/// Callers treat every error as non-fatal: a failed load falls back to
/// defaults and a failed save is logged.
pub trait ConfigStore: Send + Sync {
    fn load_calibration(
        &self,
        camera: &CameraId,
    ) -> Result<Vec<CalibrationCoefficients>, PersistenceError>;

    fn save_calibration(
        &self,
        camera: &CameraId,
        coeffs: &CalibrationCoefficients,
    ) -> Result<(), PersistenceError>;

    /// `None` when nothing was saved for this camera yet.
    fn load_settings(
        &self,
        camera: &CameraId,
    ) -> Result<Option<VisionModuleSettings>, PersistenceError>;

    fn save_settings(
        &self,
        camera: &CameraId,
        settings: &VisionModuleSettings,
    ) -> Result<(), PersistenceError>;
}
