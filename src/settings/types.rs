use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::camera::calibration::CalibrationCoefficients;
use crate::module::settings::VisionModuleSettings;

/// Everything persisted for one camera.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraRecord {
    pub settings: Option<VisionModuleSettings>,
    pub calibrations: Vec<CalibrationCoefficients>,
}

impl CameraRecord {
    /// Store `coeffs`, replacing any entry for the same resolution.
    pub fn put_calibration(&mut self, coeffs: CalibrationCoefficients) {
        self.calibrations
            .retain(|c| c.resolution != coeffs.resolution);
        self.calibrations.push(coeffs);
    }
}

/// Top-level settings file structure, mapping camera names to records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsFile {
    pub cameras: HashMap<String, CameraRecord>,
}
