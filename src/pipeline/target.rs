use std::sync::Arc;

use pose_wire::Transform3d;
use serde::Serialize;

use crate::camera::calibration::CalibrationCoefficients;
use crate::camera::types::{Frame, Resolution};

/// What a vision pipeline consumes: one frame plus the calibration for
/// the active video mode, if any.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub frame: Frame,
    pub calibration: Option<Arc<CalibrationCoefficients>>,
}

/// A target candidate in pixel space, as reported by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTarget {
    pub center_x: f64,
    pub center_y: f64,
    pub area_px: f64,
    /// Corner points, when the detector reports them.
    pub corners: Vec<(f64, f64)>,
}

/// Output of the detection stage.
#[derive(Debug, Clone)]
pub struct Detections {
    pub input: FrameInput,
    pub targets: Vec<RawTarget>,
}

/// A target in camera-relative angular terms.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTarget {
    /// Degrees, positive to the right of the optical axis.
    pub yaw: f64,
    /// Degrees, positive above the optical axis.
    pub pitch: f64,
    /// Percentage of the image area covered.
    pub area: f64,
    pub center_x: f64,
    pub center_y: f64,
    /// Camera-to-target transform, when calibration allowed solving it.
    pub pose: Option<Transform3d>,
    pub calibrated: bool,
}

/// Final output of a vision pipeline for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetList {
    pub timestamp_nanos: u64,
    pub resolution: Resolution,
    pub targets: Vec<TrackedTarget>,
    /// Pose solving was requested but no calibration matches the frame.
    pub uncalibrated: bool,
}

impl TargetList {
    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    /// The largest target, if any. Stages keep targets sorted by area.
    pub fn best(&self) -> Option<&TrackedTarget> {
        self.targets.first()
    }
}
