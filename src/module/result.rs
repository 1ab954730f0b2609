use serde::Serialize;

use crate::camera::types::CameraId;
use crate::pipeline::target::TargetList;

/// One module iteration's outcome, as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionResult {
    pub camera: CameraId,
    pub camera_index: usize,
    pub pipeline: String,
    pub targets: TargetList,
    /// Sum of the pipeline's stage times.
    pub pipeline_nanos: u64,
    /// Capture to publish.
    pub latency_nanos: u64,
    /// Monotonic publish time.
    pub published_nanos: u64,
    /// Re-publication of the previous result after a failed run.
    pub stale: bool,
}

impl VisionResult {
    pub fn latency_ms(&self) -> f64 {
        self.latency_nanos as f64 / 1e6
    }

    /// Copy of `self` marked stale, re-stamped at `now_nanos`.
    pub fn restamped_stale(&self, now_nanos: u64) -> Self {
        Self {
            stale: true,
            published_nanos: now_nanos,
            ..self.clone()
        }
    }
}
