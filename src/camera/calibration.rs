//! Per-resolution camera calibration.
//!
//! A camera holds at most one coefficient set per resolution. Selection
//! for a video mode is by exact resolution match only.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::camera::types::{CameraId, Resolution};
use crate::settings::persistence::ConfigStore;

/// Intrinsics and distortion for one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationCoefficients {
    pub resolution: Resolution,
    /// Row-major 3x3 camera matrix.
    pub camera_matrix: [[f64; 3]; 3],
    pub dist_coeffs: Vec<f64>,
    /// Reprojection error of each calibration view, in pixels.
    pub per_view_errors: Vec<f64>,
    /// Standard deviation of `per_view_errors`.
    pub standard_deviation: f64,
}

impl CalibrationCoefficients {
    pub fn new(
        resolution: Resolution,
        camera_matrix: [[f64; 3]; 3],
        dist_coeffs: Vec<f64>,
        per_view_errors: Vec<f64>,
    ) -> Self {
        let standard_deviation = std_dev(&per_view_errors);
        Self {
            resolution,
            camera_matrix,
            dist_coeffs,
            per_view_errors,
            standard_deviation,
        }
    }

    /// Mean reprojection error over all views, 0 when no views recorded.
    pub fn mean_error(&self) -> f64 {
        if self.per_view_errors.is_empty() {
            return 0.0;
        }
        self.per_view_errors.iter().sum::<f64>() / self.per_view_errors.len() as f64
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Calibrations for one camera, keyed by resolution.
pub struct CalibrationStore {
    camera: CameraId,
    entries: RwLock<Vec<Arc<CalibrationCoefficients>>>,
    persistence: Option<Arc<dyn ConfigStore>>,
}

impl CalibrationStore {
    /// Empty, in-memory only store.
    pub fn new(camera: CameraId) -> Self {
        Self {
            camera,
            entries: RwLock::new(Vec::new()),
            persistence: None,
        }
    }

    /// Load saved calibrations for `camera`. A failed load is logged and
    /// yields an empty store; it never prevents the camera from attaching.
    pub fn load(camera: CameraId, persistence: Arc<dyn ConfigStore>) -> Self {
        let loaded = match persistence.load_calibration(&camera) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Failed to load calibration for '{camera}': {e}");
                Vec::new()
            }
        };

        let store = Self {
            camera,
            entries: RwLock::new(Vec::new()),
            persistence: Some(persistence),
        };
        for coeffs in loaded {
            store.insert(coeffs);
        }
        store
    }

    /// Add a calibration, replacing any entry for the same resolution, and
    /// persist it. Save failures are logged only.
    pub fn add(&self, coeffs: CalibrationCoefficients) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save_calibration(&self.camera, &coeffs) {
                tracing::warn!(
                    "Failed to save {} calibration for '{}': {e}",
                    coeffs.resolution,
                    self.camera
                );
            }
        }
        tracing::info!(
            "Calibration for '{}' at {} updated (mean error {:.3}px)",
            self.camera,
            coeffs.resolution,
            coeffs.mean_error()
        );
        self.insert(coeffs);
    }

    fn insert(&self, coeffs: CalibrationCoefficients) {
        let mut entries = self.entries.write();
        entries.retain(|c| c.resolution != coeffs.resolution);
        entries.push(Arc::new(coeffs));
        entries.sort_by_key(|c| (c.resolution.pixels(), c.resolution.width));
    }

    /// Calibration for exactly `resolution`, if present.
    pub fn get(&self, resolution: Resolution) -> Option<Arc<CalibrationCoefficients>> {
        self.entries
            .read()
            .iter()
            .find(|c| c.resolution == resolution)
            .cloned()
    }

    /// All calibrations, smallest resolution first.
    pub fn all(&self) -> Vec<Arc<CalibrationCoefficients>> {
        self.entries.read().clone()
    }

    pub fn camera(&self) -> &CameraId {
        &self.camera
    }
}
