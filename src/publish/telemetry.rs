use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::dispatch::{DataChangeSubscriber, HandlerError};
use crate::bus::event::{DataChangeEvent, DestType, EventFilter, SourceType};
use crate::camera::types::CameraId;
use crate::module::result::VisionResult;

/// Latest telemetry for one camera, flattened to the fields robot code
/// reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEntry {
    pub camera: CameraId,
    pub pipeline: String,
    pub has_target: bool,
    pub yaw: f64,
    pub pitch: f64,
    pub area: f64,
    pub latency_ms: f64,
    /// Best target's pose in the 56-byte wire layout.
    pub pose: Option<Vec<u8>>,
    pub timestamp_nanos: u64,
    pub stale: bool,
}

impl From<&VisionResult> for TelemetryEntry {
    fn from(result: &VisionResult) -> Self {
        let best = result.targets.best();
        Self {
            camera: result.camera.clone(),
            pipeline: result.pipeline.clone(),
            has_target: best.is_some(),
            yaw: best.map_or(0.0, |t| t.yaw),
            pitch: best.map_or(0.0, |t| t.pitch),
            area: best.map_or(0.0, |t| t.area),
            latency_ms: result.latency_ms(),
            pose: best.and_then(|t| t.pose).map(|p| p.encode().to_vec()),
            timestamp_nanos: result.published_nanos,
            stale: result.stale,
        }
    }
}

/// Keeps the newest entry per camera index.
pub struct TelemetryPublisher {
    filter: EventFilter,
    table: RwLock<BTreeMap<usize, TelemetryEntry>>,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        Self {
            filter: EventFilter::new([SourceType::VisionModule], [DestType::Ui]),
            table: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, result: &VisionResult) {
        self.table
            .write()
            .insert(result.camera_index, TelemetryEntry::from(result));
    }

    pub fn latest(&self, camera_index: usize) -> Option<TelemetryEntry> {
        self.table.read().get(&camera_index).cloned()
    }

    /// All entries, ordered by camera index.
    pub fn entries(&self) -> Vec<(usize, TelemetryEntry)> {
        self.table
            .read()
            .iter()
            .map(|(i, e)| (*i, e.clone()))
            .collect()
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl DataChangeSubscriber for TelemetryPublisher {
    fn name(&self) -> &str {
        "telemetry"
    }

    fn filter(&self) -> &EventFilter {
        &self.filter
    }

    fn on_event(&self, event: &DataChangeEvent) -> Result<(), HandlerError> {
        if let Some(result) = event.value().as_result() {
            self.record(result);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::dispatch::DataChangeBus;
    use crate::camera::types::Resolution;
    use crate::pipeline::target::{TargetList, TrackedTarget};
    use pose_wire::{Quaternion, Transform3d, Translation3d, POSE_LEN};
    use std::sync::Arc;

    fn target(area: f64, z: f64) -> TrackedTarget {
        TrackedTarget {
            yaw: 12.0,
            pitch: 3.0,
            area,
            center_x: 0.0,
            center_y: 0.0,
            pose: Some(Transform3d::new(
                Translation3d { x: 0.0, y: 0.0, z },
                Quaternion::IDENTITY,
            )),
            calibrated: true,
        }
    }

    fn result(index: usize, targets: Vec<TrackedTarget>) -> VisionResult {
        VisionResult {
            camera: CameraId::new("front"),
            camera_index: index,
            pipeline: "targets".to_string(),
            targets: TargetList {
                timestamp_nanos: 5,
                resolution: Resolution::new(640, 480),
                targets,
                uncalibrated: false,
            },
            pipeline_nanos: 1_000_000,
            latency_nanos: 8_000_000,
            published_nanos: 9,
            stale: false,
        }
    }

    #[test]
    fn entry_reflects_best_target_and_encodes_pose() {
        let entry = TelemetryEntry::from(&result(0, vec![target(4.0, 1.5), target(1.0, 9.0)]));
        assert!(entry.has_target);
        assert_eq!(entry.area, 4.0);
        assert_eq!(entry.latency_ms, 8.0);
        let pose = entry.pose.unwrap();
        assert_eq!(pose.len(), POSE_LEN);
        assert_eq!(Transform3d::decode(&pose).unwrap().translation.z, 1.5);
    }

    #[test]
    fn empty_result_has_no_target() {
        let entry = TelemetryEntry::from(&result(0, Vec::new()));
        assert!(!entry.has_target);
        assert_eq!(entry.yaw, 0.0);
        assert!(entry.pose.is_none());
    }

    #[test]
    fn table_keeps_latest_per_camera() {
        let bus = DataChangeBus::new();
        let telemetry = Arc::new(TelemetryPublisher::new());
        bus.subscribe(telemetry.clone());

        bus.publish(&DataChangeEvent::vision_result(Arc::new(result(
            0,
            vec![target(2.0, 1.0)],
        ))));
        bus.publish(&DataChangeEvent::vision_result(Arc::new(result(0, Vec::new()))));
        bus.publish(&DataChangeEvent::vision_result(Arc::new(result(
            1,
            vec![target(2.0, 1.0)],
        ))));

        assert!(!telemetry.latest(0).unwrap().has_target);
        assert!(telemetry.latest(1).unwrap().has_target);
        assert!(telemetry.latest(2).is_none());
        let indexes: Vec<usize> = telemetry.entries().into_iter().map(|(i, _)| i).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn settings_events_are_ignored() {
        let bus = DataChangeBus::new();
        let telemetry = Arc::new(TelemetryPublisher::new());
        bus.subscribe(telemetry.clone());
        let report = bus.publish(&DataChangeEvent::json(
            SourceType::Websocket,
            DestType::ActiveModule,
            "exposure",
            serde_json::json!(3.0),
        ));
        assert_eq!(report.delivered, 0);
        assert!(telemetry.entries().is_empty());
    }
}
