//! Throttled result forwarding to the UI.
//!
//! Every result feeds the per-camera FPS smoother; at most one payload
//! per camera leaves every [`MIN_PUBLISH_INTERVAL_NANOS`], and it is
//! built from the newest result.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::dispatch::{DataChangeSubscriber, HandlerError};
use crate::bus::event::{DataChangeEvent, DestType, EventFilter, SourceType};
use crate::camera::types::monotonic_nanos;
use crate::module::result::VisionResult;
use crate::pipeline::target::TrackedTarget;
use crate::publish::fps::MedianFilter;

/// About 15 Hz.
pub const MIN_PUBLISH_INTERVAL_NANOS: u64 = 66_666_667;

/// One target as the UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTarget {
    pub yaw: f64,
    pub pitch: f64,
    pub area: f64,
    /// Base64 of the 56-byte pose encoding.
    pub pose_b64: Option<String>,
}

impl From<&TrackedTarget> for UiTarget {
    fn from(target: &TrackedTarget) -> Self {
        Self {
            yaw: target.yaw,
            pitch: target.pitch,
            area: target.area,
            pose_b64: target.pose.map(|pose| STANDARD.encode(pose.encode())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiResultPayload {
    pub camera_index: usize,
    pub camera: String,
    /// Median of the last ten instantaneous rates.
    pub fps: f64,
    pub latency_ms: f64,
    pub pipeline_ms: f64,
    pub stale: bool,
    pub targets: Vec<UiTarget>,
}

/// Where throttled payloads go: a websocket, a test recorder, a log.
pub trait UiSink: Send + Sync + 'static {
    fn send(&self, payload: &UiResultPayload) -> Result<(), HandlerError>;
}

/// Sink that logs each payload as JSON at debug level.
pub struct LogSink;

impl UiSink for LogSink {
    fn send(&self, payload: &UiResultPayload) -> Result<(), HandlerError> {
        tracing::debug!("ui <- {}", serde_json::to_string(payload)?);
        Ok(())
    }
}

#[derive(Default)]
struct CameraTrack {
    fps: MedianFilter,
    last_result_nanos: Option<u64>,
    last_sent_nanos: Option<u64>,
}

pub struct UiResultPublisher<S> {
    sink: S,
    filter: EventFilter,
    cameras: Mutex<HashMap<usize, CameraTrack>>,
}

impl<S: UiSink> UiResultPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            filter: EventFilter::new([SourceType::VisionModule], [DestType::Ui]),
            cameras: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Current smoothed FPS for a camera, zero before two results.
    pub fn fps(&self, camera_index: usize) -> f64 {
        self.cameras
            .lock()
            .get(&camera_index)
            .map_or(0.0, |t| t.fps.median())
    }

    /// Account for `result` arriving at `now_nanos` and forward it when
    /// the camera's throttle interval has elapsed. Returns whether a
    /// payload was sent.
    pub fn handle_at(&self, result: &VisionResult, now_nanos: u64) -> Result<bool, HandlerError> {
        let payload = {
            let mut cameras = self.cameras.lock();
            let track = cameras.entry(result.camera_index).or_default();

            if let Some(previous) = track.last_result_nanos {
                let dt_ms = now_nanos.saturating_sub(previous) as f64 / 1e6;
                if dt_ms > 0.0 {
                    track.fps.push(1000.0 / dt_ms);
                }
            }
            track.last_result_nanos = Some(now_nanos);

            let due = match track.last_sent_nanos {
                Some(sent) => now_nanos.saturating_sub(sent) >= MIN_PUBLISH_INTERVAL_NANOS,
                None => true,
            };
            if !due {
                return Ok(false);
            }
            track.last_sent_nanos = Some(now_nanos);

            UiResultPayload {
                camera_index: result.camera_index,
                camera: result.camera.to_string(),
                fps: track.fps.median(),
                latency_ms: result.latency_ms(),
                pipeline_ms: result.pipeline_nanos as f64 / 1e6,
                stale: result.stale,
                targets: result.targets.targets.iter().map(UiTarget::from).collect(),
            }
        };

        self.sink.send(&payload)?;
        Ok(true)
    }
}

impl<S: UiSink> DataChangeSubscriber for UiResultPublisher<S> {
    fn name(&self) -> &str {
        "ui-results"
    }

    fn filter(&self) -> &EventFilter {
        &self.filter
    }

    fn on_event(&self, event: &DataChangeEvent) -> Result<(), HandlerError> {
        if let Some(result) = event.value().as_result() {
            self.handle_at(result, monotonic_nanos())?;
        }
        Ok(())
    }
}
