use std::sync::Arc;

use pose_wire::{Quaternion, Transform3d, Translation3d};

use crate::camera::calibration::CalibrationCoefficients;
use crate::camera::error::{CameraError, Result};
use crate::camera::source::FrameSource;
use crate::camera::types::{
    monotonic_nanos, Frame, FrameImage, FrameStaticProperties, UsbIdentity, VideoMode,
};
use crate::pipeline::error::StageError;
use crate::pipeline::stages::{PoseSolver, TargetDetector};
use crate::pipeline::target::RawTarget;

/// Range limits for a simulated control.
struct ControlRange {
    min: i32,
    max: i32,
}

const BRIGHTNESS: ControlRange = ControlRange { min: 0, max: 100 };
const GAIN: ControlRange = ControlRange { min: 0, max: 100 };

const SPOT_LEVEL: u8 = 255;

/// A fake camera producing a grey frame with one bright square that
/// orbits the image centre. Lets the server run without hardware.
pub struct DummySource {
    name: String,
    identity: Option<UsbIdentity>,
    modes: Vec<VideoMode>,
    props: Option<Arc<FrameStaticProperties>>,
    frame_index: u64,
    /// Every n-th pull reports "not ready". 0 disables.
    drop_every: u64,
    spot_size: u32,
    exposure: f64,
    brightness: i32,
    gain: i32,
}

impl DummySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: None,
            modes: vec![
                VideoMode::new(320, 240, 30.0, "GRAY"),
                VideoMode::new(640, 480, 30.0, "GRAY"),
                VideoMode::new(160, 120, 90.0, "GRAY"),
            ],
            props: None,
            frame_index: 0,
            drop_every: 0,
            spot_size: 16,
            exposure: 50.0,
            brightness: 50,
            gain: 0,
        }
    }

    /// Report a USB identity so quirk lookup applies.
    pub fn with_identity(mut self, identity: UsbIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_modes(mut self, modes: Vec<VideoMode>) -> Self {
        self.modes = modes;
        self
    }

    /// Simulate a flaky link: every `n`-th pull is not ready.
    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = n;
        self
    }

    pub fn exposure(&self) -> f64 {
        self.exposure
    }

    pub fn brightness(&self) -> i32 {
        self.brightness
    }

    pub fn gain(&self) -> i32 {
        self.gain
    }

    fn background_level(&self) -> u8 {
        // Brightness 0..=100 maps onto a dim 0..=100 grey.
        u8::try_from(self.brightness.clamp(0, 100)).unwrap_or(0)
    }

    fn render(&self, width: u32, height: u32) -> FrameImage {
        let w = width as usize;
        let h = height as usize;
        let mut data = vec![self.background_level(); w * h];

        let t = self.frame_index as f64 * 0.05;
        let cx = f64::from(width) / 2.0 + f64::from(width) / 4.0 * t.cos();
        let cy = f64::from(height) / 2.0 + f64::from(height) / 4.0 * t.sin();
        let half = f64::from(self.spot_size) / 2.0;

        let x0 = (cx - half).max(0.0) as usize;
        let y0 = (cy - half).max(0.0) as usize;
        let x1 = ((cx + half) as usize).min(w);
        let y1 = ((cy + half) as usize).min(h);
        if x0 < x1 {
            for y in y0..y1 {
                data[y * w + x0..y * w + x1].fill(SPOT_LEVEL);
            }
        }

        FrameImage {
            data,
            width,
            height,
            channels: 1,
        }
    }
}

impl FrameSource for DummySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn usb_identity(&self) -> Option<UsbIdentity> {
        self.identity
    }

    fn video_modes(&self) -> Vec<VideoMode> {
        self.modes.clone()
    }

    fn set_video_mode(&mut self, index: usize, props: Arc<FrameStaticProperties>) -> Result<()> {
        if index >= self.modes.len() {
            return Err(CameraError::InvalidVideoMode {
                index,
                available: self.modes.len(),
            });
        }
        tracing::debug!(
            "Dummy camera '{}' switched to {}",
            self.name,
            props.resolution
        );
        self.props = Some(props);
        Ok(())
    }

    fn get(&mut self) -> Result<Frame> {
        let props = self
            .props
            .clone()
            .ok_or_else(|| CameraError::NotReady(self.name.clone()))?;
        self.frame_index += 1;
        if self.drop_every > 0 && self.frame_index % self.drop_every == 0 {
            return Err(CameraError::NotReady(self.name.clone()));
        }

        let image = self.render(props.resolution.width, props.resolution.height);
        Ok(Frame::new(image, monotonic_nanos(), props))
    }

    fn set_exposure(&mut self, exposure: f64) -> Result<()> {
        if !exposure.is_finite() {
            return Err(CameraError::ControlWrite(format!(
                "exposure must be finite, got {exposure}"
            )));
        }
        self.exposure = exposure.clamp(0.0, 100.0);
        Ok(())
    }

    fn set_brightness(&mut self, brightness: i32) -> Result<()> {
        self.brightness = brightness.clamp(BRIGHTNESS.min, BRIGHTNESS.max);
        Ok(())
    }

    fn set_gain(&mut self, gain: i32) -> Result<()> {
        self.gain = gain.clamp(GAIN.min, GAIN.max);
        Ok(())
    }
}

/// Finds the pixels at or above `threshold` and reports them as a single
/// target at their centroid.
pub struct BrightSpotDetector {
    threshold: u8,
}

impl BrightSpotDetector {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl Default for BrightSpotDetector {
    fn default() -> Self {
        Self::new(200)
    }
}

impl TargetDetector for BrightSpotDetector {
    fn detect(&self, frame: &Frame) -> std::result::Result<Vec<RawTarget>, StageError> {
        let image = &frame.image;
        let channels = usize::from(image.channels.max(1));
        let width = image.width as usize;
        if width == 0 || image.height == 0 {
            return Ok(Vec::new());
        }
        let expected = width * image.height as usize * channels;
        if image.data.len() < expected {
            return Err(format!(
                "image buffer holds {} bytes, {}x{}x{channels} needs {expected}",
                image.data.len(),
                image.width,
                image.height
            )
            .into());
        }

        let mut count = 0u64;
        let (mut sum_x, mut sum_y) = (0.0, 0.0);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        for (i, px) in image.data.chunks_exact(channels).enumerate() {
            if px[0] < self.threshold {
                continue;
            }
            let (x, y) = (i % width, i / width);
            count += 1;
            sum_x += x as f64;
            sum_y += y as f64;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        if count == 0 {
            return Ok(Vec::new());
        }
        let n = count as f64;
        let corners = vec![
            (min_x as f64, min_y as f64),
            (max_x as f64, min_y as f64),
            (max_x as f64, max_y as f64),
            (min_x as f64, max_y as f64),
        ];
        Ok(vec![RawTarget {
            center_x: sum_x / n,
            center_y: sum_y / n,
            area_px: n,
            corners,
        }])
    }
}

/// Pinhole range estimate for a square target of known size. Rotation is
/// not observable from a single blob and is left at identity.
pub struct PinholeSolver {
    target_width_m: f64,
}

impl PinholeSolver {
    pub fn new(target_width_m: f64) -> Self {
        Self { target_width_m }
    }
}

impl PoseSolver for PinholeSolver {
    fn solve(
        &self,
        target: &RawTarget,
        calibration: &CalibrationCoefficients,
    ) -> Option<Transform3d> {
        if target.area_px <= 0.0 {
            return None;
        }
        let m = &calibration.camera_matrix;
        let (fx, fy, cx, cy) = (m[0][0], m[1][1], m[0][2], m[1][2]);
        if fx <= 0.0 || fy <= 0.0 {
            return None;
        }

        let z = fx * self.target_width_m / target.area_px.sqrt();
        Some(Transform3d::new(
            Translation3d {
                x: (target.center_x - cx) * z / fx,
                y: (target.center_y - cy) * z / fy,
                z,
            },
            Quaternion::IDENTITY,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::Resolution;

    fn selected(mut source: DummySource) -> DummySource {
        let mode = source.video_modes()[0].clone();
        let props = Arc::new(FrameStaticProperties::new(mode.resolution, 70.0, None));
        source.set_video_mode(0, props).unwrap();
        source
    }

    #[test]
    fn get_before_mode_selection_is_not_ready() {
        let mut source = DummySource::new("dummy");
        assert!(matches!(source.get(), Err(CameraError::NotReady(_))));
    }

    #[test]
    fn frames_match_selected_mode() {
        let mut source = selected(DummySource::new("dummy"));
        let frame = source.get().unwrap();
        assert_eq!(frame.image.width, 320);
        assert_eq!(frame.image.height, 240);
        assert_eq!(frame.image.data.len(), 320 * 240);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut source = selected(DummySource::new("dummy"));
        let a = source.get().unwrap().timestamp_nanos;
        let b = source.get().unwrap().timestamp_nanos;
        assert!(b >= a);
    }

    #[test]
    fn drop_every_reports_not_ready_periodically() {
        let mut source = selected(DummySource::new("dummy").with_drop_every(3));
        let outcomes: Vec<bool> = (0..6).map(|_| source.get().is_ok()).collect();
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
    }

    #[test]
    fn controls_are_clamped() {
        let mut source = DummySource::new("dummy");
        source.set_brightness(500).unwrap();
        source.set_gain(-4).unwrap();
        source.set_exposure(250.0).unwrap();
        assert_eq!(source.brightness(), 100);
        assert_eq!(source.gain(), 0);
        assert_eq!(source.exposure(), 100.0);
        assert!(source.set_exposure(f64::NAN).is_err());
    }

    #[test]
    fn invalid_mode_index_is_rejected() {
        let mut source = DummySource::new("dummy");
        let props = Arc::new(FrameStaticProperties::new(
            Resolution::new(320, 240),
            70.0,
            None,
        ));
        assert!(source.set_video_mode(9, props).is_err());
    }

    #[test]
    fn detector_finds_the_rendered_spot() {
        let mut source = selected(DummySource::new("dummy"));
        let frame = source.get().unwrap();
        let targets = BrightSpotDetector::default().detect(&frame).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].corners.len(), 4);
        assert!(targets[0].area_px > 0.0);
    }

    #[test]
    fn detector_on_dark_frame_finds_nothing() {
        let props = Arc::new(FrameStaticProperties::new(
            Resolution::new(4, 4),
            70.0,
            None,
        ));
        let frame = Frame::new(
            FrameImage {
                data: vec![10; 16],
                width: 4,
                height: 4,
                channels: 1,
            },
            0,
            props,
        );
        assert!(BrightSpotDetector::default().detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn detector_rejects_short_buffer() {
        let props = Arc::new(FrameStaticProperties::new(
            Resolution::new(4, 4),
            70.0,
            None,
        ));
        let frame = Frame::new(
            FrameImage {
                data: vec![255; 3],
                width: 4,
                height: 4,
                channels: 1,
            },
            0,
            props,
        );
        assert!(BrightSpotDetector::default().detect(&frame).is_err());
    }

    #[test]
    fn detector_on_zero_width_frame_finds_nothing() {
        let props = Arc::new(FrameStaticProperties::new(
            Resolution::new(0, 4),
            70.0,
            None,
        ));
        let frame = Frame::new(
            FrameImage {
                data: vec![255; 16],
                width: 0,
                height: 4,
                channels: 1,
            },
            0,
            props,
        );
        assert!(BrightSpotDetector::default().detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn pinhole_solver_ranges_by_apparent_size() {
        let calibration = CalibrationCoefficients::new(
            Resolution::new(640, 480),
            [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]],
            vec![0.0; 5],
            vec![],
        );
        let solver = PinholeSolver::new(0.2);
        let near = RawTarget {
            center_x: 320.0,
            center_y: 240.0,
            area_px: 100.0 * 100.0,
            corners: Vec::new(),
        };
        let pose = solver.solve(&near, &calibration).unwrap();
        assert!((pose.translation.z - 1.0).abs() < 1e-9);
        assert!(pose.translation.x.abs() < 1e-9);
        assert_eq!(pose.rotation, Quaternion::IDENTITY);

        let empty = RawTarget {
            area_px: 0.0,
            ..near
        };
        assert!(solver.solve(&empty, &calibration).is_none());
    }

    #[test]
    fn dummy_source_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<DummySource>();
    }
}
