use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::camera::calibration::CalibrationCoefficients;

/// Stable camera identifier (the configured unique camera name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(String);

impl CameraId {
    /// Create a new `CameraId` from a raw string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// USB hardware identity used for quirk lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Image resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Camera video mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMode {
    pub resolution: Resolution,
    pub fps: f32,
    pub pixel_format: String,
}

impl VideoMode {
    pub fn new(width: u32, height: u32, fps: f32, pixel_format: impl Into<String>) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            fps,
            pixel_format: pixel_format.into(),
        }
    }
}

/// Geometry of the frames produced in one video mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStaticProperties {
    pub resolution: Resolution,
    pub fov_degrees: f64,
    pub image_area: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub horizontal_focal_length: f64,
    pub vertical_focal_length: f64,
}

impl FrameStaticProperties {
    /// Derive focal lengths from the diagonal field of view, or from the
    /// camera matrix when calibration for this exact resolution is given.
    pub fn new(
        resolution: Resolution,
        fov_degrees: f64,
        calibration: Option<&CalibrationCoefficients>,
    ) -> Self {
        let w = f64::from(resolution.width);
        let h = f64::from(resolution.height);

        if let Some(coeffs) = calibration.filter(|c| c.resolution == resolution) {
            let m = &coeffs.camera_matrix;
            return Self {
                resolution,
                fov_degrees,
                image_area: w * h,
                center_x: m[0][2],
                center_y: m[1][2],
                horizontal_focal_length: m[0][0],
                vertical_focal_length: m[1][1],
            };
        }

        let diagonal = w.hypot(h);
        let half_diag_tan = (fov_degrees.to_radians() / 2.0).tan();
        let horizontal_view = (half_diag_tan * (w / diagonal)).atan() * 2.0;
        let vertical_view = (half_diag_tan * (h / diagonal)).atan() * 2.0;

        Self {
            resolution,
            fov_degrees,
            image_area: w * h,
            center_x: w / 2.0 - 0.5,
            center_y: h / 2.0 - 0.5,
            horizontal_focal_length: w / (2.0 * (horizontal_view / 2.0).tan()),
            vertical_focal_length: h / (2.0 * (vertical_view / 2.0).tan()),
        }
    }
}

/// Opaque image payload. Pixel layout is owned by the frame source and
/// the image operations; the core never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel.
    pub channels: u8,
}

/// A single captured frame.
///
/// The image is shared behind an `Arc`, so a stage that wants a modified
/// image must build a new one instead of writing through the handle.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<FrameImage>,
    /// Capture time on the process monotonic clock (see [`monotonic_nanos`]).
    pub timestamp_nanos: u64,
    pub props: Arc<FrameStaticProperties>,
}

impl Frame {
    pub fn new(image: FrameImage, timestamp_nanos: u64, props: Arc<FrameStaticProperties>) -> Self {
        Self {
            image: Arc::new(image),
            timestamp_nanos,
            props,
        }
    }
}

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process. Monotonic.
pub fn monotonic_nanos() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_id_display_and_equality() {
        let a = CameraId::new("front");
        assert_eq!(a, CameraId::new("front"));
        assert_ne!(a, CameraId::new("rear"));
        assert_eq!(a.to_string(), "front");
    }

    #[test]
    fn static_properties_from_fov_are_symmetric_for_square_images() {
        let props = FrameStaticProperties::new(Resolution::new(400, 400), 90.0, None);
        assert!((props.horizontal_focal_length - props.vertical_focal_length).abs() < 1e-9);
        assert_eq!(props.image_area, 160_000.0);
    }

    #[test]
    fn static_properties_from_fov_match_pinhole_model() {
        // 4:3 sensor with a 75 degree diagonal view.
        let props = FrameStaticProperties::new(Resolution::new(640, 480), 75.0, None);
        let diag_focal = 400.0 / (75.0f64.to_radians() / 2.0).tan();
        assert!((props.horizontal_focal_length - diag_focal).abs() < 1e-6);
        assert!((props.vertical_focal_length - diag_focal).abs() < 1e-6);
    }

    #[test]
    fn static_properties_prefer_matching_calibration() {
        let coeffs = CalibrationCoefficients::new(
            Resolution::new(640, 480),
            [[500.0, 0.0, 320.0], [0.0, 510.0, 240.0], [0.0, 0.0, 1.0]],
            vec![0.0; 5],
            vec![],
        );
        let props = FrameStaticProperties::new(Resolution::new(640, 480), 75.0, Some(&coeffs));
        assert_eq!(props.horizontal_focal_length, 500.0);
        assert_eq!(props.vertical_focal_length, 510.0);
        assert_eq!(props.center_x, 320.0);

        let other = FrameStaticProperties::new(Resolution::new(1280, 720), 75.0, Some(&coeffs));
        assert_ne!(other.horizontal_focal_length, 500.0);
    }

    #[test]
    fn monotonic_nanos_never_goes_backwards() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }

    #[test]
    fn resolution_serialises_to_json() {
        let json = serde_json::to_value(Resolution::new(320, 240)).unwrap();
        assert_eq!(json["width"], 320);
        assert_eq!(json["height"], 240);
    }
}
