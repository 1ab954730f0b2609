use std::sync::Arc;

use crate::camera::error::Result;
use crate::camera::types::{Frame, FrameStaticProperties, UsbIdentity, VideoMode};

/// Pull-based frame capture capability.
///
/// Implemented outside the core (V4L2, vendor SDKs, file playback). A
/// source is owned by exactly one vision loop, so it only needs `Send`.
pub trait FrameSource: Send {
    /// Stable name used for logging and persistence.
    fn name(&self) -> &str;

    /// USB identity for quirk lookup, when the hardware exposes one.
    fn usb_identity(&self) -> Option<UsbIdentity>;

    /// All video modes the camera supports, in driver order.
    fn video_modes(&self) -> Vec<VideoMode>;

    /// Switch to the video mode at `index`. Frames returned afterwards
    /// carry `props`.
    fn set_video_mode(&mut self, index: usize, props: Arc<FrameStaticProperties>) -> Result<()>;

    /// Pull the next frame, blocking up to the source's own timeout.
    ///
    /// `CameraError::NotReady` is an expected outcome and not a failure
    /// of the source.
    fn get(&mut self) -> Result<Frame>;

    fn set_exposure(&mut self, exposure: f64) -> Result<()>;

    fn set_brightness(&mut self, brightness: i32) -> Result<()>;

    fn set_gain(&mut self, gain: i32) -> Result<()>;

    /// Release the underlying device. Called once when the module stops.
    fn release(&mut self) {}
}
