// Camera domain: frame sources, quirks, calibration.

pub mod calibration;
pub mod dummy;
pub mod error;
pub mod quirks;
pub mod source;
pub mod types;
