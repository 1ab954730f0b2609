//! Fixed-layout binary encoding for 3D target poses.
//!
//! A pose is exactly seven IEEE-754 doubles, big-endian, in this order:
//!
//! | offset | field          |
//! |--------|----------------|
//! | 0      | translation x  |
//! | 8      | translation y  |
//! | 16     | translation z  |
//! | 24     | rotation w     |
//! | 32     | rotation x     |
//! | 40     | rotation y     |
//! | 48     | rotation z     |
//!
//! Consumers on the other side of a transport decode the same order, so
//! the layout must never change.

use thiserror::Error;

/// Encoded size of a single pose in bytes.
pub const POSE_LEN: usize = 7 * 8;

/// Errors produced while decoding a pose.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("pose buffer must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Translation component of a pose, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Translation3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Rotation component of a pose as a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    /// The identity rotation.
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Rigid-body transform from the camera to a target.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transform3d {
    pub translation: Translation3d,
    pub rotation: Quaternion,
}

impl Transform3d {
    /// Build a transform from a translation and a rotation.
    pub fn new(translation: Translation3d, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// Encode into the fixed 56-byte layout.
    pub fn encode(&self) -> [u8; POSE_LEN] {
        let mut out = [0u8; POSE_LEN];
        for (slot, value) in out.chunks_exact_mut(8).zip(self.fields()) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
        out
    }

    /// Append the encoded pose to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.encode());
    }

    /// Decode a pose from exactly [`POSE_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != POSE_LEN {
            return Err(WireError::Length {
                expected: POSE_LEN,
                actual: bytes.len(),
            });
        }
        let mut values = [0f64; 7];
        for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *value = f64::from_be_bytes(raw);
        }
        let [tx, ty, tz, qw, qx, qy, qz] = values;
        Ok(Self {
            translation: Translation3d {
                x: tx,
                y: ty,
                z: tz,
            },
            rotation: Quaternion {
                w: qw,
                x: qx,
                y: qy,
                z: qz,
            },
        })
    }

    /// Decode a packed sequence of poses (e.g. one per target).
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>, WireError> {
        if bytes.len() % POSE_LEN != 0 {
            return Err(WireError::Length {
                expected: (bytes.len() / POSE_LEN + 1) * POSE_LEN,
                actual: bytes.len(),
            });
        }
        bytes.chunks_exact(POSE_LEN).map(Self::decode).collect()
    }

    fn fields(&self) -> [f64; 7] {
        [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.rotation.w,
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
        ]
    }
}
