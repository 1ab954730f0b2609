//! Known hardware deviations from standard camera control behaviour.
//!
//! The registry is an owned table built once at startup and shared by
//! reference; lookups never mutate it.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::camera::types::UsbIdentity;

/// A single hardware peculiarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraQuirk {
    /// Exposes a hardware gain control (most UVC cameras do not).
    Gain,
    /// Driver refuses frame rates above 100 FPS.
    FpsCap100,
    /// Controls must go through a vendor extension unit, not plain UVC.
    VendorControls,
    /// Auto-exposure cannot be disabled; manual exposure is ignored.
    NoManualExposure,
}

/// Set of quirks for one camera. Empty for well-behaved hardware.
pub type QuirkSet = BTreeSet<CameraQuirk>;

/// One table entry: a known device and its quirks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkyCamera {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
    pub quirks: QuirkSet,
}

impl QuirkyCamera {
    pub fn new(vendor_id: u16, product_id: u16, name: &str, quirks: &[CameraQuirk]) -> Self {
        Self {
            vendor_id,
            product_id,
            name: name.to_string(),
            quirks: quirks.iter().copied().collect(),
        }
    }
}

/// Lookup table keyed by exact `(vendor_id, product_id)`.
#[derive(Debug, Clone, Default)]
pub struct QuirkRegistry {
    cameras: HashMap<UsbIdentity, QuirkyCamera>,
}

impl QuirkRegistry {
    /// Build a registry from explicit entries. Later duplicates replace
    /// earlier ones.
    pub fn new(entries: impl IntoIterator<Item = QuirkyCamera>) -> Self {
        let cameras = entries
            .into_iter()
            .map(|c| (UsbIdentity::new(c.vendor_id, c.product_id), c))
            .collect();
        Self { cameras }
    }

    /// Registry populated with the devices known to misbehave.
    pub fn with_known_cameras() -> Self {
        use CameraQuirk::*;
        Self::new([
            QuirkyCamera::new(0x1415, 0x2000, "PlayStation Eye", &[Gain, FpsCap100]),
            QuirkyCamera::new(0x045e, 0x0810, "Microsoft LifeCam HD-3000", &[NoManualExposure]),
            QuirkyCamera::new(0x0c45, 0x6366, "Arducam OV9281", &[Gain, VendorControls]),
            QuirkyCamera::new(0x32e4, 0x9422, "ELP Global Shutter", &[Gain]),
        ])
    }

    /// Quirks for a device. Unknown devices get the empty set.
    pub fn lookup(&self, vendor_id: u16, product_id: u16) -> QuirkSet {
        self.cameras
            .get(&UsbIdentity::new(vendor_id, product_id))
            .map(|c| c.quirks.clone())
            .unwrap_or_default()
    }

    /// Quirks for an optional identity (cameras without USB ids have none).
    pub fn lookup_identity(&self, identity: Option<UsbIdentity>) -> QuirkSet {
        identity
            .map(|id| self.lookup(id.vendor_id, id.product_id))
            .unwrap_or_default()
    }

    /// The table entry for a device, if it is known.
    pub fn entry(&self, vendor_id: u16, product_id: u16) -> Option<&QuirkyCamera> {
        self.cameras.get(&UsbIdentity::new(vendor_id, product_id))
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}
