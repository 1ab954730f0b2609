use std::sync::Arc;

use crate::bus::dispatch::DataChangeBus;
use crate::camera::quirks::QuirkRegistry;
use crate::settings::persistence::ConfigStore;

/// Shared services handed to every vision module. Built once by the
/// caller and passed explicitly; nothing here is process-global.
#[derive(Clone)]
pub struct VisionContext {
    pub bus: Arc<DataChangeBus>,
    pub quirks: Arc<QuirkRegistry>,
    /// Persistence for settings and calibration. `None` keeps everything
    /// in memory.
    pub store: Option<Arc<dyn ConfigStore>>,
}

impl VisionContext {
    pub fn new(bus: Arc<DataChangeBus>, quirks: Arc<QuirkRegistry>) -> Self {
        Self {
            bus,
            quirks,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fresh bus, the known-camera quirk table, no persistence.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(DataChangeBus::new()),
            Arc::new(QuirkRegistry::with_known_cameras()),
        )
    }
}
