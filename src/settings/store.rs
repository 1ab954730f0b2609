use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::camera::calibration::CalibrationCoefficients;
use crate::camera::types::CameraId;
use crate::module::settings::VisionModuleSettings;
use crate::settings::persistence::{ConfigStore, PersistenceError};
use crate::settings::types::SettingsFile;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// JSON-file backed [`ConfigStore`] with debounced saving.
pub struct JsonConfigStore {
    path: PathBuf,
    data: Mutex<SettingsFile>,
    save_notify: Notify,
    is_dirty: AtomicBool,
    /// Held across snapshot, write and rename so saves land in order.
    save_lock: Mutex<()>,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

impl JsonConfigStore {
    /// Create a new store, loading from disk if the file exists. An
    /// unreadable file is logged and the store starts empty.
    pub fn new(path: PathBuf) -> Self {
        let data = Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring settings at {}: {e}", path.display());
            SettingsFile::default()
        });
        Self {
            path,
            data: Mutex::new(data),
            save_notify: Notify::new(),
            is_dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
            debounce: Mutex::new(None),
        }
    }

    /// Load settings from a JSON file, returning default on missing file.
    pub fn load(path: &Path) -> Result<SettingsFile, PersistenceError> {
        if !path.exists() {
            return Ok(SettingsFile::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save current settings to disk atomically (write .tmp then rename).
    pub fn save(&self) -> Result<(), PersistenceError> {
        let _saving = self.save_lock.lock();
        let data = self.data.lock().clone();
        let json = serde_json::to_string_pretty(&data)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    /// Save now if anything changed since the last save.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        if self.is_dirty.swap(false, Ordering::AcqRel) {
            self.save()?;
        }
        Ok(())
    }

    /// Remove everything saved for a camera.
    pub fn remove_camera(&self, camera: &CameraId) {
        self.data.lock().cameras.remove(camera.as_str());
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
        self.save_notify.notify_one();
    }

    /// Start the debounce task on `runtime`: waits for a dirty
    /// notification, sleeps 500ms, then saves.
    ///
    /// A change that lands while a save is running leaves the dirty flag
    /// set and is written on the next round. Starting again replaces the
    /// previous task.
    pub fn start_debounce_task(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        let store = Arc::clone(self);
        let handle = runtime.spawn(async move {
            loop {
                store.save_notify.notified().await;
                tokio::time::sleep(DEBOUNCE).await;
                if store.is_dirty.swap(false, Ordering::AcqRel) {
                    if let Err(e) = store.save() {
                        tracing::warn!("Failed to save settings: {e}");
                    }
                }
            }
        });
        if let Some(previous) = self.debounce.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the debounce task. A save already in progress still
    /// completes, and [`JsonConfigStore::flush`] waits for it.
    pub fn stop_debounce_task(&self) {
        if let Some(handle) = self.debounce.lock().take() {
            handle.abort();
        }
    }
}

impl ConfigStore for JsonConfigStore {
    fn load_calibration(
        &self,
        camera: &CameraId,
    ) -> Result<Vec<CalibrationCoefficients>, PersistenceError> {
        Ok(self
            .data
            .lock()
            .cameras
            .get(camera.as_str())
            .map(|r| r.calibrations.clone())
            .unwrap_or_default())
    }

    fn save_calibration(
        &self,
        camera: &CameraId,
        coeffs: &CalibrationCoefficients,
    ) -> Result<(), PersistenceError> {
        self.data
            .lock()
            .cameras
            .entry(camera.as_str().to_string())
            .or_default()
            .put_calibration(coeffs.clone());
        self.mark_dirty();
        Ok(())
    }

    fn load_settings(
        &self,
        camera: &CameraId,
    ) -> Result<Option<VisionModuleSettings>, PersistenceError> {
        Ok(self
            .data
            .lock()
            .cameras
            .get(camera.as_str())
            .and_then(|r| r.settings.clone()))
    }

    fn save_settings(
        &self,
        camera: &CameraId,
        settings: &VisionModuleSettings,
    ) -> Result<(), PersistenceError> {
        self.data
            .lock()
            .cameras
            .entry(camera.as_str().to_string())
            .or_default()
            .settings = Some(settings.clone());
        self.mark_dirty();
        Ok(())
    }
}
