use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::camera::types::CameraId;
use crate::diagnostics::stats::DiagnosticSnapshot;
use crate::module::error::{ModuleError, Result};
use crate::module::vision::{ModuleState, VisionModule};

/// Outcome of [`VisionModuleManager::stop_all`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub stopped: Vec<CameraId>,
    /// Modules that did not stop cleanly, with the reason.
    pub failed: Vec<(CameraId, String)>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Module list and shutdown state, guarded together.
#[derive(Default)]
struct Registry {
    modules: Vec<Arc<VisionModule>>,
    /// `stop_all` calls in progress.
    stopping: usize,
}

impl Registry {
    fn ensure_not_shutting_down(&self) -> Result<()> {
        if self.stopping > 0 {
            return Err(ModuleError::ShuttingDown);
        }
        Ok(())
    }
}

/// Owns every vision module, in the order they were added.
#[derive(Default)]
pub struct VisionModuleManager {
    registry: RwLock<Registry>,
}

impl VisionModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `module`. Camera names must be unique.
    pub fn add_module(&self, module: VisionModule) -> Result<Arc<VisionModule>> {
        let mut registry = self.registry.write();
        registry.ensure_not_shutting_down()?;
        if registry.modules.iter().any(|m| m.camera() == module.camera()) {
            return Err(ModuleError::DuplicateCamera(module.camera().to_string()));
        }
        tracing::info!(
            "Added vision module '{}' (index {})",
            module.camera(),
            module.index()
        );
        let module = Arc::new(module);
        registry.modules.push(Arc::clone(&module));
        Ok(module)
    }

    /// Stop and drop the module for `camera`.
    pub fn remove_module(&self, camera: &str, deadline: Duration) -> Result<()> {
        let module = {
            let mut registry = self.registry.write();
            registry.ensure_not_shutting_down()?;
            let position = registry
                .modules
                .iter()
                .position(|m| m.camera().as_str() == camera)
                .ok_or_else(|| ModuleError::UnknownCamera(camera.to_string()))?;
            registry.modules.remove(position)
        };
        tracing::info!("Removing vision module '{camera}'");
        module.stop(deadline)
    }

    pub fn get(&self, camera: &str) -> Option<Arc<VisionModule>> {
        self.registry
            .read()
            .modules
            .iter()
            .find(|m| m.camera().as_str() == camera)
            .cloned()
    }

    pub fn module_names(&self) -> Vec<CameraId> {
        self.registry
            .read()
            .modules
            .iter()
            .map(|m| m.camera().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.read().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().modules.is_empty()
    }

    /// Start every module that has not been started yet. A module that
    /// fails to start is logged and skipped. Returns how many started.
    pub fn start_all(&self) -> Result<usize> {
        let modules = {
            let registry = self.registry.read();
            registry.ensure_not_shutting_down()?;
            registry.modules.clone()
        };
        let mut started = 0;
        for module in modules
            .iter()
            .filter(|m| m.state() == ModuleState::Created)
        {
            match module.start() {
                Ok(()) => started += 1,
                Err(e) => tracing::error!("Failed to start '{}': {e}", module.camera()),
            }
        }
        tracing::info!("Started {started} of {} vision modules", modules.len());
        Ok(started)
    }

    /// Stop every module. All modules are signalled first, then each is
    /// joined against a shared deadline; a module that overruns is
    /// recorded and the rest are still stopped.
    ///
    /// Adding or removing modules fails until every concurrent `stop_all`
    /// has returned.
    pub fn stop_all(&self, deadline: Duration) -> StopReport {
        let until = Instant::now() + deadline;
        let modules = {
            let mut registry = self.registry.write();
            registry.stopping += 1;
            registry.modules.clone()
        };

        for module in &modules {
            module.request_stop();
        }

        let mut report = StopReport::default();
        for module in &modules {
            match module.join(until) {
                Ok(()) => report.stopped.push(module.camera().clone()),
                Err(e) => {
                    tracing::error!("Vision module '{}' did not stop cleanly: {e}", module.camera());
                    report.failed.push((module.camera().clone(), e.to_string()));
                }
            }
        }

        if report.is_clean() {
            tracing::info!("Stopped {} vision modules", report.stopped.len());
        }
        self.registry.write().stopping -= 1;
        report
    }

    pub fn stats(&self) -> Vec<(CameraId, DiagnosticSnapshot)> {
        self.registry
            .read()
            .modules
            .iter()
            .map(|m| (m.camera().clone(), m.stats()))
            .collect()
    }

    /// Log one line per module.
    pub fn log_stats(&self) {
        for (camera, s) in self.stats() {
            tracing::info!(
                "'{camera}': {:.1} fps, {} frames, {} grab failures, {} stage failures, \
                 {:.1} ms latency, {:.1} ms pipeline",
                s.fps,
                s.frame_count,
                s.grab_failures,
                s.stage_failures,
                s.latency_ms,
                s.pipeline_ms
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.registry.read().stopping > 0
    }
}
