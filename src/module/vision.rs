//! The per-camera worker.
//!
//! A module owns one frame source, its pipeline set and its settings.
//! `start` moves the source onto a dedicated `vision-<camera>` thread
//! that runs a fixed-period loop until `stop` fires the shutdown signal.
//! Settings changes arrive from other threads through the bus and are
//! applied under a short lock; the loop copies what it needs at the top
//! of each iteration.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bus::dispatch::{DataChangeBus, DataChangeSubscriber, HandlerError, SubscriptionId};
use crate::bus::event::{DataChangeEvent, DestType, EventFilter, SourceType};
use crate::camera::calibration::{CalibrationCoefficients, CalibrationStore};
use crate::camera::quirks::{CameraQuirk, QuirkSet};
use crate::camera::source::FrameSource;
use crate::camera::types::{monotonic_nanos, CameraId, FrameStaticProperties, VideoMode};
use crate::context::VisionContext;
use crate::diagnostics::stats::{DiagnosticSnapshot, DiagnosticStats};
use crate::logging::{panic_message, spawn_thread};
use crate::module::error::{ModuleError, Result};
use crate::module::result::VisionResult;
use crate::module::settings::{
    CameraControls, PipelineSettings, SettingsChange, VisionModuleSettings,
};
use crate::pipeline::compose::Pipeline;
use crate::pipeline::stages::DriverModeStage;
use crate::pipeline::target::FrameInput;
use crate::pipeline::VisionPipeline;
use crate::settings::persistence::ConfigStore;
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_FPS: f64 = 30.0;
const CAPPED_FPS: f64 = 100.0;
const JOIN_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Created,
    Running,
    Stopped,
}

/// Static configuration of one module.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Position of the camera; events carry it as `originating_index`.
    pub index: usize,
    pub camera: CameraId,
    /// Diagonal field of view, degrees.
    pub fov_degrees: f64,
    pub desired_fps: f64,
}

impl ModuleConfig {
    pub fn new(index: usize, camera: impl Into<String>) -> Self {
        Self {
            index,
            camera: CameraId::new(camera),
            fov_degrees: 70.0,
            desired_fps: DEFAULT_FPS,
        }
    }

    pub fn with_fov(mut self, fov_degrees: f64) -> Self {
        self.fov_degrees = fov_degrees;
        self
    }

    pub fn with_fps(mut self, desired_fps: f64) -> Self {
        self.desired_fps = desired_fps;
        self
    }
}

/// State reachable from both the loop thread and bus handlers.
struct Shared {
    index: usize,
    camera: CameraId,
    fov_degrees: f64,
    desired_fps: f64,
    quirks: QuirkSet,
    settings: Mutex<VisionModuleSettings>,
    pipelines: Vec<Arc<VisionPipeline>>,
    calibration: Arc<CalibrationStore>,
    stats: Mutex<DiagnosticStats>,
    store: Option<Arc<dyn ConfigStore>>,
}

impl Shared {
    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.desired_fps)
    }

    fn pipeline_slot(&self, requested: usize) -> usize {
        if requested < self.pipelines.len() {
            requested
        } else {
            0
        }
    }

    fn persist_settings(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.settings.lock().clone();
        if let Err(e) = store.save_settings(&self.camera, &snapshot) {
            tracing::warn!("Failed to save settings for '{}': {e}", self.camera);
        }
    }

    fn handle_event(&self, event: &DataChangeEvent) -> std::result::Result<(), HandlerError> {
        if event.originating_index().unwrap_or(0) != self.index {
            return Ok(());
        }
        let Some(value) = event.value().as_json() else {
            return Ok(());
        };
        let property = event.property_name();

        match event.dest() {
            DestType::ActiveModule => {
                let change = self.settings.lock().apply_property(property, value)?;
                match change {
                    Some(SettingsChange::Controls) => {
                        tracing::info!("Camera '{}' {property} set to {value}", self.camera);
                    }
                    Some(SettingsChange::VideoMode) => {
                        tracing::info!("Camera '{}' switching to video mode {value}", self.camera);
                    }
                    Some(SettingsChange::Pipeline) => {
                        tracing::info!("Camera '{}' switching to pipeline {value}", self.camera);
                    }
                    None => {
                        tracing::debug!("Camera '{}' {property} already {value}", self.camera);
                        return Ok(());
                    }
                }
            }
            DestType::ActivePipelineSettings => {
                let slot = self.pipeline_slot(self.settings.lock().pipeline_index);
                let merged = self.pipelines[slot].merge_params(property, value)?;
                self.settings
                    .lock()
                    .store_stage_params(slot, property, merged);
                tracing::info!(
                    "Camera '{}' pipeline '{}' stage '{property}' updated",
                    self.camera,
                    self.pipelines[slot].name()
                );
            }
            _ => return Ok(()),
        }
        self.persist_settings();
        Ok(())
    }
}

/// Bus subscriber routing inbound settings changes to one module.
struct SettingsRouter {
    name: String,
    filter: EventFilter,
    shared: Arc<Shared>,
}

impl DataChangeSubscriber for SettingsRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> &EventFilter {
        &self.filter
    }

    fn on_event(&self, event: &DataChangeEvent) -> std::result::Result<(), HandlerError> {
        self.shared.handle_event(event)
    }
}

pub struct VisionModule {
    shared: Arc<Shared>,
    bus: Arc<DataChangeBus>,
    state: Mutex<ModuleState>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    signal: ShutdownSignal,
}

impl std::fmt::Debug for VisionModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionModule").finish_non_exhaustive()
    }
}

impl VisionModule {
    /// Attach a camera: resolve its quirks, load persisted settings and
    /// calibration, and apply stored params to each pipeline. Load
    /// failures fall back to defaults.
    ///
    /// An empty pipeline set gets a single driver-mode pipeline.
    pub fn new(
        config: ModuleConfig,
        source: Box<dyn FrameSource>,
        mut pipelines: Vec<Arc<VisionPipeline>>,
        ctx: &VisionContext,
    ) -> Self {
        let camera = config.camera;
        let quirks = ctx.quirks.lookup_identity(source.usb_identity());
        if !quirks.is_empty() {
            tracing::info!("Camera '{camera}' has quirks {quirks:?}");
        }

        if pipelines.is_empty() {
            pipelines.push(Arc::new(
                Pipeline::builder("driver")
                    .then("driver", DriverModeStage)
                    .build(),
            ));
        }

        let calibration = Arc::new(match &ctx.store {
            Some(store) => CalibrationStore::load(camera.clone(), Arc::clone(store)),
            None => CalibrationStore::new(camera.clone()),
        });

        let mut settings = match ctx.store.as_ref().map(|s| s.load_settings(&camera)) {
            Some(Ok(Some(saved))) => saved,
            Some(Ok(None)) | None => VisionModuleSettings::default(),
            Some(Err(e)) => {
                tracing::warn!("Failed to load settings for '{camera}', using defaults: {e}");
                VisionModuleSettings::default()
            }
        };
        for (i, pipeline) in pipelines.iter().enumerate() {
            match settings.pipeline_settings.get(i) {
                Some(stored) => {
                    if let Err(e) = pipeline.configure(&stored.params) {
                        tracing::warn!(
                            "Stored params for '{camera}' pipeline '{}' rejected: {e}",
                            pipeline.name()
                        );
                    }
                }
                None => settings
                    .pipeline_settings
                    .push(PipelineSettings::new(pipeline.name())),
            }
        }

        let desired_fps = effective_fps(&camera, config.desired_fps, &quirks);

        Self {
            shared: Arc::new(Shared {
                index: config.index,
                camera,
                fov_degrees: config.fov_degrees,
                desired_fps,
                quirks,
                settings: Mutex::new(settings),
                pipelines,
                calibration,
                stats: Mutex::new(DiagnosticStats::new()),
                store: ctx.store.clone(),
            }),
            bus: Arc::clone(&ctx.bus),
            state: Mutex::new(ModuleState::Created),
            source: Mutex::new(Some(source)),
            worker: Mutex::new(None),
            subscription: Mutex::new(None),
            signal: ShutdownSignal::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn camera(&self) -> &CameraId {
        &self.shared.camera
    }

    pub fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    /// Quirks resolved once at attach time.
    pub fn quirks(&self) -> &QuirkSet {
        &self.shared.quirks
    }

    /// Loop rate after quirk caps.
    pub fn desired_fps(&self) -> f64 {
        self.shared.desired_fps
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.shared.calibration
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.shared
            .pipelines
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Copy of the current settings.
    pub fn settings(&self) -> VisionModuleSettings {
        self.shared.settings.lock().clone()
    }

    /// Mutate settings under the lock, then persist them.
    pub fn update_settings(&self, edit: impl FnOnce(&mut VisionModuleSettings)) {
        edit(&mut self.shared.settings.lock());
        self.shared.persist_settings();
    }

    pub fn stats(&self) -> DiagnosticSnapshot {
        self.shared.stats.lock().snapshot()
    }

    /// Created → Running. Spawns the loop thread and subscribes to
    /// settings changes addressed to this module.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ModuleState::Created {
            return Err(self.invalid("start", *state));
        }
        let Some(source) = self.source.lock().take() else {
            return Err(self.invalid("start", *state));
        };

        let worker = LoopWorker {
            shared: Arc::clone(&self.shared),
            bus: Arc::clone(&self.bus),
            signal: self.signal.clone(),
            source,
        };
        let name = format!("vision-{}", self.shared.camera);
        let handle = spawn_thread(name, move || worker.run()).map_err(|source| {
            *state = ModuleState::Stopped;
            ModuleError::Spawn {
                camera: self.shared.camera.to_string(),
                source,
            }
        })?;
        *self.worker.lock() = Some(handle);

        let router = SettingsRouter {
            name: format!("settings-{}", self.shared.camera),
            filter: EventFilter::new(
                [
                    SourceType::Websocket,
                    SourceType::Http,
                    SourceType::Telemetry,
                    SourceType::Other,
                ],
                [DestType::ActiveModule, DestType::ActivePipelineSettings],
            ),
            shared: Arc::clone(&self.shared),
        };
        *self.subscription.lock() = Some(self.bus.subscribe(Arc::new(router)));

        *state = ModuleState::Running;
        Ok(())
    }

    /// Signal the loop and wait up to `deadline` for it to exit. The
    /// module is `Stopped` afterwards even when the wait times out.
    pub fn stop(&self, deadline: Duration) -> Result<()> {
        self.request_stop();
        self.join(Instant::now() + deadline)
    }

    /// Fire the shutdown signal without waiting.
    pub(crate) fn request_stop(&self) {
        self.signal.trigger();
    }

    /// Finish stopping, waiting for the loop thread until `until`.
    pub(crate) fn join(&self, until: Instant) -> Result<()> {
        let started = Instant::now();
        {
            let mut state = self.state.lock();
            match *state {
                ModuleState::Stopped => return Ok(()),
                ModuleState::Created => {
                    *state = ModuleState::Stopped;
                    if let Some(mut source) = self.source.lock().take() {
                        source.release();
                    }
                    return Ok(());
                }
                ModuleState::Running => *state = ModuleState::Stopped,
            }
        }

        if let Some(id) = self.subscription.lock().take() {
            self.bus.unsubscribe(id);
        }

        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        while !handle.is_finished() {
            if Instant::now() >= until {
                return Err(ModuleError::StopTimeout {
                    camera: self.shared.camera.to_string(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            tracing::error!("Vision loop for '{}' panicked", self.shared.camera);
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str, state: ModuleState) -> ModuleError {
        ModuleError::InvalidTransition {
            camera: self.shared.camera.to_string(),
            action,
            state,
        }
    }
}

impl Drop for VisionModule {
    fn drop(&mut self) {
        self.signal.trigger();
        if let Some(id) = self.subscription.get_mut().take() {
            self.bus.unsubscribe(id);
        }
    }
}

fn effective_fps(camera: &CameraId, requested: f64, quirks: &QuirkSet) -> f64 {
    let fps = if requested.is_finite() && requested > 0.0 {
        requested
    } else {
        tracing::warn!("Camera '{camera}' desired FPS {requested} is invalid, using {DEFAULT_FPS}");
        DEFAULT_FPS
    };
    if quirks.contains(&CameraQuirk::FpsCap100) && fps > CAPPED_FPS {
        tracing::info!("Camera '{camera}' is capped at {CAPPED_FPS} FPS");
        return CAPPED_FPS;
    }
    fps
}

/// What the loop last applied to the source.
#[derive(Default)]
struct Applied {
    mode: Option<(usize, Option<Arc<CalibrationCoefficients>>)>,
    controls: Option<CameraControls>,
    pipeline: Option<usize>,
    last_good: Option<Arc<VisionResult>>,
}

/// Settings fields the loop reads each iteration.
struct Snapshot {
    controls: CameraControls,
    video_mode_index: usize,
    pipeline_index: usize,
}

struct LoopWorker {
    shared: Arc<Shared>,
    bus: Arc<DataChangeBus>,
    signal: ShutdownSignal,
    source: Box<dyn FrameSource>,
}

impl LoopWorker {
    fn run(mut self) {
        let period = self.shared.period();
        let modes = self.source.video_modes();
        tracing::info!(
            "Vision loop for '{}' started ({} modes, {:.1} ms period)",
            self.shared.camera,
            modes.len(),
            period.as_secs_f64() * 1000.0
        );

        let mut applied = Applied::default();
        while !self.signal.is_triggered() {
            let started = Instant::now();
            let snapshot = {
                let settings = self.shared.settings.lock();
                Snapshot {
                    controls: settings.controls,
                    video_mode_index: settings.video_mode_index,
                    pipeline_index: settings.pipeline_index,
                }
            };

            self.iterate(&snapshot, &modes, &mut applied);

            // Overruns proceed immediately; there is no catch-up.
            if let Some(remaining) = period.checked_sub(started.elapsed()) {
                if self.signal.wait_timeout(remaining) {
                    break;
                }
            }
        }

        self.source.release();
        tracing::info!("Vision loop for '{}' stopped", self.shared.camera);
    }

    fn iterate(&mut self, snapshot: &Snapshot, modes: &[VideoMode], applied: &mut Applied) {
        self.select_mode(snapshot.video_mode_index, modes, applied);

        if applied.controls != Some(snapshot.controls) {
            self.apply_controls(&snapshot.controls);
            applied.controls = Some(snapshot.controls);
        }

        let slot = self.shared.pipeline_slot(snapshot.pipeline_index);
        let pipeline = Arc::clone(&self.shared.pipelines[slot]);
        if applied.pipeline != Some(slot) {
            if slot != snapshot.pipeline_index {
                tracing::warn!(
                    "Pipeline index {} out of range for '{}', using '{}'",
                    snapshot.pipeline_index,
                    self.shared.camera,
                    pipeline.name()
                );
            } else {
                tracing::info!(
                    "Camera '{}' running pipeline '{}'",
                    self.shared.camera,
                    pipeline.name()
                );
            }
            applied.pipeline = Some(slot);
        }

        let frame = match self.source.get() {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.stats.lock().record_grab_failure();
                tracing::debug!("No frame from '{}': {e}", self.shared.camera);
                return;
            }
        };

        let captured = frame.timestamp_nanos;
        let calibration = applied.mode.as_ref().and_then(|(_, c)| c.clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pipeline.run(FrameInput { frame, calibration })
        }));
        let now = monotonic_nanos();

        let cause = match outcome {
            Ok(Ok(out)) => {
                let result = Arc::new(VisionResult {
                    camera: self.shared.camera.clone(),
                    camera_index: self.shared.index,
                    pipeline: pipeline.name().to_string(),
                    targets: out.output,
                    pipeline_nanos: out.total_elapsed_nanos,
                    latency_nanos: now.saturating_sub(captured),
                    published_nanos: now,
                    stale: false,
                });
                self.shared
                    .stats
                    .lock()
                    .record_frame(result.latency_nanos, result.pipeline_nanos);
                applied.last_good = Some(Arc::clone(&result));
                self.bus.publish(&DataChangeEvent::vision_result(result));
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        self.shared.stats.lock().record_stage_failure();
        tracing::warn!(
            "Pipeline '{}' failed on '{}': {cause}",
            pipeline.name(),
            self.shared.camera
        );
        if let Some(previous) = &applied.last_good {
            let stale = Arc::new(previous.restamped_stale(now));
            self.bus.publish(&DataChangeEvent::vision_result(stale));
        }
    }

    /// Switch video mode when the selection or its calibration changed.
    fn select_mode(&mut self, requested: usize, modes: &[VideoMode], applied: &mut Applied) {
        if modes.is_empty() {
            return;
        }
        let index = if requested < modes.len() { requested } else { 0 };
        let resolution = modes[index].resolution;
        let calibration = self.shared.calibration.get(resolution);

        let unchanged = matches!(
            &applied.mode,
            Some((i, c)) if *i == index && same_calibration(c, &calibration)
        );
        if unchanged {
            return;
        }

        if index != requested {
            tracing::warn!(
                "Video mode {requested} out of range for '{}' ({} modes), using mode 0",
                self.shared.camera,
                modes.len()
            );
        }
        let props = Arc::new(FrameStaticProperties::new(
            resolution,
            self.shared.fov_degrees,
            calibration.as_deref(),
        ));
        match self.source.set_video_mode(index, props) {
            Ok(()) => tracing::info!(
                "Camera '{}' using {resolution} @ {} FPS{}",
                self.shared.camera,
                modes[index].fps,
                if calibration.is_some() {
                    " (calibrated)"
                } else {
                    ""
                }
            ),
            Err(e) => tracing::warn!(
                "Failed to set video mode {index} on '{}': {e}",
                self.shared.camera
            ),
        }
        applied.mode = Some((index, calibration));
    }

    fn apply_controls(&mut self, controls: &CameraControls) {
        let camera = &self.shared.camera;
        let quirks = &self.shared.quirks;

        if quirks.contains(&CameraQuirk::NoManualExposure) {
            tracing::debug!("Camera '{camera}' ignores manual exposure, skipping");
        } else if let Err(e) = self.source.set_exposure(controls.exposure) {
            tracing::warn!("Failed to set exposure on '{camera}': {e}");
        }

        if let Err(e) = self.source.set_brightness(controls.brightness) {
            tracing::warn!("Failed to set brightness on '{camera}': {e}");
        }

        if quirks.contains(&CameraQuirk::Gain) {
            if let Err(e) = self.source.set_gain(controls.gain) {
                tracing::warn!("Failed to set gain on '{camera}': {e}");
            }
        }
    }
}

fn same_calibration(
    a: &Option<Arc<CalibrationCoefficients>>,
    b: &Option<Arc<CalibrationCoefficients>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
