//! Assembles the running server from a [`ServerConfig`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::bus::dispatch::DataChangeBus;
use crate::camera::dummy::{BrightSpotDetector, DummySource, PinholeSolver};
use crate::camera::quirks::QuirkRegistry;
use crate::config::{CameraConfig, ConfigError, ServerConfig};
use crate::context::VisionContext;
use crate::module::error::ModuleError;
use crate::module::manager::{StopReport, VisionModuleManager};
use crate::module::vision::{ModuleConfig, VisionModule};
use crate::pipeline::compose::Pipeline;
use crate::pipeline::stages::{DetectStage, DriverModeStage, TargetStage};
use crate::pipeline::VisionPipeline;
use crate::publish::telemetry::TelemetryPublisher;
use crate::publish::ui::{LogSink, UiResultPublisher};
use crate::settings::store::JsonConfigStore;
use crate::tasks::{TaskError, TimedTaskManager};

const STATS_TASK: &str = "diagnostics";
/// Width of the synthetic target, metres.
const TARGET_WIDTH_M: f64 = 0.2;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

pub struct Server {
    context: VisionContext,
    manager: Arc<VisionModuleManager>,
    tasks: TimedTaskManager,
    store: Arc<JsonConfigStore>,
    telemetry: Arc<TelemetryPublisher>,
}

impl Server {
    /// Open the store, wire the bus consumers and create one module per
    /// configured camera. Nothing runs until [`Server::start`].
    pub fn build(config: &ServerConfig, store_path: PathBuf) -> Result<Self, ServerError> {
        config.validate()?;

        let tasks = TimedTaskManager::new()?;
        let store = Arc::new(JsonConfigStore::new(store_path));
        store.start_debounce_task(&tasks.handle());

        let context = VisionContext::new(
            Arc::new(DataChangeBus::new()),
            Arc::new(QuirkRegistry::with_known_cameras()),
        )
        .with_store(store.clone());

        let telemetry = Arc::new(TelemetryPublisher::new());
        context.bus.subscribe(telemetry.clone());
        context
            .bus
            .subscribe(Arc::new(UiResultPublisher::new(LogSink)));

        let manager = Arc::new(VisionModuleManager::new());
        for (index, camera) in config.cameras.iter().enumerate() {
            manager.add_module(build_module(index, camera, &context))?;
        }

        let stats = Arc::clone(&manager);
        tasks.add_task(
            STATS_TASK,
            Duration::from_secs(config.stats_period_secs.max(1)),
            move || {
                stats.log_stats();
                Ok(())
            },
        )?;

        Ok(Self {
            context,
            manager,
            tasks,
            store,
            telemetry,
        })
    }

    pub fn start(&self) -> Result<usize, ServerError> {
        Ok(self.manager.start_all()?)
    }

    /// Stop every module within `deadline`, then flush persisted state.
    pub fn shutdown(&self, deadline: Duration) -> StopReport {
        let report = self.manager.stop_all(deadline);
        self.tasks.remove_task(STATS_TASK);
        self.store.stop_debounce_task();
        if let Err(e) = self.store.flush() {
            tracing::warn!("Failed to flush settings on shutdown: {e}");
        }
        report
    }

    pub fn context(&self) -> &VisionContext {
        &self.context
    }

    pub fn manager(&self) -> &VisionModuleManager {
        &self.manager
    }

    pub fn telemetry(&self) -> &TelemetryPublisher {
        &self.telemetry
    }
}

/// Target-finding pipeline followed by a plain driver pipeline.
fn default_pipelines() -> Vec<Arc<VisionPipeline>> {
    vec![
        Arc::new(
            Pipeline::builder("targets")
                .then("detect", DetectStage::new(BrightSpotDetector::default()))
                .then("targets", TargetStage::new(PinholeSolver::new(TARGET_WIDTH_M)))
                .build(),
        ),
        Arc::new(
            Pipeline::builder("driver")
                .then("driver", DriverModeStage)
                .build(),
        ),
    ]
}

fn build_module(index: usize, camera: &CameraConfig, context: &VisionContext) -> VisionModule {
    let mut source = DummySource::new(camera.name.as_str());
    if let Some(identity) = camera.usb_identity() {
        source = source.with_identity(identity);
    }
    if !camera.video_modes.is_empty() {
        source = source.with_modes(camera.video_modes.clone());
    }
    VisionModule::new(
        ModuleConfig::new(index, camera.name.as_str())
            .with_fov(camera.fov_degrees)
            .with_fps(camera.desired_fps),
        Box::new(source),
        default_pipelines(),
        context,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::{DataChangeEvent, DestType, SourceType};
    use crate::module::vision::ModuleState;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn runs_dummy_cameras_end_to_end() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("cameras.json");
        let server = Server::build(&ServerConfig::dummy(2), store_path.clone()).unwrap();
        assert_eq!(server.start().unwrap(), 2);

        let deadline = Instant::now() + Duration::from_secs(3);
        while server.telemetry().entries().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.telemetry().entries().len(), 2);

        server.context().bus.publish(
            &DataChangeEvent::json(
                SourceType::Http,
                DestType::ActiveModule,
                "pipelineIndex",
                serde_json::json!(1),
            )
            .with_index(1),
        );

        let report = server.shutdown(Duration::from_secs(2));
        assert!(report.is_clean());
        assert!(server
            .manager()
            .get("dummy-0")
            .is_some_and(|m| m.state() == ModuleState::Stopped));

        let saved = JsonConfigStore::load(&store_path).unwrap();
        let settings = saved.cameras["dummy-1"].settings.as_ref().unwrap();
        assert_eq!(settings.pipeline_index, 1);
    }

    #[test]
    fn configured_identity_reaches_quirk_lookup() {
        let dir = TempDir::new().unwrap();
        let mut eye = CameraConfig::new("eye");
        eye.vendor_id = Some(0x1415);
        eye.product_id = Some(0x2000);
        eye.desired_fps = 187.0;
        let config = ServerConfig {
            cameras: vec![eye, CameraConfig::new("plain")],
            stats_period_secs: 5,
        };
        let server = Server::build(&config, dir.path().join("cameras.json")).unwrap();

        let eye = server.manager().get("eye").unwrap();
        assert!(!eye.quirks().is_empty());
        assert_eq!(eye.desired_fps(), 100.0);
        assert!(server.manager().get("plain").unwrap().quirks().is_empty());
        assert_eq!(
            eye.pipeline_names(),
            vec!["targets".to_string(), "driver".to_string()]
        );
    }

    #[test]
    fn shutdown_flush_keeps_a_change_made_just_before_it() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("cameras.json");
        let server = Server::build(&ServerConfig::dummy(1), store_path.clone()).unwrap();
        server.start().unwrap();

        for exposure in [10, 20, 30] {
            server.context().bus.publish(&DataChangeEvent::json(
                SourceType::Websocket,
                DestType::ActiveModule,
                "exposure",
                serde_json::json!(exposure),
            ));
        }
        assert!(server.shutdown(Duration::from_secs(2)).is_clean());

        std::thread::sleep(Duration::from_millis(700));
        let saved = JsonConfigStore::load(&store_path).unwrap();
        let settings = saved.cameras["dummy-0"].settings.as_ref().unwrap();
        assert_eq!(settings.controls.exposure, 30.0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            cameras: Vec::new(),
            stats_period_secs: 5,
        };
        assert!(matches!(
            Server::build(&config, dir.path().join("cameras.json")),
            Err(ServerError::Config(ConfigError::NoCameras))
        ));
    }
}
