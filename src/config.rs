//! Server configuration: the camera list file and the command line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::types::{UsbIdentity, VideoMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config lists no cameras")]
    NoCameras,

    #[error("camera name '{0}' is used more than once")]
    DuplicateCamera(String),
}

/// Multi-camera vision server.
#[derive(Debug, Parser)]
#[command(name = "camvision", version)]
pub struct Cli {
    /// Camera list (JSON). Without it, `--dummy-cameras` synthetic
    /// cameras are used.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding persisted settings and calibrations.
    #[arg(long, value_name = "DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Number of synthetic cameras when no config file is given.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub dummy_cameras: usize,

    /// Log filter, e.g. "info" or "camvision_lib=debug". `RUST_LOG` wins.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// The config file when given, otherwise a synthetic camera list.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        match &self.config {
            Some(path) => ServerConfig::load(path),
            None => Ok(ServerConfig::dummy(self.dummy_cameras)),
        }
    }

    /// Path of the persisted per-camera store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("cameras.json")
    }
}

fn default_fov() -> f64 {
    70.0
}

fn default_fps() -> f64 {
    30.0
}

fn default_stats_period() -> u64 {
    5
}

/// One configured camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    /// Unique name; also the key for persisted state.
    pub name: String,
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default = "default_fov")]
    pub fov_degrees: f64,
    #[serde(default = "default_fps")]
    pub desired_fps: f64,
    /// Empty keeps the source's own modes.
    #[serde(default)]
    pub video_modes: Vec<VideoMode>,
}

impl CameraConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor_id: None,
            product_id: None,
            fov_degrees: default_fov(),
            desired_fps: default_fps(),
            video_modes: Vec::new(),
        }
    }

    /// USB identity, when both ids are configured.
    pub fn usb_identity(&self) -> Option<UsbIdentity> {
        Some(UsbIdentity::new(self.vendor_id?, self.product_id?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub cameras: Vec<CameraConfig>,
    /// How often module diagnostics are logged.
    #[serde(default = "default_stats_period")]
    pub stats_period_secs: u64,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `count` synthetic cameras named `dummy-0`, `dummy-1`, ...
    pub fn dummy(count: usize) -> Self {
        Self {
            cameras: (0..count.max(1))
                .map(|i| CameraConfig::new(format!("dummy-{i}")))
                .collect(),
            stats_period_secs: default_stats_period(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.name.as_str()) {
                return Err(ConfigError::DuplicateCamera(camera.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::Resolution;
    use tempfile::TempDir;

    fn write(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("server.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{ "cameras": [
                { "name": "front", "vendorId": 5141, "productId": 8192 },
                { "name": "rear", "desiredFps": 60,
                  "videoModes": [{ "resolution": { "width": 640, "height": 480 },
                                   "fps": 60, "pixelFormat": "MJPG" }] }
            ] }"#,
        );
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.stats_period_secs, 5);
        assert_eq!(config.cameras[0].fov_degrees, 70.0);
        assert_eq!(
            config.cameras[0].usb_identity(),
            Some(UsbIdentity::new(0x1415, 0x2000))
        );
        assert_eq!(config.cameras[1].usb_identity(), None);
        assert_eq!(config.cameras[1].desired_fps, 60.0);
        assert_eq!(
            config.cameras[1].video_modes[0].resolution,
            Resolution::new(640, 480)
        );
    }

    #[test]
    fn load_rejects_duplicates_and_empty_lists() {
        let dir = TempDir::new().unwrap();
        let dup = write(&dir, r#"{ "cameras": [{ "name": "a" }, { "name": "a" }] }"#);
        assert!(matches!(
            ServerConfig::load(&dup),
            Err(ConfigError::DuplicateCamera(name)) if name == "a"
        ));
        let empty = write(&dir, r#"{ "cameras": [] }"#);
        assert!(matches!(
            ServerConfig::load(&empty),
            Err(ConfigError::NoCameras)
        ));
    }

    #[test]
    fn load_reports_missing_and_malformed_files() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ServerConfig::load(&dir.path().join("absent.json")),
            Err(ConfigError::Io { .. })
        ));
        let bad = write(&dir, "{ cameras");
        assert!(matches!(
            ServerConfig::load(&bad),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn dummy_config_has_at_least_one_camera() {
        let config = ServerConfig::dummy(0);
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(ServerConfig::dummy(3).cameras[2].name, "dummy-2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "camvision",
            "--data-dir",
            "/tmp/vision",
            "--dummy-cameras",
            "2",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.store_path(), PathBuf::from("/tmp/vision/cameras.json"));
        assert_eq!(cli.server_config().unwrap().cameras.len(), 2);
        assert_eq!(cli.log_level, "debug");
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["camvision"]);
        assert_eq!(cli.dummy_cameras, 1);
        assert_eq!(cli.data_dir, PathBuf::from("data"));
    }
}
