use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Hardware controls pushed to the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraControls {
    pub exposure: f64,
    pub brightness: i32,
    pub gain: i32,
}

impl Default for CameraControls {
    fn default() -> Self {
        Self {
            exposure: 50.0,
            brightness: 50,
            gain: 0,
        }
    }
}

/// Stored params of one pipeline, keyed by stage name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub nickname: String,
    pub params: Map<String, Value>,
}

impl PipelineSettings {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            params: Map::new(),
        }
    }
}

/// Mutable per-camera settings. Shared between the loop thread and
/// inbound settings changes behind one lock; the loop works on a copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisionModuleSettings {
    pub controls: CameraControls,
    pub video_mode_index: usize,
    pub pipeline_index: usize,
    pub pipeline_settings: Vec<PipelineSettings>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown module property '{0}'")]
    UnknownProperty(String),

    #[error("property '{property}' expects {expected}")]
    InvalidValue {
        property: String,
        expected: &'static str,
    },
}

/// What an applied change requires of the running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    Controls,
    VideoMode,
    Pipeline,
}

impl VisionModuleSettings {
    /// Apply one module-level property change by name. Returns `None` when
    /// the value matches what is already set.
    pub fn apply_property(
        &mut self,
        property: &str,
        value: &Value,
    ) -> Result<Option<SettingsChange>, SettingsError> {
        match property {
            "exposure" => {
                let exposure = value
                    .as_f64()
                    .ok_or_else(|| invalid(property, "a number"))?;
                Ok(replace(&mut self.controls.exposure, exposure, SettingsChange::Controls))
            }
            "brightness" => {
                let brightness = as_i32(property, value)?;
                Ok(replace(&mut self.controls.brightness, brightness, SettingsChange::Controls))
            }
            "gain" => {
                let gain = as_i32(property, value)?;
                Ok(replace(&mut self.controls.gain, gain, SettingsChange::Controls))
            }
            "videoModeIndex" => {
                let index = as_index(property, value)?;
                Ok(replace(&mut self.video_mode_index, index, SettingsChange::VideoMode))
            }
            "pipelineIndex" => {
                let index = as_index(property, value)?;
                Ok(replace(&mut self.pipeline_index, index, SettingsChange::Pipeline))
            }
            other => Err(SettingsError::UnknownProperty(other.to_string())),
        }
    }

    /// Stored params for the pipeline at `index`.
    pub fn pipeline_params(&self, index: usize) -> Option<&Map<String, Value>> {
        self.pipeline_settings.get(index).map(|p| &p.params)
    }

    /// Record `params` as the stored params of `stage` in pipeline
    /// `index`, growing the list if needed.
    pub fn store_stage_params(&mut self, index: usize, stage: &str, params: Value) {
        if self.pipeline_settings.len() <= index {
            self.pipeline_settings
                .resize_with(index + 1, PipelineSettings::default);
        }
        self.pipeline_settings[index]
            .params
            .insert(stage.to_string(), params);
    }
}

fn replace<T: PartialEq>(
    slot: &mut T,
    value: T,
    change: SettingsChange,
) -> Option<SettingsChange> {
    if *slot == value {
        return None;
    }
    *slot = value;
    Some(change)
}

fn invalid(property: &str, expected: &'static str) -> SettingsError {
    SettingsError::InvalidValue {
        property: property.to_string(),
        expected,
    }
}

fn as_i32(property: &str, value: &Value) -> Result<i32, SettingsError> {
    value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| invalid(property, "a 32-bit integer"))
}

fn as_index(property: &str, value: &Value) -> Result<usize, SettingsError> {
    value
        .as_u64()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| invalid(property, "a non-negative integer"))
}
