// Pipeline domain: stage composition, timing and the built-in stages.

pub mod compose;
pub mod error;
pub mod stage;
pub mod stages;
pub mod target;

use compose::Pipeline;
use target::{FrameInput, TargetList};

/// The pipeline shape every vision module runs.
pub type VisionPipeline = Pipeline<FrameInput, TargetList>;
