use serde::Serialize;
use std::time::Instant;

/// Collects diagnostic statistics for one vision module.
pub struct DiagnosticStats {
    frame_count: u64,
    grab_failures: u64,
    stage_failures: u64,
    start_time: Instant,
    last_latency_nanos: u64,
    last_pipeline_nanos: u64,
}

/// Snapshot of diagnostic stats for logging and the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub fps: f64,
    pub frame_count: u64,
    pub grab_failures: u64,
    pub stage_failures: u64,
    pub drop_rate: f64,
    pub latency_ms: f64,
    pub pipeline_ms: f64,
}

impl DiagnosticStats {
    /// Create new stats with zeroed counters.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            grab_failures: 0,
            stage_failures: 0,
            start_time: Instant::now(),
            last_latency_nanos: 0,
            last_pipeline_nanos: 0,
        }
    }

    /// Record a frame that made it through the pipeline.
    pub fn record_frame(&mut self, latency_nanos: u64, pipeline_nanos: u64) {
        self.frame_count += 1;
        self.last_latency_nanos = latency_nanos;
        self.last_pipeline_nanos = pipeline_nanos;
    }

    /// Record a pull that returned no frame.
    pub fn record_grab_failure(&mut self) {
        self.grab_failures += 1;
    }

    /// Record a pipeline run that failed in a stage.
    pub fn record_stage_failure(&mut self) {
        self.stage_failures += 1;
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average processed frames per second since start or last reset.
    pub fn fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.frame_count as f64 / elapsed
    }

    /// Failed iterations as a percentage (0.0 - 100.0).
    pub fn drop_rate(&self) -> f64 {
        let dropped = self.grab_failures + self.stage_failures;
        let total = self.frame_count + dropped;
        if total == 0 {
            return 0.0;
        }
        (dropped as f64 / total as f64) * 100.0
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Take a serialisable snapshot.
    pub fn snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot {
            fps: self.fps(),
            frame_count: self.frame_count,
            grab_failures: self.grab_failures,
            stage_failures: self.stage_failures,
            drop_rate: self.drop_rate(),
            latency_ms: self.last_latency_nanos as f64 / 1e6,
            pipeline_ms: self.last_pipeline_nanos as f64 / 1e6,
        }
    }
}

impl Default for DiagnosticStats {
    fn default() -> Self {
        Self::new()
    }
}
