//! Ordered composition of stages with per-stage timing.
//!
//! A run snapshots the stage list (stages and their params) once, up
//! front. Parameter or stage-list replacements publish a new list and
//! are picked up by the next run; a run in flight keeps what it started
//! with.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::stage::{AnyData, PipeStage, StageFault, StageSlot};

/// Elapsed time of one stage in one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub stage: String,
    pub elapsed_nanos: u64,
}

impl StageTiming {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }
}

/// Output of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineOutput<O> {
    pub output: O,
    pub stage_timings: Vec<StageTiming>,
    /// Sum of all stage times.
    pub total_elapsed_nanos: u64,
}

impl<O> PipelineOutput<O> {
    pub fn total_elapsed(&self) -> Duration {
        Duration::from_nanos(self.total_elapsed_nanos)
    }
}

/// Typed builder. `C` is the output type of the last stage added.
#[must_use = "call .build() to create the pipeline"]
pub struct PipelineBuilder<I, C> {
    name: String,
    slots: Vec<StageSlot>,
    _types: PhantomData<fn(I) -> C>,
}

impl<I: Send + 'static, C: Send + 'static> PipelineBuilder<I, C> {
    /// Append a stage whose input is the current output type.
    pub fn then<S>(mut self, name: impl Into<String>, stage: S) -> PipelineBuilder<I, S::Output>
    where
        S: PipeStage<Input = C>,
    {
        self.slots.push(StageSlot::new(name, stage));
        PipelineBuilder {
            name: self.name,
            slots: self.slots,
            _types: PhantomData,
        }
    }

    /// Append a stage with explicit initial params.
    pub fn then_with<S>(
        self,
        name: impl Into<String>,
        stage: S,
        params: S::Params,
    ) -> PipelineBuilder<I, S::Output>
    where
        S: PipeStage<Input = C>,
    {
        let mut next = self.then(name, stage);
        if let Some(slot) = next.slots.last_mut() {
            slot.params = Arc::new(params);
        }
        next
    }

    pub fn build(self) -> Pipeline<I, C> {
        Pipeline {
            name: self.name,
            stages: RwLock::new(Arc::new(self.slots)),
            _types: PhantomData,
        }
    }
}

/// A named, runnable stage list from `I` to `O`.
pub struct Pipeline<I, O> {
    name: String,
    stages: RwLock<Arc<Vec<StageSlot>>>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I: Send + 'static> Pipeline<I, I> {
    /// Start building a pipeline that consumes `I`.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<I, I> {
        PipelineBuilder {
            name: name.into(),
            slots: Vec::new(),
            _types: PhantomData,
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> Pipeline<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run every stage in order. A failing stage stops the run and its
    /// error is returned as `PipelineError::StageFailure`.
    pub fn run(&self, input: I) -> Result<PipelineOutput<O>> {
        let stages = Arc::clone(&self.stages.read());

        let mut data: AnyData = Box::new(input);
        let mut stage_timings = Vec::with_capacity(stages.len());
        let mut total_elapsed_nanos = 0u64;

        for slot in stages.iter() {
            let start = Instant::now();
            let result = slot.stage.process_any(data, slot.params.as_ref());
            let elapsed = start.elapsed();

            slot.record_elapsed(elapsed);
            let elapsed_nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
            total_elapsed_nanos = total_elapsed_nanos.saturating_add(elapsed_nanos);
            stage_timings.push(StageTiming {
                stage: slot.name.clone(),
                elapsed_nanos,
            });

            data = result.map_err(|fault| match fault {
                StageFault::Failed(cause) => PipelineError::StageFailure {
                    stage: slot.name.clone(),
                    cause: cause.to_string(),
                },
                StageFault::TypeMismatch => PipelineError::TypeMismatch {
                    stage: slot.name.clone(),
                },
            })?;
        }

        let output = data
            .downcast::<O>()
            .map_err(|_| PipelineError::TypeMismatch {
                stage: self.name.clone(),
            })?;

        Ok(PipelineOutput {
            output: *output,
            stage_timings,
            total_elapsed_nanos,
        })
    }

    /// Replace the whole stage list. The builder's types pin the new list
    /// to the same input and output.
    pub fn replace_stages(&self, builder: PipelineBuilder<I, O>) {
        *self.stages.write() = Arc::new(builder.slots);
    }

    /// Replace one stage's params with a typed value.
    pub fn set_params<P: Any + Send + Sync>(&self, stage: &str, params: P) -> Result<()> {
        self.update(|slots| {
            let slot = find_slot(slots, stage)?;
            if slot.stage.params_type() != std::any::TypeId::of::<P>() {
                return Err(PipelineError::InvalidParams {
                    stage: stage.to_string(),
                    cause: "params type does not match stage".to_string(),
                });
            }
            slot.params = Arc::new(params);
            Ok(())
        })
    }

    /// Apply a params object keyed by stage name. Every entry is decoded
    /// before anything is published, so a bad entry leaves the pipeline
    /// untouched. Keys that name no stage are ignored.
    pub fn configure(&self, params: &Map<String, Value>) -> Result<()> {
        self.update(|slots| {
            for (key, value) in params {
                let Some(slot) = slots.iter_mut().find(|s| s.name == *key) else {
                    tracing::debug!("Ignoring params for unknown stage '{key}'");
                    continue;
                };
                slot.params = slot.stage.decode_params(value.clone()).map_err(|e| {
                    PipelineError::InvalidParams {
                        stage: key.clone(),
                        cause: e.to_string(),
                    }
                })?;
            }
            Ok(())
        })
    }

    /// Merge `patch` (a JSON object) into one stage's current params and
    /// return the merged params.
    pub fn merge_params(&self, stage: &str, patch: &Value) -> Result<Value> {
        self.update(|slots| {
            let slot = find_slot(slots, stage)?;
            let mut merged = slot
                .stage
                .encode_params(slot.params.as_ref())
                .unwrap_or_else(|| Value::Object(Map::new()));
            merge_json(&mut merged, patch);
            slot.params =
                slot.stage
                    .decode_params(merged.clone())
                    .map_err(|e| PipelineError::InvalidParams {
                        stage: stage.to_string(),
                        cause: e.to_string(),
                    })?;
            Ok(merged)
        })
    }

    /// Current params of every stage, keyed by stage name.
    pub fn params_json(&self) -> Map<String, Value> {
        let stages = Arc::clone(&self.stages.read());
        stages
            .iter()
            .filter_map(|s| {
                s.stage
                    .encode_params(s.params.as_ref())
                    .map(|v| (s.name.clone(), v))
            })
            .collect()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Elapsed time of each stage's most recent execution.
    pub fn last_stage_timings(&self) -> Vec<StageTiming> {
        self.stages
            .read()
            .iter()
            .map(|s| StageTiming {
                stage: s.name.clone(),
                elapsed_nanos: u64::try_from(s.last_elapsed().as_nanos()).unwrap_or(u64::MAX),
            })
            .collect()
    }

    /// Copy-on-write edit of the stage list, published only on success.
    fn update<T>(&self, edit: impl FnOnce(&mut Vec<StageSlot>) -> Result<T>) -> Result<T> {
        let mut guard = self.stages.write();
        let mut next: Vec<StageSlot> = (**guard).clone();
        let out = edit(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }
}

fn find_slot<'a>(slots: &'a mut [StageSlot], stage: &str) -> Result<&'a mut StageSlot> {
    slots
        .iter_mut()
        .find(|s| s.name == stage)
        .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))
}

/// Shallow-recursive JSON merge: objects merge key by key, anything else
/// replaces the target.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
