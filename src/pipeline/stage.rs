//! The stage abstraction: one named, parameterised transform.
//!
//! Stages are written against [`PipeStage`] with concrete types. The
//! pipeline stores them type-erased so a stage list can be swapped as a
//! single value; the builder guarantees adjacent stages agree on types.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::pipeline::error::StageError;

/// A pure transform `Output = f(Input, Params)`.
///
/// `process` must not touch shared state; everything it needs arrives
/// through `input` and `params`.
pub trait PipeStage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;
    type Params: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn process(&self, input: Self::Input, params: &Self::Params)
        -> Result<Self::Output, StageError>;
}

pub(crate) type AnyData = Box<dyn Any + Send>;
pub(crate) type AnyParams = Arc<dyn Any + Send + Sync>;

/// Why an erased stage did not produce output.
pub(crate) enum StageFault {
    Failed(StageError),
    TypeMismatch,
}

/// Object-safe view of a [`PipeStage`].
pub(crate) trait ErasedStage: Send + Sync {
    fn process_any(
        &self,
        input: AnyData,
        params: &(dyn Any + Send + Sync),
    ) -> Result<AnyData, StageFault>;

    fn params_type(&self) -> TypeId;

    fn default_params(&self) -> AnyParams;

    fn decode_params(&self, value: serde_json::Value) -> Result<AnyParams, serde_json::Error>;

    fn encode_params(&self, params: &(dyn Any + Send + Sync)) -> Option<serde_json::Value>;
}

struct Erased<S>(S);

impl<S: PipeStage> ErasedStage for Erased<S> {
    fn process_any(
        &self,
        input: AnyData,
        params: &(dyn Any + Send + Sync),
    ) -> Result<AnyData, StageFault> {
        let input = input
            .downcast::<S::Input>()
            .map_err(|_| StageFault::TypeMismatch)?;
        let params = params
            .downcast_ref::<S::Params>()
            .ok_or(StageFault::TypeMismatch)?;
        self.0
            .process(*input, params)
            .map(|out| Box::new(out) as AnyData)
            .map_err(StageFault::Failed)
    }

    fn params_type(&self) -> TypeId {
        TypeId::of::<S::Params>()
    }

    fn default_params(&self) -> AnyParams {
        Arc::new(S::Params::default())
    }

    fn decode_params(&self, value: serde_json::Value) -> Result<AnyParams, serde_json::Error> {
        let params: S::Params = serde_json::from_value(value)?;
        Ok(Arc::new(params))
    }

    fn encode_params(&self, params: &(dyn Any + Send + Sync)) -> Option<serde_json::Value> {
        params
            .downcast_ref::<S::Params>()
            .and_then(|p| serde_json::to_value(p).ok())
    }
}

/// One entry of a pipeline's stage list.
///
/// Cloning is cheap: the stage and its params are shared, only the slot
/// is copied when a new stage list is published.
#[derive(Clone)]
pub(crate) struct StageSlot {
    pub(crate) name: String,
    pub(crate) stage: Arc<dyn ErasedStage>,
    pub(crate) params: AnyParams,
    last_elapsed_nanos: Arc<AtomicU64>,
}

impl StageSlot {
    pub(crate) fn new<S: PipeStage>(name: impl Into<String>, stage: S) -> Self {
        let stage: Arc<dyn ErasedStage> = Arc::new(Erased(stage));
        let params = stage.default_params();
        Self {
            name: name.into(),
            stage,
            params,
            last_elapsed_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn record_elapsed(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.last_elapsed_nanos.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn last_elapsed(&self) -> Duration {
        Duration::from_nanos(self.last_elapsed_nanos.load(Ordering::Relaxed))
    }
}
