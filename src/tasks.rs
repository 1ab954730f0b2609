//! Named periodic tasks on a dedicated runtime.
//!
//! Every task has its own interval. Actions run on the blocking pool, so
//! a slow action only delays its own next tick; an action that errors or
//! panics is logged and scheduled again on its next period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bus::dispatch::HandlerError;
use crate::logging::panic_message;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("a task named '{0}' is already scheduled")]
    DuplicateName(String),

    #[error("task '{0}' needs a non-zero period")]
    InvalidPeriod(String),

    #[error("failed to build task runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub struct TimedTaskManager {
    runtime: Runtime,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimedTaskManager {
    pub fn new() -> Result<Self, TaskError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("timed-tasks")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Run `action` every `period`, first tick immediately.
    pub fn add_task<F>(&self, name: &str, period: Duration, action: F) -> Result<(), TaskError>
    where
        F: Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(TaskError::InvalidPeriod(name.to_string()));
        }
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(name) {
            return Err(TaskError::DuplicateName(name.to_string()));
        }

        let action = Arc::new(action);
        let task_name = name.to_string();
        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let action = Arc::clone(&action);
                match tokio::task::spawn_blocking(move || action()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Timed task '{task_name}' failed: {e}"),
                    Err(e) if e.is_panic() => tracing::error!(
                        "Timed task '{task_name}' panicked: {}",
                        panic_message(e.into_panic().as_ref())
                    ),
                    Err(_) => return,
                }
            }
        });

        tracing::debug!("Scheduled task '{name}' every {period:?}");
        tasks.insert(name.to_string(), handle);
        Ok(())
    }

    /// Cancel a task. Returns `false` if no task had that name.
    pub fn remove_task(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                tracing::debug!("Removed task '{name}'");
                true
            }
            None => false,
        }
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle for spawning other background work on the same runtime.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }
}

impl Drop for TimedTaskManager {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}
