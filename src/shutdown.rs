use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Cloneable cancellation token.
///
/// Loops check [`is_triggered`](Self::is_triggered) at the top of every
/// iteration and sleep with [`wait_timeout`](Self::wait_timeout), which
/// wakes as soon as the signal fires.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every waiter. Idempotent.
    pub fn trigger(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`. Returns `true` if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                return self.is_triggered();
            }
        }
        true
    }
}
