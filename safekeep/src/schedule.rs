//! One-shot deferred work
//!
//! Runs a closure after a delay on the ambient tokio runtime. Outside a
//! runtime (plain synchronous embedding, CLI tools) a short-lived thread does
//! the waiting instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Handle to a pending delayed closure
///
/// Dropping the handle detaches the task; it still runs.
#[derive(Debug)]
pub struct DelayedTask {
    inner: TaskInner,
}

#[derive(Debug)]
enum TaskInner {
    Tokio(JoinHandle<()>),
    Thread {
        cancelled: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
    },
}

impl DelayedTask {
    /// Prevent the closure from running if it has not started yet
    pub fn cancel(&self) {
        match &self.inner {
            TaskInner::Tokio(handle) => handle.abort(),
            TaskInner::Thread { cancelled, .. } => cancelled.store(true, Ordering::SeqCst),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            TaskInner::Tokio(handle) => handle.is_finished(),
            TaskInner::Thread { finished, .. } => finished.load(Ordering::SeqCst),
        }
    }
}

/// Run `f` once `delay` has elapsed
pub fn spawn_delayed<F>(delay: Duration, f: F) -> DelayedTask
where
    F: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(async move {
                tokio::time::sleep(delay).await;
                f();
            });
            DelayedTask {
                inner: TaskInner::Tokio(task),
            }
        }
        Err(_) => {
            tracing::debug!(
                delay_ms = delay.as_millis() as u64,
                "no tokio runtime, deferring on a thread"
            );
            let cancelled = Arc::new(AtomicBool::new(false));
            let finished = Arc::new(AtomicBool::new(false));
            let (c, done) = (cancelled.clone(), finished.clone());
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                if !c.load(Ordering::SeqCst) {
                    f();
                }
                done.store(true, Ordering::SeqCst);
            });
            DelayedTask {
                inner: TaskInner::Thread {
                    cancelled,
                    finished,
                },
            }
        }
    }
}
