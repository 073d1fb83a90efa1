//! Task execution for consumer loops
//!
//! The processor treats its executor as "something that runs a submitted task
//! on a dedicated worker". The default implementation spawns one named,
//! detached thread per task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::error::{RelayError, Result};

/// Runs long-lived consumer tasks on dedicated workers
pub trait TaskExecutor: Send + Sync {
    /// Run `task` on a dedicated worker labelled `name`.
    ///
    /// Rejections are surfaced as errors: [`RelayError::ExecutorShutDown`]
    /// when the executor no longer accepts work, [`RelayError::Rejected`]
    /// otherwise.
    fn execute(&self, name: &str, task: Box<dyn FnOnce() + Send + 'static>) -> Result<()>;
}

/// Executor that spawns one detached named thread per task
pub struct ThreadPerTaskExecutor {
    shut_down: AtomicBool,
}

impl ThreadPerTaskExecutor {
    /// Create a new executor
    pub fn new() -> Self {
        Self {
            shut_down: AtomicBool::new(false),
        }
    }

    /// Stop accepting new tasks. Already-running workers are unaffected.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    /// Whether this executor has been shut down
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Default for ThreadPerTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor for ThreadPerTaskExecutor {
    fn execute(&self, name: &str, task: Box<dyn FnOnce() + Send + 'static>) -> Result<()> {
        if self.is_shut_down() {
            return Err(RelayError::ExecutorShutDown);
        }
        thread::Builder::new()
            .name(name.to_string())
            .spawn(task)
            .map(|_| ())
            .map_err(|e| RelayError::Rejected(e.to_string()))
    }
}
