// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Usage errors and task failures are values of [`Error`]. Broken
//! invariants (a second trigger, switching into a running fiber, a stack
//! that cannot be allocated while starting a task) go through [`fatal`]
//! and abort the process.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::fiber::FiberStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("failed to allocate a fiber stack of {size} bytes")]
    AllocationFailed {
        size: usize,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("cannot await in a task that is not running")]
    TaskNotRunning,

    #[error("task has been disposed")]
    Disposed,

    #[error("cannot await a task that runs on a different task scheduler")]
    CrossScheduler,

    #[error("awaitable has not been resolved")]
    Unresolved,

    #[error("deferred has already been resolved")]
    AlreadyResolved,

    #[error("task scheduler is already running")]
    SchedulerBusy,

    #[error("yield must be called from within a running fiber")]
    NotInFiber,

    #[error("cannot switch into a fiber that is {0}")]
    FiberState(FiberStatus),

    #[error("task panicked: {0}")]
    Panicked(String),

    /// Failure raised by task code.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Raise a failure carrying only a message.
    pub fn raise(message: impl Into<String>) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = message.into().into();
        Error::Failed(Arc::from(boxed))
    }

    /// Wrap an arbitrary error as a task failure.
    pub fn failed(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Failed(Arc::new(err))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed)
    }
}

/// Report a broken runtime invariant and abort.
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    log::error!("fatal runtime error: {message}");
    eprintln!("rask-fiber: fatal runtime error: {message}");
    std::process::abort()
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
