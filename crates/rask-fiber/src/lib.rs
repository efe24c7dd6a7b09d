// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Rask fiber runtime.
//!
//! Cooperative, stackful coroutines on a single thread. Code inside a task
//! calls [`wait`] and reads like blocking code; the task suspends at that
//! point and the scheduler runs something else until the awaited value
//! settles.
//!
//! Components:
//! - stack/arch/fiber — guarded stacks and the raw context switch
//! - awaitable — single-fire continuation lists
//! - task — task state machine, `wait`, inlining, disposal
//! - deferred — awaitables settled by hand
//! - context — immutable request-scoped values
//! - scheduler/event_loop — ready queue, run loop, cross-thread completions

mod arch;
pub mod awaitable;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod task;

pub use awaitable::{Awaited, Registration};
pub use config::Config;
pub use context::{Context, ContextVar};
pub use deferred::{Deferred, DeferredAwaitable};
pub use error::{Error, Result};
pub use event_loop::Completer;
pub use fiber::{Fiber, FiberId, FiberStatus};
pub use scheduler::Scheduler;
pub use stack::Stack;
pub use task::{is_running, wait, Builder, Task, TaskId, TaskStatus};
