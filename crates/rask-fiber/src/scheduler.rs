// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded task scheduler.
//!
//! Owns the ready queue and the registry of live tasks, and drives the
//! event loop. Tasks only hold a weak reference back, so dropping the last
//! [`Scheduler`] handle shuts it down and disposes whatever is still live.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::config::Config;
use crate::context::Context;
use crate::deferred::{Deferred, DeferredAwaitable};
use crate::error::{Error, Result};
use crate::event_loop::{Completer, EventLoop};
use crate::task::{self, Builder, Runnable, Task, TaskId, TaskStatus};

/// What the scheduler does with a task when it dequeues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    None,
    Start,
    Resume,
}

pub(crate) struct SchedulerShared {
    config: Config,
    ready: RefCell<VecDeque<Rc<dyn Runnable>>>,
    /// Every task that has been queued and not yet settled, in spawn order.
    tasks: RefCell<IndexMap<TaskId, Rc<dyn Runnable>>>,
    event_loop: EventLoop,
    running: Cell<bool>,
    /// Set by `shutdown`; later spawns are disposed on the spot.
    disposed: Cell<bool>,
}

impl SchedulerShared {
    fn new(config: Config) -> Rc<Self> {
        log::debug!(
            "scheduler created: {} byte stacks, {} guard pages",
            config.stack_size,
            config.guard_pages
        );
        Rc::new(Self {
            config,
            ready: RefCell::new(VecDeque::new()),
            tasks: RefCell::new(IndexMap::new()),
            event_loop: EventLoop::new(),
            running: Cell::new(false),
            disposed: Cell::new(false),
        })
    }

    pub fn config(&self) -> Config {
        self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn enqueue(&self, task: Rc<dyn Runnable>, operation: Operation) {
        let header = task.header();
        if operation == Operation::Start {
            if self.disposed.get() {
                log::debug!("task {:?} spawned on a shut down scheduler", header.id);
                task.dispose();
                return;
            }
            self.tasks.borrow_mut().insert(header.id, task.clone());
        }
        log::trace!("task {:?} queued for {:?}", header.id, operation);
        header.operation.set(operation);
        self.ready.borrow_mut().push_back(task);
    }

    /// Drop a settled task from the registry.
    pub fn forget(&self, id: TaskId) {
        self.tasks.borrow_mut().swap_remove(&id);
    }

    pub fn request_stop(&self) {
        self.event_loop.request_stop();
    }

    /// Run every queued task, including ones queued along the way.
    fn dispatch(&self) {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            let Some(task) = next else {
                break;
            };
            let operation = task.header().operation.replace(Operation::None);
            match operation {
                Operation::Start => task.start(),
                Operation::Resume => {
                    if task.header().status.get() == TaskStatus::Suspended {
                        task::switch_into(&task);
                    }
                }
                Operation::None => {}
            }
        }
    }

    /// Drive the event loop until it is stopped or runs out of work.
    pub fn run_loop(&self) -> Result<()> {
        if self.running.replace(true) {
            return Err(Error::SchedulerBusy);
        }
        let _running = RunningGuard(&self.running);
        self.event_loop.run_until_stopped(&mut || self.dispatch());
        Ok(())
    }

    fn shutdown(&self) {
        self.disposed.set(true);
        let mut remaining = usize::MAX;
        loop {
            let mut live: Vec<Rc<dyn Runnable>> = self.tasks.borrow().values().cloned().collect();
            if live.is_empty() {
                break;
            }
            if live.len() >= remaining {
                log::warn!("{} tasks did not settle when disposed", live.len());
                break;
            }
            remaining = live.len();
            // Ids grow monotonically; dispose in spawn order.
            live.sort_by_key(|task| task.header().id);
            log::debug!("disposing {remaining} live tasks");
            for task in live {
                task.dispose();
            }
        }
        self.ready.borrow_mut().clear();
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

thread_local! {
    static DEFAULT: Rc<SchedulerShared> = SchedulerShared::new(Config::from_env());
}

/// The running task's scheduler, or else this thread's default one.
pub(crate) fn current_shared() -> Rc<SchedulerShared> {
    task::current_scheduler().unwrap_or_else(|| DEFAULT.with(Rc::clone))
}

/// Handle to a scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Rc<SchedulerShared>,
}

impl Scheduler {
    /// Scheduler configured from the environment.
    pub fn new() -> Self {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            shared: SchedulerShared::new(config),
        }
    }

    /// The scheduler of the running task, or else this thread's default
    /// scheduler.
    pub fn current() -> Self {
        Self {
            shared: current_shared(),
        }
    }

    pub fn config(&self) -> Config {
        self.shared.config
    }

    pub fn spawn<T, F>(&self, f: F) -> Task<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        Builder::new().spawn_on(self, f)
    }

    pub fn spawn_with_context<T, F>(&self, context: Context, f: F) -> Task<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        Builder::new().context(context).spawn_on(self, f)
    }

    /// Run until no task is ready and no completion is outstanding.
    ///
    /// Fails with [`Error::SchedulerBusy`] when called from code the
    /// scheduler is already running.
    pub fn run(&self) -> Result<()> {
        let shared = self.shared.clone();
        shared.run_loop()
    }

    /// Dispose every live task. Tasks spawned afterwards are disposed
    /// immediately.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Number of tasks queued or suspended but not yet settled.
    pub fn pending(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    /// A deferred owned by this scheduler. A top-level wait on its
    /// awaitable drives this scheduler's loop.
    pub fn deferred<T>(&self) -> Deferred<T> {
        Deferred::on(&self.shared)
    }

    /// An awaitable settled from another thread.
    ///
    /// The [`Completer`] can be sent anywhere; its result is delivered
    /// on the thread running this scheduler. While it is outstanding, the
    /// scheduler loop blocks waiting for it instead of returning.
    pub fn completion<T>(&self) -> (DeferredAwaitable<T>, Completer<T>)
    where
        T: Send + 'static,
    {
        let deferred = Deferred::on(&self.shared);
        let awaitable = deferred.awaitable();
        let completer = self.shared.event_loop.completion(move |outcome| {
            if let Err(e) = deferred.settle(outcome) {
                log::warn!("completion could not settle its deferred: {e}");
            }
        });
        (awaitable, completer)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if Rc::strong_count(&self.shared) == 1 {
            self.shared.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.shared.config)
            .field("ready", &self.shared.ready.borrow().len())
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("running", &self.shared.running.get())
            .field("event_loop", &self.shared.event_loop)
            .finish()
    }
}
