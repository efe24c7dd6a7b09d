// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuations: callbacks fired once when an awaitable settles.
//!
//! Every producer (a [`Task`] or a [`Deferred`]) owns a
//! [`Continuations`] list. Consumers append entries; the producer calls
//! `trigger` exactly once with its outcome, which drains the list in
//! registration order and clears it. A consumer that no longer wants the
//! result disposes its [`Registration`] and the entry is skipped.
//!
//! [`Deferred`]: crate::deferred::Deferred

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::deferred::DeferredAwaitable;
use crate::error::{fatal, Error, Result};
use crate::scheduler::{Operation, SchedulerShared};
use crate::task::{Runnable, Task, TaskStatus};

/// Handle to one entry in a continuation list.
#[derive(Clone)]
pub struct Registration {
    disposed: Rc<Cell<bool>>,
}

impl Registration {
    fn new() -> Self {
        Self {
            disposed: Rc::new(Cell::new(false)),
        }
    }

    /// A registration whose callback already ran.
    pub(crate) fn spent() -> Self {
        let registration = Self::new();
        registration.dispose();
        registration
    }

    /// Suppress the callback if it has not fired yet.
    pub fn dispose(&self) {
        self.disposed.set(true);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("disposed", &self.disposed.get())
            .finish()
    }
}

/// What happens when an entry fires.
pub(crate) enum Continuation<T> {
    /// Wake a task suspended in `wait`: store the value in its output slot
    /// (or the error on the task) and enqueue it for resumption.
    Resume {
        task: Rc<dyn Runnable>,
        slot: Rc<RefCell<Option<T>>>,
        copy: fn(&T) -> T,
    },
    /// Stop the scheduler loop driven by a top-level `wait`.
    StopLoop(Weak<SchedulerShared>),
    /// User callback registered through `on_settled`.
    Callback(Box<dyn FnOnce(Result<&T, &Error>)>),
}

impl<T> Continuation<T> {
    fn fire(self, outcome: Result<&T, &Error>) {
        match self {
            Continuation::Resume { task, slot, copy } => resume_task(task, slot, copy, outcome),
            Continuation::StopLoop(scheduler) => {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.request_stop();
                }
            }
            Continuation::Callback(callback) => callback(outcome),
        }
    }
}

fn resume_task<T>(
    task: Rc<dyn Runnable>,
    slot: Rc<RefCell<Option<T>>>,
    copy: fn(&T) -> T,
    outcome: Result<&T, &Error>,
) {
    let header = task.header();
    header.suspended.borrow_mut().take();

    if header.status.get() != TaskStatus::Suspended {
        log::warn!(
            "continuation for task {:?} fired while it is {:?}; ignored",
            header.id,
            header.status.get()
        );
        return;
    }

    match outcome {
        Ok(value) => *slot.borrow_mut() = Some(copy(value)),
        Err(err) => *header.error.borrow_mut() = Some(err.clone()),
    }

    match header.scheduler.upgrade() {
        Some(scheduler) => scheduler.enqueue(task.clone(), Operation::Resume),
        None => log::debug!("task {:?} woken after its scheduler was dropped", header.id),
    }
}

/// Ordered, single-fire list of continuations owned by a producer.
pub(crate) struct Continuations<T> {
    entries: RefCell<Vec<(Registration, Continuation<T>)>>,
    triggered: Cell<bool>,
}

impl<T> Continuations<T> {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            triggered: Cell::new(false),
        }
    }

    pub fn register(&self, continuation: Continuation<T>) -> Registration {
        let registration = Registration::new();
        self.entries
            .borrow_mut()
            .push((registration.clone(), continuation));
        registration
    }

    /// Fire every live entry in FIFO order, then clear the list.
    ///
    /// Aborts if called twice: a producer settles exactly once.
    pub fn trigger(&self, outcome: Result<&T, &Error>) {
        if self.triggered.replace(true) {
            fatal("awaitable triggered twice");
        }
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        for (registration, continuation) in entries {
            if registration.is_disposed() {
                continue;
            }
            registration.dispose();
            continuation.fire(outcome);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

/// Producer side shared by tasks and deferreds.
pub(crate) trait Source<T> {
    /// Calls `f` with the outcome and returns true if settled.
    fn with_settled(&self, f: &mut dyn FnMut(Result<&T, &Error>)) -> bool;

    fn continuations(&self) -> &Continuations<T>;

    fn is_settled(&self) -> bool {
        self.with_settled(&mut |_| {})
    }

    /// The settled outcome, if any.
    fn outcome(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        let mut out = None;
        self.with_settled(&mut |outcome| out = Some(outcome.cloned().map_err(Clone::clone)));
        out
    }
}

/// Run `callback` when `source` settles, or right away if it already has.
pub(crate) fn on_settled<T, S, F>(source: &S, callback: F) -> Registration
where
    S: Source<T> + ?Sized,
    F: FnOnce(Result<&T, &Error>) + 'static,
{
    let mut pending = Some(callback);
    source.with_settled(&mut |outcome| {
        if let Some(callback) = pending.take() {
            callback(outcome);
        }
    });
    match pending {
        Some(callback) => source
            .continuations()
            .register(Continuation::Callback(Box::new(callback))),
        None => Registration::spent(),
    }
}

/// Something `wait` accepts: one of the known awaitables or a plain value.
pub enum Awaited<T> {
    /// Not awaitable; returned unchanged.
    Ready(T),
    Task(Task<T>),
    Deferred(DeferredAwaitable<T>),
}

impl<T> From<Task<T>> for Awaited<T> {
    fn from(task: Task<T>) -> Self {
        Awaited::Task(task)
    }
}

impl<T> From<&Task<T>> for Awaited<T> {
    fn from(task: &Task<T>) -> Self {
        Awaited::Task(task.clone())
    }
}

impl<T> From<DeferredAwaitable<T>> for Awaited<T> {
    fn from(awaitable: DeferredAwaitable<T>) -> Self {
        Awaited::Deferred(awaitable)
    }
}

impl<T> From<&DeferredAwaitable<T>> for Awaited<T> {
    fn from(awaitable: &DeferredAwaitable<T>) -> Self {
        Awaited::Deferred(awaitable.clone())
    }
}

impl<T> fmt::Debug for Awaited<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Awaited::Ready(_) => f.write_str("Awaited::Ready(..)"),
            Awaited::Task(t) => f.debug_tuple("Awaited::Task").field(&t.id()).finish(),
            Awaited::Deferred(_) => f.write_str("Awaited::Deferred(..)"),
        }
    }
}
