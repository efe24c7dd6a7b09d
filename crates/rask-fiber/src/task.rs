// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks: fibers that run one closure to a single result.
//!
//! ```text
//! Init --start--> Running --wait on unsettled--> Suspended
//!                    ^                               |
//!                    +-------- resume <-- continuation fires
//! Running --returns Ok--> Finished
//! Running --returns Err / panics--> Failed
//! ```
//!
//! A task gets its fiber lazily, on first start. Awaiting a task that has
//! not started yet, and whose stack fits inside the awaiter's, runs it
//! inline on the awaiter's stack and never allocates.
//!
//! Disposal is cooperative: a suspended task is resumed once with its
//! fiber marked disposed, so the pending `wait` fails with
//! [`Error::Disposed`] and the closure unwinds on its own.

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::awaitable::{self, Awaited, Continuation, Continuations, Registration, Source};
use crate::context::{self, Context};
use crate::error::{fatal, panic_message, Error, Result};
use crate::fiber::{self, Fiber, FiberStatus};
use crate::scheduler::{Operation, Scheduler, SchedulerShared};
use crate::stack::Stack;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Created and queued, not started.
    Init,
    Running,
    /// Parked in `wait` or `yield_now`.
    Suspended,
    /// Returned a value.
    Finished,
    /// Returned an error, panicked or was disposed.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Init => "init",
            TaskStatus::Running => "running",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Untyped task state shared between the scheduler and continuations.
pub(crate) struct TaskHeader {
    pub id: TaskId,
    pub status: Cell<TaskStatus>,
    /// What the scheduler does when it dequeues the task.
    pub operation: Cell<Operation>,
    pub stack_size: usize,
    pub guard_pages: usize,
    pub fiber: OnceCell<Fiber>,
    pub context: Context,
    pub scheduler: Weak<SchedulerShared>,
    /// Failure delivered by a continuation, raised by the pending `wait`.
    pub error: RefCell<Option<Error>>,
    /// Registration of the pending `wait`. Set only while suspended there.
    pub suspended: RefCell<Option<Registration>>,
}

impl TaskHeader {
    pub fn is_disposed(&self) -> bool {
        self.fiber.get().map_or(false, Fiber::is_disposed)
    }
}

/// Type-erased task as seen by the scheduler.
pub(crate) trait Runnable {
    fn header(&self) -> &TaskHeader;
    /// First switch-in. No-op unless the task is still `Init`.
    fn start(self: Rc<Self>);
    fn dispose(self: Rc<Self>);
}

type TaskFn<T> = Box<dyn FnOnce() -> Result<T>>;

pub(crate) struct RawTask<T> {
    pub header: TaskHeader,
    func: Cell<Option<TaskFn<T>>>,
    result: RefCell<Option<Result<T>>>,
    continuation: Continuations<T>,
}

impl<T: 'static> RawTask<T> {
    /// Run the closure on whatever stack we are on and publish the result.
    fn run_body(&self) {
        let Some(func) = self.func.take() else {
            return;
        };
        let result = match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(result) => result,
            Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
        };
        self.complete(result);
    }

    fn run_inline(&self) {
        log::trace!("task {:?} inlined", self.header.id);
        self.header.operation.set(Operation::None);
        self.header.status.set(TaskStatus::Running);
        self.header.context.run(|| self.run_body());
    }

    fn complete(&self, result: Result<T>) {
        let id = self.header.id;
        match &result {
            Ok(_) => {
                log::trace!("task {id:?} finished");
                self.header.status.set(TaskStatus::Finished);
            }
            Err(e) => {
                log::debug!("task {id:?} failed: {e}");
                self.header.status.set(TaskStatus::Failed);
            }
        }
        *self.result.borrow_mut() = Some(result);
        if let Some(result) = self.result.borrow().as_ref() {
            self.continuation.trigger(result.as_ref());
        }
        if let Some(scheduler) = self.header.scheduler.upgrade() {
            scheduler.forget(id);
        }
    }
}

impl<T: 'static> Runnable for RawTask<T> {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn start(self: Rc<Self>) {
        if self.header.status.get() != TaskStatus::Init {
            return;
        }
        if self.header.fiber.get().is_none() {
            let stack = match Stack::allocate(self.header.stack_size, self.header.guard_pages) {
                Ok(stack) => stack,
                Err(e) => fatal(&format!("cannot start task {:?}: {e}", self.header.id)),
            };
            let task = self.clone();
            let fiber = Fiber::with_stack(stack, move || task.run_body());
            let _ = self.header.fiber.set(fiber);
        }
        log::trace!("task {:?} started", self.header.id);
        let task: Rc<dyn Runnable> = self;
        switch_into(&task);
    }

    fn dispose(self: Rc<Self>) {
        let header = &self.header;
        match header.status.get() {
            TaskStatus::Init => {
                log::debug!("task {:?} disposed before it started", header.id);
                header.operation.set(Operation::None);
                drop(self.func.take());
                self.complete(Err(Error::Disposed));
            }
            TaskStatus::Suspended => {
                log::debug!("task {:?} disposed while suspended", header.id);
                header.operation.set(Operation::None);
                if let Some(registration) = header.suspended.borrow_mut().take() {
                    registration.dispose();
                }
                match header.fiber.get() {
                    Some(fiber) => fiber.mark_disposed(),
                    None => fatal("suspended task has no fiber"),
                }
                let task: Rc<dyn Runnable> = self;
                switch_into(&task);
            }
            TaskStatus::Running => {
                // Cannot be interrupted; its next wait fails instead.
                if let Some(fiber) = header.fiber.get() {
                    fiber.mark_disposed();
                }
            }
            TaskStatus::Finished | TaskStatus::Failed => {}
        }
    }
}

impl<T> Source<T> for RawTask<T> {
    fn with_settled(&self, f: &mut dyn FnMut(Result<&T, &Error>)) -> bool {
        match self.result.borrow().as_ref() {
            Some(result) => {
                f(result.as_ref());
                true
            }
            None => false,
        }
    }

    fn continuations(&self) -> &Continuations<T> {
        &self.continuation
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Rc<dyn Runnable>>> = const { RefCell::new(None) };
}

struct CurrentTaskScope {
    prev: Option<Rc<dyn Runnable>>,
}

impl CurrentTaskScope {
    fn enter(task: Rc<dyn Runnable>) -> Self {
        let prev = CURRENT_TASK.with(|c| c.replace(Some(task)));
        CurrentTaskScope { prev }
    }
}

impl Drop for CurrentTaskScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CURRENT_TASK.try_with(|c| c.replace(prev));
    }
}

fn current_task() -> Option<Rc<dyn Runnable>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Scheduler of the task running on this thread, if any.
pub(crate) fn current_scheduler() -> Option<Rc<SchedulerShared>> {
    current_task().and_then(|task| task.header().scheduler.upgrade())
}

/// Switch into a started task until it suspends or terminates.
pub(crate) fn switch_into(task: &Rc<dyn Runnable>) {
    let header = task.header();
    let Some(fiber) = header.fiber.get() else {
        fatal("task switched in without a fiber");
    };
    header.operation.set(Operation::None);
    header.status.set(TaskStatus::Running);

    let resumed = {
        let _task = CurrentTaskScope::enter(task.clone());
        let _context = header.context.enter();
        fiber.resume()
    };

    match resumed {
        Ok(FiberStatus::Suspended) if header.status.get() == TaskStatus::Running => {
            // Plain yield: go to the back of the queue.
            header.status.set(TaskStatus::Suspended);
            match header.scheduler.upgrade() {
                Some(scheduler) => scheduler.enqueue(task.clone(), Operation::Resume),
                None => log::debug!("task {:?} yielded after its scheduler was dropped", header.id),
            }
        }
        Ok(_) => {}
        Err(e) => fatal(&format!("cannot switch into task {:?}: {e}", header.id)),
    }
}

/// Handle to a task producing a `T`.
pub struct Task<T> {
    pub(crate) raw: Rc<RawTask<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
        }
    }
}

impl<T> Task<T> {
    pub fn id(&self) -> TaskId {
        self.raw.header.id
    }

    pub fn status(&self) -> TaskStatus {
        self.raw.header.status.get()
    }

    pub fn is_settled(&self) -> bool {
        self.raw.is_settled()
    }

    /// Context the task runs under.
    pub fn context(&self) -> Context {
        self.raw.header.context.clone()
    }

    /// Requested stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.raw.header.stack_size
    }
}

impl<T: 'static> Task<T> {
    /// Queue `f` on the current scheduler under the current context.
    pub fn start<F>(f: F) -> Task<T>
    where
        F: FnOnce() -> Result<T> + 'static,
    {
        Builder::new().spawn(f)
    }

    pub fn start_with_context<F>(context: Context, f: F) -> Task<T>
    where
        F: FnOnce() -> Result<T> + 'static,
    {
        Builder::new().context(context).spawn(f)
    }

    pub fn outcome(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.raw.outcome()
    }

    /// Suspend until the task settles. See [`wait`].
    pub fn wait(&self) -> Result<T>
    where
        T: Clone,
    {
        wait(self)
    }

    /// Cancel cooperatively.
    ///
    /// A task that has not started fails with [`Error::Disposed`] right
    /// away. A suspended task is resumed once so its pending `wait` fails.
    /// A running task keeps running but cannot wait again.
    pub fn dispose(&self) {
        self.raw.clone().dispose();
    }

    pub fn on_settled<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(Result<&T, &Error>) + 'static,
    {
        awaitable::on_settled(&*self.raw, callback)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.raw.header.id)
            .field("status", &self.raw.header.status.get())
            .field("stack_size", &self.raw.header.stack_size)
            .field("waiters", &self.raw.continuation.len())
            .finish()
    }
}

/// Task factory for non-default settings.
#[derive(Debug, Default, Clone)]
pub struct Builder {
    stack_size: Option<usize>,
    context: Option<Context>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size in bytes. Defaults to the scheduler's configuration.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Context to run under. Defaults to the current context.
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Spawn `f` on the current scheduler.
    ///
    /// The result is never flattened: a body returning a [`Task`] or a
    /// [`DeferredAwaitable`](crate::DeferredAwaitable) settles with the
    /// handle itself, and the caller waits on it separately.
    pub fn spawn<T, F>(self, f: F) -> Task<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        self.spawn_on(&Scheduler::current(), f)
    }

    pub fn spawn_on<T, F>(self, scheduler: &Scheduler, f: F) -> Task<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        let shared = &scheduler.shared;
        let config = shared.config();
        let raw = Rc::new(RawTask {
            header: TaskHeader {
                id: TaskId::next(),
                status: Cell::new(TaskStatus::Init),
                operation: Cell::new(Operation::None),
                stack_size: self.stack_size.unwrap_or(config.stack_size),
                guard_pages: config.guard_pages,
                fiber: OnceCell::new(),
                context: self.context.unwrap_or_else(Context::current),
                scheduler: Rc::downgrade(shared),
                error: RefCell::new(None),
                suspended: RefCell::new(None),
            },
            func: Cell::new(Some(Box::new(f))),
            result: RefCell::new(None),
            continuation: Continuations::new(),
        });
        log::trace!("task {:?} created", raw.header.id);
        shared.enqueue(raw.clone(), Operation::Start);
        Task { raw }
    }
}

/// Wait for `awaited` and return its value or raise its error.
///
/// Inside a task this suspends the task until the awaitable settles.
/// Outside of any task it drives the scheduler loop until the awaitable
/// settles, failing with [`Error::Unresolved`] if the loop runs out of
/// work first. Plain values are returned unchanged.
pub fn wait<T, A>(awaited: A) -> Result<T>
where
    T: Clone + 'static,
    A: Into<Awaited<T>>,
{
    let awaited = awaited.into();
    match current_task() {
        Some(current) => wait_in_task(&current, awaited),
        None => match awaited {
            Awaited::Ready(value) => Ok(value),
            Awaited::Task(task) => {
                let scheduler = task.raw.header.scheduler.upgrade();
                wait_top_level(&*task.raw, scheduler)
            }
            Awaited::Deferred(deferred) => {
                let scheduler = deferred.state.scheduler.upgrade();
                wait_top_level(&*deferred.state, scheduler)
            }
        },
    }
}

fn wait_top_level<T, S>(source: &S, scheduler: Option<Rc<SchedulerShared>>) -> Result<T>
where
    T: Clone + 'static,
    S: Source<T> + ?Sized,
{
    if let Some(outcome) = source.outcome() {
        return outcome;
    }
    let Some(scheduler) = scheduler else {
        return Err(Error::Unresolved);
    };
    if scheduler.is_running() {
        return Err(Error::SchedulerBusy);
    }
    let registration = source
        .continuations()
        .register(Continuation::StopLoop(Rc::downgrade(&scheduler)));
    let ran = scheduler.run_loop();
    registration.dispose();
    ran?;
    source.outcome().unwrap_or(Err(Error::Unresolved))
}

fn wait_in_task<T>(current: &Rc<dyn Runnable>, awaited: Awaited<T>) -> Result<T>
where
    T: Clone + 'static,
{
    let header = current.header();
    if header.status.get() != TaskStatus::Running {
        return Err(Error::TaskNotRunning);
    }
    if header.is_disposed() {
        return Err(Error::Disposed);
    }
    match awaited {
        Awaited::Ready(value) => Ok(value),
        Awaited::Task(inner) => {
            let inner_header = &inner.raw.header;
            if !Weak::ptr_eq(&inner_header.scheduler, &header.scheduler) {
                return Err(Error::CrossScheduler);
            }
            if inner_header.status.get() == TaskStatus::Init
                && inner_header.stack_size <= header.stack_size
            {
                inner.raw.run_inline();
            }
            suspend_on(current, &*inner.raw)
        }
        Awaited::Deferred(deferred) => suspend_on(current, &*deferred.state),
    }
}

fn suspend_on<T, S>(current: &Rc<dyn Runnable>, source: &S) -> Result<T>
where
    T: Clone + 'static,
    S: Source<T> + ?Sized,
{
    if let Some(outcome) = source.outcome() {
        return outcome;
    }
    let header = current.header();
    let slot = Rc::new(RefCell::new(None));
    let registration = source.continuations().register(Continuation::Resume {
        task: current.clone(),
        slot: slot.clone(),
        copy: T::clone,
    });
    *header.suspended.borrow_mut() = Some(registration);
    header.status.set(TaskStatus::Suspended);
    log::trace!("task {:?} suspended", header.id);

    let ambient = context::snapshot();
    let yielded = fiber::yield_now();
    context::restore(ambient);
    header.status.set(TaskStatus::Running);

    // Resumed for some other reason than the continuation.
    if let Some(registration) = header.suspended.borrow_mut().take() {
        registration.dispose();
    }
    if let Some(error) = header.error.borrow_mut().take() {
        return Err(error);
    }
    yielded?;
    if header.is_disposed() {
        return Err(Error::Disposed);
    }
    let value = slot.borrow_mut().take();
    value.ok_or(Error::Unresolved)
}

/// True while code runs inside a task.
pub fn is_running() -> bool {
    CURRENT_TASK.with(|c| c.borrow().is_some())
}

/// Let the other ready tasks run, then continue. Does nothing outside a
/// task.
pub fn yield_now() -> Result<()> {
    if current_task().is_none() {
        return Ok(());
    }
    let ambient = context::snapshot();
    let yielded = fiber::yield_now();
    context::restore(ambient);
    yielded
}
