// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful fibers.
//!
//! A fiber owns a [`Stack`] and runs one entry closure on it. `resume`
//! switches the calling thread onto the fiber until it yields or returns;
//! [`yield_now`] switches back to whoever resumed it. Fibers nest: a fiber
//! may resume another one and gets control back when that one yields.
//!
//! Status moves `Init -> Running -> (Suspended -> Running)* -> Finished|Failed`.
//! Dropping a suspended fiber disposes it: it is resumed once with its
//! `disposed` flag set, so `yield_now` reports [`Error::Disposed`] and the
//! body can unwind its own resources.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{self, StackPointer};
use crate::config::DEFAULT_GUARD_PAGES;
use crate::error::{fatal, Error, Result};
use crate::stack::Stack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    /// Created, never switched into.
    Init,
    Running,
    Suspended,
    Finished,
    /// The entry closure panicked.
    Failed,
}

impl FiberStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberStatus::Finished | FiberStatus::Failed)
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberStatus::Init => "not started",
            FiberStatus::Running => "running",
            FiberStatus::Suspended => "suspended",
            FiberStatus::Finished => "finished",
            FiberStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FiberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

type Entry = Box<dyn FnOnce()>;

/// Heap part of a fiber. Its address is handed to the trampoline, so it
/// must not move while the fiber is alive.
struct FiberInner {
    id: FiberId,
    status: Cell<FiberStatus>,
    stack: Stack,
    /// Saved stack pointer of the fiber while it is not running.
    sp: Cell<StackPointer>,
    /// Saved stack pointer of the context that resumed the fiber.
    caller_sp: Cell<StackPointer>,
    entry: Cell<Option<Entry>>,
    disposed: Cell<bool>,
    panic: Cell<Option<Box<dyn Any + Send>>>,
}

pub struct Fiber {
    inner: Box<FiberInner>,
}

thread_local! {
    static CURRENT: Cell<*const FiberInner> = const { Cell::new(ptr::null()) };
}

impl Fiber {
    /// Allocate a stack of `stack_size` bytes and prepare `entry` to run on it.
    pub fn new<F>(stack_size: usize, entry: F) -> Result<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let stack = Stack::allocate(stack_size, DEFAULT_GUARD_PAGES)?;
        Ok(Fiber::with_stack(stack, entry))
    }

    /// Run `entry` on an already allocated stack.
    pub fn with_stack<F>(stack: Stack, entry: F) -> Fiber
    where
        F: FnOnce() + 'static,
    {
        let inner = Box::new(FiberInner {
            id: FiberId::next(),
            status: Cell::new(FiberStatus::Init),
            stack,
            sp: Cell::new(ptr::null_mut()),
            caller_sp: Cell::new(ptr::null_mut()),
            entry: Cell::new(Some(Box::new(entry))),
            disposed: Cell::new(false),
            panic: Cell::new(None),
        });
        let arg = &*inner as *const FiberInner as *mut u8;
        // SAFETY: top of a freshly mapped stack; `inner` is boxed and
        // outlives every switch into the fiber.
        let sp = unsafe { arch::init_stack(inner.stack.top(), fiber_main, arg) };
        inner.sp.set(sp);
        log::trace!("fiber {:?} created with {} byte stack", inner.id, inner.stack.size());
        Fiber { inner }
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn status(&self) -> FiberStatus {
        self.inner.status.get()
    }

    pub fn stack_size(&self) -> usize {
        self.inner.stack.size()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Switch into the fiber until it yields or finishes.
    ///
    /// A panic raised by the entry closure resumes unwinding here.
    pub fn resume(&self) -> Result<FiberStatus> {
        if let Some(payload) = self.switch_in()? {
            panic::resume_unwind(payload);
        }
        Ok(self.status())
    }

    /// Mark the fiber disposed and, if it is suspended, resume it once so
    /// it can unwind. Returns the status afterwards.
    pub fn dispose(&self) -> FiberStatus {
        self.mark_disposed();
        if self.status() == FiberStatus::Suspended {
            match self.switch_in() {
                Ok(Some(payload)) => {
                    log::warn!(
                        "fiber {:?} panicked while unwinding after disposal: {}",
                        self.id(),
                        crate::error::panic_message(payload.as_ref())
                    );
                }
                Ok(None) => {}
                Err(e) => fatal(&format!("failed to switch to disposed fiber: {e}")),
            }
        }
        self.status()
    }

    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.set(true);
    }

    /// Raw switch. Returns the panic payload if the fiber failed.
    fn switch_in(&self) -> Result<Option<Box<dyn Any + Send>>> {
        let inner = &*self.inner;
        match inner.status.get() {
            FiberStatus::Init | FiberStatus::Suspended => {}
            status => return Err(Error::FiberState(status)),
        }
        inner.status.set(FiberStatus::Running);

        let prev = CURRENT.with(|c| c.replace(inner as *const FiberInner));
        // SAFETY: `sp` was produced by `init_stack` or by the fiber's own
        // last yield, and the stack is owned by `inner`.
        unsafe { arch::switch_context(inner.caller_sp.as_ptr(), inner.sp.get()) };
        CURRENT.with(|c| c.set(prev));

        Ok(inner.panic.take())
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get())
            .field("stack_size", &self.inner.stack.size())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        match self.status() {
            FiberStatus::Running => fatal("fiber destroyed while running"),
            FiberStatus::Suspended => {
                if self.dispose() == FiberStatus::Suspended {
                    log::warn!(
                        "fiber {:?} still suspended after disposal; its frames are discarded",
                        self.id()
                    );
                }
            }
            _ => {}
        }
        log::trace!("fiber {:?} destroyed", self.inner.id);
    }
}

/// Suspend the running fiber and return to whoever resumed it.
///
/// Fails with [`Error::NotInFiber`] outside a fiber, and with
/// [`Error::Disposed`] if the fiber was disposed (either before the call,
/// in which case it does not suspend, or while it was suspended).
pub fn yield_now() -> Result<()> {
    let ptr = CURRENT.with(|c| c.get());
    if ptr.is_null() {
        return Err(Error::NotInFiber);
    }
    // SAFETY: CURRENT only ever points at the inner of a fiber that is
    // being resumed further up this thread's call chain.
    let inner = unsafe { &*ptr };
    if inner.disposed.get() {
        return Err(Error::Disposed);
    }
    if inner.status.get() != FiberStatus::Running {
        fatal("yield from a fiber that is not running");
    }

    inner.status.set(FiberStatus::Suspended);
    // SAFETY: `caller_sp` was stored by the `switch_in` that resumed us.
    unsafe { arch::switch_context(inner.sp.as_ptr(), inner.caller_sp.get()) };

    if inner.disposed.get() {
        return Err(Error::Disposed);
    }
    Ok(())
}

/// Id of the fiber running on this thread, if any.
pub fn current_id() -> Option<FiberId> {
    let ptr = CURRENT.with(|c| c.get());
    // SAFETY: see `yield_now`.
    (!ptr.is_null()).then(|| unsafe { (*ptr).id })
}

extern "C" fn fiber_main(arg: *mut u8) -> ! {
    let inner = arg as *const FiberInner;
    {
        // SAFETY: `arg` is the boxed inner of the fiber being resumed; the
        // resumer keeps the fiber alive until this switch returns.
        let inner = unsafe { &*inner };
        if let Some(entry) = inner.entry.take() {
            match panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(()) => inner.status.set(FiberStatus::Finished),
                Err(payload) => {
                    inner.panic.set(Some(payload));
                    inner.status.set(FiberStatus::Failed);
                }
            }
        } else {
            inner.status.set(FiberStatus::Finished);
        }
    }
    // Nothing may live on this stack past this point: it is never resumed.
    // SAFETY: as above.
    unsafe {
        arch::switch_context((*inner).sp.as_ptr(), (*inner).caller_sp.get());
    }
    fatal("terminated fiber was resumed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const STACK: usize = 64 * 1024;

    #[test]
    fn runs_to_completion() {
        let hit = Rc::new(Cell::new(0));
        let h = hit.clone();
        let fiber = Fiber::new(STACK, move || h.set(h.get() + 1)).unwrap();
        assert_eq!(fiber.status(), FiberStatus::Init);
        assert_eq!(fiber.resume().unwrap(), FiberStatus::Finished);
        assert_eq!(hit.get(), 1);
    }

    #[test]
    fn yields_interleave_with_resumer() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(STACK, move || {
            for i in 0..3 {
                l.borrow_mut().push(format!("fiber {i}"));
                yield_now().unwrap();
            }
        })
        .unwrap();

        let mut rounds = 0;
        while fiber.resume().unwrap() == FiberStatus::Suspended {
            log.borrow_mut().push(format!("main {rounds}"));
            rounds += 1;
        }
        assert_eq!(
            *log.borrow(),
            ["fiber 0", "main 0", "fiber 1", "main 1", "fiber 2", "main 2"]
        );
        assert_eq!(fiber.status(), FiberStatus::Finished);
    }

    #[test]
    fn resume_after_finish_is_an_error() {
        let fiber = Fiber::new(STACK, || {}).unwrap();
        fiber.resume().unwrap();
        match fiber.resume() {
            Err(Error::FiberState(FiberStatus::Finished)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn yield_outside_fiber_fails() {
        assert!(matches!(yield_now(), Err(Error::NotInFiber)));
        assert_eq!(current_id(), None);
    }

    #[test]
    fn current_id_inside_fiber() {
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(STACK, move || s.set(current_id())).unwrap();
        fiber.resume().unwrap();
        assert_eq!(seen.get(), Some(fiber.id()));
        assert_eq!(current_id(), None);
    }

    #[test]
    fn nested_fibers_return_to_their_resumer() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let outer = Fiber::new(STACK, move || {
            let l2 = l.clone();
            let inner = Fiber::new(STACK, move || {
                l2.borrow_mut().push("inner a");
                yield_now().unwrap();
                l2.borrow_mut().push("inner b");
            })
            .unwrap();
            inner.resume().unwrap();
            l.borrow_mut().push("outer");
            yield_now().unwrap();
            inner.resume().unwrap();
            l.borrow_mut().push("outer done");
        })
        .unwrap();

        assert_eq!(outer.resume().unwrap(), FiberStatus::Suspended);
        assert_eq!(outer.resume().unwrap(), FiberStatus::Finished);
        assert_eq!(*log.borrow(), ["inner a", "outer", "inner b", "outer done"]);
    }

    #[test]
    fn panic_resurfaces_in_resumer() {
        let fiber = Fiber::new(STACK, || panic!("kaboom")).unwrap();
        let caught = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume()));
        let payload = caught.unwrap_err();
        assert_eq!(crate::error::panic_message(payload.as_ref()), "kaboom");
        assert_eq!(fiber.status(), FiberStatus::Failed);
    }

    struct Flag(Rc<Cell<bool>>);

    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn dropping_suspended_fiber_unwinds_it() {
        let dropped = Rc::new(Cell::new(false));
        let saw_disposed = Rc::new(Cell::new(false));
        let (d, s) = (dropped.clone(), saw_disposed.clone());
        let fiber = Fiber::new(STACK, move || {
            let _guard = Flag(d);
            loop {
                if let Err(Error::Disposed) = yield_now() {
                    s.set(true);
                    return;
                }
            }
        })
        .unwrap();
        fiber.resume().unwrap();
        assert!(!dropped.get());
        drop(fiber);
        assert!(saw_disposed.get());
        assert!(dropped.get());
    }

    #[test]
    fn disposed_fiber_cannot_suspend_again() {
        let attempts = Rc::new(Cell::new(0));
        let a = attempts.clone();
        let fiber = Fiber::new(STACK, move || {
            while yield_now().is_ok() {}
            a.set(a.get() + 1);
            // Second yield after disposal returns immediately.
            assert!(matches!(yield_now(), Err(Error::Disposed)));
            a.set(a.get() + 1);
        })
        .unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.dispose(), FiberStatus::Finished);
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn deep_recursion_fits_in_stack() {
        fn depth(n: u32) -> u32 {
            let pad = [n as u8; 64];
            if n == 0 {
                pad[0] as u32
            } else {
                depth(n - 1) + std::hint::black_box(pad)[1] as u32 / 255
            }
        }
        let out = Rc::new(Cell::new(0));
        let o = out.clone();
        let fiber = Fiber::new(256 * 1024, move || o.set(depth(500))).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.status(), FiberStatus::Finished);
    }
}
