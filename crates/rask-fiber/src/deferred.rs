// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deferred values: awaitables settled by hand.
//!
//! A [`Deferred`] is the producer side and settles exactly once, through
//! `resolve` or `fail`. Consumers hold a [`DeferredAwaitable`] and `wait`
//! on it. Dropping an unsettled `Deferred` fails it with
//! [`Error::Disposed`] so nobody waits forever.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::awaitable::{self, Continuations, Registration, Source};
use crate::error::{Error, Result};
use crate::scheduler::{self, SchedulerShared};
use crate::task;

pub(crate) struct DeferredState<T> {
    outcome: RefCell<Option<Result<T>>>,
    continuation: Continuations<T>,
    /// Loop a top-level wait drives until this settles.
    pub scheduler: Weak<SchedulerShared>,
}

impl<T> DeferredState<T> {
    fn settle(&self, outcome: Result<T>) -> Result<()> {
        if self.is_settled() {
            return Err(Error::AlreadyResolved);
        }
        *self.outcome.borrow_mut() = Some(outcome);
        let stored = self.outcome.borrow();
        if let Some(outcome) = stored.as_ref() {
            self.continuation.trigger(outcome.as_ref());
        }
        Ok(())
    }
}

impl<T> Source<T> for DeferredState<T> {
    fn with_settled(&self, f: &mut dyn FnMut(Result<&T, &Error>)) -> bool {
        match self.outcome.borrow().as_ref() {
            Some(outcome) => {
                f(outcome.as_ref());
                true
            }
            None => false,
        }
    }

    fn continuations(&self) -> &Continuations<T> {
        &self.continuation
    }
}

/// Producer handle. Not clonable: there is one owner who settles.
pub struct Deferred<T> {
    state: Rc<DeferredState<T>>,
}

impl<T> Deferred<T> {
    /// Deferred owned by the current scheduler: the running task's, or
    /// else this thread's default one.
    pub fn new() -> Self {
        Self::on(&scheduler::current_shared())
    }

    pub(crate) fn on(scheduler: &Rc<SchedulerShared>) -> Self {
        Self {
            state: Rc::new(DeferredState {
                outcome: RefCell::new(None),
                continuation: Continuations::new(),
                scheduler: Rc::downgrade(scheduler),
            }),
        }
    }

    /// Consumer handle for this deferred.
    pub fn awaitable(&self) -> DeferredAwaitable<T> {
        DeferredAwaitable {
            state: self.state.clone(),
        }
    }

    pub fn resolve(&self, value: T) -> Result<()> {
        self.state.settle(Ok(value))
    }

    pub fn fail(&self, error: Error) -> Result<()> {
        self.state.settle(Err(error))
    }

    /// Settle with a ready-made outcome.
    pub fn settle(&self, outcome: Result<T>) -> Result<()> {
        self.state.settle(outcome)
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        if !self.state.is_settled() {
            log::debug!("deferred dropped before it was settled");
            let _ = self.state.settle(Err(Error::Disposed));
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Consumer handle of a [`Deferred`].
pub struct DeferredAwaitable<T> {
    pub(crate) state: Rc<DeferredState<T>>,
}

impl<T> Clone for DeferredAwaitable<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> DeferredAwaitable<T> {
    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    pub fn outcome(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.state.outcome()
    }

    /// Suspend until settled. See [`task::wait`].
    pub fn wait(&self) -> Result<T>
    where
        T: Clone,
    {
        task::wait(self)
    }

    /// Run `callback` once the deferred settles, or right away if it
    /// already has.
    pub fn on_settled<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(Result<&T, &Error>) + 'static,
    {
        awaitable::on_settled(&*self.state, callback)
    }
}

impl<T> fmt::Debug for DeferredAwaitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredAwaitable")
            .field("settled", &self.state.is_settled())
            .finish()
    }
}
