// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Host event loop driving a scheduler.
//!
//! The loop knows two things: the dispatch callback that drains the ready
//! queue, and completions posted from other threads. It runs until asked
//! to stop, or until there is neither ready work nor an outstanding
//! [`Completer`] that could produce more.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{fatal, Error, Result};

/// Type-erased outcome sent across threads. `None` means the completer
/// was dropped without completing.
type Payload = Option<Box<dyn Any + Send>>;

type Handler = Box<dyn FnOnce(Payload)>;

/// Queue shared with completers on other threads.
struct RemoteQueue {
    posted: Mutex<VecDeque<(u64, Payload)>>,
    /// Signalled on every post.
    available: Condvar,
}

impl RemoteQueue {
    fn post(&self, id: u64, payload: Payload) {
        let mut posted = self.posted.lock().unwrap_or_else(PoisonError::into_inner);
        posted.push_back((id, payload));
        self.available.notify_one();
    }
}

pub(crate) struct EventLoop {
    stop: Cell<bool>,
    next_id: Cell<u64>,
    /// Loop-thread side of every outstanding completer.
    handlers: RefCell<HashMap<u64, Handler>>,
    remote: Arc<RemoteQueue>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            stop: Cell::new(false),
            next_id: Cell::new(1),
            handlers: RefCell::new(HashMap::new()),
            remote: Arc::new(RemoteQueue {
                posted: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
        }
    }

    /// Call `dispatch` until stopped or out of work.
    pub fn run_until_stopped(&self, dispatch: &mut dyn FnMut()) {
        self.stop.set(false);
        loop {
            dispatch();
            if self.stop.get() {
                break;
            }
            if self.deliver() > 0 {
                continue;
            }
            if self.handlers.borrow().is_empty() {
                break;
            }
            log::trace!("event loop idle; waiting for {} completions", self.handlers.borrow().len());
            self.wait_for_post();
        }
        self.stop.set(false);
    }

    pub fn request_stop(&self) {
        self.stop.set(true);
    }

    /// Outstanding completers.
    pub fn pending(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Register the loop-side half of a completion.
    pub fn completion<T, F>(&self, on_complete: F) -> Completer<T>
    where
        T: Send + 'static,
        F: FnOnce(Result<T>) + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let handler: Handler = Box::new(move |payload: Payload| {
            let outcome = match payload {
                Some(boxed) => match boxed.downcast::<Result<T>>() {
                    Ok(outcome) => *outcome,
                    Err(_) => fatal("completion posted a value of the wrong type"),
                },
                None => Err(Error::Disposed),
            };
            on_complete(outcome);
        });
        self.handlers.borrow_mut().insert(id, handler);
        Completer {
            id,
            remote: self.remote.clone(),
            done: false,
            _marker: PhantomData,
        }
    }

    /// Run handlers for everything posted so far. Returns how many ran.
    fn deliver(&self) -> usize {
        let posted = {
            let mut queue = self.remote.posted.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queue)
        };
        let count = posted.len();
        for (id, payload) in posted {
            let handler = self.handlers.borrow_mut().remove(&id);
            match handler {
                Some(handler) => handler(payload),
                None => log::warn!("completion {id} posted twice or after shutdown"),
            }
        }
        count
    }

    fn wait_for_post(&self) {
        let queue = self.remote.posted.lock().unwrap_or_else(PoisonError::into_inner);
        let _queue = self
            .remote
            .available
            .wait_while(queue, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("stop", &self.stop.get())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Thread-safe half of a completion created by
/// [`Scheduler::completion`](crate::Scheduler::completion).
///
/// Send it to another thread and call [`complete`](Completer::complete)
/// exactly once. Dropping it uncompleted fails the awaitable with
/// [`Error::Disposed`](crate::Error::Disposed).
pub struct Completer<T: Send + 'static> {
    id: u64,
    remote: Arc<RemoteQueue>,
    done: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Completer<T> {
    pub fn complete(mut self, outcome: Result<T>) {
        self.done = true;
        self.remote.post(self.id, Some(Box::new(outcome)));
    }

    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }
}

impl<T: Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.done {
            self.remote.post(self.id, None);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("id", &self.id).finish()
    }
}
