// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request-scoped values.
//!
//! A [`Context`] is an immutable node holding at most one binding and a
//! strong reference to its parent. Deriving never mutates: `with` always
//! allocates a new node. The chain ends at a per-thread root that has no
//! binding.
//!
//! The current context is dynamically scoped. [`Context::run`] installs a
//! context around a closure, and every task installs its own context while
//! it is switched in.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

/// Identity of a [`ContextVar`]. Compared by address only.
struct VarToken;

struct Binding {
    var: Rc<VarToken>,
    value: Rc<dyn Any>,
}

struct ContextNode {
    binding: Option<Binding>,
    parent: Option<Context>,
}

/// Immutable, parent-linked chain of bindings.
///
/// There is no public constructor. Contexts come from [`Context::current`],
/// [`Context::background`] and [`Context::with`].
#[derive(Clone)]
pub struct Context(Rc<ContextNode>);

thread_local! {
    static ROOT: RefCell<Option<Context>> = const { RefCell::new(None) };
    /// `None` means the root is current.
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

impl Context {
    fn node(binding: Option<Binding>, parent: Option<Context>) -> Self {
        Context(Rc::new(ContextNode { binding, parent }))
    }

    /// The per-thread root, created on first use.
    pub(crate) fn root_of_thread() -> Context {
        ROOT.with(|root| {
            root.borrow_mut()
                .get_or_insert_with(|| {
                    log::trace!("creating background context");
                    Context::node(None, None)
                })
                .clone()
        })
    }

    /// The context code is currently running under.
    pub fn current() -> Context {
        CURRENT
            .with(|c| c.borrow().clone())
            .unwrap_or_else(Context::root_of_thread)
    }

    /// A fresh, empty context parented on the outermost ancestor of the
    /// current one. Drops every binding made below the root.
    pub fn background() -> Context {
        Context::node(None, Some(Context::current().root()))
    }

    /// Derive a context binding `var` to `value`.
    ///
    /// The new node is parented on `self`'s parent, not on `self`: a
    /// binding made here replaces the one `self` holds instead of stacking
    /// on top of it.
    pub fn with<T: 'static>(&self, var: &ContextVar<T>, value: T) -> Context {
        let binding = Binding {
            var: var.token.clone(),
            value: Rc::new(value),
        };
        Context::node(Some(binding), self.0.parent.clone())
    }

    /// Run `f` with `self` installed as the current context. The previous
    /// context is restored on return and on unwind.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.enter();
        f()
    }

    pub fn parent(&self) -> Option<&Context> {
        self.0.parent.as_ref()
    }

    /// Outermost ancestor (`self` if it has no parent).
    pub fn root(&self) -> Context {
        let mut node = self;
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node.clone()
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Install `self` as current until the returned guard drops.
    pub(crate) fn enter(&self) -> ContextScope {
        ContextScope::replace(Some(self.clone()))
    }

    fn lookup(&self, var: &Rc<VarToken>) -> Option<&Rc<dyn Any>> {
        let mut node = Some(self);
        while let Some(ctx) = node {
            if let Some(binding) = &ctx.0.binding {
                if Rc::ptr_eq(&binding.var, var) {
                    return Some(&binding.value);
                }
            }
            node = ctx.parent();
        }
        None
    }

    fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.parent();
        while let Some(parent) = node {
            depth += 1;
            node = parent.parent();
        }
        depth
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("bound", &self.0.binding.is_some())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Restores the previously current context when dropped.
pub(crate) struct ContextScope {
    prev: Option<Option<Context>>,
}

impl ContextScope {
    fn replace(next: Option<Context>) -> Self {
        let prev = CURRENT.with(|c| c.replace(next));
        ContextScope { prev: Some(prev) }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            // The thread may be tearing down its locals.
            let _ = CURRENT.try_with(|c| c.replace(prev));
        }
    }
}

/// The raw current slot, carried across a fiber switch by the code that
/// suspends.
pub(crate) fn snapshot() -> Option<Context> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn restore(snapshot: Option<Context>) {
    CURRENT.with(|c| *c.borrow_mut() = snapshot);
}

/// Typed key into a [`Context`] chain. Equality is identity: two vars
/// created separately never match, even for the same `T`.
pub struct ContextVar<T> {
    token: Rc<VarToken>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> ContextVar<T> {
    pub fn new() -> Self {
        Self {
            token: Rc::new(VarToken),
            _marker: PhantomData,
        }
    }

    /// Value bound in the current context, if any.
    pub fn get(&self) -> Option<T> {
        self.get_in(&Context::current())
    }

    /// Value bound in `context` or one of its ancestors.
    pub fn get_in(&self, context: &Context) -> Option<T> {
        context
            .lookup(&self.token)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }
}

impl<T: Clone + 'static> Default for ContextVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ContextVar<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for ContextVar<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.token, &other.token)
    }
}

impl<T> Eq for ContextVar<T> {}

impl<T> fmt::Debug for ContextVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextVar({:p})", Rc::as_ptr(&self.token))
    }
}
