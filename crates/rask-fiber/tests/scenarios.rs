// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! End-to-end scenarios: tasks, waits, contexts, disposal and completions
//! driven through the public API only.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use rask_fiber::{
    wait, Awaited, Builder, Config, Context, ContextVar, Deferred, Error, Result, Scheduler, Task,
    TaskStatus,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scheduler() -> Scheduler {
    init_logging();
    Scheduler::with_config(Config::new().with_stack_size(128 * 1024))
}

#[test]
fn top_level_wait_returns_task_value() {
    init_logging();
    assert_eq!(wait(Task::start(|| Ok(21 * 2))).unwrap(), 42);
}

#[test]
fn plain_values_pass_through_wait() {
    init_logging();
    assert_eq!(wait(Awaited::Ready("as is")).unwrap(), "as is");
    let s = scheduler();
    let t = s.spawn(|| wait(Awaited::Ready(7u8)));
    assert_eq!(t.wait().unwrap(), 7);
}

#[test]
fn derived_context_is_visible_only_where_installed() {
    init_logging();
    let v = ContextVar::new();
    let a = Context::current();
    let b = a.with(&v, "x".to_string());

    assert_eq!(b.run(|| v.get()), Some("x".to_string()));
    assert_eq!(v.get_in(&a), None);
    assert_eq!(v.get(), None);

    let v2 = v.clone();
    let t = Task::start_with_context(b.clone(), move || Ok(v2.get()));
    assert_eq!(t.wait().unwrap(), Some("x".to_string()));
    assert!(t.context().ptr_eq(&b));
}

#[test]
fn failure_propagates_through_awaiting_task() {
    let s = scheduler();
    let inner: Rc<RefCell<Option<Task<u32>>>> = Rc::new(RefCell::new(None));
    let slot = inner.clone();
    let a = s.spawn(move || {
        // Bigger stack than the awaiter, so B runs on its own fiber and A
        // really suspends.
        let b = Builder::new()
            .stack_size(512 * 1024)
            .spawn(|| Err(Error::raise("boom")));
        *slot.borrow_mut() = Some(b.clone());
        let v = wait(&b)?;
        Ok(v + 1)
    });

    let err = a.wait().unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(a.status(), TaskStatus::Failed);
    let b = inner.borrow_mut().take().unwrap();
    assert_eq!(b.status(), TaskStatus::Failed);
    // Every later wait sees the same failure.
    assert_eq!(wait(&a).unwrap_err().to_string(), "boom");
    assert_eq!(b.wait().unwrap_err().to_string(), "boom");
}

#[test]
fn tasks_interleave_only_at_suspension_points() {
    let s = scheduler();
    let counter = Rc::new(Cell::new(0));
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let c = counter.clone();
        let l = log.clone();
        s.spawn(move || {
            for _ in 0..3 {
                c.set(c.get() + 1);
                l.borrow_mut().push(name);
                rask_fiber::task::yield_now()?;
                let seen = c.get();
                c.set(seen + 1);
            }
            Ok(())
        });
    }
    s.run().unwrap();

    assert_eq!(counter.get(), 12);
    assert_eq!(*log.borrow(), ["a", "b", "a", "b", "a", "b"]);
}

#[test]
fn settled_task_is_not_rerun_by_later_waits() {
    let s = scheduler();
    let runs = Rc::new(Cell::new(0));
    let r = runs.clone();
    let shared = s.spawn(move || {
        r.set(r.get() + 1);
        Ok(vec![1, 2, 3])
    });

    let waiters: Vec<Task<usize>> = (0..3)
        .map(|_| {
            let t = shared.clone();
            s.spawn(move || Ok(t.wait()?.len()))
        })
        .collect();
    for w in &waiters {
        assert_eq!(w.wait().unwrap(), 3);
    }
    assert_eq!(shared.wait().unwrap(), vec![1, 2, 3]);
    assert_eq!(runs.get(), 1);
}

#[test]
fn background_reaches_the_same_root_from_any_depth() {
    init_logging();
    let v = ContextVar::<u32>::new();
    let root = Context::current().root();

    let level1 = Context::background().with(&v, 1);
    let (bg, bound) = level1.run(|| {
        let level2 = Context::current().with(&v, 2);
        level2.run(|| {
            let bg = Context::background();
            (bg.clone(), v.get_in(&bg))
        })
    });
    assert!(bg.root().ptr_eq(&root));
    assert_eq!(bound, None);

    let v2 = v.clone();
    let t = Task::start_with_context(level1, move || {
        let bg = Context::background();
        Ok((bg.root().ptr_eq(&Context::current().root()), v2.get_in(&bg)))
    });
    assert_eq!(t.wait().unwrap(), (true, None));
}

fn inlining_trace(inner_stack: usize, fail: bool) -> (Vec<String>, String) {
    let s = scheduler();
    let log = Rc::new(RefCell::new(Vec::<String>::new()));
    let l = log.clone();
    let outer = s.spawn(move || {
        let l_inner = l.clone();
        let inner: Task<u32> = Builder::new().stack_size(inner_stack).spawn(move || {
            l_inner.borrow_mut().push("inner body".into());
            if fail {
                Err(Error::raise("inner failed"))
            } else {
                Ok(9)
            }
        });
        let l_cb = l.clone();
        inner.on_settled(move |r| l_cb.borrow_mut().push(format!("callback ok={}", r.is_ok())));
        let r = inner.wait();
        l.borrow_mut().push("outer resumed".into());
        r
    });
    let result = match outer.wait() {
        Ok(v) => format!("ok {v}"),
        Err(e) => format!("err {e}"),
    };
    let trace = log.borrow().clone();
    (trace, result)
}

#[test]
fn inlining_does_not_change_observable_behaviour() {
    for fail in [false, true] {
        let inlined = inlining_trace(32 * 1024, fail);
        let switched = inlining_trace(1024 * 1024, fail);
        assert_eq!(inlined, switched);
    }
    let (trace, result) = inlining_trace(32 * 1024, true);
    assert_eq!(trace, ["inner body", "callback ok=false", "outer resumed"]);
    assert_eq!(result, "err inner failed");
}

struct Cleanup(Rc<Cell<bool>>);

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn shutdown_disposes_suspended_task_once() {
    let s = scheduler();
    let d = Deferred::<u8>::new();
    let a = d.awaitable();
    let cleaned = Rc::new(Cell::new(false));
    let guard = Cleanup(cleaned.clone());
    let t = s.spawn(move || {
        let _guard = guard;
        a.wait()
    });
    let fired = Rc::new(RefCell::new(Vec::new()));
    let f = fired.clone();
    t.on_settled(move |r| f.borrow_mut().push(matches!(r, Err(Error::Disposed))));

    s.run().unwrap();
    assert_eq!(t.status(), TaskStatus::Suspended);
    assert_eq!(s.pending(), 1);

    s.shutdown();
    assert!(cleaned.get());
    assert_eq!(t.status(), TaskStatus::Failed);
    assert_eq!(*fired.borrow(), [true]);

    s.shutdown();
    d.resolve(1).unwrap();
    assert_eq!(*fired.borrow(), [true]);
}

#[test]
fn awaiting_a_task_of_another_scheduler_fails() {
    let s1 = scheduler();
    let s2 = scheduler();
    let foreign = s2.spawn(|| Ok(1));
    let f = foreign.clone();
    let t = s1.spawn(move || wait(&f));
    assert!(matches!(t.wait(), Err(Error::CrossScheduler)));
    assert_eq!(foreign.status(), TaskStatus::Init);
}

#[test]
fn deferred_resumes_waiting_task() {
    let s = scheduler();
    let d = Deferred::<i32>::new();
    let a = d.awaitable();
    let t = s.spawn(move || Ok(a.wait()? * 2));
    s.run().unwrap();
    assert_eq!(t.status(), TaskStatus::Suspended);

    d.resolve(21).unwrap();
    assert!(matches!(d.resolve(1), Err(Error::AlreadyResolved)));
    assert_eq!(t.wait().unwrap(), 42);
}

#[test]
fn unsettled_deferred_at_top_level_is_unresolved() {
    init_logging();
    let d = Deferred::<u8>::new();
    assert!(matches!(wait(&d.awaitable()), Err(Error::Unresolved)));
}

#[test]
fn completer_settles_from_another_thread() {
    init_logging();
    let (awaitable, completer) = Scheduler::current().completion::<u64>();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        completer.resolve(7);
    });
    assert_eq!(wait(&awaitable).unwrap(), 7);
    worker.join().unwrap();

    let (dropped, completer) = Scheduler::current().completion::<u64>();
    thread::spawn(move || drop(completer)).join().unwrap();
    assert!(matches!(wait(&dropped), Err(Error::Disposed)));
}

#[test]
fn top_level_wait_drives_the_owning_scheduler() {
    let s = scheduler();

    let (awaitable, completer) = s.completion::<u32>();
    let worker = thread::spawn(move || completer.resolve(3));
    assert_eq!(wait(&awaitable).unwrap(), 3);
    worker.join().unwrap();

    let d = s.deferred::<u32>();
    let a = d.awaitable();
    s.spawn(move || d.resolve(5));
    assert_eq!(wait(&a).unwrap(), 5);
}

#[test]
fn deferred_made_inside_a_task_belongs_to_its_scheduler() {
    let s = scheduler();
    let producer: Rc<RefCell<Option<Deferred<u32>>>> = Rc::new(RefCell::new(None));
    let slot = producer.clone();
    let t = s.spawn(move || {
        let d = Deferred::new();
        let a = d.awaitable();
        *slot.borrow_mut() = Some(d);
        Ok(a)
    });
    let a = t.wait().unwrap();

    let d = producer.borrow_mut().take().unwrap();
    s.spawn(move || d.resolve(8));
    assert_eq!(wait(&a).unwrap(), 8);
}

#[test]
fn panicking_task_fails_with_message() {
    let s = scheduler();
    let t: Task<()> = s.spawn(|| panic!("fiber went sideways"));
    match t.wait() {
        Err(Error::Panicked(msg)) => assert_eq!(msg, "fiber went sideways"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn context_survives_suspension() {
    let s = scheduler();
    let v = ContextVar::<&'static str>::new();
    let outer = Context::background().with(&v, "task");
    let d = Deferred::<()>::new();
    let a = d.awaitable();

    let v1 = v.clone();
    let t = s.spawn_with_context(outer, move || {
        let before = v1.get();
        let scoped = Context::current().with(&v1, "scoped");
        let during = scoped.run(|| -> Result<_> {
            a.wait()?;
            Ok(v1.get())
        })?;
        Ok((before, during, v1.get()))
    });

    s.run().unwrap();
    assert_eq!(v.get(), None);
    d.resolve(()).unwrap();
    assert_eq!(
        t.wait().unwrap(),
        (Some("task"), Some("scoped"), Some("task"))
    );
}
