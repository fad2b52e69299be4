// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use ahash::AHashMap;
use log::debug;
use scoped_tls::scoped_thread_local;
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    fmt,
    mem,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

type Continuation = Box<dyn FnOnce()>;

scoped_thread_local!(static LOCAL_EX: LocalExecutor);

static EXECUTOR_ID: AtomicUsize = AtomicUsize::new(0);

/// Schedules `action` to run after the current stack unwinds.
///
/// This is the only concurrency primitive in the crate: every callback the
/// channel library and the task runtime invoke goes through it unless
/// explicitly documented as synchronous. Continuations scheduled from the
/// same tick run in FIFO order.
///
/// # Panics
///
/// Panics if called outside of [`LocalExecutor::run`] — scheduling work
/// with no loop to run it is a programming error.
///
/// # Examples
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use weft::{later, LocalExecutor};
///
/// let order = Rc::new(RefCell::new(Vec::new()));
/// let seen = order.clone();
/// let ex = LocalExecutor::make_default();
/// ex.run(|| {
///     let a = order.clone();
///     let b = order.clone();
///     later(move || a.borrow_mut().push(1));
///     later(move || b.borrow_mut().push(2));
///     order.borrow_mut().push(0);
/// });
/// assert_eq!(*seen.borrow(), vec![0, 1, 2]);
/// ```
pub fn later(action: impl FnOnce() + 'static) {
    LOCAL_EX.with(|ex| ex.defer(Box::new(action)))
}

/// Schedules `action` to run once `delay` has elapsed. Returns the timer id
/// for [`cancel_timer`]. Re-registering the same id replaces its deadline.
pub(crate) fn after(delay: Duration, action: impl FnOnce() + 'static) -> u64 {
    LOCAL_EX.with(|ex| {
        let mut timers = ex.timers.borrow_mut();
        let id = timers.new_id();
        timers.insert(id, Instant::now() + delay, Box::new(action));
        id
    })
}

/// Deregisters a pending timer. Canceling a timer that already fired is a
/// no-op.
pub(crate) fn cancel_timer(id: u64) {
    LOCAL_EX.with(|ex| {
        ex.timers.borrow_mut().remove(id);
    })
}

struct Timers {
    timer_id: u64,
    timers_by_id: AHashMap<u64, Instant>,

    /// An ordered map of registered timers.
    ///
    /// Timers are in the order in which they fire. The `u64` in this type
    /// is a timer id used to distinguish timers that fire at the same time.
    timers: BTreeMap<(Instant, u64), Continuation>,
}

impl Timers {
    fn new() -> Timers {
        Timers {
            timer_id: 0,
            timers_by_id: AHashMap::new(),
            timers: BTreeMap::new(),
        }
    }

    fn new_id(&mut self) -> u64 {
        self.timer_id += 1;
        self.timer_id
    }

    fn remove(&mut self, id: u64) -> Option<Continuation> {
        if let Some(when) = self.timers_by_id.remove(&id) {
            return self.timers.remove(&(when, id));
        }
        None
    }

    fn insert(&mut self, id: u64, when: Instant, action: Continuation) {
        if let Some(when) = self.timers_by_id.get(&id) {
            self.timers.remove(&(*when, id));
        }
        self.timers_by_id.insert(id, when);
        self.timers.insert((when, id), action);
    }

    /// Splits off the timers that are due and returns them together with
    /// the duration until the next deadline, if any.
    fn process(&mut self) -> (Vec<Continuation>, Option<Duration>) {
        let now = Instant::now();

        let pending = self.timers.split_off(&(now, 0));
        let ready = mem::replace(&mut self.timers, pending);
        let mut fired = Vec::with_capacity(ready.len());
        for ((_, id), action) in ready {
            self.timers_by_id.remove(&id);
            fired.push(action);
        }

        let next = self
            .timers
            .keys()
            .next()
            .map(|(when, _)| when.saturating_duration_since(now));
        (fired, next)
    }
}

/// Single-threaded execution loop for deferred continuations and timers.
///
/// The executor owns a FIFO microtask queue and an ordered timer table.
/// [`run`] executes the entry closure, then keeps draining microtasks and
/// firing due timers until both are empty. Within a single tick, ready
/// continuations run in FIFO order with no interleaving — this is what
/// gives channels and task machines their ordering guarantees.
///
/// # Examples
///
/// ```
/// use weft::{Channel, LocalExecutor};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let got = Rc::new(Cell::new(0));
/// let seen = got.clone();
/// let ex = LocalExecutor::make_default();
/// ex.run(|| {
///     let ch = Channel::new();
///     ch.take(move |item| got.set(item.unwrap().unwrap()));
///     ch.put(7);
/// });
/// assert_eq!(seen.get(), 7);
/// ```
///
/// [`run`]: LocalExecutor::run
pub struct LocalExecutor {
    id: usize,
    name: String,
    queue: RefCell<VecDeque<Continuation>>,
    timers: RefCell<Timers>,
}

impl fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queued", &self.queue.borrow().len())
            .finish()
    }
}

impl LocalExecutor {
    /// Creates an executor with default settings.
    pub fn make_default() -> LocalExecutor {
        LocalExecutorBuilder::new().make()
    }

    /// The unique id of this executor.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs `entry`, then drives the loop until no continuation is queued
    /// and no timer is pending. Returns whatever `entry` returned.
    ///
    /// # Panics
    ///
    /// Panics if called from within another executor's `run`.
    pub fn run<R>(&self, entry: impl FnOnce() -> R) -> R {
        assert!(
            !LOCAL_EX.is_set(),
            "cannot run an executor from within another executor"
        );

        LOCAL_EX.set(self, || {
            let result = entry();
            loop {
                loop {
                    let next = self.queue.borrow_mut().pop_front();
                    match next {
                        Some(action) => action(),
                        None => break,
                    }
                }

                let (fired, next) = self.timers.borrow_mut().process();
                if !fired.is_empty() {
                    for action in fired {
                        action();
                    }
                    continue;
                }

                match next {
                    Some(dur) => thread::sleep(dur),
                    None => break,
                }
            }
            result
        })
    }

    fn defer(&self, action: Continuation) {
        self.queue.borrow_mut().push_back(action);
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        LocalExecutor::make_default()
    }
}

/// Builder for a [`LocalExecutor`].
///
/// # Examples
///
/// ```
/// use weft::LocalExecutorBuilder;
///
/// let ex = LocalExecutorBuilder::new().name("pipeline").make();
/// ex.run(|| {});
/// ```
#[derive(Debug)]
pub struct LocalExecutorBuilder {
    name: String,
}

impl LocalExecutorBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> LocalExecutorBuilder {
        LocalExecutorBuilder {
            name: String::from("unnamed"),
        }
    }

    /// Names the executor. Shows up in diagnostics only.
    pub fn name(mut self, name: &str) -> LocalExecutorBuilder {
        self.name = String::from(name);
        self
    }

    /// Builds the executor.
    pub fn make(self) -> LocalExecutor {
        let id = EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        debug!("creating executor {} ({})", id, self.name);
        LocalExecutor {
            id,
            name: self.name,
            queue: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Timers::new()),
        }
    }
}

impl Default for LocalExecutorBuilder {
    fn default() -> Self {
        LocalExecutorBuilder::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn deferred_continuations_run_fifo() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let seen = order.clone();

        let ex = LocalExecutor::make_default();
        ex.run(move || {
            for i in 0..5 {
                let order = order.clone();
                later(move || order.borrow_mut().push(i));
            }
        });

        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn nested_continuations_run_after_earlier_ones() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let seen = order.clone();

        let ex = LocalExecutor::make_default();
        ex.run(move || {
            let a = order.clone();
            later(move || {
                let inner = a.clone();
                a.borrow_mut().push("first");
                later(move || inner.borrow_mut().push("nested"));
            });
            let b = order.clone();
            later(move || b.borrow_mut().push("second"));
        });

        assert_eq!(*seen.borrow(), vec!["first", "second", "nested"]);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let seen = order.clone();

        let ex = LocalExecutor::make_default();
        ex.run(move || {
            let a = order.clone();
            let b = order.clone();
            after(Duration::from_millis(20), move || a.borrow_mut().push(2));
            after(Duration::from_millis(5), move || b.borrow_mut().push(1));
        });

        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let fired = Rc::new(RefCell::new(false));
        let seen = fired.clone();

        let ex = LocalExecutor::make_default();
        ex.run(move || {
            let fired = fired.clone();
            let id = after(Duration::from_millis(5), move || *fired.borrow_mut() = true);
            cancel_timer(id);
        });

        assert!(!*seen.borrow());
    }

    #[test]
    fn run_returns_entry_result() {
        let ex = LocalExecutor::make_default();
        assert_eq!(ex.run(|| 42), 42);
    }
}
