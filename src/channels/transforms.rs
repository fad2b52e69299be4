// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::channels::channel::{Channel, Flow, TakeFn};
use crate::error::Fault;
use crate::executor::{after, cancel_timer, later};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

/// Take-side projection of a source channel through a mapping function.
/// Writes go through the retained source handle; the projection itself is
/// read-only.
struct MapFlow<T: Clone + 'static, U: Clone + 'static> {
    src: Channel<T>,
    f: Rc<dyn Fn(T) -> U>,
}

impl<T: Clone + 'static, U: Clone + 'static> Flow<U> for MapFlow<T, U> {
    fn take(&self, cb: Option<TakeFn<U>>) {
        match cb {
            None => self.src.take_raw(None),
            Some(cb) => {
                let f = self.f.clone();
                self.src.take_raw(Some(Box::new(move |item| {
                    cb(item.map(|opt| opt.map(|v| f(v))))
                })));
            }
        }
    }

    fn end(&self) {
        self.src.end();
    }

    fn backlog(&self) -> isize {
        self.src.backlog()
    }
}

struct FilterFlow<T: Clone + 'static> {
    src: Channel<T>,
    pred: Rc<dyn Fn(&T) -> bool>,
}

fn filter_take<T: Clone + 'static>(
    src: Channel<T>,
    pred: Rc<dyn Fn(&T) -> bool>,
    cb: TakeFn<T>,
) {
    let next_src = src.clone();
    let next_pred = pred.clone();
    src.take_raw(Some(Box::new(move |item| match item {
        Ok(Some(v)) => {
            if next_pred(&v) {
                cb(Ok(Some(v)))
            } else {
                filter_take(next_src, next_pred, cb)
            }
        }
        // End and faults are forwarded without re-entering.
        other => cb(other),
    })));
}

impl<T: Clone + 'static> Flow<T> for FilterFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn take(&self, cb: Option<TakeFn<T>>) {
        match cb {
            None => self.src.take_raw(None),
            Some(cb) => filter_take(self.src.clone(), self.pred.clone(), cb),
        }
    }
}

/// Running fold over a source channel. Each take yields the new
/// accumulator.
struct ReduceFlow<T: Clone + 'static, A: Clone + 'static> {
    src: Channel<T>,
    acc: Rc<RefCell<A>>,
    f: Rc<dyn Fn(A, T) -> A>,
}

impl<T: Clone + 'static, A: Clone + 'static> Flow<A> for ReduceFlow<T, A> {
    fn take(&self, cb: Option<TakeFn<A>>) {
        let cb = match cb {
            None => return self.src.take_raw(None),
            Some(cb) => cb,
        };
        let acc = self.acc.clone();
        let f = self.f.clone();
        self.src.take_raw(Some(Box::new(move |item| match item {
            Ok(Some(v)) => {
                let folded = f(acc.borrow().clone(), v);
                *acc.borrow_mut() = folded.clone();
                cb(Ok(Some(folded)))
            }
            Ok(None) => cb(Ok(None)),
            Err(fault) => cb(Err(fault)),
        })));
    }

    fn end(&self) {
        self.src.end();
    }

    fn backlog(&self) -> isize {
        self.src.backlog()
    }
}

struct GroupFlow<T: Clone + 'static> {
    src: Channel<T>,
    size: usize,
    chunk: Rc<RefCell<Vec<T>>>,
}

fn group_take<T: Clone + 'static>(
    src: Channel<T>,
    size: usize,
    chunk: Rc<RefCell<Vec<T>>>,
    cb: TakeFn<Vec<T>>,
) {
    let next_src = src.clone();
    let next_chunk = chunk.clone();
    src.take_raw(Some(Box::new(move |item| match item {
        Ok(Some(v)) => {
            next_chunk.borrow_mut().push(v);
            if next_chunk.borrow().len() == size {
                let full = next_chunk.borrow_mut().split_off(0);
                cb(Ok(Some(full)))
            } else {
                group_take(next_src, size, next_chunk, cb)
            }
        }
        // A partial chunk is filtered out: the end sentinel passes and the
        // leftovers are dropped.
        Ok(None) => cb(Ok(None)),
        Err(fault) => cb(Err(fault)),
    })));
}

impl<T: Clone + 'static> Flow<Vec<T>> for GroupFlow<T> {
    fn take(&self, cb: Option<TakeFn<Vec<T>>>) {
        match cb {
            None => self.src.take_raw(None),
            Some(cb) => group_take(self.src.clone(), self.size, self.chunk.clone(), cb),
        }
    }

    fn end(&self) {
        self.src.end();
    }

    fn backlog(&self) -> isize {
        self.src.backlog()
    }
}

/// Yields source values until the stop flag flips, after which every take
/// observes the end sentinel.
struct UntilFlow<T: Clone + 'static> {
    src: Channel<T>,
    stopped: Rc<Cell<bool>>,
}

impl<T: Clone + 'static> Flow<T> for UntilFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn take(&self, cb: Option<TakeFn<T>>) {
        if self.stopped.get() {
            if let Some(cb) = cb {
                later(move || cb(Ok(None)));
            }
            return;
        }
        self.src.take_raw(cb);
    }

    fn end(&self) {
        self.stopped.set(true);
        self.src.end();
    }
}

/// One-shot timed source. Ending the channel cancels the pending timer.
struct TimedFlow<T: Clone + 'static> {
    inner: Channel<T>,
    timer: Cell<Option<u64>>,
}

impl<T: Clone + 'static> Flow<T> for TimedFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.inner.clone())
    }

    fn end(&self) {
        if let Some(id) = self.timer.take() {
            cancel_timer(id);
        }
        self.inner.end();
    }
}

impl<T: Clone + 'static> Channel<T> {
    /// Derives a channel that yields `f(v)` for every source value.
    /// Faults and the end sentinel pass through unchanged. The derivation
    /// is read-side only; keep the source handle for writes.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    /// use weft::{enclose, Channel, LocalExecutor};
    ///
    /// let got = Rc::new(Cell::new(0));
    /// let ex = LocalExecutor::make_default();
    /// ex.run(enclose! { (got) move || {
    ///     let ch = Channel::new();
    ///     let doubled = ch.map(|v: i32| v * 2);
    ///     doubled.take(move |item| got.set(item.unwrap().unwrap()));
    ///     ch.put(21);
    /// }});
    /// assert_eq!(got.get(), 42);
    /// ```
    pub fn map<U: Clone + 'static>(&self, f: impl Fn(T) -> U + 'static) -> Channel<U> {
        Channel::from_flow(Rc::new(MapFlow {
            src: self.clone(),
            f: Rc::new(f),
        }))
    }

    /// Derives a channel that drops source values failing the predicate:
    /// a take that observes a failing value immediately re-takes from the
    /// source. Faults are forwarded without re-entering.
    pub fn filter(&self, pred: impl Fn(&T) -> bool + 'static) -> Channel<T> {
        Channel::from_flow(Rc::new(FilterFlow {
            src: self.clone(),
            pred: Rc::new(pred),
        }))
    }

    /// Derives a channel carrying a running fold of the source. Each take
    /// yields the accumulator after folding in one more source value.
    pub fn reduce<A: Clone + 'static>(
        &self,
        init: A,
        f: impl Fn(A, T) -> A + 'static,
    ) -> Channel<A> {
        Channel::from_flow(Rc::new(ReduceFlow {
            src: self.clone(),
            acc: Rc::new(RefCell::new(init)),
            f: Rc::new(f),
        }))
    }

    /// Derives a channel that yields source values in chunks of exactly
    /// `size`. A partial chunk at the end of the stream is never emitted.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn group(&self, size: usize) -> Channel<Vec<T>> {
        assert!(size >= 1, "group requires a chunk size of at least 1");
        Channel::from_flow(Rc::new(GroupFlow {
            src: self.clone(),
            size,
            chunk: Rc::new(RefCell::new(Vec::new())),
        }))
    }

    /// Derives a channel that yields source values until `signal` produces
    /// anything, after which every take observes the end sentinel. A take
    /// already parked on the source when the signal fires still delivers
    /// its value.
    pub fn until<S: Clone + 'static>(&self, signal: &Channel<S>) -> Channel<T> {
        let stopped = Rc::new(Cell::new(false));
        let flag = stopped.clone();
        signal.take(move |_| flag.set(true));
        Channel::from_flow(Rc::new(UntilFlow {
            src: self.clone(),
            stopped,
        }))
    }

    /// Schedules a one-shot `put(v)` into this channel after `delay`.
    pub fn timeout(&self, delay: Duration, v: T) {
        let chan = self.clone();
        after(delay, move || chan.put(v));
    }

    /// Creates a channel that produces `v` once, after `delay`. Ending the
    /// channel cancels the pending timer.
    pub fn after(delay: Duration, v: T) -> Channel<T> {
        let inner = Channel::new();
        let target = inner.clone();
        let id = after(delay, move || target.put(v));
        Channel::from_flow(Rc::new(TimedFlow {
            inner,
            timer: Cell::new(Some(id)),
        }))
    }

    /// Sequentially puts every element of `items`, awaiting each ack, then
    /// invokes `done` with the whole batch. A fault from any ack aborts
    /// the stream and is forwarded to `done`.
    pub fn stream(
        &self,
        items: Vec<T>,
        done: impl FnOnce(Result<Vec<T>, Fault>) + 'static,
    ) {
        fn push_next<T: Clone + 'static>(
            chan: Channel<T>,
            mut rest: std::vec::IntoIter<T>,
            all: Vec<T>,
            done: Box<dyn FnOnce(Result<Vec<T>, Fault>)>,
        ) {
            match rest.next() {
                Some(v) => {
                    let next_chan = chan.clone();
                    chan.put_with_ack(v, move |acked| match acked {
                        Ok(_) => push_next(next_chan, rest, all, done),
                        Err(fault) => done(Err(fault)),
                    });
                }
                None => done(Ok(all)),
            }
        }

        push_next(
            self.clone(),
            items.clone().into_iter(),
            items,
            Box::new(done),
        );
    }

    /// Collects up to `n` values into a batch. The end sentinel
    /// short-circuits with the partial batch; a fault aborts the batch.
    pub fn take_n(&self, n: usize, cb: impl FnOnce(Result<Vec<T>, Fault>) + 'static) {
        fn take_next<T: Clone + 'static>(
            chan: Channel<T>,
            n: usize,
            mut got: Vec<T>,
            cb: Box<dyn FnOnce(Result<Vec<T>, Fault>)>,
        ) {
            let next_chan = chan.clone();
            chan.take(move |item| match item {
                Ok(Some(v)) => {
                    got.push(v);
                    if got.len() == n {
                        cb(Ok(got))
                    } else {
                        take_next(next_chan, n, got, cb)
                    }
                }
                Ok(None) => cb(Ok(got)),
                Err(fault) => cb(Err(fault)),
            });
        }

        if n == 0 {
            let cb: Box<dyn FnOnce(Result<Vec<T>, Fault>)> = Box::new(cb);
            later(move || cb(Ok(Vec::new())));
            return;
        }
        take_next(self.clone(), n, Vec::new(), Box::new(cb));
    }

    /// Snapshots the backlog and takes that many values without blocking.
    /// With nothing parked, delivers an empty batch on the next tick.
    pub fn take_some(&self, cb: impl FnOnce(Result<Vec<T>, Fault>) + 'static) {
        let parked = self.backlog();
        if parked <= 0 {
            let cb: Box<dyn FnOnce(Result<Vec<T>, Fault>)> = Box::new(cb);
            later(move || cb(Ok(Vec::new())));
            return;
        }
        self.take_n(parked as usize, cb);
    }
}
