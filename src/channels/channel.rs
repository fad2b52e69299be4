// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::error::{Fault, Received};
use crate::executor::later;
use log::debug;
use smallvec::SmallVec;
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    mem,
    rc::Rc,
};

/// Callback invoked with the result of a [`take`].
///
/// [`take`]: Channel::take
pub type TakeFn<T> = Box<dyn FnOnce(Received<T>)>;

/// Completion callback supplied with a [`put_with_ack`], fired when the
/// value is consumed (or dropped, depending on the shaper in front of the
/// channel).
///
/// [`put_with_ack`]: Channel::put_with_ack
pub type AckFn<T> = Box<dyn FnOnce(Received<T>)>;

/// The seam between a channel handle and the state backing it.
///
/// The base flow is the rendezvous queue; every derived channel (map,
/// filter, buffers, debounce, ...) is a first-class struct implementing
/// this trait, usually delegating to a same-typed source channel. The
/// default methods encode that delegation; flows without a same-typed
/// source (the base itself, and type-changing derivations) override what
/// they support and inherit a panic for what they cannot.
pub(crate) trait Flow<T: Clone + 'static> {
    /// The same-typed channel this flow delegates to, when there is one.
    fn source(&self) -> Option<Channel<T>> {
        None
    }

    fn take(&self, cb: Option<TakeFn<T>>) {
        match self.source() {
            Some(src) => src.take_raw(cb),
            None => panic!("take is not supported by this channel"),
        }
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        match self.source() {
            Some(src) => src.send(item, ack),
            None => panic!("cannot put into this derived channel; put into its source instead"),
        }
    }

    fn try_take(&self) -> Option<Received<T>> {
        self.source().and_then(|src| src.try_take())
    }

    fn end(&self) {
        if let Some(src) = self.source() {
            src.end();
        }
    }

    fn backlog(&self) -> isize {
        self.source().map(|src| src.backlog()).unwrap_or(0)
    }

    fn fill(&self, v: T) {
        match self.source() {
            Some(src) => src.fill(v),
            None => panic!("cannot fill this derived channel; fill its source instead"),
        }
    }

    fn release_one_ack(&self) {
        if let Some(src) = self.source() {
            src.release_one_ack();
        }
    }

    fn add_tap(&self, chan: Channel<T>) -> u64 {
        match self.source() {
            Some(src) => src.add_tap_raw(chan),
            None => panic!("cannot tap this derived channel; tap its source instead"),
        }
    }

    fn remove_tap(&self, id: u64) {
        if let Some(src) = self.source() {
            src.remove_tap_raw(id);
        }
    }
}

struct BaseState<T: Clone + 'static> {
    /// Parked deliveries: each entry is a value (or end sentinel, or
    /// fault) waiting for a taker, paired with its producer's ack.
    ready: VecDeque<(Received<T>, Option<AckFn<T>>)>,

    /// Parked takers. Invariant: at least one of `ready` and `waiters` is
    /// empty at every observable point.
    waiters: VecDeque<TakeFn<T>>,

    /// Fan-out subscribers installed with `tap`.
    taps: SmallVec<[(u64, Channel<T>); 2]>,
    next_tap: u64,

    /// Once set, the channel is a constant source: takes yield the value,
    /// puts fail with the `filled` protocol error.
    filled: Option<T>,
}

pub(crate) struct Base<T: Clone + 'static> {
    state: RefCell<BaseState<T>>,
}

impl<T: Clone + 'static> Base<T> {
    fn new() -> Base<T> {
        Base {
            state: RefCell::new(BaseState {
                ready: VecDeque::new(),
                waiters: VecDeque::new(),
                taps: SmallVec::new(),
                next_tap: 0,
                filled: None,
            }),
        }
    }

    /// Base rendezvous: hand the item to the oldest parked taker, or park
    /// it. The taker's callback and the producer's ack are dispatched
    /// independently on the next tick.
    fn deliver(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        let mut state = self.state.borrow_mut();
        if let Some(taker) = state.waiters.pop_front() {
            drop(state);
            if let Some(ack) = ack {
                let echo = item.clone();
                later(move || ack(echo));
            }
            later(move || taker(item));
        } else {
            state.ready.push_back((item, ack));
        }
    }
}

impl<T: Clone + 'static> Flow<T> for Base<T> {
    fn take(&self, cb: Option<TakeFn<T>>) {
        let mut state = self.state.borrow_mut();

        if let Some(v) = state.filled.clone() {
            drop(state);
            if let Some(cb) = cb {
                later(move || cb(Ok(Some(v))));
            }
            return;
        }

        if let Some((item, ack)) = state.ready.pop_front() {
            drop(state);
            if let Some(ack) = ack {
                let echo = item.clone();
                later(move || ack(echo));
            }
            if let Some(cb) = cb {
                later(move || cb(item));
            }
        } else if let Some(cb) = cb {
            state.waiters.push_back(cb);
        }
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        if self.state.borrow().filled.is_some() {
            if let Some(ack) = ack {
                later(move || ack(Err(Fault::filled())));
            }
            return;
        }

        if !self.state.borrow().taps.is_empty() {
            if let Ok(None) = item {
                // The end sentinel tears the taps down and restores plain
                // delivery; the sentinel itself still reaches the base
                // queue below.
                let taps = mem::take(&mut self.state.borrow_mut().taps);
                for (_, tap) in taps {
                    tap.send(Ok(None), None);
                    tap.end();
                }
            } else {
                let taps = self.state.borrow().taps.clone();
                for (_, tap) in &taps {
                    tap.send(item.clone(), None);
                }
                // Forward to the base queue only when a real taker is
                // parked, so values consumed only by taps do not pile up.
                if self.state.borrow().waiters.is_empty() {
                    if let Some(ack) = ack {
                        later(move || ack(Ok(None)));
                    }
                    return;
                }
            }
        }

        self.deliver(item, ack);
    }

    fn try_take(&self) -> Option<Received<T>> {
        let mut state = self.state.borrow_mut();
        if let Some(v) = state.filled.clone() {
            return Some(Ok(Some(v)));
        }
        let (item, ack) = state.ready.pop_front()?;
        drop(state);
        if let Some(ack) = ack {
            let echo = item.clone();
            later(move || ack(echo));
        }
        Some(item)
    }

    fn end(&self) {
        let taps = mem::take(&mut self.state.borrow_mut().taps);
        for (_, tap) in taps {
            tap.end();
        }
    }

    fn backlog(&self) -> isize {
        let state = self.state.borrow();
        state.ready.len() as isize - state.waiters.len() as isize
    }

    fn fill(&self, v: T) {
        let mut state = self.state.borrow_mut();
        if state.filled.is_some() {
            debug!("fill on an already-filled channel ignored");
            return;
        }
        assert!(
            state.ready.is_empty(),
            "fill requires an empty backlog (backlog was {})",
            state.ready.len()
        );
        state.filled = Some(v.clone());
        let waiters = mem::take(&mut state.waiters);
        drop(state);
        for taker in waiters {
            let v = v.clone();
            later(move || taker(Ok(Some(v))));
        }
    }

    fn release_one_ack(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(pos) = state.ready.iter().position(|(_, ack)| ack.is_some()) {
            let ack = state.ready[pos].1.take();
            let echo = state.ready[pos].0.clone();
            drop(state);
            if let Some(ack) = ack {
                later(move || ack(echo));
            }
        }
    }

    fn add_tap(&self, chan: Channel<T>) -> u64 {
        let mut state = self.state.borrow_mut();
        let id = state.next_tap;
        state.next_tap += 1;
        state.taps.push((id, chan));
        id
    }

    fn remove_tap(&self, id: u64) {
        self.state.borrow_mut().taps.retain(|(tap, _)| *tap != id);
    }
}

/// A tap handle: delegates to the subscriber channel, and detaches itself
/// from the tapped source when ended.
struct TapFlow<T: Clone + 'static> {
    id: u64,
    inner: Channel<T>,
    tapped: Channel<T>,
}

impl<T: Clone + 'static> Flow<T> for TapFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.inner.clone())
    }

    fn end(&self) {
        self.tapped.remove_tap_raw(self.id);
        self.inner.end();
    }
}

/// An asynchronous queue with rendezvous semantics.
///
/// A channel synchronizes producers and consumers through continuations: a
/// [`take`] with no parked value parks the taker, a [`put`] with no parked
/// taker parks the value, and every delivery is dispatched on the next
/// tick of the [`LocalExecutor`]. Channels are handles — cloning one gives
/// another view of the same queue.
///
/// The end of a stream is signaled by [`finish`], observed by consumers as
/// `Ok(None)`.
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
///     ch.take(move |item| got.set(item.unwrap().unwrap()));
///     ch.put(7);
/// }});
/// assert_eq!(got.get(), 7);
/// ```
///
/// [`take`]: Channel::take
/// [`put`]: Channel::put
/// [`finish`]: Channel::finish
/// [`LocalExecutor`]: crate::LocalExecutor
pub struct Channel<T: Clone + 'static> {
    flow: Rc<dyn Flow<T>>,
}

impl<T: Clone + 'static> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            flow: self.flow.clone(),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("backlog", &self.backlog())
            .finish()
    }
}

impl<T: Clone + 'static> Default for Channel<T> {
    fn default() -> Self {
        Channel::new()
    }
}

impl<T: Clone + 'static> Channel<T> {
    /// Creates a new, empty channel.
    pub fn new() -> Channel<T> {
        Channel {
            flow: Rc::new(Base::new()),
        }
    }

    pub(crate) fn from_flow(flow: Rc<dyn Flow<T>>) -> Channel<T> {
        Channel { flow }
    }

    /// Consumes one item. If a value is parked, `cb` is scheduled for the
    /// next tick (and so is the producer's ack); otherwise the taker parks
    /// until a producer arrives.
    pub fn take(&self, cb: impl FnOnce(Received<T>) + 'static) {
        self.flow.take(Some(Box::new(cb)));
    }

    pub(crate) fn take_raw(&self, cb: Option<TakeFn<T>>) {
        self.flow.take(cb);
    }

    /// Synchronously pops a parked item, if any. The popped item's ack is
    /// still dispatched on the next tick.
    pub(crate) fn try_take(&self) -> Option<Received<T>> {
        self.flow.try_take()
    }

    /// Produces a value into the channel without waiting for delivery.
    pub fn put(&self, v: T) {
        self.flow.send(Ok(Some(v)), None);
    }

    /// Produces a value and registers `ack`, fired once the value is
    /// consumed — `Ok(Some(v))` on delivery, `Ok(None)` when a shaper
    /// dropped it, `Err` with the `filled` fault on a filled channel.
    pub fn put_with_ack(&self, v: T, ack: impl FnOnce(Received<T>) + 'static) {
        self.flow.send(Ok(Some(v)), Some(Box::new(ack)));
    }

    /// Puts the end-of-stream sentinel. Consumers observe it as
    /// `Ok(None)`.
    pub fn finish(&self) {
        self.flow.send(Ok(None), None);
    }

    pub(crate) fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        self.flow.send(item, ack);
    }

    /// Tears down whatever this channel attached on creation: timers, tap
    /// subscriptions, signal listeners. Idempotent; derived channels chain
    /// their teardown to their source's.
    pub fn end(&self) {
        self.flow.end();
    }

    /// The number of parked values minus the number of parked takers.
    pub fn backlog(&self) -> isize {
        self.flow.backlog()
    }

    /// Whether a `take` would complete without parking.
    pub fn can_read(&self) -> bool {
        self.backlog() > 0
    }

    /// Whether a `put` would rendezvous immediately or park as the first
    /// value in the queue.
    pub fn can_write(&self) -> bool {
        self.backlog() <= 0
    }

    /// Converts the channel into a constant source: every future `take`
    /// yields `v`, every future `put` fails with the `filled` fault, and
    /// any parked takers are satisfied with `v` immediately. Idempotent
    /// after the first call.
    ///
    /// # Panics
    ///
    /// Panics if values are parked in the channel (`backlog > 0`).
    pub fn fill(&self, v: T) {
        self.flow.fill(v);
    }

    pub(crate) fn release_one_ack(&self) {
        self.flow.release_one_ack();
    }

    pub(crate) fn add_tap_raw(&self, chan: Channel<T>) -> u64 {
        self.flow.add_tap(chan)
    }

    pub(crate) fn remove_tap_raw(&self, id: u64) {
        self.flow.remove_tap(id);
    }

    /// Subscribes a tap: every value put into this channel is forwarded to
    /// the tap (and to every other tap) before delivery. Values reach the
    /// base queue only while real takers are parked, so a channel consumed
    /// only through taps does not accumulate a backlog. The end sentinel
    /// ends every tap and restores plain delivery.
    ///
    /// Pass an existing channel to use it as the subscriber, or `None` to
    /// get a fresh one. Ending the returned channel detaches the tap.
    pub fn tap(&self, chan: Option<Channel<T>>) -> Channel<T> {
        let inner = chan.unwrap_or_else(Channel::new);
        let id = self.flow.add_tap(inner.clone());
        Channel::from_flow(Rc::new(TapFlow {
            id,
            inner,
            tapped: self.clone(),
        }))
    }

    /// Whether two handles view the same underlying channel state.
    pub fn same(&self, other: &Channel<T>) -> bool {
        Rc::ptr_eq(&self.flow, &other.flow)
    }

    /// Bridges a callback-style producer to this channel: the returned
    /// closure puts whatever result it is invoked with.
    pub fn receive(&self) -> impl FnOnce(Received<T>) {
        let chan = self.clone();
        move |item| chan.send(item, None)
    }

    /// Like [`receive`], but the first delivered value [`fill`]s the
    /// channel, turning it into a constant source. Faults are forwarded
    /// into the channel; an end sentinel is ignored.
    ///
    /// [`receive`]: Channel::receive
    /// [`fill`]: Channel::fill
    pub fn resolver(&self) -> impl FnOnce(Received<T>) {
        let chan = self.clone();
        move |item| match item {
            Ok(Some(v)) => chan.fill(v),
            Ok(None) => {}
            Err(fault) => chan.send(Err(fault), None),
        }
    }

    /// Installs a self-looping consumer. The handler receives each item
    /// together with a continuation; invoking the continuation chains the
    /// next take, so the handler controls the pace of the loop (and stops
    /// it by dropping the continuation).
    pub fn process<F>(&self, handler: F)
    where
        F: FnMut(Received<T>, Box<dyn FnOnce()>) + 'static,
    {
        fn step<T: Clone + 'static>(
            chan: Channel<T>,
            handler: Rc<RefCell<dyn FnMut(Received<T>, Box<dyn FnOnce()>)>>,
        ) {
            let next_chan = chan.clone();
            let next_handler = handler.clone();
            chan.take(move |item| {
                let again = Box::new(move || step(next_chan, next_handler));
                (&mut *handler.borrow_mut())(item, again);
            });
        }

        let handler: Rc<RefCell<dyn FnMut(Received<T>, Box<dyn FnOnce()>)>> =
            Rc::new(RefCell::new(handler));
        step(self.clone(), handler);
    }

    /// Installs a consumer that instantiates a [`Service`] per message and
    /// dispatches the message to it. With `spawn` the loop advances
    /// immediately after dispatch; without it the loop waits for the
    /// handler to invoke its completion continuation.
    pub fn bind<S, F>(&self, factory: F, spawn: bool)
    where
        S: Service<T>,
        F: FnMut() -> S + 'static,
    {
        fn step<T, S, F>(chan: Channel<T>, factory: Rc<RefCell<F>>, spawn: bool)
        where
            T: Clone + 'static,
            S: Service<T>,
            F: FnMut() -> S + 'static,
        {
            let next_chan = chan.clone();
            let next_factory = factory.clone();
            chan.take(move |item| match item {
                Ok(Some(v)) => {
                    let mut service = (&mut *factory.borrow_mut())();
                    if spawn {
                        service.accept(v, Box::new(|| {}));
                        step(next_chan, next_factory, spawn);
                    } else {
                        service.accept(
                            v,
                            Box::new(move || step(next_chan, next_factory, spawn)),
                        );
                    }
                }
                Ok(None) => {}
                Err(fault) => {
                    debug!("bind loop stopped on fault: {}", fault);
                }
            });
        }

        step(self.clone(), Rc::new(RefCell::new(factory)), spawn);
    }
}

/// A per-message handler instantiated by [`Channel::bind`].
pub trait Service<T>: 'static {
    /// Handles one message. `done` advances the binding loop when the
    /// binding was installed without `spawn`.
    fn accept(&mut self, value: T, done: Box<dyn FnOnce()>);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use std::cell::Cell;

    #[test]
    fn rendezvous_take_then_put() {
        let got = Rc::new(Cell::new(0));
        test_executor!(enclose! { (got) {
            let ch = Channel::new();
            ch.take(move |item| got.set(item.unwrap().unwrap()));
            ch.put(7);
        }});
        assert_eq!(got.get(), 7);
    }

    #[test]
    fn rendezvous_put_then_take() {
        let got = Rc::new(Cell::new(0));
        test_executor!(enclose! { (got) {
            let ch = Channel::new();
            ch.put(13);
            assert_eq!(ch.backlog(), 1);
            ch.take(move |item| got.set(item.unwrap().unwrap()));
        }});
        assert_eq!(got.get(), 13);
    }

    #[test]
    fn values_are_delivered_in_put_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let ch = Channel::new();
            for i in 0..4 {
                ch.put(i);
            }
            for _ in 0..4 {
                ch.take(enclose! { (seen) move |item| {
                    seen.borrow_mut().push(item.unwrap().unwrap());
                }});
            }
        }});
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn ack_fires_with_the_consumed_value() {
        let acked = Rc::new(Cell::new(None));
        test_executor!(enclose! { (acked) {
            let ch = Channel::new();
            ch.put_with_ack(9, enclose! { (acked) move |item| {
                acked.set(item.unwrap());
            }});
            assert!(acked.get().is_none());
            ch.take(|_| {});
        }});
        assert_eq!(acked.get(), Some(9));
    }

    #[test]
    fn backlog_counts_parked_values_and_takers() {
        test_executor!({
            let ch = Channel::new();
            ch.take(|_: Received<i32>| {});
            assert_eq!(ch.backlog(), -1);
            assert!(!ch.can_read());
            assert!(ch.can_write());
            ch.put(1);
            ch.put(2);
            assert_eq!(ch.backlog(), 1);
            assert!(ch.can_read());
            assert!(!ch.can_write());
        });
    }

    #[test]
    fn finish_delivers_the_end_sentinel() {
        let ended = Rc::new(Cell::new(false));
        test_executor!(enclose! { (ended) {
            let ch: Channel<i32> = Channel::new();
            ch.take(move |item| ended.set(item.unwrap().is_none()));
            ch.finish();
        }});
        assert!(ended.get());
    }

    #[test]
    fn fill_satisfies_parked_and_future_takers() {
        let first = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(0));
        let put_err = Rc::new(Cell::new(false));
        test_executor!(enclose! { (first, second, put_err) {
            let ch = Channel::new();
            ch.take(move |item| first.set(item.unwrap().unwrap()));
            ch.fill(42);
            ch.take(move |item| second.set(item.unwrap().unwrap()));
            ch.put_with_ack(1, move |item| put_err.set(item.is_err()));
        }});
        assert_eq!(first.get(), 42);
        assert_eq!(second.get(), 42);
        assert!(put_err.get());
    }

    #[test]
    fn fill_is_idempotent() {
        let got = Rc::new(Cell::new(0));
        test_executor!(enclose! { (got) {
            let ch = Channel::new();
            ch.fill(1);
            ch.fill(2);
            ch.take(move |item| got.set(item.unwrap().unwrap()));
        }});
        assert_eq!(got.get(), 1);
    }

    #[test]
    fn tap_receives_values_without_consuming() {
        let tapped = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (tapped) {
            let ch = Channel::new();
            let tap = ch.tap(None);
            ch.put(1);
            ch.put(2);
            // No takers were parked, so nothing piled up in the source.
            assert_eq!(ch.backlog(), 0);
            for _ in 0..2 {
                tap.take(enclose! { (tapped) move |item| {
                    tapped.borrow_mut().push(item.unwrap().unwrap());
                }});
            }
        }});
        assert_eq!(*tapped.borrow(), vec![1, 2]);
    }

    #[test]
    fn tap_forwards_to_base_when_a_taker_is_parked() {
        let direct = Rc::new(Cell::new(0));
        let via_tap = Rc::new(Cell::new(0));
        test_executor!(enclose! { (direct, via_tap) {
            let ch = Channel::new();
            let tap = ch.tap(None);
            ch.take(move |item| direct.set(item.unwrap().unwrap()));
            tap.take(move |item| via_tap.set(item.unwrap().unwrap()));
            ch.put(5);
        }});
        assert_eq!(direct.get(), 5);
        assert_eq!(via_tap.get(), 5);
    }

    #[test]
    fn end_sentinel_ends_taps_and_restores_delivery() {
        let tap_ended = Rc::new(Cell::new(false));
        let got_after = Rc::new(Cell::new(0));
        test_executor!(enclose! { (tap_ended, got_after) {
            let ch = Channel::new();
            let tap = ch.tap(None);
            tap.take(move |item| tap_ended.set(item.unwrap().is_none()));
            ch.finish();
            // Plain delivery is restored: a later put parks normally.
            ch.take(|_| {});
            ch.take(move |item| got_after.set(item.unwrap().unwrap()));
            ch.put(8);
        }});
        assert!(tap_ended.get());
        assert_eq!(got_after.get(), 8);
    }

    #[test]
    fn ending_a_tap_detaches_it() {
        let tapped = Rc::new(Cell::new(0));
        test_executor!(enclose! { (tapped) {
            let ch = Channel::new();
            let tap = ch.tap(None);
            tap.end();
            ch.take(|_| {});
            ch.put(3);
            tap.take(move |item| {
                if let Ok(Some(v)) = item {
                    tapped.set(v);
                }
            });
        }});
        assert_eq!(tapped.get(), 0);
    }

    #[test]
    fn receive_bridges_results_into_the_channel() {
        let got = Rc::new(Cell::new(0));
        let failed = Rc::new(Cell::new(false));
        test_executor!(enclose! { (got, failed) {
            let ch = Channel::new();
            ch.take(move |item| got.set(item.unwrap().unwrap()));
            (ch.receive())(Ok(Some(11)));
            ch.take(move |item| failed.set(item.is_err()));
            (ch.receive())(Err(Fault::new("upstream broke")));
        }});
        assert_eq!(got.get(), 11);
        assert!(failed.get());
    }

    #[test]
    fn resolver_fills_the_channel() {
        let a = Rc::new(Cell::new(0));
        let b = Rc::new(Cell::new(0));
        test_executor!(enclose! { (a, b) {
            let ch = Channel::new();
            (ch.resolver())(Ok(Some(6)));
            ch.take(move |item| a.set(item.unwrap().unwrap()));
            ch.take(move |item| b.set(item.unwrap().unwrap()));
        }});
        assert_eq!(a.get(), 6);
        assert_eq!(b.get(), 6);
    }

    #[test]
    fn process_loops_until_the_continuation_is_dropped() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let ch = Channel::new();
            for i in 0..3 {
                ch.put(i);
            }
            ch.finish();
            ch.process(move |item, again| match item {
                Ok(Some(v)) => {
                    seen.borrow_mut().push(v);
                    again();
                }
                _ => {}
            });
        }});
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn bind_without_spawn_waits_for_the_handler() {
        struct Collector {
            seen: Rc<RefCell<Vec<i32>>>,
        }

        impl Service<i32> for Collector {
            fn accept(&mut self, value: i32, done: Box<dyn FnOnce()>) {
                self.seen.borrow_mut().push(value);
                later(done);
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let ch = Channel::new();
            for i in 0..3 {
                ch.put(i);
            }
            ch.finish();
            ch.bind(move || Collector { seen: seen.clone() }, false);
        }});
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn bind_with_spawn_advances_immediately() {
        struct Sink {
            seen: Rc<RefCell<Vec<i32>>>,
        }

        impl Service<i32> for Sink {
            fn accept(&mut self, value: i32, _done: Box<dyn FnOnce()>) {
                self.seen.borrow_mut().push(value);
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let ch = Channel::new();
            for i in 0..3 {
                ch.put(i);
            }
            ch.finish();
            ch.bind(move || Sink { seen: seen.clone() }, true);
        }});
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }
}
