// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::channels::channel::{AckFn, Channel, Flow, TakeFn};
use crate::error::Received;
use crate::executor::{after, cancel_timer, later};
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::Rc,
    time::Duration,
};

/// Acks the first `limit` producers immediately; beyond that, producers
/// park like on the base channel and are released one by one as takes free
/// space.
struct BufferFlow<T: Clone + 'static> {
    src: Channel<T>,
    limit: isize,
}

impl<T: Clone + 'static> Flow<T> for BufferFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        let room = self.src.backlog() < self.limit;
        match item {
            Ok(Some(v)) if room => {
                let echo = v.clone();
                self.src.send(Ok(Some(v)), None);
                if let Some(ack) = ack {
                    later(move || ack(Ok(Some(echo))));
                }
            }
            other => self.src.send(other, ack),
        }
    }

    fn take(&self, cb: Option<TakeFn<T>>) {
        let src = self.src.clone();
        let limit = self.limit;
        match cb {
            Some(cb) => self.src.take_raw(Some(Box::new(move |item| {
                cb(item);
                if src.backlog() >= limit {
                    src.release_one_ack();
                }
            }))),
            None => {
                self.src.take_raw(None);
                if src.backlog() >= limit {
                    src.release_one_ack();
                }
            }
        }
    }
}

/// Acks with the value while below capacity; at capacity the value is
/// silently dropped and the ack observes `Ok(None)`. Never parks a
/// producer.
struct DroppingFlow<T: Clone + 'static> {
    src: Channel<T>,
    limit: isize,
}

impl<T: Clone + 'static> Flow<T> for DroppingFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        match item {
            Ok(Some(v)) => {
                if self.src.backlog() < self.limit {
                    let echo = v.clone();
                    self.src.send(Ok(Some(v)), None);
                    if let Some(ack) = ack {
                        later(move || ack(Ok(Some(echo))));
                    }
                } else if let Some(ack) = ack {
                    later(move || ack(Ok(None)));
                }
            }
            other => self.src.send(other, ack),
        }
    }
}

/// At capacity, discards the oldest parked value to make room for the new
/// one. Never parks a producer.
struct ExpiringFlow<T: Clone + 'static> {
    src: Channel<T>,
    limit: isize,
}

impl<T: Clone + 'static> Flow<T> for ExpiringFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        match item {
            Ok(Some(v)) => {
                while self.src.backlog() >= self.limit {
                    self.src.take_raw(None);
                }
                let echo = v.clone();
                self.src.send(Ok(Some(v)), None);
                if let Some(ack) = ack {
                    later(move || ack(Ok(Some(echo))));
                }
            }
            other => self.src.send(other, ack),
        }
    }
}

struct BucketState<T: Clone + 'static> {
    suspended: VecDeque<TakeFn<T>>,
    draining: bool,
}

/// Two-phase buffered channel: takers are locally suspended until the
/// backlog rises past the high-water mark, then serviced until it falls to
/// the low-water mark.
struct BucketFlow<T: Clone + 'static> {
    src: Channel<T>,
    full: isize,
    low: isize,
    state: Rc<RefCell<BucketState<T>>>,
}

fn bucket_pump<T: Clone + 'static>(
    src: Channel<T>,
    low: isize,
    state: Rc<RefCell<BucketState<T>>>,
) {
    let cb = {
        let mut st = state.borrow_mut();
        if !st.draining {
            return;
        }
        st.suspended.pop_front()
    };
    let cb = match cb {
        Some(cb) => cb,
        None => return,
    };
    let next_src = src.clone();
    let next_state = state.clone();
    src.take_raw(Some(Box::new(move |item| {
        cb(item);
        if next_src.backlog() <= low {
            next_state.borrow_mut().draining = false;
        }
        bucket_pump(next_src, low, next_state);
    })));
}

impl<T: Clone + 'static> Flow<T> for BucketFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        self.src.send(item, ack);
        let start = {
            let mut st = self.state.borrow_mut();
            if !st.draining && self.src.backlog() > self.full {
                st.draining = true;
                true
            } else {
                false
            }
        };
        if start {
            bucket_pump(self.src.clone(), self.low, self.state.clone());
        }
    }

    fn take(&self, cb: Option<TakeFn<T>>) {
        let cb = match cb {
            None => return self.src.take_raw(None),
            Some(cb) => cb,
        };
        let draining = {
            let mut st = self.state.borrow_mut();
            st.suspended.push_back(cb);
            st.draining
        };
        if draining {
            bucket_pump(self.src.clone(), self.low, self.state.clone());
        }
    }
}

struct PendingPut<T: Clone + 'static> {
    timer: u64,
    ack: Option<AckFn<T>>,
}

/// Defers each delivery by the debounce interval; a newer put within the
/// interval cancels and replaces the pending one, whose ack observes
/// `Ok(None)`.
struct DebounceFlow<T: Clone + 'static> {
    src: Channel<T>,
    delay: Duration,
    pending: Rc<RefCell<Option<PendingPut<T>>>>,
}

impl<T: Clone + 'static> Flow<T> for DebounceFlow<T> {
    fn source(&self) -> Option<Channel<T>> {
        Some(self.src.clone())
    }

    fn send(&self, item: Received<T>, ack: Option<AckFn<T>>) {
        if let Some(prev) = self.pending.borrow_mut().take() {
            cancel_timer(prev.timer);
            if let Some(prev_ack) = prev.ack {
                later(move || prev_ack(Ok(None)));
            }
        }

        let src = self.src.clone();
        let pending = self.pending.clone();
        let timer = after(self.delay, move || {
            let ack = pending.borrow_mut().take().and_then(|p| p.ack);
            src.send(item, ack);
        });
        *self.pending.borrow_mut() = Some(PendingPut { timer, ack });
    }

    fn end(&self) {
        if let Some(prev) = self.pending.borrow_mut().take() {
            cancel_timer(prev.timer);
            if let Some(prev_ack) = prev.ack {
                later(move || prev_ack(Ok(None)));
            }
        }
        self.src.end();
    }
}

struct FanoutState<T: Clone + 'static> {
    connections: Vec<Channel<T>>,
    started: bool,
}

/// Explicit, latched fan-out over a source channel.
///
/// Unlike [`tap`], a fan-out does not touch the source until [`start`] is
/// called, so values accumulate in the source in the meantime. After
/// `start`, every take result is copied to every connected channel; the
/// end sentinel terminates the distribution loop.
///
/// [`tap`]: Channel::tap
/// [`start`]: Fanout::start
pub struct Fanout<T: Clone + 'static> {
    src: Channel<T>,
    state: Rc<RefCell<FanoutState<T>>>,
}

impl<T: Clone + 'static> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Fanout {
            src: self.src.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Fanout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Fanout")
            .field("connections", &state.connections.len())
            .field("started", &state.started)
            .finish()
    }
}

fn fanout_pump<T: Clone + 'static>(src: Channel<T>, state: Rc<RefCell<FanoutState<T>>>) {
    let next_src = src.clone();
    let next_state = state.clone();
    src.take(move |item| {
        let connections = next_state.borrow().connections.clone();
        match item {
            Ok(Some(v)) => {
                for conn in &connections {
                    conn.put(v.clone());
                }
                fanout_pump(next_src, next_state);
            }
            Ok(None) => {
                for conn in &connections {
                    conn.finish();
                }
            }
            Err(fault) => {
                for conn in &connections {
                    conn.send(Err(fault.clone()), None);
                }
                fanout_pump(next_src, next_state);
            }
        }
    });
}

impl<T: Clone + 'static> Fanout<T> {
    /// Registers a consumer channel.
    pub fn connect(&self, chan: Channel<T>) {
        self.state.borrow_mut().connections.push(chan);
    }

    /// Deregisters a previously connected channel.
    pub fn disconnect(&self, chan: &Channel<T>) {
        self.state
            .borrow_mut()
            .connections
            .retain(|conn| !conn.same(chan));
    }

    /// Begins distribution. Before `start` no internal take is issued.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.started {
                return;
            }
            state.started = true;
        }
        fanout_pump(self.src.clone(), self.state.clone());
    }

    /// The source channel being distributed.
    pub fn channel(&self) -> Channel<T> {
        self.src.clone()
    }
}

impl<T: Clone + 'static> Channel<T> {
    /// Acks the first `n` producers immediately, then applies rendezvous
    /// backpressure: a take that leaves the backlog at or above `n`
    /// releases the oldest parked producer's ack.
    pub fn buffer(&self, n: usize) -> Channel<T> {
        Channel::from_flow(Rc::new(BufferFlow {
            src: self.clone(),
            limit: n as isize,
        }))
    }

    /// Like [`buffer`], but a put at capacity silently drops the value and
    /// acks `Ok(None)`. Producers never park.
    ///
    /// [`buffer`]: Channel::buffer
    pub fn dropping_buffer(&self, n: usize) -> Channel<T> {
        Channel::from_flow(Rc::new(DroppingFlow {
            src: self.clone(),
            limit: n as isize,
        }))
    }

    /// Like [`buffer`], but a put at capacity discards the oldest parked
    /// value to make room. Producers never park.
    ///
    /// [`buffer`]: Channel::buffer
    pub fn expiring_buffer(&self, n: usize) -> Channel<T> {
        Channel::from_flow(Rc::new(ExpiringFlow {
            src: self.clone(),
            limit: n as isize,
        }))
    }

    /// Minimum-fill shaping for bursty sources: takers park locally until
    /// the backlog exceeds `full`, then drain until it falls to `low`.
    pub fn bucket(&self, full: usize, low: usize) -> Channel<T> {
        debug_assert!(low <= full, "bucket low-water mark above the high-water mark");
        Channel::from_flow(Rc::new(BucketFlow {
            src: self.clone(),
            full: full as isize,
            low: low as isize,
            state: Rc::new(RefCell::new(BucketState {
                suspended: VecDeque::new(),
                draining: false,
            })),
        }))
    }

    /// Delivers only the last value of a quiescent window: each put defers
    /// delivery by `delay`, and a newer put within the window replaces the
    /// pending one.
    pub fn debounce(&self, delay: Duration) -> Channel<T> {
        Channel::from_flow(Rc::new(DebounceFlow {
            src: self.clone(),
            delay,
            pending: Rc::new(RefCell::new(None)),
        }))
    }

    /// Creates a latched fan-out over this channel. See [`Fanout`].
    pub fn fanout(&self) -> Fanout<T> {
        Fanout {
            src: self.clone(),
            state: Rc::new(RefCell::new(FanoutState {
                connections: Vec::new(),
                started: false,
            })),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use std::cell::Cell;

    #[test]
    fn buffer_acks_immediately_until_capacity() {
        let acks = Rc::new(RefCell::new(Vec::new()));
        let released = Rc::new(Cell::new(false));
        test_executor!(enclose! { (acks, released) {
            let ch = Channel::new();
            let buffered = ch.buffer(2);
            buffered.put_with_ack(10, enclose! { (acks) move |_| acks.borrow_mut().push(10) });
            buffered.put_with_ack(20, enclose! { (acks) move |_| acks.borrow_mut().push(20) });
            buffered.put_with_ack(30, enclose! { (released) move |_| released.set(true) });
            later(enclose! { (acks, released, buffered) move || {
                assert_eq!(*acks.borrow(), vec![10, 20]);
                assert!(!released.get());
                buffered.take(|_| {});
            }});
        }});
        assert_eq!(*acks.borrow(), vec![10, 20]);
        assert!(released.get());
    }

    #[test]
    fn dropping_buffer_drops_at_capacity() {
        let first_ack = Rc::new(Cell::new(None));
        let second_ack = Rc::new(Cell::new(None));
        let taken = Rc::new(Cell::new(0));
        test_executor!(enclose! { (first_ack, second_ack, taken) {
            let ch = Channel::new();
            let dropping = ch.dropping_buffer(1);
            dropping.put_with_ack(1, move |item| first_ack.set(Some(item.unwrap())));
            dropping.put_with_ack(2, move |item| second_ack.set(Some(item.unwrap())));
            dropping.take(move |item| taken.set(item.unwrap().unwrap()));
        }});
        assert_eq!(first_ack.get(), Some(Some(1)));
        assert_eq!(second_ack.get(), Some(None));
        assert_eq!(taken.get(), 1);
    }

    #[test]
    fn expiring_buffer_discards_the_oldest() {
        let taken = Rc::new(Cell::new(0));
        test_executor!(enclose! { (taken) {
            let ch = Channel::new();
            let expiring = ch.expiring_buffer(2);
            expiring.put(1);
            expiring.put(2);
            expiring.put(3);
            assert_eq!(ch.backlog(), 2);
            expiring.take(move |item| taken.set(item.unwrap().unwrap()));
        }});
        assert_eq!(taken.get(), 2);
    }

    #[test]
    fn bucket_holds_takers_until_full() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let ch = Channel::new();
            let bucket = ch.bucket(2, 0);
            bucket.take(enclose! { (seen) move |item| {
                seen.borrow_mut().push(item.unwrap().unwrap());
            }});
            bucket.put(1);
            bucket.put(2);
            later(enclose! { (seen) move || {
                // Still waiting: the backlog never exceeded the high-water
                // mark while a taker was suspended.
                assert!(seen.borrow().is_empty());
            }});
            bucket.put(3);
            later(enclose! { (bucket, seen) move || {
                bucket.take(enclose! { (seen) move |item| {
                    seen.borrow_mut().push(item.unwrap().unwrap());
                }});
                bucket.take(enclose! { (seen) move |item| {
                    seen.borrow_mut().push(item.unwrap().unwrap());
                }});
            }});
        }});
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn debounce_keeps_only_the_last_put_in_a_window() {
        let got = Rc::new(Cell::new(0));
        let replaced_ack = Rc::new(Cell::new(None));
        test_executor!(enclose! { (got, replaced_ack) {
            let ch = Channel::new();
            let debounced = ch.debounce(Duration::from_millis(10));
            debounced.put_with_ack(1, move |item| replaced_ack.set(Some(item.unwrap())));
            debounced.put(2);
            ch.take(move |item| got.set(item.unwrap().unwrap()));
        }});
        assert_eq!(got.get(), 2);
        assert_eq!(replaced_ack.get(), Some(None));
    }

    #[test]
    fn debounce_end_cancels_the_pending_delivery() {
        let got = Rc::new(Cell::new(false));
        test_executor!(enclose! { (got) {
            let ch: Channel<i32> = Channel::new();
            let debounced = ch.debounce(Duration::from_millis(10));
            debounced.put(1);
            debounced.end();
            ch.take(move |item| {
                if let Ok(Some(_)) = item {
                    got.set(true);
                }
            });
        }});
        assert!(!got.get());
    }

    #[test]
    fn fanout_latches_until_start() {
        let a_seen = Rc::new(RefCell::new(Vec::new()));
        let b_seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (a_seen, b_seen) {
            let ch = Channel::new();
            let fanout = ch.fanout();
            let a = Channel::new();
            let b = Channel::new();
            fanout.connect(a.clone());
            fanout.connect(b.clone());

            ch.put(1);
            ch.put(2);
            // Nothing was distributed yet: the source accumulated.
            assert_eq!(ch.backlog(), 2);

            fanout.start();
            ch.finish();

            for _ in 0..3 {
                a.take(enclose! { (a_seen) move |item| {
                    a_seen.borrow_mut().push(item.unwrap());
                }});
                b.take(enclose! { (b_seen) move |item| {
                    b_seen.borrow_mut().push(item.unwrap());
                }});
            }
        }});
        assert_eq!(*a_seen.borrow(), vec![Some(1), Some(2), None]);
        assert_eq!(*b_seen.borrow(), vec![Some(1), Some(2), None]);
    }

    #[test]
    fn fanout_disconnect_stops_copies() {
        let a_seen = Rc::new(RefCell::new(Vec::new()));
        let b_seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (a_seen, b_seen) {
            let ch = Channel::new();
            let fanout = ch.fanout();
            let a = Channel::new();
            let b = Channel::new();
            fanout.connect(a.clone());
            fanout.connect(b.clone());
            fanout.start();
            ch.put(1);
            later(enclose! { (fanout, b, ch) move || {
                fanout.disconnect(&b);
                ch.put(2);
            }});
            for _ in 0..2 {
                a.take(enclose! { (a_seen) move |item| {
                    a_seen.borrow_mut().push(item.unwrap().unwrap());
                }});
            }
            b.take(enclose! { (b_seen) move |item| {
                b_seen.borrow_mut().push(item.unwrap().unwrap());
            }});
        }});
        assert_eq!(*a_seen.borrow(), vec![1, 2]);
        assert_eq!(*b_seen.borrow(), vec![1]);
    }
}
