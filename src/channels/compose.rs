// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::channels::channel::{Channel, Flow};
use crate::error::{Fault, Received};
use crate::executor::{after, cancel_timer, later};
use ahash::AHashMap;
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    time::Duration,
};

/// The envelope a [`Merge`] output carries: one source's result, with its
/// provenance. Exactly one of value and fault is meaningful, and a
/// `Ok(None)` result marks the end of that particular source.
pub struct Sourced<T: Clone + 'static> {
    /// The source channel this result came from.
    pub channel: Channel<T>,
    /// What the source produced.
    pub result: Received<T>,
}

impl<T: Clone + 'static> Sourced<T> {
    /// Whether this envelope marks the end of its source.
    pub fn is_end(&self) -> bool {
        matches!(self.result, Ok(None))
    }
}

impl<T: Clone + 'static> Clone for Sourced<T> {
    fn clone(&self) -> Self {
        Sourced {
            channel: self.channel.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Sourced<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match &self.result {
            Ok(Some(_)) => "value",
            Ok(None) => "end",
            Err(_) => "fault",
        };
        f.debug_struct("Sourced")
            .field("channel", &self.channel)
            .field("result", &result)
            .finish()
    }
}

/// Interleaves any number of source channels into one output stream of
/// [`Sourced`] envelopes.
///
/// Each source is driven by a reader that chains its next take only after
/// the previous envelope was accepted by the output — natural backpressure
/// per source. A source's end sentinel produces a terminal envelope and
/// stops that reader; the output itself stays open for the other sources.
///
/// # Examples
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use weft::{enclose, Channel, LocalExecutor, Merge};
///
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let ex = LocalExecutor::make_default();
/// ex.run(enclose! { (seen) move || {
///     let a = Channel::new();
///     let b = Channel::new();
///     let merged = Merge::new(vec![a.clone(), b.clone()]);
///     a.put(1);
///     b.put(2);
///     for _ in 0..2 {
///         merged.channel().take(enclose! { (seen) move |item| {
///             seen.borrow_mut().push(item.unwrap().unwrap().result.unwrap().unwrap());
///         }});
///     }
/// }});
/// assert_eq!(*seen.borrow(), vec![1, 2]);
/// ```
pub struct Merge<T: Clone + 'static> {
    out: Channel<Sourced<T>>,
}

impl<T: Clone + 'static> fmt::Debug for Merge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merge").field("out", &self.out).finish()
    }
}

fn merge_reader<T: Clone + 'static>(src: Channel<T>, out: Channel<Sourced<T>>) {
    let envelope_src = src.clone();
    let next_out = out.clone();
    src.take(move |item| {
        let terminal = matches!(item, Ok(None));
        let next_src = envelope_src.clone();
        let envelope = Sourced {
            channel: envelope_src,
            result: item,
        };
        let chain_out = next_out.clone();
        next_out.put_with_ack(envelope, move |_| {
            if !terminal {
                merge_reader(next_src, chain_out);
            }
        });
    });
}

impl<T: Clone + 'static> Merge<T> {
    /// Creates a merge over the given sources.
    pub fn new(sources: Vec<Channel<T>>) -> Merge<T> {
        let merge = Merge {
            out: Channel::new(),
        };
        for src in sources {
            merge.add(src);
        }
        merge
    }

    /// Attaches another source to the running merge.
    pub fn add(&self, src: Channel<T>) {
        merge_reader(src, self.out.clone());
    }

    /// The output channel of envelopes.
    pub fn channel(&self) -> Channel<Sourced<T>> {
        self.out.clone()
    }
}

impl<T: Clone + 'static> Channel<T> {
    /// Merges `sources` into a single stream of [`Sourced`] envelopes.
    pub fn merge(sources: Vec<Channel<T>>) -> Merge<T> {
        Merge::new(sources)
    }
}

struct ClockState {
    period: Duration,
    counter: u64,
    timer: Option<u64>,
}

struct ClockFlow {
    inner: Channel<u64>,
    state: Rc<RefCell<ClockState>>,
}

impl Flow<u64> for ClockFlow {
    fn source(&self) -> Option<Channel<u64>> {
        Some(self.inner.clone())
    }

    fn end(&self) {
        if let Some(id) = self.state.borrow_mut().timer.take() {
            cancel_timer(id);
        }
        self.inner.end();
    }
}

/// A periodic tick source.
///
/// While running, the clock's channel produces a monotonically increasing
/// counter every period. Ticks a consumer does not take accumulate in the
/// channel. Ending the channel stops the clock.
pub struct Clock {
    chan: Channel<u64>,
    state: Rc<RefCell<ClockState>>,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Clock")
            .field("period", &state.period)
            .field("counter", &state.counter)
            .field("running", &state.timer.is_some())
            .finish()
    }
}

fn clock_arm(chan: Channel<u64>, state: Rc<RefCell<ClockState>>) {
    let period = state.borrow().period;
    let tick_chan = chan.clone();
    let tick_state = state.clone();
    let id = after(period, move || {
        let n = {
            let mut st = tick_state.borrow_mut();
            st.timer = None;
            let n = st.counter;
            st.counter += 1;
            n
        };
        tick_chan.put(n);
        clock_arm(tick_chan, tick_state);
    });
    state.borrow_mut().timer = Some(id);
}

impl Clock {
    /// Creates a stopped clock with the given period.
    pub fn new(period: Duration) -> Clock {
        let inner = Channel::new();
        let state = Rc::new(RefCell::new(ClockState {
            period,
            counter: 1,
            timer: None,
        }));
        let chan = Channel::from_flow(Rc::new(ClockFlow {
            inner: inner.clone(),
            state: state.clone(),
        }));
        // Puts go through the wrapper's source, so the handle we keep for
        // ticking is the inner channel wrapped the same way takers see it.
        Clock { chan, state }
    }

    /// Starts ticking from counter value 1.
    pub fn start(&self) {
        self.start_at(1);
    }

    /// Starts ticking from the given counter value. A running clock is
    /// left untouched.
    pub fn start_at(&self, from: u64) {
        {
            let mut state = self.state.borrow_mut();
            if state.timer.is_some() {
                return;
            }
            state.counter = from;
        }
        clock_arm(self.chan.clone(), self.state.clone());
    }

    /// Stops ticking. Queued ticks stay available to takers.
    pub fn stop(&self) {
        if let Some(id) = self.state.borrow_mut().timer.take() {
            cancel_timer(id);
        }
    }

    /// The channel ticks are delivered on.
    pub fn channel(&self) -> Channel<u64> {
        self.chan.clone()
    }
}

/// Creates a stopped [`Clock`] with the given period.
pub fn clock(period: Duration) -> Clock {
    Clock::new(period)
}

/// A heterogeneous structure that may embed channels: the input of
/// [`resolve`].
pub enum Resolvable<T: Clone + 'static> {
    /// An empty slot (what an ended channel resolves to).
    Null,
    /// A plain value.
    Value(T),
    /// A channel to await.
    Chan(Channel<Resolvable<T>>),
    /// An ordered sequence of slots.
    List(Vec<Resolvable<T>>),
    /// A keyed mapping of slots.
    Map(AHashMap<String, Resolvable<T>>),
}

impl<T: Clone + 'static> Clone for Resolvable<T> {
    fn clone(&self) -> Self {
        match self {
            Resolvable::Null => Resolvable::Null,
            Resolvable::Value(v) => Resolvable::Value(v.clone()),
            Resolvable::Chan(ch) => Resolvable::Chan(ch.clone()),
            Resolvable::List(items) => Resolvable::List(items.clone()),
            Resolvable::Map(map) => Resolvable::Map(map.clone()),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Resolvable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolvable::Null => f.write_str("Null"),
            Resolvable::Value(_) => f.write_str("Value(..)"),
            Resolvable::Chan(_) => f.write_str("Chan(..)"),
            Resolvable::List(items) => write!(f, "List(len={})", items.len()),
            Resolvable::Map(map) => write!(f, "Map(len={})", map.len()),
        }
    }
}

impl<T: Clone + 'static> Resolvable<T> {
    /// The plain value in this slot, if that is what it resolved to.
    pub fn value(&self) -> Option<&T> {
        match self {
            Resolvable::Value(v) => Some(v),
            _ => None,
        }
    }
}

type ResolveDone<T> = Box<dyn FnOnce(Result<Resolvable<T>, Fault>)>;

/// Awaits every channel embedded in `thing` and invokes `cb` exactly once
/// with the structure where each channel slot has been replaced by what it
/// produced (an ended channel resolves to [`Resolvable::Null`]).
///
/// With `recursive`, a value taken from a channel is itself resolved
/// transitively, so channels yielding channels (or lists of channels) are
/// awaited all the way down. The first fault from any slot wins and is
/// forwarded; later slot results are discarded.
pub fn resolve<T: Clone + 'static>(
    thing: Resolvable<T>,
    recursive: bool,
    cb: impl FnOnce(Result<Resolvable<T>, Fault>) + 'static,
) {
    let cb: ResolveDone<T> = Box::new(cb);
    // The user callback is always dispatched on a later tick, even when
    // the whole structure resolves synchronously.
    resolve_inner(
        thing,
        recursive,
        Box::new(move |result| later(move || cb(result))),
    );
}

fn resolve_inner<T: Clone + 'static>(thing: Resolvable<T>, recursive: bool, done: ResolveDone<T>) {
    match thing {
        Resolvable::Null => done(Ok(Resolvable::Null)),
        Resolvable::Value(v) => done(Ok(Resolvable::Value(v))),
        Resolvable::Chan(chan) => {
            chan.take(move |item| match item {
                Ok(Some(v)) => {
                    if recursive {
                        resolve_inner(v, true, done)
                    } else {
                        done(Ok(v))
                    }
                }
                Ok(None) => done(Ok(Resolvable::Null)),
                Err(fault) => done(Err(fault)),
            });
        }
        Resolvable::List(items) => {
            let keyed = items.into_iter().enumerate().collect();
            resolve_aggregate(keyed, recursive, done, |slots| {
                Resolvable::List(slots.into_iter().map(|(_, slot)| slot).collect())
            });
        }
        Resolvable::Map(map) => {
            let keyed = map.into_iter().collect();
            resolve_aggregate(keyed, recursive, done, |slots| {
                Resolvable::Map(slots.into_iter().collect())
            });
        }
    }
}

/// Resolves every slot of an aggregate under a counter scoped to this
/// aggregate alone, so sibling aggregates cannot double-invoke the
/// completion callback.
fn resolve_aggregate<T, K, F>(items: Vec<(K, Resolvable<T>)>, recursive: bool, done: ResolveDone<T>, rebuild: F)
where
    T: Clone + 'static,
    K: 'static,
    F: FnOnce(Vec<(K, Resolvable<T>)>) -> Resolvable<T> + 'static,
{
    let total = items.len();
    if total == 0 {
        done(Ok(rebuild(Vec::new())));
        return;
    }

    let slots: Rc<RefCell<Vec<Option<(K, Resolvable<T>)>>>> =
        Rc::new(RefCell::new((0..total).map(|_| None).collect()));
    let outstanding = Rc::new(Cell::new(total));
    let completion: Rc<RefCell<Option<(ResolveDone<T>, F)>>> =
        Rc::new(RefCell::new(Some((done, rebuild))));

    for (index, (key, item)) in items.into_iter().enumerate() {
        let slots = slots.clone();
        let outstanding = outstanding.clone();
        let completion = completion.clone();
        let mut key = Some(key);
        resolve_inner(
            item,
            recursive,
            Box::new(move |result| match result {
                Ok(resolved) => {
                    slots.borrow_mut()[index] = key.take().map(|k| (k, resolved));
                    outstanding.set(outstanding.get() - 1);
                    if outstanding.get() == 0 {
                        let finished = completion.borrow_mut().take();
                        if let Some((done, rebuild)) = finished {
                            let filled: Vec<(K, Resolvable<T>)> = slots
                                .borrow_mut()
                                .drain(..)
                                .flatten()
                                .collect();
                            done(Ok(rebuild(filled)));
                        }
                    }
                }
                Err(fault) => {
                    let finished = completion.borrow_mut().take();
                    if let Some((done, _)) = finished {
                        done(Err(fault));
                    }
                }
            }),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;

    #[test]
    fn merge_interleaves_with_provenance() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let a = Channel::new();
            let b = Channel::new();
            let merged = Merge::new(vec![a.clone(), b.clone()]);
            a.put(1);
            b.put(2);
            a.finish();
            let out = merged.channel();
            for _ in 0..3 {
                out.take(enclose! { (seen, a) move |item| {
                    let envelope = item.unwrap().unwrap();
                    let from_a = envelope.channel.same(&a);
                    seen.borrow_mut().push((from_a, envelope.result.unwrap()));
                }});
            }
        }});
        assert_eq!(
            *seen.borrow(),
            vec![(true, Some(1)), (false, Some(2)), (true, None)]
        );
    }

    #[test]
    fn merge_add_attaches_new_sources() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let a = Channel::new();
            let merged = Merge::new(vec![a.clone()]);
            let out = merged.channel();
            a.put(1);
            let late = Channel::new();
            merged.add(late.clone());
            late.put(2);
            for _ in 0..2 {
                out.take(enclose! { (seen) move |item| {
                    seen.borrow_mut().push(item.unwrap().unwrap().result.unwrap().unwrap());
                }});
            }
        }});
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn merge_reader_applies_backpressure_per_source() {
        test_executor!({
            let a = Channel::new();
            let merged = Merge::new(vec![a.clone()]);
            a.put(1);
            a.put(2);
            later(enclose! { (a) move || {
                // The second value stays parked until the first envelope is
                // accepted by an output taker.
                assert_eq!(a.backlog(), 1);
            }});
            merged.channel().take(|_| {});
        });
    }

    #[test]
    fn clock_ticks_monotonically_until_stopped() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (seen) {
            let clock = Clock::new(Duration::from_millis(2));
            clock.start();
            let chan = clock.channel();
            fn chain(
                chan: Channel<u64>,
                clock: Clock,
                seen: Rc<RefCell<Vec<u64>>>,
            ) {
                let next_chan = chan.clone();
                chan.take(move |item| {
                    let n = item.unwrap().unwrap();
                    seen.borrow_mut().push(n);
                    if n == 3 {
                        clock.stop();
                    } else {
                        chain(next_chan, clock, seen);
                    }
                });
            }
            chain(chan, clock, seen);
        }});
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn ending_the_clock_channel_stops_it() {
        let ticks = Rc::new(Cell::new(0));
        test_executor!(enclose! { (ticks) {
            let clock = Clock::new(Duration::from_millis(2));
            clock.start_at(5);
            let chan = clock.channel();
            chan.take(enclose! { (chan, ticks) move |item| {
                ticks.set(item.unwrap().unwrap());
                chan.end();
            }});
        }});
        assert_eq!(ticks.get(), 5);
    }

    #[test]
    fn resolve_passes_scalars_through() {
        let got = Rc::new(Cell::new(0));
        test_executor!(enclose! { (got) {
            resolve(Resolvable::Value(5), false, move |result| {
                if let Ok(Resolvable::Value(v)) = result {
                    got.set(v);
                }
            });
        }});
        assert_eq!(got.get(), 5);
    }

    #[test]
    fn resolve_awaits_embedded_channels() {
        let got = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (got) {
            let ch = Channel::new();
            let thing = Resolvable::List(vec![
                Resolvable::Value(1),
                Resolvable::Chan(ch.clone()),
                Resolvable::Value(3),
            ]);
            resolve(thing, false, enclose! { (got) move |result| {
                if let Ok(Resolvable::List(items)) = result {
                    for item in items {
                        got.borrow_mut().push(item.value().copied());
                    }
                }
            }});
            ch.put(Resolvable::Value(2));
        }});
        assert_eq!(*got.borrow(), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn resolve_map_with_two_channels_completes_once() {
        let completions = Rc::new(Cell::new(0));
        let sum = Rc::new(Cell::new(0));
        test_executor!(enclose! { (completions, sum) {
            let a = Channel::new();
            let b = Channel::new();
            let mut map = AHashMap::new();
            map.insert(String::from("a"), Resolvable::Chan(a.clone()));
            map.insert(String::from("b"), Resolvable::Chan(b.clone()));
            resolve(Resolvable::Map(map), false, move |result| {
                completions.set(completions.get() + 1);
                if let Ok(Resolvable::Map(map)) = result {
                    let total: i32 = map.values().filter_map(|slot| slot.value().copied()).sum();
                    sum.set(total);
                }
            });
            a.put(Resolvable::Value(10));
            b.put(Resolvable::Value(20));
        }});
        assert_eq!(completions.get(), 1);
        assert_eq!(sum.get(), 30);
    }

    #[test]
    fn resolve_recursive_follows_channel_chains() {
        let got = Rc::new(Cell::new(0));
        test_executor!(enclose! { (got) {
            let outer = Channel::new();
            let inner = Channel::new();
            outer.put(Resolvable::Chan(inner.clone()));
            inner.put(Resolvable::Value(7));
            resolve(Resolvable::Chan(outer.clone()), true, move |result| {
                if let Ok(Resolvable::Value(v)) = result {
                    got.set(v);
                }
            });
        }});
        assert_eq!(got.get(), 7);
    }

    #[test]
    fn resolve_forwards_the_first_fault() {
        let failed = Rc::new(Cell::new(false));
        test_executor!(enclose! { (failed) {
            let ch: Channel<Resolvable<i32>> = Channel::new();
            let thing = Resolvable::List(vec![Resolvable::Chan(ch.clone())]);
            resolve(thing, false, move |result| failed.set(result.is_err()));
            (ch.receive())(Err(Fault::new("slot failed")));
        }});
        assert!(failed.get());
    }

    #[test]
    fn resolve_treats_an_ended_channel_as_null() {
        let was_null = Rc::new(Cell::new(false));
        test_executor!(enclose! { (was_null) {
            let ch: Channel<Resolvable<i32>> = Channel::new();
            resolve(Resolvable::Chan(ch.clone()), false, move |result| {
                was_null.set(matches!(result, Ok(Resolvable::Null)));
            });
            ch.finish();
        }});
        assert!(was_null.get());
    }
}
