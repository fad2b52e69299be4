// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The task state-machine runtime.
//!
//! A task is a numbered step machine produced by a compiler front end (or
//! written by hand in the same shape): a single dispatch function that
//! switches on the current step id, suspends by handing resumption
//! callbacks to channels or timers, and drives structured unwinding —
//! try/catch/finally, retry, switch and join points — through the
//! [`Machine`]'s unwind stack.
//!
//! The compiled-code conventions the runtime expects:
//!
//! * every step that can be resumed with a fault routes it back into
//!   [`callback`] before doing anything else;
//! * a finally step calls [`begin_cleanup`] on entry and re-propagates the
//!   fault it was resumed with when it completes;
//! * all forward control transfer goes through [`go_to`], [`then_to`],
//!   [`then_to_with_err`] or a [`JumpTable`], so suspension is uniform.
//!
//! [`callback`]: Machine::callback
//! [`begin_cleanup`]: Machine::begin_cleanup
//! [`go_to`]: Machine::go_to
//! [`then_to`]: Machine::then_to
//! [`then_to_with_err`]: Machine::then_to_with_err

mod jump;

pub use jump::{CaseKey, JumpTable};

use crate::channels::Channel;
use crate::error::{Fault, Received};
use crate::executor::later;
use ahash::AHashMap;
use log::warn;
use std::{
    any::Any,
    cell::RefCell,
    fmt,
    mem,
    rc::Rc,
};

/// Step numbers in a compiled task: 0 is unstarted, 1 is the entry step.
pub type StepId = u32;

/// The payload a step is dispatched with: at most one of a fault and a
/// boxed value.
pub struct Resume {
    /// The active fault, if the machine is unwinding or was resumed with
    /// an error.
    pub fault: Option<Fault>,
    /// The resumption value, boxed by the callback that produced it.
    pub value: Option<Box<dyn Any>>,
}

impl Resume {
    /// An empty payload.
    pub fn empty() -> Resume {
        Resume {
            fault: None,
            value: None,
        }
    }

    /// Downcasts and removes the value. Returns `None` when the payload is
    /// empty or of a different type.
    pub fn take_value<V: Any>(&mut self) -> Option<V> {
        self.value
            .take()
            .and_then(|boxed| boxed.downcast::<V>().ok())
            .map(|boxed| *boxed)
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("fault", &self.fault)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

/// Snapshot and restore of a task's locals, used by finally blocks and
/// capturing join points.
///
/// Any `Clone` context gets this for free: capture clones, restore
/// overwrites.
pub trait Locals: 'static {
    /// Snapshots the locals.
    fn capture(&self) -> Box<dyn Any>;
    /// Overwrites the locals from a snapshot taken earlier.
    fn restore(&mut self, snapshot: Box<dyn Any>);
}

impl<C: Clone + 'static> Locals for C {
    fn capture(&self) -> Box<dyn Any> {
        Box::new(self.clone())
    }

    fn restore(&mut self, snapshot: Box<dyn Any>) {
        match snapshot.downcast::<C>() {
            Ok(snap) => *self = *snap,
            Err(_) => warn!("locals snapshot of a different type ignored"),
        }
    }
}

/// The compiled dispatch function of a task.
pub type StepFn<C> = Rc<dyn Fn(&Rc<Machine<C>>, &mut C, Resume)>;

type FinalFn<C> = Box<dyn FnOnce(&mut C, Resume)>;

#[derive(Clone)]
struct ErrorFrame {
    step: StepId,
    retry_step: StepId,
    /// Unwind-stack depth at registration time; `retry` splices the
    /// re-armed handler back in at this index.
    anchor: usize,
}

enum Unwind {
    CleanupStep { step: StepId, locals: Box<dyn Any> },
    CleanupAction(Box<dyn FnOnce()>),
    ErrorHandler(ErrorFrame),
    Phi { step: StepId, locals: Option<Box<dyn Any>> },
    Retry { step: StepId },
    RestoreLocals(Box<dyn Any>),
}

struct State {
    id: StepId,
    resume: Resume,
    unwinding: Vec<Unwind>,
    waiting: usize,
    finished: bool,
    strict_unwind: bool,
    current_error: Option<ErrorFrame>,
    abort_fault: Option<Fault>,
}

/// Executes one invocation of a compiled task.
///
/// The machine owns the per-invocation [`State`] — step id, resumption
/// payload, unwind stack, phase flags — and offers the entry points the
/// compiler emits calls to. External callers only use [`abort`],
/// [`is_waiting`] and [`is_finished`].
///
/// [`State`]: self
/// [`abort`]: Machine::abort
/// [`is_waiting`]: Machine::is_waiting
/// [`is_finished`]: Machine::is_finished
pub struct Machine<C: Locals> {
    name: &'static str,
    context: RefCell<C>,
    body: StepFn<C>,
    final_cb: RefCell<Option<FinalFn<C>>>,
    state: RefCell<State>,
    tables: RefCell<AHashMap<StepId, Rc<JumpTable>>>,
}

impl<C: Locals> fmt::Debug for Machine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("step", &state.id)
            .field("waiting", &state.waiting)
            .field("finished", &state.finished)
            .finish()
    }
}

impl<C: Locals> Machine<C> {
    /// Creates a machine for one invocation of a compiled task. The final
    /// callback is invoked exactly once, with the uncaught fault (if any)
    /// and the payload of the last completed step.
    pub fn new(
        name: &'static str,
        context: C,
        body: impl Fn(&Rc<Machine<C>>, &mut C, Resume) + 'static,
        final_cb: impl FnOnce(&mut C, Resume) + 'static,
    ) -> Rc<Machine<C>> {
        Rc::new(Machine {
            name,
            context: RefCell::new(context),
            body: Rc::new(body),
            final_cb: RefCell::new(Some(Box::new(final_cb))),
            state: RefCell::new(State {
                id: 0,
                resume: Resume::empty(),
                unwinding: Vec::new(),
                waiting: 0,
                finished: false,
                strict_unwind: false,
                current_error: None,
                abort_fault: None,
            }),
            tables: RefCell::new(AHashMap::new()),
        })
    }

    /// The task's name, used in fault traces.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The current step id.
    pub fn step_id(&self) -> StepId {
        self.state.borrow().id
    }

    /// Whether resumption callbacks or scheduled steps are outstanding.
    pub fn is_waiting(&self) -> bool {
        self.state.borrow().waiting > 0
    }

    /// Whether the final callback has run.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Enters the machine at step 1.
    pub fn start(self: &Rc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            state.id = 1;
            state.resume = Resume::empty();
            state.waiting += 1;
        }
        self.defer_step();
    }

    /// Transfers control to `id` with a fresh payload. All forward
    /// transitions go through here so suspension stays uniform.
    pub fn go_to(self: &Rc<Self>, id: StepId) {
        {
            let mut state = self.state.borrow_mut();
            state.id = id;
            state.strict_unwind = false;
            state.resume = Resume::empty();
            state.waiting += 1;
        }
        self.defer_step();
    }

    /// Like `go_to`, but keeps the pending payload: the unwind loop uses
    /// this so catch, finally and join steps observe the completing
    /// branch's payload.
    fn wind_to(self: &Rc<Self>, id: StepId) {
        {
            let mut state = self.state.borrow_mut();
            state.id = id;
            state.strict_unwind = false;
            state.waiting += 1;
        }
        self.defer_step();
    }

    /// Resumption entry used by `then_to*` callbacks: the outstanding
    /// resumption was already counted when the callback was handed out.
    fn resume_at(self: &Rc<Self>, id: StepId, resume: Resume) {
        {
            let mut state = self.state.borrow_mut();
            state.id = id;
            state.strict_unwind = false;
            state.resume = resume;
        }
        self.defer_step();
    }

    fn defer_step(self: &Rc<Self>) {
        let sm = self.clone();
        later(move || sm.step());
    }

    fn defer_unwind(self: &Rc<Self>) {
        let sm = self.clone();
        later(move || sm.unwind());
    }

    fn step(self: &Rc<Self>) {
        let resume = {
            let mut state = self.state.borrow_mut();
            state.waiting = state.waiting.saturating_sub(1);
            if state.finished {
                warn!("task {} resumed after finishing", self.name);
                return;
            }
            match state.abort_fault.take() {
                // A pending abort replaces normal dispatch with an error
                // dispatch at the current step.
                Some(fault) => Resume {
                    fault: Some(fault),
                    value: None,
                },
                None => mem::replace(&mut state.resume, Resume::empty()),
            }
        };
        let body = self.body.clone();
        let mut context = self.context.borrow_mut();
        body(self, &mut context, resume);
    }

    /// Produces a one-shot success callback that resumes the machine at
    /// `id` with the value it is invoked with. The take-once latch is the
    /// type system: the callback is `FnOnce`.
    pub fn then_to<V: Any>(self: &Rc<Self>, id: StepId) -> Box<dyn FnOnce(V)> {
        self.state.borrow_mut().waiting += 1;
        let sm = self.clone();
        Box::new(move |v| {
            sm.resume_at(
                id,
                Resume {
                    fault: None,
                    value: Some(Box::new(v)),
                },
            )
        })
    }

    /// Produces a one-shot channel-style callback that resumes the machine
    /// at `id`. A fault lands in the step's `resume.fault` slot so the
    /// step body sees a uniform `(fault, value)` shape; a value arrives
    /// boxed as `Option<V>`.
    pub fn then_to_with_err<V: Clone + Any>(
        self: &Rc<Self>,
        id: StepId,
    ) -> Box<dyn FnOnce(Received<V>)> {
        self.state.borrow_mut().waiting += 1;
        let sm = self.clone();
        Box::new(move |item| match item {
            Ok(v) => sm.resume_at(
                id,
                Resume {
                    fault: None,
                    value: Some(Box::new(v)),
                },
            ),
            Err(fault) => sm.resume_at(
                id,
                Resume {
                    fault: Some(fault),
                    value: None,
                },
            ),
        })
    }

    /// The unified completion entry point. Stores the payload; a fault
    /// additionally arms strict unwinding, appends a `task:step` frame to
    /// the fault's trace and notifies the global error sink. Unwinding is
    /// deferred to the next tick.
    pub fn callback(self: &Rc<Self>, fault: Option<Fault>, value: Option<Box<dyn Any>>) {
        let notify = fault.clone();
        {
            let mut state = self.state.borrow_mut();
            if state.finished {
                warn!("task {} completed after finishing", self.name);
                return;
            }
            if let Some(fault) = &fault {
                state.strict_unwind = true;
                fault.push_frame(self.name, state.id);
            }
            state.resume = Resume { fault, value };
        }
        if let Some(fault) = notify {
            let handle: Rc<dyn MachineHandle> = self.clone();
            notify_sink(fault, handle);
        }
        self.defer_unwind();
    }

    /// Branch-exit continuation: completes the current branch so the
    /// unwind loop reaches the pending join point.
    pub fn phi(self: &Rc<Self>, value: Option<Box<dyn Any>>) {
        self.callback(None, value);
    }

    fn unwind(self: &Rc<Self>) {
        loop {
            let record = {
                let mut state = self.state.borrow_mut();
                if state.finished {
                    return;
                }
                state.unwinding.pop()
            };
            match record {
                None => {
                    self.finish();
                    return;
                }
                Some(Unwind::RestoreLocals(snapshot)) => {
                    self.context.borrow_mut().restore(snapshot);
                }
                Some(Unwind::CleanupAction(action)) => action(),
                Some(Unwind::Retry { step }) => {
                    self.wind_to(step);
                    return;
                }
                Some(Unwind::Phi { step, locals }) => {
                    let skip = {
                        let state = self.state.borrow();
                        state.strict_unwind || state.resume.fault.is_some()
                    };
                    // Errors take precedence over ordinary joins.
                    if skip {
                        continue;
                    }
                    if let Some(snapshot) = locals {
                        self.context.borrow_mut().restore(snapshot);
                    }
                    self.wind_to(step);
                    return;
                }
                Some(Unwind::ErrorHandler(frame)) => {
                    let matched = self.state.borrow().resume.fault.is_some();
                    if matched {
                        self.state.borrow_mut().current_error = Some(frame.clone());
                        self.wind_to(frame.step);
                        return;
                    }
                }
                Some(Unwind::CleanupStep { step, locals }) => {
                    self.context.borrow_mut().restore(locals);
                    self.wind_to(step);
                    return;
                }
            }
        }
    }

    fn finish(self: &Rc<Self>) {
        let final_cb = self.final_cb.borrow_mut().take();
        let resume = {
            let mut state = self.state.borrow_mut();
            state.finished = true;
            mem::replace(&mut state.resume, Resume::empty())
        };
        match final_cb {
            Some(final_cb) => {
                let mut context = self.context.borrow_mut();
                final_cb(&mut context, resume);
            }
            None => warn!("task {} finished more than once", self.name),
        }
    }

    /// Registers a finally block at step `id`, snapshotting the locals,
    /// then continues the protected region at `after`.
    pub fn push_cleanup_step(self: &Rc<Self>, context: &C, id: StepId, after: StepId) {
        self.state
            .borrow_mut()
            .unwinding
            .push(Unwind::CleanupStep {
                step: id,
                locals: context.capture(),
            });
        self.go_to(after);
    }

    /// Registers a synchronous cleanup closure.
    pub fn push_cleanup_action(&self, action: impl FnOnce() + 'static) {
        self.state
            .borrow_mut()
            .unwinding
            .push(Unwind::CleanupAction(Box::new(action)));
    }

    /// Registers a catch handler at step `id` guarding the block that
    /// starts at `retry_step`. The current unwind depth is recorded so
    /// `retry` can re-arm the handler in place.
    pub fn push_error_step(&self, id: StepId, retry_step: StepId) {
        let mut state = self.state.borrow_mut();
        let anchor = state.unwinding.len();
        state.unwinding.push(Unwind::ErrorHandler(ErrorFrame {
            step: id,
            retry_step,
            anchor,
        }));
    }

    /// Registers a join point at step `id`.
    pub fn push_phi(&self, id: StepId) {
        self.state
            .borrow_mut()
            .unwinding
            .push(Unwind::Phi { step: id, locals: None });
    }

    /// Registers a join point at step `id`, snapshotting the locals to be
    /// restored when the join is reached.
    pub fn push_phi_capturing(&self, context: &C, id: StepId) {
        self.state.borrow_mut().unwinding.push(Unwind::Phi {
            step: id,
            locals: Some(context.capture()),
        });
    }

    /// Called on entry to a finally step: snapshots the locals so they are
    /// restored once the finally completes.
    pub fn begin_cleanup(&self, context: &C) {
        self.state
            .borrow_mut()
            .unwinding
            .push(Unwind::RestoreLocals(context.capture()));
    }

    /// Re-enters the protected block from within its catch handler. The
    /// handler is re-armed at its original depth, finallies registered
    /// between the catch and the retry run first, and the fault is
    /// cleared.
    ///
    /// # Panics
    ///
    /// Panics when called outside of an error handler — a programming
    /// error in the compiled task.
    pub fn retry(self: &Rc<Self>, value: Option<Box<dyn Any>>) {
        let frame = match self.state.borrow().current_error.clone() {
            Some(frame) => frame,
            None => panic!("`retry` called outside of an error handler"),
        };
        {
            let mut state = self.state.borrow_mut();
            let at = frame.anchor.min(state.unwinding.len());
            state
                .unwinding
                .insert(at, Unwind::ErrorHandler(frame.clone()));
            state
                .unwinding
                .insert(at + 1, Unwind::Retry { step: frame.retry_step });
            state.resume = Resume { fault: None, value };
            state.strict_unwind = true;
        }
        self.defer_unwind();
    }

    /// Requests termination with `fault`. When resumptions are
    /// outstanding the abort is honored at the next resumption boundary;
    /// otherwise the machine unwinds immediately.
    pub fn abort(self: &Rc<Self>, fault: Fault) {
        let awaiting = self.state.borrow().waiting > 0;
        if awaiting {
            self.state.borrow_mut().abort_fault = Some(fault);
        } else {
            self.callback(Some(fault), None);
        }
    }

    /// Creates a channel; a convenience for compiled tasks.
    pub fn channel<T: Clone + 'static>(&self) -> Channel<T> {
        Channel::new()
    }

    /// Looks up the memoized jump table built for the switch at `id`.
    ///
    /// # Panics
    ///
    /// Panics if no table was built for `id`.
    pub fn jump_table(&self, id: StepId) -> Rc<JumpTable> {
        match self.tables.borrow().get(&id) {
            Some(table) => table.clone(),
            None => panic!("no jump table built for step {}", id),
        }
    }

    /// Builds (once) and returns the jump table for the switch at `id`.
    /// Later calls with the same `id` return the cached table.
    pub fn jump_table_with(
        &self,
        id: StepId,
        cases: Vec<CaseKey>,
        block_sizes: Vec<StepId>,
    ) -> Rc<JumpTable> {
        if let Some(table) = self.tables.borrow().get(&id) {
            return table.clone();
        }
        let table = Rc::new(JumpTable::build(id, cases, block_sizes));
        self.tables.borrow_mut().insert(id, table.clone());
        table
    }
}

/// What the global error sink observes about a failing machine.
pub trait MachineHandle {
    /// The task's name.
    fn task_name(&self) -> &'static str;
    /// The step the fault was raised at.
    fn step_id(&self) -> StepId;
    /// Whether the machine already finished.
    fn is_finished(&self) -> bool;
    /// Whether resumptions are outstanding.
    fn is_waiting(&self) -> bool;
}

impl<C: Locals> MachineHandle for Machine<C> {
    fn task_name(&self) -> &'static str {
        self.name()
    }

    fn step_id(&self) -> StepId {
        Machine::step_id(self)
    }

    fn is_finished(&self) -> bool {
        Machine::is_finished(self)
    }

    fn is_waiting(&self) -> bool {
        Machine::is_waiting(self)
    }
}

type ErrorSink = Rc<dyn Fn(&Fault, &Rc<dyn MachineHandle>)>;

thread_local! {
    static ON_ERROR: RefCell<Option<ErrorSink>> = RefCell::new(None);
}

/// Installs the process-wide error sink, invoked (deferred) with every
/// fault a task raises, together with a handle to the raising machine.
/// The sink observes faults; it does not suppress them.
pub fn set_on_error(sink: impl Fn(&Fault, &Rc<dyn MachineHandle>) + 'static) {
    ON_ERROR.with(|slot| *slot.borrow_mut() = Some(Rc::new(sink)));
}

/// Removes the error sink.
pub fn clear_on_error() {
    ON_ERROR.with(|slot| *slot.borrow_mut() = None);
}

fn notify_sink(fault: Fault, handle: Rc<dyn MachineHandle>) {
    let installed = ON_ERROR.with(|slot| slot.borrow().clone());
    if let Some(sink) = installed {
        later(move || sink(&fault, &handle));
    }
}
