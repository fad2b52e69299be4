// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! # Weft - channels and task machines for single-threaded cooperative programs.
//!
//! ## What is Weft
//!
//! Weft is a concurrency substrate for single-threaded, cooperatively
//! scheduled, callback-driven programs. It has two tightly coupled halves:
//!
//! * a **channel library**: first-class, composable asynchronous queues
//!   that synchronize producers and consumers through continuations, and
//!   that can be transformed (`map`/`filter`/`reduce`/`group`), combined
//!   (`merge`/`fanout`/`tap`), buffered (fixed, dropping, expiring,
//!   bucket), rate-shaped (`debounce`), time-sourced (`clock`, timed
//!   puts) and terminated;
//! * a **task state-machine runtime**: the execution engine a compiler
//!   front end targets when it lowers structured asynchronous procedures
//!   — try/catch/finally, retry, switch, suspension points — into a
//!   numbered step machine.
//!
//! Both halves rest on one primitive: deferred dispatch ([`later`]),
//! which runs a continuation after the current stack unwinds, in FIFO
//! order within a tick. Because only one continuation runs at a time,
//! the programmer never needs locks; suspension happens only at channel
//! boundaries and is always observable.
//!
//! ## Channels
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use weft::{enclose, Channel, LocalExecutor};
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let ex = LocalExecutor::make_default();
//! ex.run(enclose! { (seen) move || {
//!     let ch = Channel::new();
//!     let evens = ch.filter(|v: &i32| v % 2 == 0).map(|v| v * 10);
//!     for i in 0..6 {
//!         ch.put(i);
//!     }
//!     ch.finish();
//!     evens.take_n(10, move |batch| {
//!         *seen.borrow_mut() = batch.unwrap();
//!     });
//! }});
//! assert_eq!(*seen.borrow(), vec![0, 20, 40]);
//! ```
//!
//! A producer can ask to be told when its value was consumed by putting
//! with an ack; buffering shapers change when that ack fires (see
//! [`Channel::buffer`], [`Channel::dropping_buffer`] and friends). The
//! value `Ok(None)` is the universal end-of-stream sentinel, produced by
//! [`Channel::finish`].
//!
//! ## Tasks
//!
//! The task runtime executes compiled step functions: a single dispatch
//! on the current step id, driven through [`Machine`]. Structured
//! unwinding — finallies, catches, retry, joins — is a stack of records
//! the compiled code pushes and the runtime pops. See the [`task`]
//! module documentation for the conventions compiled code follows.
//!
//! ## Scheduling model
//!
//! Single-threaded and cooperative. Within one tick, ready continuations
//! run in FIFO order with no interleaving between steps of different
//! tasks. Values are delivered in put order per channel; there is no
//! ordering across channels unless you [`Merge`] them.
//!
//! [`later`]: crate::later
//! [`Machine`]: crate::Machine
//! [`Merge`]: crate::Merge

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(test)]
macro_rules! test_executor {
    ($body:expr) => {{
        let local_ex = crate::executor::LocalExecutor::make_default();
        local_ex.run(|| $body);
    }};
}

pub mod channels;
mod error;
mod executor;
pub mod streams;
pub mod task;

pub use crate::channels::{clock, resolve, AckFn, Channel, Clock, Fanout, Merge, Resolvable, Service, Sourced, TakeFn};
pub use crate::error::{Fault, FaultKind, Received};
pub use crate::executor::{later, LocalExecutor, LocalExecutorBuilder};
pub use crate::task::{
    clear_on_error, set_on_error, CaseKey, JumpTable, Locals, Machine, MachineHandle, Resume,
    StepFn, StepId,
};
pub use enclose::enclose;

/// Provides common imports that almost all Weft applications will need.
pub mod prelude {
    pub use crate::{enclose, later, Channel, Fault, LocalExecutor, Received};
}
