// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    cell::RefCell,
    fmt::{self, Debug},
    io,
    rc::Rc,
};
use thiserror::Error;

use crate::task::StepId;

/// What a taker or an ack observes: a value, the end of the stream
/// (`Ok(None)`), or a [`Fault`].
///
/// `Ok(None)` is the end-of-stream sentinel. Every consumer in this crate
/// (`take_n`, `until`, fan-out, merge readers, task loops) treats it as
/// "this source is finished".
pub type Received<T> = std::result::Result<Option<T>, Fault>;

/// The different kinds of failure a [`Fault`] can carry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FaultKind {
    /// Returned through a `put` ack when the target channel has been
    /// converted to a constant source with [`fill`].
    ///
    /// [`fill`]: crate::Channel::fill
    #[error("channel is filled")]
    Filled,

    /// A failure raised by application code.
    #[error("{0}")]
    Message(String),
}

struct Inner {
    kind: FaultKind,
    trace: RefCell<Vec<String>>,
}

/// A failure traveling through channels and task frames.
///
/// `Fault` is cheap to clone: every copy shares the same inner record, and
/// the task runtime appends a `task:step` frame to the shared trace each
/// time the failure crosses a task boundary. That makes the trace an
/// append-only account of how the error bubbled up, paid for only on the
/// error path.
///
/// # Examples
///
/// ```
/// use weft::Fault;
///
/// let fault = Fault::new("connection lost");
/// assert_eq!(fault.to_string(), "connection lost");
/// assert!(!fault.is_filled());
/// assert!(fault.trace().is_empty());
/// ```
#[derive(Clone)]
pub struct Fault {
    inner: Rc<Inner>,
}

impl Fault {
    /// Creates a fault carrying an application message.
    pub fn new(message: impl Into<String>) -> Fault {
        Fault::from_kind(FaultKind::Message(message.into()))
    }

    pub(crate) fn filled() -> Fault {
        Fault::from_kind(FaultKind::Filled)
    }

    fn from_kind(kind: FaultKind) -> Fault {
        Fault {
            inner: Rc::new(Inner {
                kind,
                trace: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The kind of failure this fault carries.
    pub fn kind(&self) -> &FaultKind {
        &self.inner.kind
    }

    /// Whether this is the channel-protocol error produced by putting into
    /// a filled channel.
    pub fn is_filled(&self) -> bool {
        self.inner.kind == FaultKind::Filled
    }

    /// The `task:step` frames accumulated while this fault bubbled through
    /// task machines, oldest first.
    pub fn trace(&self) -> Vec<String> {
        self.inner.trace.borrow().clone()
    }

    pub(crate) fn push_frame(&self, task: &str, step: StepId) {
        self.inner
            .trace
            .borrow_mut()
            .push(format!("{}:{}", task, step));
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.kind, f)
    }
}

impl Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.inner.kind)
            .field("trace", &*self.inner.trace.borrow())
            .finish()
    }
}

impl std::error::Error for Fault {}

impl From<Fault> for io::Error {
    fn from(fault: Fault) -> Self {
        let kind = match fault.kind() {
            FaultKind::Filled => io::ErrorKind::BrokenPipe,
            FaultKind::Message(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, fault.to_string())
    }
}
