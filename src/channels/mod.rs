// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! weft::channels provides the channel library: the rendezvous base
//! channel, take-side transforms, buffering and rate shapers, and the
//! composition tools (merge, clock, resolve).
//!
//! Everything here hangs off [`Channel`]. Derived channels share their
//! source's queues by delegation: a transform intercepts `take`, a shaper
//! intercepts `put`, and both chain teardown through `end`.

pub(crate) mod channel;
mod compose;
mod shapers;
mod transforms;

pub use channel::{AckFn, Channel, Service, TakeFn};
pub use compose::{clock, resolve, Clock, Merge, Resolvable, Sourced};
pub use shapers::Fanout;
