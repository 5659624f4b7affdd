// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rendezvous channels for a small cooperative async runtime.
//!
//! A channel here is a *pair* of [`Port`]s. Sending through one port delivers
//! to a receiver on the other; neither side proceeds until both have arrived,
//! and the payload moves in a single copy between the two callers' buffers.
//! There is no buffer inside the channel.
//!
//! On top of the bare rendezvous the crate provides:
//!
//! - [`select`], a multi-way wait over any mix of send and receive clauses
//!   that completes when the first one does,
//! - per-operation deadlines via [`time::timeout`] and the non-blocking
//!   `try_` variants,
//! - one-shot poisoning of a direction ([`Port::done`]) and two-phase
//!   teardown ([`Port::close`]),
//! - a single-threaded [`executor`] with a deadline-driven [`time::Timer`]
//!   to run it all.
//!
//! All suspension is cancellation-safe: dropping a send, receive, sleep or
//! select future unlinks its wait clauses before the storage goes away.
//!
//! [`Port`]: sync::chan::Port
//! [`Port::done`]: sync::chan::Port::done
//! [`Port::close`]: sync::chan::Port::close
//! [`select`]: sync::select::select

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod executor;
pub mod park;
pub mod sync;
pub mod time;

#[cfg(test)]
mod test_util;
