// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;
use std::sync::OnceLock;
use std::time::Instant as StdInstant;

use crate::time::Clock;

static ANCHOR: OnceLock<StdInstant> = OnceLock::new();

#[expect(
    clippy::cast_possible_truncation,
    reason = "if your tests are running for 584.942 years you have other problems I think"
)]
fn std_now() -> u64 {
    ANCHOR.get_or_init(StdInstant::now).elapsed().as_micros() as u64
}

/// A microsecond-precision [`Clock`] backed by the host's monotonic clock.
pub(crate) fn std_clock() -> Clock {
    Clock::new(Duration::from_micros(1), std_now).named("std test clock")
}
