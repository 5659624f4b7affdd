// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

/// Puts the worker to sleep between scheduler ticks.
///
/// The runtime is single-threaded: every wakeup originates on the worker
/// itself, either from a task it just polled or from turning the timer. A
/// `Park` implementation therefore only has to respect timer deadlines; there
/// is no cross-thread unpark channel.
pub trait Park {
    /// Park with no deadline. Called when there are no runnable tasks and no
    /// armed timers.
    fn park(&mut self);

    /// Park for at most `duration`, the time until the next timer deadline.
    fn park_timeout(&mut self, duration: Duration);
}

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        /// A [`Park`] implementation backed by the host thread.
        #[derive(Debug, Default)]
        pub struct StdPark;

        impl StdPark {
            #[must_use]
            pub const fn new() -> Self {
                Self
            }
        }

        impl Park for StdPark {
            fn park(&mut self) {
                std::thread::park();
            }

            fn park_timeout(&mut self, duration: Duration) {
                std::thread::sleep(duration);
            }
        }
    }
}
