// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use core::task::{Context, Poll};
use core::time::Duration;

use pin_project::{pin_project, pinned_drop};

use crate::time::timer::Entry;
use crate::time::{Instant, TimeError, Timer};

/// Wait until `duration` has elapsed.
///
/// # Errors
///
/// Returns [`TimeError::DurationTooLong`] if `duration` exceeds the clock's
/// maximum.
pub fn sleep(timer: &Timer, duration: Duration) -> Result<Sleep<'_>, TimeError> {
    let ticks = timer.clock.duration_to_ticks(duration)?;
    Ok(Sleep::new(timer, timer.clock.now() + ticks))
}

/// Wait until `deadline` has been reached.
///
/// A deadline in the past completes on the first poll.
pub fn sleep_until(timer: &Timer, deadline: Instant) -> Sleep<'_> {
    Sleep::new(timer, deadline)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unregistered,
    Registered,
    Completed,
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep<'timer> {
    state: State,
    timer: &'timer Timer,
    #[pin]
    entry: Entry,
}

impl<'timer> Sleep<'timer> {
    fn new(timer: &'timer Timer, deadline: Instant) -> Self {
        Self {
            state: State::Unregistered,
            timer,
            entry: Entry::new(deadline.as_ticks()),
        }
    }
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut me = self.as_mut().project();

        match me.state {
            State::Unregistered => {
                let mut core = me.timer.core.lock();

                // store the waker before linking: once the entry is in the
                // list a turn may fire it, and firing takes the waker.
                me.entry.set_waker(cx.waker());

                // Safety: the timer impl promises to treat the pointer as
                // pinned, and the entry is unlinked before this future drops.
                let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(me.entry.as_mut())) };

                // Safety: we just created the pointer from a pinned reference
                // and this future registers it at most once.
                match unsafe { core.register(ptr) } {
                    Poll::Ready(()) => {
                        *me.state = State::Completed;
                        Poll::Ready(())
                    }
                    Poll::Pending => {
                        *me.state = State::Registered;
                        Poll::Pending
                    }
                }
            }
            State::Registered if me.entry.is_registered.load(Ordering::Acquire) => {
                me.entry.set_waker(cx.waker());
                Poll::Pending
            }
            _ => {
                *me.state = State::Completed;
                Poll::Ready(())
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Sleep<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        // we only need to unlink the entry from the timer if it's currently
        // part of the deadline list --- if the future hasn't been polled yet,
        // or it has already fired, there is nothing to remove.
        if this.entry.is_registered.load(Ordering::Acquire) {
            let mut core = this.timer.core.lock();
            core.cancel(this.entry);
        }
    }
}

impl fmt::Debug for Sleep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("state", &self.state)
            .field("deadline", &self.entry.deadline)
            .finish_non_exhaustive()
    }
}
