// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::Pin;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Poll, Waker};

use cordyceps::{Linked, List, list};
use spin::Mutex;

use crate::time::{Clock, Ticks};

/// Tracks pending [`Sleep`][crate::time::Sleep] deadlines and fires them as
/// its [`Clock`] advances.
///
/// The timer does not run by itself; somebody (normally the
/// [`Worker`][crate::executor::Worker] loop) has to [`turn`][Timer::turn] it.
#[derive(Debug)]
pub struct Timer {
    pub(in crate::time) clock: Clock,
    pub(in crate::time) core: Mutex<Core>,
}

/// The deadline-ordered list of pending entries.
///
/// Entries live inside `Sleep` futures; they are linked here while registered
/// and are unlinked when they fire or when the owning future is dropped.
#[derive(Debug)]
pub(in crate::time) struct Core {
    /// The ticks that have elapsed since the timer started.
    now: Ticks,
    /// Pending entries, soonest deadline first.
    entries: List<Entry>,
}

/// An entry in the timer's deadline list.
#[derive(Debug)]
pub(in crate::time) struct Entry {
    pub(in crate::time) deadline: Ticks,
    /// Set while the entry is linked into [`Core::entries`]. Only mutated with
    /// the core lock held.
    pub(in crate::time) is_registered: AtomicBool,
    /// The currently-registered waker.
    waker: Mutex<Option<Waker>>,
    links: list::Links<Entry>,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

// === impl Timer ===

impl Timer {
    #[must_use]
    pub const fn new(clock: Clock) -> Self {
        Self {
            clock,
            core: Mutex::new(Core::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Advances the timer to the clock's current tick, firing every entry
    /// whose deadline has been reached.
    ///
    /// Returns the number of entries fired and the next pending deadline, if
    /// any.
    pub fn turn(&self) -> (usize, Option<Ticks>) {
        let mut wakers = Vec::new();

        let (expired, next_deadline) = {
            let mut core = self.core.lock();
            let mut now = self.clock.now_ticks();

            if now < core.now {
                tracing::warn!("time went backwards!");
                now = core.now;
            }

            core.advance(now, &mut wakers)
        };

        // now that the lock is released, wake the tasks whose sleeps fired.
        for waker in wakers {
            waker.wake();
        }

        (expired, next_deadline)
    }
}

// === impl Core ===

impl Core {
    const fn new() -> Self {
        Self {
            now: Ticks(0),
            entries: List::new(),
        }
    }

    fn advance(&mut self, now: Ticks, wakers: &mut Vec<Waker>) -> (usize, Option<Ticks>) {
        let mut expired = 0;
        let mut next_deadline = None;

        while let Some(ptr) = self.entries.pop_front() {
            // Safety: upon registering the caller promised the entry stays
            // valid until it is unlinked.
            let entry = unsafe { ptr.as_ref() };

            if entry.deadline > now {
                next_deadline = Some(entry.deadline);
                self.entries.push_front(ptr);
                break;
            }

            tracing::trace!(deadline = entry.deadline.0, now = now.0, "firing sleep");
            expired += 1;
            if let Some(waker) = entry.fire() {
                wakers.push(waker);
            }
        }

        self.now = now;
        (expired, next_deadline)
    }

    /// Links `ptr` into the deadline list, or reports `Ready` if its deadline
    /// has already passed.
    ///
    /// # Safety
    ///
    /// The entry must stay valid until it fires or is [`cancel`]ed, and must
    /// not be registered twice.
    ///
    /// [`cancel`]: Core::cancel
    pub(in crate::time) unsafe fn register(&mut self, ptr: NonNull<Entry>) -> Poll<()> {
        // Safety: callers responsibility
        let entry = unsafe { ptr.as_ref() };

        tracing::trace!(deadline = entry.deadline.0, now = self.now.0, "registering sleep");

        if entry.deadline <= self.now {
            return Poll::Ready(());
        }

        let _was_registered = entry.is_registered.swap(true, Ordering::AcqRel);
        debug_assert!(
            !_was_registered,
            "tried to register a sleep that was already registered"
        );

        self.insert_sorted(ptr);
        Poll::Pending
    }

    pub(in crate::time) fn cancel(&mut self, entry: Pin<&mut Entry>) {
        // Safety: we never move out of the pointer, it is only used to unlink
        // the entry from the list.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(entry)) };

        // Safety: `is_registered` is only mutated with the core lock held, so
        // a set bit means the entry is linked in `self.entries`.
        unsafe {
            if ptr.as_ref().is_registered.swap(false, Ordering::AcqRel) {
                tracing::trace!("canceling sleep");
                self.entries.remove(ptr);
            }
        }
    }

    fn insert_sorted(&mut self, ptr: NonNull<Entry>) {
        // Safety: see `register`.
        let deadline = unsafe { ptr.as_ref().deadline };

        // walk entries with earlier deadlines off the front, park the new
        // entry behind them, then put them back. Insertion after equal
        // deadlines keeps firing order FIFO.
        let mut earlier = List::<Entry>::new();
        while let Some(head) = self.entries.pop_front() {
            // Safety: see `register`.
            if unsafe { head.as_ref().deadline } > deadline {
                self.entries.push_front(head);
                break;
            }
            earlier.push_back(head);
        }

        earlier.push_back(ptr);
        while let Some(tail) = earlier.pop_back() {
            self.entries.push_front(tail);
        }
    }
}

// === impl Entry ===

impl Entry {
    pub(in crate::time) const fn new(deadline: Ticks) -> Self {
        Self {
            deadline,
            is_registered: AtomicBool::new(false),
            waker: Mutex::new(None),
            links: list::Links::new(),
            _pin: PhantomPinned,
        }
    }

    /// Stores the waker to be woken when this entry fires.
    pub(in crate::time) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match &*slot {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Marks the entry as fired, handing back the waker to invoke once the
    /// core lock has been released.
    fn fire(&self) -> Option<Waker> {
        let _was_registered = self.is_registered.swap(false, Ordering::AcqRel);
        debug_assert!(_was_registered, "fired a sleep that was not registered");
        self.waker.lock().take()
    }
}

// Safety: entries are only ever linked into and unlinked from a list with the
// owning timer's core lock held, and the pinned entry outlives its linkage.
unsafe impl Linked<list::Links<Entry>> for Entry {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

#[cfg(test)]
mod tests {
    use core::future::Future;
    use core::pin::pin;
    use core::sync::atomic::AtomicU64;
    use core::task::{Context, Poll};
    use core::time::Duration;

    use futures::task::noop_waker;

    use super::*;
    use crate::time::sleep;

    #[test]
    fn turn_fires_in_deadline_order() {
        static NOW: AtomicU64 = AtomicU64::new(0);
        fn now() -> u64 {
            NOW.load(Ordering::Relaxed)
        }

        let timer = Timer::new(Clock::new(Duration::from_micros(1), now).named("test clock"));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut early = pin!(sleep(&timer, Duration::from_micros(10)).unwrap());
        let mut late = pin!(sleep(&timer, Duration::from_micros(20)).unwrap());

        assert!(late.as_mut().poll(&mut cx).is_pending());
        assert!(early.as_mut().poll(&mut cx).is_pending());

        NOW.store(15, Ordering::Relaxed);
        let (expired, next_deadline) = timer.turn();
        assert_eq!(expired, 1);
        assert_eq!(next_deadline, Some(Ticks(20)));

        assert!(early.as_mut().poll(&mut cx).is_ready());
        assert!(late.as_mut().poll(&mut cx).is_pending());

        NOW.store(25, Ordering::Relaxed);
        let (expired, next_deadline) = timer.turn();
        assert_eq!(expired, 1);
        assert_eq!(next_deadline, None);
        assert!(late.as_mut().poll(&mut cx).is_ready());
    }

    #[test]
    fn dropped_sleep_is_unlinked() {
        static NOW: AtomicU64 = AtomicU64::new(0);
        fn now() -> u64 {
            NOW.load(Ordering::Relaxed)
        }

        let timer = Timer::new(Clock::new(Duration::from_micros(1), now).named("test clock"));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        {
            let mut cancelled = pin!(sleep(&timer, Duration::from_micros(10)).unwrap());
            assert!(cancelled.as_mut().poll(&mut cx).is_pending());
        }

        NOW.store(50, Ordering::Relaxed);
        let (expired, next_deadline) = timer.turn();
        assert_eq!(expired, 0);
        assert_eq!(next_deadline, None);
    }

    #[test]
    fn expired_deadline_is_ready_immediately() {
        static NOW: AtomicU64 = AtomicU64::new(100);
        fn now() -> u64 {
            NOW.load(Ordering::Relaxed)
        }

        let timer = Timer::new(Clock::new(Duration::from_micros(1), now).named("test clock"));
        // advance the core past the anchor so already-elapsed deadlines are
        // recognized at registration.
        timer.turn();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut zero = pin!(sleep(&timer, Duration::ZERO).unwrap());
        assert_eq!(zero.as_mut().poll(&mut cx), Poll::Ready(()));
    }
}
