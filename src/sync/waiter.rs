// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomPinned;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Waker;

use cordyceps::{Linked, list};

use super::chan::ChanError;

/// Which way a clause moves data.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum Dir {
    Tx,
    Rx,
}

/// The caller's buffer, captured for the duration of a parked operation.
///
/// The pointers borrow the buffers owned by the operation's future; they stay
/// valid while the clause is linked because the future unlinks the clause
/// before it is dropped.
#[derive(Copy, Clone, Debug)]
pub(super) enum Payload {
    /// Nothing captured yet.
    Empty,
    /// A parked sender's bytes.
    Tx { ptr: *const u8, len: usize },
    /// A parked receiver's buffer.
    Rx { ptr: *mut u8, len: usize },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum WaitState {
    /// Not yet linked. The clause can be dropped without unlinking.
    Start,
    /// Linked into a waiter queue. The clause **must** be unlinked before it
    /// is dropped; failing to do so leaves dangling pointers in the queue.
    Linked,
    /// Resolved and unlinked, carrying the outcome of the operation.
    Done(Result<(), ChanError>),
    /// Unlinked without resolving: a sibling clause of the same multi-way
    /// wait fired first, so this one can never rendezvous.
    Revoked,
}

/// A pending channel operation, linkable into a half-channel's waiter queue.
///
/// Waiters live inside the futures of parked operations; linking them is what
/// parks an operation and resolving them is what resumes it. Every field is
/// guarded by the owning channel's lock, which is why the accessors are
/// `unsafe` and take raw pointers: the pointee may be shared with the queue.
#[repr(C)]
pub(super) struct Waiter {
    node: UnsafeCell<Node>,
}

#[repr(C)]
struct Node {
    /// Intrusive linked list pointers.
    ///
    /// This *must* be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    links: list::Links<Waiter>,
    state: WaitState,
    payload: Payload,
    /// Clause identifier reported to multi-way waits.
    tag: usize,
    /// Claim flag shared by every clause registered together in one
    /// multi-way wait; `None` for single operations. The first clause of a
    /// group to be triggered takes the flag, and siblings a peer pops
    /// afterwards are [revoked](WaitState::Revoked) instead of completed.
    group: Option<Arc<AtomicBool>>,
    /// The waker of the task that owns this clause.
    waker: Option<Waker>,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

// === impl Waiter ===

impl Waiter {
    pub(super) const fn new() -> Self {
        Self {
            node: UnsafeCell::new(Node {
                links: list::Links::new(),
                state: WaitState::Start,
                payload: Payload::Empty,
                tag: 0,
                group: None,
                waker: None,
                _pin: PhantomPinned,
            }),
        }
    }

    /// Fills in the clause and marks it [`WaitState::Linked`]; the caller
    /// links it into the matching queue.
    ///
    /// # Safety
    ///
    /// The owning channel's lock must be held, and the payload pointers must
    /// stay valid until the clause is resolved or unlinked.
    pub(super) unsafe fn prepare(
        this: NonNull<Self>,
        payload: Payload,
        tag: usize,
        group: Option<Arc<AtomicBool>>,
        waker: Waker,
    ) {
        // Safety: the channel lock serializes access to the node.
        let node = unsafe { &mut *this.as_ref().node.get() };
        debug_assert!(matches!(node.state, WaitState::Start));
        node.payload = payload;
        node.tag = tag;
        node.group = group;
        node.waker = Some(waker);
        node.state = WaitState::Linked;
    }

    /// Tries to take an unlinked clause for resolution.
    ///
    /// Returns `false` if the clause belongs to a multi-way wait whose group
    /// was already claimed by an earlier trigger. Such a clause can never
    /// rendezvous anymore; it is marked [`WaitState::Revoked`] here, without
    /// waking anybody (the owning task was woken when the group was claimed),
    /// and must not be [`complete`](Waiter::complete)d.
    ///
    /// # Safety
    ///
    /// The owning channel's lock must be held and the clause must already be
    /// removed from its queue.
    pub(super) unsafe fn claim(this: NonNull<Self>) -> bool {
        // Safety: the channel lock serializes access to the node.
        let node = unsafe { &mut *this.as_ref().node.get() };
        debug_assert!(matches!(node.state, WaitState::Linked));

        if let Some(group) = &node.group {
            if group.swap(true, Ordering::AcqRel) {
                node.state = WaitState::Revoked;
                node.waker = None;
                return false;
            }
        }

        true
    }

    /// # Safety
    ///
    /// The owning channel's lock must be held.
    pub(super) unsafe fn state(this: NonNull<Self>) -> WaitState {
        // Safety: the channel lock serializes access to the node.
        unsafe { (*this.as_ref().node.get()).state.clone() }
    }

    /// # Safety
    ///
    /// The owning channel's lock must be held.
    pub(super) unsafe fn payload(this: NonNull<Self>) -> Payload {
        // Safety: the channel lock serializes access to the node.
        unsafe { (*this.as_ref().node.get()).payload }
    }

    /// # Safety
    ///
    /// The owning channel's lock must be held.
    pub(super) unsafe fn tag(this: NonNull<Self>) -> usize {
        // Safety: the channel lock serializes access to the node.
        unsafe { (*this.as_ref().node.get()).tag }
    }

    /// # Safety
    ///
    /// The owning channel's lock must be held.
    pub(super) unsafe fn update_waker(this: NonNull<Self>, waker: &Waker) {
        // Safety: the channel lock serializes access to the node.
        let node = unsafe { &mut *this.as_ref().node.get() };
        match &node.waker {
            Some(current) if current.will_wake(waker) => {}
            _ => node.waker = Some(waker.clone()),
        }
    }

    /// Resolves an unlinked clause with `outcome`, handing back the waker to
    /// invoke once the channel lock has been released.
    ///
    /// # Safety
    ///
    /// The owning channel's lock must be held and the clause must already be
    /// removed from its queue.
    pub(super) unsafe fn complete(
        this: NonNull<Self>,
        outcome: Result<(), ChanError>,
    ) -> Option<Waker> {
        // Safety: the channel lock serializes access to the node.
        let node = unsafe { &mut *this.as_ref().node.get() };
        debug_assert!(matches!(node.state, WaitState::Linked));
        node.state = WaitState::Done(outcome);
        node.waker.take()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").finish_non_exhaustive()
    }
}

// Safety: a Waiter is only ever touched with the owning channel's lock held;
// the payload pointers it carries borrow buffers owned by the same future
// that owns the Waiter.
unsafe impl Send for Waiter {}
// Safety: see above.
unsafe impl Sync for Waiter {}

// Safety: waiters are only linked into and unlinked from a queue with the
// owning channel's lock held, and a linked waiter outlives its linkage (the
// owning future unlinks it before dropping).
unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Waiter>> {
        // Safety: ensured by caller
        unsafe {
            // Safety: using `ptr::addr_of!` avoids creating a temporary
            // reference, which stacked borrows dislikes.
            let node = &*ptr::addr_of!((*target.as_ptr()).node);
            let links = ptr::addr_of_mut!((*node.get()).links);
            // Safety: since the `target` pointer is `NonNull`, we can assume
            // that pointers to its members are also not null, making this use
            // of `new_unchecked` fine.
            NonNull::new_unchecked(links)
        }
    }
}
