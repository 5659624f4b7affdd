// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Unbuffered, bidirectional rendezvous channels.
//!
//! A channel is a pair of [`Port`]s. Either port can send and receive;
//! sending through one delivers to a receiver on the other. A transfer
//! happens only when both sides have arrived — the payload is copied once,
//! directly from the sender's buffer into the receiver's, and there is no
//! intermediate storage. Whoever arrives first parks until the peer shows up,
//! a deadline expires, or the channel is torn down.
//!
//! # Teardown
//!
//! [`Port::done`] poisons one *direction*: subsequent sends into it and
//! receives out of it fail with [`ChanError::Closed`], while the opposite
//! direction keeps working. [`Port::close`] (also run on drop) retires a
//! port; once both ports are closed every still-parked operation on the pair
//! is resumed with [`ChanError::Closed`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};

use cordyceps::List;
use pin_project::{pin_project, pinned_drop};
use spin::Mutex;

use super::waiter::{Dir, Payload, WaitState, Waiter};

/// Creates a connected pair of ports on the heap.
///
/// The pair's storage is released when the last port (and the last operation
/// borrowing from it) goes away.
#[must_use]
pub fn pair() -> (Port, Port) {
    let chan = Arc::new(Chan::new());
    (
        Port {
            chan: ChanRef::Counted(chan.clone()),
            side: 0,
        },
        Port {
            chan: ChanRef::Counted(chan),
            side: 1,
        },
    )
}

/// Error returned by channel operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChanError {
    /// The direction travelled has been poisoned by [`Port::done`], or both
    /// ports have been closed.
    Closed,
    /// Sender and receiver disagreed on the payload length. Both sides fail
    /// with this error and neither buffer is modified.
    LenMismatch {
        /// This side's payload length.
        local: usize,
        /// The peer's payload length.
        remote: usize,
    },
    /// The deadline elapsed (or, for `try_` operations, no peer was parked)
    /// before a rendezvous happened.
    TimedOut,
}

/// A channel: two half-channels allocated and torn down as one unit.
///
/// Normally constructed on the heap via [`pair`]. `Chan::new` is `const`, so
/// a channel can also live in a `static` and be [`split`](Chan::split) into
/// ports; such storage is simply never deallocated.
pub struct Chan {
    pub(super) shared: Mutex<Shared>,
}

/// One endpoint of a channel.
///
/// Ports are not `Clone`; tasks racing on the same endpoint share it through
/// `&Port` or `Arc<Port>`. Dropping a port [`close`](Port::close)s it.
pub struct Port {
    chan: ChanRef,
    side: usize,
}

enum ChanRef {
    Counted(Arc<Chan>),
    Static(&'static Chan),
}

/// State shared by the two halves, guarded by one lock.
pub(super) struct Shared {
    halves: [HalfState; 2],
}

/// Per-half record. Everything concerning the traffic *arriving at* a half
/// lives on that half: its parked receivers, the senders parked to deliver to
/// it, and the poison bit for that direction.
struct HalfState {
    /// Receivers parked on this half, FIFO.
    rx_queue: List<Waiter>,
    /// Senders parked to deliver into this half, FIFO.
    tx_queue: List<Waiter>,
    /// The direction arriving at this half has been poisoned.
    done: bool,
    /// The port for this half has been closed.
    closed: bool,
}

/// Outcome of attempting the non-parking phase of an operation.
pub(super) enum Start {
    /// Paired with a parked peer clause; `waker` must be woken once the
    /// channel lock has been released.
    Rendezvous {
        waker: Option<Waker>,
        result: Result<(), ChanError>,
    },
    /// The operation failed without touching any queue.
    Refused(ChanError),
    /// No peer is parked; the operation may park.
    NoPeer,
}

/// A send or receive, borrowing the caller's buffer.
pub(super) enum OpRef<'a> {
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
}

// === impl Chan ===

impl Chan {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                halves: [HalfState::new(), HalfState::new()],
            }),
        }
    }

    /// Returns the channel's two ports.
    ///
    /// This is the allocation-free counterpart to [`pair`], for channels
    /// placed in a `static`. It should be called once; further calls hand out
    /// additional ports onto the same (possibly already closed) halves.
    #[must_use]
    pub fn split(&'static self) -> (Port, Port) {
        (
            Port {
                chan: ChanRef::Static(self),
                side: 0,
            },
            Port {
                chan: ChanRef::Static(self),
                side: 1,
            },
        )
    }

    fn done_side(&self, side: usize) -> Result<(), ChanError> {
        let mut wakers = Vec::new();

        {
            let mut shared = self.shared.lock();
            if shared.halves[side].closed {
                return Err(ChanError::Closed);
            }

            // sending through `side` delivers to the peer half, so that is
            // where the poison bit and the affected waiters live.
            let target = &mut shared.halves[side ^ 1];
            if target.done {
                return Err(ChanError::Closed);
            }
            target.done = true;

            tracing::trace!(side, "direction poisoned");
            drain(&mut target.rx_queue, &mut wakers);
            drain(&mut target.tx_queue, &mut wakers);
        }

        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    fn close_side(&self, side: usize) {
        let mut wakers = Vec::new();

        {
            let mut shared = self.shared.lock();
            if shared.halves[side].closed {
                return;
            }
            shared.halves[side].closed = true;
            tracing::trace!(side, "half closed");

            if !shared.halves[side ^ 1].closed {
                // the peer port is still live; its owner may legitimately
                // keep rendezvousing, so no waiter is disturbed.
                return;
            }

            // second close: resume everything still parked on either half.
            tracing::trace!("both halves closed, tearing down");
            for half in &mut shared.halves {
                drain(&mut half.rx_queue, &mut wakers);
                drain(&mut half.tx_queue, &mut wakers);
            }
        }

        for waker in wakers {
            waker.wake();
        }
    }
}

impl Default for Chan {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chan").finish_non_exhaustive()
    }
}

// Safety: all of `Shared` (queues included) is only accessed with the lock
// held; linked waiters are kept alive by the futures that own them until they
// are unlinked.
unsafe impl Send for Chan {}
// Safety: see above.
unsafe impl Sync for Chan {}

/// Resolves every clause in `queue` with [`ChanError::Closed`], collecting
/// the wakers to invoke after the lock is released.
fn drain(queue: &mut List<Waiter>, wakers: &mut Vec<Waker>) {
    while let Some(clause) = queue.pop_front() {
        // Safety: the caller holds the channel lock, and popped clauses are
        // unlinked by definition.
        unsafe {
            // a clause whose multi-way wait already fired is revoked by
            // `claim` and must not be resolved a second time.
            if !Waiter::claim(clause) {
                continue;
            }
            if let Some(waker) = Waiter::complete(clause, Err(ChanError::Closed)) {
                wakers.push(waker);
            }
        }
    }
}

// === impl Shared ===

impl Shared {
    /// Runs the entry checks and the fast path of an operation: pair with a
    /// parked peer clause if one exists.
    ///
    /// This runs before any deadline is consulted, so an operation whose peer
    /// is already parked completes even when its deadline has passed.
    pub(super) fn start(&mut self, side: usize, op: &mut OpRef<'_>) -> Start {
        if self.halves[side].closed {
            return Start::Refused(ChanError::Closed);
        }

        let station = station(side, op.dir());
        if self.halves[station].done {
            return Start::Refused(ChanError::Closed);
        }

        let peer = loop {
            let candidate = match op {
                OpRef::Tx(_) => self.halves[station].rx_queue.pop_front(),
                OpRef::Rx(_) => self.halves[station].tx_queue.pop_front(),
            };
            let Some(candidate) = candidate else {
                return Start::NoPeer;
            };

            // Safety: we hold the lock and just unlinked the candidate.
            if unsafe { Waiter::claim(candidate) } {
                break candidate;
            }
            // a sibling clause of the candidate's multi-way wait fired first;
            // the candidate is discarded and the next waiter considered.
            tracing::trace!(side, "skipping revoked clause");
        };

        // Safety: we hold the lock and `peer` is unlinked and claimed.
        let (result, peer_outcome) = unsafe { rendezvous(op, peer) };
        tracing::trace!(side, ok = result.is_ok(), "rendezvous");

        // Safety: lock held, peer unlinked.
        let waker = unsafe { Waiter::complete(peer, peer_outcome) };
        Start::Rendezvous { waker, result }
    }

    /// Links a prepared clause at the tail of the queue it belongs on.
    pub(super) fn park(&mut self, side: usize, dir: Dir, waiter: NonNull<Waiter>) {
        let station = station(side, dir);
        match dir {
            Dir::Tx => self.halves[station].tx_queue.push_back(waiter),
            Dir::Rx => self.halves[station].rx_queue.push_back(waiter),
        }
    }

    /// Unlinks a still-parked clause, cancelling it.
    pub(super) fn unlink(&mut self, side: usize, dir: Dir, waiter: NonNull<Waiter>) {
        let station = station(side, dir);
        // Safety: the caller checked the clause is `Linked`, which with the
        // lock held means it is in exactly this queue.
        unsafe {
            match dir {
                Dir::Tx => self.halves[station].tx_queue.remove(waiter),
                Dir::Rx => self.halves[station].rx_queue.remove(waiter),
            }
        };
    }
}

/// The half a clause lives on: a send on `side` is recorded at the peer half
/// it delivers to, a receive on `side` at `side` itself.
fn station(side: usize, dir: Dir) -> usize {
    match dir {
        Dir::Tx => side ^ 1,
        Dir::Rx => side,
    }
}

/// Copies the payload between `op`'s buffer and the parked peer clause's
/// buffer, in whichever direction applies, and reports both outcomes as
/// `(ours, peer's)`. On a length mismatch nothing is copied and both sides
/// fail.
///
/// # Safety
///
/// The channel lock must be held and `peer` must be a clause that was parked
/// on the matching queue (so its payload points the opposite way and is still
/// valid).
unsafe fn rendezvous(
    op: &mut OpRef<'_>,
    peer: NonNull<Waiter>,
) -> (Result<(), ChanError>, Result<(), ChanError>) {
    // Safety: lock held, per this function's contract.
    let payload = unsafe { Waiter::payload(peer) };

    match (op, payload) {
        (OpRef::Tx(msg), Payload::Rx { ptr, len }) => {
            if len == msg.len() {
                // the single observable transfer: sender's buffer straight
                // into the receiver's.
                // Safety: the receiver's buffer is valid for `len` writes
                // while its clause is parked, and the two buffers belong to
                // different futures so they cannot overlap.
                unsafe { ptr::copy_nonoverlapping(msg.as_ptr(), ptr, len) };
                (Ok(()), Ok(()))
            } else {
                (
                    Err(ChanError::LenMismatch {
                        local: msg.len(),
                        remote: len,
                    }),
                    Err(ChanError::LenMismatch {
                        local: len,
                        remote: msg.len(),
                    }),
                )
            }
        }
        (OpRef::Rx(buf), Payload::Tx { ptr, len }) => {
            if len == buf.len() {
                // Safety: see above, with the roles reversed.
                unsafe { ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), len) };
                (Ok(()), Ok(()))
            } else {
                (
                    Err(ChanError::LenMismatch {
                        local: buf.len(),
                        remote: len,
                    }),
                    Err(ChanError::LenMismatch {
                        local: len,
                        remote: buf.len(),
                    }),
                )
            }
        }
        _ => unreachable!("clause parked on the wrong queue"),
    }
}

impl OpRef<'_> {
    pub(super) fn dir(&self) -> Dir {
        match self {
            OpRef::Tx(_) => Dir::Tx,
            OpRef::Rx(_) => Dir::Rx,
        }
    }

    fn as_payload(&mut self) -> Payload {
        match self {
            OpRef::Tx(msg) => Payload::Tx {
                ptr: msg.as_ptr(),
                len: msg.len(),
            },
            OpRef::Rx(buf) => Payload::Rx {
                ptr: buf.as_mut_ptr(),
                len: buf.len(),
            },
        }
    }
}

// === impl Port ===

impl Port {
    /// Sends `msg` if a receiver is already parked on the peer port.
    ///
    /// This is the zero-deadline send: the rendezvous fast path runs, but the
    /// operation never parks.
    ///
    /// # Errors
    ///
    /// - [`ChanError::TimedOut`] if no receiver is parked.
    /// - [`ChanError::Closed`] if the direction is poisoned or this port is
    ///   closed.
    /// - [`ChanError::LenMismatch`] if the parked receiver's buffer length
    ///   differs from `msg.len()`; the receiver fails the same way.
    pub fn try_send(&self, msg: &[u8]) -> Result<(), ChanError> {
        let mut op = OpRef::Tx(msg);
        let start = self.chan.shared.lock().start(self.side, &mut op);
        finish_start(start)
    }

    /// Sends `msg`, parking until a receiver arrives on the peer port.
    ///
    /// `msg` is borrowed until the future resolves; the payload is copied
    /// directly into the receiver's buffer at rendezvous. Dropping the future
    /// cancels the send.
    pub fn send<'a>(&'a self, msg: &'a [u8]) -> SendFut<'a> {
        SendFut {
            port: self,
            msg,
            state: OpState::Start,
            waiter: Waiter::new(),
        }
    }

    /// Receives into `buf` if a sender is already parked.
    ///
    /// The zero-deadline counterpart of [`recv`](Port::recv); errors as
    /// [`try_send`](Port::try_send).
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<(), ChanError> {
        let mut op = OpRef::Rx(buf);
        let start = self.chan.shared.lock().start(self.side, &mut op);
        finish_start(start)
    }

    /// Receives into `buf`, parking until a sender arrives.
    ///
    /// The sender's payload length must equal `buf.len()` exactly. Dropping
    /// the future cancels the receive.
    pub fn recv<'a>(&'a self, buf: &'a mut [u8]) -> RecvFut<'a> {
        RecvFut {
            port: self,
            buf,
            state: OpState::Start,
            waiter: Waiter::new(),
        }
    }

    /// Poisons the direction flowing out of this port.
    ///
    /// Every operation already parked in that direction is resumed with
    /// [`ChanError::Closed`], as is every future send on this port and
    /// receive on the peer. The opposite direction is unaffected.
    ///
    /// # Errors
    ///
    /// [`ChanError::Closed`] if the direction is already done.
    #[tracing::instrument(level = "trace", skip(self), fields(side = self.side))]
    pub fn done(&self) -> Result<(), ChanError> {
        self.chan.done_side(self.side)
    }

    /// Closes this port.
    ///
    /// The first close of a pair only marks its half; the peer port keeps
    /// working (its sends simply never find a receiver again). Closing the
    /// second half resumes everything still parked on the pair with
    /// [`ChanError::Closed`] and, for heap pairs, lets the storage go once
    /// the last borrower is gone.
    ///
    /// Dropping a port closes it; closing twice is a no-op.
    #[tracing::instrument(level = "trace", skip(self), fields(side = self.side))]
    pub fn close(&self) {
        self.chan.close_side(self.side);
    }

    pub(super) fn chan(&self) -> &Chan {
        &self.chan
    }

    pub(super) fn side(&self) -> usize {
        self.side
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.chan.close_side(self.side);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port").field("side", &self.side).finish_non_exhaustive()
    }
}

impl Deref for ChanRef {
    type Target = Chan;

    fn deref(&self) -> &Chan {
        match self {
            ChanRef::Counted(chan) => chan,
            ChanRef::Static(chan) => chan,
        }
    }
}

/// Resolves a [`Start`] into the operation's result, waking the peer (after
/// the lock has been dropped) if a rendezvous happened.
fn finish_start(start: Start) -> Result<(), ChanError> {
    match start {
        Start::Rendezvous { waker, result } => {
            if let Some(waker) = waker {
                waker.wake();
            }
            result
        }
        Start::Refused(err) => Err(err),
        Start::NoPeer => Err(ChanError::TimedOut),
    }
}

// === send/recv futures ===

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum OpState {
    Start,
    Waiting,
    Done,
}

/// Future returned by [`Port::send`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SendFut<'a> {
    port: &'a Port,
    msg: &'a [u8],
    state: OpState,
    #[pin]
    waiter: Waiter,
}

/// Future returned by [`Port::recv`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct RecvFut<'a> {
    port: &'a Port,
    buf: &'a mut [u8],
    state: OpState,
    #[pin]
    waiter: Waiter,
}

impl Future for SendFut<'_> {
    type Output = Result<(), ChanError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        // Safety: we never move out of the pointer; the waiter is unlinked
        // before the future drops.
        let waiter = unsafe { NonNull::from(Pin::into_inner_unchecked(this.waiter)) };
        match this.state {
            OpState::Start => {
                let mut op = OpRef::Tx(*this.msg);
                poll_start(this.port, &mut op, this.state, waiter, cx)
            }
            OpState::Waiting => poll_parked(this.port, this.state, waiter, cx),
            OpState::Done => panic!("operation future polled after completion"),
        }
    }
}

impl Future for RecvFut<'_> {
    type Output = Result<(), ChanError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        // Safety: see `SendFut::poll`.
        let waiter = unsafe { NonNull::from(Pin::into_inner_unchecked(this.waiter)) };
        match this.state {
            OpState::Start => {
                // the buffer is reborrowed only here, before the clause is
                // linked: while parked, the queue holds a raw pointer into
                // it, and deriving another reference would alias that.
                let mut op = OpRef::Rx(&mut **this.buf);
                poll_start(this.port, &mut op, this.state, waiter, cx)
            }
            OpState::Waiting => poll_parked(this.port, this.state, waiter, cx),
            OpState::Done => panic!("operation future polled after completion"),
        }
    }
}

/// First poll of an operation: entry checks, the rendezvous fast path, or
/// park.
fn poll_start(
    port: &Port,
    op: &mut OpRef<'_>,
    state: &mut OpState,
    waiter: NonNull<Waiter>,
    cx: &mut Context<'_>,
) -> Poll<Result<(), ChanError>> {
    let mut shared = port.chan.shared.lock();
    match shared.start(port.side, op) {
        Start::NoPeer => {
            let dir = op.dir();
            // Safety: the lock is held; the payload borrows buffers that
            // outlive this future, which unlinks the clause before dropping.
            unsafe { Waiter::prepare(waiter, op.as_payload(), 0, None, cx.waker().clone()) };
            shared.park(port.side, dir, waiter);
            *state = OpState::Waiting;
            Poll::Pending
        }
        Start::Rendezvous { waker, result } => {
            drop(shared);
            *state = OpState::Done;
            if let Some(waker) = waker {
                waker.wake();
            }
            Poll::Ready(result)
        }
        Start::Refused(err) => {
            *state = OpState::Done;
            Poll::Ready(Err(err))
        }
    }
}

/// Re-poll of a parked operation.
///
/// Deliberately takes no buffer reference: while the clause is linked, its
/// queue holds a raw pointer into the caller's buffer, and this path must not
/// create a reference that would alias it.
fn poll_parked(
    port: &Port,
    state: &mut OpState,
    waiter: NonNull<Waiter>,
    cx: &mut Context<'_>,
) -> Poll<Result<(), ChanError>> {
    let shared = port.chan.shared.lock();
    // Safety: the lock is held.
    match unsafe { Waiter::state(waiter) } {
        WaitState::Done(result) => {
            drop(shared);
            *state = OpState::Done;
            Poll::Ready(result)
        }
        WaitState::Linked => {
            // Safety: the lock is held.
            unsafe { Waiter::update_waker(waiter, cx.waker()) };
            Poll::Pending
        }
        WaitState::Start => unreachable!("a parked operation's clause was never linked"),
        WaitState::Revoked => unreachable!("a single operation's clause has no siblings"),
    }
}

/// Unlinks a parked clause when its future is dropped mid-wait.
fn release(port: &Port, dir: Dir, waiter: NonNull<Waiter>) {
    let mut shared = port.chan.shared.lock();
    // Safety: the lock is held.
    if matches!(unsafe { Waiter::state(waiter) }, WaitState::Linked) {
        tracing::trace!(side = port.side, "parked operation cancelled");
        shared.unlink(port.side, dir, waiter);
    }
}

#[pinned_drop]
impl PinnedDrop for SendFut<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.state == OpState::Waiting {
            // Safety: the pointer is only used to unlink the waiter.
            let waiter = unsafe { NonNull::from(Pin::into_inner_unchecked(this.waiter)) };
            release(this.port, Dir::Tx, waiter);
        }
    }
}

#[pinned_drop]
impl PinnedDrop for RecvFut<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.state == OpState::Waiting {
            // Safety: the pointer is only used to unlink the waiter.
            let waiter = unsafe { NonNull::from(Pin::into_inner_unchecked(this.waiter)) };
            release(this.port, Dir::Rx, waiter);
        }
    }
}

impl fmt::Debug for SendFut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendFut")
            .field("state", &self.state)
            .field("len", &self.msg.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for RecvFut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the buffer is deliberately not touched here: while the clause is
        // parked, the queue holds a raw pointer into it.
        f.debug_struct("RecvFut")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// === impl HalfState ===

impl HalfState {
    const fn new() -> Self {
        Self {
            rx_queue: List::new(),
            tx_queue: List::new(),
            done: false,
            closed: false,
        }
    }
}

// === impl ChanError ===

impl fmt::Display for ChanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChanError::Closed => f.pad("channel closed"),
            ChanError::LenMismatch { local, remote } => {
                write!(f, "payload length mismatch: {local} bytes here, {remote} at the peer")
            }
            ChanError::TimedOut => f.pad("timed out waiting for a peer"),
        }
    }
}

impl core::error::Error for ChanError {}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::sync::{Arc, LazyLock};

    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::executor::{Executor, Worker, yield_now};
    use crate::park::StdPark;
    use crate::test_util::std_clock;
    use crate::time::timeout;

    #[test]
    fn rendezvous_delivers_bytes() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let sender = EXEC.spawn(async move { a.send(b"hi").await });

        worker.block_on(async {
            let mut buf = [0u8; 2];
            b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");
            sender.await.unwrap();
        });
    }

    #[test]
    fn both_directions_work() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let peer = EXEC.spawn(async move {
            a.send(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            a.recv(&mut buf).await.unwrap();
            buf
        });

        worker.block_on(async {
            let mut buf = [0u8; 4];
            b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            b.send(b"pong").await.unwrap();
            assert_eq!(&peer.await, b"pong");
        });
    }

    #[test]
    fn try_ops_fail_fast_without_peer() {
        let (a, b) = pair();

        assert_eq!(a.try_send(b"x"), Err(ChanError::TimedOut));
        assert_eq!(b.try_recv(&mut [0u8; 1]), Err(ChanError::TimedOut));
    }

    #[test]
    fn len_mismatch_fails_both_sides() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let sender = EXEC.spawn(async move { a.send(b"ab").await });

        worker.block_on(async {
            let mut buf = [0u8; 3];
            assert_eq!(
                b.recv(&mut buf).await,
                Err(ChanError::LenMismatch { local: 3, remote: 2 })
            );
            // neither buffer was touched
            assert_eq!(buf, [0u8; 3]);
            assert_eq!(
                sender.await,
                Err(ChanError::LenMismatch { local: 2, remote: 3 })
            );
        });
    }

    #[test]
    fn zero_length_payloads_rendezvous() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let sender = EXEC.spawn(async move { a.send(b"").await });

        worker.block_on(async {
            let mut buf = [0u8; 0];
            b.recv(&mut buf).await.unwrap();
            sender.await.unwrap();
        });
    }

    #[test]
    fn fifo_pairing() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let a = Arc::new(a);
        let s1 = EXEC.spawn({
            let a = a.clone();
            async move { a.send(b"1").await }
        });
        let s2 = EXEC.spawn({
            let a = a.clone();
            async move { a.send(b"2").await }
        });

        worker.block_on(async {
            let mut buf = [0u8; 1];
            b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"1");
            b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"2");
            s1.await.unwrap();
            s2.await.unwrap();
        });
    }

    #[test]
    fn done_poisons_one_direction() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        a.done().unwrap();

        // the poisoned direction fails fast both ways
        assert_eq!(a.try_send(b"x"), Err(ChanError::Closed));
        assert_eq!(b.try_recv(&mut [0u8; 1]), Err(ChanError::Closed));
        // and stays poisoned
        assert_eq!(a.done(), Err(ChanError::Closed));

        // the opposite direction is unaffected
        let b = Arc::new(b);
        let sender = EXEC.spawn({
            let b = b.clone();
            async move { b.send(b"y").await }
        });
        worker.block_on(async {
            let mut buf = [0u8; 1];
            a.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"y");
            sender.await.unwrap();
        });
    }

    #[test]
    fn done_resumes_parked_peer() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let receiver = EXEC.spawn(async move {
            let mut buf = [0u8; 1];
            b.recv(&mut buf).await
        });

        worker.block_on(async {
            // make sure the receiver has parked before poisoning
            yield_now().await;
            a.done().unwrap();
            assert_eq!(receiver.await, Err(ChanError::Closed));
        });
    }

    #[test]
    fn first_close_leaves_the_peer_alone() {
        let (a, b) = pair();

        a.close();
        assert_eq!(a.try_send(b"x"), Err(ChanError::Closed));
        assert_eq!(a.try_recv(&mut [0u8; 1]), Err(ChanError::Closed));

        // the open half keeps operating normally; its sends just never find
        // a receiver anymore
        assert_eq!(b.try_send(b"x"), Err(ChanError::TimedOut));
    }

    #[test]
    fn close_of_both_halves_resumes_parked_ops() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let b = Arc::new(b);
        let receiver = EXEC.spawn({
            let b = b.clone();
            async move {
                let mut buf = [0u8; 1];
                b.recv(&mut buf).await
            }
        });

        worker.block_on(async {
            yield_now().await;
            drop(a); // first close: the parked receive stays parked
            b.close(); // second close tears the pair down
            assert_eq!(receiver.await, Err(ChanError::Closed));
        });
    }

    #[test]
    fn deadline_elapses_and_unlinks_the_clause() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();

        worker.block_on(async {
            let res = timeout(EXEC.timer(), Duration::from_millis(10), a.send(b"x"))
                .unwrap()
                .await;
            assert!(res.is_err(), "no receiver ever arrived");

            // the parked send was unlinked on cancellation: a receiver
            // arriving now finds nothing
            assert_eq!(b.try_recv(&mut [0u8; 1]), Err(ChanError::TimedOut));
        });
    }

    #[test]
    fn parked_send_survives_until_deadline_peer() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();
        let sender = EXEC.spawn(async move {
            timeout(EXEC.timer(), Duration::from_millis(500), a.send(b"k"))
                .unwrap()
                .await
        });

        worker.block_on(async {
            let mut buf = [0u8; 1];
            b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"k");
            assert_eq!(sender.await, Ok(Ok(())));
        });
    }

    #[test]
    fn static_pair_rendezvous() {
        static CHAN: Chan = Chan::new();
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = CHAN.split();
        let sender = EXEC.spawn(async move { a.send(b"st").await });

        worker.block_on(async {
            let mut buf = [0u8; 2];
            b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf, b"st");
            sender.await.unwrap();
        });
    }
}
