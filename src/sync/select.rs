// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Waiting on several channel operations at once.
//!
//! [`select`] takes an ordered slice of [`Clause`]s — any mix of sends and
//! receives on any set of ports — and completes when the first of them does,
//! reporting the clause's index and its outcome. Clauses earlier in the slice
//! win when several are satisfiable immediately; once parked, whichever
//! clause a peer triggers first wins, and that rendezvous is exclusive: the
//! wait's clauses share a claim flag, so a peer reaching a sibling clause
//! afterwards discards it and waits for a live partner instead of pairing
//! with a wait that has already fired.
//!
//! Every other clause is reliably unlinked from its queue when the wait
//! exits, whether it resolved, timed out under [`timeout`], or was dropped
//! mid-wait. That property is what makes registering on several queues at
//! once safe.
//!
//! [`timeout`]: crate::time::timeout

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;
use core::sync::atomic::AtomicBool;
use core::task::{Context, Poll};

use super::chan::{ChanError, OpRef, Port, Start};
use super::waiter::{Dir, Payload, WaitState, Waiter};

/// One pending operation in a [`select`].
pub enum Clause<'a> {
    /// Send these bytes through the port.
    Send(&'a Port, &'a [u8]),
    /// Receive into this buffer from the port.
    Recv(&'a Port, &'a mut [u8]),
}

/// Resolves the first immediately-satisfiable clause, in input order.
///
/// This is the non-parking variant of [`select`]: every clause's entry checks
/// and rendezvous fast path run, but nothing is ever linked onto a queue.
/// Returns `None` when no clause is satisfiable right now.
pub fn try_select(clauses: &mut [Clause<'_>]) -> Option<(usize, Result<(), ChanError>)> {
    clauses
        .iter_mut()
        .enumerate()
        .find_map(|(index, clause)| scan(clause).map(|result| (index, result)))
}

/// Waits until any one of `clauses` completes.
///
/// The future resolves to the index of the firing clause and its outcome; a
/// clause refused outright (its direction poisoned, say) counts as firing
/// with that error. For a deadline, wrap the future in
/// [`timeout`](crate::time::timeout) — an immediately-satisfiable clause
/// still beats an already-expired deadline. Dropping the future unlinks every
/// clause that is still parked.
///
/// # Panics
///
/// Panics if `clauses` is empty.
pub fn select<'clauses, 'data>(clauses: &'clauses mut [Clause<'data>]) -> Select<'clauses, 'data> {
    assert!(!clauses.is_empty(), "select requires at least one clause");

    let waiters = clauses
        .iter()
        .map(|_| Waiter::new())
        .collect::<Vec<_>>()
        .into_boxed_slice();

    Select {
        clauses,
        waiters,
        claim: Arc::new(AtomicBool::new(false)),
        state: SelectState::Start,
    }
}

/// Future returned by [`select`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Select<'clauses, 'data> {
    clauses: &'clauses mut [Clause<'data>],
    /// One clause record per input clause, tagged with its index. Boxed so
    /// the records keep stable addresses while linked, independent of this
    /// future moving before its first poll.
    waiters: Box<[Waiter]>,
    /// Claim flag shared by all of this wait's clauses. The first clause a
    /// peer triggers takes it; a peer popping a still-linked sibling
    /// afterwards revokes the sibling and moves on, so exactly one clause of
    /// the wait ever rendezvouses.
    claim: Arc<AtomicBool>,
    state: SelectState,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SelectState {
    Start,
    Waiting,
    Done,
}

// === impl Clause ===

impl Clause<'_> {
    fn port(&self) -> &Port {
        match self {
            Clause::Send(port, _) | Clause::Recv(port, _) => port,
        }
    }

    fn dir(&self) -> Dir {
        match self {
            Clause::Send(..) => Dir::Tx,
            Clause::Recv(..) => Dir::Rx,
        }
    }
}

impl fmt::Debug for Clause<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Send(_, msg) => f.debug_tuple("Send").field(&msg.len()).finish(),
            // the receive buffer is deliberately not touched: while the
            // clause is parked, a queue holds a raw pointer into it.
            Clause::Recv(..) => f.debug_struct("Recv").finish_non_exhaustive(),
        }
    }
}

/// Runs one clause's entry checks and fast path. `Some` means the clause
/// fired (successfully or with an error); `None` means it would park.
fn scan(clause: &mut Clause<'_>) -> Option<Result<(), ChanError>> {
    let (port, mut op) = match clause {
        Clause::Send(port, msg) => (*port, OpRef::Tx(*msg)),
        Clause::Recv(port, buf) => (*port, OpRef::Rx(&mut **buf)),
    };

    let start = port.chan().shared.lock().start(port.side(), &mut op);
    match start {
        Start::Rendezvous { waker, result } => {
            if let Some(waker) = waker {
                waker.wake();
            }
            Some(result)
        }
        Start::Refused(err) => Some(Err(err)),
        Start::NoPeer => None,
    }
}

// === impl Select ===

impl Select<'_, '_> {
    /// Unlinks every clause that is still parked. Runs when the wait exits
    /// for any reason; the cancellation half of the registration in `poll`.
    fn detach(&mut self) {
        for (index, clause) in self.clauses.iter().enumerate() {
            let port = clause.port();
            let waiter = NonNull::from(&self.waiters[index]);

            let mut shared = port.chan().shared.lock();
            // Safety: the lock is held.
            if matches!(unsafe { Waiter::state(waiter) }, WaitState::Linked) {
                shared.unlink(port.side(), clause.dir(), waiter);
            }
        }
    }
}

impl Future for Select<'_, '_> {
    type Output = (usize, Result<(), ChanError>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // `Select` is `Unpin`: the clause records live on the heap.
        let this = self.get_mut();

        match this.state {
            SelectState::Start => {
                // scan in input order: an earlier satisfiable clause wins.
                for (index, clause) in this.clauses.iter_mut().enumerate() {
                    if let Some(result) = scan(clause) {
                        this.state = SelectState::Done;
                        return Poll::Ready((index, result));
                    }
                }

                // nothing was ready: park one clause record on every queue.
                // No task runs between the scan above and this loop, so the
                // queues cannot have changed in between.
                for (index, clause) in this.clauses.iter_mut().enumerate() {
                    let (port, payload, dir) = match clause {
                        Clause::Send(port, msg) => (
                            *port,
                            Payload::Tx {
                                ptr: msg.as_ptr(),
                                len: msg.len(),
                            },
                            Dir::Tx,
                        ),
                        Clause::Recv(port, buf) => (
                            *port,
                            Payload::Rx {
                                ptr: buf.as_mut_ptr(),
                                len: buf.len(),
                            },
                            Dir::Rx,
                        ),
                    };
                    let waiter = NonNull::from(&this.waiters[index]);

                    let mut shared = port.chan().shared.lock();
                    // Safety: the lock is held; the payload borrows buffers
                    // that outlive this future, which unlinks every clause
                    // before dropping.
                    unsafe {
                        Waiter::prepare(
                            waiter,
                            payload,
                            index,
                            Some(this.claim.clone()),
                            cx.waker().clone(),
                        );
                    }
                    shared.park(port.side(), dir, waiter);
                }

                this.state = SelectState::Waiting;
                Poll::Pending
            }
            SelectState::Waiting => {
                let mut fired = None;
                for (index, clause) in this.clauses.iter().enumerate() {
                    let port = clause.port();
                    let waiter = NonNull::from(&this.waiters[index]);

                    let shared = port.chan().shared.lock();
                    // Safety: the lock is held.
                    match unsafe { Waiter::state(waiter) } {
                        WaitState::Done(result) => {
                            debug_assert_eq!(unsafe { Waiter::tag(waiter) }, index);
                            drop(shared);
                            fired = Some((index, result));
                            break;
                        }
                        WaitState::Linked => {
                            // Safety: the lock is held.
                            unsafe { Waiter::update_waker(waiter, cx.waker()) };
                        }
                        // a sibling fired first and a peer has already
                        // discarded this clause; the sibling's `Done` is
                        // found by this same scan.
                        WaitState::Revoked => {}
                        WaitState::Start => {
                            unreachable!("a registered select clause was never linked")
                        }
                    }
                }

                match fired {
                    Some((index, result)) => {
                        this.detach();
                        this.state = SelectState::Done;
                        Poll::Ready((index, result))
                    }
                    None => Poll::Pending,
                }
            }
            SelectState::Done => panic!("Select polled after completion"),
        }
    }
}

impl Drop for Select<'_, '_> {
    fn drop(&mut self) {
        if self.state == SelectState::Waiting {
            self.detach();
        }
    }
}

impl fmt::Debug for Select<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select")
            .field("state", &self.state)
            .field("clauses", &self.clauses)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::sync::LazyLock;

    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::executor::{Executor, Worker};
    use crate::park::StdPark;
    use crate::sync::chan::pair;
    use crate::test_util::std_clock;
    use crate::time::{sleep, sleep_until, timeout};

    #[test]
    fn earlier_satisfiable_clause_wins() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (c1a, c1b) = pair();
        let (c2a, c2b) = pair();

        let z = EXEC.spawn(async move { c1a.send(b"1").await });
        let y = EXEC.spawn(async move { c2a.send(b"2").await });

        worker.block_on(async {
            let mut buf1 = [0u8; 1];
            let mut buf2 = [0u8; 1];
            {
                let mut clauses = [Clause::Recv(&c1b, &mut buf1), Clause::Recv(&c2b, &mut buf2)];
                let (index, result) = select(&mut clauses).await;
                assert_eq!(index, 0);
                result.unwrap();
            }
            assert_eq!(&buf1, b"1");
            z.await.unwrap();

            // the losing sender is still parked, its payload intact
            let mut buf = [0u8; 1];
            assert_eq!(c2b.try_recv(&mut buf), Ok(()));
            assert_eq!(&buf, b"2");
            y.await.unwrap();
        });
    }

    #[test]
    fn parked_select_resolves_when_a_peer_arrives() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (c1a, c1b) = pair();
        let (c2a, c2b) = pair();
        let _quiet = c1a;

        let sender = EXEC.spawn(async move {
            // arrive well after the select has parked
            sleep(EXEC.timer(), Duration::from_millis(20)).unwrap().await;
            c2a.send(b"9").await
        });

        worker.block_on(async {
            let mut buf1 = [0u8; 1];
            let mut buf2 = [0u8; 1];
            {
                let mut clauses = [Clause::Recv(&c1b, &mut buf1), Clause::Recv(&c2b, &mut buf2)];
                let (index, result) = select(&mut clauses).await;
                assert_eq!(index, 1);
                result.unwrap();
            }
            assert_eq!(&buf2, b"9");
            sender.await.unwrap();
        });
    }

    // two peers trigger clauses of the same parked select before it gets to
    // run again: only the first rendezvouses, the second peer stays parked
    // with its message undelivered
    #[test]
    fn second_trigger_is_refused_while_the_select_is_pending() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (c1a, c1b) = pair();
        let (c2a, c2b) = pair();

        // identical deadlines, so both senders wake in the same tick batch,
        // ahead of the selecting task
        let at = EXEC.clock().deadline(Duration::from_millis(20)).unwrap();
        let z = EXEC.spawn(async move {
            sleep_until(EXEC.timer(), at).await;
            c1a.send(b"1").await
        });
        let y = EXEC.spawn(async move {
            sleep_until(EXEC.timer(), at).await;
            c2a.send(b"2").await
        });

        worker.block_on(async {
            let mut buf1 = [0u8; 1];
            let mut buf2 = [0u8; 1];
            {
                let mut clauses = [Clause::Recv(&c1b, &mut buf1), Clause::Recv(&c2b, &mut buf2)];
                let (index, result) = select(&mut clauses).await;
                assert_eq!(index, 0);
                result.unwrap();
            }
            assert_eq!(&buf1, b"1");
            // the second clause never rendezvoused, so its buffer is intact
            assert_eq!(buf2, [0u8; 1]);
            z.await.unwrap();

            // and the losing sender is still parked with its message
            let mut buf = [0u8; 1];
            c2b.try_recv(&mut buf).unwrap();
            assert_eq!(&buf, b"2");
            y.await.unwrap();
        });
    }

    #[test]
    fn send_clause_fires() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (c1a, c1b) = pair();
        let (_c2a, c2b) = pair();

        let receiver = EXEC.spawn(async move {
            let mut buf = [0u8; 1];
            c1b.recv(&mut buf).await.map(|()| buf[0])
        });

        worker.block_on(async {
            let mut buf = [0u8; 1];
            let mut clauses = [Clause::Recv(&c2b, &mut buf), Clause::Send(&c1a, b"\x07")];
            let (index, result) = select(&mut clauses).await;
            assert_eq!(index, 1);
            result.unwrap();
            assert_eq!(receiver.await, Ok(7));
        });
    }

    #[test]
    fn timeout_unlinks_every_clause() {
        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        let mut worker = Worker::new(&EXEC, StdPark::new());

        let (a, b) = pair();

        worker.block_on(async {
            let mut buf = [0u8; 1];
            {
                let mut clauses = [Clause::Recv(&a, &mut buf), Clause::Send(&b, b"x")];
                let res = timeout(EXEC.timer(), Duration::from_millis(10), select(&mut clauses))
                    .unwrap()
                    .await;
                assert!(res.is_err(), "no peer ever arrived");
            }

            // both clauses were unlinked when the wait was cancelled: peers
            // arriving now find empty queues
            assert_eq!(a.try_recv(&mut [0u8; 1]), Err(ChanError::TimedOut));
            assert_eq!(b.try_send(b"x"), Err(ChanError::TimedOut));
        });
    }

    #[test]
    fn poisoned_clause_reports_its_index() {
        let (a, b) = pair();
        b.done().unwrap();

        let mut buf = [0u8; 1];
        let mut other = [0u8; 1];
        let (_c2a, c2b) = pair();
        let mut clauses = [Clause::Recv(&c2b, &mut other), Clause::Recv(&a, &mut buf)];
        assert_eq!(try_select(&mut clauses), Some((1, Err(ChanError::Closed))));
    }

    #[test]
    fn try_select_with_no_ready_clause() {
        let (a, _a2) = pair();
        let (_b1, b) = pair();

        let mut buf1 = [0u8; 1];
        let mut buf2 = [0u8; 1];
        let mut clauses = [Clause::Recv(&a, &mut buf1), Clause::Recv(&b, &mut buf2)];
        assert_eq!(try_select(&mut clauses), None);
    }

    #[test]
    #[should_panic(expected = "at least one clause")]
    fn empty_select_panics() {
        let mut clauses: [Clause<'_>; 0] = [];
        let _ = select(&mut clauses);
    }
}
