// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative executor.
//!
//! Tasks run on one [`Worker`]; they make progress only at their own `await`
//! points, so state shared between them needs no synchronization beyond what
//! the suspension points themselves provide. The worker interleaves three
//! duties: polling runnable tasks, turning the [`Timer`], and parking until
//! the next deadline when there is nothing else to do.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::fmt;
use core::pin::{Pin, pin};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};

use spin::Mutex;

use crate::park::Park;
use crate::time::{Clock, Ticks, Timer};

/// Spawns tasks and owns the [`Timer`] that drives their deadlines.
#[derive(Debug)]
pub struct Executor {
    run_queue: Arc<RunQueue>,
    stop: AtomicBool,
    timer: Timer,
}

/// Drives an [`Executor`]: polls runnable tasks, turns the timer, and parks
/// in between.
#[derive(Debug)]
pub struct Worker<'exec, P> {
    exec: &'exec Executor,
    park: P,
}

/// Await the output of a [spawned](Executor::spawn) task.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct JoinHandle<T> {
    inner: Arc<JoinInner<T>>,
}

#[derive(Debug)]
struct JoinInner<T> {
    value: Mutex<Option<T>>,
    waker: Mutex<Option<Waker>>,
}

#[derive(Debug)]
struct RunQueue {
    tasks: Mutex<VecDeque<Arc<Task>>>,
}

struct Task {
    id: u64,
    /// The task's future, taken out of the slot while being polled.
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    run_queue: Arc<RunQueue>,
    /// Set while the task sits in the run queue, so a flurry of wakes
    /// enqueues it once.
    queued: AtomicBool,
}

// === impl Executor ===

impl Executor {
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            run_queue: Arc::new(RunQueue {
                tasks: Mutex::new(VecDeque::new()),
            }),
            stop: AtomicBool::new(false),
            timer: Timer::new(clock),
        }
    }

    #[inline]
    #[must_use]
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Clock {
        self.timer.clock()
    }

    /// Signal the worker to exit its [`run`](Worker::run) loop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Spawn a future onto the executor.
    ///
    /// The returned [`JoinHandle`] can be awaited for the task's output;
    /// dropping it detaches the task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        let inner = Arc::new(JoinInner {
            value: Mutex::new(None),
            waker: Mutex::new(None),
        });

        let task = Arc::new(Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            future: Mutex::new(None),
            run_queue: self.run_queue.clone(),
            queued: AtomicBool::new(true),
        });

        let join = inner.clone();
        *task.future.lock() = Some(Box::pin(async move {
            join.complete(future.await);
        }));

        tracing::trace!(task = task.id, "task spawned");
        self.run_queue.tasks.lock().push_back(task);

        JoinHandle { inner }
    }

    /// Polls the next runnable task. Returns `false` if the run queue was
    /// empty.
    fn tick(&self) -> bool {
        let Some(task) = self.run_queue.tasks.lock().pop_front() else {
            return false;
        };

        // clear the queued bit before polling so wakes that arrive during the
        // poll re-enqueue the task.
        task.queued.store(false, Ordering::Release);

        let Some(mut future) = task.future.lock().take() else {
            // the task already ran to completion; this was a stale wake.
            return true;
        };

        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);

        tracing::trace!(task = task.id, "polling task");
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                tracing::trace!(task = task.id, "task complete");
            }
            Poll::Pending => {
                *task.future.lock() = Some(future);
            }
        }

        true
    }
}

// === impl Worker ===

impl<'exec, P: Park> Worker<'exec, P> {
    pub fn new(exec: &'exec Executor, park: P) -> Self {
        Self { exec, park }
    }

    /// Run tasks until [`Executor::stop`] is called.
    pub fn run(&mut self) {
        let _span = tracing::debug_span!("worker run loop").entered();

        loop {
            if self.tick_batch() {
                continue;
            }

            if self.exec.stop.load(Ordering::Acquire) {
                tracing::debug!("stop signal received, shutting down");
                break;
            }

            let (expired, next_deadline) = self.exec.timer.turn();
            if expired > 0 {
                continue;
            }

            self.park(next_deadline);
        }
    }

    /// Run tasks until `future` completes, and return its output.
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        let _span = tracing::debug_span!("worker block_on").entered();

        let woken = Arc::new(BlockOnWaker {
            woken: AtomicBool::new(true),
        });
        let waker = Waker::from(woken.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            // drive the spawned tasks first so their effects (parked peers,
            // rendezvous partners) are visible to the main future.
            self.tick_batch();

            if woken.woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                    return v;
                }
                // polling the main future may have woken tasks
                continue;
            }

            let (expired, next_deadline) = self.exec.timer.turn();
            if expired > 0 {
                continue;
            }

            if woken.woken.load(Ordering::Acquire) {
                continue;
            }

            self.park(next_deadline);
        }
    }

    /// Polls runnable tasks up to a budget. Returns `true` if any ran.
    fn tick_batch(&mut self) -> bool {
        const BUDGET: usize = 256;

        let mut ran = false;
        for _ in 0..BUDGET {
            if !self.exec.tick() {
                break;
            }
            ran = true;
        }
        ran
    }

    fn park(&mut self, next_deadline: Option<Ticks>) {
        let clock = self.exec.timer.clock();

        if let Some(deadline) = next_deadline {
            let remaining = deadline.saturating_sub(clock.now_ticks());
            if remaining > Ticks(0) {
                tracing::trace!(remaining = remaining.0, "parking until next deadline");
                self.park.park_timeout(clock.ticks_to_duration(remaining));
            }
        } else {
            tracing::trace!("parking with no deadline");
            self.park.park();
        }
    }
}

// === impl Task ===

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            tracing::trace!(task = self.id, "task woken");
            self.run_queue.tasks.lock().push_back(self.clone());
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish_non_exhaustive()
    }
}

struct BlockOnWaker {
    woken: AtomicBool,
}

impl Wake for BlockOnWaker {
    fn wake(self: Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }
}

// === impl JoinHandle ===

impl<T> JoinInner<T> {
    fn complete(&self, value: T) {
        *self.value.lock() = Some(value);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.inner.value.lock().take() {
            return Poll::Ready(value);
        }

        *self.inner.waker.lock() = Some(cx.waker().clone());

        // the task may have completed between the check and the waker store
        if let Some(value) = self.inner.value.lock().take() {
            return Poll::Ready(value);
        }

        Poll::Pending
    }
}

/// Yields to the scheduler once, letting every other runnable task proceed
/// before this one resumes.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;
    use core::time::Duration;
    use std::sync::LazyLock;

    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::park::StdPark;
    use crate::test_util::std_clock;
    use crate::time::sleep;

    #[test]
    fn spawn_and_join() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let exec = Executor::new(std_clock());
        let mut worker = Worker::new(&exec, StdPark::new());

        let handle = exec.spawn(async { 19 + 23 });

        assert_eq!(worker.block_on(handle), 42);
    }

    #[test]
    fn yield_now_reschedules() {
        static NUM_POLLS: AtomicUsize = AtomicUsize::new(0);

        let exec = Executor::new(std_clock());
        let mut worker = Worker::new(&exec, StdPark::new());

        let handle = exec.spawn(async {
            NUM_POLLS.fetch_add(1, Ordering::Relaxed);
            yield_now().await;
            NUM_POLLS.fetch_add(1, Ordering::Relaxed);
        });

        worker.block_on(handle);
        assert_eq!(NUM_POLLS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn run_until_stopped() {
        let exec = Executor::new(std_clock());
        let mut worker = Worker::new(&exec, StdPark::new());

        let _detached = exec.spawn(async {
            yield_now().await;
        });

        // `stop` is observed only once the queue drains, so the task still
        // runs to completion.
        exec.stop();
        worker.run();
    }

    #[test]
    fn sleep_block_on() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let exec = Executor::new(std_clock());
        let mut worker = Worker::new(&exec, StdPark::new());

        worker.block_on(async {
            let begin = std::time::Instant::now();

            sleep(exec.timer(), Duration::from_millis(50)).unwrap().await;

            let elapsed = begin.elapsed();
            assert!(
                elapsed.as_millis() >= 50,
                "expected to sleep at least 50ms, but got {}",
                elapsed.as_millis()
            );
        });
    }

    // sleepers resume in deadline order, not spawn order
    #[test]
    fn spawned_sleepers_wake_in_order() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        static EXEC: LazyLock<Executor> = LazyLock::new(|| Executor::new(std_clock()));
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

        let mut worker = Worker::new(&EXEC, StdPark::new());

        worker.block_on(async {
            let slow = EXEC.spawn(async {
                sleep(EXEC.timer(), Duration::from_millis(40)).unwrap().await;
                ORDER.lock().push(2);
            });
            let fast = EXEC.spawn(async {
                sleep(EXEC.timer(), Duration::from_millis(10)).unwrap().await;
                ORDER.lock().push(1);
            });

            fast.await;
            slow.await;
        });

        assert_eq!(&*ORDER.lock(), &[1, 2]);
    }
}
