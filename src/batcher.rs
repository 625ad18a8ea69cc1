//! Request batching front-end.
//!
//! [`Batcher`] presents a unary `submit(request) -> future<response>` contract
//! while grouping in-flight requests into batches for a user-supplied
//! [`Multiplexer`]. Workers cycle through: collect queued pairs up to
//! [`BATCH_SIZE`], execute them as one multiplexer call, fan the responses
//! out, then either start the next batch or retire.
//!
//! Every accepted pair is executed exactly once. The handoff protocol:
//!
//! 1. `submit` reads the packed counter. Below the worker target it reserves
//!    a worker slot with a CAS and seeds a batch with the new pair directly,
//!    bypassing the queue.
//! 2. Otherwise the pair is appended to the queue (sleeping while the queue
//!    is full). The append is not atomic with step 1, so the counter is
//!    re-read. If the roster is still at target, the request count is
//!    incremented with a CAS of the full word; workers only retire when that
//!    count is zero, so some worker is pinned until it reaches the pair.
//! 3. If the roster dipped below target after the append, a worker slot is
//!    reserved instead and seeded with an arbitrary queued pair. The freshly
//!    appended pair was not yet counted, so queue size and request count stay
//!    consistent, and the new worker guarantees all counted pairs (and the
//!    fresh one) are reached.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::counter::{PackedCounter, ACTIVE_WORKERS_MAX, REQUEST_COUNT_MASK};
use crate::error::BatchError;
use crate::fifo::ConcurrentFifo;
use crate::pending::{PendingResponse, ResponseFuture};

/// Queued pairs read per batch. A batch always starts from one seed pair, so
/// the largest batch handed to a multiplexer is `BATCH_SIZE + 1`.
pub const BATCH_SIZE: usize = 4095;

/// Slots in the request queue.
pub const QUEUE_CAPACITY: usize = REQUEST_COUNT_MASK as usize + 1;

/// How long a producer sleeps between append attempts on a full queue.
///
/// The queue filling up means the downstream is bandwidth-bound; coarse
/// sleeping throttles producers without burning CPU on the hot word.
pub const QUEUE_FULL_SLEEP: Duration = Duration::from_millis(100);

// The request-count bits must exactly cover the queue positions.
const _: () = assert!(QUEUE_CAPACITY.is_power_of_two());
const _: () = assert!(QUEUE_CAPACITY - 1 == REQUEST_COUNT_MASK as usize);
const _: () = assert!(BATCH_SIZE + 1 <= QUEUE_CAPACITY);

/// Runs worker continuations.
///
/// Implementations must accept repeated submissions without unbounded delay;
/// every batch schedules exactly one continuation task.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: BoxFuture<'static, ()>);
}

impl Executor for futures::executor::ThreadPool {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.spawn_ok(task);
    }
}

impl<X: Executor> Executor for Arc<X> {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        (**self).execute(task);
    }
}

/// User-supplied batched execution.
pub trait Multiplexer: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Error: Send + Sync + 'static;

    /// Evaluates `requests` as one batch.
    ///
    /// The returned future must yield one response per request, positionally
    /// aligned with `requests`.
    fn execute(
        &self,
        requests: Vec<Self::Request>,
    ) -> BoxFuture<'static, Result<Vec<Self::Response>, Self::Error>>;
}

type Pending<M> = PendingResponse<
    <M as Multiplexer>::Request,
    <M as Multiplexer>::Response,
    <M as Multiplexer>::Error,
>;

/// Unary request front-end that batches submissions into multiplexer calls.
///
/// Cheap to clone; clones share the same queue and worker roster.
///
/// ```
/// use batchmux::{Batcher, Multiplexer};
/// use futures::executor::ThreadPool;
/// use futures::future::{self, BoxFuture, FutureExt};
///
/// struct Echo;
///
/// impl Multiplexer for Echo {
///     type Request = String;
///     type Response = String;
///     type Error = std::io::Error;
///
///     fn execute(
///         &self,
///         requests: Vec<String>,
///     ) -> BoxFuture<'static, Result<Vec<String>, std::io::Error>> {
///         future::ready(Ok(requests)).boxed()
///     }
/// }
///
/// let pool = ThreadPool::new().unwrap();
/// let batcher = Batcher::new(pool, Echo, 4);
/// let response = batcher.submit("ping".to_string()).wait().unwrap();
/// assert_eq!(response, "ping");
/// ```
pub struct Batcher<M: Multiplexer, X: Executor> {
    inner: Arc<Inner<M, X>>,
}

struct Inner<M: Multiplexer, X: Executor> {
    executor: X,
    multiplexer: M,
    target_worker_count: u32,
    counters: PackedCounter,
    queue: ConcurrentFifo<Pending<M>>,
    interrupt: AtomicBool,
}

impl<M: Multiplexer, X: Executor> Batcher<M, X> {
    /// Creates a batcher that keeps up to `target_worker_count` workers busy.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= target_worker_count <= 4095`.
    pub fn new(executor: X, multiplexer: M, target_worker_count: u32) -> Self {
        Self::with_queue_capacity(executor, multiplexer, target_worker_count, QUEUE_CAPACITY)
    }

    /// Low-level constructor with a caller-chosen queue capacity.
    pub(crate) fn with_queue_capacity(
        executor: X,
        multiplexer: M,
        target_worker_count: u32,
        queue_capacity: usize,
    ) -> Self {
        assert!(
            target_worker_count >= 1,
            "target_worker_count={} < 1",
            target_worker_count
        );
        assert!(
            target_worker_count <= ACTIVE_WORKERS_MAX,
            "target_worker_count={} > {}",
            target_worker_count,
            ACTIVE_WORKERS_MAX
        );
        assert!(queue_capacity.is_power_of_two());
        assert!(queue_capacity <= QUEUE_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                executor,
                multiplexer,
                target_worker_count,
                counters: PackedCounter::new(),
                queue: ConcurrentFifo::new(queue_capacity),
                interrupt: AtomicBool::new(false),
            }),
        }
    }

    /// Submits a request, subject to batching.
    ///
    /// Returns immediately with the future of the response. The calling
    /// thread only blocks when the queue is saturated, in which case it
    /// sleeps [`QUEUE_FULL_SLEEP`] between attempts.
    ///
    /// Response handling runs on the batcher's executor together with the
    /// rest of the batch; callers with expensive response processing should
    /// move it off that executor.
    pub fn submit(&self, request: M::Request) -> ResponseFuture<M::Response, M::Error> {
        let inner = &self.inner;
        let (pending, response) = PendingResponse::new(request);

        // Starts a worker as long as the roster is below target.
        loop {
            let seen = inner.counters.snapshot();
            if seen.active_workers() >= inner.target_worker_count {
                break;
            }
            if inner.counters.try_reserve_worker(seen) {
                Inner::execute_batch(inner, pending);
                return response;
            }
        }

        let mut pending = Box::new(pending);
        loop {
            match inner.queue.try_append(pending) {
                Ok(()) => break,
                Err(rejected) => {
                    if inner.interrupt.load(Ordering::Acquire) {
                        rejected.set_error(BatchError::Interrupted);
                        return response;
                    }
                    pending = rejected;
                    thread::sleep(QUEUE_FULL_SLEEP);
                }
            }
        }
        // Enqueuing succeeded.

        loop {
            let seen = inner.counters.snapshot();
            if seen.active_workers() >= inner.target_worker_count {
                // Workers only retire at a zero request count, so once the
                // increment lands some worker is pinned until it reaches the
                // enqueued pair. The full-word CAS rules out a concurrent
                // retirement between the roster check and the increment.
                if inner.counters.try_increment_requests(seen) {
                    return response;
                }
            } else {
                // The roster dipped below target right after the append.
                // Start a worker seeded with an arbitrary queued pair; the
                // pair appended above has not been counted yet, so taking
                // without decrementing keeps queue size and request count
                // consistent.
                if inner.counters.try_reserve_worker(seen) {
                    let seed = *inner.queue.take();
                    Inner::execute_batch(inner, seed);
                    return response;
                }
            }
        }
    }

    /// Cooperative cancellation signal for producers sleeping on a full
    /// queue.
    ///
    /// Each such producer resolves its current submission with
    /// [`BatchError::Interrupted`] without enqueuing it. The signal is
    /// sticky; queued and in-flight pairs are unaffected.
    pub fn interrupt(&self) {
        self.inner.interrupt.store(true, Ordering::Release);
    }
}

impl<M: Multiplexer, X: Executor> Clone for Batcher<M, X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Multiplexer, X: Executor> fmt::Debug for Batcher<M, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.inner.counters.snapshot();
        write!(
            f,
            "activeWorkers={}, requestCount={}\nqueue={:?}\n",
            snapshot.active_workers(),
            snapshot.request_count(),
            self.inner.queue,
        )
    }
}

impl<M: Multiplexer, X: Executor> Inner<M, X> {
    /// Runs one batch seeded with `seed` and schedules the follow-up work.
    ///
    /// The caller must hold a reserved worker slot. The continuation task
    /// fans the responses out and then continues or retires the worker, so
    /// the slot is released exactly once per reservation.
    fn execute_batch(this: &Arc<Self>, seed: Pending<M>) {
        let batch = this.populate_batch(seed);

        let mut requests = Vec::with_capacity(batch.len());
        let mut completions = Vec::with_capacity(batch.len());
        for pending in batch {
            let (request, completion) = pending.split();
            requests.push(request);
            completions.push(completion);
        }

        let responses = this.multiplexer.execute(requests);

        let worker = Arc::clone(this);
        this.executor.execute(Box::pin(async move {
            match responses.await {
                Ok(responses) => {
                    if responses.len() != completions.len() {
                        let error = BatchError::ResponseCountMismatch {
                            expected: completions.len(),
                            actual: responses.len(),
                        };
                        for completion in completions {
                            completion.set_error(error.clone());
                        }
                    } else {
                        for (completion, response) in completions.into_iter().zip(responses) {
                            completion.set_response(response);
                        }
                    }
                }
                Err(error) => {
                    let error = Arc::new(error);
                    for completion in completions {
                        completion.set_error(BatchError::Multiplexer(Arc::clone(&error)));
                    }
                }
            }

            // Data errors never kill a worker; the slot is handed on or
            // released here regardless of the batch outcome.
            Inner::continue_or_retire(&worker);
        }));
    }

    /// Collects up to [`BATCH_SIZE`] counted pairs on top of `seed`.
    fn populate_batch(&self, seed: Pending<M>) -> Vec<Pending<M>> {
        let mut batch = vec![seed];
        loop {
            let seen = self.counters.snapshot();
            let request_count = seen.request_count();
            if request_count == 0 {
                break;
            }
            let to_take = request_count.min(BATCH_SIZE as u32);
            if !self.counters.try_decrement_requests(seen, to_take) {
                continue;
            }
            batch.reserve(to_take as usize);
            for _ in 0..to_take {
                batch.push(*self.queue.take());
            }
            break;
        }
        batch
    }

    /// Seeds the next batch from the queue, or retires the worker slot.
    fn continue_or_retire(this: &Arc<Self>) {
        loop {
            let seen = this.counters.snapshot();
            if seen.request_count() == 0 {
                if this.counters.try_retire_worker(seen) {
                    return;
                }
            } else if this.counters.try_decrement_requests(seen, 1) {
                let seed = *this.queue.take();
                Inner::execute_batch(this, seed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use futures::channel::oneshot;
    use futures::executor::ThreadPool;
    use futures::future::FutureExt;

    /// Multiplexer whose batches stall until released, one gate per call.
    struct Gated {
        batches: Mutex<Vec<Vec<u32>>>,
        gates: Mutex<Vec<oneshot::Sender<()>>>,
    }

    impl Gated {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                gates: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.batches.lock().unwrap().len()
        }

        fn release_one(&self) -> bool {
            let mut gates = self.gates.lock().unwrap();
            if gates.is_empty() {
                return false;
            }
            gates.remove(0).send(()).is_ok()
        }
    }

    impl Multiplexer for Arc<Gated> {
        type Request = u32;
        type Response = u32;
        type Error = String;

        fn execute(&self, requests: Vec<u32>) -> BoxFuture<'static, Result<Vec<u32>, String>> {
            self.batches.lock().unwrap().push(requests.clone());
            let (gate, released) = oneshot::channel();
            self.gates.lock().unwrap().push(gate);
            async move {
                released.await.map_err(|_| "gate dropped".to_string())?;
                Ok(requests)
            }
            .boxed()
        }
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn full_queue_blocks_producer_until_a_worker_drains() {
        let mux = Gated::new();
        let batcher = Batcher::with_queue_capacity(
            ThreadPool::new().unwrap(),
            Arc::clone(&mux),
            1,
            2,
        );

        // Seizes the single worker and stalls it on the gate.
        let f0 = batcher.submit(0);
        wait_until("first batch to start", || mux.calls() == 1);

        // Fills the two queue slots.
        let f1 = batcher.submit(1);
        let f2 = batcher.submit(2);

        let blocked = batcher.clone();
        let producer = thread::spawn(move || {
            let started = Instant::now();
            let result = blocked.submit(3).wait();
            (result, started.elapsed())
        });

        thread::sleep(Duration::from_millis(150));
        assert!(!producer.is_finished(), "producer must sleep on the full queue");

        while !producer.is_finished() {
            mux.release_one();
            thread::sleep(Duration::from_millis(5));
        }
        let (result, blocked_for) = producer.join().unwrap();
        assert_eq!(result.unwrap(), 3);
        assert!(blocked_for >= QUEUE_FULL_SLEEP);

        assert_eq!(f0.wait().unwrap(), 0);
        assert_eq!(f1.wait().unwrap(), 1);
        assert_eq!(f2.wait().unwrap(), 2);
    }

    #[test]
    fn interrupt_fails_only_the_blocked_submission() {
        let mux = Gated::new();
        let batcher = Batcher::with_queue_capacity(
            ThreadPool::new().unwrap(),
            Arc::clone(&mux),
            1,
            2,
        );

        let f0 = batcher.submit(0);
        wait_until("first batch to start", || mux.calls() == 1);
        let f1 = batcher.submit(1);
        let f2 = batcher.submit(2);

        let blocked = batcher.clone();
        let producer = thread::spawn(move || blocked.submit(3).wait());
        thread::sleep(Duration::from_millis(150));
        assert!(!producer.is_finished());

        batcher.interrupt();
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(BatchError::Interrupted)));

        // Queued pairs are unaffected and drain normally.
        let waiters = thread::spawn(move || (f0.wait(), f1.wait(), f2.wait()));
        while !waiters.is_finished() {
            mux.release_one();
            thread::sleep(Duration::from_millis(5));
        }
        let (r0, r1, r2) = waiters.join().unwrap();
        assert_eq!(r0.unwrap(), 0);
        assert_eq!(r1.unwrap(), 1);
        assert_eq!(r2.unwrap(), 2);
    }
}
