//! The request queue that feeds an index-worker thread with requests
//! in adaptively-sized batches.
//!
//! Conceptually this is two funnel queues (`main`, `retry`) drained by
//! a single consumer and woken through an event-count. Rather than
//! pulling in a lock-free queue dependency, the funnel queues are
//! plain `Mutex<VecDeque<_>>` and the event-count is a `Condvar` paired
//! with its own rendezvous mutex (`wait_gate`); the ordering guarantees
//! (FIFO per sub-queue, retry-before-main, nothing-lost-on-shutdown)
//! are preserved exactly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_WAIT_NANOS: u64 = 10_000;
pub const MIN_WAIT_NANOS: u64 = 5_000;
pub const MAX_WAIT_NANOS: u64 = 1_000_000;
pub const MIN_BATCH: u32 = 32;
pub const MAX_BATCH: u32 = 64;

pub struct Request<T> {
    pub payload: T,
    pub unbatched: bool,
    pub requeued: bool,
}

impl<T> Request<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            unbatched: false,
            requeued: false,
        }
    }
}

struct Inner<T> {
    main: Mutex<VecDeque<Request<T>>>,
    retry: Mutex<VecDeque<Request<T>>>,
    cv: Condvar,
    wait_gate: Mutex<()>,
    dormant: AtomicBool,
    running: AtomicBool,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            main: Mutex::new(VecDeque::new()),
            retry: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            wait_gate: Mutex::new(()),
            dormant: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    fn try_pop(&self) -> Option<Request<T>> {
        if let Some(request) = self.retry.lock().unwrap().pop_front() {
            return Some(request);
        }
        self.main.lock().unwrap().pop_front()
    }
}

/// Pushes `request` onto its sub-queue, then wakes the worker if it
/// might be dormant. The payload push (under `main`/`retry`'s own
/// mutex) establishes the memory barrier for a lock-free-style push;
/// taking `wait_gate` afterwards closes the race against a worker that
/// is mid-way through its prepare-to-wait sequence (it re-polls only
/// after it too holds `wait_gate`).
fn enqueue<T>(inner: &Inner<T>, request: Request<T>) {
    let unbatched = request.unbatched;
    let requeued = request.requeued;
    if requeued {
        inner.retry.lock().unwrap().push_back(request);
    } else {
        inner.main.lock().unwrap().push_back(request);
    }

    if inner.dormant.load(Ordering::Acquire) || unbatched {
        let _gate = inner.wait_gate.lock().unwrap();
        inner.cv.notify_one();
    }
}

fn worker_loop<T>(inner: Arc<Inner<T>>, mut handler: impl FnMut(Request<T>)) {
    let mut current_batch: u32 = 0;
    let mut wait_nanoseconds: u64 = DEFAULT_WAIT_NANOS;

    loop {
        if let Some(request) = inner.try_pop() {
            current_batch += 1;
            handler(request);
            continue;
        }

        let mut gate = inner.wait_gate.lock().unwrap();

        if !inner.running.load(Ordering::Acquire) {
            drop(gate);
            while let Some(request) = inner.try_pop() {
                handler(request);
            }
            return;
        }

        // Step 3: re-poll while holding the gate, closing the race
        // against a producer that pushed and checked `dormant` between
        // our fast-path poll above and taking the gate here.
        if let Some(request) = inner.try_pop() {
            drop(gate);
            current_batch += 1;
            handler(request);
            continue;
        }

        // Step 4.
        if current_batch < MIN_BATCH {
            wait_nanoseconds += wait_nanoseconds / 4;
        } else if current_batch > MAX_BATCH {
            wait_nanoseconds -= wait_nanoseconds / 4;
        }
        if wait_nanoseconds > MAX_WAIT_NANOS {
            wait_nanoseconds = MAX_WAIT_NANOS;
        }
        if wait_nanoseconds < MIN_WAIT_NANOS {
            wait_nanoseconds = MIN_WAIT_NANOS;
        }

        // Steps 5-6.
        let already_dormant = inner.dormant.load(Ordering::Acquire);
        if wait_nanoseconds >= MAX_WAIT_NANOS && already_dormant {
            gate = inner.cv.wait(gate).unwrap();
            inner.dormant.store(false, Ordering::Release);
            wait_nanoseconds = DEFAULT_WAIT_NANOS;
        } else {
            if wait_nanoseconds >= MAX_WAIT_NANOS {
                inner.dormant.store(true, Ordering::Release);
            }
            let (g, _timeout) = inner
                .cv
                .wait_timeout(gate, Duration::from_nanos(wait_nanoseconds))
                .unwrap();
            gate = g;
        }
        drop(gate);

        // Step 7.
        current_batch = 0;
    }
}

/// Owns the worker thread and the shared queues. Dropping a queue that
/// was never `finish`ed leaks the worker; callers must shut down
/// explicitly. There is no Drop impl here on purpose.
pub struct RequestQueue<T> {
    inner: Arc<Inner<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Spawns the single consumer thread and returns a handle producers
    /// can `enqueue` onto.
    pub fn start(handler: impl FnMut(Request<T>) + Send + 'static) -> Self {
        let inner = Arc::new(Inner::new());
        let worker_inner = Arc::clone(&inner);
        let worker = thread::spawn(move || worker_loop(worker_inner, handler));
        Self {
            inner,
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, request: Request<T>) {
        enqueue(&self.inner, request)
    }

    /// `finish(queue)`: write fence, `running = false`, broadcast, join.
    pub fn finish(mut self) {
        self.inner.running.store(false, Ordering::Release);
        drop(self.inner.wait_gate.lock().unwrap());
        self.inner.cv.notify_all();
        if let Some(handle) = self.worker.take() {
            handle.join().expect("request-queue worker panicked");
        }
    }
}
