// The MIT License (MIT)

// Copyright (c) 2016 The Weft Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Work-stealing coroutine scheduler
//!
//! The scheduler owns N worker threads. Coroutines wait in a global FIFO
//! ready list; plain tasks flow through per-worker deques, a per-worker
//! single-slot fast path and a growing inject ring. A lazily-started timer
//! thread drives deadlines.

pub mod processor;
pub mod timer;

use std::any::Any;
use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use deque;
use num_cpus;

use coroutine::{Coroutine, Handle};
use options::Options;
use platform;

pub use self::processor::{Processor, ProcessorHandle};
pub use self::timer::{TimerCallback, TimerHandle};
use self::timer::TimerShared;

/// A plain work item: delivered exactly once, runs on a worker's stack and
/// must not block on channel operations.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const INJECT_INITIAL_CAP: usize = 2048;

/// A handle that can join a spawned coroutine
pub struct JoinHandle<T> {
    result: mpsc::Receiver<Result<T, Box<dyn Any + Send + 'static>>>,
}

impl<T> JoinHandle<T> {
    /// Join the coroutine until it finishes.
    ///
    /// If it already finished, this method returns immediately. Blocks the
    /// calling OS thread; do not call from inside a coroutine.
    pub fn join(&self) -> Result<T, Box<dyn Any + Send + 'static>> {
        self.result
            .recv()
            .expect("failed to receive the coroutine result")
    }
}

unsafe impl<T: Send> Send for JoinHandle<T> {}

/// Bounded FIFO ring for cross-thread task submission; capacity doubles
/// under the lock when full, so a push never fails.
struct InjectRing {
    buf: Vec<Option<Task>>,
    cap: usize,
    head: usize,
    tail: usize,
}

impl InjectRing {
    fn with_capacity(cap: usize) -> InjectRing {
        let mut buf = Vec::with_capacity(cap);
        for _ in 0..cap {
            buf.push(None);
        }
        InjectRing {
            buf: buf,
            cap: cap,
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, task: Task) {
        let mut next = (self.tail + 1) % self.cap;
        if next == self.head {
            self.grow(self.cap * 2);
            next = (self.tail + 1) % self.cap;
        }
        self.buf[self.tail] = Some(task);
        self.tail = next;
    }

    fn pop(&mut self) -> Option<Task> {
        if self.head == self.tail {
            return None;
        }
        let task = self.buf[self.head].take();
        self.head = (self.head + 1) % self.cap;
        task
    }

    fn grow(&mut self, new_cap: usize) {
        debug_assert!(new_cap > self.cap);
        let mut nb = Vec::with_capacity(new_cap);
        for _ in 0..new_cap {
            nb.push(None);
        }
        let mut i = 0;
        let mut h = self.head;
        while h != self.tail {
            nb[i] = self.buf[h].take();
            i += 1;
            h = (h + 1) % self.cap;
        }
        self.buf = nb;
        self.cap = new_cap;
        self.head = 0;
        self.tail = i;
    }

    fn clear(&mut self) {
        while self.pop().is_some() {}
    }
}

#[derive(Default)]
struct Stats {
    tasks_submitted: AtomicUsize,
    tasks_completed: AtomicUsize,
    ready_enqueued: AtomicUsize,
    steals: AtomicUsize,
    steal_probes: AtomicUsize,
    steal_failures: AtomicUsize,
    fastpath_hits: AtomicUsize,
    fastpath_misses: AtomicUsize,
    retired: AtomicUsize,
}

/// Snapshot of the scheduler's counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub ready_enqueued: u64,
    pub steals: u64,
    pub steal_probes: u64,
    pub steal_failures: u64,
    pub fastpath_hits: u64,
    pub fastpath_misses: u64,
    pub retired: u64,
}

/// Coroutine scheduler
pub struct Scheduler {
    workers: usize,
    stop: AtomicBool,

    ready: Mutex<VecDeque<Handle>>,
    park_mutex: Mutex<()>,
    park_cv: Condvar,

    inject: Mutex<InjectRing>,
    fast_slots: Vec<Mutex<Option<Task>>>,
    rr: AtomicUsize,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    timer: Arc<TimerShared>,

    /// Tasks submitted but not yet completed
    pending_tasks: AtomicUsize,
    /// Coroutines taken off the ready list and currently being resumed
    running: AtomicUsize,

    stats: Stats,
}

impl Scheduler {
    /// Create a scheduler with `workers` worker threads; `0` means hardware
    /// concurrency.
    pub fn new(workers: usize) -> Arc<Scheduler> {
        let n = if workers == 0 { num_cpus::get() } else { workers };

        let mut locals = Vec::with_capacity(n);
        let mut stealers = Vec::with_capacity(n);
        for _ in 0..n {
            let (worker, stealer) = deque::new();
            locals.push(worker);
            stealers.push(stealer);
        }

        let mut fast_slots = Vec::with_capacity(n);
        for _ in 0..n {
            fast_slots.push(Mutex::new(None));
        }

        let sched = Arc::new(Scheduler {
            workers: n,
            stop: AtomicBool::new(false),
            ready: Mutex::new(VecDeque::new()),
            park_mutex: Mutex::new(()),
            park_cv: Condvar::new(),
            inject: Mutex::new(InjectRing::with_capacity(INJECT_INITIAL_CAP)),
            fast_slots: fast_slots,
            rr: AtomicUsize::new(0),
            threads: Mutex::new(Vec::with_capacity(n)),
            timer: TimerShared::new(),
            pending_tasks: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            stats: Stats::default(),
        });

        info!("scheduler: starting {} workers", n);
        {
            let mut threads = sched.threads.lock().unwrap();
            for (id, worker) in locals.into_iter().enumerate() {
                let sched2 = sched.clone();
                let stealers2 = stealers.clone();
                let handle = thread::Builder::new()
                    .name(format!("weft-worker-{}", id))
                    .spawn(move || {
                        let mut p = Processor::new(id, sched2, worker, stealers2);
                        Processor::set_tls(&mut p);
                        p.run();
                        Processor::clear_tls();
                    })
                    .expect("failed to spawn a worker thread");
                threads.push(handle);
            }
        }

        sched
    }

    /// The scheduler of the current worker thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        Processor::current().map(|p| p.scheduler().clone())
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // ---------------- coroutines ----------------

    /// Spawn a coroutine with default options
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_opts(f, Options::new())
    }

    /// Spawn a coroutine with options, returning a handle to its result.
    ///
    /// After `shutdown` this is a no-op and joining the handle panics.
    pub fn spawn_opts<F, T>(&self, f: F, opts: Options) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let wrapper = move || {
            let ret = panic::catch_unwind(panic::AssertUnwindSafe(f));
            // The spawner may have dropped the handle; ignore send failures.
            let _ = tx.send(ret);
        };
        let coro = Coroutine::spawn_opts(wrapper, opts);
        self.enqueue_ready(coro);

        JoinHandle { result: rx }
    }

    /// Make a coroutine runnable. No-op once the scheduler has stopped.
    pub fn enqueue_ready(&self, coro: Handle) {
        if self.is_stopped() {
            trace!("enqueue_ready after stop; dropping `{}`", coro.debug_name());
            return;
        }
        {
            let mut ready = self.ready.lock().unwrap();
            ready.push_back(coro);
        }
        self.stats.ready_enqueued.fetch_add(1, Ordering::Relaxed);
        self.park_cv.notify_one();
    }

    /// Pop the head of the ready list
    pub fn ready_pop(&self) -> Option<Handle> {
        let coro = self.ready.lock().unwrap().pop_front();
        if coro.is_some() {
            self.running.fetch_add(1, Ordering::SeqCst);
        }
        coro
    }

    // ---------------- plain tasks ----------------

    /// Submit a plain task.
    ///
    /// From a worker of this scheduler the task lands on the worker's own
    /// deque; otherwise it round-robins over the per-worker fast-path slots
    /// and falls back to the inject ring, which grows instead of failing.
    pub fn spawn_task<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return;
        }
        let task: Task = Box::new(f);

        if let Some(mut p) = Processor::current() {
            let same = {
                let a: *const Scheduler = &**p.scheduler();
                a == self as *const Scheduler
            };
            if same {
                self.pending_tasks.fetch_add(1, Ordering::SeqCst);
                self.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);
                p.spawn_local(task);
                self.park_cv.notify_one();
                return;
            }
        }

        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % self.workers;
        let mut task = Some(task);
        {
            let mut slot = self.fast_slots[idx].lock().unwrap();
            if slot.is_none() {
                *slot = task.take();
            }
        }
        match task {
            None => {
                self.stats.fastpath_hits.fetch_add(1, Ordering::Relaxed);
            }
            Some(task) => {
                self.stats.fastpath_misses.fetch_add(1, Ordering::Relaxed);
                self.inject.lock().unwrap().push(task);
            }
        }
        self.pending_tasks.fetch_add(1, Ordering::SeqCst);
        self.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        self.park_cv.notify_one();
    }

    pub fn fast_slot_take(&self, id: usize) -> Option<Task> {
        self.fast_slots[id].lock().unwrap().take()
    }

    pub fn inject_pop(&self) -> Option<Task> {
        self.inject.lock().unwrap().pop()
    }

    // ---------------- cooperative helpers ----------------

    /// Yield the current coroutine; from outside a coroutine, yields the
    /// OS thread.
    pub fn yield_now(&self) {
        match Processor::current() {
            Some(p) => {
                if p.has_coroutine() {
                    p.sched();
                    return;
                }
                thread::yield_now();
            }
            None => thread::yield_now(),
        }
    }

    /// Put the current coroutine to sleep; from outside a coroutine, sleeps
    /// the OS thread.
    pub fn sleep_ms(&self, delay_ms: u64) {
        match Processor::current() {
            Some(p) if p.has_coroutine() => {
                let timer = self.timer.clone();
                TimerShared::ensure_started(&self.timer);
                p.park_with(move |p, coro| {
                    let weak = Arc::downgrade(p.scheduler());
                    timer.schedule_after(
                        delay_ms,
                        Box::new(move || {
                            if let Some(sched) = weak.upgrade() {
                                sched.enqueue_ready(coro);
                            }
                        }),
                    );
                });
            }
            _ => thread::sleep(Duration::from_millis(delay_ms)),
        }
    }

    // ---------------- timers ----------------

    /// Schedule `cb` at an absolute monotonic deadline. `None` after stop.
    pub fn timer_at(&self, deadline_ns: u64, cb: TimerCallback) -> Option<TimerHandle> {
        if self.is_stopped() {
            return None;
        }
        TimerShared::ensure_started(&self.timer);
        Some(self.timer.schedule_at(deadline_ns, cb))
    }

    /// Schedule `cb` after `delay_ms` milliseconds. `None` after stop.
    pub fn timer_after(&self, delay_ms: u64, cb: TimerCallback) -> Option<TimerHandle> {
        self.timer_at(platform::now_ns() + delay_ms * 1_000_000, cb)
    }

    /// Cancel a pending timer; `false` once it has fired
    pub fn timer_cancel(&self, handle: TimerHandle) -> bool {
        self.timer.cancel(handle)
    }

    // ---------------- lifecycle ----------------

    /// Wait until no coroutine is ready or running and no task is pending,
    /// or until the timeout expires. Parked coroutines do not count.
    pub fn drain(&self, timeout_ms: i64) {
        let deadline = platform::deadline_after_ms(timeout_ms);
        loop {
            let ready_empty = self.ready.lock().unwrap().is_empty();
            let idle = self.pending_tasks.load(Ordering::SeqCst) == 0
                && self.running.load(Ordering::SeqCst) == 0;
            if ready_empty && idle {
                return;
            }
            if let Some(d) = deadline {
                if platform::now_ns() >= d {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop the scheduler: set the stop flag, wake everything, join the
    /// workers and the timer thread, and drop queued work.
    ///
    /// Must be called from outside the worker pool. Coroutines parked in
    /// channels are abandoned in place; their storage is released when the
    /// owning structure drops.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("scheduler: shutting down");

        {
            let _g = self.park_mutex.lock().unwrap();
            self.park_cv.notify_all();
        }
        self.timer.shutdown();

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        self.ready.lock().unwrap().clear();
        for slot in &self.fast_slots {
            slot.lock().unwrap().take();
        }
        self.inject.lock().unwrap().clear();
    }

    /// Counter snapshot
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_submitted: self.stats.tasks_submitted.load(Ordering::Relaxed) as u64,
            tasks_completed: self.stats.tasks_completed.load(Ordering::Relaxed) as u64,
            ready_enqueued: self.stats.ready_enqueued.load(Ordering::Relaxed) as u64,
            steals: self.stats.steals.load(Ordering::Relaxed) as u64,
            steal_probes: self.stats.steal_probes.load(Ordering::Relaxed) as u64,
            steal_failures: self.stats.steal_failures.load(Ordering::Relaxed) as u64,
            fastpath_hits: self.stats.fastpath_hits.load(Ordering::Relaxed) as u64,
            fastpath_misses: self.stats.fastpath_misses.load(Ordering::Relaxed) as u64,
            retired: self.stats.retired.load(Ordering::Relaxed) as u64,
        }
    }

    // ---------------- worker hooks ----------------

    pub(crate) fn park_worker(&self) {
        let guard = self.park_mutex.lock().unwrap();
        let _ = self
            .park_cv
            .wait_timeout(guard, Duration::from_millis(1))
            .unwrap();
    }

    pub(crate) fn note_task_completed(&self) {
        self.pending_tasks.fetch_sub(1, Ordering::SeqCst);
        self.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_retired(&self) {
        self.stats.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_resume_done(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn note_steal(&self) {
        self.stats.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_steal_probe(&self) {
        self.stats.steal_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_steal_failure(&self) {
        self.stats.steal_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_inject_ring_fifo() {
        let mut ring = InjectRing::with_capacity(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            ring.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        while let Some(task) = ring.pop() {
            task();
        }
        assert_eq!(&*log.lock().unwrap(), &[0, 1, 2]);
    }

    #[test]
    fn test_inject_ring_grows() {
        let mut ring = InjectRing::with_capacity(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            ring.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert!(ring.cap > 2);
        while let Some(task) = ring.pop() {
            task();
        }
        assert_eq!(&*log.lock().unwrap(), &(0..10).collect::<Vec<_>>());
    }
}
