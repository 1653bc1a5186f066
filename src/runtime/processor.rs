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

//! Processing unit of a worker thread

use std::cell::UnsafeCell;
use std::cmp;
use std::fmt;
use std::mem;
use std::sync::Arc;

use deque::{Stealer, Stolen, Worker};
use rand::{self, Rng};

use coroutine::{Handle, State};
use runtime::{Scheduler, Task};

thread_local!(static PROCESSOR: UnsafeCell<Option<*mut Processor>> = UnsafeCell::new(None));

/// Control handle for the processor of the current worker thread.
///
/// A coroutine that parks and is later resumed may find itself on a
/// different worker, so a `ProcessorHandle` must never be cached across a
/// suspension point; acquire a fresh one with `Processor::current()`.
pub struct ProcessorHandle(&'static mut Processor);

impl ProcessorHandle {
    #[inline]
    pub fn id(&self) -> usize {
        self.0.id()
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.0.scheduler()
    }

    /// Whether a coroutine is currently running on this processor.
    ///
    /// Plain tasks run directly on the worker stack; they must not block on
    /// channel operations.
    #[inline]
    pub fn has_coroutine(&self) -> bool {
        self.0.current_coro.is_some()
    }

    /// The coroutine currently running on this processor
    #[inline]
    pub fn current(&mut self) -> Option<&mut Handle> {
        self.0.current_coro.as_mut()
    }

    /// Push a task onto this worker's own deque (LIFO end)
    #[inline]
    pub fn spawn_local(&mut self, task: Task) {
        self.0.worker.push(task);
    }

    /// Yield the current coroutine back to the ready list
    #[inline]
    pub fn sched(self) {
        self.0.sched()
    }

    /// Obtains the currently running coroutine after setting its state to
    /// `Parked`, and hands its owning `Handle` to `f` on the worker side of
    /// the switch.
    ///
    /// `f` typically stores the handle in a channel waiter queue or a select
    /// core; a lock guard moved into `f` is released there, after the
    /// coroutine is fully suspended, which closes the lost-wakeup window
    /// between queue registration and the context switch.
    ///
    /// - *DO NOT* call scheduler methods other than `enqueue_ready` inside
    ///   `f`.
    /// - *DO NOT* drop the handle inside `f` unless the coroutine must be
    ///   abandoned.
    pub fn park_with<'scope, F>(self, f: F)
    where
        F: FnOnce(&mut Processor, Handle) + 'scope,
    {
        let processor = self.0;

        debug_assert!(
            processor.current_coro.is_some(),
            "parking without a running coroutine"
        );

        // Carry a monomorphized bridge function and a pointer to the
        // callback across the switch; the worker decodes it in resume().
        let mut f = Some(f);
        let mut carrier = Some((carrier_fn::<F> as usize, &mut f as *mut _ as usize));

        if let Some(ref mut coro) = processor.current_coro {
            trace!("coroutine `{}`: parking", coro.debug_name());
            coro.yield_with(State::Parked, &mut carrier as *mut _ as usize);
        }

        // Bridge executed on the worker context
        fn carrier_fn<F>(data: usize, p: &mut Processor, coro: Handle)
        where
            F: FnOnce(&mut Processor, Handle),
        {
            let f = unsafe {
                (&mut *(data as *mut Option<F>))
                    .take()
                    .expect("park carrier already taken")
            };
            f(p, coro);
        }
    }
}

/// Per-worker processing unit: local deque end, steal handles and the
/// resume/park machinery. Lives on the worker thread's stack for the whole
/// life of the scheduler.
pub struct Processor {
    id: usize,
    sched: Arc<Scheduler>,

    // NOTE: ONLY to be used by resume() and park_with().
    current_coro: Option<Handle>,

    rng: rand::XorShiftRng,
    worker: Worker<Task>,
    stealers: Vec<Stealer<Task>>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Processor(#{})", self.id)
    }
}

impl Processor {
    pub fn new(
        id: usize,
        sched: Arc<Scheduler>,
        worker: Worker<Task>,
        stealers: Vec<Stealer<Task>>,
    ) -> Processor {
        Processor {
            id: id,
            sched: sched,
            current_coro: None,
            rng: rand::weak_rng(),
            worker: worker,
            stealers: stealers,
        }
    }

    /// Get the processor of the current worker thread
    pub fn current() -> Option<ProcessorHandle> {
        PROCESSOR.with(|p| unsafe { (*p.get()).map(|ptr| ProcessorHandle(&mut *ptr)) })
    }

    /// Install `p` as this thread's processor. Called by the worker entry
    /// function before the loop starts.
    pub fn set_tls(p: &mut Processor) {
        let ptr = p as *mut Processor;
        PROCESSOR.with(|slot| unsafe {
            *slot.get() = Some(ptr);
        });
    }

    /// Clear the thread-local processor on worker exit
    pub fn clear_tls() {
        PROCESSOR.with(|slot| unsafe {
            *slot.get() = None;
        });
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Run the worker loop until the scheduler stops.
    ///
    /// Priority per iteration: ready coroutines, local tasks (LIFO), the
    /// fast-path slot, stealing from neighbors (FIFO), the inject ring, and
    /// finally a bounded park.
    pub fn run(&mut self) {
        trace!("{:?}: starts", self);

        while !self.sched.is_stopped() {
            // 1) Ready coroutines
            if let Some(coro) = self.sched.ready_pop() {
                self.resume(coro);
                continue;
            }

            // 2) Local tasks
            if let Some(task) = self.worker.pop() {
                self.run_task(task);
                continue;
            }

            // 2b) Per-worker fast-path slot
            if let Some(task) = self.sched.fast_slot_take(self.id) {
                self.run_task(task);
                continue;
            }

            // 3) Steal from neighbors
            if let Some(task) = self.try_steal() {
                self.run_task(task);
                continue;
            }

            // 4) Inject ring
            if let Some(task) = self.sched.inject_pop() {
                self.run_task(task);
                continue;
            }

            // 5) Park briefly
            self.sched.park_worker();
        }

        // Drop whatever is left in the local deque.
        while let Some(task) = self.worker.pop() {
            drop(task);
        }

        trace!("{:?}: is shutdown", self);
    }

    fn run_task(&mut self, task: Task) {
        task();
        self.sched.note_task_completed();
    }

    fn try_steal(&mut self) -> Option<Task> {
        let n = self.stealers.len();
        if n <= 1 {
            return None;
        }

        let start = self.rng.gen::<usize>() % n;
        let probes = cmp::min(n, 4) - 1;
        let mut probed = 0;
        let mut k = 0;
        while probed < probes && k < n {
            let victim = (start + k) % n;
            k += 1;
            if victim == self.id {
                continue;
            }
            probed += 1;
            self.sched.note_steal_probe();
            if let Stolen::Data(task) = self.stealers[victim].steal() {
                trace!("{:?}: stole a task from worker {}", self, victim);
                self.sched.note_steal();
                return Some(task);
            }
        }
        self.sched.note_steal_failure();
        None
    }

    /// Resume a coroutine and dispatch on how it came back
    fn resume(&mut self, coro: Handle) {
        debug_assert!(!coro.is_finished(), "cannot resume a finished coroutine");

        trace!("{:?}: resuming coroutine `{}`", self, coro.debug_name());
        self.current_coro = Some(coro);
        let data = {
            match self.current_coro {
                Some(ref mut c) => c.resume(0),
                None => 0,
            }
        };

        let coro = self
            .current_coro
            .take()
            .expect("current coroutine disappeared across resume");

        match coro.state() {
            State::Suspended => {
                trace!("coroutine `{}`: yielded", coro.debug_name());
                self.sched.enqueue_ready(coro);
            }
            State::Parked => {
                // Take out the carrier and run the bridge with the handle.
                let carrier = unsafe {
                    (&mut *(data as *mut Option<(usize, usize)>))
                        .take()
                        .expect("parked coroutine without a carrier")
                };
                let bridge: fn(usize, &mut Processor, Handle) =
                    unsafe { mem::transmute(carrier.0) };
                bridge(carrier.1, self, coro);
            }
            State::Finished => {
                trace!("coroutine `{}`: retired", coro.debug_name());
                self.sched.note_retired();
                drop(coro);
            }
            s => {
                panic!(
                    "coroutine `{}` yielded with invalid state {:?}",
                    coro.debug_name(),
                    s
                );
            }
        }
        self.sched.note_resume_done();
    }

    /// Suspend the current coroutine back to the ready list
    pub fn sched(&mut self) {
        if let Some(ref mut coro) = self.current_coro {
            coro.yield_with(State::Suspended, 0);
        }
    }
}
