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

//! Deadline timers
//!
//! One lazily-started thread sleeps until the earliest unexpired deadline in
//! a min-heap and then runs the item's callback. Cancellation marks the item
//! and is honored when it reaches the top of the heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use linked_hash_map::LinkedHashMap;

use platform;

/// Callback invoked on the timer thread when a deadline expires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
}

struct TimerItem {
    id: u64,
    when_ns: u64,
    cancelled: AtomicBool,
    callback: Mutex<Option<TimerCallback>>,
}

/// Heap entry ordered so that `BinaryHeap` pops the earliest deadline first
struct HeapEntry(Arc<TimerItem>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.0.when_ns == other.0.when_ns && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> CmpOrdering {
        // Reversed: the max-heap surfaces the smallest deadline, ties broken
        // by creation order.
        other
            .0
            .when_ns
            .cmp(&self.0.when_ns)
            .then(other.0.id.cmp(&self.0.id))
    }
}

struct TimerQueues {
    heap: BinaryHeap<HeapEntry>,
    /// Pending items by id; entries leave the map when they fire or when a
    /// cancelled item reaches the heap top.
    by_id: LinkedHashMap<u64, Arc<TimerItem>>,
    next_id: u64,
}

/// Shared state between submitters and the timer thread
pub struct TimerShared {
    queues: Mutex<TimerQueues>,
    cv: Condvar,
    stop: AtomicBool,
    started: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerShared {
    pub fn new() -> Arc<TimerShared> {
        Arc::new(TimerShared {
            queues: Mutex::new(TimerQueues {
                heap: BinaryHeap::new(),
                by_id: LinkedHashMap::new(),
                next_id: 1,
            }),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Start the timer thread on first use
    pub fn ensure_started(this: &Arc<TimerShared>) {
        if this
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = this.clone();
            let handle = thread::Builder::new()
                .name("weft-timer".to_string())
                .spawn(move || shared.run())
                .expect("failed to spawn the timer thread");
            *this.thread.lock().unwrap() = Some(handle);
        }
    }

    /// Schedule `callback` at an absolute monotonic deadline
    pub fn schedule_at(&self, deadline_ns: u64, callback: TimerCallback) -> TimerHandle {
        let mut q = self.queues.lock().unwrap();
        let id = q.next_id;
        q.next_id += 1;

        let item = Arc::new(TimerItem {
            id: id,
            when_ns: deadline_ns,
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        });
        q.by_id.insert(id, item.clone());
        q.heap.push(HeapEntry(item));
        self.cv.notify_all();

        TimerHandle { id: id }
    }

    /// Schedule `callback` after a relative delay in milliseconds
    pub fn schedule_after(&self, delay_ms: u64, callback: TimerCallback) -> TimerHandle {
        self.schedule_at(platform::now_ns() + delay_ms * 1_000_000, callback)
    }

    /// Cancel a pending timer.
    ///
    /// Returns `false` once the item has fired or is unknown. The heap entry
    /// is reclaimed lazily when it reaches the top.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let q = self.queues.lock().unwrap();
        match q.by_id.get(&handle.id) {
            Some(item) => {
                item.cancelled.store(true, Ordering::Release);
                self.cv.notify_all();
                true
            }
            None => false,
        }
    }

    /// Number of pending items (cancelled-but-unreaped included)
    pub fn pending(&self) -> usize {
        self.queues.lock().unwrap().by_id.len()
    }

    /// Stop the timer thread, join it and drop all pending items
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        {
            let _q = self.queues.lock().unwrap();
            self.cv.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut q = self.queues.lock().unwrap();
        q.heap.clear();
        q.by_id.clear();
    }

    fn run(&self) {
        trace!("timer thread: starts");
        loop {
            let item = {
                let mut q = self.queues.lock().unwrap();
                let fired;
                loop {
                    if self.stop.load(Ordering::SeqCst) {
                        trace!("timer thread: stop observed");
                        return;
                    }
                    let (when, top_cancelled) = match q.heap.peek() {
                        None => {
                            q = self.cv.wait(q).unwrap();
                            continue;
                        }
                        Some(entry) => (
                            entry.0.when_ns,
                            entry.0.cancelled.load(Ordering::Acquire),
                        ),
                    };
                    if top_cancelled {
                        let entry = q.heap.pop().unwrap();
                        q.by_id.remove(&entry.0.id);
                        continue;
                    }
                    let now = platform::now_ns();
                    if when > now {
                        let (guard, _) = self
                            .cv
                            .wait_timeout(q, Duration::from_nanos(when - now))
                            .unwrap();
                        q = guard;
                        continue;
                    }
                    let entry = q.heap.pop().unwrap();
                    q.by_id.remove(&entry.0.id);
                    fired = entry.0;
                    break;
                }
                fired
            };

            if !item.cancelled.load(Ordering::Acquire) {
                if let Some(cb) = item.callback.lock().unwrap().take() {
                    cb();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let shared = TimerShared::new();
        TimerShared::ensure_started(&shared);

        let (tx, rx) = mpsc::channel();
        let t1 = tx.clone();
        let t2 = tx.clone();
        shared.schedule_after(30, Box::new(move || t1.send(2).unwrap()));
        shared.schedule_after(5, Box::new(move || t2.send(1).unwrap()));

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        shared.shutdown();
    }

    #[test]
    fn test_cancel_pending() {
        let shared = TimerShared::new();
        TimerShared::ensure_started(&shared);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = shared.schedule_after(50, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(shared.cancel(handle));

        thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // A second cancel may race lazy reaping; either way the callback
        // must not have run.
        shared.shutdown();
    }

    #[test]
    fn test_cancel_after_fire_is_false() {
        let shared = TimerShared::new();
        TimerShared::ensure_started(&shared);

        let (tx, rx) = mpsc::channel();
        let handle = shared.schedule_after(1, Box::new(move || tx.send(()).unwrap()));
        rx.recv().unwrap();
        assert!(!shared.cancel(handle));
        shared.shutdown();
    }
}
