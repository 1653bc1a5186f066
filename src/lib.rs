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

//! Stackful coroutines multiplexed over a pool of worker threads, with
//! typed channels, a multi-way `Select`, hierarchical cancellation and a
//! zero-copy descriptor path.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{Buffered, Channel, Scheduler};
//!
//! let sched = Scheduler::new(2);
//! let chan: Arc<Buffered<u64>> = Buffered::new(&sched, 16);
//!
//! let tx = chan.clone();
//! let producer = sched.spawn(move || {
//!     for i in 0..100u64 {
//!         tx.send(i, -1).unwrap();
//!     }
//!     tx.close();
//! });
//!
//! let rx = chan.clone();
//! let consumer = sched.spawn(move || {
//!     let mut sum = 0u64;
//!     while let Ok(v) = rx.recv(-1) {
//!         sum += v;
//!     }
//!     sum
//! });
//!
//! producer.join().unwrap();
//! assert_eq!(consumer.join().unwrap(), 4950);
//! sched.shutdown();
//! ```

#[macro_use]
extern crate log;

extern crate context;
extern crate deque;
extern crate libc;
extern crate linked_hash_map;
extern crate num_cpus;
extern crate rand;
extern crate time;

#[cfg(test)]
extern crate env_logger;

pub mod coroutine;
pub mod options;
pub mod platform;
pub mod runtime;
pub mod sync;
pub mod zref;

pub use options::Options;
pub use runtime::{JoinHandle, Scheduler, SchedulerStats, TimerHandle};
pub use sync::cancel::CancelToken;
pub use sync::channel::{
    compute_rates, Buffered, ChanError, ChanResult, Channel, ChannelMetricsConfig,
    ChannelMetricsEvent, ChannelSnapshot, Conflated, Payload, Rendezvous, Unbounded, ValueCell,
    CAP_ZERO_COPY,
};
pub use sync::select::{Select, SelectCore, SelectOp, SelectPolicy};
pub use zref::{
    DType, FormatMask, FormatMode, FormatPolicy, RegionId, RegionMeta, RegionRegistry,
    ZBuffered, ZDesc, ZRendezvous, FMT_ALIGN, FMT_DIMS, FMT_DTYPE, FMT_ELEMBITS, FMT_LAYOUT,
    FMT_STRIDE,
};

/// Spawn a coroutine on the current worker's scheduler.
///
/// Panics when called from outside the worker pool; use
/// `Scheduler::spawn` with an explicit scheduler there.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Scheduler::current()
        .expect("weft::spawn requires a scheduler worker")
        .spawn(f)
}

/// Give up the CPU: the current coroutine goes to the back of the ready
/// list. Outside a coroutine this yields the OS thread.
pub fn yield_now() {
    match Scheduler::current() {
        Some(sched) => sched.yield_now(),
        None => ::std::thread::yield_now(),
    }
}

/// Put the current coroutine (or, outside the pool, the OS thread) to
/// sleep for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    match Scheduler::current() {
        Some(sched) => sched.sleep_ms(ms),
        None => ::std::thread::sleep(::std::time::Duration::from_millis(ms)),
    }
}
