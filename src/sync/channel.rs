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

//! Typed channels between coroutines
//!
//! Four variants share the `Channel` trait: `Rendezvous` (no buffer),
//! `Buffered` (bounded ring), `Conflated` (latest value wins) and
//! `Unbounded` (growing FIFO). Timeout convention on every operation:
//! negative blocks forever, zero never blocks, positive is a bound in
//! milliseconds.
//!
//! A blocked operation parks its coroutine and hands the owning `Handle`
//! into the channel's waiter queue on the worker side of the context switch
//! (see `ProcessorHandle::park_with`); the matching operation moves the
//! handle to the scheduler's ready list. Timed waits additionally arm a
//! timer that pulls the waiter back out of the queue.

use std::cmp;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, Weak};

use linked_hash_map::LinkedHashMap;

use coroutine::Handle;
use platform;
use runtime::{Processor, Scheduler, TimerHandle};
use sync::cancel::CancelToken;
use sync::select::{SelectCore, SelectOp};

/// How long a cancellable wait sleeps between checks of its token
const CANCEL_POLL_MS: u64 = 5;

/// Channel operation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanError {
    /// The operation would have to block
    WouldBlock,
    /// The channel is closed (and drained, for receives)
    Closed,
    /// The timeout expired
    Timeout,
    /// The cancellation token fired
    Canceled,
    /// The backend does not support this operation
    Unsupported,
    /// A strict format policy rejected the descriptor
    InvalidFormat,
}

pub type ChanResult<T> = Result<T, ChanError>;

/// Byte accounting for channel metrics.
///
/// The default charges the in-memory size of the value; descriptor-like
/// payloads override this with the length they refer to.
pub trait Payload: Send + 'static {
    fn byte_len(&self) -> usize {
        mem::size_of_val(self)
    }
}

macro_rules! plain_payload {
    ($($t:ty),*) => {
        $(impl Payload for $t {})*
    }
}

plain_payload!((), bool, char, u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64);

impl Payload for String {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Payload for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Payload for ChannelMetricsEvent {}

/// Channel capability bit: the channel moves zero-copy descriptors
pub const CAP_ZERO_COPY: u32 = 1 << 0;

/// Totals a channel has seen so far
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelSnapshot {
    pub total_sends: u64,
    pub total_recvs: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub total_wouldblock: u64,
    pub total_timeout: u64,
    pub total_canceled: u64,
    pub total_closed: u64,
    pub first_op_time_ns: u64,
    pub last_op_time_ns: u64,
    pub caps: u32,
}

/// Throughput between two snapshots: `(sends/s, recvs/s, interval in s)`
pub fn compute_rates(a: &ChannelSnapshot, b: &ChannelSnapshot) -> (f64, f64, f64) {
    let mut interval = (b.last_op_time_ns as f64 - a.last_op_time_ns as f64) / 1e9;
    if interval <= 0.0 {
        interval = 1e-6;
    }
    let sends = (b.total_sends - a.total_sends) as f64 / interval;
    let recvs = (b.total_recvs - a.total_recvs) as f64 / interval;
    (sends, recvs, interval)
}

/// When to emit a metrics event: whichever of the two thresholds trips first
#[derive(Debug, Clone, Copy)]
pub struct ChannelMetricsConfig {
    pub emit_min_ops: u64,
    pub emit_min_ms: u64,
}

impl Default for ChannelMetricsConfig {
    fn default() -> ChannelMetricsConfig {
        ChannelMetricsConfig {
            emit_min_ops: 1024,
            emit_min_ms: 50,
        }
    }
}

/// Event sent on a metrics pipe
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelMetricsEvent {
    /// Identity of the emitting channel
    pub chan: usize,
    pub total_sends: u64,
    pub total_recvs: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub delta_sends: u64,
    pub delta_recvs: u64,
    pub delta_bytes_sent: u64,
    pub delta_bytes_recv: u64,
    pub first_op_time_ns: u64,
    pub last_op_time_ns: u64,
    pub emit_time_ns: u64,
}

/// Per-channel counters plus the optional metrics pipe. Lives inside the
/// channel's state mutex, so plain fields suffice.
pub(crate) struct Metrics {
    snap: ChannelSnapshot,
    pipe: Option<Arc<dyn Channel<ChannelMetricsEvent>>>,
    cfg: ChannelMetricsConfig,
    last_sends: u64,
    last_recvs: u64,
    last_bytes_sent: u64,
    last_bytes_recv: u64,
    last_emit_ns: u64,
    pub ident: usize,
}

impl Metrics {
    pub fn new(caps: u32) -> Metrics {
        let mut snap = ChannelSnapshot::default();
        snap.caps = caps;
        Metrics {
            snap: snap,
            pipe: None,
            cfg: ChannelMetricsConfig::default(),
            last_sends: 0,
            last_recvs: 0,
            last_bytes_sent: 0,
            last_bytes_recv: 0,
            last_emit_ns: 0,
            ident: 0,
        }
    }

    pub fn set_pipe(
        &mut self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.pipe = Some(pipe);
        self.cfg = cfg;
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snap
    }

    pub fn bump_send(&mut self, bytes: usize) {
        let now = platform::now_ns();
        if self.snap.first_op_time_ns == 0 {
            self.snap.first_op_time_ns = now;
        }
        self.snap.last_op_time_ns = now;
        self.snap.total_sends += 1;
        self.snap.total_bytes_sent += bytes as u64;
        self.maybe_emit(now);
    }

    pub fn bump_recv(&mut self, bytes: usize) {
        let now = platform::now_ns();
        if self.snap.first_op_time_ns == 0 {
            self.snap.first_op_time_ns = now;
        }
        self.snap.last_op_time_ns = now;
        self.snap.total_recvs += 1;
        self.snap.total_bytes_recv += bytes as u64;
        self.maybe_emit(now);
    }

    pub fn bump_err(&mut self, e: ChanError) {
        match e {
            ChanError::WouldBlock => self.snap.total_wouldblock += 1,
            ChanError::Timeout => self.snap.total_timeout += 1,
            ChanError::Canceled => self.snap.total_canceled += 1,
            ChanError::Closed => self.snap.total_closed += 1,
            _ => {}
        }
    }

    fn maybe_emit(&mut self, now: u64) {
        let pipe = match self.pipe {
            Some(ref p) => p.clone(),
            None => return,
        };
        let delta_ops = (self.snap.total_sends - self.last_sends)
            + (self.snap.total_recvs - self.last_recvs);
        let since_ns = now.saturating_sub(self.last_emit_ns);
        if delta_ops < self.cfg.emit_min_ops && since_ns < self.cfg.emit_min_ms * 1_000_000 {
            return;
        }

        let ev = ChannelMetricsEvent {
            chan: self.ident,
            total_sends: self.snap.total_sends,
            total_recvs: self.snap.total_recvs,
            total_bytes_sent: self.snap.total_bytes_sent,
            total_bytes_recv: self.snap.total_bytes_recv,
            delta_sends: self.snap.total_sends - self.last_sends,
            delta_recvs: self.snap.total_recvs - self.last_recvs,
            delta_bytes_sent: self.snap.total_bytes_sent - self.last_bytes_sent,
            delta_bytes_recv: self.snap.total_bytes_recv - self.last_bytes_recv,
            first_op_time_ns: self.snap.first_op_time_ns,
            last_op_time_ns: self.snap.last_op_time_ns,
            emit_time_ns: now,
        };
        // Best effort: drop the event when the pipe is full.
        let _ = pipe.send(ev, 0);
        self.last_sends = ev.total_sends;
        self.last_recvs = ev.total_recvs;
        self.last_bytes_sent = ev.total_bytes_sent;
        self.last_bytes_recv = ev.total_bytes_recv;
        self.last_emit_ns = now;
    }
}

/// One-value slot shared between a blocked operation and the waiter record
/// the channel keeps for it. The party that completes the operation moves
/// the value through the cell.
pub struct ValueCell<T> {
    slot: Mutex<Option<T>>,
}

impl<T> ValueCell<T> {
    pub fn new(v: Option<T>) -> Arc<ValueCell<T>> {
        Arc::new(ValueCell {
            slot: Mutex::new(v),
        })
    }

    pub fn put(&self, v: T) {
        *self.slot.lock().unwrap() = Some(v);
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().unwrap().is_none()
    }
}

/// The common channel interface.
///
/// The select hooks claim the select's completion latch *before* moving any
/// value, so a losing clause can never consume one. `Ok` from a register
/// hook means the clause won immediately; `Err(WouldBlock)` means a waiter
/// record was queued (or the select was already decided elsewhere).
pub trait Channel<T: Payload>: Send + Sync {
    fn send(&self, val: T, timeout_ms: i64) -> ChanResult<()>;
    fn recv(&self, timeout_ms: i64) -> ChanResult<T>;
    fn send_cancellable(&self, val: T, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<()>;
    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<T>;
    fn close(&self);
    fn len(&self) -> usize;
    fn is_closed(&self) -> bool;
    fn snapshot(&self) -> ChannelSnapshot;

    fn select_register_recv(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()>;
    fn select_register_send(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()>;
    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp);
}

/// Deferred wake-up collected under a channel lock and performed after it
/// is released
pub(crate) enum Wakeup {
    Co(Handle),
    Core(Arc<SelectCore>),
}

pub(crate) fn flush_wakeups(sched: &Scheduler, wake: Vec<Wakeup>) {
    for w in wake {
        match w {
            Wakeup::Co(co) => sched.enqueue_ready(co),
            Wakeup::Core(core) => core.wake(sched),
        }
    }
}

/// Absolute deadline of the next bounded park: the operation deadline, the
/// cancellation poll slice, or neither.
pub(crate) fn next_wake(deadline: Option<u64>, cancellable: bool) -> Option<u64> {
    let poll = if cancellable {
        Some(platform::now_ns() + CANCEL_POLL_MS * 1_000_000)
    } else {
        None
    };
    match (deadline, poll) {
        (Some(d), Some(p)) => Some(cmp::min(d, p)),
        (Some(d), None) => Some(d),
        (None, p) => p,
    }
}

pub(crate) fn expired(deadline: Option<u64>) -> bool {
    match deadline {
        Some(d) => platform::now_ns() >= d,
        None => false,
    }
}

pub(crate) fn canceled(token: Option<&CancelToken>) -> bool {
    match token {
        Some(t) => t.is_set(),
        None => false,
    }
}

/// A waiter in a rendezvous queue: either a parked coroutine or a
/// registered select clause, both with the cell the value moves through
enum Waiter<T> {
    Co {
        co: Handle,
        cell: Arc<ValueCell<T>>,
    },
    Sel {
        core: Arc<SelectCore>,
        index: usize,
        cell: Arc<ValueCell<T>>,
    },
}

/// A registered select clause waiting on a buffered-family channel
pub(crate) struct SelWaiter<T> {
    pub(crate) core: Arc<SelectCore>,
    pub(crate) index: usize,
    pub(crate) cell: Arc<ValueCell<T>>,
}

pub(crate) fn sel_matches<T>(w: &SelWaiter<T>, core: &Arc<SelectCore>, index: usize) -> bool {
    Arc::ptr_eq(&w.core, core) && w.index == index
}

// ---------------------------------------------------------------------------
// Rendezvous
// ---------------------------------------------------------------------------

/// Zero-buffer channel: a send completes only when a receive takes the value
pub struct Rendezvous<T: Payload> {
    sched: Arc<Scheduler>,
    inner: Arc<Mutex<RvInner<T>>>,
}

struct RvInner<T> {
    closed: bool,
    next_tag: u64,
    send_waiters: LinkedHashMap<u64, Waiter<T>>,
    recv_waiters: LinkedHashMap<u64, Waiter<T>>,
    metrics: Metrics,
}

impl<T> RvInner<T> {
    fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }
}

#[derive(Clone, Copy)]
enum Side {
    Send,
    Recv,
}

impl<T: Payload> Rendezvous<T> {
    pub fn new(sched: &Arc<Scheduler>) -> Arc<Rendezvous<T>> {
        let inner = Arc::new(Mutex::new(RvInner {
            closed: false,
            next_tag: 1,
            send_waiters: LinkedHashMap::new(),
            recv_waiters: LinkedHashMap::new(),
            metrics: Metrics::new(0),
        }));
        inner.lock().unwrap().metrics.ident = &*inner as *const Mutex<RvInner<T>> as usize;
        Arc::new(Rendezvous {
            sched: sched.clone(),
            inner: inner,
        })
    }

    /// Attach a metrics pipe; events are sent non-blocking and dropped on
    /// overflow
    pub fn set_metrics_pipe(
        &self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.inner.lock().unwrap().metrics.set_pipe(pipe, cfg);
    }

    /// Arm a timer that pulls the tagged waiter out of the queue and makes
    /// it ready again
    fn arm_unpark(&self, side: Side, tag: u64, at: u64) -> Option<TimerHandle> {
        let weak_inner: Weak<Mutex<RvInner<T>>> = Arc::downgrade(&self.inner);
        let weak_sched = Arc::downgrade(&self.sched);
        self.sched.timer_at(
            at,
            Box::new(move || {
                let (inner, sched) = match (weak_inner.upgrade(), weak_sched.upgrade()) {
                    (Some(i), Some(s)) => (i, s),
                    _ => return,
                };
                let co = {
                    let mut g = inner.lock().unwrap();
                    let queue = match side {
                        Side::Send => &mut g.send_waiters,
                        Side::Recv => &mut g.recv_waiters,
                    };
                    match queue.remove(&tag) {
                        Some(Waiter::Co { co, .. }) => Some(co),
                        Some(other) => {
                            queue.insert(tag, other);
                            None
                        }
                        None => None,
                    }
                };
                if let Some(co) = co {
                    sched.enqueue_ready(co);
                }
            }),
        )
    }

    fn send_impl(
        &self,
        val: T,
        timeout_ms: i64,
        token: Option<&CancelToken>,
    ) -> ChanResult<()> {
        let bytes = val.byte_len();
        let deadline = platform::deadline_after_ms(timeout_ms);
        let mut val = Some(val);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }

            // Hand the value to a waiting receiver.
            while let Some((_, w)) = inner.recv_waiters.pop_front() {
                match w {
                    Waiter::Co { co, cell } => {
                        cell.put(val.take().expect("send value consumed twice"));
                        inner.metrics.bump_send(bytes);
                        drop(inner);
                        self.sched.enqueue_ready(co);
                        return Ok(());
                    }
                    Waiter::Sel { core, index, cell } => {
                        if core.try_complete(index, Ok(())) {
                            cell.put(val.take().expect("send value consumed twice"));
                            inner.metrics.bump_send(bytes);
                            drop(inner);
                            core.wake(&self.sched);
                            return Ok(());
                        }
                        // Lost its select elsewhere; skip the stale record.
                    }
                }
            }

            if timeout_ms == 0 {
                inner.metrics.bump_err(ChanError::WouldBlock);
                return Err(ChanError::WouldBlock);
            }
            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        inner.metrics.bump_err(ChanError::WouldBlock);
                        return Err(ChanError::WouldBlock);
                    }
                }
                None => {
                    inner.metrics.bump_err(ChanError::WouldBlock);
                    return Err(ChanError::WouldBlock);
                }
            };
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }

            // Park carrying the value.
            let cell = ValueCell::new(val.take());
            let tag = inner.alloc_tag();
            let timer = next_wake(deadline, token.is_some())
                .and_then(|at| self.arm_unpark(Side::Send, tag, at));
            let wcell = cell.clone();
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.send_waiters.insert(tag, Waiter::Co { co: coro, cell: wcell });
            });

            // Woken by a receiver, a close, or the timer.
            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            if cell.is_empty() {
                inner.metrics.bump_send(bytes);
                return Ok(());
            }
            inner.send_waiters.remove(&tag);
            val = Some(cell.take().expect("sender cell lost its value"));
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }
            // Poll slice elapsed; go around again.
        }
    }

    fn recv_impl(&self, timeout_ms: i64, token: Option<&CancelToken>) -> ChanResult<T> {
        let deadline = platform::deadline_after_ms(timeout_ms);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }

            // Take the value of a waiting sender.
            while let Some((_, w)) = inner.send_waiters.pop_front() {
                match w {
                    Waiter::Co { co, cell } => {
                        let v = cell.take().expect("sender cell is empty");
                        inner.metrics.bump_recv(v.byte_len());
                        drop(inner);
                        self.sched.enqueue_ready(co);
                        return Ok(v);
                    }
                    Waiter::Sel { core, index, cell } => {
                        if core.try_complete(index, Ok(())) {
                            let v = cell.take().expect("select sender cell is empty");
                            inner.metrics.bump_recv(v.byte_len());
                            drop(inner);
                            core.wake(&self.sched);
                            return Ok(v);
                        }
                    }
                }
            }

            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if timeout_ms == 0 {
                inner.metrics.bump_err(ChanError::WouldBlock);
                return Err(ChanError::WouldBlock);
            }
            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        inner.metrics.bump_err(ChanError::WouldBlock);
                        return Err(ChanError::WouldBlock);
                    }
                }
                None => {
                    inner.metrics.bump_err(ChanError::WouldBlock);
                    return Err(ChanError::WouldBlock);
                }
            };
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }

            let cell: Arc<ValueCell<T>> = ValueCell::new(None);
            let tag = inner.alloc_tag();
            let timer = next_wake(deadline, token.is_some())
                .and_then(|at| self.arm_unpark(Side::Recv, tag, at));
            let wcell = cell.clone();
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.recv_waiters.insert(tag, Waiter::Co { co: coro, cell: wcell });
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            if let Some(v) = cell.take() {
                inner.metrics.bump_recv(v.byte_len());
                return Ok(v);
            }
            inner.recv_waiters.remove(&tag);
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }
        }
    }
}

impl<T: Payload> Channel<T> for Rendezvous<T> {
    fn send(&self, val: T, timeout_ms: i64) -> ChanResult<()> {
        self.send_impl(val, timeout_ms, None)
    }

    fn recv(&self, timeout_ms: i64) -> ChanResult<T> {
        self.recv_impl(timeout_ms, None)
    }

    fn send_cancellable(
        &self,
        val: T,
        timeout_ms: i64,
        cancel: &CancelToken,
    ) -> ChanResult<()> {
        self.send_impl(val, timeout_ms, Some(cancel))
    }

    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<T> {
        self.recv_impl(timeout_ms, Some(cancel))
    }

    fn close(&self) {
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            info!(
                "rendezvous channel closed; waking {} senders, {} receivers",
                inner.send_waiters.len(),
                inner.recv_waiters.len()
            );
            while let Some((_, w)) = inner.send_waiters.pop_front() {
                match w {
                    Waiter::Co { co, .. } => wake.push(Wakeup::Co(co)),
                    Waiter::Sel { core, index, .. } => {
                        if core.try_complete(index, Err(ChanError::Closed)) {
                            wake.push(Wakeup::Core(core));
                        }
                    }
                }
            }
            while let Some((_, w)) = inner.recv_waiters.pop_front() {
                match w {
                    Waiter::Co { co, .. } => wake.push(Wakeup::Co(co)),
                    Waiter::Sel { core, index, .. } => {
                        if core.try_complete(index, Err(ChanError::Closed)) {
                            wake.push(Wakeup::Core(core));
                        }
                    }
                }
            }
        }
        flush_wakeups(&self.sched, wake);
    }

    fn len(&self) -> usize {
        0
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn snapshot(&self) -> ChannelSnapshot {
        self.inner.lock().unwrap().metrics.snapshot()
    }

    fn select_register_recv(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }

        // Match the first parked plain sender. Pending select senders are
        // matched by plain operations only; two selects meet through them.
        let key = inner
            .send_waiters
            .iter()
            .find(|&(_, w)| match *w {
                Waiter::Co { .. } => true,
                Waiter::Sel { .. } => false,
            })
            .map(|(k, _)| *k);
        if let Some(k) = key {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            if let Some(Waiter::Co { co, cell: scell }) = inner.send_waiters.remove(&k) {
                let v = scell.take().expect("sender cell is empty");
                inner.metrics.bump_recv(v.byte_len());
                cell.put(v);
                drop(inner);
                self.sched.enqueue_ready(co);
                return Ok(());
            }
            unreachable!("rendezvous sender vanished under the lock");
        }

        let tag = inner.alloc_tag();
        inner.recv_waiters.insert(
            tag,
            Waiter::Sel {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_register_send(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        // A send clause is one-shot; an already-consumed cell is inert.
        if cell.is_empty() {
            return Err(ChanError::WouldBlock);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }

        let key = inner
            .recv_waiters
            .iter()
            .find(|&(_, w)| match *w {
                Waiter::Co { .. } => true,
                Waiter::Sel { .. } => false,
            })
            .map(|(k, _)| *k);
        if let Some(k) = key {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            if let Some(Waiter::Co { co, cell: rcell }) = inner.recv_waiters.remove(&k) {
                let v = cell.take().expect("select send cell is empty");
                inner.metrics.bump_send(v.byte_len());
                rcell.put(v);
                drop(inner);
                self.sched.enqueue_ready(co);
                return Ok(());
            }
            unreachable!("rendezvous receiver vanished under the lock");
        }

        let tag = inner.alloc_tag();
        inner.send_waiters.insert(
            tag,
            Waiter::Sel {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let queue = match op {
            SelectOp::Recv => &mut inner.recv_waiters,
            SelectOp::Send => &mut inner.send_waiters,
        };
        let key = queue
            .iter()
            .find(|&(_, w)| match *w {
                Waiter::Sel {
                    core: ref c,
                    index: i,
                    ..
                } => Arc::ptr_eq(c, core) && i == index,
                Waiter::Co { .. } => false,
            })
            .map(|(k, _)| *k);
        if let Some(k) = key {
            queue.remove(&k);
        }
    }
}

// ---------------------------------------------------------------------------
// Buffered
// ---------------------------------------------------------------------------

/// Bounded FIFO ring channel. Buffered values survive a close and are
/// drained by receivers before `Closed` surfaces.
pub struct Buffered<T: Payload> {
    sched: Arc<Scheduler>,
    inner: Arc<Mutex<BufInner<T>>>,
}

struct BufInner<T> {
    closed: bool,
    next_tag: u64,
    cap: usize,
    head: usize,
    count: usize,
    buf: Vec<Option<T>>,
    parked_senders: LinkedHashMap<u64, Handle>,
    parked_receivers: LinkedHashMap<u64, Handle>,
    select_senders: LinkedHashMap<u64, SelWaiter<T>>,
    select_receivers: LinkedHashMap<u64, SelWaiter<T>>,
    metrics: Metrics,
}

impl<T: Payload> BufInner<T> {
    fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    fn ring_push(&mut self, v: T) {
        debug_assert!(self.count < self.cap);
        let idx = (self.head + self.count) % self.cap;
        self.buf[idx] = Some(v);
        self.count += 1;
    }

    fn ring_pop(&mut self) -> T {
        debug_assert!(self.count > 0);
        let v = self.buf[self.head].take().expect("ring slot is empty");
        self.head = (self.head + 1) % self.cap;
        self.count -= 1;
        v
    }

    /// A value was enqueued: satisfy waiting receivers
    fn service_after_send(&mut self, wake: &mut Vec<Wakeup>) {
        while self.count > 0 && !self.select_receivers.is_empty() {
            let (_, sw) = self.select_receivers.pop_front().unwrap();
            if sw.core.try_complete(sw.index, Ok(())) {
                let v = self.ring_pop();
                self.metrics.bump_recv(v.byte_len());
                sw.cell.put(v);
                wake.push(Wakeup::Core(sw.core));
            }
        }
        if self.count > 0 {
            if let Some((_, co)) = self.parked_receivers.pop_front() {
                wake.push(Wakeup::Co(co));
            }
        }
    }

    /// Space was freed: complete pending select sends, then wake a plain
    /// sender to retry
    fn service_after_recv(&mut self, wake: &mut Vec<Wakeup>) {
        while self.count < self.cap && !self.select_senders.is_empty() {
            let (_, sw) = self.select_senders.pop_front().unwrap();
            if sw.core.try_complete(sw.index, Ok(())) {
                let v = sw.cell.take().expect("select sender cell is empty");
                self.metrics.bump_send(v.byte_len());
                self.ring_push(v);
                wake.push(Wakeup::Core(sw.core));
                if let Some((_, co)) = self.parked_receivers.pop_front() {
                    wake.push(Wakeup::Co(co));
                }
            }
        }
        if self.count < self.cap {
            if let Some((_, co)) = self.parked_senders.pop_front() {
                wake.push(Wakeup::Co(co));
            }
        }
    }
}

impl<T: Payload> Buffered<T> {
    /// Create a buffered channel; a capacity of zero floors to 64
    pub fn new(sched: &Arc<Scheduler>, capacity: usize) -> Arc<Buffered<T>> {
        let cap = if capacity == 0 { 64 } else { capacity };
        let mut buf = Vec::with_capacity(cap);
        for _ in 0..cap {
            buf.push(None);
        }
        let inner = Arc::new(Mutex::new(BufInner {
            closed: false,
            next_tag: 1,
            cap: cap,
            head: 0,
            count: 0,
            buf: buf,
            parked_senders: LinkedHashMap::new(),
            parked_receivers: LinkedHashMap::new(),
            select_senders: LinkedHashMap::new(),
            select_receivers: LinkedHashMap::new(),
            metrics: Metrics::new(0),
        }));
        inner.lock().unwrap().metrics.ident = &*inner as *const Mutex<BufInner<T>> as usize;
        Arc::new(Buffered {
            sched: sched.clone(),
            inner: inner,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().cap
    }

    pub fn set_metrics_pipe(
        &self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.inner.lock().unwrap().metrics.set_pipe(pipe, cfg);
    }

    fn arm_unpark(&self, side: Side, tag: u64, at: u64) -> Option<TimerHandle> {
        let weak_inner: Weak<Mutex<BufInner<T>>> = Arc::downgrade(&self.inner);
        let weak_sched = Arc::downgrade(&self.sched);
        self.sched.timer_at(
            at,
            Box::new(move || {
                let (inner, sched) = match (weak_inner.upgrade(), weak_sched.upgrade()) {
                    (Some(i), Some(s)) => (i, s),
                    _ => return,
                };
                let co = {
                    let mut g = inner.lock().unwrap();
                    match side {
                        Side::Send => g.parked_senders.remove(&tag),
                        Side::Recv => g.parked_receivers.remove(&tag),
                    }
                };
                if let Some(co) = co {
                    sched.enqueue_ready(co);
                }
            }),
        )
    }

    fn send_impl(
        &self,
        val: T,
        timeout_ms: i64,
        token: Option<&CancelToken>,
    ) -> ChanResult<()> {
        let bytes = val.byte_len();
        let deadline = platform::deadline_after_ms(timeout_ms);
        let mut val = Some(val);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }

            if inner.count < inner.cap {
                inner.ring_push(val.take().expect("send value consumed twice"));
                inner.metrics.bump_send(bytes);
                let mut wake = Vec::new();
                inner.service_after_send(&mut wake);
                drop(inner);
                flush_wakeups(&self.sched, wake);
                return Ok(());
            }

            if timeout_ms == 0 {
                inner.metrics.bump_err(ChanError::WouldBlock);
                return Err(ChanError::WouldBlock);
            }
            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        inner.metrics.bump_err(ChanError::WouldBlock);
                        return Err(ChanError::WouldBlock);
                    }
                }
                None => {
                    inner.metrics.bump_err(ChanError::WouldBlock);
                    return Err(ChanError::WouldBlock);
                }
            };
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }

            let tag = inner.alloc_tag();
            let timer = next_wake(deadline, token.is_some())
                .and_then(|at| self.arm_unpark(Side::Send, tag, at));
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.parked_senders.insert(tag, coro);
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            inner.parked_senders.remove(&tag);
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }
            // Space may be available now; retry.
        }
    }

    fn recv_impl(&self, timeout_ms: i64, token: Option<&CancelToken>) -> ChanResult<T> {
        let deadline = platform::deadline_after_ms(timeout_ms);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }

            if inner.count > 0 {
                let v = inner.ring_pop();
                inner.metrics.bump_recv(v.byte_len());
                let mut wake = Vec::new();
                inner.service_after_recv(&mut wake);
                drop(inner);
                flush_wakeups(&self.sched, wake);
                return Ok(v);
            }

            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if timeout_ms == 0 {
                inner.metrics.bump_err(ChanError::WouldBlock);
                return Err(ChanError::WouldBlock);
            }
            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        inner.metrics.bump_err(ChanError::WouldBlock);
                        return Err(ChanError::WouldBlock);
                    }
                }
                None => {
                    inner.metrics.bump_err(ChanError::WouldBlock);
                    return Err(ChanError::WouldBlock);
                }
            };
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }

            let tag = inner.alloc_tag();
            let timer = next_wake(deadline, token.is_some())
                .and_then(|at| self.arm_unpark(Side::Recv, tag, at));
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.parked_receivers.insert(tag, coro);
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            inner.parked_receivers.remove(&tag);
            // Values drain before the closed flag surfaces; the loop's
            // count check handles that.
            if inner.count == 0 && inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }
        }
    }
}

impl<T: Payload> Channel<T> for Buffered<T> {
    fn send(&self, val: T, timeout_ms: i64) -> ChanResult<()> {
        self.send_impl(val, timeout_ms, None)
    }

    fn recv(&self, timeout_ms: i64) -> ChanResult<T> {
        self.recv_impl(timeout_ms, None)
    }

    fn send_cancellable(
        &self,
        val: T,
        timeout_ms: i64,
        cancel: &CancelToken,
    ) -> ChanResult<()> {
        self.send_impl(val, timeout_ms, Some(cancel))
    }

    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<T> {
        self.recv_impl(timeout_ms, Some(cancel))
    }

    fn close(&self) {
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            info!(
                "buffered channel closed with {} values buffered; waking waiters",
                inner.count
            );
            while let Some((_, co)) = inner.parked_senders.pop_front() {
                wake.push(Wakeup::Co(co));
            }
            while let Some((_, co)) = inner.parked_receivers.pop_front() {
                wake.push(Wakeup::Co(co));
            }
            while let Some((_, sw)) = inner.select_senders.pop_front() {
                if sw.core.try_complete(sw.index, Err(ChanError::Closed)) {
                    wake.push(Wakeup::Core(sw.core));
                }
            }
            while let Some((_, sw)) = inner.select_receivers.pop_front() {
                if sw.core.try_complete(sw.index, Err(ChanError::Closed)) {
                    wake.push(Wakeup::Core(sw.core));
                }
            }
        }
        flush_wakeups(&self.sched, wake);
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn snapshot(&self) -> ChannelSnapshot {
        self.inner.lock().unwrap().metrics.snapshot()
    }

    fn select_register_recv(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.count > 0 {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let v = inner.ring_pop();
            inner.metrics.bump_recv(v.byte_len());
            cell.put(v);
            let mut wake = Vec::new();
            inner.service_after_recv(&mut wake);
            drop(inner);
            flush_wakeups(&self.sched, wake);
            return Ok(());
        }
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }
        let tag = inner.alloc_tag();
        inner.select_receivers.insert(
            tag,
            SelWaiter {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_register_send(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        if cell.is_empty() {
            return Err(ChanError::WouldBlock);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }
        if inner.count < inner.cap {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let v = cell.take().expect("select send cell is empty");
            inner.metrics.bump_send(v.byte_len());
            inner.ring_push(v);
            let mut wake = Vec::new();
            inner.service_after_send(&mut wake);
            drop(inner);
            flush_wakeups(&self.sched, wake);
            return Ok(());
        }
        let tag = inner.alloc_tag();
        inner.select_senders.insert(
            tag,
            SelWaiter {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let queue = match op {
            SelectOp::Recv => &mut inner.select_receivers,
            SelectOp::Send => &mut inner.select_senders,
        };
        let key = queue
            .iter()
            .find(|&(_, w)| sel_matches(w, core, index))
            .map(|(k, _)| *k);
        if let Some(k) = key {
            queue.remove(&k);
        }
    }
}

// ---------------------------------------------------------------------------
// Conflated
// ---------------------------------------------------------------------------

/// Latest-value channel: a send overwrites the slot and never blocks
pub struct Conflated<T: Payload> {
    sched: Arc<Scheduler>,
    inner: Arc<Mutex<ConInner<T>>>,
}

struct ConInner<T> {
    closed: bool,
    next_tag: u64,
    slot: Option<T>,
    parked_receivers: LinkedHashMap<u64, Handle>,
    select_receivers: LinkedHashMap<u64, SelWaiter<T>>,
    metrics: Metrics,
}

impl<T: Payload> ConInner<T> {
    fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Deliver the slot to the first live waiter, if any
    fn service(&mut self, wake: &mut Vec<Wakeup>) {
        while self.slot.is_some() && !self.select_receivers.is_empty() {
            let (_, sw) = self.select_receivers.pop_front().unwrap();
            if sw.core.try_complete(sw.index, Ok(())) {
                let v = self.slot.take().unwrap();
                self.metrics.bump_recv(v.byte_len());
                sw.cell.put(v);
                wake.push(Wakeup::Core(sw.core));
            }
        }
        if self.slot.is_some() {
            if let Some((_, co)) = self.parked_receivers.pop_front() {
                wake.push(Wakeup::Co(co));
            }
        }
    }
}

impl<T: Payload> Conflated<T> {
    pub fn new(sched: &Arc<Scheduler>) -> Arc<Conflated<T>> {
        let inner = Arc::new(Mutex::new(ConInner {
            closed: false,
            next_tag: 1,
            slot: None,
            parked_receivers: LinkedHashMap::new(),
            select_receivers: LinkedHashMap::new(),
            metrics: Metrics::new(0),
        }));
        inner.lock().unwrap().metrics.ident = &*inner as *const Mutex<ConInner<T>> as usize;
        Arc::new(Conflated {
            sched: sched.clone(),
            inner: inner,
        })
    }

    pub fn set_metrics_pipe(
        &self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.inner.lock().unwrap().metrics.set_pipe(pipe, cfg);
    }

    fn arm_unpark(&self, tag: u64, at: u64) -> Option<TimerHandle> {
        let weak_inner: Weak<Mutex<ConInner<T>>> = Arc::downgrade(&self.inner);
        let weak_sched = Arc::downgrade(&self.sched);
        self.sched.timer_at(
            at,
            Box::new(move || {
                let (inner, sched) = match (weak_inner.upgrade(), weak_sched.upgrade()) {
                    (Some(i), Some(s)) => (i, s),
                    _ => return,
                };
                let co = inner.lock().unwrap().parked_receivers.remove(&tag);
                if let Some(co) = co {
                    sched.enqueue_ready(co);
                }
            }),
        )
    }

    fn recv_impl(&self, timeout_ms: i64, token: Option<&CancelToken>) -> ChanResult<T> {
        let deadline = platform::deadline_after_ms(timeout_ms);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if let Some(v) = inner.slot.take() {
                inner.metrics.bump_recv(v.byte_len());
                return Ok(v);
            }
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if timeout_ms == 0 {
                inner.metrics.bump_err(ChanError::WouldBlock);
                return Err(ChanError::WouldBlock);
            }
            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        inner.metrics.bump_err(ChanError::WouldBlock);
                        return Err(ChanError::WouldBlock);
                    }
                }
                None => {
                    inner.metrics.bump_err(ChanError::WouldBlock);
                    return Err(ChanError::WouldBlock);
                }
            };
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }

            let tag = inner.alloc_tag();
            let timer = next_wake(deadline, token.is_some())
                .and_then(|at| self.arm_unpark(tag, at));
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.parked_receivers.insert(tag, coro);
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            inner.parked_receivers.remove(&tag);
            if inner.slot.is_none() && inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }
        }
    }
}

impl<T: Payload> Channel<T> for Conflated<T> {
    fn send(&self, val: T, _timeout_ms: i64) -> ChanResult<()> {
        let bytes = val.byte_len();
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            // Overwrite: the previous value, if unconsumed, is dropped.
            inner.slot = Some(val);
            inner.metrics.bump_send(bytes);
            inner.service(&mut wake);
        }
        flush_wakeups(&self.sched, wake);
        Ok(())
    }

    fn recv(&self, timeout_ms: i64) -> ChanResult<T> {
        self.recv_impl(timeout_ms, None)
    }

    fn send_cancellable(
        &self,
        val: T,
        timeout_ms: i64,
        _cancel: &CancelToken,
    ) -> ChanResult<()> {
        self.send(val, timeout_ms)
    }

    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<T> {
        self.recv_impl(timeout_ms, Some(cancel))
    }

    fn close(&self) {
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            info!("conflated channel closed; waking receivers");
            while let Some((_, co)) = inner.parked_receivers.pop_front() {
                wake.push(Wakeup::Co(co));
            }
            while let Some((_, sw)) = inner.select_receivers.pop_front() {
                if sw.core.try_complete(sw.index, Err(ChanError::Closed)) {
                    wake.push(Wakeup::Core(sw.core));
                }
            }
        }
        flush_wakeups(&self.sched, wake);
    }

    fn len(&self) -> usize {
        if self.inner.lock().unwrap().slot.is_some() {
            1
        } else {
            0
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn snapshot(&self) -> ChannelSnapshot {
        self.inner.lock().unwrap().metrics.snapshot()
    }

    fn select_register_recv(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.slot.is_some() {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let v = inner.slot.take().unwrap();
            inner.metrics.bump_recv(v.byte_len());
            cell.put(v);
            return Ok(());
        }
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }
        let tag = inner.alloc_tag();
        inner.select_receivers.insert(
            tag,
            SelWaiter {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_register_send(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        if cell.is_empty() {
            return Err(ChanError::WouldBlock);
        }
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let v = cell.take().expect("select send cell is empty");
            inner.metrics.bump_send(v.byte_len());
            inner.slot = Some(v);
            inner.service(&mut wake);
        }
        flush_wakeups(&self.sched, wake);
        Ok(())
    }

    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp) {
        if let SelectOp::Send = op {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .select_receivers
            .iter()
            .find(|&(_, w)| sel_matches(w, core, index))
            .map(|(k, _)| *k);
        if let Some(k) = key {
            inner.select_receivers.remove(&k);
        }
    }
}

// ---------------------------------------------------------------------------
// Unbounded
// ---------------------------------------------------------------------------

/// Growing FIFO channel: sends never block
pub struct Unbounded<T: Payload> {
    sched: Arc<Scheduler>,
    inner: Arc<Mutex<UnbInner<T>>>,
}

struct UnbInner<T> {
    closed: bool,
    next_tag: u64,
    queue: VecDeque<T>,
    parked_receivers: LinkedHashMap<u64, Handle>,
    select_receivers: LinkedHashMap<u64, SelWaiter<T>>,
    metrics: Metrics,
}

impl<T: Payload> UnbInner<T> {
    fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    fn service(&mut self, wake: &mut Vec<Wakeup>) {
        while !self.queue.is_empty() && !self.select_receivers.is_empty() {
            let (_, sw) = self.select_receivers.pop_front().unwrap();
            if sw.core.try_complete(sw.index, Ok(())) {
                let v = self.queue.pop_front().unwrap();
                self.metrics.bump_recv(v.byte_len());
                sw.cell.put(v);
                wake.push(Wakeup::Core(sw.core));
            }
        }
        if !self.queue.is_empty() {
            if let Some((_, co)) = self.parked_receivers.pop_front() {
                wake.push(Wakeup::Co(co));
            }
        }
    }
}

impl<T: Payload> Unbounded<T> {
    pub fn new(sched: &Arc<Scheduler>) -> Arc<Unbounded<T>> {
        let inner = Arc::new(Mutex::new(UnbInner {
            closed: false,
            next_tag: 1,
            queue: VecDeque::new(),
            parked_receivers: LinkedHashMap::new(),
            select_receivers: LinkedHashMap::new(),
            metrics: Metrics::new(0),
        }));
        inner.lock().unwrap().metrics.ident = &*inner as *const Mutex<UnbInner<T>> as usize;
        Arc::new(Unbounded {
            sched: sched.clone(),
            inner: inner,
        })
    }

    pub fn set_metrics_pipe(
        &self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.inner.lock().unwrap().metrics.set_pipe(pipe, cfg);
    }

    fn arm_unpark(&self, tag: u64, at: u64) -> Option<TimerHandle> {
        let weak_inner: Weak<Mutex<UnbInner<T>>> = Arc::downgrade(&self.inner);
        let weak_sched = Arc::downgrade(&self.sched);
        self.sched.timer_at(
            at,
            Box::new(move || {
                let (inner, sched) = match (weak_inner.upgrade(), weak_sched.upgrade()) {
                    (Some(i), Some(s)) => (i, s),
                    _ => return,
                };
                let co = inner.lock().unwrap().parked_receivers.remove(&tag);
                if let Some(co) = co {
                    sched.enqueue_ready(co);
                }
            }),
        )
    }

    fn recv_impl(&self, timeout_ms: i64, token: Option<&CancelToken>) -> ChanResult<T> {
        let deadline = platform::deadline_after_ms(timeout_ms);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if let Some(v) = inner.queue.pop_front() {
                inner.metrics.bump_recv(v.byte_len());
                return Ok(v);
            }
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if timeout_ms == 0 {
                inner.metrics.bump_err(ChanError::WouldBlock);
                return Err(ChanError::WouldBlock);
            }
            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        inner.metrics.bump_err(ChanError::WouldBlock);
                        return Err(ChanError::WouldBlock);
                    }
                }
                None => {
                    inner.metrics.bump_err(ChanError::WouldBlock);
                    return Err(ChanError::WouldBlock);
                }
            };
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }

            let tag = inner.alloc_tag();
            let timer = next_wake(deadline, token.is_some())
                .and_then(|at| self.arm_unpark(tag, at));
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.parked_receivers.insert(tag, coro);
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            inner.parked_receivers.remove(&tag);
            if inner.queue.is_empty() && inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }
            if expired(deadline) {
                inner.metrics.bump_err(ChanError::Timeout);
                return Err(ChanError::Timeout);
            }
        }
    }
}

impl<T: Payload> Channel<T> for Unbounded<T> {
    fn send(&self, val: T, _timeout_ms: i64) -> ChanResult<()> {
        let bytes = val.byte_len();
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            inner.queue.push_back(val);
            inner.metrics.bump_send(bytes);
            inner.service(&mut wake);
        }
        flush_wakeups(&self.sched, wake);
        Ok(())
    }

    fn recv(&self, timeout_ms: i64) -> ChanResult<T> {
        self.recv_impl(timeout_ms, None)
    }

    fn send_cancellable(
        &self,
        val: T,
        timeout_ms: i64,
        _cancel: &CancelToken,
    ) -> ChanResult<()> {
        self.send(val, timeout_ms)
    }

    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<T> {
        self.recv_impl(timeout_ms, Some(cancel))
    }

    fn close(&self) {
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            info!(
                "unbounded channel closed with {} values queued; waking receivers",
                inner.queue.len()
            );
            while let Some((_, co)) = inner.parked_receivers.pop_front() {
                wake.push(Wakeup::Co(co));
            }
            while let Some((_, sw)) = inner.select_receivers.pop_front() {
                if sw.core.try_complete(sw.index, Err(ChanError::Closed)) {
                    wake.push(Wakeup::Core(sw.core));
                }
            }
        }
        flush_wakeups(&self.sched, wake);
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn snapshot(&self) -> ChannelSnapshot {
        self.inner.lock().unwrap().metrics.snapshot()
    }

    fn select_register_recv(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queue.is_empty() {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let v = inner.queue.pop_front().unwrap();
            inner.metrics.bump_recv(v.byte_len());
            cell.put(v);
            return Ok(());
        }
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }
        let tag = inner.alloc_tag();
        inner.select_receivers.insert(
            tag,
            SelWaiter {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_register_send(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<T>>,
    ) -> ChanResult<()> {
        if cell.is_empty() {
            return Err(ChanError::WouldBlock);
        }
        let mut wake = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                inner.metrics.bump_err(ChanError::Closed);
                return Err(ChanError::Closed);
            }
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let v = cell.take().expect("select send cell is empty");
            inner.metrics.bump_send(v.byte_len());
            inner.queue.push_back(v);
            inner.service(&mut wake);
        }
        flush_wakeups(&self.sched, wake);
        Ok(())
    }

    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp) {
        if let SelectOp::Send = op {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .select_receivers
            .iter()
            .find(|&(_, w)| sel_matches(w, core, index))
            .map(|(k, _)| *k);
        if let Some(k) = key {
            inner.select_receivers.remove(&k);
        }
    }
}
