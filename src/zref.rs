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

//! Zero-copy descriptor transfer
//!
//! Payloads never move through these channels; only `ZDesc` descriptors do.
//! A `RegionRegistry` tracks the memory regions descriptors point into,
//! with refcounts guarding lifetime and optional typed metadata that a
//! channel's format policy can check at send time.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};

use linked_hash_map::LinkedHashMap;

use coroutine::Handle;
use platform;
use runtime::{Processor, Scheduler, TimerHandle};
use sync::cancel::CancelToken;
use sync::channel::{
    canceled, expired, flush_wakeups, next_wake, sel_matches, ChanError, ChanResult, Channel,
    ChannelMetricsConfig, ChannelMetricsEvent, ChannelSnapshot, Metrics, Payload, SelWaiter,
    ValueCell, Wakeup, CAP_ZERO_COPY,
};
use sync::select::{SelectCore, SelectOp};

pub type RegionId = u64;

/// A zero-copy descriptor: where the payload lives, not the payload itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZDesc {
    pub addr: usize,
    pub len: usize,
    pub region_id: RegionId,
    pub offset: u64,
    pub flags: u32,
}

impl Payload for ZDesc {
    fn byte_len(&self) -> usize {
        self.len
    }
}

/// Element type of a region's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Unspec,
    U8,
    S8,
    U16,
    S16,
    Fp16,
    Bf16,
    U32,
    S32,
    Fp32,
    U64,
    S64,
    Fp64,
    U128,
    Opaque128,
}

impl Default for DType {
    fn default() -> DType {
        DType::Unspec
    }
}

/// Typed metadata attached to a registered region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionMeta {
    pub dtype: DType,
    pub elem_bits: u32,
    pub align_bytes: u32,
    pub stride_bytes: u32,
    pub ndims: u8,
    pub dims: [u64; 4],
    pub layout: u32,
    pub flags: u32,
}

/// Which metadata fields a format policy checks
pub type FormatMask = u64;

pub const FMT_DTYPE: FormatMask = 1 << 0;
pub const FMT_ELEMBITS: FormatMask = 1 << 1;
pub const FMT_ALIGN: FormatMask = 1 << 2;
pub const FMT_STRIDE: FormatMask = 1 << 3;
pub const FMT_DIMS: FormatMask = 1 << 4;
pub const FMT_LAYOUT: FormatMask = 1 << 5;

/// What a mismatch does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    /// Log and proceed
    Advisory,
    /// Fail the send with `InvalidFormat`
    Strict,
}

/// Declarative check applied to a descriptor's region metadata at send time
#[derive(Debug, Clone, Copy)]
pub struct FormatPolicy {
    pub meta: RegionMeta,
    pub mask: FormatMask,
    pub mode: FormatMode,
}

impl FormatPolicy {
    /// Check `desc` against the policy. Regions without metadata, masks of
    /// zero and descriptors without a region always pass. Alignment is
    /// "at least required".
    pub fn check(&self, registry: &RegionRegistry, desc: &ZDesc) -> ChanResult<()> {
        if desc.region_id == 0 || self.mask == 0 {
            return Ok(());
        }
        let meta = match registry.get_meta(desc.region_id) {
            Some(m) => m,
            None => return Ok(()),
        };

        let mut mismatch = false;
        if self.mask & FMT_DTYPE != 0 && meta.dtype != self.meta.dtype {
            mismatch = true;
        }
        if self.mask & FMT_ELEMBITS != 0 && meta.elem_bits != self.meta.elem_bits {
            mismatch = true;
        }
        if self.mask & FMT_ALIGN != 0 && meta.align_bytes < self.meta.align_bytes {
            mismatch = true;
        }
        if self.mask & FMT_STRIDE != 0 && meta.stride_bytes != self.meta.stride_bytes {
            mismatch = true;
        }
        if self.mask & FMT_DIMS != 0 {
            if meta.ndims != self.meta.ndims {
                mismatch = true;
            } else {
                for i in 0..meta.ndims as usize {
                    if meta.dims[i] != self.meta.dims[i] {
                        mismatch = true;
                        break;
                    }
                }
            }
        }
        if self.mask & FMT_LAYOUT != 0 && meta.layout != self.meta.layout {
            mismatch = true;
        }

        if !mismatch {
            return Ok(());
        }
        match self.mode {
            FormatMode::Strict => {
                warn!(
                    "format policy rejected descriptor for region {}",
                    desc.region_id
                );
                Err(ChanError::InvalidFormat)
            }
            FormatMode::Advisory => {
                debug!(
                    "format policy mismatch for region {} (advisory)",
                    desc.region_id
                );
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Region registry
// ---------------------------------------------------------------------------

struct RegionEntry {
    base: usize,
    len: usize,
    refs: u64,
    dereg: bool,
    meta: Mutex<Option<RegionMeta>>,
}

struct RegistryInner {
    regions: HashMap<RegionId, RegionEntry>,
    next_id: RegionId,
}

/// Refcounted table of registered memory regions.
///
/// `deregister` blocks the caller until every outstanding reference has
/// been returned, then erases the region exactly once.
pub struct RegionRegistry {
    inner: Mutex<RegistryInner>,
    cv: Condvar,
}

impl RegionRegistry {
    pub fn new() -> Arc<RegionRegistry> {
        Arc::new(RegionRegistry {
            inner: Mutex::new(RegistryInner {
                regions: HashMap::new(),
                next_id: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Register a region; the caller holds the initial reference
    pub fn register(&self, base: usize, len: usize) -> RegionId {
        let mut g = self.inner.lock().unwrap();
        g.next_id += 1;
        let id = g.next_id;
        g.regions.insert(
            id,
            RegionEntry {
                base: base,
                len: len,
                refs: 1,
                dereg: false,
                meta: Mutex::new(None),
            },
        );
        debug!("region {}: registered {} bytes", id, len);
        id
    }

    /// Take a reference; fails once the region is deregistering or unknown
    pub fn incref(&self, id: RegionId) -> bool {
        let mut g = self.inner.lock().unwrap();
        match g.regions.get_mut(&id) {
            Some(e) => {
                if e.dereg {
                    return false;
                }
                e.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Return a reference; wakes a blocked `deregister` at zero
    pub fn decref(&self, id: RegionId) -> bool {
        let mut g = self.inner.lock().unwrap();
        match g.regions.get_mut(&id) {
            Some(e) => {
                if e.refs == 0 {
                    return false;
                }
                e.refs -= 1;
                if e.refs == 0 && e.dereg {
                    self.cv.notify_all();
                }
                true
            }
            None => false,
        }
    }

    /// Flag the region, drop the owner's reference, block until the
    /// refcount reaches zero, then erase.
    pub fn deregister(&self, id: RegionId) -> bool {
        let mut g = self.inner.lock().unwrap();
        match g.regions.get_mut(&id) {
            Some(e) => {
                if !e.dereg {
                    e.dereg = true;
                    if e.refs > 0 {
                        e.refs -= 1;
                    }
                }
            }
            None => return false,
        }

        loop {
            match g.regions.get(&id) {
                // A concurrent deregister erased it first.
                None => return true,
                Some(e) => {
                    if e.refs == 0 {
                        g.regions.remove(&id);
                        debug!("region {}: erased", id);
                        return true;
                    }
                }
            }
            g = self.cv.wait(g).unwrap();
        }
    }

    /// Current `(base, len)` of a live region
    pub fn query(&self, id: RegionId) -> Option<(usize, usize)> {
        let g = self.inner.lock().unwrap();
        g.regions.get(&id).map(|e| (e.base, e.len))
    }

    pub fn set_meta(&self, id: RegionId, meta: RegionMeta) -> bool {
        let g = self.inner.lock().unwrap();
        match g.regions.get(&id) {
            Some(e) => {
                *e.meta.lock().unwrap() = Some(meta);
                true
            }
            None => false,
        }
    }

    pub fn get_meta(&self, id: RegionId) -> Option<RegionMeta> {
        let g = self.inner.lock().unwrap();
        g.regions.get(&id).and_then(|e| *e.meta.lock().unwrap())
    }

    /// Allocate an aligned block and register it as a region.
    ///
    /// The block is released with `release_aligned` after deregistration.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<(*mut u8, RegionId)> {
        let p = unsafe { platform::alloc_aligned(size, align) };
        if p.is_null() {
            return None;
        }
        let id = self.register(p as usize, size);
        Some((p, id))
    }

    /// Release a block obtained from `alloc_aligned`. The region must have
    /// been deregistered first.
    pub unsafe fn release_aligned(&self, p: *mut u8) {
        platform::release_aligned(p);
    }
}

// ---------------------------------------------------------------------------
// Rendezvous descriptor channel
// ---------------------------------------------------------------------------

/// A sender-side entry in the rendezvous descriptor channel
enum ZSendEntry {
    /// A blocked sender parked on its published descriptor
    Parked {
        co: Handle,
        cell: Arc<ValueCell<ZDesc>>,
    },
    /// A descriptor already committed to the channel (select-send that won
    /// before a receiver arrived)
    Published { cell: Arc<ValueCell<ZDesc>> },
    /// A pending select-send clause
    Sel {
        core: Arc<SelectCore>,
        index: usize,
        cell: Arc<ValueCell<ZDesc>>,
    },
}

struct ZrInner {
    closed: bool,
    next_tag: u64,
    senders: LinkedHashMap<u64, ZSendEntry>,
    recv_waiters: LinkedHashMap<u64, (Handle, Arc<ValueCell<ZDesc>>)>,
    select_recv: LinkedHashMap<u64, SelWaiter<ZDesc>>,
    metrics: Metrics,
}

impl ZrInner {
    fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }
}

/// Rendezvous channel for zero-copy descriptors.
///
/// A sender publishes its descriptor and parks until a receiver consumes
/// it; a receiver either takes a published descriptor (waking its sender)
/// or parks until one arrives. Pending select clauses on both sides are
/// cross-matched. An optional format policy vets descriptors at send time.
pub struct ZRendezvous {
    sched: Arc<Scheduler>,
    registry: Arc<RegionRegistry>,
    policy: Mutex<Option<FormatPolicy>>,
    inner: Arc<Mutex<ZrInner>>,
}

impl ZRendezvous {
    pub fn new(sched: &Arc<Scheduler>, registry: &Arc<RegionRegistry>) -> Arc<ZRendezvous> {
        let inner = Arc::new(Mutex::new(ZrInner {
            closed: false,
            next_tag: 1,
            senders: LinkedHashMap::new(),
            recv_waiters: LinkedHashMap::new(),
            select_recv: LinkedHashMap::new(),
            metrics: Metrics::new(CAP_ZERO_COPY),
        }));
        inner.lock().unwrap().metrics.ident = &*inner as *const Mutex<ZrInner> as usize;
        Arc::new(ZRendezvous {
            sched: sched.clone(),
            registry: registry.clone(),
            policy: Mutex::new(None),
            inner: inner,
        })
    }

    /// Require region metadata to match `meta` on the fields in `mask`
    pub fn require_format(&self, meta: RegionMeta, mask: FormatMask, mode: FormatMode) {
        *self.policy.lock().unwrap() = Some(FormatPolicy {
            meta: meta,
            mask: mask,
            mode: mode,
        });
    }

    pub fn set_metrics_pipe(
        &self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.inner.lock().unwrap().metrics.set_pipe(pipe, cfg);
    }

    fn check_policy(&self, desc: &ZDesc) -> ChanResult<()> {
        let policy = *self.policy.lock().unwrap();
        match policy {
            Some(p) => p.check(&self.registry, desc),
            None => Ok(()),
        }
    }

    /// Timer that pulls a parked waiter back out of the queue
    fn arm_unpark(&self, recv_side: bool, tag: u64, at: u64) -> Option<TimerHandle> {
        let weak_inner: Weak<Mutex<ZrInner>> = Arc::downgrade(&self.inner);
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
                    if recv_side {
                        g.recv_waiters.remove(&tag).map(|(co, _)| co)
                    } else {
                        match g.senders.remove(&tag) {
                            Some(ZSendEntry::Parked { co, .. }) => Some(co),
                            Some(other) => {
                                g.senders.insert(tag, other);
                                None
                            }
                            None => None,
                        }
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
        desc: ZDesc,
        timeout_ms: i64,
        token: Option<&CancelToken>,
    ) -> ChanResult<()> {
        self.check_policy(&desc)?;

        let bytes = desc.byte_len();
        let deadline = platform::deadline_after_ms(timeout_ms);
        let mut val = Some(desc);

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

            // Hand off to a parked receiver.
            if let Some((_, (co, cell))) = inner.recv_waiters.pop_front() {
                cell.put(val.take().expect("descriptor consumed twice"));
                inner.metrics.bump_send(bytes);
                drop(inner);
                self.sched.enqueue_ready(co);
                return Ok(());
            }

            // Or complete a pending select receiver.
            loop {
                let front = match inner.select_recv.pop_front() {
                    Some((_, sw)) => sw,
                    None => break,
                };
                if front.core.try_complete(front.index, Ok(())) {
                    front.cell.put(val.take().expect("descriptor consumed twice"));
                    inner.metrics.bump_send(bytes);
                    drop(inner);
                    front.core.wake(&self.sched);
                    return Ok(());
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

            // Publish the descriptor and park on it.
            let cell = ValueCell::new(val.take());
            let tag = inner.alloc_tag();
            let timer =
                next_wake(deadline, token.is_some()).and_then(|at| self.arm_unpark(false, tag, at));
            let wcell = cell.clone();
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner
                    .senders
                    .insert(tag, ZSendEntry::Parked { co: coro, cell: wcell });
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            if cell.is_empty() {
                inner.metrics.bump_send(bytes);
                return Ok(());
            }
            inner.senders.remove(&tag);
            val = Some(cell.take().expect("sender cell lost its descriptor"));
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

    fn recv_impl(&self, timeout_ms: i64, token: Option<&CancelToken>) -> ChanResult<ZDesc> {
        let deadline = platform::deadline_after_ms(timeout_ms);

        loop {
            let mut inner = self.inner.lock().unwrap();
            if canceled(token) {
                inner.metrics.bump_err(ChanError::Canceled);
                return Err(ChanError::Canceled);
            }

            // Consume the oldest viable sender entry.
            loop {
                let (_, entry) = match inner.senders.pop_front() {
                    Some(e) => e,
                    None => break,
                };
                match entry {
                    ZSendEntry::Parked { co, cell } => {
                        let d = cell.take().expect("parked sender cell is empty");
                        inner.metrics.bump_recv(d.byte_len());
                        drop(inner);
                        self.sched.enqueue_ready(co);
                        return Ok(d);
                    }
                    ZSendEntry::Published { cell } => {
                        let d = cell.take().expect("published cell is empty");
                        inner.metrics.bump_recv(d.byte_len());
                        return Ok(d);
                    }
                    ZSendEntry::Sel { core, index, cell } => {
                        if core.try_complete(index, Ok(())) {
                            let d = cell.take().expect("select sender cell is empty");
                            inner.metrics.bump_send(d.byte_len());
                            inner.metrics.bump_recv(d.byte_len());
                            drop(inner);
                            core.wake(&self.sched);
                            return Ok(d);
                        }
                        // Stale: its select was decided elsewhere.
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

            let cell: Arc<ValueCell<ZDesc>> = ValueCell::new(None);
            let tag = inner.alloc_tag();
            let timer =
                next_wake(deadline, token.is_some()).and_then(|at| self.arm_unpark(true, tag, at));
            let wcell = cell.clone();
            processor.park_with(move |_, coro| {
                let mut inner = inner;
                inner.recv_waiters.insert(tag, (coro, wcell));
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
            let mut inner = self.inner.lock().unwrap();
            if let Some(d) = cell.take() {
                inner.metrics.bump_recv(d.byte_len());
                return Ok(d);
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

impl Channel<ZDesc> for ZRendezvous {
    fn send(&self, val: ZDesc, timeout_ms: i64) -> ChanResult<()> {
        self.send_impl(val, timeout_ms, None)
    }

    fn recv(&self, timeout_ms: i64) -> ChanResult<ZDesc> {
        self.recv_impl(timeout_ms, None)
    }

    fn send_cancellable(
        &self,
        val: ZDesc,
        timeout_ms: i64,
        cancel: &CancelToken,
    ) -> ChanResult<()> {
        self.send_impl(val, timeout_ms, Some(cancel))
    }

    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<ZDesc> {
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
            info!("descriptor rendezvous closed; waking waiters");
            while let Some((_, entry)) = inner.senders.pop_front() {
                match entry {
                    ZSendEntry::Parked { co, .. } => wake.push(Wakeup::Co(co)),
                    // Committed but unconsumed descriptors are discarded;
                    // only the descriptor is lost, never a payload.
                    ZSendEntry::Published { .. } => {}
                    ZSendEntry::Sel { core, index, .. } => {
                        if core.try_complete(index, Err(ChanError::Closed)) {
                            wake.push(Wakeup::Core(core));
                        }
                    }
                }
            }
            while let Some((_, (co, _))) = inner.recv_waiters.pop_front() {
                wake.push(Wakeup::Co(co));
            }
            while let Some((_, sw)) = inner.select_recv.pop_front() {
                if sw.core.try_complete(sw.index, Err(ChanError::Closed)) {
                    wake.push(Wakeup::Core(sw.core));
                }
            }
        }
        flush_wakeups(&self.sched, wake);
    }

    fn len(&self) -> usize {
        // Committed descriptors awaiting a receiver
        let inner = self.inner.lock().unwrap();
        inner
            .senders
            .iter()
            .filter(|&(_, e)| match *e {
                ZSendEntry::Sel { .. } => false,
                _ => true,
            })
            .count()
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
        cell: &Arc<ValueCell<ZDesc>>,
    ) -> ChanResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }

        loop {
            let (tag, entry) = match inner.senders.pop_front() {
                Some(e) => e,
                None => break,
            };
            match entry {
                ZSendEntry::Parked { co, cell: scell } => {
                    if !core.try_complete(index, Ok(())) {
                        // Put the sender back; this select lost elsewhere.
                        inner
                            .senders
                            .insert(tag, ZSendEntry::Parked { co: co, cell: scell });
                        return Err(ChanError::WouldBlock);
                    }
                    let d = scell.take().expect("parked sender cell is empty");
                    inner.metrics.bump_recv(d.byte_len());
                    cell.put(d);
                    drop(inner);
                    self.sched.enqueue_ready(co);
                    return Ok(());
                }
                ZSendEntry::Published { cell: pcell } => {
                    if !core.try_complete(index, Ok(())) {
                        inner.senders.insert(tag, ZSendEntry::Published { cell: pcell });
                        return Err(ChanError::WouldBlock);
                    }
                    let d = pcell.take().expect("published cell is empty");
                    inner.metrics.bump_recv(d.byte_len());
                    cell.put(d);
                    return Ok(());
                }
                ZSendEntry::Sel {
                    core: scor,
                    index: sidx,
                    cell: scell,
                } => {
                    // Commit the pending select sender first; its value is
                    // then guaranteed.
                    if !scor.try_complete(sidx, Ok(())) {
                        continue; // stale entry
                    }
                    let d = scell.take().expect("select sender cell is empty");
                    inner.metrics.bump_send(d.byte_len());
                    if core.try_complete(index, Ok(())) {
                        inner.metrics.bump_recv(d.byte_len());
                        cell.put(d);
                        drop(inner);
                        scor.wake(&self.sched);
                        return Ok(());
                    }
                    // This select lost while the sender committed: leave
                    // the descriptor published for the next receiver.
                    let pcell = ValueCell::new(Some(d));
                    inner.senders.insert(tag, ZSendEntry::Published { cell: pcell });
                    drop(inner);
                    scor.wake(&self.sched);
                    return Err(ChanError::WouldBlock);
                }
            }
        }

        let tag = inner.alloc_tag();
        inner.select_recv.insert(
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
        cell: &Arc<ValueCell<ZDesc>>,
    ) -> ChanResult<()> {
        {
            let peek = cell.take();
            match peek {
                Some(d) => {
                    let rc = self.check_policy(&d);
                    cell.put(d);
                    if let Err(e) = rc {
                        return Err(e);
                    }
                }
                None => return Err(ChanError::WouldBlock),
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            inner.metrics.bump_err(ChanError::Closed);
            return Err(ChanError::Closed);
        }

        // A parked plain receiver takes the descriptor directly.
        if !inner.recv_waiters.is_empty() {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let (_, (co, rcell)) = inner.recv_waiters.pop_front().unwrap();
            let d = cell.take().expect("select send cell is empty");
            inner.metrics.bump_send(d.byte_len());
            rcell.put(d);
            drop(inner);
            self.sched.enqueue_ready(co);
            return Ok(());
        }

        // Cross-match a pending select receiver. Once our latch is claimed
        // the send has won; if every registered receiver turns out stale,
        // the descriptor is committed to the channel instead.
        if !inner.select_recv.is_empty() {
            if !core.try_complete(index, Ok(())) {
                return Err(ChanError::WouldBlock);
            }
            let d = cell.take().expect("select send cell is empty");
            inner.metrics.bump_send(d.byte_len());
            while let Some((_, sw)) = inner.select_recv.pop_front() {
                if sw.core.try_complete(sw.index, Ok(())) {
                    inner.metrics.bump_recv(d.byte_len());
                    sw.cell.put(d);
                    drop(inner);
                    sw.core.wake(&self.sched);
                    return Ok(());
                }
            }
            let tag = inner.alloc_tag();
            let pcell = ValueCell::new(Some(d));
            inner.senders.insert(tag, ZSendEntry::Published { cell: pcell });
            return Ok(());
        }

        // No counterpart: queue as a pending select sender.
        let tag = inner.alloc_tag();
        inner.senders.insert(
            tag,
            ZSendEntry::Sel {
                core: core.clone(),
                index: index,
                cell: cell.clone(),
            },
        );
        Err(ChanError::WouldBlock)
    }

    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp) {
        let mut inner = self.inner.lock().unwrap();
        match op {
            SelectOp::Recv => {
                let key = inner
                    .select_recv
                    .iter()
                    .find(|&(_, w)| sel_matches(w, core, index))
                    .map(|(k, _)| *k);
                if let Some(k) = key {
                    inner.select_recv.remove(&k);
                }
            }
            SelectOp::Send => {
                let key = inner
                    .senders
                    .iter()
                    .find(|&(_, e)| match *e {
                        ZSendEntry::Sel {
                            core: ref c,
                            index: i,
                            ..
                        } => Arc::ptr_eq(c, core) && i == index,
                        _ => false,
                    })
                    .map(|(k, _)| *k);
                if let Some(k) = key {
                    inner.senders.remove(&k);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Buffered descriptor channel
// ---------------------------------------------------------------------------

/// Bounded descriptor channel: a format-policy gate in front of a
/// `Buffered<ZDesc>`
pub struct ZBuffered {
    registry: Arc<RegionRegistry>,
    policy: Mutex<Option<FormatPolicy>>,
    chan: Arc<::sync::channel::Buffered<ZDesc>>,
}

impl ZBuffered {
    pub fn new(
        sched: &Arc<Scheduler>,
        registry: &Arc<RegionRegistry>,
        capacity: usize,
    ) -> Arc<ZBuffered> {
        Arc::new(ZBuffered {
            registry: registry.clone(),
            policy: Mutex::new(None),
            chan: ::sync::channel::Buffered::new(sched, capacity),
        })
    }

    pub fn require_format(&self, meta: RegionMeta, mask: FormatMask, mode: FormatMode) {
        *self.policy.lock().unwrap() = Some(FormatPolicy {
            meta: meta,
            mask: mask,
            mode: mode,
        });
    }

    pub fn set_metrics_pipe(
        &self,
        pipe: Arc<dyn Channel<ChannelMetricsEvent>>,
        cfg: ChannelMetricsConfig,
    ) {
        self.chan.set_metrics_pipe(pipe, cfg);
    }

    fn check_policy(&self, desc: &ZDesc) -> ChanResult<()> {
        let policy = *self.policy.lock().unwrap();
        match policy {
            Some(p) => p.check(&self.registry, desc),
            None => Ok(()),
        }
    }
}

impl Channel<ZDesc> for ZBuffered {
    fn send(&self, val: ZDesc, timeout_ms: i64) -> ChanResult<()> {
        self.check_policy(&val)?;
        self.chan.send(val, timeout_ms)
    }

    fn recv(&self, timeout_ms: i64) -> ChanResult<ZDesc> {
        self.chan.recv(timeout_ms)
    }

    fn send_cancellable(
        &self,
        val: ZDesc,
        timeout_ms: i64,
        cancel: &CancelToken,
    ) -> ChanResult<()> {
        self.check_policy(&val)?;
        self.chan.send_cancellable(val, timeout_ms, cancel)
    }

    fn recv_cancellable(&self, timeout_ms: i64, cancel: &CancelToken) -> ChanResult<ZDesc> {
        self.chan.recv_cancellable(timeout_ms, cancel)
    }

    fn close(&self) {
        self.chan.close();
    }

    fn len(&self) -> usize {
        self.chan.len()
    }

    fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    fn snapshot(&self) -> ChannelSnapshot {
        let mut snap = self.chan.snapshot();
        snap.caps |= CAP_ZERO_COPY;
        snap
    }

    fn select_register_recv(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<ZDesc>>,
    ) -> ChanResult<()> {
        self.chan.select_register_recv(core, index, cell)
    }

    fn select_register_send(
        &self,
        core: &Arc<SelectCore>,
        index: usize,
        cell: &Arc<ValueCell<ZDesc>>,
    ) -> ChanResult<()> {
        {
            let peek = cell.take();
            match peek {
                Some(d) => {
                    let rc = self.check_policy(&d);
                    cell.put(d);
                    if let Err(e) = rc {
                        return Err(e);
                    }
                }
                None => return Err(ChanError::WouldBlock),
            }
        }
        self.chan.select_register_send(core, index, cell)
    }

    fn select_cancel(&self, core: &Arc<SelectCore>, index: usize, op: SelectOp) {
        self.chan.select_cancel(core, index, op)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_region_lifecycle() {
        let reg = RegionRegistry::new();
        let id = reg.register(0x1000, 4096);
        assert_eq!(reg.query(id), Some((0x1000, 4096)));

        assert!(reg.incref(id));
        assert!(reg.incref(id));
        assert!(reg.decref(id));
        assert!(reg.decref(id));

        assert!(reg.deregister(id));
        assert_eq!(reg.query(id), None);
        assert!(!reg.deregister(id));
        assert!(!reg.incref(id));
    }

    #[test]
    fn test_incref_fails_while_deregistering() {
        let reg = RegionRegistry::new();
        let id = reg.register(0x2000, 64);
        assert!(reg.incref(id)); // refs = 2

        let reg2 = reg.clone();
        let waiter = thread::spawn(move || reg2.deregister(id));

        // Give the deregistering thread time to flag the region.
        thread::sleep(Duration::from_millis(20));
        assert!(!reg.incref(id));

        assert!(reg.decref(id));
        assert!(waiter.join().unwrap());
        assert_eq!(reg.query(id), None);
    }

    #[test]
    fn test_meta_roundtrip() {
        let reg = RegionRegistry::new();
        let id = reg.register(0x3000, 1024);
        assert_eq!(reg.get_meta(id), None);

        let mut meta = RegionMeta::default();
        meta.dtype = DType::Fp16;
        meta.elem_bits = 16;
        meta.align_bytes = 64;
        meta.stride_bytes = 128;
        meta.ndims = 2;
        meta.dims[0] = 32;
        meta.dims[1] = 64;
        assert!(reg.set_meta(id, meta));
        assert_eq!(reg.get_meta(id), Some(meta));

        reg.deregister(id);
        assert!(!reg.set_meta(id, meta));
    }

    #[test]
    fn test_alloc_aligned_registers() {
        let reg = RegionRegistry::new();
        let (p, id) = reg.alloc_aligned(4096, 64).unwrap();
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert_eq!(reg.query(id), Some((p as usize, 4096)));
        assert!(reg.deregister(id));
        unsafe {
            reg.release_aligned(p);
        }
    }

    #[test]
    fn test_format_policy_masks() {
        let reg = RegionRegistry::new();
        let id = reg.register(0x4000, 1024);
        let mut meta = RegionMeta::default();
        meta.dtype = DType::Fp32;
        meta.elem_bits = 32;
        meta.align_bytes = 32;
        reg.set_meta(id, meta);

        let desc = ZDesc {
            addr: 0x4000,
            len: 1024,
            region_id: id,
            offset: 0,
            flags: 0,
        };

        // Exact match passes in strict mode.
        let strict = FormatPolicy {
            meta: meta,
            mask: FMT_DTYPE | FMT_ELEMBITS | FMT_ALIGN,
            mode: FormatMode::Strict,
        };
        assert_eq!(strict.check(&reg, &desc), Ok(()));

        // A dtype mismatch fails strictly but passes advisory.
        let mut want = meta;
        want.dtype = DType::Fp16;
        let strict_bad = FormatPolicy {
            meta: want,
            mask: FMT_DTYPE,
            mode: FormatMode::Strict,
        };
        assert_eq!(strict_bad.check(&reg, &desc), Err(ChanError::InvalidFormat));
        let advisory = FormatPolicy {
            meta: want,
            mask: FMT_DTYPE,
            mode: FormatMode::Advisory,
        };
        assert_eq!(advisory.check(&reg, &desc), Ok(()));

        // Alignment is at-least: requiring 16 passes with 32 present.
        let mut align16 = meta;
        align16.align_bytes = 16;
        let policy = FormatPolicy {
            meta: align16,
            mask: FMT_ALIGN,
            mode: FormatMode::Strict,
        };
        assert_eq!(policy.check(&reg, &desc), Ok(()));

        // Requiring 64 fails with 32 present.
        let mut align64 = meta;
        align64.align_bytes = 64;
        let policy = FormatPolicy {
            meta: align64,
            mask: FMT_ALIGN,
            mode: FormatMode::Strict,
        };
        assert_eq!(policy.check(&reg, &desc), Err(ChanError::InvalidFormat));

        reg.deregister(id);
    }
}
