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

//! Multi-way wait over channel operations
//!
//! A `Select` owns an ordered list of recv/send clauses over channels of one
//! value type. At most one clause completes per wait: channels race to claim
//! the `SelectCore` latch with a CAS and only the winner moves a value.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng, XorShiftRng};

use coroutine::Handle;
use platform;
use runtime::{Processor, Scheduler};
use sync::cancel::CancelToken;
use sync::channel::{ChanError, ChanResult, Channel, Payload, ValueCell};

/// Direction of a select clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOp {
    Recv,
    Send,
}

/// Clause probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    /// Probe clauses in declaration order
    FirstWins,
    /// Shuffle the probe order per wait, seeded from the monotonic clock
    Randomized,
}

struct Decision {
    winner: isize,
    result: ChanResult<()>,
}

/// Completion latch shared between a waiting select and the channels its
/// clauses are registered on.
pub struct SelectCore {
    /// 0 = pending, 1 = claimed
    state: AtomicUsize,
    decision: Mutex<Decision>,
    waiter: Mutex<Option<Handle>>,
}

impl SelectCore {
    pub fn new() -> Arc<SelectCore> {
        Arc::new(SelectCore {
            state: AtomicUsize::new(0),
            decision: Mutex::new(Decision {
                winner: -1,
                result: Err(ChanError::WouldBlock),
            }),
            waiter: Mutex::new(None),
        })
    }

    /// Claim the latch for clause `index`. Only the single winner of the
    /// CAS records its decision; a channel must not move a value unless
    /// this returns true.
    pub fn try_complete(&self, index: usize, result: ChanResult<()>) -> bool {
        self.claim(index as isize, result)
    }

    /// Claim the latch with no winning clause (timeout/cancel/would-block)
    pub(crate) fn claim_none(&self, err: ChanError) -> bool {
        self.claim(-1, Err(err))
    }

    fn claim(&self, winner: isize, result: ChanResult<()>) -> bool {
        if self
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut d = self.decision.lock().unwrap();
            d.winner = winner;
            d.result = result;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }

    pub fn decision(&self) -> (isize, ChanResult<()>) {
        let d = self.decision.lock().unwrap();
        (d.winner, d.result)
    }

    /// Wake the parked waiter, if it has parked already
    pub fn wake(&self, sched: &Scheduler) {
        if let Some(co) = self.waiter.lock().unwrap().take() {
            sched.enqueue_ready(co);
        }
    }

    pub(crate) fn take_waiter(&self) -> Option<Handle> {
        self.waiter.lock().unwrap().take()
    }

    /// Park `co` on this select, or re-enqueue it immediately when the
    /// latch was claimed between registration and the switch.
    pub(crate) fn park_or_wake(&self, sched: &Scheduler, co: Handle) {
        let mut waiter = self.waiter.lock().unwrap();
        if self.is_claimed() {
            drop(waiter);
            sched.enqueue_ready(co);
        } else {
            *waiter = Some(co);
        }
    }
}

struct Clause<'a, T: Payload + 'a> {
    op: SelectOp,
    ch: &'a dyn Channel<T>,
    cell: Arc<ValueCell<T>>,
}

/// A multi-way wait over channels of `T`.
///
/// Clauses persist across waits; each `wait` uses a fresh latch. A receive
/// clause's value is fetched with `take_recv`; a send clause that did not
/// win keeps its value, recoverable with `take_unsent`.
pub struct Select<'a, T: Payload + 'a> {
    sched: Arc<Scheduler>,
    core: Arc<SelectCore>,
    clauses: Vec<Clause<'a, T>>,
    policy: SelectPolicy,
    cancel: Option<&'a CancelToken>,
}

impl<'a, T: Payload> Select<'a, T> {
    pub fn new(sched: &Arc<Scheduler>) -> Select<'a, T> {
        Select {
            sched: sched.clone(),
            core: SelectCore::new(),
            clauses: Vec::new(),
            policy: SelectPolicy::FirstWins,
            cancel: None,
        }
    }

    pub fn with_policy(mut self, policy: SelectPolicy) -> Select<'a, T> {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, token: &'a CancelToken) -> Select<'a, T> {
        self.cancel = Some(token);
        self
    }

    /// Add a receive clause; returns its index
    pub fn add_recv(&mut self, ch: &'a dyn Channel<T>) -> usize {
        self.clauses.push(Clause {
            op: SelectOp::Recv,
            ch: ch,
            cell: ValueCell::new(None),
        });
        self.clauses.len() - 1
    }

    /// Add a send clause carrying `val`; returns its index
    pub fn add_send(&mut self, ch: &'a dyn Channel<T>, val: T) -> usize {
        self.clauses.push(Clause {
            op: SelectOp::Send,
            ch: ch,
            cell: ValueCell::new(Some(val)),
        });
        self.clauses.len() - 1
    }

    pub fn clause_count(&self) -> usize {
        self.clauses.len()
    }

    /// Value received by the winning recv clause
    pub fn take_recv(&self, index: usize) -> Option<T> {
        self.clauses.get(index).and_then(|c| c.cell.take())
    }

    /// Value still held by a send clause that did not win
    pub fn take_unsent(&self, index: usize) -> Option<T> {
        self.clauses.get(index).and_then(|c| c.cell.take())
    }

    /// Wait for one clause to complete. Returns the winning clause index,
    /// or the error that ended the wait (`Timeout`, `Canceled`,
    /// `WouldBlock` for a zero timeout, `Closed` if a clause failed
    /// immediately).
    pub fn wait(&mut self, timeout_ms: i64) -> ChanResult<usize> {
        if self.clauses.is_empty() {
            return Err(ChanError::WouldBlock);
        }
        self.core = SelectCore::new();
        let deadline = platform::deadline_after_ms(timeout_ms);

        // Probe order
        let mut order: Vec<usize> = (0..self.clauses.len()).collect();
        if self.policy == SelectPolicy::Randomized && order.len() > 1 {
            let seed = platform::now_ns();
            let mut rng = XorShiftRng::from_seed([
                (seed as u32) | 1,
                ((seed >> 32) as u32) | 1,
                0x9e37_79b9,
                0x85eb_ca87,
            ]);
            // Burn a few rounds so near-identical clock seeds decorrelate.
            for _ in 0..3 {
                rng.gen::<u32>();
            }
            rng.shuffle(&mut order);
        }

        // Register every clause; a hook may complete immediately.
        let mut immediate: Option<(usize, ChanResult<()>)> = None;
        for &i in &order {
            if self.core.is_claimed() {
                break;
            }
            let rc = {
                let c = &self.clauses[i];
                match c.op {
                    SelectOp::Recv => c.ch.select_register_recv(&self.core, i, &c.cell),
                    SelectOp::Send => c.ch.select_register_send(&self.core, i, &c.cell),
                }
            };
            match rc {
                Err(ChanError::WouldBlock) => continue,
                other => {
                    immediate = Some((i, other));
                    break;
                }
            }
        }

        if let Some((i, rc)) = immediate {
            // A hook that returns Ok has claimed the latch itself; claim it
            // here for immediate failures so late completions cannot race.
            if let Err(e) = rc {
                self.core.try_complete(i, Err(e));
            }
            return self.finish();
        }

        if timeout_ms == 0 {
            self.core.claim_none(ChanError::WouldBlock);
            return self.finish();
        }

        // Park until a channel claims a clause, the deadline passes, or the
        // cancellation token fires; token waits poll on a bounded slice.
        loop {
            if self.core.is_claimed() {
                return self.finish();
            }
            if let Some(tok) = self.cancel {
                if tok.is_set() {
                    self.core.claim_none(ChanError::Canceled);
                    return self.finish();
                }
            }
            if let Some(d) = deadline {
                if platform::now_ns() >= d {
                    self.core.claim_none(ChanError::Timeout);
                    return self.finish();
                }
            }

            let processor = match Processor::current() {
                Some(p) => {
                    if p.has_coroutine() {
                        p
                    } else {
                        self.core.claim_none(ChanError::WouldBlock);
                        return self.finish();
                    }
                }
                None => {
                    self.core.claim_none(ChanError::WouldBlock);
                    return self.finish();
                }
            };

            let timer = ::sync::channel::next_wake(deadline, self.cancel.is_some())
                .and_then(|at| {
                    let core = self.core.clone();
                    let weak_sched = Arc::downgrade(&self.sched);
                    self.sched.timer_at(
                        at,
                        Box::new(move || {
                            if let Some(sched) = weak_sched.upgrade() {
                                if let Some(co) = core.take_waiter() {
                                    sched.enqueue_ready(co);
                                }
                            }
                        }),
                    )
                });

            let core = self.core.clone();
            let sched = self.sched.clone();
            processor.park_with(move |_, co| {
                core.park_or_wake(&sched, co);
            });

            if let Some(t) = timer {
                self.sched.timer_cancel(t);
            }
        }
    }

    /// Read the decision, sweep non-winning clauses off their channels and
    /// translate the result
    fn finish(&mut self) -> ChanResult<usize> {
        let (winner, result) = self.core.decision();
        for (i, c) in self.clauses.iter().enumerate() {
            if i as isize != winner {
                c.ch.select_cancel(&self.core, i, c.op);
            }
        }
        match result {
            Ok(()) => Ok(winner as usize),
            Err(e) => Err(e),
        }
    }
}
