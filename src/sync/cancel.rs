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

//! Hierarchical cancellation tokens
//!
//! Triggering a token cancels it and, depth-first, every descendant.
//! `is_set` is a single atomic load, so channel operations can poll it on
//! every wake without contention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use platform;
use sync::channel::{ChanError, ChanResult};

struct TokenInner {
    canceled: AtomicBool,
    children: Mutex<Vec<Weak<TokenInner>>>,
    cv: Condvar,
}

impl TokenInner {
    fn new() -> Arc<TokenInner> {
        Arc::new(TokenInner {
            canceled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        })
    }

    fn trigger(this: &Arc<TokenInner>) {
        let children: Vec<Arc<TokenInner>> = {
            let guard = this.children.lock().unwrap();
            if this.canceled.swap(true, Ordering::AcqRel) {
                return;
            }
            this.cv.notify_all();
            guard.iter().filter_map(|w| w.upgrade()).collect()
        };

        for child in children {
            TokenInner::trigger(&child);
        }
    }
}

/// A cancellation token, optionally attached to a parent.
///
/// Dropping a child detaches it from its parent's child list.
pub struct CancelToken {
    inner: Arc<TokenInner>,
    parent: Option<Arc<TokenInner>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: TokenInner::new(),
            parent: None,
        }
    }

    /// Create a child token. If the parent is already canceled, the child
    /// starts canceled and is not attached.
    pub fn child(&self) -> CancelToken {
        let inner = TokenInner::new();

        {
            let mut children = self.inner.children.lock().unwrap();
            if self.inner.canceled.load(Ordering::Acquire) {
                inner.canceled.store(true, Ordering::Release);
                return CancelToken {
                    inner: inner,
                    parent: None,
                };
            }
            children.push(Arc::downgrade(&inner));
        }

        CancelToken {
            inner: inner,
            parent: Some(self.inner.clone()),
        }
    }

    /// Cancel this token and all descendants. Idempotent.
    pub fn trigger(&self) {
        TokenInner::trigger(&self.inner);
    }

    /// Whether the token has been canceled. Wait-free.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Block the calling OS thread until the token is canceled.
    ///
    /// Returns `Ok(())` on cancellation and `Err(Timeout)` when the timeout
    /// expires first; a negative timeout waits forever.
    pub fn wait(&self, timeout_ms: i64) -> ChanResult<()> {
        if self.is_set() {
            return Ok(());
        }

        let mut guard = self.inner.children.lock().unwrap();
        if timeout_ms < 0 {
            while !self.inner.canceled.load(Ordering::Acquire) {
                guard = self.inner.cv.wait(guard).unwrap();
            }
            return Ok(());
        }

        let deadline = platform::now_ns() + timeout_ms as u64 * 1_000_000;
        while !self.inner.canceled.load(Ordering::Acquire) {
            let now = platform::now_ns();
            if now >= deadline {
                return Err(ChanError::Timeout);
            }
            let wait_ns = deadline - now;
            let (g, _) = self
                .inner
                .cv
                .wait_timeout(guard, ::std::time::Duration::from_nanos(wait_ns))
                .unwrap();
            guard = g;
        }
        Ok(())
    }
}

impl Drop for CancelToken {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            let mut children = parent.children.lock().unwrap();
            let me = &self.inner;
            children.retain(|w| match w.upgrade() {
                Some(c) => !Arc::ptr_eq(&c, me),
                None => false,
            });
        }
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_trigger_idempotent() {
        let t = CancelToken::new();
        assert!(!t.is_set());
        t.trigger();
        assert!(t.is_set());
        t.trigger();
        assert!(t.is_set());
    }

    #[test]
    fn test_child_propagation() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.trigger();
        assert!(parent.is_set());
        assert!(child.is_set());
        assert!(grandchild.is_set());
    }

    #[test]
    fn test_child_of_canceled_parent() {
        let parent = CancelToken::new();
        parent.trigger();
        let child = parent.child();
        assert!(child.is_set());
    }

    #[test]
    fn test_child_trigger_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.trigger();
        assert!(child.is_set());
        assert!(!parent.is_set());
    }

    #[test]
    fn test_dropped_child_detaches() {
        let parent = CancelToken::new();
        {
            let _child = parent.child();
        }
        // No dangling weak refs are upgraded during propagation.
        parent.trigger();
        assert!(parent.is_set());
    }

    #[test]
    fn test_wait_timeout() {
        let t = CancelToken::new();
        assert_eq!(t.wait(10), Err(ChanError::Timeout));
    }

    #[test]
    fn test_wait_for_trigger() {
        let t = CancelToken::new();
        let inner = t.inner.clone();
        let waiter = thread::spawn(move || {
            let t2 = CancelToken {
                inner: inner,
                parent: None,
            };
            t2.wait(2000)
        });
        thread::sleep(Duration::from_millis(20));
        t.trigger();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }
}
