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

//! Stackful coroutines
//!
//! A `Coroutine` owns a guard-paged stack and a saved machine context. A
//! worker switches into it with `resume`; the coroutine switches out with
//! `yield_with`, carrying a state and a data word. The data word is how the
//! park protocol smuggles a carrier across the switch (see
//! `runtime::processor`).

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic;
use std::process;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use options::Options;
use platform;

/// State of a coroutine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Created but never resumed
    Created,

    /// Runnable, waiting in the ready list
    Ready,

    /// Currently executing on a worker
    Running,

    /// Yielded voluntarily; the worker re-enqueues it
    Suspended,

    /// Parked; ownership has been handed to a waiter structure
    Parked,

    /// Entry function returned; never resumed again
    Finished,
}

/// Payload passed through a context switch into a coroutine
struct ResumePayload {
    coro: *mut Coroutine,
    data: usize,
}

/// A stackful cooperative task
pub struct Coroutine {
    /// Saved context to switch into. `None` while the coroutine runs.
    ctx: Option<Context>,

    /// Context of whoever resumed us. Valid only while running.
    parent: Option<Context>,

    stack: Option<ProtectedFixedSizeStack>,

    state: State,

    entry: Option<Box<dyn FnOnce() + Send + 'static>>,

    name: Option<String>,
}

/// Owning handle for a coroutine.
///
/// Moving the `Handle` between the ready list, a channel waiter node, a
/// select core or a timer callback is what keeps a coroutine in at most one
/// queue at a time: there is exactly one owner.
pub struct Handle(Box<Coroutine>);

unsafe impl Send for Handle {}

impl Handle {
    fn new(c: Coroutine) -> Handle {
        Handle(Box::new(c))
    }
}

impl Deref for Handle {
    type Target = Coroutine;

    #[inline]
    fn deref(&self) -> &Coroutine {
        &*self.0
    }
}

impl DerefMut for Handle {
    #[inline]
    fn deref_mut(&mut self) -> &mut Coroutine {
        &mut *self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Coroutine(`{}`, {:?})", self.debug_name(), self.state())
    }
}

extern "C" fn coroutine_entry(t: Transfer) -> ! {
    let (coro_ptr, _first) = unsafe {
        let payload = &*(t.data as *const ResumePayload);
        (payload.coro, payload.data)
    };

    {
        let coro = unsafe { &mut *coro_ptr };
        coro.parent = Some(t.context);
        coro.state = State::Running;

        let f = coro.entry.take().expect("coroutine entry is missing");
        trace!("coroutine `{}`: entering", coro.debug_name());
        if let Err(err) = panic::catch_unwind(panic::AssertUnwindSafe(move || f())) {
            let msg = err
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| err.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "Box<Any>".to_string());
            error!("coroutine `{}` panicked: {}", coro.debug_name(), msg);
        }
        trace!("coroutine `{}`: finished", coro.debug_name());

        coro.state = State::Finished;
        let parent = coro
            .parent
            .take()
            .expect("finished coroutine has no parent context");
        unsafe {
            parent.resume(0);
        }
    }

    // A finished coroutine must never be resumed again.
    error!("control returned to a finished coroutine");
    process::abort();
}

impl Coroutine {
    /// Create a coroutine with default options
    pub fn spawn<F>(f: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine::spawn_opts(f, Options::new())
    }

    /// Create a coroutine running `f` on its own guard-paged stack.
    ///
    /// The stack is rounded up to whole pages; a request of zero floors to
    /// one page. The low page below the stack is protected, so an overflow
    /// faults deterministically instead of corrupting neighboring memory.
    pub fn spawn_opts<F>(f: F, opts: Options) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = ProtectedFixedSizeStack::new(platform::page_ceil(opts.stack_size))
            .expect("failed to allocate coroutine stack");
        let ctx = unsafe { Context::new(&stack, coroutine_entry) };

        Handle::new(Coroutine {
            ctx: Some(ctx),
            parent: None,
            stack: Some(stack),
            state: State::Created,
            entry: Some(Box::new(f)),
            name: opts.name,
        })
    }

    /// Switch into the coroutine. Returns the data word it yielded with.
    ///
    /// Must not be called on a `Finished` coroutine.
    pub fn resume(&mut self, data: usize) -> usize {
        debug_assert!(
            self.state != State::Finished,
            "cannot resume a finished coroutine"
        );

        let ctx = self
            .ctx
            .take()
            .expect("resume on a coroutine without a saved context");
        self.state = State::Running;

        let payload = ResumePayload {
            coro: self as *mut Coroutine,
            data: data,
        };
        let t = unsafe { ctx.resume(&payload as *const ResumePayload as usize) };
        self.ctx = Some(t.context);
        t.data
    }

    /// Switch out of the coroutine with the given state, handing `data` back
    /// to the resumer. Returns the data word of the next resume.
    ///
    /// Must only be called from inside the coroutine itself.
    pub fn yield_with(&mut self, state: State, data: usize) -> usize {
        self.state = state;
        let parent = self
            .parent
            .take()
            .expect("yield from a coroutine that was never resumed");

        let t = unsafe { parent.resume(data) };

        // Resumed again: pick up the resumer's fresh context.
        let next = unsafe { &*(t.data as *const ResumePayload) };
        self.parent = Some(t.context);
        self.state = State::Running;
        next.data
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    #[inline]
    pub fn is_parked(&self) -> bool {
        self.state == State::Parked
    }

    pub fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|s| &s[..])
    }

    /// Name for diagnostics; `<unnamed>` if the coroutine has none
    pub fn debug_name(&self) -> &str {
        match self.name {
            Some(ref n) => &n[..],
            None => "<unnamed>",
        }
    }

    /// Usable stack size in bytes
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map(|s| s.len()).unwrap_or(0)
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Coroutine(`{}`, {:?})", self.debug_name(), self.state)
    }
}
