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

//! Coroutine spawn options

use std::default::Default;

/// Default coroutine stack size (before page rounding)
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Properties of a coroutine to be spawned
#[derive(Debug, Clone)]
pub struct Options {
    /// Requested usable stack size in bytes. Rounded up to whole pages;
    /// zero floors to one page.
    pub stack_size: usize,

    /// Name used in trace logs and panic diagnostics
    pub name: Option<String>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
        }
    }

    /// Set the stack size
    pub fn stack_size(mut self, stack_size: usize) -> Options {
        self.stack_size = stack_size;
        self
    }

    /// Name the coroutine
    pub fn name(mut self, name: String) -> Options {
        self.name = Some(name);
        self
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}
