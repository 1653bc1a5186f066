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

//! Platform primitives: monotonic clock, page geometry and aligned allocation

use std::mem;
use std::ptr;

use libc;
use time;

/// Monotonic clock in nanoseconds. Only differences are meaningful.
#[inline]
pub fn now_ns() -> u64 {
    time::precise_time_ns()
}

/// Size of a virtual memory page
pub fn page_size() -> usize {
    let p = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if p > 0 {
        p as usize
    } else {
        4096
    }
}

/// Round `bytes` up to a whole number of pages, at least one page
pub fn page_ceil(bytes: usize) -> usize {
    let ps = page_size();
    if bytes == 0 {
        return ps;
    }
    (bytes + ps - 1) & !(ps - 1)
}

/// Absolute deadline for a relative millisecond timeout.
///
/// A negative timeout means "wait forever" and maps to `None`.
#[inline]
pub fn deadline_after_ms(timeout_ms: i64) -> Option<u64> {
    if timeout_ms < 0 {
        None
    } else {
        Some(now_ns() + timeout_ms as u64 * 1_000_000)
    }
}

/// Allocate `size` bytes aligned to `align` (a power of two; 0 defaults to 64).
///
/// Returns a null pointer on failure. The block must be released with
/// `release_aligned`.
pub unsafe fn alloc_aligned(size: usize, align: usize) -> *mut u8 {
    let mut align = if align == 0 { 64 } else { align };
    if align < mem::size_of::<usize>() {
        align = mem::size_of::<usize>();
    }
    let mut p: *mut libc::c_void = ptr::null_mut();
    if libc::posix_memalign(&mut p, align, size) != 0 {
        return ptr::null_mut();
    }
    p as *mut u8
}

/// Release a block obtained from `alloc_aligned`
pub unsafe fn release_aligned(p: *mut u8) {
    if !p.is_null() {
        libc::free(p as *mut libc::c_void);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_page_ceil() {
        let ps = page_size();
        assert_eq!(page_ceil(0), ps);
        assert_eq!(page_ceil(1), ps);
        assert_eq!(page_ceil(ps), ps);
        assert_eq!(page_ceil(ps + 1), ps * 2);
    }

    #[test]
    fn test_now_ns_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_deadline() {
        assert_eq!(deadline_after_ms(-1), None);
        let d = deadline_after_ms(10).unwrap();
        assert!(d > now_ns());
    }

    #[test]
    fn test_aligned_alloc() {
        unsafe {
            let p = alloc_aligned(1024, 64);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            release_aligned(p);
        }
    }
}
