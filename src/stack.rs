// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers
// Copyright (c) 2026 Corovisor Contributors

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

//! Private coroutine stacks (§3 "Stack").
//!
//! Grounded on the teacher's `stack::stack_protected` (mmap + `mprotect`
//! guard page) and `stack::stack_pool` (LRU-bounded reuse), ported from the
//! `mmap` crate + raw `libc` calls to plain `libc::mmap`/`mprotect` directly,
//! since the teacher's `mmap` dependency predates a maintained crate of that
//! name on the modern registry.

use std::fmt;
use std::io;
use std::ptr;

/// Default usable stack size when a caller doesn't specify one (§3).
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a supported target.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if value % multiple == 0 {
        value
    } else {
        value + multiple - (value % multiple)
    }
}

/// A private, downward-growing stack with a low guard page.
///
/// `base` points at the guard page (the lowest address of the mapping);
/// `guard_end` (== usable-region start) is one page above it. The usable
/// region runs `[guard_end, base + total_len)`.
pub struct Stack {
    base: *mut libc::c_void,
    total_len: usize,
    guard_len: usize,
    usable_size: usize,
}

unsafe impl Send for Stack {}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("usable_size", &self.usable_size)
            .finish()
    }
}

impl Stack {
    /// Map `guard_page + usable_region` and protect the guard page
    /// (`PROT_NONE`), trapping overflow via hardware protection.
    pub fn new(usable_size: usize) -> io::Result<Stack> {
        let page = page_size();
        let usable_size = round_up(usable_size.max(page), page);
        let total_len = usable_size + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // The stack grows downward from the high end of the mapping toward
        // `base`; the guard page sits at the low end where an overflowing
        // write lands first.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(base, total_len);
            }
            return Err(err);
        }

        Ok(Stack {
            base,
            total_len,
            guard_len: page,
            usable_size,
        })
    }

    /// Pointer to the low end of the usable region (one page above the
    /// guard).
    pub fn guard_end(&self) -> *mut u8 {
        unsafe { (self.base as *mut u8).add(self.guard_len) }
    }

    /// Pointer one byte past the high end of the usable region -- the
    /// initial stack pointer, before platform alignment, for a
    /// downward-growing stack.
    pub fn top(&self) -> *mut u8 {
        unsafe { (self.base as *mut u8).add(self.total_len) }
    }

    pub fn usable_size(&self) -> usize {
        self.usable_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.total_len);
        }
    }
}

/// Per-worker LRU-bounded cache of released stacks, avoiding `mmap` churn
/// for steady-state spawn/finish cycles (§4.3 "local stack cache").
///
/// Grounded on the teacher's `StackPool`: linear scan for a stack at least
/// as large as requested, swap-remove on hit, bounded push on release.
pub struct StackPool {
    stacks: Vec<Stack>,
    capacity: usize,
}

impl StackPool {
    pub fn new(capacity: usize) -> StackPool {
        StackPool {
            stacks: Vec::new(),
            capacity,
        }
    }

    pub fn take(&mut self, usable_size: usize) -> io::Result<Stack> {
        match self.stacks.iter().position(|s| usable_size <= s.usable_size()) {
            Some(idx) => Ok(self.stacks.swap_remove(idx)),
            None => Stack::new(usable_size),
        }
    }

    pub fn give(&mut self, stack: Stack) {
        if self.stacks.len() < self.capacity {
            self.stacks.push(stack);
        }
        // else: drop releases the mapping immediately.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_usable_size_rounded_to_pages() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        assert!(stack.usable_size() >= DEFAULT_STACK_SIZE);
        assert!((stack.top() as usize) > (stack.guard_end() as usize));
    }

    #[test]
    fn pool_reuses_large_enough_stack() {
        let mut pool = StackPool::new(4);
        let s = pool.take(DEFAULT_STACK_SIZE).unwrap();
        let usable = s.usable_size();
        pool.give(s);

        let s2 = pool.take(DEFAULT_STACK_SIZE / 2).unwrap();
        assert_eq!(s2.usable_size(), usable);
    }

    #[test]
    fn pool_respects_capacity() {
        let mut pool = StackPool::new(1);
        let a = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let b = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        pool.give(a);
        pool.give(b);
        assert_eq!(pool.stacks.len(), 1);
    }
}
