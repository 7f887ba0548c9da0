//! mmap-backed fiber stacks
//!
//! Layout of one mapping (stack grows down):
//!
//! ```text
//! low                                                   high
//! +-------------+---------------------------------------+
//! | guard page  |            usable stack               |
//! | PROT_NONE   |          PROT_READ|PROT_WRITE         |
//! +-------------+---------------------------------------+
//! base                                                  top
//! ```
//!
//! Overflow hits the guard page and faults instead of corrupting a
//! neighbouring allocation. Stacks of the configured default size are
//! recycled through a bounded pool.

use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;
use fiberio_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use fiberio_core::{MemoryError, Result};

use crate::config;

/// One fiber stack with its guard page
pub struct Stack {
    base: *mut u8,
    len: usize,
}

// Safety: the mapping is owned exclusively by this value
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => GUARD_SIZE,
    })
}

impl Stack {
    /// Map a new stack with at least `size` usable bytes
    pub fn new(size: usize) -> Result<Stack> {
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall(size).into());
        }
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let guard = GUARD_SIZE.max(page);
        let len = usable + guard;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed(nix::errno::Errno::last_raw()).into());
        }

        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let errno = nix::errno::Errno::last_raw();
            unsafe { libc::munmap(base, len) };
            return Err(MemoryError::ProtectFailed(errno).into());
        }

        Ok(Stack { base: base as *mut u8, len })
    }

    /// Take a default-size stack from the pool, or map a new one
    pub fn acquire(size: usize) -> Result<Stack> {
        if size == config::get().stack_size {
            if let Some(stack) = pool().pop() {
                return Ok(stack);
            }
        }
        Stack::new(size)
    }

    /// Return a stack to the pool; unmapped when the pool is full
    pub fn release(self) {
        if self.size() == config::get().stack_size.div_ceil(page_size()) * page_size() {
            let _ = pool().push(self);
        }
    }

    /// High end of the usable region
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Usable bytes (guard excluded)
    #[inline]
    pub fn size(&self) -> usize {
        self.len - GUARD_SIZE.max(page_size())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

fn pool() -> &'static ArrayQueue<Stack> {
    static POOL: OnceLock<ArrayQueue<Stack>> = OnceLock::new();
    POOL.get_or_init(|| ArrayQueue::new(config::get().stack_pool_capacity.max(1)))
}

/// Number of stacks currently parked in the pool
pub fn pooled() -> usize {
    pool().len()
}
