//! Architecture-specific context switching
//!
//! Each backend provides the same three items:
//!
//! - `Context`: callee-saved registers plus stack and resume addresses
//! - `init_context`: prime a context so the first switch lands in `entry(arg)`
//! - `switch_context`: save the running context and load another one

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("fiberio supports x86_64 and aarch64 only");
    }
}

/// Entry point a fresh context starts in; it must never return
pub type EntryFn = extern "C" fn(usize) -> !;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;

    struct Pair {
        main: UnsafeCell<Context>,
        side: UnsafeCell<Context>,
        hits: UnsafeCell<u32>,
    }

    extern "C" fn bounce(arg: usize) -> ! {
        let pair = unsafe { &*(arg as *const Pair) };
        loop {
            unsafe {
                *pair.hits.get() += 1;
                switch_context(pair.side.get(), pair.main.get());
            }
        }
    }

    #[test]
    fn test_switch_round_trips() {
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let pair = Box::new(Pair {
            main: UnsafeCell::new(Context::default()),
            side: UnsafeCell::new(Context::default()),
            hits: UnsafeCell::new(0),
        });
        let arg = &*pair as *const Pair as usize;

        unsafe {
            init_context(pair.side.get(), top, bounce, arg);
            for expected in 1..=3 {
                switch_context(pair.main.get(), pair.side.get());
                assert_eq!(*pair.hits.get(), expected);
            }
        }
    }
}
