//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended `lock` suspends the calling fiber
//! and leaves its OS thread free to run other work. Ownership is handed
//! directly to the oldest waiter on unlock, so grants are FIFO.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};

use fiberio_core::SpinLock;

use super::waiter::Waiter;

struct State {
    locked: bool,
    waiters: VecDeque<Waiter>,
}

pub struct FiberMutex<T: ?Sized> {
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `state.locked`
unsafe impl<T: ?Sized + Send> Send for FiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(State { locked: false, waiters: VecDeque::new() }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberMutex<T> {
    /// Acquire the lock, suspending the caller while contended
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        let mut st = self.state.lock();
        if !st.locked {
            st.locked = true;
            return FiberMutexGuard { mutex: self };
        }

        let (waiter, park) = Waiter::current();
        st.waiters.push_back(waiter);
        drop(st);
        park.wait();
        // Handed over by unlock with `locked` still set
        FiberMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        let mut st = self.state.lock();
        if st.locked {
            return None;
        }
        st.locked = true;
        Some(FiberMutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Callers currently queued
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        let next = {
            let mut st = self.state.lock();
            let next = st.waiters.pop_front();
            if next.is_none() {
                st.locked = false;
            }
            next
        };
        if let Some(waiter) = next {
            waiter.wake();
        }
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("FiberMutex").field("data", &&*guard).finish(),
            None => f.debug_struct("FiberMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Releases the mutex when dropped
pub struct FiberMutexGuard<'a, T: ?Sized> {
    mutex: &'a FiberMutex<T>,
}

impl<'a, T: ?Sized> FiberMutexGuard<'a, T> {
    /// Mutex this guard locks
    pub(crate) fn mutex(guard: &Self) -> &'a FiberMutex<T> {
        guard.mutex
    }
}

impl<T: ?Sized> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_basic_lock() {
        let mutex = FiberMutex::new(0);
        *mutex.lock() = 42;
        assert_eq!(*mutex.lock(), 42);

        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), 42);
    }

    #[test]
    fn test_k_fibers_never_lose_updates() {
        const K: usize = 64;
        let sched = Scheduler::new(4, false, "mutex-k").unwrap();
        let mutex = Arc::new(FiberMutex::new(0usize));

        sched.start().unwrap();
        for _ in 0..K {
            let mutex = mutex.clone();
            sched.spawn(move || {
                let mut guard = mutex.lock();
                let v = *guard;
                // Hold the lock across a yield so others queue up
                Scheduler::yield_now();
                *guard = v + 1;
            });
        }
        sched.stop().unwrap();

        assert_eq!(*mutex.lock(), K);
        assert_eq!(mutex.waiter_count(), 0);
    }

    #[test]
    fn test_grants_are_fifo() {
        let sched = Scheduler::new(1, false, "mutex-fifo").unwrap();
        let mutex = Arc::new(FiberMutex::new(Vec::new()));
        let queued = Arc::new(AtomicUsize::new(0));

        // Hold the lock from this thread while fibers queue in order
        let guard = mutex.lock();
        sched.start().unwrap();
        for i in 0..5 {
            let m = mutex.clone();
            let queued = queued.clone();
            sched.spawn(move || {
                queued.fetch_add(1, Ordering::SeqCst);
                m.lock().push(i);
            });
            while mutex.waiter_count() < i + 1 {
                thread::yield_now();
            }
        }
        assert_eq!(queued.load(Ordering::SeqCst), 5);
        drop(guard);
        sched.stop().unwrap();

        assert_eq!(*mutex.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_thread_waiters() {
        let mutex = Arc::new(FiberMutex::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 2000);
    }

    #[test]
    fn test_fiber_and_thread_share_lock() {
        let sched = Scheduler::new(1, false, "mutex-mixed").unwrap();
        let mutex = Arc::new(FiberMutex::new(()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = mutex.lock();
        sched.start().unwrap();
        let (m, o) = (mutex.clone(), order.clone());
        sched.spawn(move || {
            assert!(Fiber::in_fiber());
            let _g = m.lock();
            o.lock().unwrap().push("fiber");
        });
        while mutex.waiter_count() == 0 {
            thread::yield_now();
        }
        order.lock().unwrap().push("thread");
        drop(guard);
        sched.stop().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["thread", "fiber"]);
    }
}
