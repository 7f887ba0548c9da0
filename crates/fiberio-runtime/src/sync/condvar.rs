//! Condition variable paired with [`FiberMutex`]

use std::collections::VecDeque;
use std::fmt;

use fiberio_core::SpinLock;

use super::mutex::{FiberMutex, FiberMutexGuard};
use super::waiter::Waiter;

pub struct FiberCondvar {
    waiters: SpinLock<VecDeque<Waiter>>,
}

impl FiberCondvar {
    pub const fn new() -> Self {
        Self { waiters: SpinLock::new(VecDeque::new()) }
    }

    /// Release `guard`, suspend until notified, then re-lock
    ///
    /// The caller is queued before the mutex is released, so a notify
    /// issued by whoever takes the mutex next cannot be missed.
    pub fn wait<'a, T: ?Sized>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let mutex: &'a FiberMutex<T> = FiberMutexGuard::mutex(&guard);
        let (waiter, park) = Waiter::current();
        self.waiters.lock().push_back(waiter);
        drop(guard);
        park.wait();
        mutex.lock()
    }

    /// Wait until `condition` returns false
    pub fn wait_while<'a, T, F>(&self, mut guard: FiberMutexGuard<'a, T>, mut condition: F) -> FiberMutexGuard<'a, T>
    where
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    pub fn notify_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.wake();
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for FiberCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FiberCondvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberCondvar").field("waiters", &self.waiter_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;

    #[test]
    fn test_producer_consumer() {
        let sched = Scheduler::new(2, false, "condvar").unwrap();
        let shared = Arc::new((FiberMutex::new(VecDeque::new()), FiberCondvar::new()));
        let out = Arc::new(FiberMutex::new(Vec::new()));

        sched.start().unwrap();
        for _ in 0..2 {
            let (shared, out) = (shared.clone(), out.clone());
            sched.spawn(move || {
                let (queue, cv) = &*shared;
                loop {
                    let mut q = cv.wait_while(queue.lock(), |q| q.is_empty());
                    let Some(item) = q.pop_front() else { continue };
                    drop(q);
                    if item < 0 {
                        break;
                    }
                    out.lock().push(item);
                }
            });
        }

        let producer = shared.clone();
        sched.spawn(move || {
            let (queue, cv) = &*producer;
            for i in 0..100 {
                queue.lock().push_back(i);
                cv.notify_one();
                if i % 10 == 0 {
                    Scheduler::yield_now();
                }
            }
            // One stop marker per consumer
            queue.lock().extend([-1, -1]);
            cv.notify_all();
        });
        sched.stop().unwrap();

        let mut got = out.lock().clone();
        got.sort();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert_eq!(shared.1.waiter_count(), 0);
    }

    #[test]
    fn test_thread_wait_and_notify() {
        let shared = Arc::new((FiberMutex::new(false), FiberCondvar::new()));
        let s = shared.clone();
        let waiter = std::thread::spawn(move || {
            let (flag, cv) = &*s;
            let guard = cv.wait_while(flag.lock(), |ready| !*ready);
            assert!(*guard);
        });

        while shared.1.waiter_count() == 0 {
            std::thread::yield_now();
        }
        *shared.0.lock() = true;
        shared.1.notify_all();
        waiter.join().unwrap();
    }
}
