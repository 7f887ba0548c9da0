//! Counting semaphore for fibers

use std::collections::VecDeque;
use std::fmt;

use fiberio_core::SpinLock;

use super::waiter::Waiter;

struct State {
    permits: usize,
    waiters: VecDeque<Waiter>,
}

/// `wait` takes a permit, suspending the caller while none is left;
/// `post` returns one, handing it straight to the oldest waiter
pub struct FiberSemaphore {
    state: SpinLock<State>,
}

impl FiberSemaphore {
    pub const fn new(permits: usize) -> Self {
        Self { state: SpinLock::new(State { permits, waiters: VecDeque::new() }) }
    }

    pub fn try_wait(&self) -> bool {
        let mut st = self.state.lock();
        if st.permits > 0 {
            st.permits -= 1;
            true
        } else {
            false
        }
    }

    pub fn wait(&self) {
        let mut st = self.state.lock();
        if st.permits > 0 {
            st.permits -= 1;
            return;
        }
        let (waiter, park) = Waiter::current();
        st.waiters.push_back(waiter);
        drop(st);
        park.wait();
    }

    pub fn post(&self) {
        let next = {
            let mut st = self.state.lock();
            let next = st.waiters.pop_front();
            if next.is_none() {
                st.permits += 1;
            }
            next
        };
        if let Some(waiter) = next {
            waiter.wake();
        }
    }

    pub fn permits(&self) -> usize {
        self.state.lock().permits
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl fmt::Debug for FiberSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("FiberSemaphore")
            .field("permits", &st.permits)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}
