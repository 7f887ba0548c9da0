//! Fallback parking using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::WorkerParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct FallbackParking {
    /// wake pending
    mutex: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn signal(&self, all: bool) {
        let mut pending = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        *pending = true;
        drop(pending);
        if all {
            self.condvar.notify_all();
        } else {
            self.condvar.notify_one();
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if *pending {
            *pending = false;
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        pending = match timeout {
            Some(t) => {
                self.condvar
                    .wait_timeout(pending, t)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
            None => self.condvar.wait(pending).unwrap_or_else(|e| e.into_inner()),
        };
        self.parked.fetch_sub(1, Ordering::SeqCst);

        std::mem::replace(&mut *pending, false)
    }

    fn wake_one(&self) {
        self.signal(false);
    }

    fn wake_all(&self) {
        self.signal(true);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
