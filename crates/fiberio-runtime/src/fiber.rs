//! Stackful fibers
//!
//! A `Fiber` owns an mmap'd stack, a saved register context and the callable
//! it runs. Fibers are always handled through `Arc<Fiber>`.
//!
//! # State ownership
//!
//! `resume` moves READY -> EXEC with a CAS, so a fiber can never be resumed
//! twice. The transition out of EXEC is committed by the *resumer* once the
//! switch back has returned, i.e. after the fiber's registers are saved. A
//! fiber that publishes itself to a wait queue and then yields may therefore
//! be popped by another thread while still EXEC; that thread sees EXEC and
//! retries later instead of jumping into a half-saved context.
//!
//! # Root fibers
//!
//! The first call to [`Fiber::current`] on a thread materializes a stackless
//! root fiber standing for the thread's own stack. It is permanently EXEC and
//! can never be yielded.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use fiberio_core::{fdebug, ferror, ftrace};
use fiberio_core::log;
use fiberio_core::{Error, FiberId, FiberState, Result};

use crate::arch::{self, Context};
use crate::config;
use crate::stack::Stack;
use crate::tls;

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

static LIVE: AtomicU64 = AtomicU64::new(0);
static TOTAL: AtomicU64 = AtomicU64::new(0);

/// Fibers currently alive (root fibers included)
pub fn live_count() -> u64 {
    LIVE.load(Ordering::Relaxed)
}

/// Fibers ever created
pub fn total_count() -> u64 {
    TOTAL.load(Ordering::Relaxed)
}

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// State the resumer commits when the fiber switches back
    exit: AtomicU8,
    /// Set by `Scheduler::yield_now`: put back on the queue after switching out
    requeue: AtomicBool,
    ctx: UnsafeCell<Context>,
    /// Context of whoever resumed us last
    caller: UnsafeCell<*mut Context>,
    stack: Option<Stack>,
    callback: UnsafeCell<Option<Callback>>,
}

// Safety: `ctx`, `caller` and `callback` are only touched by the thread that
// currently owns the fiber's EXEC transition (or through `&mut`).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the configured default stack size
    pub fn new<F>(f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(0, f)
    }

    /// Create a fiber; `stack_size == 0` selects the configured default
    pub fn with_stack_size<F>(stack_size: usize, f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 { config::get().stack_size } else { stack_size };
        let stack = Stack::acquire(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            exit: AtomicU8::new(FiberState::Ready as u8),
            requeue: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::default()),
            caller: UnsafeCell::new(std::ptr::null_mut()),
            stack: Some(stack),
            callback: UnsafeCell::new(Some(Box::new(f))),
        });
        unsafe { fiber.prime() };

        LIVE.fetch_add(1, Ordering::Relaxed);
        TOTAL.fetch_add(1, Ordering::Relaxed);
        ftrace!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    fn new_root() -> Arc<Fiber> {
        LIVE.fetch_add(1, Ordering::Relaxed);
        TOTAL.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Exec as u8),
            exit: AtomicU8::new(FiberState::Ready as u8),
            requeue: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::default()),
            caller: UnsafeCell::new(std::ptr::null_mut()),
            stack: None,
            callback: UnsafeCell::new(None),
        })
    }

    /// Point the context at `fiber_entry` on a fresh stack top
    ///
    /// # Safety
    ///
    /// The fiber must not be running and `self` must live inside an `Arc`.
    unsafe fn prime(&self) {
        if let Some(stack) = &self.stack {
            arch::init_context(self.ctx.get(), stack.top(), fiber_entry, self as *const Fiber as usize);
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// True for a thread's stackless root fiber
    #[inline]
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Switch into the fiber, returning when it yields or terminates.
    ///
    /// Fails with `InvalidState` unless the fiber is READY.
    pub fn try_resume(&self) -> Result<()> {
        self.state
            .compare_exchange(
                FiberState::Ready as u8,
                FiberState::Exec as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|actual| Error::InvalidState {
                expected: FiberState::Ready,
                actual: FiberState::from(actual),
            })?;

        let prev = current_ptr();
        unsafe {
            *self.caller.get() = (*prev).ctx.get();
            tls::set_current_fiber(self);
            log::set_fiber_id(self.id.as_u64());

            arch::switch_context((*prev).ctx.get(), self.ctx.get());

            tls::set_current_fiber(prev);
            log::set_fiber_id((*prev).id.as_u64());
        }

        let next = self.exit.swap(FiberState::Ready as u8, Ordering::AcqRel);
        self.state.store(next, Ordering::Release);
        Ok(())
    }

    /// Like [`try_resume`](Self::try_resume); resuming a fiber that is not
    /// READY is a fatal programming error.
    pub fn resume(&self) {
        if let Err(e) = self.try_resume() {
            crate::fatal!("resume of fiber {} failed: {}", self.id, e);
        }
    }

    /// Rebind a terminated fiber to a new callable, reusing its stack
    ///
    /// The fiber must be TERM or EXCEPT and uniquely owned.
    pub fn reset<F>(fiber: &mut Arc<Fiber>, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::rebind(fiber, Box::new(f)).map_err(|(e, _)| e)
    }

    /// `reset` that hands the callable back when the fiber can't take it
    pub(crate) fn rebind(
        fiber: &mut Arc<Fiber>,
        cb: Callback,
    ) -> std::result::Result<(), (Error, Callback)> {
        let state = fiber.state();
        if !state.is_terminated() || fiber.is_root() {
            return Err((Error::InvalidState { expected: FiberState::Term, actual: state }, cb));
        }
        let Some(this) = Arc::get_mut(fiber) else {
            return Err((Error::Busy, cb));
        };
        *this.callback.get_mut() = Some(cb);
        *this.exit.get_mut() = FiberState::Ready as u8;
        *this.requeue.get_mut() = false;
        unsafe { this.prime() };
        this.state.store(FiberState::Ready as u8, Ordering::Release);
        Ok(())
    }

    /// Switch back to whoever resumed the current fiber
    ///
    /// The fiber stays parked until something resumes it again. Calling this
    /// outside a fiber (on a root fiber) is a fatal programming error.
    pub fn yield_now() {
        let cur = tls::current_fiber();
        if cur.is_null() || unsafe { (*cur).is_root() } {
            crate::fatal!("yield_now called on a root fiber");
        }
        unsafe { (*cur).switch_out() }
    }

    /// # Safety
    ///
    /// Must be called on the fiber currently executing on this thread.
    unsafe fn switch_out(&self) {
        arch::switch_context(self.ctx.get(), *self.caller.get());
    }

    /// The fiber running on this thread; creates the root fiber on first use
    pub fn current() -> Arc<Fiber> {
        let ptr = current_ptr();
        // Safety: `ptr` came from an Arc kept alive by its resumer or by TLS
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber without touching reference counts
    pub fn current_id() -> FiberId {
        let ptr = tls::current_fiber();
        if ptr.is_null() {
            FiberId::NONE
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// True when called from a non-root fiber
    pub fn in_fiber() -> bool {
        let ptr = tls::current_fiber();
        !ptr.is_null() && unsafe { !(*ptr).is_root() }
    }

    pub(crate) fn mark_requeue(&self) {
        self.requeue.store(true, Ordering::Release);
    }

    pub(crate) fn take_requeue(&self) -> bool {
        self.requeue.swap(false, Ordering::AcqRel)
    }
}

fn current_ptr() -> *const Fiber {
    let ptr = tls::current_fiber();
    if !ptr.is_null() {
        return ptr;
    }
    tls::install_root_fiber(Fiber::new_root());
    tls::current_fiber()
}

extern "C" fn fiber_entry(arg: usize) -> ! {
    // Safety: `arg` is the address of the Arc'd fiber, held by the resumer
    let fiber = unsafe { &*(arg as *const Fiber) };
    let outcome = run_callback(fiber);
    fiber.exit.store(outcome as u8, Ordering::Release);
    unsafe { fiber.switch_out() };
    crate::fatal!("terminated fiber {} was switched back into", fiber.id)
}

fn run_callback(fiber: &Fiber) -> FiberState {
    let Some(cb) = (unsafe { (*fiber.callback.get()).take() }) else {
        return FiberState::Term;
    };
    match catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => FiberState::Term,
        Err(payload) => {
            ferror!(
                "fiber {} panicked: {}\n{}",
                fiber.id,
                panic_message(payload.as_ref()),
                Backtrace::force_capture()
            );
            FiberState::Except
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let state = self.state();
        if self.stack.is_some() && state == FiberState::Exec {
            crate::fatal!("fiber {} dropped while running", self.id);
        }
        if let Some(stack) = self.stack.take() {
            stack.release();
        }
        LIVE.fetch_sub(1, Ordering::Relaxed);
        if self.callback.get_mut().is_some() && state == FiberState::Ready {
            fdebug!("fiber {} dropped before it ran", self.id);
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("root", &self.is_root())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_run_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = fiber.try_resume().unwrap_err();
        assert_eq!(
            err,
            Error::InvalidState { expected: FiberState::Ready, actual: FiberState::Term }
        );
    }

    #[test]
    fn test_yield_and_resume() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t = trace.clone();
        let fiber = Fiber::new(move || {
            t.lock().unwrap().push(1);
            Fiber::yield_now();
            t.lock().unwrap().push(3);
            Fiber::yield_now();
            t.lock().unwrap().push(5);
        })
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        trace.lock().unwrap().push(2);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        trace.lock().unwrap().push(4);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_panic_becomes_except() {
        let fiber = Fiber::new(|| panic!("boom")).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        assert!(fiber.try_resume().is_err());
    }

    #[test]
    fn test_current_inside_and_outside() {
        let root = Fiber::current();
        assert!(root.is_root());
        assert!(!Fiber::in_fiber());
        assert_eq!(Fiber::current().id(), root.id());

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(move || {
            assert!(Fiber::in_fiber());
            *s.lock().unwrap() = Some(Fiber::current_id());
        })
        .unwrap();
        fiber.resume();

        assert_eq!(*seen.lock().unwrap(), Some(fiber.id()));
        assert_eq!(Fiber::current_id(), root.id());
    }

    #[test]
    fn test_nested_resume_returns_to_resumer() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t_inner = trace.clone();
        let inner = Fiber::new(move || {
            t_inner.lock().unwrap().push("inner-1");
            Fiber::yield_now();
            t_inner.lock().unwrap().push("inner-2");
        })
        .unwrap();

        let t_outer = trace.clone();
        let inner_handle = inner.clone();
        let outer = Fiber::new(move || {
            inner_handle.resume();
            t_outer.lock().unwrap().push("outer");
            inner_handle.resume();
        })
        .unwrap();

        outer.resume();
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(inner.state(), FiberState::Term);
        assert_eq!(*trace.lock().unwrap(), vec!["inner-1", "outer", "inner-2"]);
    }

    #[test]
    fn test_reset_reuses_terminated_fiber() {
        let mut fiber = Fiber::new(|| {}).unwrap();
        let id = fiber.id();
        fiber.resume();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        Fiber::reset(&mut fiber, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.id(), id);

        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_rejects_ready_and_shared() {
        let mut fresh = Fiber::new(|| {}).unwrap();
        assert!(matches!(
            Fiber::reset(&mut fresh, || {}),
            Err(Error::InvalidState { actual: FiberState::Ready, .. })
        ));

        fresh.resume();
        let _other = fresh.clone();
        assert_eq!(Fiber::reset(&mut fresh, || {}), Err(Error::Busy));
    }

    #[test]
    fn test_total_count_grows() {
        let before = total_count();
        let _a = Fiber::new(|| {}).unwrap();
        let _b = Fiber::new(|| {}).unwrap();
        assert!(total_count() >= before + 2);
        assert!(live_count() >= 2);
    }
}
