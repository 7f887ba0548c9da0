//! M:N task scheduler
//!
//! A `Scheduler` owns a FIFO queue of [`Task`]s and a pool of OS threads
//! that pop and run them. A task is either a fiber to resume or a plain
//! callable; callables are run inside a per-worker callback fiber so they
//! may suspend like any other fiber.
//!
//! # Wakeups
//!
//! Appending to an empty queue issues exactly one tickle; appending to a
//! non-empty queue issues none. How a tickle reaches an idle worker is up to
//! the [`Driver`]: the default parks idle workers on a futex, the
//! [`IoManager`](crate::iomanager::IoManager) driver writes to an eventfd
//! watched by epoll.
//!
//! # Use-caller mode
//!
//! With `use_caller` the constructing thread counts as worker 0. It runs
//! queued work only when it calls [`Scheduler::stop`], which drives the loop
//! inline until the scheduler drains.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use fiberio_core::{fdebug, ferror, finfo};
use fiberio_core::{Error, FiberState, Result, WorkerError};

use crate::config;
use crate::fiber::{Callback, Fiber};
use crate::hook;
use crate::parking::{new_parking, WorkerParking};
use crate::tls;

/// Unit of work: a fiber handle or a callable, never both
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

impl Task {
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => write!(f, "Task::Fiber({})", fiber.id()),
            Task::Call(_) => write!(f, "Task::Call"),
        }
    }
}

struct Entry {
    task: Task,
    /// Only this worker may run the task
    worker: Option<usize>,
}

/// How idle workers wait and how they are woken
///
/// `idle` runs inside each worker's idle fiber. It should block until work
/// may be available, then `Fiber::yield_now()` back to the loop, and return
/// once `sched.stopping()` holds; the worker exits when its idle fiber
/// terminates.
pub trait Driver: Send + Sync + 'static {
    /// Rouse an idle worker
    fn tickle(&self, sched: &Scheduler);

    /// Body of every worker's idle fiber
    fn idle(&self, sched: &Arc<Scheduler>);

    /// Whether workers may exit
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }

    /// Turn the hook layer on for worker threads
    fn enable_hook(&self) -> bool {
        false
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Default driver: idle workers park on a futex
pub struct ParkingDriver {
    parking: Box<dyn WorkerParking>,
    timeout: Duration,
}

impl ParkingDriver {
    pub fn new() -> Self {
        Self {
            parking: new_parking(),
            timeout: config::get().park_timeout_duration(),
        }
    }
}

impl Default for ParkingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ParkingDriver {
    fn tickle(&self, _sched: &Scheduler) {
        self.parking.wake_one();
    }

    fn idle(&self, sched: &Arc<Scheduler>) {
        while !sched.stopping() {
            self.parking.park(Some(self.timeout));
            Fiber::yield_now();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct Scheduler {
    name: String,
    driver: Arc<dyn Driver>,
    queue: Mutex<VecDeque<Entry>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Threads to spawn (excludes the caller in use-caller mode)
    spawn_count: usize,
    use_caller: bool,
    caller_thread: Option<ThreadId>,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Scheduler with the default parking driver
    ///
    /// `threads` counts the caller when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Scheduler>> {
        Self::with_driver(threads, use_caller, name, Arc::new(ParkingDriver::new()))
    }

    pub fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Arc<dyn Driver>,
    ) -> Result<Arc<Scheduler>> {
        if threads == 0 {
            return Err(Error::Config("scheduler needs at least one thread"));
        }
        if use_caller && tls::scheduler().is_some() {
            crate::fatal!("thread already hosts a scheduler; cannot create {} with use_caller", name);
        }

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            driver,
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            spawn_count: if use_caller { threads - 1 } else { threads },
            use_caller,
            caller_thread: use_caller.then(|| thread::current().id()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        if use_caller {
            tls::set_scheduler(Some(Arc::downgrade(&sched)));
            tls::set_worker_id(0);
        }
        fdebug!("scheduler {} created ({} threads, use_caller={})", name, threads, use_caller);
        Ok(sched)
    }

    /// Scheduler the calling thread works for
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    /// Worker index of the calling thread
    pub fn worker_id() -> Option<usize> {
        tls::worker_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Total workers, caller included
    pub fn thread_count(&self) -> usize {
        self.spawn_count + usize::from(self.use_caller)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// `stop` has been called (work may still be draining)
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue().len()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Entry>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, entry: Entry, front: bool) {
        let was_empty = {
            let mut queue = self.queue();
            let was_empty = queue.is_empty();
            if front {
                queue.push_front(entry);
            } else {
                queue.push_back(entry);
            }
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Append a task
    pub fn schedule(&self, task: Task) {
        self.push(Entry { task, worker: None }, false);
    }

    /// Append a fiber
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule(Task::Fiber(fiber));
    }

    /// Append a callable
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f));
    }

    /// Prepend a task so it runs before everything already queued
    pub fn schedule_first(&self, task: Task) {
        self.push(Entry { task, worker: None }, true);
    }

    /// Append a task only worker `worker` may run
    pub fn schedule_on(&self, worker: usize, task: Task) {
        self.push(Entry { task, worker: Some(worker) }, false);
    }

    /// Append many tasks under one lock acquisition, tickling at most once
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let tickle = {
            let mut queue = self.queue();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(|task| Entry { task, worker: None }));
            was_empty && queue.len() > before
        };
        if tickle {
            self.tickle();
        }
    }

    /// Yield the current fiber and put it back at the tail of the queue
    ///
    /// Off a scheduler fiber this only yields the OS thread.
    pub fn yield_now() {
        if !Fiber::in_fiber() || tls::scheduler().is_none() {
            thread::yield_now();
            return;
        }
        Fiber::current().mark_requeue();
        Fiber::yield_now();
    }

    #[inline]
    pub fn tickle(&self) {
        self.driver.tickle(self);
    }

    /// Stop flag set, queue drained and no worker mid-task
    pub fn base_stopping(&self) -> bool {
        if !self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        let queue = self.queue();
        queue.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    /// Whether workers may exit, as judged by the driver
    pub fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    /// Spawn the worker threads
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for i in 0..self.spawn_count {
            let id = if self.use_caller { i + 1 } else { i };
            let sched = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || sched.run(id))
                .map_err(|e| {
                    ferror!("{}: failed to spawn worker {}: {}", self.name, id, e);
                    Error::Worker(WorkerError::SpawnFailed)
                })?;
            workers.push(handle);
        }
        finfo!("scheduler {} started with {} threads", self.name, self.thread_count());
        Ok(())
    }

    /// Drain the queue and join every worker
    ///
    /// In use-caller mode this must be called from the constructing thread,
    /// which then runs the scheduling loop until the scheduler drains.
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        let me = thread::current().id();
        if self.use_caller && self.caller_thread != Some(me) {
            return Err(Error::Worker(WorkerError::WrongThread));
        }
        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            if workers.iter().any(|h| h.thread().id() == me) {
                return Err(Error::Worker(WorkerError::WrongThread));
            }
            std::mem::take(&mut *workers)
        };

        fdebug!("scheduler {} stopping", self.name);
        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count() {
            self.tickle();
        }

        if self.use_caller {
            self.run(0);
            tls::set_scheduler(None);
            tls::set_worker_id(usize::MAX);
        }

        let mut result = Ok(());
        for handle in handles {
            if handle.join().is_err() {
                result = Err(Error::Worker(WorkerError::Panicked));
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        finfo!("scheduler {} stopped", self.name);
        result
    }

    /// Pop the first task this worker may run
    fn pick(&self, worker: usize) -> (Option<Task>, bool) {
        let mut queue = self.queue();
        let mut tickle_others = false;
        let mut found = None;

        for (i, entry) in queue.iter().enumerate() {
            if entry.worker.is_some_and(|w| w != worker) {
                tickle_others = true;
                continue;
            }
            // Still switching out on another thread
            if let Task::Fiber(fiber) = &entry.task {
                if fiber.state() == FiberState::Exec {
                    tickle_others = true;
                    continue;
                }
            }
            found = Some(i);
            break;
        }

        let task = found.and_then(|i| queue.remove(i)).map(|entry| entry.task);
        if task.is_some() {
            self.active.fetch_add(1, Ordering::SeqCst);
            tickle_others |= !queue.is_empty();
        }
        (task, tickle_others)
    }

    /// Worker loop
    fn run(self: &Arc<Self>, worker: usize) {
        tls::set_scheduler(Some(Arc::downgrade(self)));
        tls::set_worker_id(worker);
        let hooked = self.driver.enable_hook();
        let prev_hook = hook::is_hook_enabled();
        if hooked {
            hook::set_hook_enabled(true);
        }
        fdebug!("{} worker {} running", self.name, worker);

        let driver = Arc::clone(&self.driver);
        let sched = Arc::clone(self);
        let idle = match Fiber::new(move || driver.idle(&sched)) {
            Ok(fiber) => fiber,
            Err(e) => {
                ferror!("{} worker {}: cannot create idle fiber: {}", self.name, worker, e);
                return;
            }
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (task, tickle) = self.pick(worker);
            if tickle {
                self.tickle();
            }

            match task {
                Some(Task::Fiber(fiber)) => self.run_fiber(fiber),
                Some(Task::Call(cb)) => cb_fiber = self.run_call(cb, cb_fiber.take()),
                None => {
                    if idle.state().is_terminated() {
                        fdebug!("{} worker {} idle fiber finished", self.name, worker);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        if hooked {
            hook::set_hook_enabled(prev_hook);
        }
    }

    fn run_fiber(&self, fiber: Arc<Fiber>) {
        match fiber.state() {
            FiberState::Ready => {
                if let Err(e) = fiber.try_resume() {
                    // Lost a race with a fiber still switching out
                    fdebug!("{}: requeue fiber {}: {}", self.name, fiber.id(), e);
                    self.schedule_fiber(Arc::clone(&fiber));
                }
            }
            state => fdebug!("{}: skipping fiber {} in state {}", self.name, fiber.id(), state),
        }

        if fiber.take_requeue() {
            self.schedule_fiber(fiber);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run a callable in the worker's callback fiber
    ///
    /// The previous callback fiber is reused only when it has terminated and
    /// nothing else holds it; otherwise a fresh fiber is created.
    fn run_call(&self, cb: Callback, reuse: Option<Arc<Fiber>>) -> Option<Arc<Fiber>> {
        let fiber = match reuse {
            Some(mut fiber) => match Fiber::rebind(&mut fiber, cb) {
                Ok(()) => Ok(fiber),
                Err((_, cb)) => Fiber::new(cb),
            },
            None => Fiber::new(cb),
        };
        let fiber = match fiber {
            Ok(fiber) => fiber,
            Err(e) => {
                ferror!("{}: cannot create fiber for task: {}", self.name, e);
                self.active.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
        };

        fiber.resume();

        let keep = if fiber.take_requeue() {
            self.schedule_fiber(fiber);
            None
        } else if fiber.state().is_terminated() {
            Some(fiber)
        } else {
            // Parked; whoever wakes it holds its own handle
            None
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        keep
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst) {
            crate::fatal!("scheduler {} dropped while running", self.name);
        }
        fdebug!("scheduler {} dropped", self.name);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count())
            .field("use_caller", &self.use_caller)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingDriver {
        tickles: AtomicUsize,
    }

    impl Driver for CountingDriver {
        fn tickle(&self, _sched: &Scheduler) {
            self.tickles.fetch_add(1, Ordering::SeqCst);
        }

        fn idle(&self, sched: &Arc<Scheduler>) {
            while !sched.stopping() {
                Fiber::yield_now();
            }
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn test_tickle_only_on_empty_queue() {
        let driver = Arc::new(CountingDriver::default());
        let sched = Scheduler::with_driver(1, false, "tickle", driver.clone()).unwrap();

        sched.spawn(|| {});
        assert_eq!(driver.tickles.load(Ordering::SeqCst), 1);
        sched.spawn(|| {});
        sched.schedule_first(Task::call(|| {}));
        assert_eq!(driver.tickles.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending_tasks(), 3);
    }

    #[test]
    fn test_batch_tickles_at_most_once() {
        let driver = Arc::new(CountingDriver::default());
        let sched = Scheduler::with_driver(1, false, "batch", driver.clone()).unwrap();

        sched.schedule_batch(Vec::new());
        assert_eq!(driver.tickles.load(Ordering::SeqCst), 0);
        sched.schedule_batch((0..5).map(|_| Task::call(|| {})));
        assert_eq!(driver.tickles.load(Ordering::SeqCst), 1);
        sched.schedule_batch((0..5).map(|_| Task::call(|| {})));
        assert_eq!(driver.tickles.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending_tasks(), 10);
    }

    #[test]
    fn test_two_workers_run_each_task_once() {
        let sched = Scheduler::new(2, false, "abc").unwrap();
        let counts: Arc<Vec<AtomicU32>> = Arc::new((0..3).map(|_| AtomicU32::new(0)).collect());
        let running: Arc<Vec<AtomicU32>> = Arc::new((0..3).map(|_| AtomicU32::new(0)).collect());

        sched.start().unwrap();
        for i in 0..3 {
            let counts = counts.clone();
            let running = running.clone();
            sched.spawn(move || {
                assert_eq!(running[i].fetch_add(1, Ordering::SeqCst), 0, "re-entered");
                std::thread::sleep(Duration::from_millis(5));
                counts[i].fetch_add(1, Ordering::SeqCst);
                running[i].fetch_sub(1, Ordering::SeqCst);
            });
        }
        sched.stop().unwrap();

        for c in counts.iter() {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
        assert_eq!(sched.pending_tasks(), 0);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_use_caller_runs_on_stop() {
        let hits = Arc::new(AtomicU32::new(0));
        let caller = thread::current().id();
        let on_caller = Arc::new(AtomicBool::new(false));

        let sched = Scheduler::new(1, true, "caller").unwrap();
        sched.start().unwrap();
        for _ in 0..4 {
            let hits = hits.clone();
            let on_caller = on_caller.clone();
            sched.spawn(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                if thread::current().id() == caller {
                    on_caller.store(true, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        sched.stop().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(on_caller.load(Ordering::SeqCst));
        assert!(Scheduler::current().is_none());
        assert_eq!(Scheduler::worker_id(), None);
    }

    #[test]
    fn test_use_caller_thread_can_host_again() {
        let first = Scheduler::new(1, true, "caller-a").unwrap();
        assert_eq!(Scheduler::current().map(|s| s.name().to_string()), Some("caller-a".into()));
        first.start().unwrap();
        first.stop().unwrap();
        assert!(Scheduler::current().is_none());

        // `first` is still alive; the thread is free for another one
        let second = Scheduler::new(1, true, "caller-b").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        second.start().unwrap();
        second.spawn(move || {
            assert_eq!(Scheduler::current().map(|s| s.name().to_string()), Some("caller-b".into()));
            r.store(true, Ordering::SeqCst);
        });
        second.stop().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(Scheduler::current().is_none());
        drop(first);
    }

    #[test]
    fn test_pinned_tasks_run_on_their_worker() {
        let sched = Scheduler::new(3, false, "pin").unwrap();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        sched.start().unwrap();
        for _ in 0..8 {
            let seen = seen.clone();
            sched.schedule_on(1, Task::call(move || {
                seen.lock().unwrap().insert(Scheduler::worker_id());
            }));
        }
        sched.stop().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&Some(1)));
    }

    #[test]
    fn test_requeueing_yield_and_external_wake() {
        let sched = Scheduler::new(2, false, "yield").unwrap();
        let slot: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
        let steps = Arc::new(AtomicU32::new(0));

        let s = steps.clone();
        let parked = slot.clone();
        let fiber = Fiber::new(move || {
            for _ in 0..3 {
                Scheduler::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            }
            // Park until the waker task reschedules us
            *parked.lock().unwrap() = Some(Fiber::current());
            Fiber::yield_now();
            s.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();

        sched.start().unwrap();
        sched.schedule_fiber(fiber);

        let waker = Arc::clone(&sched);
        let wake_slot = slot.clone();
        sched.spawn(move || loop {
            if let Some(f) = wake_slot.lock().unwrap().take() {
                waker.schedule_fiber(f);
                break;
            }
            Scheduler::yield_now();
        });
        sched.stop().unwrap();

        assert_eq!(steps.load(Ordering::SeqCst), 13);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new(1, false, "panic").unwrap();
        let after = Arc::new(AtomicBool::new(false));
        sched.start().unwrap();
        sched.spawn(|| panic!("expected test panic"));
        let a = after.clone();
        sched.spawn(move || a.store(true, Ordering::SeqCst));
        sched.stop().unwrap();
        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_lifecycle_errors() {
        assert!(Scheduler::new(0, false, "zero").is_err());
        let sched = Scheduler::new(1, false, "twice").unwrap();
        sched.start().unwrap();
        assert_eq!(sched.start(), Err(Error::AlreadyStarted));
        sched.stop().unwrap();
        assert_eq!(sched.start(), Err(Error::Stopped));
    }
}
