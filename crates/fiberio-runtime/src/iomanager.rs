//! epoll-driven scheduler
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle workers block in
//! `epoll_wait` instead of parking. It owns a [`TimerManager`] and a table of
//! per-fd channels. Each channel records the interest currently registered
//! with epoll and, per direction, the waiter to schedule when the direction
//! becomes ready: either a fiber or a callback.
//!
//! ```text
//!   add_event(fd, READ) ──► Channel[fd] { events: READ, read: waiter }
//!                                  │
//!   idle fiber: epoll_wait ────────┘──► schedule(waiter), clear READ
//! ```
//!
//! A direction has a waiter if and only if its bit is set in the channel's
//! interest mask. Interest is edge-triggered and one-shot: firing or
//! cancelling a direction removes it.
//!
//! Tickles go through an eventfd registered level-triggered with the same
//! epoll instance. Whoever wakes on it drains it; a worker leaving its idle
//! loop at shutdown tickles again so the next blocked worker notices.

use std::any::Any;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Deref, Not};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use fiberio_core::constants::NO_TIMEOUT;
use fiberio_core::{fdebug, ferror, ftrace};
use fiberio_core::{Error, Result};
use nix::errno::Errno;

use crate::config;
use crate::fiber::Fiber;
use crate::hook::original;
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{SystemClock, Timer, TimerManager};

/// Readiness direction(s)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    /// Keep only the READ/WRITE bits of an epoll event mask
    fn from_epoll(bits: u32) -> Event {
        Event(bits & (Self::READ.0 | Self::WRITE.0))
    }

    /// Same directions as poll(2) flags
    pub(crate) fn poll_events(self) -> libc::c_short {
        let mut ev = 0;
        if self.intersects(Self::READ) {
            ev |= libc::POLLIN;
        }
        if self.intersects(Self::WRITE) {
            ev |= libc::POLLOUT;
        }
        ev
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & (Self::READ.0 | Self::WRITE.0))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.intersects(Self::READ), self.intersects(Self::WRITE)) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (true, true) => write!(f, "READ|WRITE"),
        }
    }
}

/// Callback run when a registered direction fires
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// Who to wake for one direction
enum Waiter {
    Fiber {
        sched: Arc<Scheduler>,
        fiber: Arc<Fiber>,
        cancelled: Arc<AtomicBool>,
    },
    Callback {
        sched: Arc<Scheduler>,
        cb: EventCallback,
    },
}

impl Waiter {
    fn trigger(self, cancelled: bool) {
        match self {
            Waiter::Fiber { sched, fiber, cancelled: flag } => {
                if cancelled {
                    flag.store(true, Ordering::Release);
                }
                sched.schedule_fiber(fiber);
            }
            Waiter::Callback { sched, cb } => sched.schedule(Task::Call(cb)),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    events: Event,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl ChannelState {
    fn slot(&mut self, event: Event) -> &mut Option<Waiter> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

struct Channel {
    fd: RawFd,
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(fd: RawFd) -> Channel {
        Channel { fd, state: Mutex::new(ChannelState::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Scheduler driver blocking idle workers in `epoll_wait`
pub struct IoDriver {
    epfd: RawFd,
    tickle_fd: RawFd,
    channels: RwLock<Vec<Arc<Channel>>>,
    /// Registered directions not yet fired or cancelled
    pending: AtomicUsize,
    timers: TimerManager,
    batch: usize,
    max_timeout_ms: u64,
    /// `epoll_wait` returns, for spotting busy loops
    polls: AtomicUsize,
}

fn notify_eventfd(fd: RawFd) {
    let val: u64 = 1;
    let ret = original::write(fd, &val.to_ne_bytes());
    if ret < 0 {
        let errno = Errno::last_raw();
        // Counter saturated: a wakeup is already pending
        if errno != libc::EAGAIN {
            ferror!("tickle write on fd {} failed: {}", fd, Errno::from_raw(errno).desc());
        }
    }
}

impl IoDriver {
    fn new() -> Result<IoDriver> {
        let cfg = config::get();
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let e = Error::last_os();
            ferror!("epoll_create1 failed: {}", e);
            return Err(e);
        }
        let tickle_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if tickle_fd < 0 {
            let e = Error::last_os();
            ferror!("eventfd failed: {}", e);
            original::close(epfd);
            return Err(e);
        }

        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: tickle_fd as u64 };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fd, &mut ev) } < 0 {
            let e = Error::last_os();
            ferror!("registering tickle fd failed: {}", e);
            original::close(tickle_fd);
            original::close(epfd);
            return Err(e);
        }

        let channels = (0..cfg.channel_table_initial)
            .map(|fd| Arc::new(Channel::new(fd as RawFd)))
            .collect();

        Ok(IoDriver {
            epfd,
            tickle_fd,
            channels: RwLock::new(channels),
            pending: AtomicUsize::new(0),
            timers: TimerManager::with_clock(Arc::new(SystemClock), move || notify_eventfd(tickle_fd)),
            batch: cfg.poll_batch.max(1),
            max_timeout_ms: cfg.max_poll_timeout_ms,
            polls: AtomicUsize::new(0),
        })
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<Channel>> {
        let idx = usize::try_from(fd).ok()?;
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(idx).cloned()
    }

    /// Channel for `fd`, growing the table if needed
    fn channel(&self, fd: RawFd) -> Option<Arc<Channel>> {
        if let Some(chan) = self.lookup(fd) {
            return Some(chan);
        }
        let idx = usize::try_from(fd).ok()?;
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let len = channels.len();
        if idx >= len {
            let new_len = config::get().grown_len(len, idx + 1);
            channels.extend((len..new_len).map(|fd| Arc::new(Channel::new(fd as RawFd))));
        }
        channels.get(idx).cloned()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            let errno = Errno::last_raw();
            ferror!(
                "epoll_ctl({}, op {}, fd {}, {:?}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                Errno::from_raw(errno).desc()
            );
            return Err(Error::Os(errno));
        }
        Ok(())
    }

    /// Re-register `remaining` for a channel whose interest just shrank
    fn shrink(&self, fd: RawFd, remaining: Event) -> Result<()> {
        if remaining.is_empty() {
            self.ctl(libc::EPOLL_CTL_DEL, fd, Event::NONE)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, remaining)
        }
    }

    fn register(&self, fd: RawFd, event: Event, waiter: Waiter) -> Result<()> {
        if event != Event::READ && event != Event::WRITE {
            return Err(Error::Os(libc::EINVAL));
        }
        let Some(chan) = self.channel(fd) else {
            return Err(Error::Os(libc::EBADF));
        };

        let mut st = chan.lock();
        if st.events.intersects(event) {
            crate::fatal!("{}", Error::AlreadyRegistered { fd, event: event.bits() });
        }
        let op = if st.events.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        self.ctl(op, fd, st.events | event)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.events |= event;
        *st.slot(event) = Some(waiter);
        ftrace!("fd {} waiting for {:?}", fd, event);
        Ok(())
    }

    /// Remove one direction, firing its waiter when `fire` is set
    fn remove(&self, fd: RawFd, event: Event, fire: bool) -> Result<()> {
        let not_registered = || Error::NotRegistered { fd, event: event.bits() };
        let chan = self.lookup(fd).ok_or_else(not_registered)?;
        let mut st = chan.lock();
        if event.is_empty() || !st.events.intersects(event) {
            return Err(not_registered());
        }

        let remaining = st.events & !event;
        self.shrink(fd, remaining)?;
        st.events = remaining;
        if let Some(waiter) = st.slot(event).take() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            if fire {
                waiter.trigger(true);
            }
        }
        Ok(())
    }

    fn cancel_all(&self, fd: RawFd) -> Result<()> {
        let not_registered = || Error::NotRegistered { fd, event: 0 };
        let chan = self.lookup(fd).ok_or_else(not_registered)?;
        let mut st = chan.lock();
        if st.events.is_empty() {
            return Err(not_registered());
        }

        self.ctl(libc::EPOLL_CTL_DEL, fd, Event::NONE)?;
        for dir in [Event::READ, Event::WRITE] {
            if let Some(waiter) = st.slot(dir).take() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                waiter.trigger(true);
            }
        }
        st.events = Event::NONE;
        fdebug!("fd {} interest cancelled", fd);
        Ok(())
    }

    /// Fire the directions of `fd` reported ready by epoll
    fn dispatch(&self, fd: RawFd, revents: u32) {
        let Some(chan) = self.lookup(fd) else { return };
        let mut st = chan.lock();

        let mut ready = Event::from_epoll(revents);
        if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            // Wake every registered direction; the retry will see the error
            ready |= st.events;
        }
        let fired = ready & st.events;
        if fired.is_empty() {
            return;
        }

        let remaining = st.events & !fired;
        if self.shrink(chan.fd, remaining).is_err() {
            return;
        }
        st.events = remaining;
        for dir in [Event::READ, Event::WRITE] {
            if fired.intersects(dir) {
                if let Some(waiter) = st.slot(dir).take() {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    waiter.trigger(false);
                }
            }
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 8];
        while original::read(self.tickle_fd, &mut buf) > 0 {}
    }

    fn interest(&self, fd: RawFd) -> Event {
        self.lookup(fd).map(|chan| chan.lock().events).unwrap_or_default()
    }
}

impl Driver for IoDriver {
    fn tickle(&self, _sched: &Scheduler) {
        notify_eventfd(self.tickle_fd);
    }

    fn idle(&self, sched: &Arc<Scheduler>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.batch];

        while !sched.stopping() {
            let timeout = self.timers.next_timeout().min(self.max_timeout_ms);
            let timeout = if timeout == NO_TIMEOUT { -1 } else { timeout as libc::c_int };

            let n = loop {
                let n = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout)
                };
                if n >= 0 {
                    self.polls.fetch_add(1, Ordering::Relaxed);
                    break n as usize;
                }
                let errno = Errno::last_raw();
                if errno != libc::EINTR {
                    ferror!("epoll_wait({}) failed: {}", self.epfd, Errno::from_raw(errno).desc());
                    break 0;
                }
            };

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                sched.schedule_batch(expired.into_iter().map(|cb| Task::call(move || cb())));
            }

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                let revents = ev.events;
                if fd == self.tickle_fd {
                    self.drain_tickle();
                    continue;
                }
                self.dispatch(fd, revents);
            }

            Fiber::yield_now();
        }
        // Pass the stop on to a worker still blocked in epoll_wait
        notify_eventfd(self.tickle_fd);
        fdebug!("idle loop exits");
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping() && !self.timers.has_timer() && self.pending.load(Ordering::SeqCst) == 0
    }

    fn enable_hook(&self) -> bool {
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        original::close(self.tickle_fd);
        original::close(self.epfd);
    }
}

/// Scheduler plus epoll readiness and timers
#[derive(Clone)]
pub struct IoManager {
    sched: Arc<Scheduler>,
    driver: Arc<IoDriver>,
}

impl IoManager {
    /// Create and start an IoManager
    ///
    /// `threads` counts the caller when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<IoManager> {
        let driver = Arc::new(IoDriver::new()?);
        let sched = Scheduler::with_driver(threads, use_caller, name, driver.clone())?;
        sched.start()?;
        Ok(IoManager { sched, driver })
    }

    /// IoManager the calling thread works for
    pub fn current() -> Option<IoManager> {
        let sched = Scheduler::current()?;
        let driver = Arc::clone(sched.driver()).into_any().downcast::<IoDriver>().ok()?;
        Some(IoManager { sched, driver })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn timers(&self) -> &TimerManager {
        &self.driver.timers
    }

    /// Drain queued work, pending events and timers, then join the workers
    pub fn stop(&self) -> Result<()> {
        self.sched.stop()
    }

    /// Scheduler a waiter registered from this thread is resumed on
    fn waiter_sched(&self) -> Arc<Scheduler> {
        Scheduler::current().unwrap_or_else(|| Arc::clone(&self.sched))
    }

    /// Register interest in one direction of `fd`
    ///
    /// With `cb` the callback is scheduled when the direction fires;
    /// without, the calling fiber is, and it must then yield. Registering a
    /// direction twice is a fatal error.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<EventCallback>) -> Result<()> {
        match cb {
            Some(cb) => self.driver.register(fd, event, Waiter::Callback { sched: self.waiter_sched(), cb }),
            None => self.register_wait(fd, event).map(|_| ()),
        }
    }

    /// Register the current fiber; returns the flag set on cancellation
    pub(crate) fn register_wait(&self, fd: RawFd, event: Event) -> Result<Arc<AtomicBool>> {
        if !Fiber::in_fiber() {
            return Err(Error::NotInFiber);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let waiter = Waiter::Fiber {
            sched: self.waiter_sched(),
            fiber: Fiber::current(),
            cancelled: Arc::clone(&cancelled),
        };
        self.driver.register(fd, event, waiter)?;
        Ok(cancelled)
    }

    /// Suspend the current fiber until `event` fires on `fd`
    ///
    /// Returns `Err(Error::Cancelled)` when the interest was cancelled
    /// instead.
    pub fn wait_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let cancelled = self.register_wait(fd, event)?;
        Fiber::yield_now();
        if cancelled.load(Ordering::Acquire) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drop interest without waking the waiter
    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.driver.remove(fd, event, false)
    }

    /// Drop interest and wake the waiter as cancelled
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.driver.remove(fd, event, true)
    }

    /// Cancel both directions of `fd`
    pub fn cancel_all(&self, fd: RawFd) -> Result<()> {
        self.driver.cancel_all(fd)
    }

    /// Directions currently registered for `fd`
    pub fn interest(&self, fd: RawFd) -> Event {
        self.driver.interest(fd)
    }

    pub fn pending_events(&self) -> usize {
        self.driver.pending.load(Ordering::SeqCst)
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.driver.timers.add_timer(ms, cb)
    }

    pub fn add_rec_timer<F>(&self, ms: u64, cb: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.driver.timers.add_rec_timer(ms, cb)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + ?Sized + 'static,
    {
        self.driver.timers.add_condition_timer(ms, cb, cond, recurring)
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched)
            .field("pending_events", &self.pending_events())
            .field("timers", &self.driver.timers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        fds
    }

    fn close_pair(fds: [RawFd; 2]) {
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_event_bits() {
        assert!(Event::NONE.is_empty());
        assert_eq!((Event::READ | Event::WRITE) & !Event::WRITE, Event::READ);
        assert_eq!(!Event::READ, Event::WRITE);
        assert_eq!(format!("{:?}", Event::READ | Event::WRITE), "READ|WRITE");
    }

    #[test]
    fn test_wait_event_wakes_on_readiness() {
        let iom = IoManager::new(2, false, "iom-read").unwrap();
        let [a, b] = socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            let iom = IoManager::current().unwrap();
            let r = iom.wait_event(a, Event::READ);
            let mut buf = [0u8; 8];
            let n = original::read(a, &mut buf);
            tx.send((r, n)).unwrap();
        });

        wait_until("registration", || iom.interest(a) == Event::READ);
        assert_eq!(original::write(b, b"hi"), 2);

        let (r, n) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r, Ok(()));
        assert_eq!(n, 2);
        assert_eq!(iom.interest(a), Event::NONE);
        iom.stop().unwrap();
        close_pair([a, b]);
    }

    #[test]
    fn test_cancel_all_wakes_both_directions() {
        let iom = IoManager::new(2, false, "iom-cancel").unwrap();
        let [a, b] = socketpair();
        // Fill the send buffer so WRITE is not ready
        let chunk = [0u8; 4096];
        while original::write(a, &chunk) > 0 {}

        let (tx, rx) = mpsc::channel();
        for ev in [Event::READ, Event::WRITE] {
            let tx = tx.clone();
            iom.spawn(move || {
                let r = IoManager::current().unwrap().wait_event(a, ev);
                tx.send((ev, r)).unwrap();
            });
        }

        wait_until("both registrations", || iom.interest(a) == Event::READ | Event::WRITE);
        assert_eq!(iom.pending_events(), 2);
        iom.cancel_all(a).unwrap();
        assert_eq!(iom.interest(a), Event::NONE);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (ev, r) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(r, Err(Error::Cancelled));
            seen.push(ev);
        }
        assert!(seen.contains(&Event::READ) && seen.contains(&Event::WRITE));
        assert_eq!(iom.pending_events(), 0);
        assert!(matches!(iom.cancel_all(a), Err(Error::NotRegistered { .. })));
        iom.stop().unwrap();
        close_pair([a, b]);
    }

    #[test]
    fn test_callback_event_and_del() {
        let iom = IoManager::new(1, false, "iom-cb").unwrap();
        let [a, b] = socketpair();
        let (tx, rx) = mpsc::channel();

        iom.add_event(a, Event::READ, Some(Box::new(move || tx.send(()).unwrap()))).unwrap();
        assert_eq!(iom.interest(a), Event::READ);
        assert_eq!(original::write(b, b"x"), 1);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Deleted interest never fires
        let (tx2, rx2) = mpsc::channel::<()>();
        iom.add_event(b, Event::READ, Some(Box::new(move || tx2.send(()).unwrap()))).unwrap();
        iom.del_event(b, Event::READ).unwrap();
        assert_eq!(iom.interest(b), Event::NONE);
        assert!(matches!(iom.del_event(b, Event::READ), Err(Error::NotRegistered { .. })));
        assert_eq!(original::write(a, b"y"), 1);
        assert!(rx2.recv_timeout(Duration::from_millis(50)).is_err());

        assert_eq!(iom.add_event(a, Event::READ, None), Err(Error::NotInFiber));
        iom.stop().unwrap();
        close_pair([a, b]);
    }

    #[test]
    fn test_timer_wakes_idle_loop() {
        let iom = IoManager::new(1, false, "iom-timer").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let start = Instant::now();
        iom.add_timer(30, move || tx.lock().unwrap().send(Instant::now()).unwrap());

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let elapsed = fired - start;
        assert!(elapsed >= Duration::from_millis(28), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
        iom.stop().unwrap();
    }

    #[test]
    fn test_fiber_sleep_does_not_block_worker() {
        let iom = IoManager::new(1, false, "iom-sleep").unwrap();
        let (tx, rx) = mpsc::channel();

        let slow = tx.clone();
        iom.spawn(move || {
            crate::timer::sleep(Duration::from_millis(100));
            slow.send("slow").unwrap();
        });
        iom.spawn(move || tx.send("fast").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slow");
        iom.stop().unwrap();
    }

    #[test]
    fn test_stop_waits_for_pending_timer_without_spinning() {
        let iom = IoManager::new(2, false, "iom-stop-timer").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let start = Instant::now();
        iom.add_timer(300, move || f.store(true, Ordering::SeqCst));

        let polls_before = iom.driver.polls.load(Ordering::Relaxed);
        iom.stop().unwrap();
        let elapsed = start.elapsed();
        let polls = iom.driver.polls.load(Ordering::Relaxed) - polls_before;

        assert!(fired.load(Ordering::SeqCst), "stop returned before the timer fired");
        assert!(elapsed >= Duration::from_millis(290), "{:?}", elapsed);
        // A handful of wakeups per worker, not a busy loop
        assert!(polls < 50, "{} epoll_wait returns during stop", polls);
        assert!(!iom.timers().has_timer());
    }

    #[test]
    fn test_stop_waits_for_registered_event() {
        let iom = IoManager::new(2, false, "iom-stop-event").unwrap();
        let [a, b] = socketpair();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        iom.add_event(a, Event::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();
        assert_eq!(iom.pending_events(), 1);

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            original::write(b, b"z")
        });
        let start = Instant::now();
        let polls_before = iom.driver.polls.load(Ordering::Relaxed);
        iom.stop().unwrap();
        let polls = iom.driver.polls.load(Ordering::Relaxed) - polls_before;

        assert!(fired.load(Ordering::SeqCst), "stop returned with an event outstanding");
        assert!(start.elapsed() >= Duration::from_millis(100), "{:?}", start.elapsed());
        assert!(polls < 50, "{} epoll_wait returns during stop", polls);
        assert_eq!(iom.pending_events(), 0);
        assert_eq!(writer.join().unwrap(), 1);
        close_pair([a, b]);
    }

    #[test]
    fn test_current_on_plain_scheduler_is_none() {
        let sched = Scheduler::new(1, false, "plain").unwrap();
        let (tx, rx) = mpsc::channel();
        sched.start().unwrap();
        sched.spawn(move || tx.send(IoManager::current().is_none()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        sched.stop().unwrap();
        assert!(IoManager::current().is_none());
    }
}
