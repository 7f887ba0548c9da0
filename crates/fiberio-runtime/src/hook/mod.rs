//! Blocking-call interception
//!
//! The functions in this module have libc signatures. When hooking is on for
//! the calling thread and the descriptor is a managed socket, a call that
//! would block instead registers interest with the current
//! [`IoManager`](crate::iomanager::IoManager), yields the fiber and retries
//! once the descriptor is ready. POSIX return values and `errno` are kept:
//! a timeout reports `ETIMEDOUT`, a descriptor closed underneath reports
//! `EBADF`.
//!
//! Worker threads of an `IoManager` turn hooking on automatically. With the
//! `interpose` feature the functions are exported under their libc names, so
//! any caller in the final binary (std included) is routed through them;
//! without it callers invoke them explicitly.
//!
//! A call that would wait but is not running on an IoManager fiber waits in
//! `poll(2)` instead, so the caller still sees blocking behavior.

mod fcntl;
mod io;
pub mod original;
mod sleep;
mod socket;

pub use fcntl::{fcntl, getsockopt, ioctl, setsockopt};
pub use io::{read, readv, recv, recvfrom, recvmsg, send, sendmsg, sendto, write, writev};
pub use sleep::{nanosleep, sleep, usleep};
pub use socket::{accept, close, connect, connect_with_timeout, socket};

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fiberio_core::constants::NO_TIMEOUT;
use fiberio_core::{Error, Result};
use nix::errno::Errno;

use crate::fd_manager::{FdCtx, FdManager, Timeout};
use crate::fiber::Fiber;
use crate::iomanager::{Event, IoManager};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether interception is active on this thread
#[inline(never)]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Turn interception on or off for this thread
#[inline(never)]
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.with(|c| c.set(flag));
}

/// Track `fd` so hooked calls treat it as a managed descriptor
///
/// Sockets are switched to kernel non-blocking mode. Descriptors created by
/// the hooked `socket`/`accept` are managed already.
pub fn manage(fd: RawFd) -> Option<Arc<FdCtx>> {
    FdManager::global().get(fd, true)
}

#[inline]
fn errno() -> i32 {
    Errno::last_raw()
}

#[inline]
fn set_errno(e: i32) {
    Errno::set_raw(e);
}

/// Report `err` POSIX-style
fn fail(err: &Error) -> isize {
    set_errno(err.errno());
    -1
}

/// Wait until `fd` is ready for `event` or `timeout_ms` passes
///
/// Suspends the fiber on an IoManager worker, otherwise blocks in poll(2).
fn wait_ready(fd: RawFd, event: Event, timeout_ms: u64) -> Result<()> {
    match IoManager::current() {
        Some(iom) if Fiber::in_fiber() => wait_in_fiber(&iom, fd, event, timeout_ms),
        _ => poll_ready(fd, event, timeout_ms),
    }
}

fn wait_in_fiber(iom: &IoManager, fd: RawFd, event: Event, timeout_ms: u64) -> Result<()> {
    let timed_out = Arc::new(AtomicBool::new(false));
    let cancelled = iom.register_wait(fd, event)?;

    let timer = (timeout_ms != NO_TIMEOUT).then(|| {
        let flag = Arc::downgrade(&timed_out);
        let cond = flag.clone();
        let iom2 = iom.clone();
        iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(flag) = flag.upgrade() else { return };
                flag.store(true, Ordering::Release);
                let _ = iom2.cancel_event(fd, event);
            },
            cond,
            false,
        )
    });

    Fiber::yield_now();

    if let Some(timer) = timer {
        timer.cancel();
    }
    if cancelled.load(Ordering::Acquire) {
        if timed_out.load(Ordering::Acquire) {
            return Err(Error::TimedOut);
        }
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn poll_ready(fd: RawFd, event: Event, timeout_ms: u64) -> Result<()> {
    let mut pfd = libc::pollfd { fd, events: event.poll_events(), revents: 0 };
    let timeout = if timeout_ms == NO_TIMEOUT { -1 } else { timeout_ms.min(i32::MAX as u64) as libc::c_int };
    loop {
        match unsafe { libc::poll(&mut pfd, 1, timeout) } {
            0 => return Err(Error::TimedOut),
            n if n > 0 => return Ok(()),
            _ if errno() == libc::EINTR => continue,
            _ => return Err(Error::last_os()),
        }
    }
}

/// Run a socket operation with fiber-blocking semantics
///
/// `op` is the raw non-blocking call. EINTR is retried at once; EAGAIN waits
/// for `event` under the descriptor's `kind` timeout and retries.
fn do_io<F>(fd: RawFd, event: Event, kind: Timeout, mut op: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enabled() {
        return op();
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout = ctx.timeout(kind);
    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        match wait_ready(fd, event, timeout) {
            Ok(()) => {}
            Err(Error::Cancelled) if ctx.is_closed() => {
                set_errno(libc::EBADF);
                return -1;
            }
            // Cancelled by someone else: try again
            Err(Error::Cancelled) => {}
            Err(e) => return fail(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        fds
    }

    fn set_rcvtimeo(fd: RawFd, ms: u64) -> i32 {
        let tv = libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        };
        unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        }
    }

    #[test]
    fn test_flag_is_per_thread() {
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        std::thread::spawn(|| assert!(!is_hook_enabled())).join().unwrap();
        set_hook_enabled(false);
    }

    #[test]
    fn test_hooked_read_times_out() {
        const TIMEOUT_MS: u64 = 100;
        let iom = IoManager::new(1, false, "hook-timeout").unwrap();
        let [a, b] = socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            assert!(is_hook_enabled());
            let ctx = manage(a).unwrap();
            assert_eq!(set_rcvtimeo(a, TIMEOUT_MS), 0);
            assert_eq!(ctx.timeout(Timeout::Recv), TIMEOUT_MS);

            let mut buf = [0u8; 16];
            let start = Instant::now();
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            let err = errno();
            tx.send((n, err, start.elapsed())).unwrap();
            unsafe { close(a) };
        });

        let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(elapsed + Duration::from_millis(2) >= Duration::from_millis(TIMEOUT_MS), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(TIMEOUT_MS + 500), "{:?}", elapsed);
        iom.stop().unwrap();
        unsafe { libc::close(b) };
    }

    #[test]
    fn test_unhooked_read_is_native() {
        let [a, b] = socketpair();
        assert!(!is_hook_enabled());
        // Kernel SO_RCVTIMEO on a blocking socket: native EAGAIN, not ETIMEDOUT
        assert_eq!(set_rcvtimeo(a, 50), 0);

        let mut buf = [0u8; 16];
        let start = Instant::now();
        let n = unsafe { read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EAGAIN);
        assert!(start.elapsed() >= Duration::from_millis(40));
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_hooked_read_waits_for_data() {
        let iom = IoManager::new(2, false, "hook-read").unwrap();
        let [a, b] = socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            manage(a);
            let mut buf = [0u8; 16];
            let n = unsafe { read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            tx.send(buf[..n.max(0) as usize].to_vec()).unwrap();
            unsafe { close(a) };
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(original::write(b, b"ping"), 4);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"ping");
        iom.stop().unwrap();
        unsafe { libc::close(b) };
    }

    #[test]
    fn test_poll_fallback_off_fiber() {
        let [a, b] = socketpair();
        manage(a);
        set_hook_enabled(true);

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            original::write(b, b"late")
        });
        let mut buf = [0u8; 8];
        let n = unsafe { read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"late");
        assert_eq!(writer.join().unwrap(), 4);

        unsafe { close(a) };
        set_hook_enabled(false);
        unsafe { libc::close(b) };
    }
}
