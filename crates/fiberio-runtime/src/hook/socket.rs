//! socket, connect, accept, close

use std::os::unix::io::RawFd;

use fiberio_core::constants::NO_TIMEOUT;
use fiberio_core::Error;
use libc::{c_int, c_void, sockaddr, socklen_t};

use super::{do_io, errno, fail, is_hook_enabled, original::originals, set_errno, wait_ready};
use crate::config;
use crate::fd_manager::{FdManager, Timeout};
use crate::iomanager::{Event, IoManager};

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (originals().socket)(domain, ty, protocol);
    if fd >= 0 && is_hook_enabled() {
        FdManager::global().get(fd, true);
    }
    fd
}

/// `connect` that gives up after `timeout_ms` (`u64::MAX` waits forever)
pub unsafe extern "C" fn connect_with_timeout(
    fd: RawFd,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: u64,
) -> c_int {
    let connect = originals().connect;
    if !is_hook_enabled() {
        return connect(fd, addr, len);
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return connect(fd, addr, len);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return connect(fd, addr, len);
    }

    let rc = connect(fd, addr, len);
    if rc == 0 || errno() != libc::EINPROGRESS {
        return rc;
    }

    if let Err(e) = wait_ready(fd, Event::WRITE, timeout_ms) {
        let e = match e {
            Error::Cancelled if ctx.is_closed() => Error::Os(libc::EBADF),
            e => e,
        };
        return fail(&e) as c_int;
    }

    let mut err: c_int = 0;
    let mut err_len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = (originals().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut err_len,
    );
    if rc < 0 {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn connect(fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int {
    let timeout = match config::get().connect_timeout_ms {
        0 => NO_TIMEOUT,
        ms => ms,
    };
    connect_with_timeout(fd, addr, len, timeout)
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn accept(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let accept = originals().accept;
    let conn = do_io(fd, Event::READ, Timeout::Recv, || accept(fd, addr, len) as isize) as c_int;
    if conn >= 0 && is_hook_enabled() {
        FdManager::global().get(conn, true);
    }
    conn
}

/// Wakes anything waiting on `fd` and forgets it before the real close
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn close(fd: RawFd) -> c_int {
    if is_hook_enabled() {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            ctx.set_closed();
            if let Some(iom) = IoManager::current() {
                let _ = iom.cancel_all(fd);
            }
            FdManager::global().del(fd);
        }
    }
    (originals().close)(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{read, write};
    use std::sync::mpsc;
    use std::time::Duration;

    fn loopback_listener() -> (RawFd, libc::sockaddr_in) {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
            addr.sin_port = 0;
            let len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
            assert_eq!(libc::bind(fd, &addr as *const _ as *const sockaddr, len), 0);
            assert_eq!(libc::listen(fd, 16), 0);
            let mut bound_len = len;
            libc::getsockname(fd, &mut addr as *mut _ as *mut sockaddr, &mut bound_len);
            (fd, addr)
        }
    }

    #[test]
    fn test_accept_connect_roundtrip() {
        let iom = IoManager::new(2, false, "hook-sock").unwrap();
        let (lfd, addr) = loopback_listener();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || unsafe {
            FdManager::global().get(lfd, true);
            let conn = accept(lfd, std::ptr::null_mut(), std::ptr::null_mut());
            assert!(conn >= 0);
            assert!(FdManager::global().get(conn, false).unwrap().is_socket());
            let mut buf = [0u8; 8];
            let n = read(conn, buf.as_mut_ptr() as *mut c_void, buf.len());
            assert_eq!(write(conn, buf.as_ptr() as *const c_void, n as usize), n);
            close(conn);
            close(lfd);
        });

        iom.spawn(move || unsafe {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(FdManager::global().get(fd, false).is_some());
            let len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
            assert_eq!(connect(fd, &addr as *const _ as *const sockaddr, len), 0);
            assert_eq!(write(fd, b"echo".as_ptr() as *const c_void, 4), 4);
            let mut buf = [0u8; 8];
            let n = read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
            tx.send(buf[..n.max(0) as usize].to_vec()).unwrap();
            close(fd);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"echo");
        iom.stop().unwrap();
    }

    #[test]
    fn test_close_wakes_reader_with_ebadf() {
        let iom = IoManager::new(2, false, "hook-close").unwrap();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, 0);
        let [a, b] = fds;
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || unsafe {
            FdManager::global().get(a, true);
            let mut buf = [0u8; 8];
            let n = read(a, buf.as_mut_ptr() as *mut c_void, buf.len());
            tx.send((n, errno())).unwrap();
        });

        let start = std::time::Instant::now();
        while iom.interest(a) != Event::READ {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(1));
        }
        let iom2 = iom.clone();
        iom.spawn(move || unsafe {
            assert_eq!(iom2.interest(a), Event::READ);
            close(a);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (-1, libc::EBADF));
        iom.stop().unwrap();
        unsafe { libc::close(b) };
    }
}
