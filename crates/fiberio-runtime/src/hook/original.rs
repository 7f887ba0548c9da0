//! The un-hooked libc entry points
//!
//! Resolved once with `dlsym(RTLD_NEXT, ..)` so that, with the `interpose`
//! feature, they skip our own exported symbols. A symbol `dlsym` can't find
//! falls back to the libc binding.

use std::sync::OnceLock;

use libc::{c_char, c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec};

type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
type UsleepFn = unsafe extern "C" fn(c_uint) -> c_int;
type NanosleepFn = unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
type RecvfromFn =
    unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t;
type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
type WritevFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
type SendtoFn =
    unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
type IoctlFn = unsafe extern "C" fn(c_int, libc::Ioctl, ...) -> c_int;
type GetsockoptFn = unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
type SetsockoptFn = unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

pub struct Originals {
    pub sleep: SleepFn,
    pub usleep: UsleepFn,
    pub nanosleep: NanosleepFn,
    pub socket: SocketFn,
    pub connect: ConnectFn,
    pub accept: AcceptFn,
    pub close: CloseFn,
    pub read: ReadFn,
    pub readv: ReadvFn,
    pub recv: RecvFn,
    pub recvfrom: RecvfromFn,
    pub recvmsg: RecvmsgFn,
    pub write: WriteFn,
    pub writev: WritevFn,
    pub send: SendFn,
    pub sendto: SendtoFn,
    pub sendmsg: SendmsgFn,
    pub fcntl: FcntlFn,
    pub ioctl: IoctlFn,
    pub getsockopt: GetsockoptFn,
    pub setsockopt: SetsockoptFn,
}

macro_rules! resolve {
    ($name:ident : $ty:ty) => {{
        let sym = unsafe {
            libc::dlsym(libc::RTLD_NEXT, concat!(stringify!($name), "\0").as_ptr() as *const c_char)
        };
        if sym.is_null() {
            libc::$name as $ty
        } else {
            // Safety: dlsym returned the libc symbol of this exact name
            unsafe { std::mem::transmute::<*mut c_void, $ty>(sym) }
        }
    }};
}

impl Originals {
    fn resolve() -> Self {
        Self {
            sleep: resolve!(sleep: SleepFn),
            usleep: resolve!(usleep: UsleepFn),
            nanosleep: resolve!(nanosleep: NanosleepFn),
            socket: resolve!(socket: SocketFn),
            connect: resolve!(connect: ConnectFn),
            accept: resolve!(accept: AcceptFn),
            close: resolve!(close: CloseFn),
            read: resolve!(read: ReadFn),
            readv: resolve!(readv: ReadvFn),
            recv: resolve!(recv: RecvFn),
            recvfrom: resolve!(recvfrom: RecvfromFn),
            recvmsg: resolve!(recvmsg: RecvmsgFn),
            write: resolve!(write: WriteFn),
            writev: resolve!(writev: WritevFn),
            send: resolve!(send: SendFn),
            sendto: resolve!(sendto: SendtoFn),
            sendmsg: resolve!(sendmsg: SendmsgFn),
            fcntl: resolve!(fcntl: FcntlFn),
            ioctl: resolve!(ioctl: IoctlFn),
            getsockopt: resolve!(getsockopt: GetsockoptFn),
            setsockopt: resolve!(setsockopt: SetsockoptFn),
        }
    }
}

static ORIGINALS: OnceLock<Originals> = OnceLock::new();

/// Resolved original functions (resolved on first use)
#[inline]
pub fn originals() -> &'static Originals {
    ORIGINALS.get_or_init(Originals::resolve)
}

/// Un-hooked `close`
pub(crate) fn close(fd: c_int) -> c_int {
    unsafe { (originals().close)(fd) }
}

/// Un-hooked `read`
pub(crate) fn read(fd: c_int, buf: &mut [u8]) -> ssize_t {
    unsafe { (originals().read)(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) }
}

/// Un-hooked `write`
pub(crate) fn write(fd: c_int, buf: &[u8]) -> ssize_t {
    unsafe { (originals().write)(fd, buf.as_ptr() as *const c_void, buf.len()) }
}

/// Un-hooked `fcntl` for commands taking an int argument
pub(crate) fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    unsafe { (originals().fcntl)(fd, cmd, arg) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_originals_work() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"ok"), 2);
        let mut buf = [0u8; 4];
        assert_eq!(read(fds[0], &mut buf), 2);
        assert_eq!(&buf[..2], b"ok");
        assert!(fcntl(fds[0], libc::F_GETFL, 0) >= 0);
        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }
}
