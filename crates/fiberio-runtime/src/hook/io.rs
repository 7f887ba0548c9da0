//! read/write family

use std::os::unix::io::RawFd;

use libc::{c_int, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t};

use super::{do_io, original::originals};
use crate::fd_manager::Timeout;
use crate::iomanager::Event;

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn read(fd: RawFd, buf: *mut c_void, count: size_t) -> ssize_t {
    let f = originals().read;
    do_io(fd, Event::READ, Timeout::Recv, || f(fd, buf, count))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn readv(fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let f = originals().readv;
    do_io(fd, Event::READ, Timeout::Recv, || f(fd, iov, iovcnt))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn recv(fd: RawFd, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let f = originals().recv;
    do_io(fd, Event::READ, Timeout::Recv, || f(fd, buf, len, flags))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn recvfrom(
    fd: RawFd,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let f = originals().recvfrom;
    do_io(fd, Event::READ, Timeout::Recv, || f(fd, buf, len, flags, addr, addrlen))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn recvmsg(fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let f = originals().recvmsg;
    do_io(fd, Event::READ, Timeout::Recv, || f(fd, msg, flags))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn write(fd: RawFd, buf: *const c_void, count: size_t) -> ssize_t {
    let f = originals().write;
    do_io(fd, Event::WRITE, Timeout::Send, || f(fd, buf, count))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn writev(fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let f = originals().writev;
    do_io(fd, Event::WRITE, Timeout::Send, || f(fd, iov, iovcnt))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn send(fd: RawFd, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let f = originals().send;
    do_io(fd, Event::WRITE, Timeout::Send, || f(fd, buf, len, flags))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn sendto(
    fd: RawFd,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let f = originals().sendto;
    do_io(fd, Event::WRITE, Timeout::Send, || f(fd, buf, len, flags, addr, addrlen))
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn sendmsg(fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t {
    let f = originals().sendmsg;
    do_io(fd, Event::WRITE, Timeout::Send, || f(fd, msg, flags))
}
