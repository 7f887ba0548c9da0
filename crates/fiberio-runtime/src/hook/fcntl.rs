//! fcntl, ioctl, getsockopt, setsockopt
//!
//! A managed socket is always O_NONBLOCK in the kernel. These calls keep
//! that hidden: the mode the application sets is recorded in its `FdCtx`
//! and reported back by F_GETFL, while the kernel flag stays on.
//!
//! `fcntl` and `ioctl` are variadic in C. They are defined here with one
//! trailing integer/pointer argument, which on the supported targets is
//! passed in the same register a variadic call uses.

use std::os::unix::io::RawFd;

use fiberio_core::constants::NO_TIMEOUT;
use libc::{c_int, c_ulong, c_void, socklen_t};

use super::{is_hook_enabled, original::originals};
use crate::fd_manager::{FdCtx, FdManager, Timeout};

fn managed_socket(fd: RawFd) -> Option<std::sync::Arc<FdCtx>> {
    FdManager::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn fcntl(fd: RawFd, cmd: c_int, arg: c_ulong) -> c_int {
    let f = originals().fcntl;
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if let Some(ctx) = managed_socket(fd) {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
            f(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = f(fd, cmd);
            if flags < 0 {
                return flags;
            }
            match managed_socket(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => f(fd, cmd, arg),
    }
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn ioctl(fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as libc::Ioctl && !arg.is_null() {
        if let Some(ctx) = managed_socket(fd) {
            ctx.set_user_nonblock(*(arg as *const c_int) != 0);
            return 0;
        }
    }
    (originals().ioctl)(fd, request, arg)
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn getsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    (originals().getsockopt)(fd, level, name, value, len)
}

/// SO_RCVTIMEO/SO_SNDTIMEO also set the hook-level timeouts of the fd
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn setsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            let tv = &*(value as *const libc::timeval);
            let ms = (tv.tv_sec as u64).saturating_mul(1000) + tv.tv_usec as u64 / 1000;
            // A zero timeval means no timeout
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if name == libc::SO_RCVTIMEO { Timeout::Recv } else { Timeout::Send };
            ctx.set_timeout(kind, ms);
        }
    }
    (originals().setsockopt)(fd, level, name, value, len)
}
