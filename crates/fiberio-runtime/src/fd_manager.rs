//! Per-descriptor bookkeeping for the hook layer
//!
//! An [`FdCtx`] records whether a descriptor is a socket, the blocking mode
//! the application asked for versus the one the kernel actually has, and
//! the receive/send timeouts. Managed sockets are always kernel
//! non-blocking; the hook layer emulates blocking on top.
//!
//! The table only grows. `del` nulls a slot, it never shrinks the vector.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use fiberio_core::constants::NO_TIMEOUT;
use fiberio_core::{fdebug, fwarn};

use crate::config;
use crate::hook::original;

/// Which timeout of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// SO_RCVTIMEO
    Recv,
    /// SO_SNDTIMEO
    Send,
}

pub struct FdCtx {
    fd: RawFd,
    /// fstat succeeded
    init: bool,
    socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let init = unsafe { libc::fstat(fd, &mut st) } == 0;
        let socket = init && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if socket {
            let flags = original::fcntl(fd, libc::F_GETFL, 0);
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                if original::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    fwarn!("fd {}: cannot set O_NONBLOCK: {}", fd, nix::errno::Errno::last());
                } else {
                    sys_nonblock = true;
                }
            } else {
                sys_nonblock = flags >= 0;
            }
        }

        FdCtx {
            fd,
            init,
            socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.init
    }

    pub fn is_socket(&self) -> bool {
        self.socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Kernel-level O_NONBLOCK as set by us
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    /// Non-blocking mode the application asked for
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Timeout in ms, `NO_TIMEOUT` when unset
    pub fn timeout(&self, kind: Timeout) -> u64 {
        match kind {
            Timeout::Recv => self.recv_timeout.load(Ordering::Acquire),
            Timeout::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: Timeout, ms: u64) {
        match kind {
            Timeout::Recv => self.recv_timeout.store(ms, Ordering::Release),
            Timeout::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

impl fmt::Debug for FdCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdCtx")
            .field("fd", &self.fd)
            .field("socket", &self.socket)
            .field("sys_nonblock", &self.sys_nonblock())
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Process-wide table of [`FdCtx`], indexed by descriptor
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

impl FdManager {
    fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize(config::get().fd_table_initial, None);
        Self { slots: RwLock::new(slots) }
    }

    pub fn global() -> &'static FdManager {
        FD_MANAGER.get_or_init(FdManager::new)
    }

    /// Context for `fd`, created on demand when `auto_create` is set
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if idx >= slots.len() {
            let len = config::get().grown_len(slots.len(), idx + 1);
            slots.resize(len, None);
        }
        if let Some(ctx) = &slots[idx] {
            return Some(Arc::clone(ctx));
        }
        let ctx = Arc::new(FdCtx::new(fd));
        fdebug!("fd {} managed (socket={})", fd, ctx.is_socket());
        slots[idx] = Some(Arc::clone(&ctx));
        Some(ctx)
    }

    /// Forget `fd`
    pub fn del(&self, fd: RawFd) {
        let Ok(idx) = usize::try_from(fd) else { return };
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(idx) {
            *slot = None;
        }
    }

    /// Current table length
    pub fn capacity(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
