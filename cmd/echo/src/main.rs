//! fiberio Echo Server
//!
//! Every connection gets its own fiber running plain blocking-style
//! accept/read/write. The hook layer turns each would-block into a fiber
//! suspension, so a few worker threads serve many connections.
//!
//! Usage:
//!     cargo build --release -p fiberio-echo
//!     ./target/release/echo [port] [max_conns] [workers]
//!
//! `max_conns` of 0 (the default) serves forever; otherwise the server
//! stops accepting after that many connections and exits once they close.
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use fiberio::{ferror, finfo, fwarn, hook, IoManager};
use std::net::TcpListener;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BUF_SIZE: usize = 4096;

#[derive(Default)]
struct Stats {
    accepted: AtomicUsize,
    active: AtomicUsize,
    bytes: AtomicUsize,
}

fn arg<T: std::str::FromStr>(n: usize, default: T) -> T {
    std::env::args().nth(n).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() -> fiberio::Result<()> {
    fiberio::init_logging();

    let port: u16 = arg(1, 9999);
    let max_conns: usize = arg(2, 0);
    let workers: usize = arg(3, 4);

    let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
        ferror!("bind :{} failed: {}", port, e);
        fiberio::Error::Os(e.raw_os_error().unwrap_or(libc::EINVAL))
    })?;
    let lfd = listener.into_raw_fd();
    // Kernel side goes non-blocking, callers still see blocking semantics
    hook::manage(lfd);

    let iom = IoManager::new(workers, false, "echo")?;
    let stats = Arc::new(Stats::default());

    println!("echo listening on :{} ({} workers)", port, workers);

    let acceptor = iom.clone();
    let s = stats.clone();
    iom.spawn(move || accept_loop(&acceptor, lfd, max_conns, &s));

    iom.stop()?;

    println!(
        "served {} connections, {} bytes echoed",
        stats.accepted.load(Ordering::Relaxed),
        stats.bytes.load(Ordering::Relaxed)
    );
    Ok(())
}

fn accept_loop(iom: &IoManager, lfd: RawFd, max_conns: usize, stats: &Arc<Stats>) {
    loop {
        let fd = unsafe { hook::accept(lfd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) || err.raw_os_error() == Some(libc::ECONNABORTED) {
                continue;
            }
            ferror!("accept: {}", err);
            break;
        }

        let n = stats.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        stats.active.fetch_add(1, Ordering::Relaxed);
        let s = stats.clone();
        iom.spawn(move || {
            serve(fd, &s);
            s.active.fetch_sub(1, Ordering::Relaxed);
        });

        if max_conns != 0 && n >= max_conns {
            finfo!("reached {} connections, no longer accepting", n);
            break;
        }
    }
    unsafe { hook::close(lfd) };
}

fn serve(fd: RawFd, stats: &Stats) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = unsafe { hook::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            if n < 0 {
                fwarn!("fd {}: read: {}", fd, std::io::Error::last_os_error());
            }
            break;
        }

        let mut off = 0;
        while off < n as usize {
            let w = unsafe { hook::write(fd, buf[off..].as_ptr().cast(), n as usize - off) };
            if w <= 0 {
                fwarn!("fd {}: write: {}", fd, std::io::Error::last_os_error());
                unsafe { hook::close(fd) };
                return;
            }
            off += w as usize;
        }
        stats.bytes.fetch_add(n as usize, Ordering::Relaxed);
    }
    unsafe { hook::close(fd) };
}
