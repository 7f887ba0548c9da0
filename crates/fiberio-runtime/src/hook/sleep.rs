//! sleep, usleep, nanosleep

use std::time::Duration;

use libc::{c_int, c_uint, timespec};

use super::{is_hook_enabled, original::originals, set_errno};
use crate::timer;

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if is_hook_enabled() && timer::sleep_in_fiber(Duration::from_secs(seconds.into())) {
        return 0;
    }
    (originals().sleep)(seconds)
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn usleep(usec: c_uint) -> c_int {
    if is_hook_enabled() && timer::sleep_in_fiber(Duration::from_micros(usec.into())) {
        return 0;
    }
    (originals().usleep)(usec)
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !is_hook_enabled() || req.is_null() {
        return (originals().nanosleep)(req, rem);
    }
    let ts = &*req;
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        set_errno(libc::EINVAL);
        return -1;
    }
    let dur = Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32);
    if timer::sleep_in_fiber(dur) {
        if !rem.is_null() {
            *rem = timespec { tv_sec: 0, tv_nsec: 0 };
        }
        return 0;
    }
    (originals().nanosleep)(req, rem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iomanager::IoManager;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_hooked_usleep_yields_worker() {
        let iom = IoManager::new(1, false, "hook-sleep").unwrap();
        let (tx, rx) = mpsc::channel();

        let t = tx.clone();
        iom.spawn(move || {
            let start = Instant::now();
            assert_eq!(unsafe { usleep(80_000) }, 0);
            t.send(("sleeper", start.elapsed())).unwrap();
        });
        iom.spawn(move || tx.send(("other", Duration::ZERO)).unwrap());

        // The single worker ran the other task while the sleeper waited
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().0, "other");
        let (who, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(who, "sleeper");
        assert!(elapsed >= Duration::from_millis(75), "{:?}", elapsed);
        iom.stop().unwrap();
    }

    #[test]
    fn test_nanosleep_rejects_bad_nsec() {
        let iom = IoManager::new(1, false, "hook-nanosleep").unwrap();
        let (tx, rx) = mpsc::channel();
        iom.spawn(move || {
            let bad = timespec { tv_sec: 0, tv_nsec: 2_000_000_000 };
            let rc = unsafe { nanosleep(&bad, std::ptr::null_mut()) };
            tx.send((rc, nix::errno::Errno::last_raw())).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (-1, libc::EINVAL));
        iom.stop().unwrap();
    }

    #[test]
    fn test_unhooked_nanosleep_blocks_thread() {
        let req = timespec { tv_sec: 0, tv_nsec: 20_000_000 };
        let start = Instant::now();
        assert_eq!(unsafe { nanosleep(&req, std::ptr::null_mut()) }, 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
