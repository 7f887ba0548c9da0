//! Basic fiberio example
//!
//! Runs a handful of fibers on a multi-worker scheduler, shares a counter
//! through a `FiberMutex`, and lets an `IoManager` timer and a fiber sleep
//! drive the rest.
//!
//! # Environment Variables
//!
//! - `FIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `FIO_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `FIO_STACK_SIZE=262144` - Fiber stack size in bytes

use fiberio::{fdebug, finfo, FiberMutex, FiberSemaphore, IoManager, RuntimeConfig, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// FIO_LOG_LEVEL=debug cargo run -p fiberio-basic
fn main() -> fiberio::Result<()> {
    println!("=== fiberio Basic Example ===\n");

    fiberio::init_logging();
    fiberio::config::init(RuntimeConfig::from_env().debug_logging(true))?;

    // Plain scheduler: four workers, the main thread only submits
    let sched = Scheduler::new(4, false, "basic")?;
    let counter = Arc::new(FiberMutex::new(0usize));
    let completed = Arc::new(AtomicUsize::new(0));

    sched.start()?;
    for i in 1..=8 {
        let counter = counter.clone();
        let completed = completed.clone();
        sched.spawn(move || {
            fdebug!("[fiber {}] started as {}", i, fiberio::current_id());
            for j in 0..3 {
                *counter.lock() += 1;
                fdebug!("[fiber {}] iteration {}", i, j);
                fiberio::yield_now();
            }
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop()?;
    println!("{} fibers completed, counter = {}", completed.load(Ordering::SeqCst), *counter.lock());

    // IoManager: timers plus fibers that sleep without holding a thread
    let iom = IoManager::new(2, false, "basic-io")?;
    let start = Instant::now();
    let limit = Arc::new(FiberSemaphore::new(2));

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let timer = iom.add_rec_timer(20, move || {
        t.fetch_add(1, Ordering::SeqCst);
    });

    for i in 0..4 {
        let limit = limit.clone();
        iom.spawn(move || {
            limit.wait();
            fiberio::sleep(Duration::from_millis(50));
            finfo!("[sleeper {}] woke after {:?}", i, start.elapsed());
            limit.post();
        });
    }

    iom.add_timer(150, move || {
        timer.cancel();
    });
    iom.stop()?;

    println!("recurring timer fired {} times", ticks.load(Ordering::SeqCst));
    println!("elapsed {:?} (4 sleepers, 2 at a time)", start.elapsed());
    println!("\n=== Example Complete ===");
    Ok(())
}
