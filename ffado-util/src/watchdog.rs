//! Watchdog thread: a separate low-priority thread writes a heartbeat
//! flag the manager resets each loop; if unset for the configured
//! interval, the watchdog drops all registered threads back to non-RT
//! scheduling rather than wedging the system. Grounded in libffado's
//! `libutil/Watchdog.cpp` heartbeat/demotion pattern.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::thread;

/// One real-time thread the watchdog can demote. `tid` is the OS thread
/// id (`libc::pid_t`, as returned by `gettid()`), since
/// `sched_setscheduler` addresses threads by tid, not by Rust's
/// `JoinHandle`.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredThread {
    pub tid: libc::pid_t,
}

/// Shared heartbeat a monitored thread resets once per loop iteration via
/// [`Heartbeat::beat`]. Cheap to clone; backed by a single atomic.
#[derive(Clone)]
pub struct Heartbeat(Arc<AtomicBool>);

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat(Arc::new(AtomicBool::new(true)))
    }

    pub fn beat(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Read-and-clear: used by the watchdog loop to test "did anyone beat
    /// since my last check" without missing a beat that lands between
    /// checks.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    heartbeat: Heartbeat,
    threads: std::sync::Mutex<Vec<RegisteredThread>>,
    stop: AtomicBool,
    interval_us: AtomicI32,
}

/// Handle used by the engine to register real-time threads and to obtain
/// the [`Heartbeat`] those threads must beat.
pub struct Watchdog {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawn the watchdog thread at `interval_us`. The thread itself never takes a real-time
    /// priority — it must keep running even if everything else on the
    /// system is starved, which is the entire point of a watchdog.
    pub fn spawn(interval_us: u64) -> Self {
        let shared = Arc::new(Shared {
            heartbeat: Heartbeat::new(),
            threads: std::sync::Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            interval_us: AtomicI32::new(interval_us.min(i32::MAX as u64) as i32),
        });

        let worker = Arc::clone(&shared);
        let join = std::thread::spawn(move || {
            thread::set_name("ffado-watchdog");
            run(worker);
        });

        Watchdog { shared, join: Some(join) }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.shared.heartbeat.clone()
    }

    pub fn register(&self, thread: RegisteredThread) {
        self.shared.threads.lock().unwrap().push(thread);
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::Relaxed) {
        let interval = Duration::from_micros(shared.interval_us.load(Ordering::Relaxed).max(0) as u64);
        std::thread::sleep(interval);

        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        if !shared.heartbeat.take() {
            log::error!("watchdog: no heartbeat in {:?}, demoting all registered threads", interval);
            demote_all(&shared);
        }
    }
}

fn demote_all(shared: &Shared) {
    let threads = shared.threads.lock().unwrap();
    for registered in threads.iter() {
        let rc = unsafe {
            libc::sched_setscheduler(registered.tid, libc::SCHED_OTHER, &libc::sched_param { sched_priority: 0 })
        };
        if rc < 0 {
            log::warn!(
                "watchdog: failed to demote tid {}: {}",
                registered.tid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_take_clears_flag() {
        let hb = Heartbeat::new();
        assert!(hb.take());
        assert!(!hb.take());
        hb.beat();
        assert!(hb.take());
    }
}
