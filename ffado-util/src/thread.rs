//! Thread naming and real-time scheduling for the engine's long-lived
//! threads (transmit poll, receive poll, period scheduler, watchdog),
//! via raw `pthread_setname_np` / `sched_setscheduler(SCHED_FIFO)` calls.

use std::ffi::CString;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};

/// `rt_priority` is capped at a safe maximum — this bounds
/// the highest FIFO priority the engine will ever request, regardless of
/// what a misconfigured `EngineConfig` asks for.
pub const MAX_RT_PRIORITY: i32 = 90;

pub fn set_name(name: &str) {
    let cstr = CString::new(name).expect("thread name contains a NUL byte");

    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), cstr.as_ptr());
    }
}

/// Raise the calling thread to `SCHED_FIFO` at `priority`, clamped to
/// [`MAX_RT_PRIORITY`]. On failure (typically `EPERM` without
/// `CAP_SYS_NICE`), logs once per process and continues at whatever
/// scheduling class the thread already had — never fails the engine
/// outright: iso threads never surface errors through blocking APIs, a
/// posture extended here to startup.
pub fn set_realtime_priority(priority: i32) {
    let priority = priority.clamp(1, MAX_RT_PRIORITY);

    let rc = unsafe {
        libc::sched_setscheduler(
            0,
            libc::SCHED_FIFO,
            &libc::sched_param { sched_priority: priority },
        )
    };

    if rc < 0 {
        static WARNED: AtomicBool = AtomicBool::new(false);
        let warned = WARNED.swap(true, Ordering::Relaxed);

        if !warned {
            let err = std::io::Error::last_os_error();
            log::warn!("failed to set realtime thread priority: {err}");

            if err.kind() == ErrorKind::PermissionDenied {
                let path = std::env::current_exe()
                    .map(|path| path.display().to_string());

                let path = path.as_deref().unwrap_or("path/to/ffado");

                log::warn!("fix by running: setcap cap_sys_nice=ep {path}");
            }
        }
    }
}

/// Drop the calling thread back to the normal time-sharing scheduler.
/// Used by the watchdog when a registered real-time
/// thread has gone quiet rather than letting it hold real-time priority
/// while wedged.
pub fn clear_realtime_priority() {
    let rc = unsafe {
        libc::sched_setscheduler(0, libc::SCHED_OTHER, &libc::sched_param { sched_priority: 0 })
    };

    if rc < 0 {
        log::warn!("failed to clear realtime thread priority: {}", std::io::Error::last_os_error());
    }
}

/// `manager_rt_prio = base + delta_iso + delta_dir`. Kept
/// as a small pure function so the budget arithmetic is testable without
/// touching the scheduler.
pub fn manager_rt_priority(base: i32, delta_iso: i32, delta_dir: i32) -> i32 {
    (base + delta_iso + delta_dir).clamp(1, MAX_RT_PRIORITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_priority_clamps_to_max() {
        assert_eq!(manager_rt_priority(80, 10, 10), MAX_RT_PRIORITY);
    }

    #[test]
    fn manager_priority_sums_within_range() {
        assert_eq!(manager_rt_priority(50, 2, 3), 55);
    }
}
