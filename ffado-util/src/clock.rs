//! Host-facing clock reads and the tick/host-time correlation the period
//! scheduler needs to turn an absolute `Tick` deadline into a `clock_nanosleep(ABSOLUTE)` call. Pure tick
//! arithmetic stays in `ffado_proto::time`; this module is just the
//! `clock_gettime` call site.

use std::time::Duration;

use nix::sys::time::TimeValLike;
use nix::time::ClockId;

use ffado_proto::time::Tick;

/// A point on `CLOCK_MONOTONIC`, in nanoseconds since an arbitrary origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostInstant(i64);

impl HostInstant {
    pub fn now() -> Self {
        let ts = nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC)
            .expect("clock_gettime(CLOCK_MONOTONIC) failed, are we on Linux?");

        HostInstant(ts.num_nanoseconds())
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    /// Build a `HostInstant` from a monotonic microsecond reading taken by
    /// a transport backend alongside a cycle timer read
    /// (`TransportBackend::read_cycle_timer`'s paired host timestamp).
    pub fn from_micros(us: u64) -> Self {
        HostInstant(us as i64 * 1_000)
    }

    pub fn checked_add(self, delta: Duration) -> Self {
        HostInstant(self.0 + delta.as_nanos() as i64)
    }

    pub fn checked_sub(self, delta: Duration) -> Self {
        HostInstant(self.0 - delta.as_nanos() as i64)
    }
}

/// Block the calling thread until `CLOCK_MONOTONIC` reaches `deadline`.
/// Uses an absolute sleep rather than a relative one so a long scheduling
/// delay between computing `deadline` and calling this function doesn't
/// compound into an overshoot.
pub fn sleep_until(deadline: HostInstant) -> Result<(), nix::Error> {
    let ts = libc::timespec {
        tv_sec: (deadline.0 / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline.0 % 1_000_000_000) as libc::c_long,
    };

    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };

        match rc {
            0 => return Ok(()),
            libc::EINTR => continue,
            errno => return Err(nix::Error::from_i32(errno)),
        }
    }
}

/// Correlates the 128-second-wrapping `Tick` timeline (`ffado_proto::time`)
/// with host monotonic time. `Tick` already advances at a fixed, known
/// rate (24,576,000/s) regardless of any particular stream's sample-rate
/// drift — that drift is what the per-buffer DLL tracks separately — so a
/// single anchor pair captured once is enough; later projections are a
/// plain unwrap-and-scale, no recalibration needed.
#[derive(Debug, Clone, Copy)]
pub struct ClockCorrelator {
    anchor_tick: Tick,
    anchor_host: HostInstant,
}

impl ClockCorrelator {
    pub fn anchor(tick: Tick, host: HostInstant) -> Self {
        ClockCorrelator { anchor_tick: tick, anchor_host: host }
    }

    /// Re-anchor to a freshly read `(tick, host)` pair. Called whenever the
    /// transport hands back a `read_cycle_timer()` result, so drift in the
    /// host's own clock relative to the bus clock never accumulates across
    /// a long-running engine.
    pub fn reanchor(&mut self, tick: Tick, host: HostInstant) {
        self.anchor_tick = tick;
        self.anchor_host = host;
    }

    /// Project a tick-domain instant onto the host monotonic timeline.
    pub fn project(&self, tick: Tick) -> HostInstant {
        let delta_ticks = tick.diff(self.anchor_tick);
        let delta_ns = delta_ticks * 1_000_000_000 / ffado_proto::TICKS_PER_SECOND as i64;
        if delta_ns >= 0 {
            self.anchor_host.checked_add(Duration::from_nanos(delta_ns as u64))
        } else {
            self.anchor_host.checked_sub(Duration::from_nanos((-delta_ns) as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlator_projects_one_second_forward() {
        let anchor_host = HostInstant(0);
        let anchor_tick = Tick::zero();
        let correlator = ClockCorrelator::anchor(anchor_tick, anchor_host);

        let one_second_later = anchor_tick.add_ticks(ffado_proto::TICKS_PER_SECOND as i64);
        let projected = correlator.project(one_second_later);

        assert_eq!(projected.as_nanos(), 1_000_000_000);
    }

    #[test]
    fn correlator_projects_backwards() {
        let anchor_host = HostInstant(1_000_000_000);
        let anchor_tick = Tick::from_ticks(ffado_proto::TICKS_PER_SECOND);
        let correlator = ClockCorrelator::anchor(anchor_tick, anchor_host);

        let projected = correlator.project(Tick::zero());
        assert_eq!(projected.as_nanos(), 0);
    }
}
