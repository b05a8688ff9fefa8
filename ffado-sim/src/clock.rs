//! A free-running simulated 1394 cycle timer, standing in for a real CSR
//! read at `0xFFFF_F000_0200`.
//! Advances at the bus's true 8000 cycles/second rate relative to
//! `CLOCK_MONOTONIC`, the same pairing a real transport hands back
//! alongside its CTR read for `ffado_util::clock::ClockCorrelator` to
//! anchor against.

use std::time::Instant;

use ffado_proto::time::{CycleTimer, Tick};
use ffado_proto::TICKS_PER_SECOND;

#[derive(Clone)]
pub struct SimClock {
    origin: Instant,
}

impl SimClock {
    pub fn new() -> Self {
        SimClock { origin: Instant::now() }
    }

    pub fn now_tick(&self) -> Tick {
        let elapsed_ns = self.origin.elapsed().as_nanos();
        let ticks = (elapsed_ns * TICKS_PER_SECOND as u128 / 1_000_000_000u128) as i64;
        Tick::zero().add_ticks(ticks)
    }

    pub fn now_ctr(&self) -> CycleTimer {
        CycleTimer::from_tick(self.now_tick())
    }

    pub fn now_host_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_monotonically() {
        let clock = SimClock::new();
        let a = clock.now_tick();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now_tick();
        assert!(b.diff(a) > 0);
    }
}
