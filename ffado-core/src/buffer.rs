//! `TimestampedBuffer`: a ring of raw interleaved event bytes with a
//! tick-stamped head/tail and a digital locked loop tracking the true
//! frames/tick ratio. Built on a `ringbuf`-backed SPSC pattern for
//! lock-free producer/consumer handoff, storing raw event bytes
//! instead of typed audio samples, with the tick-stamped head/tail and
//! DLL state layered on top so the iso stream's own clock is what gets
//! tracked, rather than a downstream playback device's.

use std::f64::consts::{FRAC_1_SQRT_2, PI};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use thiserror::Error;

use ffado_proto::time::Tick;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("wrong byte length: got {got}, expected {expected} ({frames} frames x {event_size} bytes)")]
    WrongLength { got: usize, expected: usize, frames: usize, event_size: usize },
    #[error("buffer overrun: tried to write {requested} frames with only {available} free")]
    Overrun { requested: usize, available: usize },
    #[error("buffer underrun: tried to read {requested} frames with only {available} available")]
    Underrun { requested: usize, available: usize },
}

/// Second-order DLL refining the true frames/tick ratio from observed
/// write timestamps: `err = ts_tail - predicted`;
/// `ts_next = ts_tail + n*T + 2*zeta*omega*err`; `T += omega^2*err / n`,
/// saturated within `+-max_rate_error` of nominal.
struct Dll {
    ticks_per_frame: f64,
    nominal_ticks_per_frame: f64,
    max_rate_error: f64,
    bandwidth_hz: f64,
    predicted_next: Option<f64>,
    unrecoverable: bool,
}

impl Dll {
    fn new(nominal_ticks_per_frame: f64, bandwidth_hz: f64, max_rate_error: f64) -> Self {
        Dll {
            ticks_per_frame: nominal_ticks_per_frame,
            nominal_ticks_per_frame,
            max_rate_error,
            bandwidth_hz,
            predicted_next: None,
            unrecoverable: false,
        }
    }

    fn update(&mut self, ts_tail: Tick, n: u32) {
        if n == 0 {
            return;
        }

        let ts_tail_ticks = ts_tail.as_u64() as f64;
        let omega = 2.0 * PI * self.bandwidth_hz;
        let zeta = FRAC_1_SQRT_2;

        if let Some(predicted) = self.predicted_next {
            let err = ts_tail_ticks - predicted;
            self.ticks_per_frame += omega * omega * err / n as f64;
            self.clamp_rate();
            self.predicted_next = Some(ts_tail_ticks + n as f64 * self.ticks_per_frame + 2.0 * zeta * omega * err);
        } else {
            self.predicted_next = Some(ts_tail_ticks + n as f64 * self.ticks_per_frame);
        }
    }

    fn clamp_rate(&mut self) {
        let lo = self.nominal_ticks_per_frame * (1.0 - self.max_rate_error);
        let hi = self.nominal_ticks_per_frame * (1.0 + self.max_rate_error);
        if self.ticks_per_frame < lo || self.ticks_per_frame > hi {
            log::warn!(
                "timestamped buffer: DLL rate {} outside +-{}% of nominal {}, clamping",
                self.ticks_per_frame,
                self.max_rate_error * 100.0,
                self.nominal_ticks_per_frame
            );
            self.ticks_per_frame = self.ticks_per_frame.clamp(lo, hi);
            self.unrecoverable = true;
        }
    }
}

pub struct TimestampedBuffer {
    producer: Mutex<HeapProducer<u8>>,
    consumer: Mutex<HeapConsumer<u8>>,
    event_size_bytes: usize,
    capacity_frames: usize,
    head_ts: AtomicU64,
    tail_ts: AtomicU64,
    dll: Mutex<Dll>,
}

impl TimestampedBuffer {
    pub fn new(
        capacity_frames: usize,
        event_size_bytes: usize,
        nominal_ticks_per_frame: f64,
        dll_bandwidth_hz: f64,
    ) -> Self {
        let rb = HeapRb::new(capacity_frames * event_size_bytes);
        let (producer, consumer) = rb.split();

        TimestampedBuffer {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            event_size_bytes,
            capacity_frames,
            head_ts: AtomicU64::new(0),
            tail_ts: AtomicU64::new(0),
            dll: Mutex::new(Dll::new(nominal_ticks_per_frame, dll_bandwidth_hz, 0.02)),
        }
    }

    pub fn event_size_bytes(&self) -> usize {
        self.event_size_bytes
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Frames currently readable (fill level from the consumer side).
    pub fn fill_frames(&self) -> usize {
        self.consumer.lock().unwrap().len() / self.event_size_bytes
    }

    pub fn free_frames(&self) -> usize {
        self.producer.lock().unwrap().free_len() / self.event_size_bytes
    }

    pub fn rate(&self) -> f64 {
        1.0 / self.dll.lock().unwrap().ticks_per_frame
    }

    /// Whether the DLL's rate estimate has saturated against
    /// `max_rate_error` and can no longer be trusted.
    pub fn rate_unrecoverable(&self) -> bool {
        self.dll.lock().unwrap().unrecoverable
    }

    pub fn get_head_ts(&self) -> (Tick, usize) {
        (Tick::from_ticks(self.head_ts.load(Ordering::Acquire)), self.fill_frames())
    }

    pub fn get_tail_ts(&self) -> (Tick, usize) {
        (Tick::from_ticks(self.tail_ts.load(Ordering::Acquire)), self.fill_frames())
    }

    pub fn set_head_ts(&self, ts: Tick) {
        self.head_ts.store(ts.as_u64(), Ordering::Release);
    }

    pub fn set_tail_ts(&self, ts: Tick) {
        self.tail_ts.store(ts.as_u64(), Ordering::Release);
    }

    /// Append `n` frames, tagging the write with `ts_tail` (the
    /// presentation/arrival time of the *first* frame in `src`). Advances
    /// the tail timestamp by `n * ticks_per_frame` and feeds the DLL
    /// `(ts_tail, n)` to refine the rate estimate.
    pub fn write_frames(&self, n: usize, src: &[u8], ts_tail: Tick) -> Result<(), BufferError> {
        let expected = n * self.event_size_bytes;
        if src.len() != expected {
            return Err(BufferError::WrongLength {
                got: src.len(),
                expected,
                frames: n,
                event_size: self.event_size_bytes,
            });
        }

        let mut producer = self.producer.lock().unwrap();
        if producer.free_len() < expected {
            return Err(BufferError::Overrun { requested: n, available: producer.free_len() / self.event_size_bytes });
        }
        let written = producer.push_slice(src);
        debug_assert_eq!(written, expected);
        drop(producer);

        let mut dll = self.dll.lock().unwrap();
        let ticks_per_frame = dll.ticks_per_frame;
        let new_tail = ts_tail.add_ticks((n as f64 * ticks_per_frame).round() as i64);
        dll.update(ts_tail, n as u32);
        drop(dll);

        self.tail_ts.store(new_tail.as_u64(), Ordering::Release);
        Ok(())
    }

    /// Pop `n` frames into `dst`, advancing the head timestamp by
    /// `n * ticks_per_frame`.
    pub fn read_frames(&self, n: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        let expected = n * self.event_size_bytes;
        if dst.len() != expected {
            return Err(BufferError::WrongLength {
                got: dst.len(),
                expected,
                frames: n,
                event_size: self.event_size_bytes,
            });
        }

        let mut consumer = self.consumer.lock().unwrap();
        if consumer.len() < expected {
            return Err(BufferError::Underrun { requested: n, available: consumer.len() / self.event_size_bytes });
        }
        let read = consumer.pop_slice(dst);
        debug_assert_eq!(read, expected);
        drop(consumer);

        self.advance_head(n);
        Ok(())
    }

    /// As `read_frames`, but discard the output. Used to align a slave
    /// stream to the chosen master.
    pub fn drop_frames(&self, n: usize) -> Result<(), BufferError> {
        let expected = n * self.event_size_bytes;
        let mut consumer = self.consumer.lock().unwrap();
        if consumer.len() < expected {
            return Err(BufferError::Underrun { requested: n, available: consumer.len() / self.event_size_bytes });
        }

        let mut scratch = [0u8; 256];
        let mut remaining = expected;
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            let read = consumer.pop_slice(&mut scratch[..chunk]);
            remaining -= read;
            if read == 0 {
                break;
            }
        }
        drop(consumer);

        self.advance_head(n);
        Ok(())
    }

    fn advance_head(&self, n: usize) {
        let ticks_per_frame = self.dll.lock().unwrap().ticks_per_frame;
        let head = Tick::from_ticks(self.head_ts.load(Ordering::Acquire));
        let next = head.add_ticks((n as f64 * ticks_per_frame).round() as i64);
        self.head_ts.store(next.as_u64(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_buffer() -> TimestampedBuffer {
        TimestampedBuffer::new(1024, 4, 512.0, 0.1)
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let buf = new_buffer();
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        buf.write_frames(2, &src, Tick::zero()).unwrap();
        assert_eq!(buf.fill_frames(), 2);

        let mut dst = [0u8; 8];
        buf.read_frames(2, &mut dst).unwrap();
        assert_eq!(dst, src);
        assert_eq!(buf.fill_frames(), 0);
    }

    #[test]
    fn head_timestamp_advances_by_frames_times_rate() {
        let buf = new_buffer();
        let src = vec![0u8; 4 * 10];
        buf.write_frames(10, &src, Tick::zero()).unwrap();

        let (head0, _) = buf.get_head_ts();
        let mut dst = vec![0u8; 4 * 10];
        buf.read_frames(10, &mut dst).unwrap();
        let (head1, _) = buf.get_head_ts();

        let expected = head0.add_ticks((10.0 * 512.0).round() as i64);
        assert_eq!(head1, expected);
    }

    #[test]
    fn write_rejects_wrong_length() {
        let buf = new_buffer();
        let err = buf.write_frames(2, &[0u8; 3], Tick::zero()).unwrap_err();
        assert!(matches!(err, BufferError::WrongLength { .. }));
    }

    #[test]
    fn overrun_is_reported_not_panicked() {
        let buf = TimestampedBuffer::new(4, 4, 512.0, 0.1);
        let src = vec![0u8; 4 * 8];
        let err = buf.write_frames(8, &src, Tick::zero()).unwrap_err();
        assert!(matches!(err, BufferError::Overrun { .. }));
    }

    #[test]
    fn drop_frames_advances_head_without_returning_data() {
        let buf = new_buffer();
        let src = vec![7u8; 4 * 5];
        buf.write_frames(5, &src, Tick::zero()).unwrap();
        buf.drop_frames(5).unwrap();
        assert_eq!(buf.fill_frames(), 0);
        let (head, _) = buf.get_head_ts();
        assert_eq!(head, Tick::zero().add_ticks((5.0 * 512.0).round() as i64));
    }
}
