//! [`LoopbackTransport`]: the in-memory `TransportBackend` this workspace ships in place of a real kernel iso transport.
//! Two handles opened on the same channel — one bound transmit, one
//! bound receive, via `xmit_init`/`recv_init` — mirror packets between
//! each other at the real 8000 cycles/second bus rate. A background
//! clock thread signals every running transmit handle once per cycle,
//! standing in for the hardware interrupt a real iso transmit context
//! gets; delivery to the matching receive handle happens synchronously
//! inside `iterate_xmit`, the way a real 1394 bus delivers a packet a
//! peer node put on the wire.

use std::collections::{HashMap, VecDeque};
use std::io::{Error, ErrorKind};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ffado_proto::time::CycleTimer;
use ffado_proto::CYCLES_PER_SECOND;
use ffado_transport::backend::{Disposition, RecvCallback, RecvMode, Speed, TransportBackend, XmitCallback};
use ffado_transport::error::TransportError;

use crate::clock::SimClock;
use crate::pipe::SelfPipe;

/// Default buffer size handed to `XmitCallback::fill_packet` when the
/// caller didn't request a larger one via `xmit_init`.
const DEFAULT_MAX_PACKET_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

struct QueuedPacket {
    data: Vec<u8>,
    tag: u8,
    sy: u8,
    cycle: u16,
}

#[derive(Clone, Copy)]
enum Binding {
    Recv { channel: u8 },
    Xmit { channel: u8, max_pkt: usize, #[allow(dead_code)] speed: Speed },
}

impl Binding {
    fn channel(self) -> u8 {
        match self {
            Binding::Recv { channel } => channel,
            Binding::Xmit { channel, .. } => channel,
        }
    }
}

struct HandleState {
    binding: Option<Binding>,
    running: bool,
    pipe: SelfPipe,
}

#[derive(Default)]
struct Channel {
    queue: VecDeque<QueuedPacket>,
}

struct Shared {
    handles: Mutex<Vec<HandleState>>,
    channels: Mutex<HashMap<u8, Channel>>,
    clock: SimClock,
    stop: AtomicBool,
}

/// One 1394 cycle, the cadence the background clock thread signals
/// running transmit handles at.
const TICK_PERIOD: Duration = Duration::from_nanos(1_000_000_000 / CYCLES_PER_SECOND as u64);

/// An in-memory stand-in for a kernel iso transport.
/// Cheap to construct; owns one background clock thread, stopped on drop.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    tick_thread: Option<JoinHandle<()>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            handles: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            clock: SimClock::new(),
            stop: AtomicBool::new(false),
        });

        let tick_shared = Arc::clone(&shared);
        let tick_thread = std::thread::spawn(move || run_clock_tick(tick_shared));

        LoopbackTransport { shared, tick_thread: Some(tick_thread) }
    }

    /// The simulated cycle clock backing `read_cycle_timer()`, exposed so
    /// tests and the CLI demo can correlate it against real wall-clock
    /// time without a second `read_cycle_timer()` round-trip.
    pub fn clock(&self) -> &SimClock {
        &self.shared.clock
    }

    fn bind(&self, handle: Handle, binding: Binding) {
        let mut handles = self.shared.handles.lock().unwrap();
        if let Some(state) = handles.get_mut(handle.0) {
            state.binding = Some(binding);
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.tick_thread.take() {
            let _ = join.join();
        }
    }
}

fn run_clock_tick(shared: Arc<Shared>) {
    ffado_util::thread::set_name("ffado-sim-clock");
    while !shared.stop.load(Ordering::Relaxed) {
        std::thread::sleep(TICK_PERIOD);
        let handles = shared.handles.lock().unwrap();
        for state in handles.iter() {
            if state.running && matches!(state.binding, Some(Binding::Xmit { .. })) {
                state.pipe.signal();
            }
        }
    }
}

fn bad_handle() -> Error {
    Error::new(ErrorKind::NotFound, "unknown loopback handle")
}

impl TransportBackend for LoopbackTransport {
    type Handle = Handle;

    fn open(&mut self, _port: u32) -> Result<Handle, TransportError> {
        let pipe = SelfPipe::new().map_err(TransportError::Open)?;
        let mut handles = self.shared.handles.lock().unwrap();
        handles.push(HandleState { binding: None, running: false, pipe });
        Ok(Handle(handles.len() - 1))
    }

    fn close(&mut self, handle: Handle) {
        let mut handles = self.shared.handles.lock().unwrap();
        if let Some(state) = handles.get_mut(handle.0) {
            state.running = false;
            state.binding = None;
        }
    }

    fn recv_init(
        &mut self,
        handle: Handle,
        _n_pkts: usize,
        _max_pkt: usize,
        channel: u8,
        _mode: RecvMode,
        _irq_interval: u32,
    ) -> Result<(), TransportError> {
        self.bind(handle, Binding::Recv { channel });
        Ok(())
    }

    fn xmit_init(
        &mut self,
        handle: Handle,
        _n_pkts: usize,
        max_pkt: usize,
        channel: u8,
        speed: Speed,
        _irq_interval: u32,
    ) -> Result<(), TransportError> {
        log::debug!("loopback transport: xmit context bound to channel {channel} at {speed:?}");
        self.bind(handle, Binding::Xmit { channel, max_pkt, speed });
        Ok(())
    }

    fn start(&mut self, handle: Handle, _start_cycle: i32, _prebuffers: u32) -> Result<(), TransportError> {
        let mut handles = self.shared.handles.lock().unwrap();
        let state = handles.get_mut(handle.0).ok_or_else(|| TransportError::Start(bad_handle()))?;
        state.running = true;
        Ok(())
    }

    fn stop(&mut self, handle: Handle) -> Result<(), TransportError> {
        let mut handles = self.shared.handles.lock().unwrap();
        if let Some(state) = handles.get_mut(handle.0) {
            state.running = false;
        }
        Ok(())
    }

    fn iterate_recv(&mut self, handle: Handle, recv: &mut dyn RecvCallback) -> Result<bool, TransportError> {
        let channel = {
            let handles = self.shared.handles.lock().unwrap();
            let state = handles.get(handle.0).ok_or_else(|| TransportError::Iterate(bad_handle()))?;
            state.pipe.drain();
            match state.binding {
                Some(binding @ Binding::Recv { .. }) => binding.channel(),
                _ => return Ok(true),
            }
        };

        let packets: Vec<QueuedPacket> = {
            let mut channels = self.shared.channels.lock().unwrap();
            channels.entry(channel).or_default().queue.drain(..).collect()
        };

        let pkt_ctr = self.shared.clock.now_ctr();
        for pkt in packets {
            match recv.on_packet(&pkt.data, channel, pkt.tag, pkt.sy, pkt.cycle, pkt_ctr, 0) {
                Disposition::Error => {
                    return Err(TransportError::Iterate(Error::new(ErrorKind::Other, "receive client reported a fatal error")))
                }
                Disposition::Defer => break,
                Disposition::Ok | Disposition::Again => {}
            }
        }

        Ok(true)
    }

    fn iterate_xmit(&mut self, handle: Handle, xmit: &mut dyn XmitCallback) -> Result<bool, TransportError> {
        let (channel, max_pkt) = {
            let handles = self.shared.handles.lock().unwrap();
            let state = handles.get(handle.0).ok_or_else(|| TransportError::Iterate(bad_handle()))?;
            state.pipe.drain();
            match state.binding {
                Some(Binding::Xmit { channel, max_pkt, .. }) => (channel, max_pkt),
                _ => return Ok(true),
            }
        };

        let now = self.shared.clock.now_ctr();
        let mut buf = vec![0u8; max_pkt.max(DEFAULT_MAX_PACKET_BYTES)];
        let (len, tag, sy, disposition) = xmit.fill_packet(&mut buf, now.cycles as i32, now, 0);

        match disposition {
            Disposition::Error => {
                return Err(TransportError::Iterate(Error::new(ErrorKind::Other, "transmit client reported a fatal error")))
            }
            Disposition::Again => return Ok(true),
            Disposition::Ok | Disposition::Defer => {}
        }

        if len > 0 {
            buf.truncate(len);

            {
                let mut channels = self.shared.channels.lock().unwrap();
                channels.entry(channel).or_default().queue.push_back(QueuedPacket { data: buf, tag, sy, cycle: now.cycles });
            }

            let handles = self.shared.handles.lock().unwrap();
            for state in handles.iter() {
                if state.running && matches!(state.binding, Some(Binding::Recv { channel: c }) if c == channel) {
                    state.pipe.signal();
                }
            }
        }

        Ok(disposition != Disposition::Defer)
    }

    fn flush(&mut self, handle: Handle) -> Result<(), TransportError> {
        let channel = {
            let handles = self.shared.handles.lock().unwrap();
            let state = handles.get(handle.0).ok_or_else(|| TransportError::Iterate(bad_handle()))?;
            match state.binding {
                Some(Binding::Recv { channel }) => channel,
                _ => return Ok(()),
            }
        };
        self.shared.channels.lock().unwrap().entry(channel).or_default().queue.clear();
        Ok(())
    }

    fn fd(&self, handle: Handle) -> RawFd {
        self.shared.handles.lock().unwrap()[handle.0].pipe.read_fd()
    }

    fn read_cycle_timer(&self) -> Result<(CycleTimer, u64), TransportError> {
        Ok((self.shared.clock.now_ctr(), self.shared.clock.now_host_micros()))
    }

    fn wake(&self, handle: Handle) {
        if let Some(state) = self.shared.handles.lock().unwrap().get(handle.0) {
            state.pipe.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingRecv {
        count: usize,
    }

    impl RecvCallback for CountingRecv {
        fn on_packet(
            &mut self,
            _data: &[u8],
            _channel: u8,
            _tag: u8,
            _sy: u8,
            _cycle: u16,
            _pkt_ctr: CycleTimer,
            _dropped: u32,
        ) -> Disposition {
            self.count += 1;
            Disposition::Ok
        }
    }

    struct FixedXmit {
        payload: Vec<u8>,
    }

    impl XmitCallback for FixedXmit {
        fn fill_packet(&mut self, buf: &mut [u8], _cycle: i32, _now_ctr: CycleTimer, _dropped: u32) -> (usize, u8, u8, Disposition) {
            buf[..self.payload.len()].copy_from_slice(&self.payload);
            (self.payload.len(), 1, 0, Disposition::Ok)
        }
    }

    #[test]
    fn loopback_mirrors_one_packet_between_paired_handles() {
        let mut transport = LoopbackTransport::new();
        let tx = transport.open(0).unwrap();
        let rx = transport.open(0).unwrap();
        transport.xmit_init(tx, 8, 512, 5, Speed::S400, 1).unwrap();
        transport.recv_init(rx, 8, 512, 5, RecvMode::PacketPerBuffer, 1).unwrap();
        transport.start(tx, 0, 0).unwrap();
        transport.start(rx, 0, 0).unwrap();

        let mut xmit_cb = FixedXmit { payload: vec![0xAA; 16] };
        transport.iterate_xmit(tx, &mut xmit_cb).unwrap();

        let mut recv_cb = CountingRecv { count: 0 };
        transport.iterate_recv(rx, &mut recv_cb).unwrap();

        assert_eq!(recv_cb.count, 1);
    }

    #[test]
    fn unbound_handle_iterate_is_a_noop() {
        let mut transport = LoopbackTransport::new();
        let h = transport.open(0).unwrap();
        transport.start(h, 0, 0).unwrap();
        let mut recv_cb = CountingRecv { count: 0 };
        transport.iterate_recv(h, &mut recv_cb).unwrap();
        assert_eq!(recv_cb.count, 0);
    }

    #[test]
    fn flush_drops_queued_packets() {
        let mut transport = LoopbackTransport::new();
        let tx = transport.open(0).unwrap();
        let rx = transport.open(0).unwrap();
        transport.xmit_init(tx, 8, 512, 3, Speed::S400, 1).unwrap();
        transport.recv_init(rx, 8, 512, 3, RecvMode::PacketPerBuffer, 1).unwrap();
        transport.start(tx, 0, 0).unwrap();
        transport.start(rx, 0, 0).unwrap();

        let mut xmit_cb = FixedXmit { payload: vec![0xBB; 16] };
        transport.iterate_xmit(tx, &mut xmit_cb).unwrap();
        transport.flush(rx).unwrap();

        let mut recv_cb = CountingRecv { count: 0 };
        transport.iterate_recv(rx, &mut recv_cb).unwrap();
        assert_eq!(recv_cb.count, 0);
    }
}
