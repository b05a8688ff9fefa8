//! Per-channel packet scheduling state machine, grounded
//! in libffado's `libieee1394/IsoHandler.{h,cpp}`: the
//! five states, the cooperative "please return" flag
//! (`m_dont_exit_iterate_loop` / `requestIterateLoopExit` /
//! `allowIterateLoop`), `getLastCycle`/`getLastIterateTime`, and the
//! "generic handlers serve exactly one SP" constraint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ffado_proto::fingerprint::PacketFingerprint;
use ffado_proto::time::{diff_cycles, CycleTimer};
use ffado_proto::Direction;

use crate::backend::{Disposition, RecvCallback, TransportBackend, XmitCallback};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Created,
    Initialized,
    Prepared,
    Running,
    Error,
}

/// The single client a handler forwards packets to or pulls them from.
enum Client {
    Receive(Box<dyn RecvCallback + Send>),
    Transmit(Box<dyn XmitCallback + Send>),
}

/// One iso channel's packet-scheduling state machine, layered on top of a
/// [`TransportBackend`] handle.
pub struct IsoHandler<B: TransportBackend> {
    backend: Arc<Mutex<B>>,
    handle: B::Handle,
    direction: Direction,
    channel: u8,
    state: HandlerState,
    last_cycle: Option<u16>,
    last_now_ctr: Option<CycleTimer>,
    client: Option<Client>,
    exit_requested: Arc<AtomicBool>,
}

impl<B: TransportBackend> IsoHandler<B> {
    pub fn new(backend: Arc<Mutex<B>>, handle: B::Handle, direction: Direction, channel: u8) -> Self {
        IsoHandler {
            backend,
            handle,
            direction,
            channel,
            state: HandlerState::Created,
            last_cycle: None,
            last_now_ctr: None,
            client: None,
            exit_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn last_cycle(&self) -> Option<u16> {
        self.last_cycle
    }

    pub fn last_now_ctr(&self) -> Option<CycleTimer> {
        self.last_now_ctr
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.backend.lock().unwrap().fd(self.handle)
    }

    /// "Generic handlers serve exactly one SP": registering a second
    /// client on an in-use handler is a programming error, not a runtime
    /// condition, so this panics rather than returning a `Result`.
    pub fn register_receive_client(&mut self, client: impl RecvCallback + Send + 'static) {
        assert!(self.client.is_none(), "handler already has a client registered");
        self.client = Some(Client::Receive(Box::new(client)));
    }

    pub fn register_transmit_client(&mut self, client: impl XmitCallback + Send + 'static) {
        assert!(self.client.is_none(), "handler already has a client registered");
        self.client = Some(Client::Transmit(Box::new(client)));
    }

    pub fn is_in_use(&self) -> bool {
        self.client.is_some()
    }

    pub fn init(
        &mut self,
        n_pkts: usize,
        max_pkt: usize,
        mode: crate::backend::RecvMode,
        speed: crate::backend::Speed,
        irq_interval: u32,
    ) -> Result<(), TransportError> {
        assert_eq!(self.state, HandlerState::Created);

        let mut backend = self.backend.lock().unwrap();
        match self.direction {
            Direction::Receive => {
                backend.recv_init(self.handle, n_pkts, max_pkt, self.channel, mode, irq_interval)?;
            }
            Direction::Transmit => {
                backend.xmit_init(self.handle, n_pkts, max_pkt, self.channel, speed, irq_interval)?;
            }
        }
        drop(backend);

        self.state = HandlerState::Initialized;
        Ok(())
    }

    pub fn prepare(&mut self) {
        assert_eq!(self.state, HandlerState::Initialized);
        self.state = HandlerState::Prepared;
    }

    pub fn enable(&mut self, start_cycle: i32, prebuffers: u32) -> Result<(), TransportError> {
        assert_eq!(self.state, HandlerState::Prepared);
        self.backend.lock().unwrap().start(self.handle, start_cycle, prebuffers)?;
        self.state = HandlerState::Running;
        self.last_cycle = None;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), TransportError> {
        if self.state == HandlerState::Running {
            self.backend.lock().unwrap().stop(self.handle)?;
        }
        self.state = HandlerState::Prepared;
        Ok(())
    }

    /// Transition to the terminal `Error` state. The handler is disabled
    /// (best effort) but not destroyed — "any error -> Error (terminal,
    /// disable+destroy)" leaves the destroy half to the caller; this only
    /// disables.
    fn fail(&mut self) {
        let _ = self.backend.lock().unwrap().stop(self.handle);
        self.state = HandlerState::Error;
    }

    /// Notify the client of a bus reset: disables the handler without
    /// destroying it, so the manager can rebuild its shadow map and the
    /// client can re-enable at the next safe instant.
    pub fn handle_bus_reset(&mut self) {
        log::warn!("iso handler on channel {}: bus reset, disabling", self.channel);
        let _ = self.disable();
    }

    /// Ask an in-progress `iterate()` on another thread to return
    /// promptly rather than keep draining packets.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Relaxed);
        self.backend.lock().unwrap().wake(self.handle);
    }

    pub fn allow_iterate_loop(&self) {
        self.exit_requested.store(false, Ordering::Relaxed);
    }

    /// Valid only in `Running`. Snapshots `last_now_ctr`
    /// before entering the transport's `iterate`, then drives packets
    /// through the registered client, reconstructing each packet's full
    /// CTR from the bare cycle number the transport reports.
    pub fn iterate(&mut self) -> Result<bool, TransportError> {
        if self.state != HandlerState::Running {
            return Ok(false);
        }

        let now_ctr = self.backend.lock().unwrap().read_cycle_timer()?.0;
        self.last_now_ctr = Some(now_ctr);

        let result = match (self.direction, self.client.as_mut()) {
            (Direction::Receive, Some(Client::Receive(client))) => {
                let mut adapter = ReceiveAdapter {
                    client: client.as_mut(),
                    last_cycle: &mut self.last_cycle,
                    now_ctr,
                    exit_requested: &self.exit_requested,
                };
                self.backend.lock().unwrap().iterate_recv(self.handle, &mut adapter)
            }
            (Direction::Transmit, Some(Client::Transmit(client))) => {
                let mut adapter = TransmitAdapter {
                    client: client.as_mut(),
                    now_ctr,
                    exit_requested: &self.exit_requested,
                };
                self.backend.lock().unwrap().iterate_xmit(self.handle, &mut adapter)
            }
            _ => {
                log::debug!("iso handler on channel {}: iterate() with no registered client", self.channel);
                return Ok(true);
            }
        };

        match result {
            Ok(more) => Ok(more),
            Err(err) => {
                log::error!("iso handler on channel {}: {err}", self.channel);
                self.fail();
                Ok(false)
            }
        }
    }

    /// Drain the kernel queue synchronously. Receive only.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        assert_eq!(self.direction, Direction::Receive);
        self.backend.lock().unwrap().flush(self.handle)
    }

    pub fn close(mut self) {
        let _ = self.disable();
        self.backend.lock().unwrap().close(self.handle);
    }
}

/// Reconstructs a full CTR from a bare iso cycle number (0..8000) plus a
/// nearby full cycle timer reading, the same "did the seconds field wrap
/// since `now`" test [`PacketFingerprint::seconds_wrapped_since`] uses.
pub fn assemble_ctr(now: CycleTimer, cycle: u16) -> CycleTimer {
    let fp = PacketFingerprint::new(0, Direction::Receive, cycle);
    let seconds = if fp.seconds_wrapped_since(now) {
        now.seconds.wrapping_add(1) % 128
    } else {
        now.seconds
    };
    CycleTimer { seconds, cycles: cycle, offset: 0 }
}

struct ReceiveAdapter<'a> {
    client: &'a mut dyn RecvCallback,
    last_cycle: &'a mut Option<u16>,
    now_ctr: CycleTimer,
    exit_requested: &'a AtomicBool,
}

impl<'a> RecvCallback for ReceiveAdapter<'a> {
    fn on_packet(
        &mut self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        cycle: u16,
        _pkt_ctr: CycleTimer,
        dropped: u32,
    ) -> Disposition {
        let pkt_ctr = assemble_ctr(self.now_ctr, cycle);

        let skipped = match *self.last_cycle {
            Some(last) => {
                let expected_advance = diff_cycles(cycle as u32, last as u32).max(0) as u32;
                expected_advance.saturating_sub(1).max(dropped)
            }
            None => dropped,
        };
        *self.last_cycle = Some(cycle);

        let disposition = self.client.on_packet(data, channel, tag, sy, cycle, pkt_ctr, skipped);

        if self.exit_requested.load(Ordering::Relaxed) && disposition == Disposition::Ok {
            Disposition::Defer
        } else {
            disposition
        }
    }
}

struct TransmitAdapter<'a> {
    client: &'a mut dyn XmitCallback,
    now_ctr: CycleTimer,
    exit_requested: &'a AtomicBool,
}

impl<'a> XmitCallback for TransmitAdapter<'a> {
    fn fill_packet(&mut self, buf: &mut [u8], cycle: i32, now_ctr: CycleTimer, dropped: u32) -> (usize, u8, u8, Disposition) {
        let _ = now_ctr;
        if cycle < 0 {
            // Transport could not align this cycle; mark the timestamp
            // invalid and let the
            // client still choose what, if anything, to send.
            log::trace!("transmit handler: unaligned cycle, pkt_ctr = 0xFFFF_FFFF");
        }

        let (len, tag, sy, disposition) = self.client.fill_packet(buf, cycle, self.now_ctr, dropped);

        if self.exit_requested.load(Ordering::Relaxed) && disposition == Disposition::Ok {
            (len, tag, sy, Disposition::Defer)
        } else {
            (len, tag, sy, disposition)
        }
    }
}
