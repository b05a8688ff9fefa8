//! The abstract iso transport ABI the core requires from the platform,
//! consumed here rather than defined: no concrete binding to
//! libraw1394/firewire-cdev is implemented in this workspace, since
//! re-implementing the 1394 transport itself is out of scope, and
//! fabricating FFI bindings with no real kernel headers to link against
//! would mean inventing a fake dependency. The one concrete
//! implementation shipped is `ffado-sim`'s in-memory loopback, used by
//! the engine's own tests and CLI demo.

use std::os::unix::io::RawFd;

use ffado_proto::time::CycleTimer;

use crate::error::TransportError;

/// How a receive context delivers payload: per-packet callbacks
/// (`packet_per_buf`) or one callback over a filled ring (`bufferfill`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    PacketPerBuffer,
    BufferFill,
}

/// 1394 bus speed, governs max packet size and arbitration; transmit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    S100,
    S200,
    S400,
    S800,
}

/// Callback disposition: `Ok` continues iterating,
/// `Defer` stops iterating but leaves the context runnable, `Again` asks
/// the transport to retry this packet later, `Error` is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ok,
    Defer,
    Again,
    Error,
}

/// Invoked once per received packet during `TransportBackend::iterate`.
/// `pkt_ctr` is the backend's best-effort full cycle timer reading for
/// this packet; a backend that can't reconstruct one (most can't — the
/// hardware only hands back the bare cycle number) passes a partial
/// value and leaves the real reconstruction to whoever sits between it
/// and the stream processor.
pub trait RecvCallback {
    #[allow(clippy::too_many_arguments)]
    fn on_packet(
        &mut self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        cycle: u16,
        pkt_ctr: CycleTimer,
        dropped: u32,
    ) -> Disposition;
}

/// Invoked once per transmit opportunity during `TransportBackend::iterate`.
/// The callback fills `buf` and returns `(len, tag, sy, disposition)`.
/// `now_ctr` is the cycle timer reading taken for this iteration.
pub trait XmitCallback {
    fn fill_packet(&mut self, buf: &mut [u8], cycle: i32, now_ctr: CycleTimer, dropped: u32) -> (usize, u8, u8, Disposition);
}

/// The kernel iso transport contract. `Handle` identifies
/// one open iso context (one channel, one direction); implementations are
/// free to make it anything `Copy` — an index into their own table, a
/// raw fd, whatever fits.
pub trait TransportBackend {
    type Handle: Copy;

    fn open(&mut self, port: u32) -> Result<Self::Handle, TransportError>;
    fn close(&mut self, handle: Self::Handle);

    fn recv_init(
        &mut self,
        handle: Self::Handle,
        n_pkts: usize,
        max_pkt: usize,
        channel: u8,
        mode: RecvMode,
        irq_interval: u32,
    ) -> Result<(), TransportError>;

    fn xmit_init(
        &mut self,
        handle: Self::Handle,
        n_pkts: usize,
        max_pkt: usize,
        channel: u8,
        speed: Speed,
        irq_interval: u32,
    ) -> Result<(), TransportError>;

    fn start(&mut self, handle: Self::Handle, start_cycle: i32, prebuffers: u32) -> Result<(), TransportError>;
    fn stop(&mut self, handle: Self::Handle) -> Result<(), TransportError>;

    /// Process one batch of packets, invoking `recv` inline for each
    /// received packet. Valid on receive contexts only.
    fn iterate_recv(&mut self, handle: Self::Handle, recv: &mut dyn RecvCallback) -> Result<bool, TransportError>;

    /// Process one batch of packets, invoking `xmit` inline to fill each
    /// transmit opportunity. Valid on transmit contexts only.
    fn iterate_xmit(&mut self, handle: Self::Handle, xmit: &mut dyn XmitCallback) -> Result<bool, TransportError>;

    /// Drain the kernel queue synchronously. Receive only.
    fn flush(&mut self, handle: Self::Handle) -> Result<(), TransportError>;

    /// A descriptor pollable for `POLLIN`.
    fn fd(&self, handle: Self::Handle) -> RawFd;

    /// Read the 1394 cycle timer CSR, paired with a host monotonic
    /// timestamp (microseconds) taken at the same instant — the pairing
    /// `ffado_util::clock::ClockCorrelator` anchors against.
    fn read_cycle_timer(&self) -> Result<(CycleTimer, u64), TransportError>;

    /// Cause an in-progress `iterate_{recv,xmit}` on another thread to
    /// return promptly, for cooperative shutdown.
    fn wake(&self, handle: Self::Handle);
}
