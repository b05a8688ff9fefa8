//! The client-facing engine: composes a
//! [`TransportBackend`], a [`HandlerManager`], and a
//! [`StreamProcessorManager`] into one top-level `run()` call, the same
//! way a socket, an encoder, and worker threads come together under a
//! single entry point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ffado_core::manager::StreamProcessorManager;
use ffado_core::stream::{
    PortSamples, PortSamplesMut, SpReceiveClient, SpState, SpTransmitClient, StreamError, StreamProcessor,
};
use ffado_proto::port::Port;
use ffado_proto::Direction;
use ffado_transport::backend::{RecvMode, Speed, TransportBackend};
use ffado_transport::handler::IsoHandler;
use ffado_transport::manager::HandlerManager;
use ffado_util::watchdog::Watchdog;

use crate::config::EngineConfig;
use crate::error::RunError;

/// `HandlerManager`'s direction-thread poll timeout: how promptly a
/// newly-registered or newly-enabled handler is picked up by the shadow
/// map rebuild when no packet traffic is already waking the thread.
const HANDLER_POLL_TIMEOUT_MS: u32 = 20;

/// Prebuffers handed to `TransportBackend::start` on enable — give the
/// transport a couple of cycles' head start before the first `iterate()`
/// call.
const PREBUFFERS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(usize);

/// One period's outcome, as seen by a client blocked in
/// [`Engine::wait_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    Ok,
    XRun,
    EngineDown,
}

/// What a caller needs to specify to add one iso channel to the engine
///. `ports` should already carry the
/// client's desired name/kind/position for each port; `register_stream`
/// enables every port it's given.
pub struct StreamSpec {
    pub direction: Direction,
    pub channel: u8,
    pub data_block_size_quadlets: u8,
    pub ports: Vec<Port>,
    pub capacity_frames: usize,
    pub speed: Speed,
    pub n_pkts: usize,
    pub max_packet_bytes: usize,
    pub irq_interval: u32,
}

struct StreamEntry {
    sp: Arc<StreamProcessor>,
    direction: Direction,
    channel: u8,
    /// One `f32` buffer per port, `period_frames` long, that
    /// `Engine::write_port`/`read_port` and `Engine::transfer` exchange
    /// with the stream processor each period.
    port_buffers: Vec<Mutex<Vec<f32>>>,
}

struct PeriodGateState {
    generation: u64,
    xrun: bool,
    stopped: bool,
}

/// The handshake between the period scheduler thread and a client
/// blocked in `wait_period()`. One signal per period; a timed-out wait
/// counts as an xrun, same as a period the scheduler itself reported as
/// one (a client that isn't woken in time can't have made its deadline
/// either).
struct PeriodGate {
    state: Mutex<PeriodGateState>,
    cond: Condvar,
}

impl PeriodGate {
    fn new() -> Self {
        PeriodGate {
            state: Mutex::new(PeriodGateState { generation: 0, xrun: false, stopped: false }),
            cond: Condvar::new(),
        }
    }

    fn signal(&self, xrun: bool) {
        let mut state = self.state.lock().unwrap();
        state.generation = state.generation.wrapping_add(1);
        state.xrun = xrun;
        self.cond.notify_all();
    }

    fn mark_stopped(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.cond.notify_all();
    }

    fn wait(&self, last_seen: &AtomicU64, timeout: Duration) -> PeriodOutcome {
        let seen = last_seen.load(Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let (state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.generation == seen && !s.stopped)
            .unwrap();

        if state.stopped {
            return PeriodOutcome::EngineDown;
        }
        if result.timed_out() {
            return PeriodOutcome::XRun;
        }

        last_seen.store(state.generation, Ordering::Relaxed);
        if state.xrun {
            PeriodOutcome::XRun
        } else {
            PeriodOutcome::Ok
        }
    }
}

/// Owns the whole engine: the transport, the iso handler poll loops, the
/// period scheduler, and every registered stream processor.
pub struct Engine<B>
where
    B: TransportBackend + Send + 'static,
    B::Handle: Send,
{
    backend: Arc<Mutex<B>>,
    handler_manager: HandlerManager<B>,
    sp_manager: StreamProcessorManager<B>,
    streams: Mutex<Vec<Option<StreamEntry>>>,
    period_gate: Arc<PeriodGate>,
    last_period_seen: AtomicU64,
    watchdog: Mutex<Option<Watchdog>>,
    config: EngineConfig,
    running: AtomicBool,
}

impl<B> Engine<B>
where
    B: TransportBackend + Send + 'static,
    B::Handle: Send,
{
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let backend = Arc::new(Mutex::new(backend));
        Engine {
            sp_manager: StreamProcessorManager::new(Arc::clone(&backend), config.period_frames),
            backend,
            handler_manager: HandlerManager::new(HANDLER_POLL_TIMEOUT_MS),
            streams: Mutex::new(Vec::new()),
            period_gate: Arc::new(PeriodGate::new()),
            last_period_seen: AtomicU64::new(0),
            watchdog: Mutex::new(None),
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn xrun_count(&self) -> u64 {
        self.sp_manager.xrun_count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// A registered stream's current state machine position, for
    /// monitoring and tests. `None` if `id` isn't currently registered.
    pub fn stream_state(&self, id: StreamId) -> Option<SpState> {
        let streams = self.streams.lock().unwrap();
        streams.get(id.0).and_then(Option::as_ref).map(|entry| entry.sp.state())
    }

    /// Opens a transport handle, wires it
    /// to a fresh `StreamProcessor` through an `IsoHandler`, and enrol
    /// both in their respective managers. Structural: takes the coarse
    /// lock, never called from a hot loop.
    pub fn register_stream(&mut self, mut spec: StreamSpec) -> Result<StreamId, RunError> {
        let handle = self.backend.lock().unwrap().open(0)?;

        let mut handler = IsoHandler::new(Arc::clone(&self.backend), handle, spec.direction, spec.channel);
        handler.init(spec.n_pkts, spec.max_packet_bytes, RecvMode::PacketPerBuffer, spec.speed, spec.irq_interval)?;

        for port in spec.ports.iter_mut() {
            port.set_enabled(true);
        }

        let dll_bandwidth_hz = match spec.direction {
            Direction::Receive => self.config.receive_dll_bw_hz,
            Direction::Transmit => self.config.transmit_dll_bw_hz,
        };

        let sp = Arc::new(StreamProcessor::with_transmit_params(
            spec.direction,
            self.config.nominal_rate,
            spec.data_block_size_quadlets,
            spec.ports,
            spec.capacity_frames,
            dll_bandwidth_hz,
            self.config.transmit_params,
        ));

        match spec.direction {
            Direction::Receive => handler.register_receive_client(SpReceiveClient(Arc::clone(&sp))),
            Direction::Transmit => handler.register_transmit_client(SpTransmitClient(Arc::clone(&sp))),
        }
        handler.prepare();

        let port_buffers = sp.ports().iter().map(|_| Mutex::new(vec![0f32; self.config.period_frames])).collect();

        self.handler_manager.register(handler);
        self.sp_manager.register(Arc::clone(&sp));

        let mut streams = self.streams.lock().unwrap();
        let id = StreamId(streams.len());
        streams.push(Some(StreamEntry { sp, direction: spec.direction, channel: spec.channel, port_buffers }));
        Ok(id)
    }

    /// Tears down a previously registered stream.
    pub fn unregister_stream(&mut self, id: StreamId) -> Result<(), RunError> {
        let entry = {
            let mut streams = self.streams.lock().unwrap();
            streams.get_mut(id.0).and_then(Option::take).ok_or(RunError::NoSuchStream)?
        };

        self.sp_manager.unregister(&entry.sp);
        if let Some(handler) = self.handler_manager.unregister(entry.direction, entry.channel) {
            handler.close();
        }
        Ok(())
    }

    /// Copy `data` into a transmit stream's port buffer, ahead of the
    /// next [`Engine::transfer`] call.
    pub fn write_port(&self, id: StreamId, port_index: usize, data: &[f32]) -> Result<(), RunError> {
        let streams = self.streams.lock().unwrap();
        let entry = streams.get(id.0).and_then(Option::as_ref).ok_or(RunError::NoSuchStream)?;
        let mut buffer = entry.port_buffers.get(port_index).ok_or(RunError::NoSuchStream)?.lock().unwrap();
        if buffer.len() != data.len() {
            return Err(RunError::PortBufferLength { expected: buffer.len(), got: data.len() });
        }
        buffer.copy_from_slice(data);
        Ok(())
    }

    /// Copy a receive stream's port buffer, populated by the most recent
    /// [`Engine::transfer`] call, into `out`.
    pub fn read_port(&self, id: StreamId, port_index: usize, out: &mut [f32]) -> Result<(), RunError> {
        let streams = self.streams.lock().unwrap();
        let entry = streams.get(id.0).and_then(Option::as_ref).ok_or(RunError::NoSuchStream)?;
        let buffer = entry.port_buffers.get(port_index).ok_or(RunError::NoSuchStream)?.lock().unwrap();
        if buffer.len() != out.len() {
            return Err(RunError::PortBufferLength { expected: buffer.len(), got: out.len() });
        }
        out.copy_from_slice(&buffer);
        Ok(())
    }

    /// Enables every registered
    /// handler and spawns the iso poll threads and the period scheduler.
    pub fn start(&mut self, start_cycle: i32) -> Result<(), RunError> {
        let handler_rt_priority = self.config.rt_priority.map(|base| (base, 0));
        self.handler_manager.start(handler_rt_priority);

        {
            let streams = self.streams.lock().unwrap();
            let (now_ctr, _) = self.backend.lock().unwrap().read_cycle_timer()?;
            let now = now_ctr.to_tick();
            for entry in streams.iter().flatten() {
                self.handler_manager.enable(entry.direction, entry.channel, start_cycle, PREBUFFERS)?;
                entry.sp.schedule_transition(SpState::WaitingForStream, now);
            }
        }

        if self.config.watchdog_enabled {
            *self.watchdog.lock().unwrap() = Some(Watchdog::spawn(self.config.watchdog_interval_us));
        }
        let watchdog_heartbeat = self.watchdog.lock().unwrap().as_ref().map(Watchdog::heartbeat);

        let period_gate = Arc::clone(&self.period_gate);
        self.sp_manager.start(self.config.rt_priority, move |xrun| {
            if let Some(heartbeat) = &watchdog_heartbeat {
                heartbeat.beat();
            }
            period_gate.signal(xrun);
        });

        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// On a bus reset: disables every running iso
    /// handler and forces every registered stream processor back to
    /// `WaitingForStream`. The client sees this surface as a single
    /// reported xrun on the next period; re-synchronisation resumes
    /// itself once the transport starts delivering valid packets again
    /// and `start` has re-enabled the affected handlers.
    pub fn handle_bus_reset(&self) {
        self.handler_manager.handle_bus_reset();
        let streams = self.streams.lock().unwrap();
        for entry in streams.iter().flatten() {
            entry.sp.handle_bus_reset();
        }
    }

    /// Re-enable every registered handler, without restarting the iso
    /// poll threads or the period scheduler. Use this to recover
    /// from [`Engine::handle_bus_reset`]; use [`Engine::start`] only for
    /// the engine's initial start.
    pub fn re_enable_all(&self, start_cycle: i32) -> Result<(), RunError> {
        let streams = self.streams.lock().unwrap();
        let (now_ctr, _) = self.backend.lock().unwrap().read_cycle_timer()?;
        let now = now_ctr.to_tick();
        for entry in streams.iter().flatten() {
            self.handler_manager.enable(entry.direction, entry.channel, start_cycle, PREBUFFERS)?;
            entry.sp.schedule_transition(SpState::WaitingForStream, now);
        }
        Ok(())
    }

    /// Engine-wide shutdown: joins every worker thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.sp_manager.stop();
        self.handler_manager.stop();
        self.period_gate.mark_stopped();
        if let Some(watchdog) = self.watchdog.lock().unwrap().take() {
            watchdog.stop();
        }
    }

    /// Blocks until the next period is
    /// ready, or `timeout` elapses (treated the same as a reported
    /// xrun — a client not woken in time can't have made its deadline).
    pub fn wait_period(&self, timeout: Duration) -> PeriodOutcome {
        self.period_gate.wait(&self.last_period_seen, timeout)
    }

    /// The period-aligned exchange across
    /// every registered stream processor and its enabled ports, using
    /// the buffers most recently set by `write_port` (for transmit
    /// streams) and populating the buffers `read_port` will next read
    /// (for receive streams).
    pub fn transfer(&self) -> Result<(), RunError> {
        let streams = self.streams.lock().unwrap();
        for entry in streams.iter().flatten() {
            let result = match entry.direction {
                Direction::Transmit => {
                    let guards: Vec<_> = entry.port_buffers.iter().map(|b| b.lock().unwrap()).collect();
                    let sources: Vec<PortSamples> = guards.iter().map(|g| PortSamples::Float(g.as_slice())).collect();
                    let (ts, _) = entry.sp.get_tail_ts();
                    entry.sp.put_frames(self.config.period_frames, ts, &sources)
                }
                Direction::Receive => {
                    let mut guards: Vec<_> = entry.port_buffers.iter().map(|b| b.lock().unwrap()).collect();
                    let mut sinks: Vec<PortSamplesMut> =
                        guards.iter_mut().map(|g| PortSamplesMut::Float(g.as_mut_slice())).collect();
                    entry.sp.get_frames(self.config.period_frames, &mut sinks).map(|_| ())
                }
            };

            // A stream processor still climbing WaitingForStream ->
            // DryRunning -> WaitingForStreamEnable -> Running just sits
            // out this period's transfer rather than failing the whole
            // engine; every other state propagates as a real error.
            match result {
                Ok(()) | Err(StreamError::NotTransferable(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl<B> Drop for Engine<B>
where
    B: TransportBackend + Send + 'static,
    B::Handle: Send,
{
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffado_core::codec::TransmitParams;
    use ffado_proto::port::{DataType, Port, PortKind, PortPosition};
    use ffado_proto::SampleRate;
    use ffado_sim::LoopbackTransport;

    fn test_config() -> EngineConfig {
        EngineConfig {
            period_frames: 64,
            nominal_rate: SampleRate::Hz48000,
            receive_dll_bw_hz: 0.1,
            transmit_dll_bw_hz: 0.1,
            transmit_params: TransmitParams::default(),
            snoop_mode: false,
            rt_priority: None,
            watchdog_interval_us: 2_000,
            watchdog_enabled: false,
        }
    }

    fn stereo_spec(direction: Direction, channel: u8) -> StreamSpec {
        let ports = (0..2)
            .map(|i| {
                Port::new(
                    &format!("analog-{}", i + 1),
                    direction,
                    PortKind::Audio,
                    DataType::Float,
                    4,
                    256,
                    PortPosition { quadlet: i as u16, slot: None },
                )
            })
            .collect();

        StreamSpec {
            direction,
            channel,
            data_block_size_quadlets: 2,
            ports,
            capacity_frames: 4096,
            speed: Speed::S400,
            n_pkts: 8,
            max_packet_bytes: 2048,
            irq_interval: 1,
        }
    }

    #[test]
    fn register_stream_sizes_port_buffers_to_period_frames() {
        let mut engine = Engine::new(LoopbackTransport::new(), test_config());
        let xmit_id = engine.register_stream(stereo_spec(Direction::Transmit, 5)).unwrap();

        let exact = vec![0f32; 64];
        engine.write_port(xmit_id, 0, &exact).unwrap();

        engine.unregister_stream(xmit_id).unwrap();
    }

    #[test]
    fn write_port_rejects_wrong_length() {
        let mut engine = Engine::new(LoopbackTransport::new(), test_config());
        let xmit_id = engine.register_stream(stereo_spec(Direction::Transmit, 7)).unwrap();

        let wrong = vec![0f32; 4];
        let err = engine.write_port(xmit_id, 0, &wrong).unwrap_err();
        assert!(matches!(err, RunError::PortBufferLength { expected: 64, got: 4 }));
    }

    #[test]
    fn unregister_unknown_stream_is_an_error() {
        let mut engine: Engine<LoopbackTransport> = Engine::new(LoopbackTransport::new(), test_config());
        let err = engine.unregister_stream(StreamId(42)).unwrap_err();
        assert!(matches!(err, RunError::NoSuchStream));
    }
}
