//! `StreamProcessorManager`: sync-source nomination and the period
//! scheduler, grounded in
//! the cycle-timer-to-host-deadline translation `ffado_util::clock`
//! provides, and composes a transport, worker threads, and a client
//! callback behind one top-level `run()` call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ffado_proto::time::Tick;
use ffado_proto::Direction;
use ffado_transport::backend::TransportBackend;
use ffado_util::clock::{sleep_until, ClockCorrelator, HostInstant};

use crate::stream::StreamProcessor;

/// How long the period scheduler waits for `can_transfer` to go true
/// before counting an xrun.
const TRANSFER_READY_TIMEOUT: Duration = Duration::from_millis(2);

pub struct StreamProcessorManager<B: TransportBackend> {
    backend: Arc<Mutex<B>>,
    sps: Arc<Mutex<Vec<Arc<StreamProcessor>>>>,
    period_frames: usize,
    stop: Arc<AtomicBool>,
    xrun_count: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl<B: TransportBackend + Send + 'static> StreamProcessorManager<B> {
    pub fn new(backend: Arc<Mutex<B>>, period_frames: usize) -> Self {
        StreamProcessorManager {
            backend,
            sps: Arc::new(Mutex::new(Vec::new())),
            period_frames,
            stop: Arc::new(AtomicBool::new(false)),
            xrun_count: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    pub fn register(&self, sp: Arc<StreamProcessor>) {
        self.sps.lock().unwrap().push(sp);
    }

    /// Drop `sp` from the sync-source/readiness set. Structural, safe to
    /// call with the scheduler
    /// running since the registered-SP vector is snapshotted once per
    /// period rather than held across the sleep.
    pub fn unregister(&self, sp: &Arc<StreamProcessor>) {
        self.sps.lock().unwrap().retain(|registered| !Arc::ptr_eq(registered, sp));
    }

    pub fn xrun_count(&self) -> u64 {
        self.xrun_count.load(Ordering::Relaxed)
    }

    /// Nominates exactly one as the sync source (by default the first
    /// transmit SP; if none, the first receive SP).
    pub fn sync_source(&self) -> Option<Arc<StreamProcessor>> {
        let sps = self.sps.lock().unwrap();
        sps.iter()
            .find(|sp| sp.direction() == Direction::Transmit)
            .or_else(|| sps.iter().find(|sp| sp.direction() == Direction::Receive))
            .cloned()
    }

    /// Spawn the period scheduler thread. `client_period_callback` is
    /// invoked once per period with whether this period is an xrun
    ///; on `false` it is expected to call `get_frames`/
    /// `put_frames` on whichever SPs it owns.
    pub fn start(&mut self, rt_priority: Option<i32>, mut client_period_callback: impl FnMut(bool) + Send + 'static) {
        let backend = Arc::clone(&self.backend);
        let sps = Arc::clone(&self.sps);
        let period_frames = self.period_frames;
        let stop = Arc::clone(&self.stop);
        let xrun_count = Arc::clone(&self.xrun_count);

        self.thread = Some(std::thread::spawn(move || {
            ffado_util::thread::set_name("ffado-period");
            if let Some(prio) = rt_priority {
                ffado_util::thread::set_realtime_priority(prio);
            }
            run_period_loop(backend, sps, period_frames, stop, xrun_count, &mut client_period_callback);
        }));
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.thread.take() {
            let _ = join.join();
        }
    }
}

impl<B: TransportBackend + Send + 'static> Drop for StreamProcessorManager<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn nominate(sps: &[Arc<StreamProcessor>]) -> Option<Arc<StreamProcessor>> {
    sps.iter()
        .find(|sp| sp.direction() == Direction::Transmit)
        .or_else(|| sps.iter().find(|sp| sp.direction() == Direction::Receive))
        .cloned()
}

fn run_period_loop<B: TransportBackend>(
    backend: Arc<Mutex<B>>,
    sps: Arc<Mutex<Vec<Arc<StreamProcessor>>>>,
    period_frames: usize,
    stop: Arc<AtomicBool>,
    xrun_count: Arc<AtomicU64>,
    client_period_callback: &mut dyn FnMut(bool),
) {
    let mut correlator = match backend.lock().unwrap().read_cycle_timer() {
        Ok((ctr, host_us)) => ClockCorrelator::anchor(ctr.to_tick(), HostInstant::from_micros(host_us)),
        Err(err) => {
            log::error!("period scheduler: initial read_cycle_timer failed: {err}, using a zero anchor");
            ClockCorrelator::anchor(Tick::zero(), HostInstant::from_micros(0))
        }
    };

    while !stop.load(Ordering::Relaxed) {
        let sps_snapshot: Vec<Arc<StreamProcessor>> = sps.lock().unwrap().clone();
        let Some(sync_sp) = nominate(&sps_snapshot) else {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        };

        if let Ok((ctr, host_us)) = backend.lock().unwrap().read_cycle_timer() {
            correlator.reanchor(ctr.to_tick(), HostInstant::from_micros(host_us));
        }

        let (head_ts, _) = sync_sp.get_head_ts();
        let wakeup_tick = head_ts.add_ticks(sync_sp.sync_delay_ticks());
        let deadline = correlator.project(wakeup_tick);

        if let Err(err) = sleep_until(deadline) {
            log::warn!("period scheduler: sleep_until failed: {err}");
        }

        if stop.load(Ordering::Relaxed) {
            break;
        }

        let ready = wait_for_all_ready(&sps_snapshot, period_frames, TRANSFER_READY_TIMEOUT);
        if !ready {
            xrun_count.fetch_add(1, Ordering::Relaxed);
            log::warn!("period scheduler: xrun, not all stream processors ready after {:?}", TRANSFER_READY_TIMEOUT);
            client_period_callback(true);
            continue;
        }

        client_period_callback(false);
    }
}

/// Verify every SP satisfies `can_transfer(period_frames)`. If not
/// within the timeout, count as an xrun.
fn wait_for_all_ready(sps: &[Arc<StreamProcessor>], period_frames: usize, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if sps.iter().all(|sp| sp.can_transfer(period_frames)) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffado_proto::port::{DataType, Port, PortKind, PortPosition};
    use ffado_proto::SampleRate;
    use std::sync::atomic::AtomicUsize;

    struct NullBackend;

    impl TransportBackend for NullBackend {
        type Handle = u32;

        fn open(&mut self, _port: u32) -> Result<Self::Handle, ffado_transport::error::TransportError> {
            Ok(0)
        }
        fn close(&mut self, _handle: Self::Handle) {}
        fn recv_init(
            &mut self,
            _h: Self::Handle,
            _n: usize,
            _m: usize,
            _c: u8,
            _mode: ffado_transport::backend::RecvMode,
            _irq: u32,
        ) -> Result<(), ffado_transport::error::TransportError> {
            Ok(())
        }
        fn xmit_init(
            &mut self,
            _h: Self::Handle,
            _n: usize,
            _m: usize,
            _c: u8,
            _speed: ffado_transport::backend::Speed,
            _irq: u32,
        ) -> Result<(), ffado_transport::error::TransportError> {
            Ok(())
        }
        fn start(&mut self, _h: Self::Handle, _c: i32, _p: u32) -> Result<(), ffado_transport::error::TransportError> {
            Ok(())
        }
        fn stop(&mut self, _h: Self::Handle) -> Result<(), ffado_transport::error::TransportError> {
            Ok(())
        }
        fn iterate_recv(
            &mut self,
            _h: Self::Handle,
            _recv: &mut dyn ffado_transport::backend::RecvCallback,
        ) -> Result<bool, ffado_transport::error::TransportError> {
            Ok(true)
        }
        fn iterate_xmit(
            &mut self,
            _h: Self::Handle,
            _xmit: &mut dyn ffado_transport::backend::XmitCallback,
        ) -> Result<bool, ffado_transport::error::TransportError> {
            Ok(true)
        }
        fn flush(&mut self, _h: Self::Handle) -> Result<(), ffado_transport::error::TransportError> {
            Ok(())
        }
        fn fd(&self, _h: Self::Handle) -> std::os::unix::io::RawFd {
            -1
        }
        fn read_cycle_timer(&self) -> Result<(ffado_proto::time::CycleTimer, u64), ffado_transport::error::TransportError> {
            Ok((ffado_proto::time::CycleTimer::from_tick(Tick::zero()), 0))
        }
        fn wake(&self, _h: Self::Handle) {}
    }

    fn make_sp(direction: Direction) -> Arc<StreamProcessor> {
        let port = Port::new(
            "p1",
            direction,
            PortKind::Audio,
            DataType::Float,
            4,
            256,
            PortPosition { quadlet: 0, slot: None },
        );
        Arc::new(StreamProcessor::new(direction, SampleRate::Hz48000, 1, vec![port], 4096, 1.0))
    }

    #[test]
    fn sync_source_prefers_transmit_sp() {
        let backend = Arc::new(Mutex::new(NullBackend));
        let manager = StreamProcessorManager::new(backend, 64);
        manager.register(make_sp(Direction::Receive));
        manager.register(make_sp(Direction::Transmit));

        let sync = manager.sync_source().unwrap();
        assert_eq!(sync.direction(), Direction::Transmit);
    }

    #[test]
    fn sync_source_falls_back_to_receive_sp() {
        let backend = Arc::new(Mutex::new(NullBackend));
        let manager = StreamProcessorManager::new(backend, 64);
        manager.register(make_sp(Direction::Receive));

        let sync = manager.sync_source().unwrap();
        assert_eq!(sync.direction(), Direction::Receive);
    }

    #[test]
    fn no_sync_source_when_empty() {
        let backend = Arc::new(Mutex::new(NullBackend));
        let manager: StreamProcessorManager<NullBackend> = StreamProcessorManager::new(backend, 64);
        assert!(manager.sync_source().is_none());
    }

    #[test]
    fn wait_for_all_ready_returns_true_immediately_when_satisfied() {
        let sp = make_sp(Direction::Transmit);
        sp.put_silence_frames(256, Tick::zero()).unwrap();
        let ready = wait_for_all_ready(&[sp], 64, Duration::from_millis(5));
        assert!(ready);
    }

    #[test]
    fn wait_for_all_ready_times_out_when_never_satisfied() {
        let sp = make_sp(Direction::Transmit);
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = &calls;
        let ready = wait_for_all_ready(&[sp], 4096, Duration::from_millis(5));
        assert!(!ready);
    }
}
