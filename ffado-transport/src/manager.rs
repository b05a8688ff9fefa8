//! `HandlerManager`: the poll-driven scheduler and lock-free shadow-map
//! protocol, grounded in
//! libffado's `libieee1394/IsoHandlerManager.{h,cpp}`:
//! the per-direction `IsoTask` runnable, its shadow `pollfd`/`IsoHandler*`
//! arrays sized by a compile-time maximum, `requestShadowMapUpdate` as a
//! lock-free request, and `signalActivityTransmit`/`signalActivityReceive`.

use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};

use ffado_proto::Direction;

use crate::backend::TransportBackend;
use crate::handler::{HandlerState, IsoHandler};
use crate::error::TransportError;

/// `ISOHANDLERMANAGER_MAX_ISO_HANDLERS_PER_PORT` in the original — the
/// shadow array's fixed capacity.
pub const MAX_HANDLERS_PER_DIRECTION: usize = 64;

/// Runaway guard: this many successive sub-100us
/// iterations and the loop is considered wedged.
const RUNAWAY_ITERATIONS: u32 = 10_000;
const RUNAWAY_WINDOW: Duration = Duration::from_micros(100);

/// A lock-free-postable activity signal: wakes a sleeping direction
/// thread so it can re-check client readiness without busy-looping.
#[derive(Default)]
struct ActivitySemaphore {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl ActivitySemaphore {
    fn post(&self) {
        let mut posted = self.mutex.lock().unwrap();
        *posted = true;
        self.condvar.notify_one();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let posted = self.mutex.lock().unwrap();
        let (mut posted, _) = self.condvar.wait_timeout_while(posted, timeout, |p| !*p).unwrap();
        *posted = false;
    }
}

struct ShadowEntry {
    raw_fd: RawFd,
    index: usize,
}

struct DirectionState<B: TransportBackend> {
    direction: Direction,
    handlers: Mutex<Vec<IsoHandler<B>>>,
    pending_updates: AtomicUsize,
    activity: ActivitySemaphore,
    stop: AtomicBool,
    poll_timeout_ms: u32,
}

impl<B: TransportBackend> DirectionState<B> {
    fn new(direction: Direction, poll_timeout_ms: u32) -> Self {
        DirectionState {
            direction,
            handlers: Mutex::new(Vec::new()),
            pending_updates: AtomicUsize::new(0),
            activity: ActivitySemaphore::default(),
            stop: AtomicBool::new(false),
            poll_timeout_ms,
        }
    }

    /// Lock-free from the hot loop's point of view: the loop only ever
    /// reads this counter and decrements it after applying an update.
    fn request_shadow_update(&self) {
        self.pending_updates.fetch_add(1, Ordering::Release);
    }

    fn signal_activity(&self) {
        self.activity.post();
    }
}

/// Owns the set of handlers, the two direction threads, and the shadow
/// map update protocol.
pub struct HandlerManager<B: TransportBackend + Send + 'static>
where
    B::Handle: Send,
{
    rx: Arc<DirectionState<B>>,
    tx: Arc<DirectionState<B>>,
    rx_thread: Option<std::thread::JoinHandle<()>>,
    tx_thread: Option<std::thread::JoinHandle<()>>,
}

impl<B: TransportBackend + Send + 'static> HandlerManager<B>
where
    B::Handle: Send,
{
    pub fn new(poll_timeout_ms: u32) -> Self {
        HandlerManager {
            rx: Arc::new(DirectionState::new(Direction::Receive, poll_timeout_ms)),
            tx: Arc::new(DirectionState::new(Direction::Transmit, poll_timeout_ms)),
            rx_thread: None,
            tx_thread: None,
        }
    }

    fn state_for(&self, direction: Direction) -> &Arc<DirectionState<B>> {
        match direction {
            Direction::Receive => &self.rx,
            Direction::Transmit => &self.tx,
        }
    }

    /// Register an enabled handler. Takes the coarse lock outside the hot
    /// loop; the hot loop only
    /// ever reads the shadow map, rebuilt lazily from this vector.
    pub fn register(&self, handler: IsoHandler<B>) {
        let state = self.state_for(handler.direction());
        state.handlers.lock().unwrap().push(handler);
        state.request_shadow_update();
        state.signal_activity();
    }

    /// Remove and return the first handler on `channel`/`direction`, for
    /// re-registration elsewhere or teardown.
    pub fn unregister(&self, direction: Direction, channel: u8) -> Option<IsoHandler<B>> {
        let state = self.state_for(direction);
        let mut handlers = state.handlers.lock().unwrap();
        let pos = handlers.iter().position(|h| h.channel() == channel)?;
        let handler = handlers.remove(pos);
        drop(handlers);
        state.request_shadow_update();
        Some(handler)
    }

    /// Enable the handler on `channel`/`direction`.
    pub fn enable(&self, direction: Direction, channel: u8, start_cycle: i32, prebuffers: u32) -> Result<(), TransportError> {
        let state = self.state_for(direction);
        let mut handlers = state.handlers.lock().unwrap();
        let handler = handlers
            .iter_mut()
            .find(|h| h.channel() == channel)
            .ok_or(TransportError::NoChannelAvailable)?;
        handler.enable(start_cycle, prebuffers)?;
        drop(handlers);
        state.request_shadow_update();
        state.signal_activity();
        Ok(())
    }

    pub fn disable(&self, direction: Direction, channel: u8) -> Result<(), TransportError> {
        let state = self.state_for(direction);
        let mut handlers = state.handlers.lock().unwrap();
        if let Some(handler) = handlers.iter_mut().find(|h| h.channel() == channel) {
            handler.disable()?;
        }
        Ok(())
    }

    /// Notify every running handler, in both directions, of a bus reset
    ///: each disables itself, and
    /// the next shadow map rebuild excludes it until the caller
    /// re-enables it via [`HandlerManager::enable`].
    pub fn handle_bus_reset(&self) {
        for state in [&self.rx, &self.tx] {
            let mut handlers = state.handlers.lock().unwrap();
            for handler in handlers.iter_mut().filter(|h| h.state() == HandlerState::Running) {
                handler.handle_bus_reset();
            }
            drop(handlers);
            state.request_shadow_update();
        }
    }

    pub fn request_shadow_update(&self, direction: Direction) {
        self.state_for(direction).request_shadow_update();
    }

    pub fn signal_activity(&self, direction: Direction) {
        self.state_for(direction).signal_activity();
    }

    /// Spawn the two direction threads. `rt_priority` is the base budget
    /// (`manager_rt_prio = base + delta_iso + delta_dir`); `None` leaves
    /// the threads on the default scheduler.
    pub fn start(&mut self, rt_priority: Option<(i32, i32)>) {
        let rx = Arc::clone(&self.rx);
        let rx_prio = rt_priority.map(|(base, delta_iso)| base + delta_iso);
        self.rx_thread = Some(std::thread::spawn(move || {
            ffado_util::thread::set_name("ffado-iso-rx");
            if let Some(prio) = rx_prio {
                ffado_util::thread::set_realtime_priority(prio);
            }
            run_direction_loop(rx);
        }));

        let tx = Arc::clone(&self.tx);
        let tx_prio = rt_priority.map(|(base, delta_iso)| base + delta_iso);
        self.tx_thread = Some(std::thread::spawn(move || {
            ffado_util::thread::set_name("ffado-iso-tx");
            if let Some(prio) = tx_prio {
                ffado_util::thread::set_realtime_priority(prio);
            }
            run_direction_loop(tx);
        }));
    }

    /// Request both direction threads to stop and join them. Each thread
    /// is woken from `poll()` by an activity signal within one
    /// `poll_timeout`.
    pub fn stop(&mut self) {
        self.rx.stop.store(true, Ordering::Relaxed);
        self.tx.stop.store(true, Ordering::Relaxed);
        self.rx.signal_activity();
        self.tx.signal_activity();

        if let Some(join) = self.rx_thread.take() {
            let _ = join.join();
        }
        if let Some(join) = self.tx_thread.take() {
            let _ = join.join();
        }
    }
}

impl<B: TransportBackend + Send + 'static> Drop for HandlerManager<B>
where
    B::Handle: Send,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// A handler is pollable iff its client can currently make progress
///: receive handlers need buffer space to write
/// into, transmit handlers need more frames to send. `IsoHandler` doesn't
/// know its client's buffer state directly (that lives in
/// `ffado_core::StreamProcessor`), so readiness here is approximated by
/// "running and has a client registered"; the finer-grained
/// can_produce/consume check happens inside the client's callback, which
/// simply declines work (returns `Defer`) when it isn't ready. This keeps
/// `ffado-transport` free of a dependency on `ffado-core`.
fn is_pollable<B: TransportBackend>(handler: &IsoHandler<B>) -> bool {
    handler.state() == HandlerState::Running && handler.is_in_use()
}

fn run_direction_loop<B: TransportBackend>(state: Arc<DirectionState<B>>) {
    let mut shadow: Vec<ShadowEntry> = Vec::new();
    let mut runaway_count: u32 = 0;
    let mut last_iter = Instant::now();

    while !state.stop.load(Ordering::Relaxed) {
        if state.pending_updates.swap(0, Ordering::AcqRel) > 0 {
            rebuild_shadow_map(&state, &mut shadow);
        }

        if shadow.is_empty() {
            state.activity.wait_timeout(Duration::from_millis(state.poll_timeout_ms as u64));
            continue;
        }

        let handlers = state.handlers.lock().unwrap();
        let pollable: Vec<bool> = shadow
            .iter()
            .map(|entry| handlers.get(entry.index).map(is_pollable).unwrap_or(false))
            .collect();
        drop(handlers);

        if !pollable.iter().any(|&p| p) {
            state.activity.wait_timeout(Duration::from_millis(state.poll_timeout_ms as u64));
            continue;
        }

        let mut poll_fds: Vec<PollFd> = shadow
            .iter()
            .zip(pollable.iter())
            .map(|(entry, &ready)| {
                let flags = if ready { PollFlags::POLLIN } else { PollFlags::empty() };
                let fd = unsafe { BorrowedFd::borrow_raw(entry.raw_fd) };
                PollFd::new(fd, flags)
            })
            .collect();

        let timeout = PollTimeout::from(state.poll_timeout_ms as u16);
        match nix::poll::poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            Err(nix::Error::EINTR) => continue,
            Err(err) => {
                log::error!("handler manager ({:?}): poll() failed: {err}", state.direction);
                break;
            }
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_iter);
        last_iter = now;
        if elapsed < RUNAWAY_WINDOW {
            runaway_count += 1;
            if runaway_count >= RUNAWAY_ITERATIONS {
                log::error!(
                    "handler manager ({:?}): {} iterations under {:?} apart, runaway guard tripped",
                    state.direction,
                    runaway_count,
                    RUNAWAY_WINDOW
                );
                break;
            }
        } else {
            runaway_count = 0;
        }

        for (entry, pfd) in shadow.iter().zip(poll_fds.iter()) {
            let revents = match pfd.revents() {
                Some(revents) => revents,
                None => continue,
            };

            if revents.contains(PollFlags::POLLERR) || revents.contains(PollFlags::POLLHUP) {
                log::warn!("handler manager ({:?}): POLLERR/POLLHUP on index {}", state.direction, entry.index);
                continue;
            }

            if revents.contains(PollFlags::POLLIN) {
                let mut handlers = state.handlers.lock().unwrap();
                if let Some(handler) = handlers.get_mut(entry.index) {
                    if let Err(err) = iterate_one(handler) {
                        log::error!("handler manager ({:?}): iterate failed: {err}", state.direction);
                    }
                }
            }
        }
    }
}

fn iterate_one<B: TransportBackend>(handler: &mut IsoHandler<B>) -> Result<bool, TransportError> {
    handler.iterate()
}

fn rebuild_shadow_map<B: TransportBackend>(state: &DirectionState<B>, shadow: &mut Vec<ShadowEntry>) {
    let handlers = state.handlers.lock().unwrap();
    shadow.clear();
    for (index, handler) in handlers.iter().enumerate().take(MAX_HANDLERS_PER_DIRECTION) {
        if handler.state() == HandlerState::Running {
            shadow.push(ShadowEntry { raw_fd: handler.fd(), index });
        }
    }
}
