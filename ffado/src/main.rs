//! CLI entry point. Loads `ffado.toml` (if present) into the environment,
//! parses the resulting `ConfigOpt`, and runs a loopback demo stream pair
//! against `ffado-sim::LoopbackTransport` — this workspace carries no real
//! kernel iso binding (`ffado_transport::backend`'s module doc explains
//! why), so the loopback is what `ffado` actually runs.

use std::process::ExitCode;
use std::time::Duration;

use structopt::StructOpt;

use ffado::config::{self, ConfigOpt, EngineConfig};
use ffado::engine::{Engine, PeriodOutcome, StreamId, StreamSpec};
use ffado::RunError;
use ffado_proto::port::{DataType, Port, PortKind, PortPosition};
use ffado_proto::Direction;
use ffado_sim::LoopbackTransport;
use ffado_transport::backend::Speed;

/// iso channel the demo's transmit and receive streams loop back over.
const DEMO_CHANNEL: u8 = 0;
const DEMO_PORT_COUNT: usize = 2;
const DEMO_PERIODS: u32 = 200;

fn main() -> ExitCode {
    env_logger::init();

    if let Some(file_config) = config::read() {
        config::load_into_env(&file_config);
    }

    match run(ConfigOpt::from_args()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ffado: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(opt: ConfigOpt) -> Result<(), RunError> {
    let config = EngineConfig::try_from(opt)?;
    let period_frames = config.period_frames;
    let nominal_rate_hz = config.nominal_rate.hz();

    let snoop_mode = config.snoop_mode;
    let mut engine = Engine::new(LoopbackTransport::new(), config);

    // In snoop mode this host only observes another host's stream: bring up
    // the receive side only, and skip the transmit side we'd otherwise drive.
    let xmit_id = if snoop_mode {
        log::info!("ffado: snoop mode enabled, not registering a transmit stream");
        None
    } else {
        Some(engine.register_stream(demo_stream_spec(Direction::Transmit, period_frames))?)
    };
    let recv_id = engine.register_stream(demo_stream_spec(Direction::Receive, period_frames))?;

    engine.start(0)?;
    log::info!("ffado: running at {nominal_rate_hz} Hz, {period_frames} frames/period");

    if let Err(err) = run_periods(&engine, xmit_id, recv_id, period_frames) {
        engine.stop();
        return Err(err);
    }

    log::info!("ffado: stopping, {} xruns total", engine.xrun_count());
    engine.stop();
    if let Some(xmit_id) = xmit_id {
        engine.unregister_stream(xmit_id)?;
    }
    engine.unregister_stream(recv_id)?;
    Ok(())
}

/// Feed silence into the transmit stream and drain the receive stream
/// once per period, for `DEMO_PERIODS` periods — enough to demonstrate
/// `wait_period`/`transfer` without the demo running forever.
fn run_periods<B>(
    engine: &Engine<B>,
    xmit_id: Option<StreamId>,
    recv_id: StreamId,
    period_frames: usize,
) -> Result<(), RunError>
where
    B: ffado_transport::backend::TransportBackend + Send + 'static,
    B::Handle: Send,
{
    let silence = vec![0f32; period_frames];
    let mut scratch = vec![0f32; period_frames];

    for period in 0..DEMO_PERIODS {
        match engine.wait_period(Duration::from_millis(50)) {
            PeriodOutcome::EngineDown => break,
            PeriodOutcome::XRun => log::warn!("ffado: xrun at period {period}"),
            PeriodOutcome::Ok => {}
        }

        if let Some(xmit_id) = xmit_id {
            for port_index in 0..DEMO_PORT_COUNT {
                engine.write_port(xmit_id, port_index, &silence)?;
            }
        }

        engine.transfer()?;

        for port_index in 0..DEMO_PORT_COUNT {
            engine.read_port(recv_id, port_index, &mut scratch)?;
        }
    }

    Ok(())
}

fn demo_stream_spec(direction: Direction, period_frames: usize) -> StreamSpec {
    let ports = (0..DEMO_PORT_COUNT)
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
        channel: DEMO_CHANNEL,
        data_block_size_quadlets: DEMO_PORT_COUNT as u8,
        ports,
        capacity_frames: period_frames * 8,
        speed: Speed::S400,
        n_pkts: 8,
        max_packet_bytes: 2048,
        irq_interval: 1,
    }
}
