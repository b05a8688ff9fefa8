//! Engine configuration: an optional `ffado.toml` (current directory,
//! then the XDG config dir) loaded into environment variables ahead of
//! `StructOpt::from_args()`, so the CLI's `--help` stays the single
//! source of truth for every available knob.

use std::env;
use std::path::Path;

use serde::Deserialize;
use structopt::StructOpt;
use thiserror::Error;

use ffado_core::codec::TransmitParams;
use ffado_proto::{SampleRate, TICKS_PER_CYCLE};
use ffado_util::thread::MAX_RT_PRIORITY;

#[derive(Debug, Error)]
#[error("unsupported nominal rate: {0} Hz")]
pub struct UnsupportedRate(pub u32);

pub fn sample_rate_from_hz(hz: u32) -> Result<SampleRate, UnsupportedRate> {
    match hz {
        32_000 => Ok(SampleRate::Hz32000),
        44_100 => Ok(SampleRate::Hz44100),
        48_000 => Ok(SampleRate::Hz48000),
        88_200 => Ok(SampleRate::Hz88200),
        96_000 => Ok(SampleRate::Hz96000),
        176_400 => Ok(SampleRate::Hz176400),
        192_000 => Ok(SampleRate::Hz192000),
        other => Err(UnsupportedRate(other)),
    }
}

/// Contents of `ffado.toml`. Every field optional: anything left unset
/// falls through to the CLI flag's own default.
#[derive(Deserialize, Default)]
pub struct FileConfig {
    period_frames: Option<usize>,
    nominal_rate: Option<u32>,
    receive_dll_bw_hz: Option<f64>,
    transmit_dll_bw_hz: Option<f64>,
    transfer_delay_cycles: Option<u32>,
    min_cycles_before_presentation: Option<u32>,
    max_cycles_to_transmit_early: Option<u32>,
    snoop_mode: Option<bool>,
    rt_priority: Option<i32>,
    watchdog_interval_us: Option<u64>,
    watchdog_enabled: Option<bool>,
}

fn set_env<T: ToString>(name: &str, value: T) {
    env::set_var(name, value.to_string());
}

fn set_env_option<T: ToString>(name: &str, value: Option<T>) {
    if let Some(value) = value {
        set_env(name, value)
    }
}

pub fn load_into_env(config: &FileConfig) {
    set_env_option("FFADO_PERIOD_FRAMES", config.period_frames);
    set_env_option("FFADO_NOMINAL_RATE", config.nominal_rate);
    set_env_option("FFADO_RECEIVE_DLL_BW_HZ", config.receive_dll_bw_hz);
    set_env_option("FFADO_TRANSMIT_DLL_BW_HZ", config.transmit_dll_bw_hz);
    set_env_option("FFADO_TRANSFER_DELAY_CYCLES", config.transfer_delay_cycles);
    set_env_option("FFADO_MIN_CYCLES_BEFORE_PRESENTATION", config.min_cycles_before_presentation);
    set_env_option("FFADO_MAX_CYCLES_TO_TRANSMIT_EARLY", config.max_cycles_to_transmit_early);
    set_env_option("FFADO_SNOOP_MODE", config.snoop_mode);
    set_env_option("FFADO_RT_PRIORITY", config.rt_priority);
    set_env_option("FFADO_WATCHDOG_INTERVAL_US", config.watchdog_interval_us);
    set_env_option("FFADO_WATCHDOG_ENABLED", config.watchdog_enabled);
}

fn load_file(path: &Path) -> Option<FileConfig> {
    log::debug!("looking for config in {}", path.display());

    let contents = std::fs::read_to_string(path).ok()?;

    match toml::from_str(&contents) {
        Ok(config) => {
            log::info!("reading config from {}", path.display());
            Some(config)
        }
        Err(e) => {
            log::error!("error reading config: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn read() -> Option<FileConfig> {
    if let Some(config) = load_file(Path::new("ffado.toml")) {
        return Some(config);
    }

    let dirs = xdg::BaseDirectories::new().ok()?;
    if let Some(config) = dirs.find_config_file("ffado.toml") {
        return load_file(&config);
    }

    None
}

/// CLI-overridable knobs, in effect once
/// `config::load_into_env` has run. Values here are the "effective
/// value" defaults documented alongside each flag.
#[derive(StructOpt, Debug, Clone)]
pub struct ConfigOpt {
    /// Frames per client wakeup.
    #[structopt(long, env = "FFADO_PERIOD_FRAMES", default_value = "512")]
    pub period_frames: usize,

    /// Master sample rate in Hz; pins the SYT interval.
    #[structopt(long, env = "FFADO_NOMINAL_RATE", default_value = "48000")]
    pub nominal_rate: u32,

    /// DLL bandwidth on capture stream processors, in Hz.
    #[structopt(long, env = "FFADO_RECEIVE_DLL_BW_HZ", default_value = "0.1")]
    pub receive_dll_bw_hz: f64,

    /// DLL bandwidth on playback stream processors, in Hz.
    #[structopt(long, env = "FFADO_TRANSMIT_DLL_BW_HZ", default_value = "0.1")]
    pub transmit_dll_bw_hz: f64,

    /// Cycles SYT is advanced of transmit.
    #[structopt(long, env = "FFADO_TRANSFER_DELAY_CYCLES", default_value = "9")]
    pub transfer_delay_cycles: u32,

    /// Lateness tolerance, in cycles.
    #[structopt(long, env = "FFADO_MIN_CYCLES_BEFORE_PRESENTATION", default_value = "1")]
    pub min_cycles_before_presentation: u32,

    /// Earliness tolerance, in cycles.
    #[structopt(long, env = "FFADO_MAX_CYCLES_TO_TRANSMIT_EARLY", default_value = "2")]
    pub max_cycles_to_transmit_early: u32,

    /// If set, transmit stream processors act as receive stream
    /// processors, observing another host's playback stream instead of
    /// generating one.
    #[structopt(long, env = "FFADO_SNOOP_MODE")]
    pub snoop_mode: bool,

    /// Real-time priority to request for the engine's iso and period
    /// threads. Unset leaves threads on the default scheduler.
    #[structopt(long, env = "FFADO_RT_PRIORITY")]
    pub rt_priority: Option<i32>,

    /// Watchdog heartbeat interval, in microseconds.
    #[structopt(long, env = "FFADO_WATCHDOG_INTERVAL_US", default_value = "2000")]
    pub watchdog_interval_us: u64,

    /// Disable the watchdog thread entirely.
    #[structopt(long, env = "FFADO_WATCHDOG_ENABLED", default_value = "true")]
    pub watchdog_enabled: bool,
}

/// The config, resolved and validated: a `SampleRate` rather than a raw
/// Hz value, and `rt_priority` clamped to [`MAX_RT_PRIORITY`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub period_frames: usize,
    pub nominal_rate: SampleRate,
    pub receive_dll_bw_hz: f64,
    pub transmit_dll_bw_hz: f64,
    pub transmit_params: TransmitParams,
    pub snoop_mode: bool,
    pub rt_priority: Option<i32>,
    pub watchdog_interval_us: u64,
    pub watchdog_enabled: bool,
}

impl TryFrom<ConfigOpt> for EngineConfig {
    type Error = UnsupportedRate;

    fn try_from(opt: ConfigOpt) -> Result<Self, Self::Error> {
        Ok(EngineConfig {
            period_frames: opt.period_frames,
            nominal_rate: sample_rate_from_hz(opt.nominal_rate)?,
            receive_dll_bw_hz: opt.receive_dll_bw_hz,
            transmit_dll_bw_hz: opt.transmit_dll_bw_hz,
            transmit_params: TransmitParams {
                transfer_delay_ticks: opt.transfer_delay_cycles as i64 * TICKS_PER_CYCLE as i64,
                max_cycles_early: opt.max_cycles_to_transmit_early as i32,
                min_before_pres_cycles: opt.min_cycles_before_presentation as i32,
            },
            snoop_mode: opt.snoop_mode,
            rt_priority: opt.rt_priority.map(|p| p.clamp(1, MAX_RT_PRIORITY)),
            watchdog_interval_us: opt.watchdog_interval_us,
            watchdog_enabled: opt.watchdog_enabled,
        })
    }
}
