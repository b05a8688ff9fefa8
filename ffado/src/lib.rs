//! Library surface behind the `ffado` binary: configuration resolution,
//! the top-level engine, and the error type `main` reports. Split out so
//! integration tests can drive the engine directly against
//! `ffado-sim::LoopbackTransport` without going through the CLI.

pub mod config;
pub mod engine;
pub mod error;

pub use config::{ConfigOpt, EngineConfig};
pub use engine::{Engine, PeriodOutcome, StreamId, StreamSpec};
pub use error::RunError;
