//! `RunError`: the single aggregate error type `main` prints and turns
//! into an `ExitCode::FAILURE`, composed from each
//! lower crate's own error type via `derive_more::From`.

use derive_more::From;

use ffado_core::stream::StreamError;
use ffado_transport::error::TransportError;

use crate::config::UnsupportedRate;

#[derive(Debug, From)]
pub enum RunError {
    Transport(TransportError),
    Stream(StreamError),
    Config(UnsupportedRate),
    ReadConfig(std::io::Error),
    NoSuchStream,
    PortBufferLength { expected: usize, got: usize },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Transport(e) => write!(f, "transport error: {e}"),
            RunError::Stream(e) => write!(f, "stream processor error: {e}"),
            RunError::Config(e) => write!(f, "configuration error: {e}"),
            RunError::ReadConfig(e) => write!(f, "error reading config: {e}"),
            RunError::NoSuchStream => write!(f, "no such registered stream"),
            RunError::PortBufferLength { expected, got } => {
                write!(f, "port buffer length mismatch: expected {expected}, got {got}")
            }
        }
    }
}
