use thiserror::Error;

/// Errors surfaced by a [`crate::TransportBackend`] call. Composed upward
/// into `ffado_core`'s stream-processor errors and ultimately into
/// `ffado::RunError`, the same upward-composition chain used for every
/// other crate boundary in this workspace.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("opening iso context: {0}")]
    Open(std::io::Error),
    #[error("initialising receive context: {0}")]
    RecvInit(std::io::Error),
    #[error("initialising transmit context: {0}")]
    XmitInit(std::io::Error),
    #[error("starting iso context: {0}")]
    Start(std::io::Error),
    #[error("stopping iso context: {0}")]
    Stop(std::io::Error),
    #[error("polling iso context: {0}")]
    Iterate(std::io::Error),
    #[error("reading cycle timer: {0}")]
    ReadCycleTimer(std::io::Error),
    #[error("no free iso channel available")]
    NoChannelAvailable,
}
