//! An in-memory loopback [`TransportBackend`](ffado_transport::backend::TransportBackend),
//! standing in for a real libraw1394/firewire-cdev binding: re-implementing the 1394 transport itself is explicitly
//! out of scope, and fabricating FFI bindings with no real kernel headers
//! to link against would mean inventing a fake dependency. This is
//! the one concrete backend the engine's own tests and CLI demo drive —
//! two handles opened on the same channel, one transmit and one receive,
//! mirror packets between them, acting as a "synthetic transport that
//! mirrors packets".

pub mod clock;
mod pipe;
pub mod transport;

pub use clock::SimClock;
pub use transport::{Handle, LoopbackTransport};
