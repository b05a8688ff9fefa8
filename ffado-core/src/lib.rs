//! Stateful, `std`-dependent behavior built on `ffado-proto`'s data model
//! and `ffado-transport`'s kernel ABI: the jitter buffer
//! and its DLL, the AMDTP codec, and the two state machines —
//! `StreamProcessor` and `StreamProcessorManager` — that turn a raw iso
//! handler's packets into a client's audio/MIDI stream.

pub mod buffer;
pub mod codec;
pub mod manager;
pub mod stream;

pub use buffer::{BufferError, Dll, TimestampedBuffer};
pub use codec::TransmitParams;
pub use manager::StreamProcessorManager;
pub use stream::{PortSamples, PortSamplesMut, SpReceiveClient, SpState, SpTransmitClient, StreamError, StreamProcessor};
