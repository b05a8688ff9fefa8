pub mod backend;
pub mod error;
pub mod handler;
pub mod manager;

pub use backend::{
    Disposition, RecvCallback, RecvMode, Speed, TransportBackend, XmitCallback,
};
pub use error::TransportError;
pub use handler::{HandlerState, IsoHandler};
pub use manager::HandlerManager;
