//! The transport seam.
//!
//! The client never encodes frames or touches sockets itself. A [`Protocol`]
//! implementation moves [`FromClient`] frames to the server and feeds
//! [`FromServer`] frames back through the handler given to [`Protocol::run`].

use std::sync::Arc;

use crate::error::ProtocolError;
use crate::message::{FromClient, FromServer};

/// Callback receiving every frame from the server, in delivery order.
pub type FrameHandler = Arc<dyn Fn(FromServer) + Send + Sync + 'static>;

/// An opaque buffer moved (rather than copied) alongside a frame by
/// transports that support it, such as worker message ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transferable(pub Arc<[u8]>);

impl From<Vec<u8>> for Transferable {
    fn from(bytes: Vec<u8>) -> Self {
        Transferable(bytes.into())
    }
}

/// A bidirectional, ordered frame transport.
///
/// All methods block. `run` is called once, on a dedicated fiber, and is
/// expected to keep delivering frames until the connection ends or the fiber
/// is interrupted.
pub trait Protocol: Send + Sync + 'static {
    /// Deliver incoming frames to `on_frame` until the connection ends.
    ///
    /// Returning an error fails every pending request with a defect.
    fn run(&self, on_frame: FrameHandler) -> Result<(), ProtocolError>;

    /// Send one frame to the server.
    fn send(&self, frame: FromClient, transferables: Vec<Transferable>) -> Result<(), ProtocolError>;

    /// Whether the server waits for an `Ack` after each chunk.
    fn supports_ack(&self) -> bool;

    /// Whether `send` honours transferables. When `false` they are dropped
    /// before sending.
    fn supports_transferables(&self) -> bool {
        false
    }
}
