//! Wire frame type

use std::sync::Arc;

/// A typed, length-prefixed record on the engine socket.
///
/// Frames are the only unit of transport between the bridge and the engine.
/// The payload is shared (zero-copy via Arc) so a frame can be handed from
/// the reader task to the control loop without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opaque 32-bit tag from the command table
    pub command_id: u32,

    /// Raw payload bytes, interpreted per command id
    pub payload: Arc<[u8]>,
}

impl Frame {
    /// Create a new frame
    pub fn new(command_id: u32, payload: impl Into<Arc<[u8]>>) -> Self {
        Self { command_id, payload: payload.into() }
    }

    /// Create a tag-only frame with an empty payload
    pub fn empty(command_id: u32) -> Self {
        Self { command_id, payload: Arc::from(&[][..]) }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
