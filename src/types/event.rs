//! Host-facing bridge events

use std::sync::Arc;

use super::{EngineState, SliceResult};

/// Events delivered to host listeners on the control loop.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Engine progress in `[0, 1]`; `0.0` also signals a reset
    Progress(f32),
    /// A complete result was published
    ResultReady(Arc<SliceResult>),
    EngineStateChanged(EngineState),
    /// The scene had nothing to slice
    EmptyScene,
    /// Restart budget exhausted; no slicing until restart or resume
    EngineUnavailable { failures: u32 },
    /// A frame with a host-registered command id
    Extension { command_id: u32, payload: Arc<[u8]> },
}
