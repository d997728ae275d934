//! Core data model of the bridge.
//!
//! ## Overview
//!
//! - [`Frame`] is the unit of transport on the engine socket
//! - [`Snapshot`] is an immutable, ordered capture of the sliceable scene
//! - [`SliceRequest`] tracks one upload/compute cycle through [`RequestState`]
//! - [`SliceResult`] holds the layers and g-code assembled for one snapshot
//! - [`EngineState`] mirrors the supervised child process
//!
//! ## Usage Example
//!
//! ```rust
//! use slicebridge::types::{Frame, SettingValue, Transform};
//!
//! let frame = Frame::empty(0x0030_0000);
//! assert!(frame.is_empty());
//!
//! let moved = Transform::translation(5.0, 0.0, 0.0);
//! assert_eq!(moved.apply([0.0, 0.0, 0.0]), [5.0, 0.0, 0.0]);
//!
//! assert_eq!(SettingValue::from(true).to_wire_string(), "True");
//! ```

mod engine;
mod event;
mod frame;
mod request;
mod result;
mod settings;
mod snapshot;

pub use engine::{EnginePhase, EngineState};
pub use event::BridgeEvent;
pub use frame::Frame;
pub use request::{RequestState, SliceRequest};
pub use result::{Layer, Polygon, SliceResult, SliceTimings};
pub use settings::{SettingMap, SettingValue};
pub use snapshot::{Mesh, SceneObject, Snapshot, Transform};
