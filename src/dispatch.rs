//! Inbound command dispatch
//!
//! Maps engine → host command ids to payload decoders. The table is an open
//! set: hosts may register additional ids, and ids nobody registered are
//! logged and dropped.

use std::collections::HashMap;
use tracing::debug;

use crate::Result;
use crate::protocol::{EngineMessage, commands, payload};
use crate::types::Frame;

/// Payload decoder for one command id
pub type Decoder = fn(&Frame) -> Result<EngineMessage>;

/// A registered inbound command.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub name: &'static str,
    pub decode: Decoder,
}

/// Command id → decoder table
#[derive(Debug, Clone)]
pub struct DispatchTable {
    routes: HashMap<u32, Route>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl DispatchTable {
    /// A table with no routes
    pub fn empty() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Every engine → host command the bridge understands
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(
            commands::IDENTIFIER_REPLY,
            "IdentifierReply",
            payload::parse_identifier_reply,
        );
        table.register(commands::VERSION_REPLY, "VersionReply", payload::parse_version_reply);
        table.register(commands::PROGRESS, "Progress", payload::parse_progress);
        table.register(
            commands::OBJECT_PRINT_TIME,
            "ObjectPrintTime",
            payload::parse_object_print_time,
        );
        table.register(
            commands::OBJECT_PRINT_MATERIAL,
            "ObjectPrintMaterial",
            payload::parse_object_print_material,
        );
        table.register(commands::POLYGON, "Polygon", payload::parse_polygon);
        table.register(commands::LAYER_INFO, "LayerInfo", payload::parse_layer_info);
        table.register(commands::GCODE_PREFIX, "GCodePrefix", payload::parse_gcode_prefix);
        table.register(commands::GCODE_LAYER, "GCodeLayer", payload::parse_gcode_layer);
        table.register(commands::GCODE_SUFFIX, "GCodeSuffix", payload::parse_gcode_suffix);
        table.register(commands::SLICE_FINISHED, "SliceFinished", payload::parse_slice_finished);
        table
    }

    /// Add or replace a route. Returns the route it replaced.
    pub fn register(
        &mut self,
        command_id: u32,
        name: &'static str,
        decode: Decoder,
    ) -> Option<Route> {
        self.routes.insert(command_id, Route { name, decode })
    }

    /// Register an id whose frames are passed to the host undecoded
    pub fn register_extension(&mut self, command_id: u32, name: &'static str) -> Option<Route> {
        self.register(command_id, name, payload::passthrough)
    }

    pub fn route(&self, command_id: u32) -> Option<&Route> {
        self.routes.get(&command_id)
    }

    pub fn contains(&self, command_id: u32) -> bool {
        self.routes.contains_key(&command_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decode a frame.
    ///
    /// `None` for unknown ids, which are not an error. A decode failure of a
    /// known id is a protocol violation.
    pub fn decode(&self, frame: &Frame) -> Option<Result<EngineMessage>> {
        match self.routes.get(&frame.command_id) {
            Some(route) => Some((route.decode)(frame)),
            None => {
                debug!(
                    "Dropping unknown command {:#010x} ({} bytes)",
                    frame.command_id,
                    frame.payload.len()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BridgeError;
    use crate::test_utils::payloads;

    #[test]
    fn standard_table_covers_inbound_commands() {
        let table = DispatchTable::standard();
        for id in [
            commands::IDENTIFIER_REPLY,
            commands::VERSION_REPLY,
            commands::PROGRESS,
            commands::OBJECT_PRINT_TIME,
            commands::OBJECT_PRINT_MATERIAL,
            commands::POLYGON,
            commands::LAYER_INFO,
            commands::GCODE_PREFIX,
            commands::GCODE_LAYER,
            commands::GCODE_SUFFIX,
            commands::SLICE_FINISHED,
        ] {
            assert!(table.contains(id), "missing {}", commands::label(id));
        }
        // Outbound-only ids are not routed
        assert!(!table.contains(commands::PROCESS_MESH));
        assert!(!table.contains(commands::CANCEL));
        assert_eq!(table.len(), 11);
    }

    #[test]
    fn unknown_ids_are_dropped() {
        let table = DispatchTable::standard();
        assert!(table.decode(&Frame::new(0x00ff_0001, vec![1, 2, 3])).is_none());
    }

    #[test]
    fn known_ids_decode() {
        let table = DispatchTable::standard();
        let frame = Frame::new(commands::LAYER_INFO, payloads::layer_info(4, 2));
        assert_eq!(
            table.decode(&frame).unwrap().unwrap(),
            EngineMessage::LayerInfo { layer_index: 4, polygon_count: 2 }
        );
    }

    #[test]
    fn malformed_known_payload_is_violation() {
        let table = DispatchTable::standard();
        let err = table.decode(&Frame::new(commands::LAYER_INFO, vec![1])).unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Payload { .. }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn extensions_pass_through() {
        let mut table = DispatchTable::standard();
        assert!(table.register_extension(0x0040_0001, "OptimizedLayerData").is_none());
        let frame = Frame::new(0x0040_0001, vec![9, 9]);
        match table.decode(&frame).unwrap().unwrap() {
            EngineMessage::Extension { command_id, payload } => {
                assert_eq!(command_id, 0x0040_0001);
                assert_eq!(&payload[..], &[9, 9]);
            }
            other => panic!("Expected extension, got {other:?}"),
        }
        assert_eq!(table.route(0x0040_0001).unwrap().name, "OptimizedLayerData");
    }
}
