//! Payload encoding for outbound commands and decoding for engine replies
//!
//! All scalars are little-endian. Every inbound parser checks bounds before
//! touching the buffer and reports a `Payload` error naming the command.

use std::sync::Arc;

use super::commands;
use crate::types::{Frame, Polygon, SettingMap, Transform};
use crate::{BridgeError, Result};

/// Decoded engine → host message.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    IdentifierReply(String),
    VersionReply(String),
    Progress(f32),
    ObjectPrintTime { object_id: u64, seconds: f32 },
    ObjectPrintMaterial { object_id: u64, mm: f32 },
    LayerInfo { layer_index: u32, polygon_count: u32 },
    Polygon(Polygon),
    GCodePrefix(Arc<[u8]>),
    GCodeLayer(Arc<[u8]>),
    GCodeSuffix(Arc<[u8]>),
    SliceFinished,
    /// A registered extension id, passed through undecoded
    Extension { command_id: u32, payload: Arc<[u8]> },
}

// ---------------------------------------------------------------------------
// Outbound

/// `key\0value\0` pairs in map order
pub fn settings(settings: &SettingMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in settings {
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(value.to_wire_string().as_bytes());
        out.push(0);
    }
    out
}

pub fn u32_value(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// 16 × f32, row-major
pub fn matrix(transform: &Transform) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    for v in transform.0 {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Raw f32 triples in the given order
pub fn f32_triples(points: &[[f32; 3]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 12);
    for p in points {
        for v in p {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Inbound

fn need(command_id: u32, data: &[u8], offset: usize, size: usize) -> Result<()> {
    if offset + size > data.len() {
        return Err(BridgeError::payload_error(
            commands::label(command_id),
            format!(
                "need {} bytes at offset {}, payload has {}",
                size,
                offset,
                data.len()
            ),
        ));
    }
    Ok(())
}

fn read_u32(command_id: u32, data: &[u8], offset: usize) -> Result<u32> {
    need(command_id, data, offset, 4)?;
    Ok(u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]))
}

fn read_u64(command_id: u32, data: &[u8], offset: usize) -> Result<u64> {
    need(command_id, data, offset, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    Ok(u64::from_le_bytes(bytes))
}

fn read_f32(command_id: u32, data: &[u8], offset: usize) -> Result<f32> {
    read_u32(command_id, data, offset).map(f32::from_bits)
}

fn read_text(command_id: u32, data: &[u8]) -> Result<String> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec())
        .map_err(|e| BridgeError::payload_error(commands::label(command_id), e.to_string()))
}

pub fn parse_identifier_reply(frame: &Frame) -> Result<EngineMessage> {
    read_text(frame.command_id, &frame.payload).map(EngineMessage::IdentifierReply)
}

pub fn parse_version_reply(frame: &Frame) -> Result<EngineMessage> {
    read_text(frame.command_id, &frame.payload).map(EngineMessage::VersionReply)
}

pub fn parse_progress(frame: &Frame) -> Result<EngineMessage> {
    let fraction = read_f32(frame.command_id, &frame.payload, 0)?;
    let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
    Ok(EngineMessage::Progress(fraction))
}

pub fn parse_object_print_time(frame: &Frame) -> Result<EngineMessage> {
    let object_id = read_u64(frame.command_id, &frame.payload, 0)?;
    let seconds = read_f32(frame.command_id, &frame.payload, 8)?;
    Ok(EngineMessage::ObjectPrintTime { object_id, seconds })
}

pub fn parse_object_print_material(frame: &Frame) -> Result<EngineMessage> {
    let object_id = read_u64(frame.command_id, &frame.payload, 0)?;
    let mm = read_f32(frame.command_id, &frame.payload, 8)?;
    Ok(EngineMessage::ObjectPrintMaterial { object_id, mm })
}

pub fn parse_layer_info(frame: &Frame) -> Result<EngineMessage> {
    let layer_index = read_u32(frame.command_id, &frame.payload, 0)?;
    let polygon_count = read_u32(frame.command_id, &frame.payload, 4)?;
    Ok(EngineMessage::LayerInfo { layer_index, polygon_count })
}

/// `u8 type, u32 count, count × (f32 x, f32 y)`
pub fn parse_polygon(frame: &Frame) -> Result<EngineMessage> {
    let id = frame.command_id;
    let data = &frame.payload;
    need(id, data, 0, 1)?;
    let type_tag = data[0];
    let count = read_u32(id, data, 1)? as usize;
    let body = count.checked_mul(8).ok_or_else(|| {
        BridgeError::payload_error(commands::label(id), format!("point count {} overflows", count))
    })?;
    need(id, data, 5, body)?;

    let mut points = Vec::with_capacity(count);
    for i in 0..count {
        let offset = 5 + i * 8;
        points.push([read_f32(id, data, offset)?, read_f32(id, data, offset + 4)?]);
    }
    Ok(EngineMessage::Polygon(Polygon { type_tag, points }))
}

pub fn parse_gcode_prefix(frame: &Frame) -> Result<EngineMessage> {
    Ok(EngineMessage::GCodePrefix(Arc::clone(&frame.payload)))
}

pub fn parse_gcode_layer(frame: &Frame) -> Result<EngineMessage> {
    Ok(EngineMessage::GCodeLayer(Arc::clone(&frame.payload)))
}

pub fn parse_gcode_suffix(frame: &Frame) -> Result<EngineMessage> {
    Ok(EngineMessage::GCodeSuffix(Arc::clone(&frame.payload)))
}

pub fn parse_slice_finished(_frame: &Frame) -> Result<EngineMessage> {
    Ok(EngineMessage::SliceFinished)
}

/// Pass-through for extension ids registered by the host
pub fn passthrough(frame: &Frame) -> Result<EngineMessage> {
    Ok(EngineMessage::Extension {
        command_id: frame.command_id,
        payload: Arc::clone(&frame.payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::payloads as build;
    use crate::types::SettingValue;

    #[test]
    fn settings_are_nul_separated_pairs_in_key_order() {
        let mut map = SettingMap::new();
        map.insert("layer_height".to_string(), SettingValue::Float(0.2));
        map.insert("adhesion".to_string(), SettingValue::Bool(true));
        assert_eq!(settings(&map), b"adhesion\0True\0layer_height\00.2\0".to_vec());
    }

    #[test]
    fn identity_matrix_is_64_bytes() {
        let bytes = matrix(&Transform::IDENTITY);
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.0f32.to_le_bytes());
    }

    #[test]
    fn triangle_is_36_bytes() {
        let bytes = f32_triples(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[12..16], &1.0f32.to_le_bytes());
    }

    #[test]
    fn polygon_parses() {
        let frame =
            Frame::new(commands::POLYGON, build::polygon(2, &[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]));
        match parse_polygon(&frame).unwrap() {
            EngineMessage::Polygon(p) => {
                assert_eq!(p.type_tag, 2);
                assert_eq!(p.points, vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
            }
            other => panic!("Expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn truncated_polygon_is_rejected() {
        let mut payload = build::polygon(0, &[[0.0, 0.0], [1.0, 0.0]]);
        payload.truncate(payload.len() - 3);
        let err = parse_polygon(&Frame::new(commands::POLYGON, payload)).unwrap_err();
        assert!(matches!(err, BridgeError::Payload { ref command, .. } if command == "Polygon"));
    }

    #[test]
    fn huge_point_count_does_not_allocate() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(parse_polygon(&Frame::new(commands::POLYGON, payload)).is_err());
    }

    #[test]
    fn estimates_parse() {
        let frame = Frame::new(commands::OBJECT_PRINT_TIME, build::object_estimate(42, 90.5));
        assert_eq!(
            parse_object_print_time(&frame).unwrap(),
            EngineMessage::ObjectPrintTime { object_id: 42, seconds: 90.5 }
        );
    }

    #[test]
    fn progress_is_clamped() {
        let frame = Frame::new(commands::PROGRESS, 1.5f32.to_le_bytes().to_vec());
        assert_eq!(parse_progress(&frame).unwrap(), EngineMessage::Progress(1.0));
    }

    #[test]
    fn replies_stop_at_nul() {
        let frame = Frame::new(commands::VERSION_REPLY, b"5.7.0\0".to_vec());
        assert_eq!(
            parse_version_reply(&frame).unwrap(),
            EngineMessage::VersionReply("5.7.0".to_string())
        );
    }
}
