//! Command id table
//!
//! Ids are stable and compatibility-critical; the engine is order-sensitive
//! and matches them bit for bit. The table is an open set: engines emit
//! diagnostic frames this bridge does not know, and those are ignored.

pub const IDENTIFIER_REQUEST: u32 = 0x0010_0000;
pub const IDENTIFIER_REPLY: u32 = 0x0010_0001;
pub const VERSION_REQUEST: u32 = 0x0010_0002;
pub const VERSION_REPLY: u32 = 0x0010_0003;
pub const SETTING: u32 = 0x0010_0004;

pub const OBJECT_LIST: u32 = 0x0020_0000;
pub const MESH_LIST: u32 = 0x0020_0001;
pub const VERTEX_LIST: u32 = 0x0020_0002;
pub const NORMAL_LIST: u32 = 0x0020_0003;

pub const PROCESS_MESH: u32 = 0x0030_0000;
pub const PROGRESS: u32 = 0x0030_0001;
pub const OBJECT_MATRIX: u32 = 0x0030_0002;
pub const OBJECT_COUNT: u32 = 0x0030_0003;
pub const OBJECT_PRINT_TIME: u32 = 0x0030_0004;
pub const OBJECT_PRINT_MATERIAL: u32 = 0x0030_0005;
pub const POLYGON: u32 = 0x0030_0006;
pub const LAYER_INFO: u32 = 0x0030_0007;
pub const SLICE_FINISHED: u32 = 0x0030_0008;
pub const CANCEL: u32 = 0x0030_0009;
pub const GCODE_PREFIX: u32 = 0x0030_000A;
pub const GCODE_LAYER: u32 = 0x0030_000B;
pub const GCODE_SUFFIX: u32 = 0x0030_000C;

/// Human-readable name for logging
pub fn name(command_id: u32) -> Option<&'static str> {
    let name = match command_id {
        IDENTIFIER_REQUEST => "IdentifierRequest",
        IDENTIFIER_REPLY => "IdentifierReply",
        VERSION_REQUEST => "VersionRequest",
        VERSION_REPLY => "VersionReply",
        SETTING => "Setting",
        OBJECT_LIST => "ObjectList",
        MESH_LIST => "MeshList",
        VERTEX_LIST => "VertexList",
        NORMAL_LIST => "NormalList",
        PROCESS_MESH => "ProcessMesh",
        PROGRESS => "Progress",
        OBJECT_MATRIX => "ObjectMatrix",
        OBJECT_COUNT => "ObjectCount",
        OBJECT_PRINT_TIME => "ObjectPrintTime",
        OBJECT_PRINT_MATERIAL => "ObjectPrintMaterial",
        POLYGON => "Polygon",
        LAYER_INFO => "LayerInfo",
        SLICE_FINISHED => "SliceFinished",
        CANCEL => "Cancel",
        GCODE_PREFIX => "GCodePrefix",
        GCODE_LAYER => "GCodeLayer",
        GCODE_SUFFIX => "GCodeSuffix",
        _ => return None,
    };
    Some(name)
}

/// Log-friendly label, falling back to the hex id
pub fn label(command_id: u32) -> String {
    match name(command_id) {
        Some(name) => name.to_string(),
        None => format!("{:#010x}", command_id),
    }
}
