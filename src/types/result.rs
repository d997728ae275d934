//! Assembled slice results

use std::collections::BTreeMap;
use std::time::Duration;

/// One 2D polygon of a sliced layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    /// Wall, infill, support, ... (opaque to the bridge)
    pub type_tag: u8,
    pub points: Vec<[f32; 2]>,
}

/// A sliced layer as streamed by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub layer_index: u32,
    pub polygons: Vec<Polygon>,
    /// Polygon count announced by `LayerInfo`
    pub declared_polygons: u32,
}

impl Layer {
    pub fn new(layer_index: u32, declared_polygons: u32) -> Self {
        Self {
            layer_index,
            polygons: Vec::with_capacity(declared_polygons as usize),
            declared_polygons,
        }
    }

    /// Whether every announced polygon arrived
    pub fn is_filled(&self) -> bool {
        self.polygons.len() as u32 >= self.declared_polygons
    }
}

/// Wall-clock breakdown of one slice.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SliceTimings {
    /// Request creation to `ProcessMesh` sent
    pub upload: Duration,
    /// `ProcessMesh` sent to `SliceFinished`
    pub compute: Duration,
    pub total: Duration,
}

/// The layers, g-code and estimates produced for one snapshot.
///
/// Only published once `complete` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceResult {
    pub snapshot_id: u64,
    pub layers: Vec<Layer>,
    pub gcode: Vec<u8>,
    pub per_object_time_s: BTreeMap<u64, f32>,
    pub per_object_material_mm: BTreeMap<u64, f32>,
    pub complete: bool,
    pub timings: SliceTimings,
}

impl SliceResult {
    pub fn new(snapshot_id: u64) -> Self {
        Self { snapshot_id, ..Default::default() }
    }

    /// G-code as text, replacing invalid UTF-8
    pub fn gcode_text(&self) -> String {
        String::from_utf8_lossy(&self.gcode).into_owned()
    }

    /// Sum of per-object print time estimates
    pub fn total_time_s(&self) -> f32 {
        self.per_object_time_s.values().sum()
    }

    /// Sum of per-object material estimates
    pub fn total_material_mm(&self) -> f32 {
        self.per_object_material_mm.values().sum()
    }

    /// Number of polygons across all layers
    pub fn polygon_count(&self) -> usize {
        self.layers.iter().map(|l| l.polygons.len()).sum()
    }
}
