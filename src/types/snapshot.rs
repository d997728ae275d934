//! Immutable scene snapshot types

use std::sync::Arc;
use tokio::time::Instant;

use super::SettingMap;

/// Row-major 4×4 transform, sent to the engine as 16 little-endian f32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform(pub [f32; 16]);

impl Transform {
    pub const IDENTITY: Transform =
        Transform([1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);

    /// Pure translation
    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[3] = x;
        m.0[7] = y;
        m.0[11] = z;
        m
    }

    /// Uniform scale
    pub fn scale(factor: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[0] = factor;
        m.0[5] = factor;
        m.0[10] = factor;
        m
    }

    /// Matrix product `self * rhs`
    pub fn then(&self, rhs: &Transform) -> Transform {
        let a = &self.0;
        let b = &rhs.0;
        let mut out = [0.0f32; 16];
        for row in 0..4 {
            for col in 0..4 {
                out[row * 4 + col] = (0..4).map(|k| a[row * 4 + k] * b[k * 4 + col]).sum();
            }
        }
        Transform(out)
    }

    /// Apply to a point (w = 1)
    pub fn apply(&self, p: [f32; 3]) -> [f32; 3] {
        let m = &self.0;
        [
            m[0] * p[0] + m[1] * p[1] + m[2] * p[2] + m[3],
            m[4] * p[0] + m[5] * p[1] + m[6] * p[2] + m[7],
            m[8] * p[0] + m[9] * p[1] + m[10] * p[2] + m[11],
        ]
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Triangle soup owned by exactly one object in a snapshot.
///
/// Vertex order is significant: the engine rebuilds triangles from
/// consecutive triples, so `vertices.len() % 3 == 0` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub mesh_id: u64,
    pub vertices: Arc<[[f32; 3]]>,
    pub normals: Option<Arc<[[f32; 3]]>>,
}

impl Mesh {
    /// Number of triangles
    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }
}

/// A sliceable object captured from a scene node.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub object_id: u64,
    pub mesh: Mesh,
    /// World transform of the originating node
    pub transform: Transform,
    /// Overrides that differ from the global settings, closest ancestor first resolved
    pub per_object_settings: SettingMap,
    /// Modifier meshes are uploaded but do not print on their own
    pub non_printing: bool,
}

/// Immutable, ordered capture of the sliceable scene.
///
/// Object order determines upload order and result attribution.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: u64,
    pub objects: Vec<SceneObject>,
    pub global_settings: SettingMap,
    pub taken_at: Instant,
}

impl Snapshot {
    /// Whether the scene content (ignoring id and timestamp) matches another snapshot
    pub fn same_content(&self, other: &Snapshot) -> bool {
        self.objects == other.objects && self.global_settings == other.global_settings
    }

    /// Total vertex count across all objects
    pub fn vertex_count(&self) -> usize {
        self.objects.iter().map(|o| o.mesh.vertices.len()).sum()
    }

    /// Object ids in upload order
    pub fn object_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.objects.iter().map(|o| o.object_id)
    }
}
