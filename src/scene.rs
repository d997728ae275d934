//! Scene graph capture
//!
//! The host owns a mutable scene tree. Before any asynchronous work begins the
//! bridge captures it into an immutable [`Snapshot`] with [`SnapshotBuilder`]:
//!
//! - nodes are visited depth first, parents before children, children in order
//! - only nodes with mesh data that are sliceable are captured
//! - nodes outside the build volume are skipped unless they are non-printing
//! - world transforms are composed from the root down
//! - per-object settings are the overrides of every ancestor group, closest wins
//!
//! Capturing the same scene twice yields snapshots with equal content and
//! strictly increasing ids.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{Mesh, SceneObject, SettingMap, SettingValue, Snapshot, Transform};
use crate::{BridgeError, Result};

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

/// Draw the next process-wide snapshot id
pub fn next_snapshot_id() -> u64 {
    NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Triangle data attached to a scene node.
///
/// Either a flat triangle soup or an indexed mesh. Normals, when present,
/// follow the same layout as the vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub vertices: Arc<[[f32; 3]]>,
    pub indices: Option<Arc<[u32]>>,
    pub normals: Option<Arc<[[f32; 3]]>>,
}

impl MeshData {
    /// Flat triangle soup, three vertices per triangle
    pub fn triangles(vertices: Vec<[f32; 3]>) -> Self {
        Self { vertices: vertices.into(), indices: None, normals: None }
    }

    /// Shared vertices addressed by a triangle index buffer
    pub fn indexed(vertices: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        Self { vertices: vertices.into(), indices: Some(indices.into()), normals: None }
    }

    pub fn with_normals(mut self, normals: Vec<[f32; 3]>) -> Self {
        self.normals = Some(normals.into());
        self
    }

    /// Expand into the flat, order-preserving vertex sequence the engine expects.
    ///
    /// `node` names the owning node in errors.
    pub fn flatten(&self, node: &str) -> Result<(Arc<[[f32; 3]]>, Option<Arc<[[f32; 3]]>>)> {
        if let Some(normals) = &self.normals {
            if normals.len() != self.vertices.len() {
                return Err(BridgeError::invalid_mesh(
                    node,
                    format!("{} normals for {} vertices", normals.len(), self.vertices.len()),
                ));
            }
        }

        let Some(indices) = &self.indices else {
            if self.vertices.len() % 3 != 0 {
                return Err(BridgeError::invalid_mesh(
                    node,
                    format!("{} vertices is not a whole number of triangles", self.vertices.len()),
                ));
            }
            return Ok((Arc::clone(&self.vertices), self.normals.clone()));
        };

        if indices.len() % 3 != 0 {
            return Err(BridgeError::invalid_mesh(
                node,
                format!("{} indices is not a whole number of triangles", indices.len()),
            ));
        }
        let lookup = |table: &[[f32; 3]]| -> Result<Arc<[[f32; 3]]>> {
            indices
                .iter()
                .map(|&i| {
                    table.get(i as usize).copied().ok_or_else(|| {
                        BridgeError::invalid_mesh(
                            node,
                            format!("index {} out of range for {} vertices", i, table.len()),
                        )
                    })
                })
                .collect()
        };
        let vertices = lookup(&self.vertices[..])?;
        let normals = self.normals.as_deref().map(lookup).transpose()?;
        Ok((vertices, normals))
    }
}

/// Reads mesh files into [`MeshData`]. Implemented by the host's file readers.
pub trait MeshReader: Send + Sync {
    fn read_mesh(&self, path: &Path) -> Result<MeshData>;
}

/// A node of the host's scene tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    /// Stable identity, used as the object id
    pub id: u64,
    pub name: String,
    /// Transform relative to the parent
    pub transform: Transform,
    pub mesh: Option<MeshData>,
    pub sliceable: bool,
    pub outside_build_volume: bool,
    /// Modifier mesh: uploaded but never printed on its own
    pub non_printing: bool,
    /// Setting overrides for this node and its descendants
    pub overrides: SettingMap,
    pub children: Vec<SceneNode>,
}

impl SceneNode {
    /// A grouping node without mesh data
    pub fn group(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            transform: Transform::IDENTITY,
            mesh: None,
            sliceable: false,
            outside_build_volume: false,
            non_printing: false,
            overrides: SettingMap::new(),
            children: Vec::new(),
        }
    }

    /// A sliceable node carrying a mesh
    pub fn object(id: u64, name: impl Into<String>, mesh: MeshData) -> Self {
        Self { mesh: Some(mesh), sliceable: true, ..Self::group(id, name) }
    }

    /// Load a sliceable node from a mesh file
    pub fn load(id: u64, reader: &dyn MeshReader, path: &Path) -> Result<Self> {
        let mesh = reader.read_mesh(path)?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        debug!("Loaded {} ({} vertices)", path.display(), mesh.vertices.len());
        Ok(Self::object(id, name, mesh))
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn non_printing(mut self) -> Self {
        self.non_printing = true;
        self
    }

    pub fn outside_build_volume(mut self) -> Self {
        self.outside_build_volume = true;
        self
    }

    /// Find a node by id in this subtree
    pub fn find_mut(&mut self, id: u64) -> Option<&mut SceneNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }
}

/// The host's scene: a node tree plus global settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub root: SceneNode,
    pub global_settings: SettingMap,
}

impl Default for Scene {
    fn default() -> Self {
        Self { root: SceneNode::group(0, "root"), global_settings: SettingMap::new() }
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.global_settings.insert(key.into(), value.into());
        self
    }

    pub fn add(&mut self, node: SceneNode) {
        self.root.children.push(node);
    }
}

/// Where the bridge reads the current scene from.
pub trait SceneSource: Send + Sync + 'static {
    fn current_scene(&self) -> Scene;
}

/// A scene shared between the host and the bridge.
#[derive(Debug, Clone, Default)]
pub struct SharedScene {
    inner: Arc<RwLock<Scene>>,
}

impl SharedScene {
    pub fn new(scene: Scene) -> Self {
        Self { inner: Arc::new(RwLock::new(scene)) }
    }

    /// Mutate the scene in place
    pub fn update<F: FnOnce(&mut Scene)>(&self, f: F) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn replace(&self, scene: Scene) {
        self.update(|current| *current = scene);
    }
}

impl SceneSource for SharedScene {
    fn current_scene(&self) -> Scene {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Builds snapshots from scenes.
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Capture the sliceable content of `scene`.
    ///
    /// Fails with `SnapshotEmpty` when nothing printable remains. Nodes with
    /// malformed meshes are skipped with a warning.
    pub fn build(scene: &Scene) -> Result<Snapshot> {
        let mut objects = Vec::new();
        Self::visit(&scene.root, &Transform::IDENTITY, &SettingMap::new(), &mut objects);

        if objects.iter().all(|o: &SceneObject| o.non_printing) {
            debug!("Scene has {} objects, none printable", objects.len());
            return Err(BridgeError::SnapshotEmpty);
        }

        let snapshot = Snapshot {
            snapshot_id: next_snapshot_id(),
            objects,
            global_settings: scene.global_settings.clone(),
            taken_at: Instant::now(),
        };
        debug!(
            snapshot_id = snapshot.snapshot_id,
            "Captured {} objects, {} vertices",
            snapshot.objects.len(),
            snapshot.vertex_count()
        );
        Ok(snapshot)
    }

    fn visit(
        node: &SceneNode,
        parent_world: &Transform,
        inherited: &SettingMap,
        out: &mut Vec<SceneObject>,
    ) {
        let world = parent_world.then(&node.transform);
        let mut effective = inherited.clone();
        effective.extend(node.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(mesh) = &node.mesh {
            if node.sliceable && (!node.outside_build_volume || node.non_printing) {
                match mesh.flatten(&node.name) {
                    Ok((vertices, normals)) => out.push(SceneObject {
                        object_id: node.id,
                        mesh: Mesh { mesh_id: node.id, vertices, normals },
                        transform: world,
                        per_object_settings: effective.clone(),
                        non_printing: node.non_printing,
                    }),
                    Err(e) => warn!("Skipping node {}: {}", node.id, e),
                }
            }
        }

        for child in &node.children {
            Self::visit(child, &world, &effective, out);
        }
    }
}
