//! Slice scheduling
//!
//! The controller turns bursts of scene changes into one canonical slice:
//!
//! 1. `notify_scene_changed` marks the scene dirty and (re)arms the
//!    coalescing deadline
//! 2. when the deadline fires, [`SliceController::prepare`] captures a
//!    snapshot, supersedes any in-flight request and hands back the ordered
//!    upload frames
//! 3. the control loop sends them and reports back with
//!    [`SliceController::upload_finished`] or [`SliceController::upload_failed`]
//!
//! The controller performs no I/O. At most one request is ever `Uploading` or
//! `Computing`; superseded requests are returned to the caller already
//! `Cancelled` so it can send `Cancel` and hold them until their fence drains.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{commands, payload};
use crate::scene::{Scene, SnapshotBuilder};
use crate::types::{Frame, RequestState, SliceRequest, Snapshot};
use crate::{BridgeError, FailureCause};

#[cfg(test)]
mod tests;

/// Outcome of a dispatch attempt.
#[derive(Debug)]
pub enum Dispatch {
    /// The scene is clean
    Idle,
    /// Paused or no ready engine; the scene stays dirty
    Deferred,
    /// Nothing printable in the scene
    Empty { superseded: Option<SliceRequest> },
    /// Send `frames` in order, then report with `upload_finished`
    Upload { superseded: Option<SliceRequest>, frames: Vec<Frame>, snapshot_id: u64 },
}

/// Coalescing, supersession and request bookkeeping.
#[derive(Debug)]
pub struct SliceController {
    coalesce: Duration,
    dirty: bool,
    paused: bool,
    deadline: Option<Instant>,
    active: Option<SliceRequest>,
}

impl SliceController {
    pub fn new(coalesce: Duration) -> Self {
        Self { coalesce, dirty: false, paused: false, deadline: None, active: None }
    }

    /// Mark dirty and restart the coalescing window. Only marks dirty while paused.
    pub fn notify_scene_changed(&mut self) {
        self.dirty = true;
        if !self.paused {
            self.deadline = Some(Instant::now() + self.coalesce);
        }
    }

    /// Mark dirty and make the deadline due now
    pub fn force_slice(&mut self) {
        self.dirty = true;
        if !self.paused {
            self.deadline = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Slicing paused");
        }
        self.paused = true;
        self.deadline = None;
    }

    pub fn resume(&mut self) {
        if self.paused {
            debug!(dirty = self.dirty, "Slicing resumed");
        }
        self.paused = false;
        if self.dirty {
            self.deadline = Some(Instant::now() + self.coalesce);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// When the coalescing window closes, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm the deadline if it is due
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Option<&SliceRequest> {
        self.active.as_ref()
    }

    /// Mutable access for the result assembler
    pub fn active_mut(&mut self) -> &mut Option<SliceRequest> {
        &mut self.active
    }

    /// Capture the scene and decide what to send.
    pub fn prepare(&mut self, scene: &Scene, engine_ready: bool) -> Dispatch {
        if !self.dirty {
            return Dispatch::Idle;
        }
        if self.paused {
            return Dispatch::Deferred;
        }

        let snapshot = match SnapshotBuilder::build(scene) {
            Ok(snapshot) => snapshot,
            Err(BridgeError::SnapshotEmpty) => {
                info!("Scene has nothing to slice");
                self.dirty = false;
                return Dispatch::Empty { superseded: self.supersede() };
            }
            Err(e) => {
                warn!("Snapshot failed: {}", e);
                self.dirty = false;
                return Dispatch::Idle;
            }
        };

        if !engine_ready {
            debug!("Engine not ready, slice deferred");
            return Dispatch::Deferred;
        }

        let superseded = self.supersede();
        let mut request = SliceRequest::new(Arc::new(snapshot));
        request.transition(RequestState::Uploading);
        let frames = upload_frames(&request.snapshot);
        let snapshot_id = request.snapshot_id();
        info!(
            snapshot_id,
            "Uploading {} objects in {} frames",
            request.snapshot.objects.len(),
            frames.len()
        );

        self.active = Some(request);
        self.dirty = false;
        Dispatch::Upload { superseded, frames, snapshot_id }
    }

    /// All upload frames were queued; the active request is now `Computing`
    pub fn upload_finished(&mut self) -> Option<&SliceRequest> {
        let request = self.active.as_mut()?;
        if !request.transition(RequestState::Computing) {
            return None;
        }
        debug!(snapshot_id = request.snapshot_id(), "Upload complete, engine computing");
        Some(request)
    }

    /// A send failed mid-upload
    pub fn upload_failed(&mut self) {
        if let Some(mut request) = self.active.take() {
            warn!(snapshot_id = request.snapshot_id(), "Upload failed, transport closed");
            request.transition(RequestState::Failed(FailureCause::TransportClosed));
        }
        self.dirty = true;
    }

    /// The engine went away. Fails the in-flight request and keeps the scene
    /// dirty so it is uploaded again on the next engine.
    pub fn engine_lost(&mut self, cause: FailureCause) -> bool {
        match self.active.take() {
            Some(mut request) if request.state.is_in_flight() => {
                warn!(snapshot_id = request.snapshot_id(), %cause, "Slice failed");
                request.transition(RequestState::Failed(cause));
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    fn supersede(&mut self) -> Option<SliceRequest> {
        let mut request = self.active.take()?;
        if !request.state.is_in_flight() {
            return None;
        }
        request.cancel();
        debug!("{}", BridgeError::CancelledBySupersession { snapshot_id: request.snapshot_id() });
        Some(request)
    }
}

/// The ordered frame sequence for one snapshot.
///
/// `Setting` (global), `ObjectCount`, then per object `ObjectList`,
/// `ObjectMatrix`, `MeshList`, `VertexList`, then `NormalList` and
/// `Setting` (overrides) when present, closed by `ProcessMesh`.
pub fn upload_frames(snapshot: &Snapshot) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(3 + snapshot.objects.len() * 6);
    frames.push(Frame::new(commands::SETTING, payload::settings(&snapshot.global_settings)));
    frames.push(Frame::new(
        commands::OBJECT_COUNT,
        payload::u32_value(snapshot.objects.len() as u32),
    ));

    for object in &snapshot.objects {
        frames.push(Frame::new(commands::OBJECT_LIST, payload::u32_value(1)));
        frames.push(Frame::new(commands::OBJECT_MATRIX, payload::matrix(&object.transform)));
        frames.push(Frame::new(commands::MESH_LIST, payload::u32_value(1)));
        frames.push(Frame::new(commands::VERTEX_LIST, payload::f32_triples(&object.mesh.vertices)));
        if let Some(normals) = &object.mesh.normals {
            frames.push(Frame::new(commands::NORMAL_LIST, payload::f32_triples(normals)));
        }
        if !object.per_object_settings.is_empty() {
            let overrides = payload::settings(&object.per_object_settings);
            frames.push(Frame::new(commands::SETTING, overrides));
        }
    }

    frames.push(Frame::empty(commands::PROCESS_MESH));
    frames
}
