//! Result assembly
//!
//! The engine streams a result as `LayerInfo`/`Polygon` groups, per-object
//! estimates and g-code fragments, terminated by `SliceFinished`. The
//! assembler accumulates these into a private [`SliceResult`] for the active
//! request and publishes it by swapping a single `Arc` once it is complete.
//!
//! The wire carries no request id. After every `Cancel` the bridge sends an
//! `IdentifierRequest` as a fence; since the engine answers commands in order,
//! every result frame received before the matching `IdentifierReply` belongs
//! to a cancelled request and is dropped here.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::protocol::EngineMessage;
use crate::types::{Layer, RequestState, SliceRequest, SliceResult, SliceTimings, Snapshot};

/// What accepting a message produced for the host
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Progress(f32),
    Published(Arc<SliceResult>),
}

/// Collects streamed fragments for the active request.
#[derive(Debug)]
pub struct ResultAssembler {
    /// One entry per unanswered fence; holds the cancelled request it guards, if any
    fences: VecDeque<Option<SliceRequest>>,
    /// Snapshot id set when the active request entered `Computing`
    expected: Option<u64>,
    partial: Option<SliceResult>,
    published: watch::Sender<Option<Arc<SliceResult>>>,
}

impl Default for ResultAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAssembler {
    pub fn new() -> Self {
        let (published, _) = watch::channel(None);
        Self { fences: VecDeque::new(), expected: None, partial: None, published }
    }

    /// Receiver for published results
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SliceResult>>> {
        self.published.subscribe()
    }

    /// Most recently completed result
    pub fn current(&self) -> Option<Arc<SliceResult>> {
        self.published.borrow().clone()
    }

    /// A fence was sent; hold `cancelled` until it is answered
    pub fn push_fence(&mut self, cancelled: Option<SliceRequest>) {
        self.fences.push_back(cancelled);
        trace!("Fence sent ({} outstanding)", self.fences.len());
    }

    /// The oldest fence was answered. Returns the request it released.
    pub fn fence_passed(&mut self) -> Option<SliceRequest> {
        let released = self.fences.pop_front().flatten();
        if let Some(request) = &released {
            debug!(snapshot_id = request.snapshot_id(), "Cancelled request drained");
        }
        released
    }

    pub fn fences_outstanding(&self) -> usize {
        self.fences.len()
    }

    /// Start collecting for a request that just entered `Computing`
    pub fn begin(&mut self, request: &SliceRequest) {
        self.expected = Some(request.snapshot_id());
        self.partial = Some(SliceResult::new(request.snapshot_id()));
    }

    /// Drop the partial result of the active request
    pub fn discard(&mut self) {
        if let Some(partial) = self.partial.take() {
            debug!(
                snapshot_id = partial.snapshot_id,
                "Discarding partial result ({} layers)",
                partial.layers.len()
            );
        }
        self.expected = None;
    }

    /// Connection reset: nothing in flight can still arrive
    pub fn reset(&mut self) {
        self.discard();
        let released = self.fences.drain(..).flatten().count();
        if released > 0 {
            debug!("Released {} cancelled requests on connection reset", released);
        }
    }

    /// Withdraw the published result
    pub fn clear_published(&mut self) {
        self.published.send_replace(None);
    }

    /// Feed one decoded result message.
    ///
    /// `active` is the controller's active request; it is completed and
    /// cleared when `SliceFinished` arrives.
    pub fn accept(
        &mut self,
        message: EngineMessage,
        active: &mut Option<SliceRequest>,
    ) -> Option<Assembled> {
        if !self.fences.is_empty() {
            trace!("Dropping {} behind {} fences", discriminant_name(&message), self.fences.len());
            return None;
        }
        let request = match active.as_mut() {
            Some(request)
                if request.state == RequestState::Computing
                    && self.expected == Some(request.snapshot_id()) =>
            {
                request
            }
            _ => {
                trace!("Dropping {} with no matching request", discriminant_name(&message));
                return None;
            }
        };
        let Some(partial) = self.partial.as_mut() else {
            return None;
        };

        match message {
            EngineMessage::Progress(fraction) => return Some(Assembled::Progress(fraction)),
            EngineMessage::LayerInfo { layer_index, polygon_count } => {
                partial.layers.push(Layer::new(layer_index, polygon_count));
            }
            EngineMessage::Polygon(polygon) => match partial.layers.last_mut() {
                Some(layer) => layer.polygons.push(polygon),
                None => warn!("Polygon received before any LayerInfo, dropping"),
            },
            EngineMessage::ObjectPrintTime { object_id, seconds } => {
                let object_id = attribute(&request.snapshot, object_id);
                partial.per_object_time_s.insert(object_id, seconds);
            }
            EngineMessage::ObjectPrintMaterial { object_id, mm } => {
                let object_id = attribute(&request.snapshot, object_id);
                partial.per_object_material_mm.insert(object_id, mm);
            }
            EngineMessage::GCodePrefix(bytes)
            | EngineMessage::GCodeLayer(bytes)
            | EngineMessage::GCodeSuffix(bytes) => partial.gcode.extend_from_slice(&bytes),
            EngineMessage::SliceFinished => {
                let mut result = self.partial.take()?;
                self.expected = None;
                result.complete = true;
                result.timings = timings(request);
                let result = Arc::new(result);

                self.published.send_replace(Some(Arc::clone(&result)));
                request.transition(RequestState::Completed);
                info!(
                    snapshot_id = result.snapshot_id,
                    "Slice complete: {} layers, {} bytes g-code in {:?}",
                    result.layers.len(),
                    result.gcode.len(),
                    result.timings.total
                );
                *active = None;
                return Some(Assembled::Published(result));
            }
            EngineMessage::IdentifierReply(_)
            | EngineMessage::VersionReply(_)
            | EngineMessage::Extension { .. } => {}
        }
        None
    }
}

/// Map an engine-reported object reference onto a snapshot object id.
///
/// Exact ids win; otherwise the value is taken as a position in upload order.
fn attribute(snapshot: &Snapshot, reported: u64) -> u64 {
    if snapshot.objects.iter().any(|o| o.object_id == reported) {
        return reported;
    }
    usize::try_from(reported)
        .ok()
        .and_then(|index| snapshot.objects.get(index))
        .map(|o| o.object_id)
        .unwrap_or(reported)
}

fn timings(request: &SliceRequest) -> SliceTimings {
    let now = Instant::now();
    let uploaded = request.upload_finished_at.unwrap_or(request.created_at);
    SliceTimings {
        upload: uploaded.saturating_duration_since(request.created_at),
        compute: now.saturating_duration_since(uploaded),
        total: now.saturating_duration_since(request.created_at),
    }
}

fn discriminant_name(message: &EngineMessage) -> &'static str {
    match message {
        EngineMessage::IdentifierReply(_) => "IdentifierReply",
        EngineMessage::VersionReply(_) => "VersionReply",
        EngineMessage::Progress(_) => "Progress",
        EngineMessage::ObjectPrintTime { .. } => "ObjectPrintTime",
        EngineMessage::ObjectPrintMaterial { .. } => "ObjectPrintMaterial",
        EngineMessage::LayerInfo { .. } => "LayerInfo",
        EngineMessage::Polygon(_) => "Polygon",
        EngineMessage::GCodePrefix(_) => "GCodePrefix",
        EngineMessage::GCodeLayer(_) => "GCodeLayer",
        EngineMessage::GCodeSuffix(_) => "GCodeSuffix",
        EngineMessage::SliceFinished => "SliceFinished",
        EngineMessage::Extension { .. } => "Extension",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SnapshotBuilder;
    use crate::test_utils::scenes;
    use crate::types::Polygon;

    fn computing() -> SliceRequest {
        let snapshot = SnapshotBuilder::build(&scenes::single_triangle()).unwrap();
        let mut request = SliceRequest::new(Arc::new(snapshot));
        request.transition(RequestState::Uploading);
        request.transition(RequestState::Computing);
        request
    }

    fn gcode(text: &str) -> Arc<[u8]> {
        Arc::from(text.as_bytes())
    }

    fn polygon() -> EngineMessage {
        EngineMessage::Polygon(Polygon {
            type_tag: 0,
            points: vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
        })
    }

    #[tokio::test]
    async fn complete_result_is_published_atomically() {
        let mut assembler = ResultAssembler::new();
        let updates = assembler.subscribe();
        let request = computing();
        let snapshot_id = request.snapshot_id();
        let object_id = request.snapshot.objects[0].object_id;
        assembler.begin(&request);
        let mut active = Some(request);

        assert!(assembler
            .accept(EngineMessage::LayerInfo { layer_index: 0, polygon_count: 1 }, &mut active)
            .is_none());
        assembler.accept(polygon(), &mut active);
        assembler.accept(EngineMessage::GCodePrefix(gcode("G28\n")), &mut active);
        assembler.accept(EngineMessage::GCodeLayer(gcode("G1 X1\n")), &mut active);
        assembler.accept(EngineMessage::ObjectPrintTime { object_id, seconds: 12.5 }, &mut active);
        assert!(assembler.current().is_none(), "partial result must not be visible");

        let published = match assembler.accept(EngineMessage::SliceFinished, &mut active) {
            Some(Assembled::Published(result)) => result,
            other => panic!("Expected publication, got {other:?}"),
        };
        assert!(published.complete);
        assert_eq!(published.snapshot_id, snapshot_id);
        assert_eq!(published.layers.len(), 1);
        assert_eq!(published.layers[0].polygons.len(), 1);
        assert!(published.layers[0].is_filled());
        assert_eq!(published.gcode_text(), "G28\nG1 X1\n");
        assert_eq!(published.per_object_time_s.get(&object_id), Some(&12.5));
        assert!(active.is_none());
        assert_eq!(updates.borrow().as_ref().map(|r| r.snapshot_id), Some(snapshot_id));
    }

    #[tokio::test]
    async fn progress_is_forwarded_not_stored() {
        let mut assembler = ResultAssembler::new();
        let request = computing();
        assembler.begin(&request);
        let mut active = Some(request);
        assert_eq!(
            assembler.accept(EngineMessage::Progress(0.25), &mut active),
            Some(Assembled::Progress(0.25))
        );
    }

    #[tokio::test]
    async fn frames_behind_a_fence_are_dropped() {
        let mut assembler = ResultAssembler::new();
        let mut cancelled = computing();
        cancelled.cancel();
        assembler.push_fence(Some(cancelled));

        let next = computing();
        assembler.begin(&next);
        let mut active = Some(next);

        assert!(assembler.accept(EngineMessage::SliceFinished, &mut active).is_none());
        assert!(assembler.current().is_none());
        assert!(active.is_some());

        let released = assembler.fence_passed().unwrap();
        assert_eq!(released.state, RequestState::Cancelled);
        assert_eq!(assembler.fences_outstanding(), 0);

        assert!(matches!(
            assembler.accept(EngineMessage::SliceFinished, &mut active),
            Some(Assembled::Published(_))
        ));
    }

    #[tokio::test]
    async fn nothing_is_accepted_without_active_request() {
        let mut assembler = ResultAssembler::new();
        let mut active = None;
        assert!(assembler.accept(EngineMessage::SliceFinished, &mut active).is_none());
        assert!(assembler.current().is_none());
    }

    #[tokio::test]
    async fn mismatched_snapshot_is_dropped() {
        let mut assembler = ResultAssembler::new();
        let stale = computing();
        assembler.begin(&stale);
        let mut active = Some(computing());
        assert!(assembler.accept(EngineMessage::SliceFinished, &mut active).is_none());
        assert!(assembler.current().is_none());
    }

    #[tokio::test]
    async fn polygon_without_layer_is_dropped() {
        let mut assembler = ResultAssembler::new();
        let request = computing();
        assembler.begin(&request);
        let mut active = Some(request);
        assembler.accept(polygon(), &mut active);
        match assembler.accept(EngineMessage::SliceFinished, &mut active) {
            Some(Assembled::Published(result)) => assert_eq!(result.polygon_count(), 0),
            other => panic!("Expected publication, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn estimates_by_position_are_attributed_to_objects() {
        let mut assembler = ResultAssembler::new();
        let request = computing();
        assert_eq!(request.snapshot.objects[0].object_id, scenes::TRIANGLE_NODE_ID);
        assembler.begin(&request);
        let mut active = Some(request);
        assembler.accept(EngineMessage::ObjectPrintMaterial { object_id: 0, mm: 3.0 }, &mut active);
        match assembler.accept(EngineMessage::SliceFinished, &mut active) {
            Some(Assembled::Published(result)) => {
                let material = result.per_object_material_mm.get(&scenes::TRIANGLE_NODE_ID);
                assert_eq!(material, Some(&3.0));
            }
            other => panic!("Expected publication, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_releases_fences_and_partial() {
        let mut assembler = ResultAssembler::new();
        let request = computing();
        assembler.begin(&request);
        assembler.push_fence(None);
        assembler.push_fence(Some(computing()));
        assembler.reset();
        assert_eq!(assembler.fences_outstanding(), 0);

        let mut active = Some(request);
        assert!(assembler.accept(EngineMessage::SliceFinished, &mut active).is_none());
    }
}
