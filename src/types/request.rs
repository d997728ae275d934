//! Slice request lifecycle

use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

use super::Snapshot;
use crate::FailureCause;

/// Lifecycle state of a slice request.
///
/// Transitions are strictly monotonic:
/// `Pending → Uploading → Computing → Completed | Failed | Cancelled`,
/// with `Failed` and `Cancelled` also reachable from earlier states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Uploading,
    Computing,
    Cancelled,
    Failed(FailureCause),
    Completed,
}

impl RequestState {
    fn rank(self) -> u8 {
        match self {
            RequestState::Pending => 0,
            RequestState::Uploading => 1,
            RequestState::Computing => 2,
            RequestState::Cancelled | RequestState::Failed(_) | RequestState::Completed => 3,
        }
    }

    /// Terminal states release the snapshot
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Uploading or Computing
    pub fn is_in_flight(self) -> bool {
        matches!(self, RequestState::Uploading | RequestState::Computing)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: RequestState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RequestState::Pending => false,
            RequestState::Uploading => self == RequestState::Pending,
            RequestState::Computing => self == RequestState::Uploading,
            RequestState::Completed => self == RequestState::Computing,
            RequestState::Cancelled | RequestState::Failed(_) => true,
        }
    }
}

/// One attempt to slice one snapshot.
#[derive(Debug, Clone)]
pub struct SliceRequest {
    pub snapshot: Arc<Snapshot>,
    pub state: RequestState,
    pub cancel_requested: bool,
    pub created_at: Instant,
    pub upload_finished_at: Option<Instant>,
}

impl SliceRequest {
    /// Create a new request in `Pending`
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot,
            state: RequestState::Pending,
            cancel_requested: false,
            created_at: Instant::now(),
            upload_finished_at: None,
        }
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot.snapshot_id
    }

    /// Move to `next` if legal. Illegal transitions are refused and logged.
    pub fn transition(&mut self, next: RequestState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                snapshot_id = self.snapshot_id(),
                "Refusing request transition {:?} -> {:?}", self.state, next
            );
            return false;
        }
        if next == RequestState::Computing {
            self.upload_finished_at = Some(Instant::now());
        }
        self.state = next;
        true
    }

    /// Mark for cancellation and move to `Cancelled`
    pub fn cancel(&mut self) -> bool {
        self.cancel_requested = true;
        self.transition(RequestState::Cancelled)
    }
}
