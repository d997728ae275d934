//! Engine process state

/// Supervisor state machine phase.
///
/// ```text
/// Idle ──start──▶ Starting ──connect──▶ Ready ──exit──▶ Exited
///                    │                                    │
///                    └──spawn fails──▶ Failed ◀───────────┘
/// Failed ──retry──▶ Starting        Failed ──budget spent──▶ Unavailable
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePhase {
    #[default]
    Idle,
    Starting,
    Ready,
    Exited,
    Failed,
    Unavailable,
}

/// Process-wide view of the engine child, owned by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineState {
    pub phase: EnginePhase,
    pub child_alive: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub last_exit_code: Option<i32>,
    /// From `IdentifierReply`
    pub identifier: Option<String>,
    /// From `VersionReply`
    pub version: Option<String>,
}

impl EngineState {
    pub fn is_ready(&self) -> bool {
        self.phase == EnginePhase::Ready
    }
}
