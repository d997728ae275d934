//! Engine supervisor state machine and restart policy
//!
//! The supervisor owns [`EngineState`] and decides what happens after every
//! lifecycle edge of the engine child. It performs no I/O itself: the control
//! loop launches processes, accepts connections and schedules the restart
//! deadline the supervisor hands back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::types::{EnginePhase, EngineState};
use crate::FailureCause;

/// Exponential backoff with a consecutive-failure budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// A Ready period longer than this forgives earlier failures
    pub reset_after: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            reset_after: Duration::from_secs(60),
            max_consecutive_failures: 5,
        }
    }
}

impl RestartPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            initial: config.backoff_initial(),
            max: config.backoff_max(),
            reset_after: config.backoff_reset_after(),
            max_consecutive_failures: config.restart_max_consecutive_failures,
        }
    }

    /// Delay before the next launch after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.initial.saturating_mul(1u32 << doublings).min(self.max)
    }

    /// Whether the failure budget is spent
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }
}

/// What the control loop should do after the child went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Clean exit: launch again right away
    Immediate,
    /// Launch again at the given deadline
    After(Duration),
    /// Budget spent; wait for an explicit restart
    Unavailable { failures: u32 },
    /// The bridge is shutting down
    Stop,
}

/// State machine for one engine slot.
///
/// Every launch gets a new generation number. Events carrying an older
/// generation refer to a child or connection that has been replaced.
#[derive(Debug)]
pub struct Supervisor {
    state: EngineState,
    policy: RestartPolicy,
    generation: u64,
    ready_since: Option<Instant>,
    restart_at: Option<Instant>,
    child: Option<CancellationToken>,
    /// Set when the bridge itself tore the connection down
    locally_closed: bool,
    /// The next exit was requested by the host and does not count
    restart_requested: bool,
    stopping: bool,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy, port: u16) -> Self {
        Self {
            state: EngineState { port, ..EngineState::default() },
            policy,
            generation: 0,
            ready_since: None,
            restart_at: None,
            child: None,
            locally_closed: false,
            restart_requested: false,
            stopping: false,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Pending restart deadline, if a backoff is running
    pub fn restart_deadline(&self) -> Option<Instant> {
        self.restart_at
    }

    /// Whether a launch is allowed right now
    pub fn can_start(&self) -> bool {
        !self.stopping
            && !self.state.child_alive
            && !matches!(self.state.phase, EnginePhase::Starting | EnginePhase::Unavailable)
    }

    /// Enter `Starting` and return the generation for the new child
    pub fn begin_start(&mut self) -> u64 {
        self.generation += 1;
        self.restart_at = None;
        self.ready_since = None;
        self.locally_closed = false;
        self.restart_requested = false;
        self.state.phase = EnginePhase::Starting;
        self.state.identifier = None;
        self.state.version = None;
        debug!(generation = self.generation, "Engine starting");
        self.generation
    }

    /// The child process is running; `kill` tears it down when cancelled
    pub fn on_spawned(&mut self, generation: u64, pid: Option<u32>, kill: CancellationToken) {
        if !self.is_current(generation) {
            kill.cancel();
            return;
        }
        info!(generation, pid, "Engine process spawned");
        self.state.child_alive = true;
        self.state.pid = pid;
        self.child = Some(kill);
    }

    /// The launch itself failed
    pub fn on_spawn_failed(&mut self, generation: u64) -> RestartDecision {
        if !self.is_current(generation) {
            return RestartDecision::Stop;
        }
        self.state.child_alive = false;
        self.state.pid = None;
        self.record_failure()
    }

    /// The child connected back; enter `Ready`
    pub fn on_connected(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state.phase != EnginePhase::Starting {
            return false;
        }
        info!(generation, port = self.state.port, "Engine ready");
        self.state.phase = EnginePhase::Ready;
        self.ready_since = Some(Instant::now());
        true
    }

    pub fn set_identifier(&mut self, identifier: String) {
        if self.state.identifier.as_deref() != Some(identifier.as_str()) {
            info!("Engine identifies as {}", identifier);
            self.state.identifier = Some(identifier);
        }
    }

    pub fn set_version(&mut self, version: String) {
        if self.state.version.as_deref() != Some(version.as_str()) {
            info!("Engine version {}", version);
            self.state.version = Some(version);
        }
    }

    /// Kill the current child. Its exit is reported through the normal exit path.
    pub fn kill_child(&mut self, local_cause: bool) {
        if local_cause {
            self.locally_closed = true;
        }
        if let Some(kill) = &self.child {
            if !kill.is_cancelled() {
                debug!(generation = self.generation, "Killing engine process");
                kill.cancel();
            }
        }
    }

    /// Cause to record on a request that was active when the engine went away
    pub fn loss_cause(&self) -> FailureCause {
        if self.locally_closed {
            FailureCause::TransportClosed
        } else {
            FailureCause::EngineCrashed
        }
    }

    /// The child exited; decide whether and when to relaunch
    pub fn on_child_exited(&mut self, generation: u64, exit_code: Option<i32>) -> RestartDecision {
        if !self.is_current(generation) {
            return RestartDecision::Stop;
        }
        let ready_for = self.ready_since.take().map(|since| since.elapsed());
        // Also stops a pending accept for this child
        if let Some(kill) = self.child.take() {
            kill.cancel();
        }
        self.state.child_alive = false;
        self.state.pid = None;
        self.state.last_exit_code = exit_code;
        self.state.phase = EnginePhase::Exited;

        if self.stopping {
            info!(generation, ?exit_code, "Engine stopped");
            return RestartDecision::Stop;
        }

        if std::mem::take(&mut self.restart_requested) {
            info!(generation, "Engine restarted on request");
            self.state.restart_count += 1;
            return RestartDecision::Immediate;
        }

        if let Some(ready_for) = ready_for {
            if ready_for > self.policy.reset_after && self.state.consecutive_failures > 0 {
                debug!("Engine was ready for {:?}, forgiving earlier failures", ready_for);
                self.state.consecutive_failures = 0;
            }
        }

        if exit_code == Some(0) && !self.locally_closed {
            info!(generation, "Engine exited cleanly, relaunching");
            self.state.restart_count += 1;
            return RestartDecision::Immediate;
        }

        warn!(generation, ?exit_code, "Engine exited abnormally");
        self.record_failure()
    }

    fn record_failure(&mut self) -> RestartDecision {
        self.state.consecutive_failures += 1;
        let failures = self.state.consecutive_failures;

        if self.policy.exhausted(failures) {
            error!(failures, "Engine restart budget exhausted");
            self.state.phase = EnginePhase::Unavailable;
            self.restart_at = None;
            return RestartDecision::Unavailable { failures };
        }

        let delay = self.policy.backoff(failures);
        info!(failures, ?delay, "Engine restart scheduled");
        self.state.phase = EnginePhase::Failed;
        self.state.restart_count += 1;
        self.restart_at = Some(Instant::now() + delay);
        RestartDecision::After(delay)
    }

    /// The restart deadline fired
    pub fn take_restart(&mut self) -> bool {
        self.restart_at.take().is_some()
    }

    /// Forget failures and leave `Unavailable` so an explicit restart may run
    pub fn reset_failures(&mut self) {
        self.state.consecutive_failures = 0;
        self.restart_at = None;
        if self.state.phase == EnginePhase::Unavailable {
            self.state.phase = EnginePhase::Idle;
        }
    }

    /// Kill the running child and relaunch it once it has exited
    pub fn request_restart(&mut self) {
        self.restart_requested = true;
        self.kill_child(false);
    }

    /// Stop relaunching and kill the current child
    pub fn stop(&mut self) {
        self.stopping = true;
        self.restart_at = None;
        self.kill_child(true);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }
}

/// Bounded in-memory copy of the engine's stderr.
#[derive(Debug, Clone)]
pub struct EngineLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
}

impl EngineLog {
    pub fn new(max_lines: usize) -> Self {
        Self { lines: Arc::new(Mutex::new(VecDeque::new())), max_lines }
    }

    /// Append a line, evicting the oldest beyond the bound
    pub fn push(&self, line: impl Into<String>) {
        if self.max_lines == 0 {
            return;
        }
        let mut lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while lines.len() >= self.max_lines {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Copy of the retained lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
