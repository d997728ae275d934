//! Driver spawns and runs the bridge control loop
//!
//! A single task owns the supervisor, the slice controller, the result
//! assembler and the live connection. Host calls, connection traffic, child
//! exits and timers are all serialized through one `select!` loop, so none of
//! those components needs its own locking.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::assembler::{Assembled, ResultAssembler};
use crate::config::BridgeConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions, EngineListener};
use crate::controller::{Dispatch, SliceController};
use crate::dispatch::DispatchTable;
use crate::launcher::{EngineLauncher, EngineProcess};
use crate::protocol::{EngineMessage, commands};
use crate::scene::SceneSource;
use crate::supervisor::{EngineLog, RestartDecision, RestartPolicy, Supervisor};
use crate::types::{BridgeEvent, EngineState, Frame, SliceRequest, SliceResult};
use crate::{BridgeError, Result};

/// How long shutdown waits for the child to exit after killing it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Host callback invoked on the control loop for every [`BridgeEvent`]
pub type Listener = Box<dyn FnMut(&BridgeEvent) + Send + 'static>;

/// Host → control loop requests
pub enum Command {
    SceneChanged,
    ForceSlice,
    Pause,
    Resume,
    RestartEngine,
    Subscribe(Listener),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SceneChanged => f.write_str("SceneChanged"),
            Command::ForceSlice => f.write_str("ForceSlice"),
            Command::Pause => f.write_str("Pause"),
            Command::Resume => f.write_str("Resume"),
            Command::RestartEngine => f.write_str("RestartEngine"),
            Command::Subscribe(_) => f.write_str("Subscribe(..)"),
        }
    }
}

/// Result of spawning the control loop
pub struct DriverChannels {
    /// Requests into the control loop
    pub commands: mpsc::UnboundedSender<Command>,
    /// Latest published result
    pub results: watch::Receiver<Option<Arc<SliceResult>>>,
    /// Engine state snapshots
    pub engine: watch::Receiver<EngineState>,
    /// Progress of the in-flight slice
    pub progress: watch::Receiver<f32>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
    /// Control loop task; completes after shutdown
    pub task: JoinHandle<()>,
}

/// Lifecycle events from per-child tasks
#[derive(Debug)]
enum EngineEvent {
    Connected { generation: u64, stream: Result<TcpStream> },
    Exited { generation: u64, exit_code: Option<i32> },
}

/// Driver spawns the control loop task
pub struct Driver;

impl Driver {
    /// Spawn the control loop and launch the first engine.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<L>(
        config: BridgeConfig,
        listener: EngineListener,
        launcher: L,
        scene: Arc<dyn SceneSource>,
        dispatch: DispatchTable,
        log: EngineLog,
    ) -> DriverChannels
    where
        L: EngineLauncher,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (engine_events_tx, engine_events_rx) = mpsc::unbounded_channel();
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let supervisor = Supervisor::new(RestartPolicy::from_config(&config), listener.port());
        let assembler = ResultAssembler::new();
        let results = assembler.subscribe();
        let (engine_tx, engine_rx) = watch::channel(supervisor.state().clone());
        let (progress_tx, progress_rx) = watch::channel(0.0f32);

        let control = ControlLoop {
            options: ConnectionOptions {
                max_frame_bytes: config.max_frame_bytes,
                send_queue_depth: config.send_queue_high_watermark as usize,
            },
            controller: SliceController::new(config.coalesce_window()),
            listener: Arc::new(listener),
            launcher: Box::new(launcher),
            scene,
            dispatch,
            log,
            supervisor,
            assembler,
            connection: None,
            listeners: Vec::new(),
            engine_tx,
            progress_tx,
            engine_events: engine_events_tx,
            connection_events: connection_events_tx,
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(control.run(commands_rx, engine_events_rx, connection_events_rx));

        DriverChannels {
            commands: commands_tx,
            results,
            engine: engine_rx,
            progress: progress_rx,
            cancel,
            task,
        }
    }
}

struct ControlLoop {
    options: ConnectionOptions,
    listener: Arc<EngineListener>,
    launcher: Box<dyn EngineLauncher>,
    scene: Arc<dyn SceneSource>,
    dispatch: DispatchTable,
    log: EngineLog,
    supervisor: Supervisor,
    controller: SliceController,
    assembler: ResultAssembler,
    connection: Option<Connection>,
    listeners: Vec<Listener>,
    engine_tx: watch::Sender<EngineState>,
    progress_tx: watch::Sender<f32>,
    engine_events: mpsc::UnboundedSender<EngineEvent>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        info!(port = self.listener.port(), "Bridge control loop started");
        self.start_engine().await;

        loop {
            let coalesce_at = self.controller.deadline();
            let restart_at = self.supervisor.restart_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Control loop cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All bridge handles dropped");
                        break;
                    }
                },
                Some(event) = connection_events.recv() => self.handle_connection_event(event),
                Some(event) = engine_events.recv() => self.handle_engine_event(event).await,
                _ = sleep_until_some(coalesce_at) => {
                    if self.controller.take_due(Instant::now()) {
                        self.dispatch().await;
                    }
                }
                _ = sleep_until_some(restart_at) => {
                    self.supervisor.take_restart();
                    self.start_engine().await;
                }
            }
        }

        self.shutdown(&mut engine_events).await;
    }

    async fn handle_command(&mut self, command: Command) {
        trace!(?command, "Host command");
        match command {
            Command::SceneChanged => self.controller.notify_scene_changed(),
            Command::ForceSlice => self.controller.force_slice(),
            Command::Pause => self.controller.pause(),
            Command::Resume => {
                self.controller.resume();
                if self.supervisor.state().phase == crate::types::EnginePhase::Unavailable {
                    self.supervisor.reset_failures();
                    self.start_engine().await;
                }
            }
            Command::RestartEngine => {
                info!("Engine restart requested");
                self.supervisor.reset_failures();
                if self.supervisor.state().child_alive {
                    self.supervisor.request_restart();
                } else {
                    self.start_engine().await;
                }
                self.publish_engine_state();
            }
            Command::Subscribe(listener) => self.listeners.push(listener),
        }
    }

    // -----------------------------------------------------------------------
    // Engine lifecycle

    async fn start_engine(&mut self) {
        if !self.supervisor.can_start() {
            return;
        }
        let generation = self.supervisor.begin_start();
        self.publish_engine_state();

        let port = self.listener.port();
        match self.launcher.launch(port, &self.log).await {
            Ok(process) => {
                // Killed only through the supervisor
                let kill = CancellationToken::new();
                self.supervisor.on_spawned(generation, process.id(), kill.clone());
                let events = self.engine_events.clone();
                tokio::spawn(watch_process(generation, process, kill.clone(), events));
                tokio::spawn(accept_connection(
                    generation,
                    Arc::clone(&self.listener),
                    kill,
                    self.engine_events.clone(),
                ));
            }
            Err(e) => {
                error!(generation, "Engine launch failed: {}", e);
                if let RestartDecision::Unavailable { failures } =
                    self.supervisor.on_spawn_failed(generation)
                {
                    self.emit(BridgeEvent::EngineUnavailable { failures });
                }
            }
        }
        self.publish_engine_state();
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connected { generation, stream } => {
                if !self.supervisor.is_current(generation) {
                    debug!(generation, "Dropping connection from a replaced engine");
                    return;
                }
                match stream {
                    Ok(stream) => self.on_connected(generation, stream).await,
                    Err(e) => {
                        warn!(generation, "Accepting engine connection failed: {}", e);
                        self.supervisor.kill_child(true);
                    }
                }
            }
            EngineEvent::Exited { generation, exit_code } => {
                if self.cancel.is_cancelled() {
                    debug!(generation, "Engine exit left for shutdown");
                    return;
                }
                if !self.supervisor.is_current(generation) {
                    debug!(generation, "Ignoring exit of a replaced engine");
                    return;
                }
                if let Some(connection) = self.connection.take() {
                    connection.close();
                }
                let cause = self.supervisor.loss_cause();
                self.controller.engine_lost(cause);
                self.assembler.reset();
                self.reset_progress();

                match self.supervisor.on_child_exited(generation, exit_code) {
                    RestartDecision::Immediate => self.start_engine().await,
                    RestartDecision::After(delay) => {
                        debug!(generation, ?delay, "Engine restart scheduled");
                    }
                    RestartDecision::Unavailable { failures } => {
                        self.emit(BridgeEvent::EngineUnavailable { failures });
                    }
                    RestartDecision::Stop => {}
                }
                self.publish_engine_state();
            }
        }
    }

    async fn on_connected(&mut self, generation: u64, stream: TcpStream) {
        if !self.supervisor.on_connected(generation) {
            return;
        }
        let connection = Connection::spawn(
            stream,
            generation,
            self.options,
            self.connection_events.clone(),
            &self.cancel,
        );
        self.assembler.reset();

        let handshake = async {
            connection.send(Frame::empty(commands::IDENTIFIER_REQUEST)).await?;
            connection.send(Frame::empty(commands::VERSION_REQUEST)).await
        };
        let sent = handshake.await;
        self.connection = Some(connection);
        if let Err(e) = sent {
            self.connection_lost(e, true);
            return;
        }
        // Nothing before the handshake reply belongs to a request
        self.assembler.push_fence(None);
        self.publish_engine_state();

        if self.controller.is_dirty() && self.controller.deadline().is_none() {
            self.dispatch().await;
        }
    }

    // -----------------------------------------------------------------------
    // Connection traffic

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let current = self.connection.as_ref().map(Connection::generation);
        if current != Some(event.generation()) {
            trace!(generation = event.generation(), "Ignoring event from a replaced connection");
            return;
        }
        match event {
            ConnectionEvent::Frame { frame, .. } => self.handle_frame(frame),
            ConnectionEvent::Closed { error, .. } => self.connection_lost(error, false),
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let message = match self.dispatch.decode(&frame) {
            None => return,
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!("Protocol violation: {}", e);
                self.connection_lost(e, true);
                return;
            }
        };

        match message {
            EngineMessage::IdentifierReply(identifier) => {
                self.supervisor.set_identifier(identifier);
                if let Some(cancelled) = self.assembler.fence_passed() {
                    debug!(snapshot_id = cancelled.snapshot_id(), "Cancellation acknowledged");
                }
                self.publish_engine_state();
            }
            EngineMessage::VersionReply(version) => {
                self.supervisor.set_version(version);
                self.publish_engine_state();
            }
            EngineMessage::Extension { command_id, payload } => {
                self.emit(BridgeEvent::Extension { command_id, payload });
            }
            message => match self.assembler.accept(message, self.controller.active_mut()) {
                Some(Assembled::Progress(fraction)) => {
                    self.progress_tx.send_replace(fraction);
                    self.emit(BridgeEvent::Progress(fraction));
                }
                Some(Assembled::Published(result)) => {
                    self.progress_tx.send_replace(1.0);
                    self.emit(BridgeEvent::ResultReady(result));
                }
                None => {}
            },
        }
    }

    /// Tear down the connection and kill the child.
    ///
    /// A `local` loss (protocol violation, failed send) fails the active
    /// request right away. A remote close is attributed when the child exit
    /// is observed.
    fn connection_lost(&mut self, error: BridgeError, local: bool) {
        let local = local || error.is_protocol_violation();
        match self.connection.take() {
            Some(connection) => {
                warn!(
                    generation = connection.generation(),
                    local,
                    "Engine connection lost: {}",
                    error
                );
                connection.close();
            }
            None => return,
        }
        if local {
            self.controller.engine_lost(error.failure_cause());
            self.reset_progress();
        }
        self.assembler.reset();
        self.supervisor.kill_child(local);
    }

    // -----------------------------------------------------------------------
    // Slicing

    async fn dispatch(&mut self) {
        let ready = self.connection.is_some() && self.supervisor.state().is_ready();
        let scene = self.scene.current_scene();

        match self.controller.prepare(&scene, ready) {
            Dispatch::Idle | Dispatch::Deferred => {}
            Dispatch::Empty { superseded } => {
                if let Some(request) = superseded {
                    if let Err(e) = self.cancel_request(request).await {
                        self.connection_lost(e, true);
                    }
                }
                self.assembler.clear_published();
                self.reset_progress();
                self.emit(BridgeEvent::EmptyScene);
            }
            Dispatch::Upload { superseded, frames, snapshot_id } => {
                if let Some(request) = superseded {
                    if let Err(e) = self.cancel_request(request).await {
                        self.controller.upload_failed();
                        self.connection_lost(e, true);
                        return;
                    }
                }
                self.reset_progress();

                let count = frames.len();
                if let Err(e) = send_frames(self.connection.as_ref(), frames).await {
                    warn!(snapshot_id, "Upload aborted: {}", e);
                    self.controller.upload_failed();
                    self.connection_lost(e, true);
                    return;
                }
                if let Some(request) = self.controller.upload_finished() {
                    self.assembler.begin(request);
                }
                debug!(snapshot_id, frames = count, "Upload complete");
            }
        }
    }

    /// Cancel then fence: results for `request` keep being dropped until the
    /// engine answers the `IdentifierRequest` queued behind the `Cancel`.
    async fn cancel_request(&mut self, request: SliceRequest) -> Result<()> {
        self.assembler.discard();
        let snapshot_id = request.snapshot_id();
        let fence =
            vec![Frame::empty(commands::CANCEL), Frame::empty(commands::IDENTIFIER_REQUEST)];
        send_frames(self.connection.as_ref(), fence).await?;
        self.assembler.push_fence(Some(request));
        info!(snapshot_id, "Cancelled superseded slice");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Host notifications

    fn emit(&mut self, event: BridgeEvent) {
        for listener in &mut self.listeners {
            listener(&event);
        }
    }

    fn reset_progress(&mut self) {
        if *self.progress_tx.borrow() != 0.0 {
            self.progress_tx.send_replace(0.0);
            self.emit(BridgeEvent::Progress(0.0));
        }
    }

    fn publish_engine_state(&mut self) {
        let state = self.supervisor.state().clone();
        let changed = self.engine_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            self.emit(BridgeEvent::EngineStateChanged(state));
        }
    }

    async fn shutdown(mut self, engine_events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
        info!("Bridge shutting down");
        self.supervisor.stop();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }

        if self.supervisor.state().child_alive {
            let supervisor = &mut self.supervisor;
            let exited = timeout(SHUTDOWN_GRACE, async {
                while let Some(event) = engine_events.recv().await {
                    if let EngineEvent::Exited { generation, exit_code } = event {
                        if supervisor.is_current(generation) {
                            supervisor.on_child_exited(generation, exit_code);
                            return;
                        }
                    }
                }
            })
            .await;
            if exited.is_err() {
                warn!("Engine did not exit within {:?}", SHUTDOWN_GRACE);
            }
        }

        self.controller.engine_lost(self.supervisor.loss_cause());
        self.publish_engine_state();
        self.cancel.cancel();
        info!("Control loop stopped");
    }
}

/// Queue frames in order on the live connection
async fn send_frames(connection: Option<&Connection>, frames: Vec<Frame>) -> Result<()> {
    let connection =
        connection.ok_or_else(|| BridgeError::transport_closed("no engine connection"))?;
    for frame in frames {
        connection.send(frame).await?;
    }
    Ok(())
}

/// Sleep until `deadline`, or forever when there is none
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Wait for the child to exit, killing it when `kill` is cancelled.
async fn watch_process(
    generation: u64,
    mut process: Box<dyn EngineProcess>,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let exited = tokio::select! {
        exited = process.wait() => exited,
        _ = kill.cancelled() => {
            if let Err(e) = process.kill().await {
                warn!(generation, "Killing engine failed: {}", e);
            }
            process.wait().await
        }
    };
    let exit_code = exited.unwrap_or_else(|e| {
        warn!(generation, "Waiting for engine failed: {}", e);
        None
    });
    info!(generation, ?exit_code, "Engine process exited");
    let _ = events.send(EngineEvent::Exited { generation, exit_code });
}

/// Accept the connection for one child; gives up once the child is gone.
async fn accept_connection(
    generation: u64,
    listener: Arc<EngineListener>,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    tokio::select! {
        biased;
        _ = kill.cancelled() => {}
        stream = listener.accept() => {
            let _ = events.send(EngineEvent::Connected { generation, stream });
        }
    }
}
