//! Backend bridge between a slicer front end and an external slicing engine.
//!
//! The bridge launches the engine as a child process, accepts its loopback
//! connection, uploads snapshots of the scene as framed commands and
//! assembles the streamed layers, estimates and g-code into an immutable
//! [`SliceResult`].
//!
//! # Features
//!
//! - **Coalescing**: bursts of scene changes produce one slice
//! - **Supersession**: a newer scene cancels the in-flight slice, and stale
//!   results can never be published
//! - **Supervision**: crashed engines are relaunched with exponential backoff
//! - **Atomic publication**: hosts only ever see complete results
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use slicebridge::{BridgeConfig, MeshData, Scene, SceneNode, SharedScene, SliceBridge};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> slicebridge::Result<()> {
//!     let scene = SharedScene::new(Scene::new().with_setting("layer_height", 0.2));
//!     let bridge = SliceBridge::start(BridgeConfig::new("CuraEngine"), scene.clone()).await?;
//!
//!     scene.update(|scene| {
//!         let mesh = MeshData::triangles(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
//!         scene.add(SceneNode::object(1, "part", mesh));
//!     });
//!     bridge.notify_scene_changed();
//!
//!     let mut results = std::pin::pin!(bridge.result_updates());
//!     if let Some(result) = results.next().await {
//!         println!("{} layers, {:.0}s", result.layers.len(), result.total_time_s());
//!     }
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod config;
pub mod connection;
pub mod controller;
pub mod dispatch;
pub mod driver;
mod error;
pub mod launcher;
pub mod protocol;
pub mod scene;
pub mod stream;
pub mod supervisor;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

pub use config::BridgeConfig;
pub use dispatch::DispatchTable;
pub use error::*;
pub use launcher::{EngineLauncher, EngineProcess, ProcessLauncher};
pub use scene::{MeshData, MeshReader, Scene, SceneNode, SceneSource, SharedScene, SnapshotBuilder};
pub use supervisor::{EngineLog, RestartPolicy};
pub use types::*;

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use connection::EngineListener;
use driver::{Command, Driver};
use stream::ThrottleExt;

/// Handle to a running bridge.
///
/// Host calls never block on the engine: they queue a request for the
/// control loop and return. Results, progress and engine state are observed
/// through callbacks or streams. Dropping the handle shuts the bridge down
/// and kills the engine.
pub struct SliceBridge {
    commands: mpsc::UnboundedSender<Command>,
    results: watch::Receiver<Option<Arc<SliceResult>>>,
    engine: watch::Receiver<EngineState>,
    progress: watch::Receiver<f32>,
    log: EngineLog,
    port: u16,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SliceBridge {
    /// Start a bridge running the configured engine binary.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The engine binary cannot be found
    /// - The loopback listener cannot be bound
    pub async fn start<S: SceneSource>(config: BridgeConfig, scene: S) -> Result<Self> {
        config.validate()?;
        let launcher = ProcessLauncher::new(&config)?;
        Self::start_with(config, scene, launcher, DispatchTable::standard()).await
    }

    /// Start a bridge with a custom engine launcher
    pub async fn start_with_launcher<S, L>(
        config: BridgeConfig,
        scene: S,
        launcher: L,
    ) -> Result<Self>
    where
        S: SceneSource,
        L: EngineLauncher,
    {
        Self::start_with(config, scene, launcher, DispatchTable::standard()).await
    }

    /// Start a bridge with a custom launcher and inbound dispatch table
    pub async fn start_with<S, L>(
        config: BridgeConfig,
        scene: S,
        launcher: L,
        dispatch: DispatchTable,
    ) -> Result<Self>
    where
        S: SceneSource,
        L: EngineLauncher,
    {
        config.validate()?;
        let listener = EngineListener::bind().await?;
        let port = listener.port();
        let log = EngineLog::new(config.engine_log_max_lines as usize);

        let scene: Arc<dyn SceneSource> = Arc::new(scene);
        let channels = Driver::spawn(config, listener, launcher, scene, dispatch, log.clone());
        info!(port, "Slice bridge started");

        Ok(Self {
            commands: channels.commands,
            results: channels.results,
            engine: channels.engine,
            progress: channels.progress,
            log,
            port,
            cancel: channels.cancel,
            task: Some(channels.task),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Bridge control loop has stopped");
        }
    }

    /// The scene changed; a slice follows once changes settle
    pub fn notify_scene_changed(&self) {
        self.send(Command::SceneChanged);
    }

    /// Slice now, skipping the coalescing window
    pub fn force_slice(&self) {
        self.send(Command::ForceSlice);
    }

    /// Stop starting slices; scene changes are remembered
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Resume slicing, and retry an engine declared unavailable
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Kill and relaunch the engine with a fresh failure budget
    pub fn restart_engine(&self) {
        self.send(Command::RestartEngine);
    }

    /// Most recently published result
    pub fn current_result(&self) -> Option<Arc<SliceResult>> {
        self.results.borrow().clone()
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.borrow().clone()
    }

    /// Loopback port the engine connects to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Retained engine stderr, oldest first
    pub fn engine_log(&self) -> Vec<String> {
        self.log.lines()
    }

    /// Register a callback for every bridge event.
    ///
    /// Callbacks run on the control loop and must not block.
    pub fn on_event<F>(&self, listener: F)
    where
        F: FnMut(&BridgeEvent) + Send + 'static,
    {
        self.send(Command::Subscribe(Box::new(listener)));
    }

    pub fn on_progress<F>(&self, mut listener: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.on_event(move |event| {
            if let BridgeEvent::Progress(fraction) = event {
                listener(*fraction);
            }
        });
    }

    pub fn on_result<F>(&self, mut listener: F)
    where
        F: FnMut(Arc<SliceResult>) + Send + 'static,
    {
        self.on_event(move |event| {
            if let BridgeEvent::ResultReady(result) = event {
                listener(Arc::clone(result));
            }
        });
    }

    pub fn on_engine_state_changed<F>(&self, mut listener: F)
    where
        F: FnMut(&EngineState) + Send + 'static,
    {
        self.on_event(move |event| {
            if let BridgeEvent::EngineStateChanged(state) = event {
                listener(state);
            }
        });
    }

    /// Published results: the current one (if any), then every new one
    pub fn result_updates(&self) -> impl Stream<Item = Arc<SliceResult>> + 'static {
        WatchStream::new(self.results.clone()).filter_map(|result| async move { result })
    }

    /// Engine state: the current state, then every change
    pub fn engine_state_updates(&self) -> impl Stream<Item = EngineState> + 'static {
        WatchStream::new(self.engine.clone())
    }

    /// Progress changes, at most one per `interval`, latest wins
    pub fn progress_updates(&self, interval: Duration) -> impl Stream<Item = f32> + 'static {
        WatchStream::from_changes(self.progress.clone()).throttle(interval)
    }

    /// Stop the control loop, kill the engine and wait for both.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Control loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SliceBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
