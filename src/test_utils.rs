//! Test utilities: payload builders, scene fixtures and a simulated engine
//!
//! Shared by unit tests, scenario tests and benches. The simulated engine
//! speaks the real wire protocol over a real loopback socket, so the bridge
//! under test cannot tell it apart from the engine binary.

#![cfg(any(test, feature = "benchmark"))]

use crate::config::BridgeConfig;

/// Configuration for tests: short coalesce window and fast restarts.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        coalesce_ms: 20,
        restart_backoff_initial_ms: 50,
        restart_backoff_max_ms: 400,
        restart_reset_after_ms: 60_000,
        restart_max_consecutive_failures: 3,
        ..BridgeConfig::new("simulated-engine")
    }
}

/// Engine → host payload builders
pub mod payloads {
    /// `u8 type, u32 count, count × (f32 x, f32 y)`
    pub fn polygon(type_tag: u8, points: &[[f32; 2]]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + points.len() * 8);
        out.push(type_tag);
        out.extend_from_slice(&(points.len() as u32).to_le_bytes());
        for [x, y] in points {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out
    }

    pub fn layer_info(layer_index: u32, polygon_count: u32) -> Vec<u8> {
        let mut out = layer_index.to_le_bytes().to_vec();
        out.extend_from_slice(&polygon_count.to_le_bytes());
        out
    }

    /// Shared layout of `ObjectPrintTime` and `ObjectPrintMaterial`
    pub fn object_estimate(object_id: u64, value: f32) -> Vec<u8> {
        let mut out = object_id.to_le_bytes().to_vec();
        out.extend_from_slice(&value.to_le_bytes());
        out
    }

    pub fn progress(fraction: f32) -> Vec<u8> {
        fraction.to_le_bytes().to_vec()
    }

    /// NUL-terminated text
    pub fn text(value: &str) -> Vec<u8> {
        let mut out = value.as_bytes().to_vec();
        out.push(0);
        out
    }
}

/// Scene fixtures
pub mod scenes {
    use crate::scene::{MeshData, Scene, SceneNode};
    use crate::types::Transform;

    pub const TRIANGLE: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

    /// Node id of the object in [`single_triangle`]
    pub const TRIANGLE_NODE_ID: u64 = 1;

    /// One printable triangle with a global layer height
    pub fn single_triangle() -> Scene {
        let mut scene = Scene::new().with_setting("layer_height", 0.2);
        let mesh = MeshData::triangles(TRIANGLE.to_vec());
        scene.add(SceneNode::object(TRIANGLE_NODE_ID, "triangle", mesh));
        scene
    }

    /// A grid of `count` objects, each a strip of `triangles` triangles
    pub fn grid(count: u64, triangles: usize) -> Scene {
        let mut scene =
            Scene::new().with_setting("layer_height", 0.1).with_setting("infill", 20i64);
        for id in 1..=count {
            let mut vertices = Vec::with_capacity(triangles * 3);
            for t in 0..triangles {
                let x = t as f32;
                vertices.extend([[x, 0.0, 0.0], [x + 1.0, 0.0, 0.0], [x, 1.0, 0.0]]);
            }
            let node = SceneNode::object(id, format!("part-{}", id), MeshData::triangles(vertices))
                .with_transform(Transform::translation(id as f32 * 10.0, 0.0, 0.0));
            scene.add(node);
        }
        scene
    }
}

/// In-process engine that connects back to the bridge like the real binary
pub mod engine {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;

    use super::payloads;
    use crate::launcher::{EngineLauncher, EngineProcess};
    use crate::protocol::{self, commands};
    use crate::supervisor::EngineLog;
    use crate::types::Frame;
    use crate::{BridgeError, Result};

    /// How long harness waits block before failing the test
    pub const WAIT: Duration = Duration::from_secs(5);

    pub const IDENTIFIER: &str = "simulated-engine";
    pub const VERSION: &str = "5.0.0";

    struct Control {
        shutdown: CancellationToken,
        exit: Mutex<Option<oneshot::Sender<Option<i32>>>>,
    }

    impl Control {
        fn exit(&self, code: Option<i32>) {
            self.shutdown.cancel();
            let sender = self.exit.lock().ok().and_then(|mut exit| exit.take());
            if let Some(sender) = sender {
                let _ = sender.send(code);
            }
        }
    }

    /// Create a launcher and the harness that observes its engines
    pub fn simulated() -> (SimulatedLauncher, EngineHarness) {
        let (engines_tx, engines_rx) = mpsc::unbounded_channel();
        let launches = Arc::new(AtomicU32::new(0));
        let failing = Arc::new(AtomicU32::new(0));
        let launcher = SimulatedLauncher {
            engines: engines_tx,
            launches: Arc::clone(&launches),
            failing: Arc::clone(&failing),
        };
        (launcher, EngineHarness { engines: engines_rx, launches, failing })
    }

    pub struct SimulatedLauncher {
        engines: mpsc::UnboundedSender<SimulatedEngine>,
        launches: Arc<AtomicU32>,
        failing: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl EngineLauncher for SimulatedLauncher {
        async fn launch(&mut self, port: u16, log: &EngineLog) -> Result<Box<dyn EngineProcess>> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = self
                .failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(BridgeError::Spawn {
                    path: "simulated-engine".into(),
                    source: std::io::Error::other("launch refused by harness"),
                });
            }

            let stream = TcpStream::connect(("127.0.0.1", port))
                .await
                .map_err(|e| BridgeError::io_error("simulated engine connect", e))?;
            log.push(format!("simulated engine #{} connected to {}", launch, port));

            let (exit_tx, exit_rx) = oneshot::channel();
            let control = Arc::new(Control {
                shutdown: CancellationToken::new(),
                exit: Mutex::new(Some(exit_tx)),
            });
            let engine = SimulatedEngine::spawn(stream, launch, Arc::clone(&control));
            let _ = self.engines.send(engine);
            Ok(Box::new(SimulatedProcess { pid: 40_000 + launch, exit: Some(exit_rx), control }))
        }
    }

    struct SimulatedProcess {
        pid: u32,
        exit: Option<oneshot::Receiver<Option<i32>>>,
        control: Arc<Control>,
    }

    #[async_trait::async_trait]
    impl EngineProcess for SimulatedProcess {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn wait(&mut self) -> Result<Option<i32>> {
            match self.exit.as_mut() {
                Some(exit) => {
                    let code = exit.await.unwrap_or(None);
                    self.exit = None;
                    Ok(code)
                }
                None => Ok(None),
            }
        }

        async fn kill(&mut self) -> Result<()> {
            self.control.exit(None);
            Ok(())
        }
    }

    /// Observes engines started by a [`SimulatedLauncher`]
    pub struct EngineHarness {
        engines: mpsc::UnboundedReceiver<SimulatedEngine>,
        launches: Arc<AtomicU32>,
        failing: Arc<AtomicU32>,
    }

    impl EngineHarness {
        /// The next engine the bridge launched
        pub async fn next_engine(&mut self) -> SimulatedEngine {
            tokio::time::timeout(WAIT, self.engines.recv())
                .await
                .expect("timed out waiting for an engine launch")
                .expect("launcher dropped")
        }

        /// Make the next `n` launches fail
        pub fn fail_next_launches(&self, n: u32) {
            self.failing.store(n, Ordering::SeqCst);
        }

        pub fn launch_count(&self) -> u32 {
            self.launches.load(Ordering::SeqCst)
        }
    }

    /// Test-side handle to one simulated engine.
    ///
    /// `IdentifierRequest` and `VersionRequest` are answered automatically on
    /// the same write queue the test uses, so replies keep their order
    /// relative to frames the test sends.
    pub struct SimulatedEngine {
        pub launch: u32,
        inbound: mpsc::UnboundedReceiver<Frame>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        auto_identify: Arc<AtomicBool>,
        control: Arc<Control>,
    }

    impl SimulatedEngine {
        fn spawn(stream: TcpStream, launch: u32, control: Arc<Control>) -> Self {
            let (read_half, mut write_half) = stream.into_split();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

            let shutdown = control.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        bytes = outbound_rx.recv() => match bytes {
                            Some(bytes) => {
                                if write_half.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
                let _ = write_half.shutdown().await;
            });

            let auto_identify = Arc::new(AtomicBool::new(true));
            let identify = Arc::clone(&auto_identify);
            let shutdown = control.shutdown.clone();
            let replies = outbound_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                loop {
                    let frame = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        frame = protocol::read_frame(&mut reader, u32::MAX) => frame,
                    };
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        _ => break,
                    };
                    let reply = match frame.command_id {
                        commands::IDENTIFIER_REQUEST if identify.load(Ordering::SeqCst) => {
                            Some((commands::IDENTIFIER_REPLY, payloads::text(IDENTIFIER)))
                        }
                        commands::VERSION_REQUEST => {
                            Some((commands::VERSION_REPLY, payloads::text(VERSION)))
                        }
                        _ => None,
                    };
                    if let Some((id, payload)) = reply {
                        if let Ok(bytes) = protocol::encode(id, &payload) {
                            let _ = replies.send(bytes);
                        }
                    }
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
            });

            Self { launch, inbound: inbound_rx, outbound: outbound_tx, auto_identify, control }
        }

        /// Stop answering `IdentifierRequest`; the test replies with [`Self::identify`]
        pub fn hold_identifier_replies(&self) {
            self.auto_identify.store(false, Ordering::SeqCst);
        }

        pub fn identify(&self) {
            self.send(commands::IDENTIFIER_REPLY, payloads::text(IDENTIFIER));
        }

        /// Next frame within `wait`, `None` on timeout or close
        pub async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
            tokio::time::timeout(wait, self.inbound.recv()).await.ok().flatten()
        }

        /// Next frame from the bridge, `None` once the bridge closed the socket
        pub async fn recv(&mut self) -> Option<Frame> {
            tokio::time::timeout(WAIT, self.inbound.recv())
                .await
                .expect("timed out waiting for a frame from the bridge")
        }

        /// Skip frames until one with `command_id` arrives
        pub async fn expect_command(&mut self, command_id: u32) -> Frame {
            loop {
                match self.recv().await {
                    Some(frame) if frame.command_id == command_id => return frame,
                    Some(_) => continue,
                    None => panic!("bridge closed before {}", commands::label(command_id)),
                }
            }
        }

        /// Frames of the next upload, ending with `ProcessMesh`.
        ///
        /// Handshake and cancellation frames are skipped.
        pub async fn expect_upload(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            loop {
                let frame = match self.recv().await {
                    Some(frame) => frame,
                    None => panic!("bridge closed during upload"),
                };
                match frame.command_id {
                    commands::IDENTIFIER_REQUEST
                    | commands::VERSION_REQUEST
                    | commands::CANCEL => {}
                    commands::PROCESS_MESH => {
                        frames.push(frame);
                        return frames;
                    }
                    _ => frames.push(frame),
                }
            }
        }

        /// Wait until the bridge closes its side of the socket
        pub async fn expect_closed(&mut self) {
            while self.recv().await.is_some() {}
        }

        pub fn send(&self, command_id: u32, payload: impl AsRef<[u8]>) {
            let bytes =
                protocol::encode(command_id, payload.as_ref()).expect("encodable test frame");
            let _ = self.outbound.send(bytes);
        }

        /// Write bytes without framing
        pub fn send_raw(&self, bytes: Vec<u8>) {
            let _ = self.outbound.send(bytes);
        }

        pub fn send_progress(&self, fraction: f32) {
            self.send(commands::PROGRESS, payloads::progress(fraction));
        }

        /// Stream a complete result of `layers` single-polygon layers
        pub fn send_result(&self, layers: u32) {
            self.send(commands::GCODE_PREFIX, b";prefix\n");
            for index in 0..layers {
                self.send(commands::LAYER_INFO, payloads::layer_info(index, 1));
                let points = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
                self.send(commands::POLYGON, payloads::polygon(1, &points));
                self.send(commands::GCODE_LAYER, format!(";layer {}\n", index));
            }
            self.send(commands::GCODE_SUFFIX, b";suffix\n");
            self.send(commands::SLICE_FINISHED, [0u8; 0]);
        }

        /// Exit with `code` after closing the socket
        pub fn crash(&self, code: i32) {
            self.control.exit(Some(code));
        }

        /// Exit cleanly
        pub fn exit(&self) {
            self.control.exit(Some(0));
        }
    }
}
