//! End-to-end slicing scenarios against the simulated engine

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use crate::protocol::{self, commands, payload};
use crate::test_utils::engine::{self, EngineHarness, SimulatedEngine, WAIT};
use crate::test_utils::{payloads, scenes, test_config};
use crate::types::{BridgeEvent, EnginePhase, EngineState, SliceResult, Transform};
use crate::{BridgeConfig, DispatchTable, MeshData, Scene, SceneNode, SharedScene, SliceBridge};

/// How long to watch for frames that must not arrive
const QUIET: Duration = Duration::from_millis(300);

struct Harness {
    bridge: SliceBridge,
    scene: SharedScene,
    engines: EngineHarness,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
}

async fn start(scene: Scene) -> Harness {
    start_with(scene, test_config(), DispatchTable::standard()).await
}

async fn start_with(scene: Scene, config: BridgeConfig, dispatch: DispatchTable) -> Harness {
    let _ = tracing_subscriber::fmt::try_init();
    let scene = SharedScene::new(scene);
    let (launcher, engines) = engine::simulated();
    let bridge = SliceBridge::start_with(config, scene.clone(), launcher, dispatch).await.unwrap();

    let (tx, events) = mpsc::unbounded_channel();
    bridge.on_event(move |event| {
        let _ = tx.send(event.clone());
    });
    Harness { bridge, scene, engines, events }
}

impl Harness {
    /// Next engine, once the bridge has identified it
    async fn ready_engine(&mut self) -> SimulatedEngine {
        let mut engine = self.engines.next_engine().await;
        engine.expect_command(commands::IDENTIFIER_REQUEST).await;
        engine.expect_command(commands::VERSION_REQUEST).await;
        self.wait_for_state(|state| state.is_ready() && state.version.is_some()).await;
        engine
    }

    async fn wait_for_state(&self, predicate: impl Fn(&EngineState) -> bool) -> EngineState {
        let mut states = pin!(self.bridge.engine_state_updates());
        timeout(WAIT, async {
            while let Some(state) = states.next().await {
                if predicate(&state) {
                    return state;
                }
            }
            panic!("engine state stream ended");
        })
        .await
        .expect("timed out waiting for engine state")
    }

    async fn next_result(&self) -> Arc<SliceResult> {
        let mut results = pin!(self.bridge.result_updates());
        timeout(WAIT, results.next()).await.expect("timed out waiting for a result").unwrap()
    }

    async fn next_event(&mut self, predicate: impl Fn(&BridgeEvent) -> bool) -> BridgeEvent {
        timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return event;
                }
            }
            panic!("event stream ended");
        })
        .await
        .expect("timed out waiting for an event")
    }

    /// Events delivered so far
    fn drain_events(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn ids(frames: &[crate::types::Frame]) -> Vec<u32> {
    frames.iter().map(|f| f.command_id).collect()
}

fn u32_payload(frame: &crate::types::Frame) -> u32 {
    u32::from_le_bytes(frame.payload[..4].try_into().unwrap())
}

#[tokio::test]
async fn happy_path() {
    let mut h = start(scenes::single_triangle()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.notify_scene_changed();
    let upload = engine.expect_upload().await;
    assert_eq!(
        ids(&upload),
        vec![
            commands::SETTING,
            commands::OBJECT_COUNT,
            commands::OBJECT_LIST,
            commands::OBJECT_MATRIX,
            commands::MESH_LIST,
            commands::VERTEX_LIST,
            commands::PROCESS_MESH,
        ]
    );
    assert_eq!(&upload[0].payload[..], b"layer_height\x000.2\x00");
    assert_eq!(u32_payload(&upload[1]), 1);
    assert_eq!(u32_payload(&upload[2]), 1);
    assert_eq!(&upload[3].payload[..], &payload::matrix(&Transform::IDENTITY)[..]);
    assert_eq!(u32_payload(&upload[4]), 1);
    assert_eq!(upload[5].len(), 36);
    assert_eq!(&upload[5].payload[..], &payload::f32_triples(&scenes::TRIANGLE)[..]);

    engine.send(commands::LAYER_INFO, payloads::layer_info(0, 1));
    engine.send(commands::POLYGON, payloads::polygon(0, &[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]));
    engine.send(commands::GCODE_PREFIX, b"G28\n");
    engine.send(commands::GCODE_LAYER, b"G1 X1\n");
    engine.send(commands::SLICE_FINISHED, [0u8; 0]);

    let result = h.next_result().await;
    assert!(result.complete);
    assert_eq!(result.layers.len(), 1);
    assert_eq!(result.layers[0].polygons[0].type_tag, 0);
    assert_eq!(result.layers[0].polygons[0].points, vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
    assert_eq!(result.gcode_text(), "G28\nG1 X1\n");
    assert_eq!(h.bridge.current_result().unwrap().snapshot_id, result.snapshot_id);

    let published = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, BridgeEvent::ResultReady(_)))
        .count();
    assert_eq!(published, 1);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn edits_inside_the_window_coalesce() {
    let config = BridgeConfig { coalesce_ms: 300, ..test_config() };
    let mut h = start_with(scenes::single_triangle(), config, DispatchTable::standard()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.notify_scene_changed();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.scene.update(|scene| {
        scene.global_settings.insert("layer_height".into(), 0.1.into());
    });
    h.bridge.notify_scene_changed();

    let upload = engine.expect_upload().await;
    assert_eq!(&upload[0].payload[..], b"layer_height\x000.1\x00");
    // The first request never started uploading, so nothing was cancelled
    assert!(engine.recv_within(QUIET).await.is_none());
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn mid_slice_edit_cancels_and_drops_stale_frames() {
    let mut h = start(scenes::single_triangle()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.force_slice();
    engine.expect_upload().await;
    engine.hold_identifier_replies();
    engine.send_progress(0.5);
    engine.send(commands::LAYER_INFO, payloads::layer_info(0, 1));
    h.next_event(|e| matches!(e, BridgeEvent::Progress(p) if *p == 0.5)).await;

    h.scene.update(|scene| {
        scene.add(SceneNode::object(2, "second", MeshData::triangles(scenes::TRIANGLE.to_vec())));
    });
    h.bridge.force_slice();

    engine.expect_command(commands::CANCEL).await;
    engine.expect_command(commands::IDENTIFIER_REQUEST).await;
    // The engine was still working on the old snapshot
    engine.send(commands::POLYGON, payloads::polygon(0, &[[0.0, 0.0], [1.0, 0.0]]));
    engine.send(commands::SLICE_FINISHED, [0u8; 0]);
    engine.identify();

    let upload = engine.expect_upload().await;
    assert_eq!(u32_payload(&upload[1]), 2);
    engine.send_result(2);

    let result = h.next_result().await;
    assert_eq!(result.layers.len(), 2);
    assert_eq!(result.gcode_text(), ";prefix\n;layer 0\n;layer 1\n;suffix\n");

    let published: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            BridgeEvent::ResultReady(result) => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].snapshot_id, result.snapshot_id);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn engine_crash_restarts_and_reuploads() {
    let mut h = start(scenes::single_triangle()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.force_slice();
    engine.expect_upload().await;
    engine.send_progress(0.25);
    h.next_event(|e| matches!(e, BridgeEvent::Progress(p) if *p == 0.25)).await;

    let crashed_at = Instant::now();
    engine.crash(3);
    let failed = h.wait_for_state(|state| state.last_exit_code == Some(3)).await;
    assert_eq!(failed.consecutive_failures, 1);
    assert!(!failed.child_alive);
    // Progress is reset when the request fails
    h.next_event(|e| matches!(e, BridgeEvent::Progress(p) if *p == 0.0)).await;

    let mut replacement = h.ready_engine().await;
    let backoff = Duration::from_millis(test_config().restart_backoff_initial_ms as u64);
    assert!(crashed_at.elapsed() >= backoff);
    assert_eq!(replacement.launch, 2);

    // The scene is still dirty, so the new engine gets it without a host call
    let upload = replacement.expect_upload().await;
    assert_eq!(upload.last().unwrap().command_id, commands::PROCESS_MESH);
    replacement.send_result(1);
    let result = h.next_result().await;
    assert_eq!(result.layers.len(), 1);
    assert!(h.bridge.engine_state().restart_count >= 1);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn oversize_frame_closes_the_connection() {
    let config = BridgeConfig { max_frame_bytes: 64, ..test_config() };
    let mut h = start_with(scenes::single_triangle(), config, DispatchTable::standard()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.force_slice();
    engine.expect_upload().await;
    engine.send_raw(protocol::codec::encode_header(commands::POLYGON, 65).to_vec());
    engine.expect_closed().await;

    let state = h.wait_for_state(|state| state.consecutive_failures == 1).await;
    assert_eq!(state.last_exit_code, None);

    // Restart policy engaged: a new engine gets the scene again
    let mut replacement = h.ready_engine().await;
    replacement.expect_upload().await;
    assert!(h.bridge.current_result().is_none());
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn empty_scene_sends_nothing() {
    let mut scene = Scene::new();
    let modifier = MeshData::triangles(scenes::TRIANGLE.to_vec());
    scene.add(SceneNode::object(7, "modifier", modifier).non_printing());
    let mut h = start(scene).await;
    let mut engine = h.ready_engine().await;

    h.bridge.notify_scene_changed();
    h.next_event(|e| matches!(e, BridgeEvent::EmptyScene)).await;
    assert!(engine.recv_within(QUIET).await.is_none());
    assert!(h.bridge.current_result().is_none());

    let events = h.drain_events();
    let empty = events.iter().filter(|e| matches!(e, BridgeEvent::EmptyScene)).count();
    assert_eq!(empty, 0, "EmptyScene must be emitted once");
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn emptied_scene_withdraws_the_result() {
    let mut h = start(scenes::single_triangle()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.force_slice();
    engine.expect_upload().await;
    engine.send_result(1);
    h.next_result().await;

    h.scene.replace(Scene::new());
    h.bridge.force_slice();
    h.next_event(|e| matches!(e, BridgeEvent::EmptyScene)).await;
    assert!(h.bridge.current_result().is_none());
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn exhausted_budget_reports_unavailable_until_resume() {
    let mut h = start_with(Scene::new(), test_config(), DispatchTable::standard()).await;
        let engine = h.ready_engine().await;
    // The crash is the first failure; two failed relaunches exhaust the budget
    h.engines.fail_next_launches(2);
    engine.crash(1);

    match h.next_event(|e| matches!(e, BridgeEvent::EngineUnavailable { .. })).await {
        BridgeEvent::EngineUnavailable { failures } => assert_eq!(failures, 3),
        other => panic!("Expected EngineUnavailable, got {other:?}"),
    }
    assert_eq!(h.engines.launch_count(), 3);
    assert_eq!(h.bridge.engine_state().phase, EnginePhase::Unavailable);

    h.bridge.resume();
    let engine = h.ready_engine().await;
    assert_eq!(engine.launch, 4);
    assert_eq!(h.bridge.engine_state().consecutive_failures, 0);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn explicit_restart_is_not_a_failure() {
    let mut h = start(Scene::new()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.restart_engine();
    engine.expect_closed().await;
    let replacement = h.ready_engine().await;
    assert_eq!(replacement.launch, 2);
    assert_eq!(h.bridge.engine_state().consecutive_failures, 0);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn clean_exit_relaunches_immediately() {
    let mut h = start(Scene::new()).await;
    let engine = h.ready_engine().await;
    engine.exit();

    let replacement = h.ready_engine().await;
    assert_eq!(replacement.launch, 2);
    let state = h.bridge.engine_state();
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.last_exit_code, Some(0));
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn paused_bridge_slices_on_resume() {
    let mut h = start(scenes::single_triangle()).await;
    let mut engine = h.ready_engine().await;

    h.bridge.pause();
    h.bridge.notify_scene_changed();
    assert!(engine.recv_within(QUIET).await.is_none());

    h.bridge.resume();
    let upload = engine.expect_upload().await;
    assert_eq!(upload.last().unwrap().command_id, commands::PROCESS_MESH);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn extension_frames_reach_listeners() {
    let mut dispatch = DispatchTable::standard();
    dispatch.register_extension(0x0040_0001, "OptimizedLayerData");
    let mut h = start_with(Scene::new(), test_config(), dispatch).await;
    let engine = h.ready_engine().await;

    engine.send(0x0040_0002, b"unknown");
    engine.send(0x0040_0001, b"layer-data");
    match h.next_event(|e| matches!(e, BridgeEvent::Extension { .. })).await {
        BridgeEvent::Extension { command_id, payload } => {
            assert_eq!(command_id, 0x0040_0001);
            assert_eq!(&payload[..], b"layer-data");
        }
        other => panic!("Expected extension, got {other:?}"),
    }
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn identity_is_reported() {
    let mut h = start(Scene::new()).await;
    let _engine = h.ready_engine().await;
    let state = h.wait_for_state(|state| state.identifier.is_some()).await;
    assert_eq!(state.identifier.as_deref(), Some(engine::IDENTIFIER));
    assert_eq!(state.version.as_deref(), Some(engine::VERSION));
    assert_eq!(state.phase, EnginePhase::Ready);
    assert_eq!(state.port, h.bridge.port());
    assert!(!h.bridge.engine_log().is_empty());
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn shutdown_kills_the_engine() {
    let mut h = start(Scene::new()).await;
    let mut engine = h.ready_engine().await;
    let mut states = h.bridge.engine_state_updates();
    h.bridge.shutdown().await;

    engine.expect_closed().await;
    let mut last = None;
    while let Some(state) = states.next().await {
        last = Some(state);
    }
    let last = last.unwrap();
    assert!(!last.child_alive);
    assert_eq!(last.phase, EnginePhase::Exited);
}

#[tokio::test]
async fn shutdown_is_not_an_engine_failure() {
    for round in 0..10 {
        let config = BridgeConfig { restart_max_consecutive_failures: 1, ..test_config() };
        let mut h = start_with(Scene::new(), config, DispatchTable::standard()).await;
        let _engine = h.ready_engine().await;
        let Harness { bridge, mut events, .. } = h;
        let mut states = bridge.engine_state_updates();
        bridge.shutdown().await;

        let mut last = None;
        while let Some(state) = states.next().await {
            assert_ne!(state.phase, EnginePhase::Failed, "round {round}");
            assert_ne!(state.phase, EnginePhase::Unavailable, "round {round}");
            last = Some(state);
        }
        let last = last.unwrap();
        assert_eq!(last.phase, EnginePhase::Exited, "round {round}");
        assert_eq!(last.consecutive_failures, 0, "round {round}");
        assert_eq!(last.restart_count, 0, "round {round}");

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, BridgeEvent::EngineUnavailable { .. }), "round {round}");
        }
    }
}
