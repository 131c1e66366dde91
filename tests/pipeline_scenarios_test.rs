use camstream::core::CameraId;
use camstream::engine::SourceState;
use camstream::hal::mock::SimulatedCamera;
use camstream::error::DeviceError;
use camstream::hal::{CameraHandle, Grab};
use camstream::storage::{DiskSink, FrameSink, SaveDirectoryMap};
use camstream::{PipelineConfig, PipelineCoordinator, PipelineError};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

fn camera(id: &str, frames: u64) -> Box<dyn CameraHandle> {
    Box::new(
        SimulatedCamera::new(id)
            .with_frames(frames)
            .with_interval(Duration::from_millis(1)),
    )
}

fn config(dirs: SaveDirectoryMap, workers: usize, capacity: usize) -> PipelineConfig {
    PipelineConfig {
        save_dirs: dirs,
        workers,
        channel_capacity: capacity,
        grab_timeout_ms: 20,
        ..Default::default()
    }
}

fn two_camera_dirs() -> (TempDir, SaveDirectoryMap) {
    let root = tempdir().unwrap();
    let dirs = SaveDirectoryMap::new()
        .with("camA", root.path().join("camA"))
        .with("camB", root.path().join("camB"));
    (root, dirs)
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_two_cameras_all_frames_saved() {
    let (root, dirs) = two_camera_dirs();
    let mut coordinator = PipelineCoordinator::new(
        config(dirs, 2, 3),
        vec![camera("camA", 5), camera("camB", 5)],
    );

    let report = coordinator.run().await.unwrap();

    assert_eq!(coordinator.state().name(), "Stopped");
    assert_eq!(report.final_state, "Stopped");
    assert_eq!(report.captured(), 10);
    assert_eq!(report.saved(), 10);
    assert_eq!(report.lost(), 0);
    assert!(!report.drain_timed_out);

    let expected: Vec<String> = (0..5).map(|i| format!("camA_{}.raw", i)).collect();
    assert_eq!(files_in(&root.path().join("camA")), expected);
    assert_eq!(files_in(&root.path().join("camB")).len(), 5);
}

#[tokio::test]
async fn test_unmapped_camera_reported_as_unknown() {
    let root = tempdir().unwrap();
    let dirs = SaveDirectoryMap::new().with("camA", root.path().join("camA"));
    let mut coordinator = PipelineCoordinator::new(
        config(dirs, 2, 3),
        vec![camera("camA", 5), camera("camB", 5)],
    );

    let report = coordinator.run().await.unwrap();

    assert_eq!(coordinator.state().name(), "Stopped");
    assert_eq!(report.camera("camA").unwrap().saved, 5);
    let cam_b = report.camera("camB").unwrap();
    assert_eq!(cam_b.unknown_camera, 5);
    assert_eq!(cam_b.saved, 0);
    assert_eq!(report.unknown_camera(), 5);
    assert_eq!(files_in(&root.path().join("camA")).len(), 5);
    assert!(!root.path().join("camB").exists());
}

#[tokio::test]
async fn test_cancellation_drains_captured_frames() {
    let (root, dirs) = two_camera_dirs();
    let (cam_a, trigger_a) = SimulatedCamera::manual("camA");
    let (cam_b, trigger_b) = SimulatedCamera::manual("camB");
    let released = cam_a.released_flag();

    let mut pipeline_config = config(dirs, 2, 3);
    pipeline_config.drain_timeout_ms = Some(5_000);
    let mut coordinator =
        PipelineCoordinator::new(pipeline_config, vec![Box::new(cam_a), Box::new(cam_b)]);
    let cancel = coordinator.cancel_handle();

    let operator = tokio::spawn(async move {
        for _ in 0..2 {
            trigger_a.fire();
            trigger_b.fire();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        // Triggers stay alive until the run is over; dropping one reads as a disconnect
        (trigger_a, trigger_b)
    });

    let report = coordinator.run().await.unwrap();
    let _triggers = operator.await.unwrap();

    assert_eq!(coordinator.state().name(), "Stopped");
    assert!(!report.drain_timed_out);
    for id in ["camA", "camB"] {
        let camera = report.camera(id).unwrap();
        assert_eq!(camera.source, SourceState::Cancelled);
        assert_eq!(camera.captured, 2);
        assert_eq!(camera.saved, 2);
    }
    assert_eq!(files_in(&root.path().join("camA")), vec!["camA_0.raw", "camA_1.raw"]);
    assert!(released.load(Ordering::Acquire));
}

/// Fails every write made by worker 0. The other workers hold their first
/// frame until worker 0 has tried a write, so worker 0 always gets work.
#[derive(Default)]
struct BrokenWorkerSink {
    worker0_tried: AtomicBool,
}

impl FrameSink for BrokenWorkerSink {
    fn persist(&self, worker: usize, path: &Path, payload: &[u8]) -> io::Result<()> {
        if worker == 0 {
            self.worker0_tried.store(true, Ordering::Release);
            return Err(io::Error::new(io::ErrorKind::Other, "bad sector"));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.worker0_tried.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        DiskSink::new().persist(worker, path, payload)
    }
}

#[tokio::test]
async fn test_failing_worker_losses_equal_failed_writes() {
    let (_root, dirs) = two_camera_dirs();
    let mut pipeline_config = config(dirs, 3, 3);
    // Held writes would otherwise block later frames of the same camera
    pipeline_config.preserve_camera_order = false;
    let mut coordinator = PipelineCoordinator::new(
        pipeline_config,
        vec![camera("camA", 5), camera("camB", 5)],
    )
    .with_sink(Arc::new(BrokenWorkerSink::default()));

    let report = coordinator.run().await.unwrap();

    assert_eq!(coordinator.state().name(), "Stopped");
    assert!(report.write_failures() > 0);
    assert_eq!(report.saved() + report.write_failures(), 10);
    assert_eq!(report.lost(), report.write_failures());

    for id in ["camA", "camB"] {
        let cam = report.camera(id).unwrap();
        assert_eq!(cam.captured, 5);
        assert_eq!(
            cam.captured,
            cam.saved + cam.write_failures + cam.unknown_camera + cam.abandoned,
            "{} frames unaccounted",
            id
        );
    }

    let broken = report.workers.iter().find(|w| w.worker == 0).unwrap();
    assert_eq!(broken.frames_written, 0);
    assert_eq!(broken.write_failures, report.write_failures());
}

#[tokio::test]
async fn test_zero_capacity_channel() {
    let (root, dirs) = two_camera_dirs();
    let mut coordinator = PipelineCoordinator::new(
        config(dirs, 2, 0),
        vec![camera("camA", 5), camera("camB", 5)],
    );

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.saved(), 10);
    assert_eq!(report.lost(), 0);
    assert_eq!(files_in(&root.path().join("camB")).len(), 5);
}

/// Records write order; even frames are slow so they would be overtaken
/// without per-camera ordering.
#[derive(Default)]
struct OrderRecorder {
    writes: Mutex<BTreeMap<CameraId, Vec<u64>>>,
}

impl FrameSink for OrderRecorder {
    fn persist(&self, _worker: usize, path: &Path, _payload: &[u8]) -> io::Result<()> {
        let stem = path.file_stem().unwrap().to_string_lossy().into_owned();
        let (camera, frame_id) = stem.rsplit_once('_').unwrap();
        let frame_id: u64 = frame_id.parse().unwrap();
        if frame_id % 2 == 0 {
            std::thread::sleep(Duration::from_millis(3));
        }
        self.writes
            .lock()
            .unwrap()
            .entry(CameraId::from(camera))
            .or_default()
            .push(frame_id);
        Ok(())
    }
}

#[tokio::test]
async fn test_frames_written_in_capture_order_per_camera() {
    let (_root, dirs) = two_camera_dirs();
    let recorder = Arc::new(OrderRecorder::default());
    let mut coordinator = PipelineCoordinator::new(
        config(dirs, 4, 8),
        vec![camera("camA", 20), camera("camB", 20)],
    )
    .with_sink(recorder.clone());

    let report = coordinator.run().await.unwrap();
    assert_eq!(report.saved(), 40);

    let writes = recorder.writes.lock().unwrap();
    for id in ["camA", "camB"] {
        let order = &writes[&CameraId::from(id)];
        let expected: Vec<u64> = (0..20).collect();
        assert_eq!(order, &expected, "{} written out of order", id);
    }
}

/// Blocks every write until the gate sender is dropped
struct StuckSink {
    gate: crossbeam_channel::Receiver<()>,
}

impl FrameSink for StuckSink {
    fn persist(&self, _worker: usize, _path: &Path, _payload: &[u8]) -> io::Result<()> {
        let _ = self.gate.recv_timeout(Duration::from_secs(5));
        Err(io::Error::new(io::ErrorKind::TimedOut, "disk stuck"))
    }
}

#[tokio::test]
async fn test_drain_timeout_forces_teardown() {
    let root = tempdir().unwrap();
    let dirs = SaveDirectoryMap::new().with("camA", root.path());
    let (gate_tx, gate) = crossbeam_channel::bounded::<()>(0);
    let cam = SimulatedCamera::new("camA").with_interval(Duration::from_millis(1));
    let released = cam.released_flag();

    let mut pipeline_config = config(dirs, 1, 2);
    pipeline_config.drain_timeout_ms = Some(100);
    let mut coordinator = PipelineCoordinator::new(pipeline_config, vec![Box::new(cam)])
        .with_sink(Arc::new(StuckSink { gate }));
    let cancel = coordinator.cancel_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let report = coordinator.run().await.unwrap();
    drop(gate_tx);

    assert_eq!(coordinator.state().name(), "Stopped");
    assert!(report.drain_timed_out);
    assert!(report.unacknowledged > 0);

    let cam_a = report.camera("camA").unwrap();
    assert_eq!(cam_a.saved, 0);
    assert!(cam_a.abandoned > 0);
    assert_eq!(
        cam_a.captured,
        cam_a.saved + cam_a.write_failures + cam_a.unknown_camera + cam_a.abandoned + cam_a.unacknowledged
    );
    assert!(released.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_camera_failure_does_not_stop_others() {
    let (_root, dirs) = two_camera_dirs();
    let failing = Box::new(
        SimulatedCamera::new("camA")
            .with_interval(Duration::from_millis(1))
            .fail_after(2),
    );
    let mut coordinator =
        PipelineCoordinator::new(config(dirs, 2, 3), vec![failing, camera("camB", 5)]);

    let report = coordinator.run().await.unwrap();

    assert_eq!(coordinator.state().name(), "Stopped");
    assert_eq!(report.failed_cameras(), vec![&CameraId::from("camA")]);
    assert_eq!(report.camera("camA").unwrap().saved, 2);
    assert_eq!(report.camera("camB").unwrap().saved, 5);
}

#[tokio::test]
async fn test_missing_expected_camera_fails_setup() {
    let root = tempdir().unwrap();
    let mut pipeline_config = config(SaveDirectoryMap::new().with("camA", root.path()), 2, 3);
    pipeline_config.expected_cameras = vec![CameraId::from("camA"), CameraId::from("camB")];
    let cam = SimulatedCamera::new("camA").with_frames(1);
    let released = cam.released_flag();

    let mut coordinator = PipelineCoordinator::new(pipeline_config, vec![Box::new(cam)]);
    let err = coordinator.run().await.unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(ref msg) if msg.contains("camB")));
    assert_eq!(coordinator.state().name(), "Failed");
    assert!(released.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_report_written_as_json() {
    let (root, dirs) = two_camera_dirs();
    let report_path = root.path().join("report.json");
    let mut pipeline_config = config(dirs, 2, 3);
    pipeline_config.report_path = Some(report_path.clone());

    let mut coordinator = PipelineCoordinator::new(pipeline_config, vec![camera("camA", 3)]);
    coordinator.run().await.unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["final_state"], "Stopped");
    assert_eq!(json["cameras"]["camA"]["saved"], 3);
    assert_eq!(json["cameras"]["camA"]["source"]["state"], "finished");
}

#[tokio::test]
async fn test_frame_log_lists_every_published_frame() {
    let (root, dirs) = two_camera_dirs();
    let log_path = root.path().join("frames.csv");
    let mut pipeline_config = config(dirs, 2, 3);
    pipeline_config.frame_log = Some(log_path.clone());

    let mut coordinator = PipelineCoordinator::new(
        pipeline_config,
        vec![camera("camA", 5), camera("camB", 5)],
    );
    let report = coordinator.run().await.unwrap();
    assert_eq!(report.captured(), 10);

    let text = std::fs::read_to_string(&log_path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("camera,frame_id,timestamp_us"));

    let mut per_camera: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    let mut rows = 0;
    for line in lines {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 3, "malformed row {:?}", line);
        per_camera
            .entry(fields[0].to_string())
            .or_default()
            .push(fields[1].parse().unwrap());
        rows += 1;
    }
    assert_eq!(rows, 10);
    for id in ["camA", "camB"] {
        assert_eq!(per_camera[id], (0..5).collect::<Vec<u64>>());
    }
}

#[tokio::test]
async fn test_unwritable_frame_log_fails_setup() {
    let (root, dirs) = two_camera_dirs();
    let mut pipeline_config = config(dirs, 2, 3);
    pipeline_config.frame_log = Some(root.path().join("no_such_dir").join("frames.csv"));
    let cam = SimulatedCamera::new("camA").with_frames(1);
    let released = cam.released_flag();

    let mut coordinator = PipelineCoordinator::new(pipeline_config, vec![Box::new(cam)]);
    let err = coordinator.run().await.unwrap_err();

    assert!(matches!(err, PipelineError::FrameLog { .. }));
    assert_eq!(coordinator.state().name(), "Failed");
    assert!(released.load(Ordering::Acquire));
}

/// Driver whose grab call panics; records whether it was released
struct PanickingCamera {
    id: CameraId,
    released: Arc<AtomicBool>,
}

impl CameraHandle for PanickingCamera {
    fn camera_id(&self) -> &CameraId {
        &self.id
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Grab, DeviceError> {
        panic!("vendor driver crashed");
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.released.store(true, Ordering::Release);
        Ok(())
    }
}

#[tokio::test]
async fn test_panicking_camera_is_released() {
    let (_root, dirs) = two_camera_dirs();
    let released = Arc::new(AtomicBool::new(false));
    let broken = Box::new(PanickingCamera {
        id: CameraId::from("camA"),
        released: released.clone(),
    });

    let mut coordinator =
        PipelineCoordinator::new(config(dirs, 2, 3), vec![broken, camera("camB", 5)]);
    let report = coordinator.run().await.unwrap();

    assert_eq!(coordinator.state().name(), "Stopped");
    assert_eq!(report.failed_cameras(), vec![&CameraId::from("camA")]);
    assert_eq!(report.camera("camB").unwrap().saved, 5);
    assert!(released.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_synced_writes_save_every_frame() {
    let (root, dirs) = two_camera_dirs();
    let mut pipeline_config = config(dirs, 2, 3);
    pipeline_config.sync_writes = true;

    let mut coordinator = PipelineCoordinator::new(pipeline_config, vec![camera("camA", 3)]);
    let report = coordinator.run().await.unwrap();

    assert_eq!(report.saved(), 3);
    assert_eq!(
        files_in(&root.path().join("camA")),
        vec!["camA_0.raw", "camA_1.raw", "camA_2.raw"]
    );
}
