//! Frame loop
//!
//! ## Responsibilities
//!
//! - Drive the tick sequence: config snapshot, capture, detect, then either
//!   pose estimation or calibration intake depending on the operator mode.
//! - Account frames per second and latch the rate once per second.
//! - Publish pose output to the bus and hand every frame to the preview.
//!
//! The loop runs forever on one task; all pipeline state is owned here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use image::RgbImage;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::calibration::store::{CalibrationData, CalibrationStore};
use crate::calibration::{
    CalibrationBoard, CalibrationControls, CalibrationSession, SnapEdgeDetector,
};
use crate::camera::backend::CaptureBackend;
use crate::camera::CameraSession;
use crate::config_mirror::ConfigMirror;
use crate::detect::{Detection, TagDetector};
use crate::pose_estimator::{self, PoseEstimation};
use crate::overlay;
use crate::telemetry::{Publisher, TelemetryBus};

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Output topic handles, bound once.
pub struct OutputPublishers {
    fps: Publisher<i64>,
    pose: Publisher<Vec<f64>>,
    debug_pose: Publisher<Vec<f64>>,
}

impl OutputPublishers {
    pub fn new(bus: &Arc<TelemetryBus>) -> Self {
        Self {
            fps: bus.publisher("output/fps"),
            pose: bus.publisher("output/poseEstimation"),
            debug_pose: bus.publisher("output/debugPoseEstimation"),
        }
    }

    fn publish(
        &self,
        fps: i64,
        pose: Option<&PoseEstimation>,
        debug: Option<&PoseEstimation>,
        timestamp_micros: i64,
    ) {
        self.fps.set_at(fps, timestamp_micros);
        self.pose.set_at(encode_pose(pose), timestamp_micros);
        self.debug_pose.set_at(encode_pose(debug), timestamp_micros);
    }
}

/// Pose array layout: hypothesis count, residual error, translation,
/// roll/pitch/yaw, then the contributing tag ids. No pose publishes as the
/// empty array.
fn encode_pose(estimation: Option<&PoseEstimation>) -> Vec<f64> {
    let Some(estimation) = estimation else {
        return Vec::new();
    };
    let t = estimation.pose.translation.vector;
    let (roll, pitch, yaw) = estimation.pose.rotation.euler_angles();
    let mut values = vec![1.0, estimation.error, t.x, t.y, t.z, roll, pitch, yaw];
    values.extend(estimation.ids.iter().map(|id| *id as f64));
    values
}

struct FpsCounter {
    frames: i64,
    latched: i64,
    window_start: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            frames: 0,
            latched: 0,
            window_start: Instant::now(),
        }
    }

    fn tick(&mut self) -> i64 {
        self.frames += 1;
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.latched = self.frames;
            self.frames = 0;
            self.window_start = Instant::now();
            info!(fps = self.latched, "pipeline rate");
        }
        self.latched
    }
}

/// Owns the whole pipeline and runs it frame by frame.
pub struct Orchestrator<B: CaptureBackend> {
    camera: CameraSession<B>,
    detector: TagDetector,
    mirror: ConfigMirror,
    controls: CalibrationControls,
    outputs: OutputPublishers,
    store: CalibrationStore,
    calibration: CalibrationData,
    snap_edge: SnapEdgeDetector,
    session: Option<CalibrationSession>,
    fps: FpsCounter,
    preview_tx: watch::Sender<Option<Arc<RgbImage>>>,
}

impl<B: CaptureBackend> Orchestrator<B> {
    pub fn new(
        bus: &Arc<TelemetryBus>,
        backend: B,
        store: CalibrationStore,
        calibration: CalibrationData,
        preview_tx: watch::Sender<Option<Arc<RgbImage>>>,
    ) -> Self {
        Self {
            camera: CameraSession::new(backend),
            detector: TagDetector::new(),
            mirror: ConfigMirror::new(bus),
            controls: CalibrationControls::new(bus),
            outputs: OutputPublishers::new(bus),
            store,
            calibration,
            snap_edge: SnapEdgeDetector::new(),
            session: None,
            fps: FpsCounter::new(),
            preview_tx,
        }
    }

    pub async fn run(mut self) {
        info!("frame loop running");
        loop {
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        let config = self.mirror.snapshot();

        let mut frame = match self.camera.read(&config).await {
            Ok(frame) => frame,
            Err(_) => {
                // CameraSession already logged the cause.
                tokio::time::sleep(RETRY_DELAY).await;
                return;
            }
        };

        let fps = self.fps.tick();
        // Polled every tick so a snap held high before calibration starts
        // does not fire on entry.
        let snap_fired = self.snap_edge.should_capture(self.controls.snap());

        let detections: Vec<Detection> = if self.controls.calibrating() {
            let session = self.session.get_or_insert_with(|| {
                info!("entering calibration mode");
                CalibrationSession::new(CalibrationBoard::standard())
            });
            session.intake_frame(&frame, snap_fired)
        } else {
            if let Some(session) = self.session.take() {
                match session.save_to_file(&self.store).await {
                    Ok(data) => {
                        info!(date = %data.date, "adopting new calibration");
                        self.calibration = data;
                    }
                    Err(e) => {
                        warn!(error = %e, "keeping previous calibration");
                    }
                }
            }

            let detections = self.detector.search(&frame, &config);
            if self.calibration.is_present() {
                let timestamp = Utc::now().timestamp_micros();
                let estimation =
                    pose_estimator::estimate(&detections, &self.calibration, &config);
                let debug =
                    pose_estimator::estimate_debug(&detections, &self.calibration, &config);
                self.outputs
                    .publish(fps, estimation.as_ref(), debug.as_ref(), timestamp);
            } else {
                warn!("camera is not calibrated, pose estimation disabled");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            detections
        };

        overlay::draw_detections(&mut frame, &detections);
        self.preview_tx.send_replace(Some(Arc::new(frame)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::OpenParams;
    use crate::detect::families::{TAG16H5, TAG36H11};
    use crate::error::{Error, Result};
    use crate::geometry::{compose, pose_from_euler, Iso3};
    use crate::telemetry::TelemetryValue;
    use crate::test_support::{
        render_plane_view, render_tag, tag_surface_value, test_intrinsics, white_canvas,
    };
    use nalgebra::{Matrix3, Rotation3, Translation3, UnitQuaternion};
    use std::f64::consts::PI;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct FrameBackend {
        pixels: Arc<Mutex<Vec<u8>>>,
        fail: Arc<AtomicBool>,
    }

    impl FrameBackend {
        fn new(pixels: Vec<u8>) -> Self {
            Self {
                pixels: Arc::new(Mutex::new(pixels)),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }

        fn set_pixels(&self, pixels: Vec<u8>) {
            *self.pixels.lock().unwrap() = pixels;
        }
    }

    impl CaptureBackend for FrameBackend {
        type Handle = ();

        async fn open(&self, _params: &OpenParams) -> Result<()> {
            Ok(())
        }

        async fn read_frame(&self, _handle: &mut (), params: &OpenParams) -> Result<Vec<u8>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Camera("feed lost".to_string()));
            }
            let pixels = self.pixels.lock().unwrap().clone();
            assert_eq!(pixels.len(), params.frame_len());
            Ok(pixels)
        }

        async fn close(&self, _handle: ()) {}
    }

    fn field_tag_pixels() -> Vec<u8> {
        let mut canvas = white_canvas(320, 240);
        render_tag(&mut canvas, &TAG16H5, 4, (100, 80), 14);
        canvas.into_raw()
    }

    fn board_pixels() -> Vec<u8> {
        let mut canvas = white_canvas(320, 240);
        render_tag(&mut canvas, &TAG36H11, 3, (100, 80), 10);
        canvas.into_raw()
    }

    fn present_calibration() -> CalibrationData {
        CalibrationData {
            date: "test".to_string(),
            camera_matrix: vec![
                vec![300.0, 0.0, 160.0],
                vec![0.0, 300.0, 120.0],
                vec![0.0, 0.0, 1.0],
            ],
            distortion_coefficients: vec![0.0; 5],
        }
    }

    struct TestRig {
        bus: Arc<TelemetryBus>,
        backend: FrameBackend,
        preview_rx: watch::Receiver<Option<Arc<RgbImage>>>,
        orchestrator: Orchestrator<FrameBackend>,
        store_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn rig(calibration: CalibrationData) -> TestRig {
        let bus = Arc::new(TelemetryBus::new("unit"));
        bus.publish("config/width", TelemetryValue::Int(320));
        bus.publish("config/height", TelemetryValue::Int(240));

        let backend = FrameBackend::new(field_tag_pixels());
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("calibration.json");
        let store = CalibrationStore::new(&store_path);
        let (tx, rx) = watch::channel(None);
        let orchestrator = Orchestrator::new(&bus, backend.clone(), store, calibration, tx);

        TestRig {
            bus,
            backend,
            preview_rx: rx,
            orchestrator,
            store_path,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_tick_publishes_outputs() {
        let mut rig = rig(present_calibration());
        rig.orchestrator.tick().await;

        // No layout and no debug tag in view, so both poses are empty, but
        // the topics are written with this tick's timestamp.
        assert_eq!(
            rig.bus.latest("output/fps").unwrap().value,
            TelemetryValue::Int(0)
        );
        assert_eq!(
            rig.bus.latest("output/poseEstimation").unwrap().value,
            TelemetryValue::FloatArray(Vec::new())
        );
        assert_eq!(
            rig.bus.latest("output/debugPoseEstimation").unwrap().value,
            TelemetryValue::FloatArray(Vec::new())
        );

        // The preview frame carries the marker outline.
        let preview = rig.preview_rx.borrow().clone().unwrap();
        assert_eq!(preview.dimensions(), (320, 240));
        assert!(preview.pixels().any(|p| *p == image::Rgb([0, 255, 0])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncalibrated_tick_skips_outputs() {
        let mut rig = rig(CalibrationData::default());
        rig.orchestrator.tick().await;

        assert!(rig.bus.latest("output/fps").is_none());
        assert!(rig.bus.latest("output/poseEstimation").is_none());
        // The preview still updates so the operator can aim the camera.
        assert!(rig.preview_rx.borrow().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_skips_tick() {
        let mut rig = rig(present_calibration());
        rig.backend.fail.store(true, Ordering::SeqCst);
        rig.orchestrator.tick().await;

        assert!(rig.bus.latest("output/fps").is_none());
        assert!(rig.preview_rx.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fps_latches_once_per_second() {
        let mut rig = rig(present_calibration());
        for _ in 0..5 {
            rig.orchestrator.tick().await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        rig.orchestrator.tick().await;

        assert_eq!(
            rig.bus.latest("output/fps").unwrap().value,
            TelemetryValue::Int(6)
        );
    }

    /// Rotation taking field axes (x forward, y left, z up) to camera
    /// optical axes (x right, y down, z forward).
    fn optical_from_field() -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(Matrix3::new(
            0.0, -1.0, 0.0, //
            0.0, 0.0, -1.0, //
            1.0, 0.0, 0.0,
        )))
    }

    /// Embeds the marker face plane into the marker's field-convention
    /// frame. Face coordinates span `[0, size]` on both axes with the
    /// pattern's top-left at the origin and y growing downward, so the
    /// face corners land on the same marker-local points the solver's
    /// object points use.
    fn marker_from_face(size: f64) -> Iso3 {
        Iso3::from_parts(
            Translation3::new(0.0, size / 2.0, -size / 2.0),
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(Matrix3::new(
                0.0, 0.0, -1.0, //
                -1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0,
            ))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_recovers_robot_pose() {
        let tag_size = 0.3;
        let tag_yaw = PI - 0.45;
        let tag_pose = pose_from_euler(5.5, 3.0, 0.5, 0.0, 0.0, tag_yaw);
        let robot_pose = pose_from_euler(4.0, 3.0, 0.0, 0.0, 0.0, 0.0);
        let mount = pose_from_euler(0.2, 0.0, 0.5, 0.0, 0.0, 0.0);
        let camera_in_field = compose(&robot_pose, &mount);

        let intrinsics = test_intrinsics(600.0, 600.0, 320.0, 240.0);
        let optical = Iso3::from_parts(Translation3::identity(), optical_from_field());
        let camera_from_face =
            optical * camera_in_field.inverse() * tag_pose * marker_from_face(tag_size);
        let frame = render_plane_view(640, 480, &intrinsics, &camera_from_face, |x, y| {
            tag_surface_value(&TAG16H5, 4, tag_size, x, y)
        });

        let bus = Arc::new(TelemetryBus::new("unit"));
        bus.publish("config/width", TelemetryValue::Int(640));
        bus.publish("config/height", TelemetryValue::Int(480));
        bus.publish("config/tagSize", TelemetryValue::Float(tag_size));
        bus.publish(
            "config/cameraPosition",
            TelemetryValue::FloatArray(vec![0.2, 0.0, 0.5, 0.0, 0.0, 0.0]),
        );
        bus.publish(
            "config/tagLayout",
            TelemetryValue::Text(format!(
                r#"[{{"id": 4, "x": 5.5, "y": 3.0, "z": 0.5, "rx": 0.0, "ry": 0.0, "rz": {tag_yaw}}}]"#
            )),
        );

        let backend = FrameBackend::new(frame.into_raw());
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration.json"));
        let (tx, _rx) = watch::channel(None);
        let calibration = CalibrationData {
            date: "test".to_string(),
            camera_matrix: vec![
                vec![600.0, 0.0, 320.0],
                vec![0.0, 600.0, 240.0],
                vec![0.0, 0.0, 1.0],
            ],
            distortion_coefficients: vec![0.0; 5],
        };
        let mut orchestrator = Orchestrator::new(&bus, backend, store, calibration, tx);

        orchestrator.tick().await;

        let entry = bus.latest("output/poseEstimation").unwrap();
        let TelemetryValue::FloatArray(values) = entry.value else {
            panic!("pose topic must be a float array");
        };
        assert_eq!(values.len(), 9);
        assert_eq!(values[0], 1.0);
        // Residual is the camera-to-marker distance.
        assert!((values[1] - 1.3).abs() < 0.2, "distance {}", values[1]);
        assert!((values[2] - 4.0).abs() < 0.1, "x {}", values[2]);
        assert!((values[3] - 3.0).abs() < 0.1, "y {}", values[3]);
        assert!(values[4].abs() < 0.1, "z {}", values[4]);
        assert!(values[5].abs() < 0.1, "roll {}", values[5]);
        assert!(values[6].abs() < 0.1, "pitch {}", values[6]);
        assert!(values[7].abs() < 0.1, "yaw {}", values[7]);
        assert_eq!(values[8], 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_mode_flow() {
        let mut rig = rig(present_calibration());
        rig.backend.set_pixels(board_pixels());
        std::fs::write(&rig.store_path, "stale").unwrap();

        // Enter calibration; nothing captured yet.
        rig.bus
            .publish("calibration/calibrating", TelemetryValue::Bool(true));
        rig.orchestrator.tick().await;
        assert!(rig.bus.latest("output/fps").is_none());

        // The board marker shows up on the preview while calibrating.
        let preview = rig.preview_rx.borrow().clone().unwrap();
        assert!(preview.pixels().any(|p| *p == image::Rgb([0, 255, 0])));

        // Snap captures one view.
        rig.bus
            .publish("calibration/snap", TelemetryValue::Bool(true));
        rig.orchestrator.tick().await;

        // Leaving runs the solve; one view is short of the minimum, so the
        // stale file is wiped and the previous calibration stays active.
        rig.bus
            .publish("calibration/calibrating", TelemetryValue::Bool(false));
        rig.orchestrator.tick().await;

        assert!(!rig.store_path.exists());
        assert!(rig.bus.latest("output/poseEstimation").is_some());
    }
}
