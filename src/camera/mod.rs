//! Camera capture session
//!
//! ## Responsibilities
//! - Own the capture device handle and its open/closed state machine.
//! - Reopen the pipeline when a restart-relevant config field changes.
//! - Apply the reconnect cool-down after every teardown so a flapping
//!   device cannot spin the frame loop.

pub mod backend;

use std::time::Duration;

use image::RgbImage;
use tracing::{info, warn};

use crate::config_mirror::ConfigSnapshot;
use crate::error::{Error, Result};
use backend::CaptureBackend;

const RECONNECT_COOLDOWN: Duration = Duration::from_secs(1);

/// Parameters a capture pipeline is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub device_path: String,
    pub width: i64,
    pub height: i64,
    pub auto_exposure: i64,
    pub absolute_exposure: i64,
    pub gain: i64,
}

impl OpenParams {
    pub fn from_config(config: &ConfigSnapshot) -> Self {
        Self {
            device_path: config.device_path.clone(),
            width: config.width,
            height: config.height,
            auto_exposure: config.auto_exposure,
            absolute_exposure: config.absolute_exposure,
            gain: config.gain,
        }
    }

    /// Whether switching to `wanted` needs a device reopen. Absolute
    /// exposure is applied at open time but a change alone does not force
    /// a restart.
    pub fn requires_restart(&self, wanted: &OpenParams) -> bool {
        self.device_path != wanted.device_path
            || self.width != wanted.width
            || self.height != wanted.height
            || self.auto_exposure != wanted.auto_exposure
            || self.gain != wanted.gain
    }

    /// Bytes in one RGB24 frame.
    pub fn frame_len(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    /// `gst-launch-1.0` argv for this configuration.
    pub fn pipeline_args(&self) -> Vec<String> {
        vec![
            "v4l2src".to_string(),
            format!("device={}", self.device_path),
            format!(
                "extra-controls=c,exposure_auto={},exposure_absolute={},gain={},sharpness=0,brightness=0",
                self.auto_exposure, self.absolute_exposure, self.gain
            ),
            "!".to_string(),
            format!(
                "video/x-raw, width={}, height={}, pixel-aspect-ratio=1/1",
                self.width, self.height
            ),
            "!".to_string(),
            "videoconvert".to_string(),
            "!".to_string(),
            "video/x-raw, format=RGB".to_string(),
            "!".to_string(),
            "fdsink".to_string(),
            "fd=1".to_string(),
        ]
    }

    /// Human-readable pipeline, for logs.
    pub fn pipeline_description(&self) -> String {
        self.pipeline_args().join(" ")
    }
}

enum SessionState<H> {
    Closed,
    Open { handle: H, params: OpenParams },
}

/// Capture device state machine. The device handle is owned here
/// exclusively; nothing else touches the camera.
pub struct CameraSession<B: CaptureBackend> {
    backend: B,
    state: SessionState<B::Handle>,
}

impl<B: CaptureBackend> CameraSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: SessionState::Closed,
        }
    }

    /// Reads one frame under the current config, reopening the device first
    /// when restart-relevant parameters changed. Every teardown costs this
    /// call the reconnect cool-down; there is no internal retry, the
    /// caller's tick cadence provides the backoff.
    pub async fn read(&mut self, config: &ConfigSnapshot) -> Result<RgbImage> {
        let wanted = OpenParams::from_config(config);

        if let SessionState::Open { params, .. } = &self.state {
            if params.requires_restart(&wanted) {
                info!("camera config changed, restarting camera");
                self.teardown().await;
                tokio::time::sleep(RECONNECT_COOLDOWN).await;
            }
        }

        if matches!(self.state, SessionState::Closed) {
            info!(
                device = %wanted.device_path,
                width = wanted.width,
                height = wanted.height,
                "starting camera"
            );
            match self.backend.open(&wanted).await {
                Ok(handle) => {
                    self.state = SessionState::Open {
                        handle,
                        params: wanted.clone(),
                    };
                    info!("camera started");
                }
                Err(e) => {
                    warn!(error = %e, "unable to start camera");
                    tokio::time::sleep(RECONNECT_COOLDOWN).await;
                    return Err(e);
                }
            }
        }

        let outcome = match &mut self.state {
            SessionState::Open { handle, params } => {
                self.backend.read_frame(handle, params).await
            }
            SessionState::Closed => Err(Error::Camera("capture not open".to_string())),
        };

        match outcome {
            Ok(data) => {
                RgbImage::from_raw(wanted.width as u32, wanted.height as u32, data)
                    .ok_or_else(|| Error::Camera("frame buffer size mismatch".to_string()))
            }
            Err(e) => {
                warn!(error = %e, "unable to capture camera frame, restarting camera");
                self.teardown().await;
                tokio::time::sleep(RECONNECT_COOLDOWN).await;
                Err(e)
            }
        }
    }

    async fn teardown(&mut self) {
        if let SessionState::Open { handle, .. } =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            self.backend.close(handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Clone, Default)]
    struct FakeBackend {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        open_params: Arc<Mutex<Vec<OpenParams>>>,
        fail_open: Arc<AtomicBool>,
        fail_read: Arc<AtomicBool>,
    }

    impl CaptureBackend for FakeBackend {
        type Handle = ();

        async fn open(&self, params: &OpenParams) -> Result<()> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(Error::Camera("simulated open failure".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.open_params.lock().unwrap().push(params.clone());
            Ok(())
        }

        async fn read_frame(&self, _handle: &mut (), params: &OpenParams) -> Result<Vec<u8>> {
            if self.fail_read.load(Ordering::SeqCst) {
                return Err(Error::Camera("simulated read failure".to_string()));
            }
            Ok(vec![0u8; params.frame_len()])
        }

        async fn close(&self, _handle: ()) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn small_config() -> ConfigSnapshot {
        ConfigSnapshot {
            width: 8,
            height: 6,
            ..ConfigSnapshot::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_once_then_reuse() {
        let backend = FakeBackend::default();
        let counters = backend.clone();
        let mut session = CameraSession::new(backend);
        let config = small_config();

        let frame = session.read(&config).await.unwrap();
        assert_eq!(frame.dimensions(), (8, 6));
        session.read(&config).await.unwrap();

        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gain_change_restarts_device() {
        let backend = FakeBackend::default();
        let counters = backend.clone();
        let mut session = CameraSession::new(backend);

        let mut config = small_config();
        session.read(&config).await.unwrap();

        config.gain = 99;
        session.read(&config).await.unwrap();

        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_path_change_reopens_with_new_path() {
        let backend = FakeBackend::default();
        let counters = backend.clone();
        let mut session = CameraSession::new(backend);

        let mut config = small_config();
        session.read(&config).await.unwrap();

        config.device_path = "/dev/video5".to_string();
        session.read(&config).await.unwrap();

        // The reopen must carry the updated path, not the one the
        // session was first opened with.
        let opens = counters.open_params.lock().unwrap();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[0].device_path, "/dev/video0");
        assert_eq!(opens[1].device_path, "/dev/video5");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_exposure_change_keeps_device() {
        let backend = FakeBackend::default();
        let counters = backend.clone();
        let mut session = CameraSession::new(backend);

        let mut config = small_config();
        session.read(&config).await.unwrap();

        config.absolute_exposure = 77;
        session.read(&config).await.unwrap();

        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_closes_and_cools_down() {
        let backend = FakeBackend::default();
        let counters = backend.clone();
        let mut session = CameraSession::new(backend);
        let config = small_config();

        session.read(&config).await.unwrap();

        counters.fail_read.store(true, Ordering::SeqCst);
        let before = Instant::now();
        assert!(session.read(&config).await.is_err());
        assert!(before.elapsed() >= RECONNECT_COOLDOWN);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        // Next call reopens once the device behaves again.
        counters.fail_read.store(false, Ordering::SeqCst);
        session.read(&config).await.unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_reports_after_cooldown() {
        let backend = FakeBackend::default();
        let counters = backend.clone();
        let mut session = CameraSession::new(backend);
        let config = small_config();

        counters.fail_open.store(true, Ordering::SeqCst);
        let before = Instant::now();
        assert!(session.read(&config).await.is_err());
        assert!(before.elapsed() >= RECONNECT_COOLDOWN);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);

        counters.fail_open.store(false, Ordering::SeqCst);
        session.read(&config).await.unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pipeline_description_layout() {
        let params = OpenParams {
            device_path: "/dev/video2".to_string(),
            width: 1600,
            height: 1200,
            auto_exposure: 1,
            absolute_exposure: 10,
            gain: 25,
        };
        let description = params.pipeline_description();

        assert!(description.starts_with("v4l2src device=/dev/video2"));
        assert!(description.contains(
            "extra-controls=c,exposure_auto=1,exposure_absolute=10,gain=25,sharpness=0,brightness=0"
        ));
        assert!(description.contains("width=1600, height=1200, pixel-aspect-ratio=1/1"));
        assert!(description.ends_with("fdsink fd=1"));
    }
}
