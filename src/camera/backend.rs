//! Capture backends
//!
//! ## Responsibilities
//! - Define the trait a frame source implements: open a device, read one
//!   RGB24 frame, tear the device down.
//! - Provide the production backend that spawns a `gst-launch-1.0`
//!   pipeline and reads raw frames from its stdout.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use super::OpenParams;
use crate::error::{Error, Result};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame source. One handle owns one open device.
#[allow(async_fn_in_trait)]
pub trait CaptureBackend {
    type Handle: Send;

    /// Opens the device described by `params`.
    async fn open(&self, params: &OpenParams) -> Result<Self::Handle>;

    /// Reads one `width*height*3` RGB24 frame.
    async fn read_frame(&self, handle: &mut Self::Handle, params: &OpenParams)
        -> Result<Vec<u8>>;

    /// Releases the device.
    async fn close(&self, handle: Self::Handle);
}

/// Captures V4L2 frames by spawning `gst-launch-1.0` with an `fdsink` tail
/// and reading raw RGB24 frames from the child's stdout.
///
/// Uses `kill_on_drop(true)` so an abandoned handle cannot leave a pipeline
/// process behind.
pub struct GstCaptureBackend;

/// An open capture pipeline: the child process plus its frame stream.
pub struct GstCapture {
    child: Child,
    stdout: ChildStdout,
}

impl CaptureBackend for GstCaptureBackend {
    type Handle = GstCapture;

    async fn open(&self, params: &OpenParams) -> Result<GstCapture> {
        debug!(pipeline = %params.pipeline_description(), "spawning capture pipeline");

        let mut child = Command::new("gst-launch-1.0")
            .arg("-q")
            .args(params.pipeline_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Camera(format!("gst-launch-1.0 spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Camera("capture pipeline stdout not piped".to_string()))?;

        Ok(GstCapture { child, stdout })
    }

    async fn read_frame(&self, handle: &mut GstCapture, params: &OpenParams) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; params.frame_len()];

        match tokio::time::timeout(READ_TIMEOUT, handle.stdout.read_exact(&mut frame)).await {
            Ok(Ok(_)) => Ok(frame),
            Ok(Err(e)) => Err(Error::Camera(format!("frame read failed: {e}"))),
            Err(_) => Err(Error::Camera(format!(
                "frame read timed out after {}s",
                READ_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn close(&self, mut handle: GstCapture) {
        // The pipeline usually dies on its own when reads start failing, so
        // a kill error here only means there is nothing left to kill.
        if let Err(e) = handle.child.kill().await {
            debug!(error = %e, "capture pipeline already exited");
        }
    }
}
