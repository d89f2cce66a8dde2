//! Operator-triggered camera calibration
//!
//! ## Responsibilities
//!
//! - Expose the `calibrating`/`snap` operator flags from the bus.
//! - Accumulate board correspondence sets while calibration mode is held.
//! - Run the batch intrinsics solve and persist the result on exit.
//!
//! The calibration board is a fixed marker grid, detected with its own
//! dictionary regardless of which family the field tags use.

pub mod store;

use std::sync::Arc;

use image::RgbImage;
use nalgebra::Vector2;
use tracing::{info, warn};

use crate::detect::families::{TagFamily, TAG36H11};
use crate::detect::{detect_with_family, Detection};
use crate::error::{Error, Result};
use crate::solver::calibrate::{calibrate_views, CalibrationView};
use crate::telemetry::{Subscriber, TelemetryBus};
use store::{CalibrationData, CalibrationStore};

/// Operator flags steering calibration, read fresh every tick.
pub struct CalibrationControls {
    calibrating: Subscriber<bool>,
    snap: Subscriber<bool>,
}

impl CalibrationControls {
    pub fn new(bus: &Arc<TelemetryBus>) -> Self {
        Self {
            calibrating: bus.subscriber("calibration/calibrating", false),
            snap: bus.subscriber("calibration/snap", false),
        }
    }

    pub fn calibrating(&self) -> bool {
        self.calibrating.get()
    }

    pub fn snap(&self) -> bool {
        self.snap.get()
    }
}

/// Turns the level-triggered `snap` flag into a one-shot: a held button
/// captures exactly one view until it is released and pressed again.
#[derive(Debug, Default)]
pub struct SnapEdgeDetector {
    last: bool,
}

impl SnapEdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_capture(&mut self, snap: bool) -> bool {
        let fired = snap && !self.last;
        self.last = snap;
        fired
    }
}

/// Printed calibration target: a 4x5 grid of 36h11 markers, ids 0-19 in
/// row-major order from the board's top-left corner.
pub struct CalibrationBoard {
    family: &'static TagFamily,
    columns: i64,
    rows: i64,
    marker_length: f64,
    marker_spacing: f64,
}

impl CalibrationBoard {
    pub fn standard() -> Self {
        Self {
            family: &TAG36H11,
            columns: 4,
            rows: 5,
            marker_length: 0.06,
            marker_spacing: 0.02,
        }
    }

    pub fn family(&self) -> &'static TagFamily {
        self.family
    }

    /// Board-plane corners for a marker id, in the same top-left, top-right,
    /// bottom-right, bottom-left order the detector reports. `None` for ids
    /// that are not part of the board.
    pub fn marker_corners(&self, id: i64) -> Option<[Vector2<f64>; 4]> {
        if id < 0 || id >= self.columns * self.rows {
            return None;
        }
        let pitch = self.marker_length + self.marker_spacing;
        let x0 = (id % self.columns) as f64 * pitch;
        let y0 = (id / self.columns) as f64 * pitch;
        let s = self.marker_length;
        Some([
            Vector2::new(x0, y0),
            Vector2::new(x0 + s, y0),
            Vector2::new(x0 + s, y0 + s),
            Vector2::new(x0, y0 + s),
        ])
    }
}

/// One calibration run. Built fresh each time the operator enters
/// calibration mode; accumulated views die with it.
pub struct CalibrationSession {
    board: CalibrationBoard,
    views: Vec<CalibrationView>,
    camera_size: Option<(u32, u32)>,
}

impl CalibrationSession {
    pub fn new(board: CalibrationBoard) -> Self {
        Self {
            board,
            views: Vec::new(),
            camera_size: None,
        }
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Detects board markers in the frame and, when `accept` is set and the
    /// board is actually visible, appends the correspondence set. The frame
    /// resolution is fixed by the first frame seen. Returns the detections
    /// so the caller can draw them on the preview.
    pub fn intake_frame(&mut self, frame: &RgbImage, accept: bool) -> Vec<Detection> {
        if self.camera_size.is_none() {
            self.camera_size = Some(frame.dimensions());
        }

        let detections = detect_with_family(frame, self.board.family());
        if accept && !detections.is_empty() {
            let mut board_points = Vec::new();
            let mut image_points = Vec::new();
            for detection in &detections {
                // A stray marker that decodes but is not part of the board
                // has no known geometry to correspond against.
                let Some(corners) = self.board.marker_corners(detection.id) else {
                    continue;
                };
                board_points.extend_from_slice(&corners);
                image_points.extend_from_slice(&detection.corners);
            }
            if !board_points.is_empty() {
                self.views.push(CalibrationView {
                    board_points,
                    image_points,
                });
                info!(
                    markers = detections.len(),
                    views = self.views.len(),
                    "captured calibration view"
                );
            }
        }
        detections
    }

    /// Solves the accumulated views and persists the result. With nothing
    /// captured the stored file is left untouched; once views exist the
    /// stale file is removed before the solve, so a failed solve leaves no
    /// file behind.
    pub async fn save_to_file(&self, store: &CalibrationStore) -> Result<CalibrationData> {
        if self.views.is_empty() {
            warn!("unable to calibrate: no captured views");
            return Err(Error::Calibration("no captured views".to_string()));
        }
        let Some(camera_size) = self.camera_size else {
            warn!("unable to calibrate: camera resolution unknown");
            return Err(Error::Calibration("camera resolution unknown".to_string()));
        };

        store.remove().await?;

        let outcome = calibrate_views(&self.views, camera_size).map_err(|e| {
            warn!(error = %e, views = self.views.len(), "calibration solve failed");
            e
        })?;
        let data = CalibrationData::from_outcome(&outcome);
        store.save(&data).await?;
        info!(
            views = self.views.len(),
            rms = outcome.rms_error,
            "finished calibration"
        );
        Ok(data)
    }
}
