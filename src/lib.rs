//! TagSight Library
//!
//! Onboard vision node: fiducial marker tracking for robot localization
//!
//! ## Architecture (9 Components)
//!
//! 1. TelemetryBus - Timestamped key-value topics shared with the robot
//! 2. ConfigMirror - Typed view of the operator-tunable config topics
//! 3. CameraSession - Capture pipeline with restart-on-change semantics
//! 4. TagDetector - Planar fiducial detection on raw frames
//! 5. Solver - Homography, planar pose, PnP and lens calibration math
//! 6. PoseEstimator - Marker detections to a field-frame robot pose
//! 7. Calibration - Operator-driven board capture and lens solving
//! 8. Orchestrator - The frame loop tying capture to outputs
//! 9. Preview - MJPEG stream of annotated frames for aiming
//!
//! ## Design Principles
//!
//! - The bus is the single source of truth for config and outputs
//! - One long-lived task owns the camera and all per-frame state
//! - Everything downstream of capture is synchronous and testable

pub mod telemetry;
pub mod config_mirror;
pub mod geometry;
pub mod detect;
pub mod solver;
pub mod camera;
pub mod calibration;
pub mod pose_estimator;
pub mod overlay;
pub mod orchestrator;
pub mod preview;
pub mod error;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
pub use state::AppState;
