//! Robot pose estimation from marker detections
//!
//! ## Responsibilities
//!
//! - Pair detected marker corners with the configured field layout.
//! - Resolve the two-solution ambiguity of a single planar marker.
//! - Fuse multi-marker observations into one global solve.
//! - Convert solver poses through camera, robot, and field frames and
//!   validate the result against the field bounds.
//!
//! Everything here is pure: any solver failure or unresolved ambiguity
//! yields `None` and the frame is simply skipped.

use nalgebra::{Point3, Vector2, Vector3};

use crate::calibration::store::CalibrationData;
use crate::config_mirror::ConfigSnapshot;
use crate::detect::Detection;
use crate::geometry::{self, Iso3};
use crate::solver::planar::{solve_planar, PoseHypothesis};
use crate::solver::pnp::solve_pnp;

/// A solved pose with its residual metric and, for the single-marker case,
/// the rejected alternative hypothesis.
#[derive(Debug, Clone)]
pub struct PoseEstimation {
    pub ids: Vec<i64>,
    pub pose: Iso3,
    pub error: f64,
    pub secondary: Option<(Iso3, f64)>,
}

struct MatchedTag<'a> {
    detection: &'a Detection,
    field_pose: Iso3,
}

/// Marker corner offsets in the tag's local field-convention frame, in
/// detection corner order (the tag's +x axis faces the viewer).
fn tag_corner_offsets(size: f64) -> [Vector3<f64>; 4] {
    let h = size / 2.0;
    [
        Vector3::new(0.0, h, -h),
        Vector3::new(0.0, -h, -h),
        Vector3::new(0.0, -h, h),
        Vector3::new(0.0, h, h),
    ]
}

/// The same square in the planar solver's camera-convention tag plane.
fn planar_object(size: f64) -> [Vector2<f64>; 4] {
    let h = size / 2.0;
    [
        Vector2::new(-h, h),
        Vector2::new(h, h),
        Vector2::new(h, -h),
        Vector2::new(-h, -h),
    ]
}

/// Ratio test over the two hypotheses' reprojection residuals. Returns
/// `(chosen, rejected)`, or `None` while neither error is decisively
/// smaller.
fn resolve_ambiguity<T>(
    first: (T, f64),
    second: (T, f64),
    ratio: f64,
) -> Option<((T, f64), (T, f64))> {
    if first.1 < second.1 * ratio {
        Some((first, second))
    } else if second.1 < first.1 * ratio {
        Some((second, first))
    } else {
        None
    }
}

/// Estimates the robot's field pose from the detections of one frame.
pub fn estimate(
    detections: &[Detection],
    calibration: &CalibrationData,
    config: &ConfigSnapshot,
) -> Option<PoseEstimation> {
    if detections.is_empty() || config.tag_layout.is_empty() {
        return None;
    }
    let intrinsics = calibration.intrinsics()?;

    let matched: Vec<MatchedTag> = detections
        .iter()
        .filter_map(|detection| {
            config.layout_pose(detection.id).map(|field_pose| MatchedTag {
                detection,
                field_pose,
            })
        })
        .collect();
    if matched.is_empty() {
        return None;
    }

    let mount_inverse = geometry::invert(&config.mount_pose());

    if let [tag] = matched.as_slice() {
        let hypotheses = solve_planar(
            &planar_object(config.tag_size),
            &tag.detection.corners,
            &intrinsics,
        )
        .ok()?;

        let candidate = |hyp: &PoseHypothesis| {
            let tag_in_camera = geometry::camera_to_field_axes(&hyp.pose);
            let field_to_cam =
                geometry::compose(&tag.field_pose, &geometry::invert(&tag_in_camera));
            let distance = tag_in_camera.translation.vector.norm();
            ((field_to_cam, distance), hyp.error)
        };
        let [first, second] = &hypotheses;
        let (chosen, rejected) =
            resolve_ambiguity(candidate(first), candidate(second), config.error_ambiguity)?;

        let ((field_to_cam, distance), _) = chosen;
        let ((rejected_cam, rejected_distance), _) = rejected;

        let robot = geometry::compose(&field_to_cam, &mount_inverse);
        if geometry::is_outside_field(&robot, &config.field_size, &config.field_margin) {
            return None;
        }
        let secondary_robot = geometry::compose(&rejected_cam, &mount_inverse);
        return Some(PoseEstimation {
            ids: vec![tag.detection.id],
            pose: robot,
            error: distance,
            secondary: Some((secondary_robot, rejected_distance)),
        });
    }

    // Two or more markers: one well-determined global solve, no ambiguity.
    let mut object = Vec::with_capacity(matched.len() * 4);
    let mut image = Vec::with_capacity(matched.len() * 4);
    for tag in &matched {
        for (offset, corner) in tag_corner_offsets(config.tag_size)
            .iter()
            .zip(&tag.detection.corners)
        {
            let field_point = tag.field_pose.transform_point(&Point3::from(*offset));
            object.push(geometry::field_point_to_camera(&field_point.coords));
            image.push(*corner);
        }
    }
    let (pnp_pose, _) = solve_pnp(&object, &image, &intrinsics).ok()?;
    let field_to_cam = geometry::invert(&geometry::camera_to_field_axes(&pnp_pose));

    let robot = geometry::compose(&field_to_cam, &mount_inverse);
    if geometry::is_outside_field(&robot, &config.field_size, &config.field_margin) {
        return None;
    }
    let error = matched
        .iter()
        .map(|tag| (robot.translation.vector - tag.field_pose.translation.vector).norm())
        .sum::<f64>()
        / matched.len() as f64;

    Some(PoseEstimation {
        ids: matched.iter().map(|tag| tag.detection.id).collect(),
        pose: robot,
        error,
        secondary: None,
    })
}

/// Diagnostic solve for the configured debug tag: reports where that tag
/// sits relative to the camera, with no mount conversion and no field
/// bounds check.
pub fn estimate_debug(
    detections: &[Detection],
    calibration: &CalibrationData,
    config: &ConfigSnapshot,
) -> Option<PoseEstimation> {
    let intrinsics = calibration.intrinsics()?;
    let detection = detections.iter().find(|d| d.id == config.debug_tag)?;

    let hypotheses = solve_planar(
        &planar_object(config.tag_size),
        &detection.corners,
        &intrinsics,
    )
    .ok()?;

    let candidate = |hyp: &PoseHypothesis| {
        let tag_in_camera = geometry::camera_to_field_axes(&hyp.pose);
        let distance = tag_in_camera.translation.vector.norm();
        ((tag_in_camera, distance), hyp.error)
    };
    let [first, second] = &hypotheses;
    let (chosen, rejected) =
        resolve_ambiguity(candidate(first), candidate(second), config.error_ambiguity)?;

    let ((pose, distance), _) = chosen;
    let ((rejected_pose, rejected_distance), _) = rejected;
    Some(PoseEstimation {
        ids: vec![detection.id],
        pose,
        error: distance,
        secondary: Some((rejected_pose, rejected_distance)),
    })
}
