//! Planar two-hypothesis pose solve
//!
//! A plane observed under perspective admits two locally-consistent poses.
//! Hypothesis A comes from decomposing the plane-to-image homography;
//! hypothesis B reflects the plane orientation about the viewing ray to the
//! target center and re-estimates the translation linearly. Both carry RMS
//! pixel reprojection errors computed identically, and the pair is returned
//! unordered so the caller applies its own disambiguation policy.

use nalgebra::{DMatrix, DVector, Matrix3, Translation3, UnitQuaternion, Vector2, Vector3};

use super::{homography, nearest_rotation, reprojection_rms, CameraIntrinsics};
use crate::error::{Error, Result};
use crate::geometry::Iso3;

/// One candidate pose with its reprojection quality
#[derive(Debug, Clone)]
pub struct PoseHypothesis {
    /// Target pose in the camera frame
    pub pose: Iso3,
    /// RMS pixel reprojection error
    pub error: f64,
}

/// Solve the camera→target pose for points on the target's z = 0 plane,
/// observed at undistorted pixel positions. Needs at least 4 points.
pub fn solve_planar(
    object: &[Vector2<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> Result<[PoseHypothesis; 2]> {
    let h = homography::dlt_homography(object, image)?;
    let pose_a = pose_from_homography(&h, intrinsics)?;
    let pose_b = reflected_hypothesis(&pose_a, object, image, intrinsics)?;

    let object_3d: Vec<Vector3<f64>> = object.iter().map(|p| Vector3::new(p.x, p.y, 0.0)).collect();
    let error_a = reprojection_rms(&pose_a, &object_3d, image, intrinsics);
    let error_b = reprojection_rms(&pose_b, &object_3d, image, intrinsics);

    Ok([
        PoseHypothesis {
            pose: pose_a,
            error: error_a,
        },
        PoseHypothesis {
            pose: pose_b,
            error: error_b,
        },
    ])
}

/// Decompose a plane-to-image homography into a pose with known intrinsics:
/// scale the K⁻¹-multiplied columns to unit rotation columns, pick the sign
/// that puts the plane in front of the camera, and orthogonalize.
pub(crate) fn pose_from_homography(
    h: &Matrix3<f64>,
    intrinsics: &CameraIntrinsics,
) -> Result<Iso3> {
    let a = intrinsics.inverse_matrix() * h;
    let a1 = a.column(0).into_owned();
    let a2 = a.column(1).into_owned();
    let a3 = a.column(2).into_owned();

    let norm1 = a1.norm();
    let norm2 = a2.norm();
    if norm1 < 1e-12 || norm2 < 1e-12 {
        return Err(Error::Solver("degenerate homography columns".to_string()));
    }

    let mut lambda = 2.0 / (norm1 + norm2);
    if (a3 * lambda).z < 0.0 {
        lambda = -lambda;
    }

    let r1 = a1 * lambda;
    let r2 = a2 * lambda;
    let r3 = r1.cross(&r2);
    let t = a3 * lambda;
    if t.z.abs() < 1e-9 {
        return Err(Error::Solver("planar target on the camera plane".to_string()));
    }

    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))?;
    Ok(Iso3::from_parts(Translation3::from(t), rotation))
}

// The competing planar pose: mirror the plane normal about the unit vector
// toward the target center, rotate the pose to match, then refit the
// translation by least squares in normalized image coordinates.
fn reflected_hypothesis(
    pose_a: &Iso3,
    object: &[Vector2<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> Result<Iso3> {
    let normal = pose_a.rotation * Vector3::z();
    let t = pose_a.translation.vector;
    let t_norm = t.norm();
    if t_norm < 1e-9 {
        return Err(Error::Solver("planar target at the camera center".to_string()));
    }
    let ray = t / t_norm;

    let mirrored = 2.0 * normal.dot(&ray) * ray - normal;
    let flip = UnitQuaternion::rotation_between(&normal, &mirrored)
        .unwrap_or_else(UnitQuaternion::identity);
    let rotation = flip * pose_a.rotation;

    let translation = estimate_translation(&rotation, object, image, intrinsics)?;
    Ok(Iso3::from_parts(Translation3::from(translation), rotation))
}

// Linear translation fit for a fixed rotation: each observed normalized
// coordinate gives one row of t_x - x̂ t_z = x̂ (R p)_z - (R p)_x.
fn estimate_translation(
    rotation: &UnitQuaternion<f64>,
    object: &[Vector2<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> Result<Vector3<f64>> {
    let n = object.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 3);
    let mut b = DVector::<f64>::zeros(2 * n);

    for (i, (obj, pix)) in object.iter().zip(image).enumerate() {
        let observed = intrinsics.normalize_pixel(pix);
        let rp = rotation * Vector3::new(obj.x, obj.y, 0.0);

        let r = 2 * i;
        a[(r, 0)] = 1.0;
        a[(r, 2)] = -observed.x;
        b[r] = observed.x * rp.z - rp.x;

        let r = r + 1;
        a[(r, 1)] = 1.0;
        a[(r, 2)] = -observed.y;
        b[r] = observed.y * rp.z - rp.y;
    }

    let svd = a.svd(true, true);
    let t = svd
        .solve(&b, 1e-12)
        .map_err(|e| Error::Solver(format!("translation fit failed: {e}")))?;
    Ok(Vector3::new(t[0], t[1], t[2]))
}
