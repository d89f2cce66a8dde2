//! Perspective-n-point solve with known intrinsics
//!
//! Camera→object pose from stacked 3D/2D correspondences via the direct
//! linear transform on normalized coordinates, with SVD orthogonalization
//! of the rotation factor and a cheirality sign fix. Coplanar point sets
//! would make the 12-parameter DLT rank-deficient, so they are detected
//! up front and routed through the planar solve in a plane-aligned frame,
//! keeping the lower-error hypothesis. Either way the result is a single
//! pose, never an ambiguous pair.

use nalgebra::{DMatrix, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3};

use super::{planar, reprojection_rms, CameraIntrinsics};
use crate::error::{Error, Result};
use crate::geometry::Iso3;

/// Camera→object pose and its RMS pixel reprojection error
pub fn solve_pnp(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> Result<(Iso3, f64)> {
    if object.len() != image.len() || object.len() < 4 {
        return Err(Error::Solver(format!(
            "n-point solve needs at least 4 correspondences, got {}",
            object.len().min(image.len())
        )));
    }

    if let Some((basis, centroid)) = coplanar_basis(object) {
        return solve_in_plane(object, image, intrinsics, &basis, &centroid);
    }
    if object.len() < 6 {
        return Err(Error::Solver(
            "non-planar solve needs at least 6 correspondences".to_string(),
        ));
    }
    solve_dlt(object, image, intrinsics)
}

// Principal-axis frame of the point cloud when its smallest extent is
// negligible, meaning all points lie on one plane.
fn coplanar_basis(object: &[Vector3<f64>]) -> Option<(Rotation3<f64>, Vector3<f64>)> {
    let n = object.len() as f64;
    let centroid = object.iter().sum::<Vector3<f64>>() / n;

    let mut covariance = Matrix3::zeros();
    for p in object {
        let d = p - centroid;
        covariance += d * d.transpose();
    }

    let svd = covariance.svd(true, true);
    let spread = svd.singular_values;
    if spread[2] > spread[0] * 1e-6 + 1e-12 {
        return None;
    }

    let u = svd.u?;
    let mut basis = Matrix3::from_columns(&[
        u.column(0).into_owned(),
        u.column(1).into_owned(),
        u.column(2).into_owned(),
    ]);
    if basis.determinant() < 0.0 {
        basis.column_mut(2).neg_mut();
    }
    Some((Rotation3::from_matrix_unchecked(basis), centroid))
}

fn solve_in_plane(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
    basis: &Rotation3<f64>,
    centroid: &Vector3<f64>,
) -> Result<(Iso3, f64)> {
    let to_plane = basis.inverse();
    let plane_points: Vec<Vector2<f64>> = object
        .iter()
        .map(|p| {
            let q = to_plane * (p - centroid);
            Vector2::new(q.x, q.y)
        })
        .collect();

    let [a, b] = planar::solve_planar(&plane_points, image, intrinsics)?;
    let best = if a.error <= b.error { a } else { b };

    // object coords expressed in the plane frame: q = Bᵀ (p - c)
    let plane_from_object = Iso3::from_parts(
        Translation3::from(-(to_plane * centroid)),
        UnitQuaternion::from_rotation_matrix(&to_plane),
    );
    Ok((best.pose * plane_from_object, best.error))
}

fn solve_dlt(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> Result<(Iso3, f64)> {
    let n = object.len();
    let mut m = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, pix)) in object.iter().zip(image).enumerate() {
        let observed = intrinsics.normalize_pixel(pix);

        let r = 2 * i;
        m[(r, 0)] = p.x;
        m[(r, 1)] = p.y;
        m[(r, 2)] = p.z;
        m[(r, 3)] = 1.0;
        m[(r, 8)] = -observed.x * p.x;
        m[(r, 9)] = -observed.x * p.y;
        m[(r, 10)] = -observed.x * p.z;
        m[(r, 11)] = -observed.x;

        let r = r + 1;
        m[(r, 4)] = p.x;
        m[(r, 5)] = p.y;
        m[(r, 6)] = p.z;
        m[(r, 7)] = 1.0;
        m[(r, 8)] = -observed.y * p.x;
        m[(r, 9)] = -observed.y * p.y;
        m[(r, 10)] = -observed.y * p.z;
        m[(r, 11)] = -observed.y;
    }

    let svd = m.svd(true, true);
    let v_t = svd
        .v_t
        .as_ref()
        .ok_or_else(|| Error::Solver("n-point SVD failed".to_string()))?;
    let p = v_t.row(v_t.nrows() - 1);

    let mut r_hat = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
    let mut t_hat = Vector3::new(p[3], p[7], p[11]);

    // sign fix: the first object point must project in front of the camera
    if (r_hat * object[0] + t_hat).z < 0.0 {
        r_hat = -r_hat;
        t_hat = -t_hat;
    }

    let svd = r_hat.svd(true, true);
    let scale = svd.singular_values.mean();
    if scale < 1e-12 {
        return Err(Error::Solver("degenerate rotation factor".to_string()));
    }
    let u = svd
        .u
        .ok_or_else(|| Error::Solver("rotation SVD failed".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::Solver("rotation SVD failed".to_string()))?;
    let mut u = u;
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(u * v_t));

    let pose = Iso3::from_parts(Translation3::from(t_hat / scale), rotation);
    let rms = reprojection_rms(&pose, object, image, intrinsics);
    Ok((pose, rms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(
            Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0),
            vec![],
        )
        .unwrap()
    }

    fn project_all(
        pose: &Iso3,
        object: &[Vector3<f64>],
        intr: &CameraIntrinsics,
    ) -> Vec<Vector2<f64>> {
        object
            .iter()
            .map(|p| intr.project(&(pose * Point3::from(*p)).coords).unwrap())
            .collect()
    }

    #[test]
    fn test_recovers_pose_from_box_corners() {
        let intr = intrinsics();
        let object: Vec<Vector3<f64>> = [
            (0.0, 0.0, 0.0),
            (0.4, 0.0, 0.0),
            (0.4, 0.3, 0.0),
            (0.0, 0.3, 0.0),
            (0.0, 0.0, 0.2),
            (0.4, 0.0, 0.2),
            (0.4, 0.3, 0.2),
            (0.0, 0.3, 0.2),
        ]
        .iter()
        .map(|&(x, y, z)| Vector3::new(x, y, z))
        .collect();
        let truth = Iso3::from_parts(
            Translation3::new(-0.1, 0.05, 2.5),
            UnitQuaternion::from_euler_angles(0.2, -0.3, 0.15),
        );
        let image = project_all(&truth, &object, &intr);

        let (pose, rms) = solve_pnp(&object, &image, &intr).unwrap();
        assert!(rms < 1e-6, "rms {rms}");
        assert_relative_eq!(
            pose.translation.vector,
            truth.translation.vector,
            epsilon = 1e-5
        );
        assert!(pose.rotation.angle_to(&truth.rotation) < 1e-5);
    }

    #[test]
    fn test_coplanar_points_solved_in_plane_frame() {
        // All points on the x = 0.5 plane of the object frame; the general
        // DLT would be rank-deficient here.
        let intr = intrinsics();
        let mut object = Vec::new();
        for i in 0..4 {
            for j in 0..3 {
                object.push(Vector3::new(0.5, i as f64 * 0.1, j as f64 * 0.1));
            }
        }
        let truth = Iso3::from_parts(
            Translation3::new(0.1, -0.2, 1.8),
            UnitQuaternion::from_euler_angles(0.3, 0.25, -0.1),
        );
        let image = project_all(&truth, &object, &intr);

        let (pose, rms) = solve_pnp(&object, &image, &intr).unwrap();
        assert!(rms < 1e-6, "rms {rms}");
        assert_relative_eq!(
            pose.translation.vector,
            truth.translation.vector,
            epsilon = 1e-5
        );
        assert!(pose.rotation.angle_to(&truth.rotation) < 1e-5);
    }

    #[test]
    fn test_too_few_points_rejected() {
        let intr = intrinsics();
        let object = vec![Vector3::zeros(); 3];
        let image = vec![Vector2::zeros(); 3];
        assert!(solve_pnp(&object, &image, &intr).is_err());
    }

    #[test]
    fn test_five_general_points_rejected() {
        let intr = intrinsics();
        let object: Vec<Vector3<f64>> = [
            (0.0, 0.0, 0.0),
            (0.4, 0.0, 0.1),
            (0.4, 0.3, 0.0),
            (0.0, 0.3, 0.2),
            (0.2, 0.1, 0.3),
        ]
        .iter()
        .map(|&(x, y, z)| Vector3::new(x, y, z))
        .collect();
        let truth = Iso3::from_parts(Translation3::new(0.0, 0.0, 2.0), UnitQuaternion::identity());
        let image = project_all(&truth, &object, &intr);

        assert!(solve_pnp(&object, &image, &intr).is_err());
    }
}
