//! Batch camera calibration
//!
//! Zhang's closed-form method over captured planar-board views: per-view
//! normalized DLT homographies, intrinsics from the stacked absolute-conic
//! constraints, per-view extrinsics recovery, then a linear least-squares
//! fit of the radial distortion terms. No iterative refinement; the linear
//! model's residual is reported as the RMS reprojection error.

use nalgebra::{DMatrix, DVector, Matrix3, Vector2};

use super::{homography, planar, CameraIntrinsics};
use crate::error::{Error, Result};
use crate::geometry::Iso3;

/// One captured view: board-plane points and their pixel observations
#[derive(Debug, Clone)]
pub struct CalibrationView {
    pub board_points: Vec<Vector2<f64>>,
    pub image_points: Vec<Vector2<f64>>,
}

/// Calibration solve result
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub camera_matrix: Matrix3<f64>,
    /// OpenCV coefficient layout `[k1, k2, p1, p2, k3]`; only the radial
    /// terms are estimated, the rest stay zero
    pub distortion: Vec<f64>,
    /// RMS pixel reprojection error over every captured point
    pub rms_error: f64,
}

const MIN_VIEWS: usize = 3;

/// Solve intrinsics and radial distortion from captured board views.
/// `image_size` is the fixed capture resolution; a solve whose principal
/// point falls outside it is rejected as degenerate.
pub fn calibrate_views(
    views: &[CalibrationView],
    image_size: (u32, u32),
) -> Result<CalibrationOutcome> {
    if views.len() < MIN_VIEWS {
        return Err(Error::Solver(format!(
            "calibration needs at least {MIN_VIEWS} accepted views, got {}",
            views.len()
        )));
    }

    let mut homographies = Vec::with_capacity(views.len());
    for view in views {
        if view.board_points.len() != view.image_points.len() || view.board_points.len() < 4 {
            return Err(Error::Solver(
                "calibration view with too few correspondences".to_string(),
            ));
        }
        homographies.push(homography::dlt_homography(
            &view.board_points,
            &view.image_points,
        )?);
    }

    let camera_matrix = intrinsics_from_homographies(&homographies)?;
    if !camera_matrix.iter().all(|v| v.is_finite()) {
        return Err(Error::Solver("non-finite camera matrix".to_string()));
    }
    let (width, height) = image_size;
    let (cx, cy) = (camera_matrix[(0, 2)], camera_matrix[(1, 2)]);
    if cx < 0.0 || cx > width as f64 || cy < 0.0 || cy > height as f64 {
        return Err(Error::Solver(format!(
            "principal point ({cx:.1}, {cy:.1}) outside the {width}x{height} image"
        )));
    }

    let pinhole = CameraIntrinsics::new(camera_matrix, Vec::new())?;
    let mut extrinsics = Vec::with_capacity(homographies.len());
    for h in &homographies {
        extrinsics.push(planar::pose_from_homography(h, &pinhole)?);
    }

    let (k1, k2) = fit_radial_distortion(&pinhole, views, &extrinsics)?;
    let distortion = vec![k1, k2, 0.0, 0.0, 0.0];

    let full = CameraIntrinsics::new(camera_matrix, distortion.clone())?;
    let rms_error = total_rms(&full, views, &extrinsics);
    if !rms_error.is_finite() {
        return Err(Error::Solver("non-finite reprojection error".to_string()));
    }

    Ok(CalibrationOutcome {
        camera_matrix,
        distortion,
        rms_error,
    })
}

// Row of the absolute-conic constraint hᵢᵀ B hⱼ = vᵢⱼᵀ b for the stacked
// system, with hᵢ the i-th homography column and b the six unique entries
// of B.
fn conic_row(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Result<Matrix3<f64>> {
    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (idx, h) in homographies.iter().enumerate() {
        let v12 = conic_row(h, 0, 1);
        let v11 = conic_row(h, 0, 0);
        let v22 = conic_row(h, 1, 1);
        for c in 0..6 {
            v[(2 * idx, c)] = v12[c];
            v[(2 * idx + 1, c)] = v11[c] - v22[c];
        }
    }

    let svd = v.svd(true, true);
    let v_t = svd
        .v_t
        .as_ref()
        .ok_or_else(|| Error::Solver("conic constraint SVD failed".to_string()))?;
    let b_row = v_t.row(v_t.nrows() - 1);

    // B is positive definite up to the solution's arbitrary sign
    let sign = if b_row[0] < 0.0 { -1.0 } else { 1.0 };
    let (b11, b12, b22, b13, b23, b33) = (
        sign * b_row[0],
        sign * b_row[1],
        sign * b_row[2],
        sign * b_row[3],
        sign * b_row[4],
        sign * b_row[5],
    );

    let denom = b11 * b22 - b12 * b12;
    if b11.abs() < 1e-15 || denom.abs() < 1e-18 {
        return Err(Error::Solver(
            "degenerate view geometry for intrinsics".to_string(),
        ));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha_sq = lambda / b11;
    let beta_sq = lambda * b11 / denom;
    if alpha_sq <= 0.0 || beta_sq <= 0.0 {
        return Err(Error::Solver(
            "inconsistent intrinsic constraints".to_string(),
        ));
    }

    let alpha = alpha_sq.sqrt();
    let beta = beta_sq.sqrt();
    let gamma = -b12 * alpha_sq * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha_sq / lambda;

    Ok(Matrix3::new(alpha, gamma, u0, 0.0, beta, v0, 0.0, 0.0, 1.0))
}

// Least-squares radial terms: for every captured point, the ideal
// normalized position from the recovered extrinsics and the observed
// normalized position differ by (k1 r² + k2 r⁴) times the ideal position.
fn fit_radial_distortion(
    pinhole: &CameraIntrinsics,
    views: &[CalibrationView],
    extrinsics: &[Iso3],
) -> Result<(f64, f64)> {
    let mut rows = Vec::new();
    let mut rhs = Vec::new();

    for (view, pose) in views.iter().zip(extrinsics) {
        for (board, pixel) in view.board_points.iter().zip(&view.image_points) {
            let cam = pose * nalgebra::Point3::new(board.x, board.y, 0.0);
            if cam.coords.z <= 1e-9 {
                continue;
            }
            let ideal = Vector2::new(cam.coords.x / cam.coords.z, cam.coords.y / cam.coords.z);
            let observed = pinhole.normalize_pixel(pixel);
            let r2 = ideal.norm_squared();

            rows.push([ideal.x * r2, ideal.x * r2 * r2]);
            rhs.push(observed.x - ideal.x);
            rows.push([ideal.y * r2, ideal.y * r2 * r2]);
            rhs.push(observed.y - ideal.y);
        }
    }

    if rows.len() < 2 {
        return Err(Error::Solver(
            "no usable points for the distortion fit".to_string(),
        ));
    }

    let a = DMatrix::from_fn(rows.len(), 2, |r, c| rows[r][c]);
    let b = DVector::from_vec(rhs);
    let svd = a.svd(true, true);
    let solution = svd
        .solve(&b, 1e-12)
        .map_err(|e| Error::Solver(format!("distortion fit failed: {e}")))?;
    Ok((solution[0], solution[1]))
}

fn total_rms(intrinsics: &CameraIntrinsics, views: &[CalibrationView], extrinsics: &[Iso3]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (view, pose) in views.iter().zip(extrinsics) {
        for (board, pixel) in view.board_points.iter().zip(&view.image_points) {
            let cam = pose * nalgebra::Point3::new(board.x, board.y, 0.0);
            match intrinsics.project_distorted(&cam.coords) {
                Some(projected) => sum += (projected - pixel).norm_squared(),
                None => return f64::INFINITY,
            }
            count += 1;
        }
    }
    if count == 0 {
        return f64::INFINITY;
    }
    (sum / count as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Translation3, UnitQuaternion};

    fn board_grid() -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        for row in 0..5 {
            for col in 0..4 {
                points.push(Vector2::new(col as f64 * 0.08, row as f64 * 0.08));
            }
        }
        points
    }

    fn view_poses() -> Vec<Iso3> {
        vec![
            Iso3::from_parts(
                Translation3::new(-0.15, -0.2, 0.8),
                UnitQuaternion::from_euler_angles(0.3, 0.1, 0.02),
            ),
            Iso3::from_parts(
                Translation3::new(-0.1, -0.15, 1.0),
                UnitQuaternion::from_euler_angles(-0.25, 0.2, -0.05),
            ),
            Iso3::from_parts(
                Translation3::new(-0.2, -0.1, 0.9),
                UnitQuaternion::from_euler_angles(0.1, -0.3, 0.04),
            ),
            Iso3::from_parts(
                Translation3::new(-0.12, -0.18, 1.1),
                UnitQuaternion::from_euler_angles(0.2, 0.25, 0.1),
            ),
        ]
    }

    fn synthesize_views(truth: &CameraIntrinsics, distorted: bool) -> Vec<CalibrationView> {
        let board = board_grid();
        view_poses()
            .iter()
            .map(|pose| {
                let image_points = board
                    .iter()
                    .map(|p| {
                        let cam = pose * Point3::new(p.x, p.y, 0.0);
                        if distorted {
                            truth.project_distorted(&cam.coords).unwrap()
                        } else {
                            truth.project(&cam.coords).unwrap()
                        }
                    })
                    .collect();
                CalibrationView {
                    board_points: board.clone(),
                    image_points,
                }
            })
            .collect()
    }

    #[test]
    fn test_recovers_intrinsics_without_distortion() {
        let truth = CameraIntrinsics::new(
            Matrix3::new(600.0, 0.0, 320.0, 0.0, 590.0, 240.0, 0.0, 0.0, 1.0),
            vec![],
        )
        .unwrap();
        let views = synthesize_views(&truth, false);

        let outcome = calibrate_views(&views, (640, 480)).unwrap();
        assert_relative_eq!(outcome.camera_matrix[(0, 0)], 600.0, epsilon = 0.5);
        assert_relative_eq!(outcome.camera_matrix[(1, 1)], 590.0, epsilon = 0.5);
        assert_relative_eq!(outcome.camera_matrix[(0, 2)], 320.0, epsilon = 1.0);
        assert_relative_eq!(outcome.camera_matrix[(1, 2)], 240.0, epsilon = 1.0);
        assert!(outcome.distortion[0].abs() < 1e-3);
        assert!(outcome.rms_error < 0.1, "rms {}", outcome.rms_error);
    }

    #[test]
    fn test_recovers_radial_distortion_sign() {
        let truth = CameraIntrinsics::new(
            Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0),
            vec![-0.05, 0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
        let views = synthesize_views(&truth, true);

        let outcome = calibrate_views(&views, (640, 480)).unwrap();
        assert!(
            outcome.distortion[0] < -0.005 && outcome.distortion[0] > -0.15,
            "k1 {}",
            outcome.distortion[0]
        );
        assert!(outcome.rms_error < 2.0, "rms {}", outcome.rms_error);
    }

    #[test]
    fn test_too_few_views_rejected() {
        let truth = CameraIntrinsics::new(
            Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0),
            vec![],
        )
        .unwrap();
        let views = synthesize_views(&truth, false);

        assert!(calibrate_views(&views[..2], (640, 480)).is_err());
    }

    #[test]
    fn test_mismatched_view_rejected() {
        let truth = CameraIntrinsics::new(
            Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0),
            vec![],
        )
        .unwrap();
        let mut views = synthesize_views(&truth, false);
        views[1].image_points.pop();

        assert!(calibrate_views(&views, (640, 480)).is_err());
    }
}
