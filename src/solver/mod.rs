//! Geometric vision solver
//!
//! ## Responsibilities
//!
//! - Pinhole camera model with radial distortion (`CameraIntrinsics`)
//! - Plane-to-image homography estimation
//! - Planar two-hypothesis pose solve for a single square target
//! - Single-hypothesis n-point pose solve for fused correspondences
//! - Batch camera calibration from captured board views
//!
//! All solves work in the camera axis convention (x right, y down,
//! z forward) on undistorted pixel coordinates, report RMS pixel
//! reprojection errors, and return `Error::Solver` for degenerate
//! geometry instead of panicking.

pub mod calibrate;
pub mod homography;
pub mod planar;
pub mod pnp;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};

use crate::error::{Error, Result};
use crate::geometry::Iso3;

/// Pinhole intrinsics plus radial distortion coefficients
#[derive(Debug, Clone)]
pub struct CameraIntrinsics {
    matrix: Matrix3<f64>,
    matrix_inv: Matrix3<f64>,
    distortion: Vec<f64>,
}

impl CameraIntrinsics {
    /// Build from a camera matrix and an OpenCV-layout coefficient vector
    /// (`[k1, k2, p1, p2, k3]`; only the radial k1/k2 terms are applied).
    /// Fails when the camera matrix is not invertible.
    pub fn new(matrix: Matrix3<f64>, distortion: Vec<f64>) -> Result<Self> {
        let matrix_inv = matrix
            .try_inverse()
            .ok_or_else(|| Error::Solver("camera matrix is singular".to_string()))?;
        Ok(Self {
            matrix,
            matrix_inv,
            distortion,
        })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn distortion(&self) -> &[f64] {
        &self.distortion
    }

    pub(crate) fn inverse_matrix(&self) -> &Matrix3<f64> {
        &self.matrix_inv
    }

    fn k1(&self) -> f64 {
        self.distortion.first().copied().unwrap_or(0.0)
    }

    fn k2(&self) -> f64 {
        self.distortion.get(1).copied().unwrap_or(0.0)
    }

    /// Pixel position of a camera-frame point, pinhole model only.
    /// `None` when the point is not in front of the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 1e-9 {
            return None;
        }
        let x = p.x / p.z;
        let y = p.y / p.z;
        Some(self.pixel_from_normalized(x, y))
    }

    /// Pixel position of a camera-frame point with the radial distortion
    /// model applied
    pub fn project_distorted(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 1e-9 {
            return None;
        }
        let x = p.x / p.z;
        let y = p.y / p.z;
        let r2 = x * x + y * y;
        let factor = 1.0 + self.k1() * r2 + self.k2() * r2 * r2;
        Some(self.pixel_from_normalized(x * factor, y * factor))
    }

    /// Remove radial distortion from a pixel coordinate by fixed-point
    /// iteration on the normalized coordinates
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let n = self.matrix_inv * Vector3::new(pixel.x, pixel.y, 1.0);
        let (xd, yd) = (n.x, n.y);
        let (mut x, mut y) = (xd, yd);
        for _ in 0..8 {
            let r2 = x * x + y * y;
            let factor = 1.0 + self.k1() * r2 + self.k2() * r2 * r2;
            if factor.abs() < 1e-9 {
                break;
            }
            x = xd / factor;
            y = yd / factor;
        }
        self.pixel_from_normalized(x, y)
    }

    /// Normalized image coordinates of a pixel (distortion not removed)
    pub(crate) fn normalize_pixel(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let n = self.matrix_inv * Vector3::new(pixel.x, pixel.y, 1.0);
        Vector2::new(n.x, n.y)
    }

    fn pixel_from_normalized(&self, x: f64, y: f64) -> Vector2<f64> {
        Vector2::new(
            self.matrix[(0, 0)] * x + self.matrix[(0, 1)] * y + self.matrix[(0, 2)],
            self.matrix[(1, 1)] * y + self.matrix[(1, 2)],
        )
    }
}

/// Proper rotation nearest to an arbitrary 3x3 matrix, via SVD
pub(crate) fn nearest_rotation(m: &Matrix3<f64>) -> Result<UnitQuaternion<f64>> {
    let svd = m.svd(true, true);
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
    let r = u * v_t;
    Ok(UnitQuaternion::from_rotation_matrix(
        &Rotation3::from_matrix_unchecked(r),
    ))
}

/// RMS pixel reprojection error of a camera-frame pose against 3D/2D
/// correspondences. Points behind the camera poison the score to infinity
/// so the hypothesis can never win a comparison.
pub(crate) fn reprojection_rms(
    pose: &Iso3,
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> f64 {
    let mut sum = 0.0;
    for (obj, pix) in object.iter().zip(image) {
        let cam = pose * nalgebra::Point3::from(*obj);
        match intrinsics.project(&cam.coords) {
            Some(projected) => sum += (projected - pix).norm_squared(),
            None => return f64::INFINITY,
        }
    }
    (sum / object.len() as f64).sqrt()
}
