//! Plane-to-image homography estimation

use nalgebra::{DMatrix, Matrix3, Vector2};

use crate::error::{Error, Result};

/// Estimate the 3x3 homography mapping `src` plane points to `dst` image
/// points with the direct linear transform. Both point sets are conditioned
/// with a similarity normalization before the solve. Needs at least 4
/// correspondences.
pub fn dlt_homography(src: &[Vector2<f64>], dst: &[Vector2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(Error::Solver(format!(
            "homography needs at least 4 correspondences, got {}",
            src.len().min(dst.len())
        )));
    }

    let t_src = conditioning_transform(src);
    let t_dst = conditioning_transform(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let s = apply_conditioning(&t_src, s);
        let d = apply_conditioning(&t_dst, d);

        let r = 2 * i;
        a[(r, 0)] = -s.x;
        a[(r, 1)] = -s.y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = d.x * s.x;
        a[(r, 7)] = d.x * s.y;
        a[(r, 8)] = d.x;

        let r = r + 1;
        a[(r, 3)] = -s.x;
        a[(r, 4)] = -s.y;
        a[(r, 5)] = -1.0;
        a[(r, 6)] = d.y * s.x;
        a[(r, 7)] = d.y * s.y;
        a[(r, 8)] = d.y;
    }

    let svd = a.svd(true, true);
    let v_t = svd
        .v_t
        .as_ref()
        .ok_or_else(|| Error::Solver("homography SVD failed".to_string()))?;
    let h = v_t.row(v_t.nrows() - 1);
    let conditioned = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| Error::Solver("degenerate point conditioning".to_string()))?;
    let mut h = t_dst_inv * conditioned * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 {
        return Err(Error::Solver("homography scale vanished".to_string()));
    }
    h /= scale;
    Ok(h)
}

/// Apply a homography to a 2D point
pub fn map_point(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let w = h[(2, 0)] * p.x + h[(2, 1)] * p.y + h[(2, 2)];
    Vector2::new(
        (h[(0, 0)] * p.x + h[(0, 1)] * p.y + h[(0, 2)]) / w,
        (h[(1, 0)] * p.x + h[(1, 1)] * p.y + h[(1, 2)]) / w,
    )
}

// Similarity transform centering the points on the origin with mean
// distance sqrt(2), the usual conditioning for the DLT.
fn conditioning_transform(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    )
}

fn apply_conditioning(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    Vector2::new(
        t[(0, 0)] * p.x + t[(0, 2)],
        t[(1, 1)] * p.y + t[(1, 2)],
    )
}
