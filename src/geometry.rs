//! Field-frame geometry
//!
//! Pose composition in the field coordinate convention (x forward, y left,
//! z up) and the mapping to the vision solver's camera convention (x right,
//! y down, z forward). Compositions are spelled out as explicit `compose`
//! and `invert` calls so the frame-to-frame order stays readable at the
//! call sites.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

/// 6-DOF rigid transform
pub type Iso3 = Isometry3<f64>;

/// Pose from a translation and intrinsic roll/pitch/yaw angles
pub fn pose_from_euler(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Iso3 {
    Iso3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_euler_angles(roll, pitch, yaw),
    )
}

/// Pose from a translation vector and an axis-angle rotation vector
pub fn pose_from_axis_angle(translation: Vector3<f64>, rotation: Vector3<f64>) -> Iso3 {
    Iso3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_scaled_axis(rotation),
    )
}

/// Apply `transform` in the local frame of `pose`
pub fn compose(pose: &Iso3, transform: &Iso3) -> Iso3 {
    pose * transform
}

/// Inverse rigid transform
pub fn invert(transform: &Iso3) -> Iso3 {
    transform.inverse()
}

/// Re-express a camera-convention pose (x right, y down, z forward) in the
/// field convention (x forward, y left, z up). Both the translation and the
/// rotation axis map componentwise: (x, y, z) becomes (z, -x, -y).
pub fn camera_to_field_axes(pose: &Iso3) -> Iso3 {
    let t = pose.translation.vector;
    let r = pose.rotation.scaled_axis();
    pose_from_axis_angle(
        Vector3::new(t.z, -t.x, -t.y),
        Vector3::new(r.z, -r.x, -r.y),
    )
}

/// Map a field-convention point into the camera convention:
/// (x, y, z) becomes (-y, -z, x)
pub fn field_point_to_camera(p: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(-p.y, -p.z, p.x)
}

/// True when a position lies outside the field volume inflated by the
/// per-axis margin; each axis is checked independently.
pub fn is_outside_field(pose: &Iso3, field_size: &[f64; 3], field_margin: &[f64; 3]) -> bool {
    let t = pose.translation.vector;
    for axis in 0..3 {
        if t[axis] < -field_margin[axis] || t[axis] > field_size[axis] + field_margin[axis] {
            return true;
        }
    }
    false
}
