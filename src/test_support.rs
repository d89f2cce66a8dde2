//! Shared fixtures for in-module tests: synthetic marker rendering and
//! pinhole projection helpers.

use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Point3, Vector3};

use crate::detect::families::TagFamily;
use crate::geometry::Iso3;
use crate::solver::CameraIntrinsics;

pub fn white_canvas(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([255, 255, 255]))
}

/// Renders a marker axis-aligned on the canvas. `origin` is the top-left
/// pixel of the black border ring, `cell_px` the pixel size of one cell.
pub fn render_tag(
    canvas: &mut RgbImage,
    family: &TagFamily,
    id: u16,
    origin: (u32, u32),
    cell_px: u32,
) {
    let code = family.code(id).expect("id present in family");
    let dim = family.dimension() as u32;
    let cells = dim + 2;

    for cy in 0..cells {
        for cx in 0..cells {
            let on_ring = cx == 0 || cy == 0 || cx == cells - 1 || cy == cells - 1;
            let white = !on_ring && code & (1u64 << ((cy - 1) * dim + (cx - 1))) != 0;
            let value = if white { 255 } else { 0 };
            for py in 0..cell_px {
                for px in 0..cell_px {
                    canvas.put_pixel(
                        origin.0 + cx * cell_px + px,
                        origin.1 + cy * cell_px + py,
                        Rgb([value; 3]),
                    );
                }
            }
        }
    }
}

/// Grayscale value of a marker's face at a point in its own frame, where
/// the marker spans `[0, size]` on both axes with the canonical top-left
/// at the origin and y growing downward. `None` outside the marker.
pub fn tag_surface_value(family: &TagFamily, id: u16, size: f64, x: f64, y: f64) -> Option<u8> {
    if x < 0.0 || y < 0.0 || x >= size || y >= size {
        return None;
    }
    let code = family.code(id).expect("id present in family");
    let dim = family.dimension() as u32;
    let cells = dim + 2;
    let cell = size / cells as f64;

    let cx = (x / cell) as u32;
    let cy = (y / cell) as u32;
    let on_ring = cx == 0 || cy == 0 || cx == cells - 1 || cy == cells - 1;
    let white = !on_ring && code & (1u64 << ((cy - 1) * dim + (cx - 1))) != 0;
    Some(if white { 255 } else { 0 })
}

/// Paints the z=0 plane of a posed surface as seen through an undistorted
/// pinhole camera. `camera_from_plane` maps plane coordinates into the
/// camera frame; `surface` returns the gray value at a plane point, with
/// `None` falling through to a white background.
pub fn render_plane_view(
    width: u32,
    height: u32,
    intrinsics: &CameraIntrinsics,
    camera_from_plane: &Iso3,
    surface: impl Fn(f64, f64) -> Option<u8>,
) -> RgbImage {
    let plane_from_camera = camera_from_plane.inverse();
    let k = intrinsics.matrix();
    let (fx, fy) = (k[(0, 0)], k[(1, 1)]);
    let (cx, cy) = (k[(0, 2)], k[(1, 2)]);

    let origin = plane_from_camera * Point3::origin();
    let mut canvas = white_canvas(width, height);
    for v in 0..height {
        for u in 0..width {
            let ray = Vector3::new(
                (u as f64 - cx) / fx,
                (v as f64 - cy) / fy,
                1.0,
            );
            let dir = plane_from_camera * ray;
            if dir.z.abs() < 1e-12 {
                continue;
            }
            let t = -origin.z / dir.z;
            if t <= 0.0 {
                continue;
            }
            let hit = origin + dir * t;
            if let Some(value) = surface(hit.x, hit.y) {
                canvas.put_pixel(u, v, Rgb([value; 3]));
            }
        }
    }
    canvas
}

pub fn test_intrinsics(fx: f64, fy: f64, cx: f64, cy: f64) -> CameraIntrinsics {
    let matrix = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
    CameraIntrinsics::new(matrix, Vec::new()).expect("invertible camera matrix")
}
