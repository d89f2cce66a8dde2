//! Fiducial marker detection
//!
//! ## Responsibilities
//! - Resolve the configured marker-family name against the vendored code
//!   tables, hot-swapping the active dictionary when the name changes.
//! - Run the per-frame pipeline: quad candidates, patch warp, border-ring
//!   check, payload bit sampling, code table lookup.
//! - Canonicalize the corner order of each match so corner 0 is the
//!   family's top-left regardless of how the marker is rotated in view.

pub mod families;
mod quad;

use image::{GrayImage, RgbImage};
use nalgebra::Vector2;
use tracing::{info, warn};

use crate::config_mirror::ConfigSnapshot;
use families::TagFamily;
use quad::QuadParams;

/// Warped pixels per marker cell.
const CELL_PX: usize = 8;

/// A decoded marker in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Id within the family that decoded it.
    pub id: i64,
    /// Pixel corners, clockwise from the marker's canonical top-left.
    pub corners: [Vector2<f64>; 4],
}

/// Maps a configured family name to its code table. Names outside the
/// vendored set resolve to `None`, which disables detection.
pub fn family_by_name(name: &str) -> Option<&'static TagFamily> {
    match name {
        "16h5" => Some(&families::TAG16H5),
        "36h11" => Some(&families::TAG36H11),
        _ => None,
    }
}

/// Per-frame marker detector tracking the configured family.
pub struct TagDetector {
    active: Option<&'static TagFamily>,
    last_name: Option<String>,
    params: QuadParams,
}

impl TagDetector {
    pub fn new() -> Self {
        Self {
            active: None,
            last_name: None,
            params: QuadParams::default(),
        }
    }

    /// Detects markers in the frame using the family named by the current
    /// config. With an unrecognized family name this returns an empty list
    /// until the name changes.
    pub fn search(&mut self, frame: &RgbImage, config: &ConfigSnapshot) -> Vec<Detection> {
        self.update_family(&config.tag_family);
        let Some(family) = self.active else {
            return Vec::new();
        };
        let gray = image::imageops::grayscale(frame);
        detect_in_gray(&gray, family, &self.params)
    }

    fn update_family(&mut self, name: &str) {
        if self.last_name.as_deref() == Some(name) {
            return;
        }
        self.active = family_by_name(name);
        match self.active {
            Some(family) => info!(family = family.name(), "marker family changed"),
            None => warn!(family = name, "unknown marker family, detection disabled"),
        }
        self.last_name = Some(name.to_string());
    }
}

impl Default for TagDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Detects markers with an explicit family, independent of the configured
/// one. Calibration board capture runs through here.
pub fn detect_with_family(frame: &RgbImage, family: &TagFamily) -> Vec<Detection> {
    let gray = image::imageops::grayscale(frame);
    detect_in_gray(&gray, family, &QuadParams::default())
}

fn detect_in_gray(gray: &GrayImage, family: &TagFamily, params: &QuadParams) -> Vec<Detection> {
    quad::find_quads(gray, params)
        .into_iter()
        .filter_map(|corners| decode_quad(gray, &corners, family))
        .collect()
}

/// Warps one candidate to an axis-aligned patch, samples its bit grid, and
/// looks the code up in the family table.
fn decode_quad(
    gray: &GrayImage,
    corners: &[Vector2<f64>; 4],
    family: &TagFamily,
) -> Option<Detection> {
    let dim = family.dimension();
    let cells = dim + 2;
    let patch_size = cells * CELL_PX;

    let mut patch = quad::warp_patch(gray, corners, patch_size);
    let threshold = quad::otsu_threshold(&patch);
    quad::binarize(&mut patch, threshold);

    let half_cell = (CELL_PX * CELL_PX) / 2;

    // The border ring must be black all the way around.
    for i in 0..cells {
        let step = if i == 0 || i == cells - 1 { 1 } else { cells - 1 };
        let mut j = 0;
        while j < cells {
            let lit = quad::count_nonzero(&patch, patch_size, j * CELL_PX, i * CELL_PX, CELL_PX);
            if lit > half_cell {
                return None;
            }
            j += step;
        }
    }

    // Majority-sample the payload, top-left cell in the low bit.
    let mut bits = 0u64;
    for y in 0..dim {
        for x in 0..dim {
            let lit = quad::count_nonzero(
                &patch,
                patch_size,
                (x + 1) * CELL_PX,
                (y + 1) * CELL_PX,
                CELL_PX,
            );
            if lit > half_cell {
                bits |= 1u64 << (y * dim + x);
            }
        }
    }

    let matched = family.decode(bits)?;

    // A match at rotation r means the patch shows the tag turned r
    // quarter-turns counterclockwise, so the canonical corner k sits at
    // sampled corner (k - r) mod 4.
    let mut canonical = *corners;
    for (k, slot) in canonical.iter_mut().enumerate() {
        *slot = corners[(k + 4 - matched.rotation) % 4];
    }

    Some(Detection {
        id: matched.id as i64,
        corners: canonical,
    })
}
