//! Quadrilateral candidate extraction
//!
//! ## Responsibilities
//! - Binarize a grayscale frame with an adaptive mean threshold so marker
//!   borders survive uneven lighting.
//! - Trace region borders into contours and simplify them to four-corner
//!   convex polygons.
//! - Reject degenerate candidates (too small, concave, near-duplicate) and
//!   normalize the corner winding to clockwise.
//! - Warp a candidate's image content onto an axis-aligned square patch for
//!   bit-grid sampling.

use image::GrayImage;
use nalgebra::Vector2;

/// Tuning knobs for candidate extraction.
#[derive(Debug, Clone)]
pub struct QuadParams {
    /// Box blur kernel radius used for the adaptive threshold local mean.
    pub blur_kernel: usize,
    /// How much darker than the local mean a pixel must be to count as ink.
    pub threshold_offset: i32,
    /// Polygon simplification scale, relative to contour point count.
    pub poly_epsilon: f64,
    /// Minimum contour point count relative to the image width.
    pub min_length_ratio: f64,
    /// Minimum quad edge length in pixels.
    pub min_edge_px: f64,
}

impl Default for QuadParams {
    fn default() -> Self {
        Self {
            blur_kernel: 2,
            threshold_offset: 7,
            poly_epsilon: 0.05,
            min_length_ratio: 0.01,
            min_edge_px: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pt {
    x: i32,
    y: i32,
}

/// Extracts convex quadrilateral candidates from a grayscale frame.
///
/// Corners come back in clockwise image order (y down), ready for warping.
/// No decoding happens here; every dark-bordered quad in the frame is a
/// candidate.
pub fn find_quads(gray: &GrayImage, params: &QuadParams) -> Vec<[Vector2<f64>; 4]> {
    let width = gray.width() as usize;
    let height = gray.height() as usize;
    if width < 4 || height < 4 {
        return Vec::new();
    }

    let thresholded = adaptive_threshold(gray, params.blur_kernel, params.threshold_offset);
    let contours = find_contours(&thresholded, width, height);

    let min_points = (width as f64 * params.min_length_ratio) as usize;
    let mut candidates: Vec<[Vector2<f64>; 4]> = Vec::new();
    for contour in &contours {
        if contour.len() < min_points {
            continue;
        }
        let epsilon = contour.len() as f64 * params.poly_epsilon;
        let poly = approx_poly_dp(contour, epsilon);
        if poly.len() != 4 || !is_convex(&poly) {
            continue;
        }
        if min_edge_length(&poly) < params.min_edge_px {
            continue;
        }
        let mut quad = [
            Vector2::new(poly[0].x as f64, poly[0].y as f64),
            Vector2::new(poly[1].x as f64, poly[1].y as f64),
            Vector2::new(poly[2].x as f64, poly[2].y as f64),
            Vector2::new(poly[3].x as f64, poly[3].y as f64),
        ];
        clockwise(&mut quad);
        candidates.push(quad);
    }

    // A marker ring yields both an outer and an inner contour; keep the
    // larger of any overlapping pair.
    let min_dist = f64::max(30.0, width as f64 * 0.05);
    drop_near_duplicates(candidates, min_dist)
}

/// Warps the quad's image content onto a `size`x`size` grayscale patch.
///
/// Solves the square-to-quad projective map in closed form and samples the
/// source bilinearly at each destination cell center.
pub fn warp_patch(gray: &GrayImage, quad: &[Vector2<f64>; 4], size: usize) -> Vec<u8> {
    let h = square_to_quad(quad);
    let src = gray.as_raw();
    let width = gray.width() as usize;
    let height = gray.height() as usize;
    let mut patch = vec![0u8; size * size];

    let mut pos = 0;
    for i in 0..size {
        let v = (i as f64 + 0.5) / size as f64;
        for j in 0..size {
            let u = (j as f64 + 0.5) / size as f64;
            let den = h[6] * u + h[7] * v + h[8];
            let x = (h[0] * u + h[1] * v + h[2]) / den;
            let y = (h[3] * u + h[4] * v + h[5]) / den;
            patch[pos] = sample_bilinear(src, width, height, x, y);
            pos += 1;
        }
    }
    patch
}

/// Otsu's threshold over a grayscale patch histogram.
pub fn otsu_threshold(patch: &[u8]) -> u8 {
    let mut hist = [0u32; 256];
    for &p in patch {
        hist[p as usize] += 1;
    }

    let total = patch.len() as f64;
    let mut sum = 0.0;
    for (i, &count) in hist.iter().enumerate() {
        sum += count as f64 * i as f64;
    }

    let mut threshold = 0u8;
    let mut sum_b = 0.0;
    let mut w_b = 0.0;
    let mut max = 0.0;
    for (i, &count) in hist.iter().enumerate() {
        w_b += count as f64;
        if w_b == 0.0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f == 0.0 {
            break;
        }
        sum_b += count as f64 * i as f64;
        let mu = sum_b / w_b - (sum - sum_b) / w_f;
        let between = w_b * w_f * mu * mu;
        if between > max {
            max = between;
            threshold = i as u8;
        }
    }
    threshold
}

/// Binarizes a patch in place; values above the threshold become 255.
pub fn binarize(patch: &mut [u8], threshold: u8) {
    for p in patch.iter_mut() {
        *p = if *p > threshold { 255 } else { 0 };
    }
}

/// Counts lit pixels inside a `cell`x`cell` square of a binarized patch.
pub fn count_nonzero(patch: &[u8], stride: usize, x: usize, y: usize, cell: usize) -> usize {
    let mut n = 0;
    for row in y..y + cell {
        for col in x..x + cell {
            if patch[row * stride + col] != 0 {
                n += 1;
            }
        }
    }
    n
}

const BLUR_MULT: [u32; 16] = [
    1, 171, 205, 293, 57, 373, 79, 137, 241, 27, 391, 357, 41, 19, 283, 265,
];
const BLUR_SHIFT: [u32; 16] = [0, 9, 10, 11, 9, 12, 10, 11, 12, 9, 13, 13, 10, 9, 13, 13];

/// Two-pass stack box blur with edge replication.
fn stack_box_blur(src: &[u8], dst: &mut [u8], width: usize, height: usize, kernel: usize) {
    let kernel = kernel.min(15);
    let size = kernel * 2 + 1;
    let radius = kernel + 1;
    let mult = BLUR_MULT[kernel];
    let shift = BLUR_SHIFT[kernel];
    let width_minus_1 = width.saturating_sub(1);
    let height_minus_1 = height.saturating_sub(1);
    let mut stack = [0u8; 31];

    // Horizontal pass: src -> dst.
    let mut pos = 0;
    for _ in 0..height {
        let start = pos;
        let edge = src[pos] as u32;
        let mut sum = radius as u32 * edge;

        let mut sp = 0;
        for _ in 0..radius {
            stack[sp] = edge as u8;
            sp = (sp + 1) % size;
        }
        for i in 1..radius {
            let c = src[pos + i.min(width_minus_1)];
            stack[sp] = c;
            sum += c as u32;
            sp = (sp + 1) % size;
        }

        let mut oldest = 0;
        for x in 0..width {
            dst[pos] = ((sum * mult) >> shift) as u8;
            pos += 1;

            let p = start + (x + radius).min(width_minus_1);
            sum -= stack[oldest] as u32;
            let c = src[p];
            sum += c as u32;
            stack[oldest] = c;
            oldest = (oldest + 1) % size;
        }
    }

    // Vertical pass, in place over dst. Rows ahead of the write cursor are
    // still horizontal-pass output, rows behind are recalled via the stack.
    for x in 0..width {
        let mut pos = x;
        let edge = dst[pos] as u32;
        let mut sum = radius as u32 * edge;

        let mut sp = 0;
        for _ in 0..radius {
            stack[sp] = edge as u8;
            sp = (sp + 1) % size;
        }
        let mut ahead = pos + width;
        for _ in 1..radius {
            let c = dst[ahead.min(x + height_minus_1 * width)];
            stack[sp] = c;
            sum += c as u32;
            sp = (sp + 1) % size;
            ahead += width;
        }

        let mut oldest = 0;
        for y in 0..height {
            dst[pos] = ((sum * mult) >> shift) as u8;

            let p = x + (y + radius).min(height_minus_1) * width;
            sum -= stack[oldest] as u32;
            let c = dst[p];
            sum += c as u32;
            stack[oldest] = c;
            oldest = (oldest + 1) % size;

            pos += width;
        }
    }
}

/// Inverted adaptive mean threshold: pixels darker than their local mean by
/// more than `offset` become 255, everything else 0.
fn adaptive_threshold(gray: &GrayImage, kernel: usize, offset: i32) -> Vec<u8> {
    let src = gray.as_raw();
    let width = gray.width() as usize;
    let height = gray.height() as usize;

    let mut out = vec![0u8; src.len()];
    stack_box_blur(src, &mut out, width, height, kernel);
    for i in 0..src.len() {
        let delta = src[i] as i32 - out[i] as i32;
        out[i] = if delta <= -offset { 255 } else { 0 };
    }
    out
}

const NEIGHBORS: [[i32; 2]; 8] = [
    [1, 0],
    [1, -1],
    [0, -1],
    [-1, -1],
    [-1, 0],
    [-1, 1],
    [0, 1],
    [1, 1],
];

fn neighborhood_deltas(stride: i32) -> [i32; 16] {
    let mut deltas = [0i32; 16];
    for i in 0..8 {
        let delta = NEIGHBORS[i][0] + NEIGHBORS[i][1] * stride;
        deltas[i] = delta;
        deltas[i + 8] = delta;
    }
    deltas
}

/// Traces one region border starting at `pos`, marking visited pixels in the
/// scratch buffer with `label`.
fn trace_border(
    scratch: &mut [i32],
    pos: usize,
    label: i32,
    mut point: Pt,
    hole: bool,
    deltas: &[i32; 16],
) -> Vec<Pt> {
    let mut points = Vec::new();

    let mut s: usize = if hole { 0 } else { 4 };
    let mut s_end = s;
    let mut pos1;

    loop {
        s = s.wrapping_sub(1) & 7;
        pos1 = (pos as isize + deltas[s] as isize) as usize;
        if scratch[pos1] != 0 {
            break;
        }
        if s == s_end {
            break;
        }
    }

    if s == s_end {
        // Isolated pixel.
        scratch[pos] = -label;
        points.push(point);
    } else {
        let mut pos3 = pos;
        let mut pos4;

        loop {
            s_end = s;

            loop {
                s = (s + 1) & 15;
                pos4 = (pos3 as isize + deltas[s] as isize) as usize;
                if scratch[pos4] != 0 {
                    break;
                }
            }
            s &= 7;

            if s > 0 && s - 1 < s_end {
                scratch[pos3] = -label;
            } else if scratch[pos3] == 1 {
                scratch[pos3] = label;
            }

            points.push(point);
            point.x += NEIGHBORS[s][0];
            point.y += NEIGHBORS[s][1];

            if pos4 == pos && pos3 == pos1 {
                break;
            }

            pos3 = pos4;
            s = (s + 4) & 7;
        }
    }

    points
}

/// Suzuki border following over a binary image. Returns every outer and
/// hole contour as a chain of pixel coordinates.
fn find_contours(binary: &[u8], width: usize, height: usize) -> Vec<Vec<Pt>> {
    // One-pixel zero border so neighbor reads never leave the buffer.
    let stride = width + 2;
    let mut scratch = vec![0i32; stride * (height + 2)];
    for y in 0..height {
        let src_row = y * width;
        let dst_row = (y + 1) * stride + 1;
        for x in 0..width {
            scratch[dst_row + x] = (binary[src_row + x] != 0) as i32;
        }
    }

    let deltas = neighborhood_deltas(stride as i32);
    let mut contours = Vec::new();
    let mut pos = stride + 1;
    let mut label = 1;

    for y in 0..height {
        for x in 0..width {
            let pix = scratch[pos];
            if pix != 0 {
                let outer = pix == 1 && scratch[pos - 1] == 0;
                let hole = !outer && pix >= 1 && scratch[pos + 1] == 0;
                if outer || hole {
                    label += 1;
                    let start = Pt {
                        x: x as i32,
                        y: y as i32,
                    };
                    contours.push(trace_border(&mut scratch, pos, label, start, hole, &deltas));
                }
            }
            pos += 1;
        }
        pos += 2;
    }
    contours
}

/// Douglas-Peucker polygon simplification over a closed contour. The
/// tolerance is relative to each chord's length, so long straight runs
/// collapse while true corners survive.
fn approx_poly_dp(contour: &[Pt], epsilon: f64) -> Vec<Pt> {
    let len = contour.len();
    if len == 0 {
        return Vec::new();
    }

    #[derive(Clone, Copy)]
    struct Span {
        start: usize,
        end: usize,
    }

    let mut span = Span { start: 0, end: 0 };
    let mut right = Span { start: 0, end: 0 };
    let mut poly = Vec::new();
    let mut stack: Vec<Span> = Vec::new();
    let epsilon_sq = epsilon * epsilon;

    let mut k = 0;
    let mut start_pt = contour[0];
    let mut max_dist = 0.0;

    // Seed the split with a far-apart point pair, refined over three sweeps.
    for _ in 0..3 {
        max_dist = 0.0;
        k = (k + right.start) % len;
        start_pt = contour[k];
        k += 1;
        if k == len {
            k = 0;
        }

        for j in 1..len {
            let pt = contour[k];
            k += 1;
            if k == len {
                k = 0;
            }

            let dx = (pt.x - start_pt.x) as f64;
            let dy = (pt.y - start_pt.y) as f64;
            let dist = dx * dx + dy * dy;
            if dist > max_dist {
                max_dist = dist;
                right.start = j;
            }
        }
    }

    if max_dist <= epsilon_sq {
        poly.push(start_pt);
    } else {
        span.start = k;
        right.start += span.start;
        span.end = right.start;

        if right.start >= len {
            right.start -= len;
        }
        right.end = span.start;
        if right.end < right.start {
            right.end += len;
        }

        stack.push(Span {
            start: right.start,
            end: right.end,
        });
        stack.push(Span {
            start: span.start,
            end: span.end,
        });
    }

    while let Some(mut current) = stack.pop() {
        let end_pt = contour[current.end % len];
        k = current.start % len;
        start_pt = contour[k];
        k += 1;
        if k == len {
            k = 0;
        }

        let le_eps;
        if current.end <= current.start + 1 {
            le_eps = true;
        } else {
            max_dist = 0.0;
            let dx = (end_pt.x - start_pt.x) as f64;
            let dy = (end_pt.y - start_pt.y) as f64;

            for i in (current.start + 1)..current.end {
                let pt = contour[k];
                k += 1;
                if k == len {
                    k = 0;
                }

                let dist =
                    ((pt.y - start_pt.y) as f64 * dx - (pt.x - start_pt.x) as f64 * dy).abs();
                if dist > max_dist {
                    max_dist = dist;
                    right.start = i;
                }
            }

            le_eps = max_dist * max_dist <= epsilon_sq * (dx * dx + dy * dy);
        }

        if le_eps {
            poly.push(start_pt);
        } else {
            right.end = current.end;
            current.end = right.start;

            stack.push(Span {
                start: right.start,
                end: right.end,
            });
            stack.push(Span {
                start: current.start,
                end: current.end,
            });
        }
    }

    poly
}

fn is_convex(poly: &[Pt]) -> bool {
    let len = poly.len();
    if len == 0 {
        return false;
    }

    let mut orientation = 0;
    let mut prev = poly[len - 1];
    let mut cur = poly[0];
    let mut dx0 = cur.x - prev.x;
    let mut dy0 = cur.y - prev.y;

    let mut j = 0;
    for _ in 0..len {
        j += 1;
        if j == len {
            j = 0;
        }

        prev = cur;
        cur = poly[j];

        let dx = cur.x - prev.x;
        let dy = cur.y - prev.y;
        let cross = dy as i64 * dx0 as i64 - dx as i64 * dy0 as i64;

        orientation |= match cross {
            c if c > 0 => 1,
            c if c < 0 => 2,
            _ => 3,
        };
        if orientation == 3 {
            return false;
        }

        dx0 = dx;
        dy0 = dy;
    }
    true
}

fn min_edge_length(poly: &[Pt]) -> f64 {
    let len = poly.len();
    if len <= 1 {
        return 0.0;
    }

    let mut min_sq = f64::INFINITY;
    let mut j = len - 1;
    for i in 0..len {
        let dx = (poly[i].x - poly[j].x) as f64;
        let dy = (poly[i].y - poly[j].y) as f64;
        min_sq = min_sq.min(dx * dx + dy * dy);
        j = i;
    }
    min_sq.sqrt()
}

fn clockwise(quad: &mut [Vector2<f64>; 4]) {
    let d1 = quad[1] - quad[0];
    let d2 = quad[2] - quad[0];
    if d1.x * d2.y - d1.y * d2.x < 0.0 {
        quad.swap(1, 3);
    }
}

fn perimeter(quad: &[Vector2<f64>; 4]) -> f64 {
    (0..4).map(|i| (quad[(i + 1) % 4] - quad[i]).norm()).sum()
}

/// Keeps the larger of any two candidates whose corners nearly coincide.
fn drop_near_duplicates(
    candidates: Vec<[Vector2<f64>; 4]>,
    min_dist: f64,
) -> Vec<[Vector2<f64>; 4]> {
    let len = candidates.len();
    let mut dropped = vec![false; len];

    for i in 0..len {
        for j in (i + 1)..len {
            let dist_sq: f64 = (0..4)
                .map(|k| (candidates[i][k] - candidates[j][k]).norm_squared())
                .sum();
            if dist_sq / 4.0 < min_dist * min_dist {
                if perimeter(&candidates[i]) < perimeter(&candidates[j]) {
                    dropped[i] = true;
                } else {
                    dropped[j] = true;
                }
            }
        }
    }

    candidates
        .into_iter()
        .zip(dropped)
        .filter(|(_, d)| !*d)
        .map(|(c, _)| c)
        .collect()
}

/// Projective map sending the unit square's corners (0,0) (1,0) (1,1) (0,1)
/// onto `q[0]..q[3]`, as a row-major 3x3 matrix.
fn square_to_quad(q: &[Vector2<f64>; 4]) -> [f64; 9] {
    let px = q[0].x - q[1].x + q[2].x - q[3].x;
    let py = q[0].y - q[1].y + q[2].y - q[3].y;

    if px.abs() < 1e-12 && py.abs() < 1e-12 {
        [
            q[1].x - q[0].x,
            q[3].x - q[0].x,
            q[0].x,
            q[1].y - q[0].y,
            q[3].y - q[0].y,
            q[0].y,
            0.0,
            0.0,
            1.0,
        ]
    } else {
        let dx1 = q[1].x - q[2].x;
        let dx2 = q[3].x - q[2].x;
        let dy1 = q[1].y - q[2].y;
        let dy2 = q[3].y - q[2].y;
        let den = dx1 * dy2 - dx2 * dy1;
        let g = (px * dy2 - dx2 * py) / den;
        let h = (dx1 * py - px * dy1) / den;
        [
            q[1].x - q[0].x + g * q[1].x,
            q[3].x - q[0].x + h * q[3].x,
            q[0].x,
            q[1].y - q[0].y + g * q[1].y,
            q[3].y - q[0].y + h * q[3].y,
            q[0].y,
            g,
            h,
            1.0,
        ]
    }
}

fn sample_bilinear(src: &[u8], width: usize, height: usize, x: f64, y: f64) -> u8 {
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);
    let x0 = x as usize;
    let y0 = y as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let top = src[y0 * width + x0] as f64 * (1.0 - fx) + src[y0 * width + x1] as f64 * fx;
    let bottom = src[y1 * width + x0] as f64 * (1.0 - fx) + src[y1 * width + x1] as f64 * fx;
    (top * (1.0 - fy) + bottom * fy).round() as u8
}
