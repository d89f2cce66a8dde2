//! Marker outlines on the preview frame
//!
//! Draws detected marker quads and their decoded ids directly onto the RGB
//! buffer. Digits use a 5x7 dot pattern so no text rasterization is needed.

use image::{Rgb, RgbImage};

use crate::detect::Detection;

const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);
const GLYPH_WIDTH: i64 = 5;

/// Rows of each digit, leftmost column in bit 4.
#[rustfmt::skip]
const DIGIT_GLYPHS: [[u8; 7]; 10] = [
    [0x0e, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0e],
    [0x04, 0x0c, 0x04, 0x04, 0x04, 0x04, 0x0e],
    [0x0e, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1f],
    [0x1f, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0e],
    [0x02, 0x06, 0x0a, 0x12, 0x1f, 0x02, 0x02],
    [0x1f, 0x10, 0x1e, 0x01, 0x01, 0x11, 0x0e],
    [0x06, 0x08, 0x10, 0x1e, 0x11, 0x11, 0x0e],
    [0x1f, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
    [0x0e, 0x11, 0x11, 0x0e, 0x11, 0x11, 0x0e],
    [0x0e, 0x11, 0x11, 0x0f, 0x01, 0x02, 0x0c],
];

/// Draws every detection's outline and id onto the frame.
pub fn draw_detections(frame: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        let corners: Vec<(i64, i64)> = detection
            .corners
            .iter()
            .map(|c| (c.x.round() as i64, c.y.round() as i64))
            .collect();
        for i in 0..4 {
            draw_line(frame, corners[i], corners[(i + 1) % 4]);
        }
        draw_id(frame, detection.id, corners[0]);
    }
}

fn set_pixel(frame: &mut RgbImage, x: i64, y: i64) {
    if x >= 0 && y >= 0 && (x as u32) < frame.width() && (y as u32) < frame.height() {
        frame.put_pixel(x as u32, y as u32, OUTLINE);
    }
}

fn draw_line(frame: &mut RgbImage, from: (i64, i64), to: (i64, i64)) {
    let (mut x, mut y) = from;
    let dx = (to.0 - from.0).abs();
    let dy = -(to.1 - from.1).abs();
    let sx = if from.0 < to.0 { 1 } else { -1 };
    let sy = if from.1 < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        set_pixel(frame, x, y);
        if x == to.0 && y == to.1 {
            break;
        }
        let doubled = 2 * err;
        if doubled >= dy {
            err += dy;
            x += sx;
        }
        if doubled <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Decoded id next to the first corner.
fn draw_id(frame: &mut RgbImage, id: i64, corner: (i64, i64)) {
    let y = corner.1 - 10;
    let mut x = corner.0 + 3;
    for digit in id.unsigned_abs().to_string().bytes() {
        draw_glyph(frame, (digit - b'0') as usize, x, y);
        x += GLYPH_WIDTH + 1;
    }
}

fn draw_glyph(frame: &mut RgbImage, digit: usize, x: i64, y: i64) {
    for (row, bits) in DIGIT_GLYPHS[digit].iter().enumerate() {
        for col in 0..GLYPH_WIDTH {
            if bits & (1 << (4 - col)) != 0 {
                set_pixel(frame, x + col, y + row as i64);
            }
        }
    }
}
