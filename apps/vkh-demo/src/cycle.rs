//! Which texture is on screen, and fallback texture content.

use glam::Vec4;

/// Clear colors paired with texture slots.
pub const PALETTE: [Vec4; 8] = [
    Vec4::new(0.80, 0.20, 0.20, 1.0),
    Vec4::new(0.85, 0.55, 0.15, 1.0),
    Vec4::new(0.85, 0.80, 0.20, 1.0),
    Vec4::new(0.25, 0.70, 0.25, 1.0),
    Vec4::new(0.20, 0.60, 0.75, 1.0),
    Vec4::new(0.20, 0.30, 0.80, 1.0),
    Vec4::new(0.50, 0.25, 0.75, 1.0),
    Vec4::new(0.75, 0.30, 0.60, 1.0),
];

/// Advances through `len` slots, one step every `frames_per_image` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCycle {
    index: u32,
    len: u32,
    frames_per_image: u32,
    frames_until_next: u32,
}

impl ImageCycle {
    pub fn new(start: u32, len: u32, frames_per_image: u32) -> Self {
        let len = len.max(1);
        let frames_per_image = frames_per_image.max(1);
        Self {
            index: start % len,
            len,
            frames_per_image,
            frames_until_next: frames_per_image,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Count one frame. Returns `true` when the index moved.
    pub fn tick(&mut self) -> bool {
        self.frames_until_next -= 1;
        if self.frames_until_next > 0 {
            return false;
        }
        self.frames_until_next = self.frames_per_image;
        self.index = (self.index + 1) % self.len;
        true
    }

    pub fn clear_color(&self) -> [f32; 4] {
        PALETTE[self.index as usize % PALETTE.len()].to_array()
    }
}

/// A `size`x`size` two-tone checkerboard in RGBA8, tinted by `color`.
pub fn checkerboard(size: u32, cell: u32, color: Vec4) -> Vec<u8> {
    let cell = cell.max(1);
    let light = (color * 255.0).round();
    let dark = (color * 0.35 * 255.0).round();

    let mut pixels = Vec::with_capacity(size as usize * size as usize * 4);
    for y in 0..size {
        for x in 0..size {
            let tone = if (x / cell + y / cell) % 2 == 0 { light } else { dark };
            pixels.extend_from_slice(&[tone.x as u8, tone.y as u8, tone.z as u8, 255]);
        }
    }
    pixels
}
