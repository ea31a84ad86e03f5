// SPDX-License-Identifier: CEPL-1.0
//! 2D quad batching and the geometry helpers behind the 2D entry points.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use refresh_core::LogOnce;
use refresh_math::{Vec2, Vec3};
use refresh_render::{ClipRect, Color, ImageHandle};
use tracing::warn;

const INITIAL_VERTICES: usize = 256;
const INITIAL_INDICES: usize = 384;
pub const MIN_SCALE: f32 = 0.25;
pub const MAX_SCALE: f32 = 4.0;
const BASE_WIDTH: u32 = 640;
const BASE_HEIGHT: u32 = 480;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex2D {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

pub const FULL_UVS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quad {
    pub positions: [[f32; 2]; 4],
    pub uvs: [[f32; 2]; 4],
    pub color: Color,
    pub texture: ImageHandle,
}

/// A run of quads sharing one texture, handed to the flush sink.
#[derive(Clone, Copy, Debug)]
pub struct Batch<'a> {
    pub texture: ImageHandle,
    pub vertices: &'a [Vertex2D],
    pub indices: &'a [u16],
}

pub struct Batcher2D {
    vertices: Vec<Vertex2D>,
    indices: Vec<u16>,
    texture: ImageHandle,
    active: bool,
    flushes: usize,
    misuse: LogOnce,
}

impl Default for Batcher2D {
    fn default() -> Self {
        Self::new()
    }
}

impl Batcher2D {
    pub fn new() -> Self {
        Batcher2D {
            vertices: Vec::with_capacity(INITIAL_VERTICES),
            indices: Vec::with_capacity(INITIAL_INDICES),
            texture: ImageHandle::NULL,
            active: false,
            flushes: 0,
            misuse: LogOnce::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Batches handed to a sink since creation.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn begin(&mut self) -> bool {
        if self.active {
            if self.misuse.first("begin") {
                warn!("2D batch begun twice");
            }
            return false;
        }
        self.reset();
        self.active = true;
        true
    }

    pub fn submit_quad(&mut self, quad: &Quad, sink: &mut dyn FnMut(Batch<'_>)) {
        if !self.active {
            if self.misuse.first("submit") {
                warn!("2D quad submitted outside begin/end");
            }
            return;
        }
        let full = self.vertices.len() + 4 > u16::MAX as usize;
        if !self.vertices.is_empty() && (quad.texture != self.texture || full) {
            self.flush(sink);
        }
        if self.vertices.is_empty() {
            self.texture = quad.texture;
        }

        let base = self.vertices.len() as u16;
        for (p, uv) in quad.positions.iter().zip(quad.uvs.iter()) {
            self.vertices.push(Vertex2D { position: *p, uv: *uv, color: quad.color.0 });
        }
        self.indices.extend([0, 2, 3, 0, 1, 2].map(|i| base + i));
    }

    pub fn flush(&mut self, sink: &mut dyn FnMut(Batch<'_>)) {
        if !self.vertices.is_empty() {
            sink(Batch { texture: self.texture, vertices: &self.vertices, indices: &self.indices });
            self.flushes += 1;
        }
        self.reset();
    }

    pub fn end(&mut self, sink: &mut dyn FnMut(Batch<'_>)) {
        if !self.active {
            return;
        }
        self.flush(sink);
        self.active = false;
    }

    fn reset(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.texture = ImageHandle::NULL;
    }
}

/// Corners clockwise from the top left, scaled into framebuffer pixels.
pub fn make_quad(x: f32, y: f32, w: f32, h: f32, scale: f32) -> [[f32; 2]; 4] {
    [[x, y], [x + w, y], [x + w, y + h], [x, y + h]].map(|[px, py]| [px * scale, py * scale])
}

/// UVs that crop the image to fill a `w` x `h` box without distortion.
pub fn keep_aspect_uvs(w: f32, h: f32, image_w: u32, image_h: u32) -> [[f32; 2]; 4] {
    if image_w == 0 || image_h == 0 || w <= 0.0 || h <= 0.0 {
        return FULL_UVS;
    }
    let aspect = image_w as f32 / image_h as f32;
    let scaled_w = w;
    let scaled_h = h * aspect;
    let m = scaled_w.max(scaled_h);
    let s = 0.5 * (1.0 - scaled_w / m);
    let t = 0.5 * (1.0 - scaled_h / m);
    [[s, t], [1.0 - s, t], [1.0 - s, 1.0 - t], [s, 1.0 - t]]
}

/// Quad rotated by `angle` degrees about `(x + pivot_x, y + pivot_y)`.
#[allow(clippy::too_many_arguments)]
pub fn rotated_quad(x: f32, y: f32, w: f32, h: f32, angle: f32, pivot_x: f32, pivot_y: f32, scale: f32) -> [[f32; 2]; 4] {
    let pivot = Vec2::new(x + pivot_x, y + pivot_y);
    let (s, c) = angle.to_radians().sin_cos();
    make_quad(x, y, w, h, 1.0).map(|[px, py]| {
        let d = Vec2::new(px, py) - pivot;
        let r = pivot + Vec2::new(d.x * c - d.y * s, d.x * s + d.y * c);
        [r.x * scale, r.y * scale]
    })
}

/// Texture coordinates for a tiled background (64 pixel tiles).
pub fn tile_uvs(x: f32, y: f32, w: f32, h: f32) -> [[f32; 2]; 4] {
    make_quad(x, y, w, h, 1.0 / 64.0)
}

pub fn clamp_scale(scale: f32) -> f32 {
    if scale.is_finite() {
        scale.clamp(MIN_SCALE, MAX_SCALE)
    } else {
        1.0
    }
}

pub fn auto_scale(width: u32, height: u32) -> i32 {
    let s = if height >= width { width / BASE_WIDTH } else { height / BASE_HEIGHT };
    s.max(1) as i32
}

/// Scales a virtual clip rectangle into the framebuffer. `None` when the
/// result is empty.
pub fn scale_clip(clip: &ClipRect, scale: f32, extent: vk::Extent2D) -> Option<vk::Rect2D> {
    let fw = extent.width as f32;
    let fh = extent.height as f32;
    let left = (clip.left as f32 * scale).floor().clamp(0.0, fw);
    let top = (clip.top as f32 * scale).floor().clamp(0.0, fh);
    let right = (clip.right as f32 * scale).ceil().clamp(0.0, fw);
    let bottom = (clip.bottom as f32 * scale).ceil().clamp(0.0, fh);
    if right <= left || bottom <= top {
        return None;
    }
    Some(vk::Rect2D {
        offset: vk::Offset2D { x: left as i32, y: top as i32 },
        extent: vk::Extent2D { width: (right - left) as u32, height: (bottom - top) as u32 },
    })
}

pub fn full_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D { offset: vk::Offset2D::default(), extent }
}

/// Glyph cell UVs in a 16x16 atlas.
pub fn glyph_uvs(ch: u8) -> [[f32; 2]; 4] {
    let col = (ch & 15) as f32 / 16.0;
    let row = (ch >> 4) as f32 / 16.0;
    let step = 1.0 / 16.0;
    [[col, row], [col + step, row], [col + step, row + step], [col, row + step]]
}

/// Palette colour rounded through an RGB vector; keeps the alpha as-is.
pub fn tint(color: Color, rgb: Vec3) -> Color {
    let [r, g, b, a] = color.0;
    let f = |c: u8, k: f32| (c as f32 * k).clamp(0.0, 255.0) as u8;
    Color([f(r, rgb.x), f(g, rgb.y), f(b, rgb.z), a])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(tex: i32) -> Quad {
        Quad { positions: make_quad(0.0, 0.0, 8.0, 8.0, 1.0), uvs: FULL_UVS, color: Color::WHITE, texture: ImageHandle(tex) }
    }

    #[test]
    fn texture_changes_force_flushes() {
        let mut b = Batcher2D::new();
        let mut batches = Vec::new();
        let mut sink = |batch: Batch<'_>| batches.push((batch.texture, batch.vertices.len(), batch.indices.len()));
        assert!(b.begin());
        for tex in [1, 1, 2, 1] {
            b.submit_quad(&quad(tex), &mut sink);
        }
        b.end(&mut sink);
        assert_eq!(batches, vec![(ImageHandle(1), 8, 12), (ImageHandle(2), 4, 6), (ImageHandle(1), 4, 6)]);
        assert_eq!(b.flushes(), 3);
    }

    #[test]
    fn quads_outside_begin_end_are_dropped() {
        let mut b = Batcher2D::new();
        let mut count = 0;
        let mut sink = |_: Batch<'_>| count += 1;
        b.submit_quad(&quad(1), &mut sink);
        assert!(b.is_empty());
        b.begin();
        b.submit_quad(&quad(1), &mut sink);
        b.end(&mut sink);
        b.submit_quad(&quad(1), &mut sink);
        b.end(&mut sink);
        assert!(b.is_empty());
        assert_eq!(count, 1);
    }

    #[test]
    fn double_begin_is_refused() {
        let mut b = Batcher2D::new();
        assert!(b.begin());
        assert!(!b.begin());
        assert!(b.is_active());
    }

    #[test]
    fn index_range_forces_flush() {
        let mut b = Batcher2D::new();
        let mut sizes = Vec::new();
        let mut sink = |batch: Batch<'_>| sizes.push(batch.vertices.len());
        b.begin();
        let quads = u16::MAX as usize / 4 + 1;
        for _ in 0..quads {
            b.submit_quad(&quad(1), &mut sink);
        }
        b.end(&mut sink);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|&n| n <= u16::MAX as usize));
        assert_eq!(sizes.iter().sum::<usize>(), quads * 4);
    }

    #[test]
    fn quad_indices_cover_both_triangles() {
        let mut b = Batcher2D::new();
        let mut seen = Vec::new();
        let mut sink = |batch: Batch<'_>| seen.extend_from_slice(batch.indices);
        b.begin();
        b.submit_quad(&quad(1), &mut sink);
        b.submit_quad(&quad(1), &mut sink);
        b.end(&mut sink);
        assert_eq!(seen, vec![0, 2, 3, 0, 1, 2, 4, 6, 7, 4, 5, 6]);
    }

    #[test]
    fn empty_flush_only_resets() {
        let mut b = Batcher2D::new();
        let mut count = 0;
        b.begin();
        b.flush(&mut |_: Batch<'_>| count += 1);
        assert_eq!(count, 0);
        assert_eq!(b.flushes(), 0);
    }

    #[test]
    fn scale_and_auto_scale() {
        assert_eq!(clamp_scale(10.0), MAX_SCALE);
        assert_eq!(clamp_scale(0.0), MIN_SCALE);
        assert_eq!(clamp_scale(f32::NAN), 1.0);
        assert_eq!(auto_scale(1920, 1080), 2);
        assert_eq!(auto_scale(1280, 2560), 2);
        assert_eq!(auto_scale(320, 200), 1);
        assert_eq!(make_quad(1.0, 2.0, 3.0, 4.0, 2.0), [[2.0, 4.0], [8.0, 4.0], [8.0, 12.0], [2.0, 12.0]]);
    }

    #[test]
    fn clip_rects_scale_and_clamp() {
        let fb = vk::Extent2D { width: 800, height: 600 };
        let r = scale_clip(&ClipRect { left: 10, top: 10, right: 500, bottom: 400 }, 1.5, fb).unwrap();
        assert_eq!((r.offset.x, r.offset.y), (15, 15));
        assert_eq!((r.extent.width, r.extent.height), (735, 585));
        assert!(scale_clip(&ClipRect { left: 900, top: 0, right: 1000, bottom: 10 }, 1.0, fb).is_none());
        assert!(scale_clip(&ClipRect { left: 5, top: 5, right: 5, bottom: 50 }, 1.0, fb).is_none());
    }

    #[test]
    fn keep_aspect_crops_the_long_side() {
        let uvs = keep_aspect_uvs(100.0, 100.0, 200, 100);
        assert_eq!(uvs[0], [0.25, 0.0]);
        assert_eq!(uvs[2], [0.75, 1.0]);
        assert_eq!(keep_aspect_uvs(100.0, 100.0, 64, 64), FULL_UVS);
    }

    #[test]
    fn rotation_about_pivot() {
        let q = rotated_quad(0.0, 0.0, 2.0, 2.0, 90.0, 1.0, 1.0, 1.0);
        // Top-left corner swings to the top-right.
        assert!((q[0][0] - 2.0).abs() < 1e-5 && q[0][1].abs() < 1e-5);
        let still = rotated_quad(4.0, 4.0, 2.0, 2.0, 0.0, 0.0, 0.0, 2.0);
        assert_eq!(still, make_quad(4.0, 4.0, 2.0, 2.0, 2.0));
    }

    #[test]
    fn glyph_cells() {
        let uv = glyph_uvs(b'A');
        assert_eq!(uv[0], [1.0 / 16.0, 4.0 / 16.0]);
        assert_eq!(tint(Color::WHITE, Vec3::new(1.0, 0.5, 0.0)), Color::rgba(255, 127, 0, 255));
    }
}
