// SPDX-License-Identifier: CEPL-1.0
//! Transient geometry for beams, particles, flares and debug lines.
//!
//! Everything here is rebuilt from scratch each frame and uploaded into the
//! slot's stream arena right before it is drawn.

use bytemuck::{Pod, Zeroable};
use refresh_math::{make_normal_vectors, rotate_point_around_vector, Vec3};
use refresh_render::{Color, DebugLine, Entity, Particle, ParticleColor, RenderFlags};

use crate::frame_state::ViewParams;
use crate::palette::Palette;

pub const PARTICLE_SIZE: f32 = 1.0 + std::f32::consts::FRAC_1_SQRT_2;
pub const PARTICLE_SCALE: f32 = 1.0 / (2.0 * PARTICLE_SIZE);
pub const CYLINDER_SIDES: usize = 12;
const DISTANCE_BIAS: f32 = 20.0;
const DISTANCE_SCALE: f32 = 0.004;
const FLARE_SCALE: f32 = 2.5;
const CYLINDER_WIDTH: f32 = 0.5;
const QUAD_WIDTH: f32 = 1.2;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct EffectVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LineVertex {
    pub position: [f32; 3],
    pub color: [u8; 4],
}

fn vertex(p: Vec3, uv: [f32; 2], color: Color) -> EffectVertex {
    EffectVertex { position: p.to_array(), uv, color: color.0 }
}

fn scale_alpha(color: Color, alpha: f32) -> Color {
    let a = if alpha.is_finite() { alpha.clamp(0.0, 1.0) } else { 1.0 };
    let mut out = color;
    out.0[3] = (color.0[3] as f32 * a).round() as u8;
    out
}

fn distance_scale(base: f32, origin: Vec3, view: &ViewParams) -> f32 {
    let dist = (origin - view.origin).dot(view.axis[0]);
    if dist > DISTANCE_BIAS {
        base + dist * DISTANCE_SCALE
    } else {
        base
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeamPrimitive {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub color: Color,
}

impl BeamPrimitive {
    /// Beams carry their endpoints in `origin`/`old_origin` and diameter in `frame`.
    pub fn from_entity(e: &Entity) -> Self {
        let color = if e.flags.contains(RenderFlags::TRANSLUCENT) { scale_alpha(e.rgba, e.alpha) } else { e.rgba };
        BeamPrimitive { start: e.origin, end: e.old_origin, radius: e.frame as f32, color }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlarePrimitive {
    pub origin: Vec3,
    pub scale: f32,
    pub color: Color,
}

impl FlarePrimitive {
    pub fn from_entity(e: &Entity) -> Self {
        FlarePrimitive { origin: e.origin, scale: e.alpha.max(0.0), color: e.rgba }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EffectStream {
    pub vertices: Vec<EffectVertex>,
    pub indices: Vec<u16>,
}

impl EffectStream {
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    fn fits(&self, extra: usize) -> bool {
        self.vertices.len() + extra <= u16::MAX as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EffectCounts {
    pub beams: u32,
    pub particles: u32,
    pub flares: u32,
    pub lines: u32,
}

#[derive(Clone, Debug, Default)]
pub struct EffectBuffers {
    pub beams: EffectStream,
    /// Unindexed, three vertices per particle.
    pub particles: EffectStream,
    pub flares: EffectStream,
    pub lines_depth: Vec<LineVertex>,
    pub lines_nodepth: Vec<LineVertex>,
    pub counts: EffectCounts,
}

impl EffectBuffers {
    pub fn clear(&mut self) {
        self.beams.clear();
        self.particles.clear();
        self.flares.clear();
        self.lines_depth.clear();
        self.lines_nodepth.clear();
        self.counts = EffectCounts::default();
    }

    pub fn push_beam(&mut self, beam: &BeamPrimitive, view: &ViewParams, cylinder: bool) -> bool {
        let radius = beam.radius.abs();
        if !radius.is_finite() || radius <= 0.0 {
            return false;
        }
        let width = radius * if cylinder { CYLINDER_WIDTH } else { QUAD_WIDTH };
        let dir = (beam.end - beam.start).normalize_or_zero();
        if dir == Vec3::ZERO {
            return false;
        }
        let pushed = if cylinder {
            self.push_cylinder(beam, dir, width)
        } else {
            self.push_beam_quad(beam, dir, width, view)
        };
        if pushed {
            self.counts.beams += 1;
        }
        pushed
    }

    fn push_cylinder(&mut self, beam: &BeamPrimitive, dir: Vec3, width: f32) -> bool {
        let stream = &mut self.beams;
        if !stream.fits(CYLINDER_SIDES * 2) {
            return false;
        }
        let (right, _) = make_normal_vectors(dir);
        let offset = right * width;
        let base = stream.vertices.len() as u16;
        for i in 0..CYLINDER_SIDES {
            let o = rotate_point_around_vector(dir, offset, 360.0 / CYLINDER_SIDES as f32 * i as f32);
            stream.vertices.push(vertex(beam.start + o, [0.0, 0.0], beam.color));
            stream.vertices.push(vertex(beam.end + o, [0.0, 1.0], beam.color));
        }
        for i in 0..CYLINDER_SIDES {
            let cur = base + (i * 2) as u16;
            let next = base + (((i + 1) % CYLINDER_SIDES) * 2) as u16;
            stream.indices.extend_from_slice(&[cur, cur + 1, next + 1, cur, next + 1, next]);
        }
        true
    }

    fn push_beam_quad(&mut self, beam: &BeamPrimitive, dir: Vec3, width: f32, view: &ViewParams) -> bool {
        let stream = &mut self.beams;
        if !stream.fits(4) {
            return false;
        }
        let mut right = dir.cross(view.origin - beam.start).normalize_or_zero();
        if right == Vec3::ZERO {
            right = make_normal_vectors(dir).0;
        }
        let r = right * width;
        let base = stream.vertices.len() as u16;
        let c = beam.color;
        stream.vertices.extend_from_slice(&[
            vertex(beam.start + r, [0.0, 0.0], c),
            vertex(beam.start - r, [1.0, 0.0], c),
            vertex(beam.end - r, [1.0, 1.0], c),
            vertex(beam.end + r, [0.0, 1.0], c),
        ]);
        stream.indices.extend([0, 2, 3, 0, 1, 2].map(|i| base + i));
        true
    }

    pub fn push_particle(&mut self, p: &Particle, palette: &Palette, view: &ViewParams, part_scale: f32) -> bool {
        let scale = distance_scale(1.0, p.origin, view) * part_scale * p.scale;
        if !scale.is_finite() || scale <= 0.0 {
            return false;
        }
        let base_color = match p.color {
            ParticleColor::Index(i) => palette.get(i),
            ParticleColor::Rgba(c) => c,
        };
        let color = scale_alpha(base_color, p.alpha);
        let s2 = scale * PARTICLE_SCALE;
        let [_, left, up] = view.axis;
        let v0 = p.origin + left * s2 - up * s2;
        let v1 = v0 + up * scale;
        let v2 = v0 - left * scale;
        self.particles.vertices.extend_from_slice(&[
            vertex(v0, [0.0, 0.0], color),
            vertex(v1, [0.0, PARTICLE_SIZE], color),
            vertex(v2, [PARTICLE_SIZE, 0.0], color),
        ]);
        self.counts.particles += 1;
        true
    }

    pub fn push_flare(&mut self, flare: &FlarePrimitive, view: &ViewParams) -> bool {
        if !flare.scale.is_finite() || flare.scale <= 0.0 || !self.flares.fits(4) {
            return false;
        }
        let scale = distance_scale(FLARE_SCALE, flare.origin, view) * flare.scale;
        let [_, axis_left, axis_up] = view.axis;
        let left = axis_left * scale;
        let up = axis_up * scale;
        let o = flare.origin;
        let c = flare.color;
        let stream = &mut self.flares;
        let base = stream.vertices.len() as u16;
        stream.vertices.extend_from_slice(&[
            vertex(o - up + left, [0.0, 1.0], c),
            vertex(o + up + left, [0.0, 0.0], c),
            vertex(o - up - left, [1.0, 1.0], c),
            vertex(o + up - left, [1.0, 0.0], c),
        ]);
        stream.indices.extend([0, 1, 2, 2, 1, 3].map(|i| base + i));
        self.counts.flares += 1;
        true
    }

    pub fn push_line(&mut self, line: &DebugLine) {
        let target = if line.depth_test { &mut self.lines_depth } else { &mut self.lines_nodepth };
        target.push(LineVertex { position: line.start.to_array(), color: line.color.0 });
        target.push(LineVertex { position: line.end.to_array(), color: line.color.0 });
        self.counts.lines += 1;
    }
}
