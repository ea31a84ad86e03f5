// SPDX-License-Identifier: CEPL-1.0
//! Per-frame scene description supplied by the game layer.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use refresh_math::Vec3;

use crate::handles::{ImageHandle, ModelHandle};

/// 8-bit RGBA colour.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const WHITE: Color = Color([255, 255, 255, 255]);
    pub const BLACK: Color = Color([0, 0, 0, 255]);
    pub const TRANSPARENT: Color = Color([0, 0, 0, 0]);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Color([r, g, b, a])
    }

    /// Packed little-endian RGBA, red in the low byte.
    pub const fn from_u32(packed: u32) -> Self {
        Color(packed.to_le_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn alpha(self) -> u8 {
        self.0[3]
    }

    /// Normalised channels with alpha multiplied by `alpha_scale` (clamped).
    pub fn to_f32(self, alpha_scale: f32) -> [f32; 4] {
        let [r, g, b, a] = self.0;
        let scale = if alpha_scale.is_finite() { alpha_scale.clamp(0.0, 1.0) } else { 1.0 };
        [
            r as f32 / 255.0,
            g as f32 / 255.0,
            b as f32 / 255.0,
            a as f32 / 255.0 * scale,
        ]
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

bitflags! {
    /// Entity render flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RenderFlags: u32 {
        const MINLIGHT    = 1 << 0;
        const VIEWERMODEL = 1 << 1;
        const WEAPONMODEL = 1 << 2;
        const FULLBRIGHT  = 1 << 3;
        const DEPTHHACK   = 1 << 4;
        const TRANSLUCENT = 1 << 5;
        const FRAMELERP   = 1 << 6;
        const BEAM        = 1 << 7;
        const CUSTOMSKIN  = 1 << 8;
        const GLOW        = 1 << 9;
        const SHELL_RED   = 1 << 10;
        const SHELL_GREEN = 1 << 11;
        const SHELL_BLUE  = 1 << 12;
        const NOSHADOW    = 1 << 13;
        const FLARE       = 1 << 14;
    }
}

bitflags! {
    /// Whole-view flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RdFlags: u32 {
        const UNDERWATER   = 1 << 0;
        const NOWORLDMODEL = 1 << 1;
        const IRGOGGLES    = 1 << 2;
        const UVGOGGLES    = 1 << 3;
    }
}

/// A drawable entity.
///
/// Beams reuse the fields: `origin` and `old_origin` are the endpoints and
/// `frame` is the beam diameter; a beam with `frame == 0` is not drawn.
#[derive(Clone, Debug, Default)]
pub struct Entity {
    pub model: ModelHandle,
    pub origin: Vec3,
    pub old_origin: Vec3,
    pub angles: Vec3,
    pub scale: Vec3,
    pub frame: i32,
    pub old_frame: i32,
    pub backlerp: f32,
    pub skin: ImageHandle,
    pub skin_num: i32,
    pub flags: RenderFlags,
    pub alpha: f32,
    pub rgba: Color,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DLight {
    pub origin: Vec3,
    pub radius: f32,
    pub color: Vec3,
    pub intensity: f32,
    /// Spot cone direction and cosine; zero for point lights.
    pub cone: [f32; 4],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParticleColor {
    /// Index into the 256-entry palette.
    Index(u8),
    Rgba(Color),
}

#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub origin: Vec3,
    pub color: ParticleColor,
    pub alpha: f32,
    pub scale: f32,
}

impl Default for Particle {
    fn default() -> Self {
        Particle {
            origin: Vec3::ZERO,
            color: ParticleColor::Rgba(Color::WHITE),
            alpha: 1.0,
            scale: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LightStyle {
    pub white: f32,
    pub rgb: Vec3,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Fog {
    pub color: Vec3,
    pub density: f32,
    pub sky_factor: f32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeightFog {
    pub start_color: Vec3,
    pub start_dist: f32,
    pub end_color: Vec3,
    pub end_dist: f32,
    pub density: f32,
    pub falloff: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct DebugLine {
    pub start: Vec3,
    pub end: Vec3,
    pub color: Color,
    pub depth_test: bool,
}

/// Everything needed to draw one 3D view.
#[derive(Clone, Debug, Default)]
pub struct RefDef {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub vieworg: Vec3,
    pub viewangles: Vec3,
    pub time: f32,
    pub rdflags: RdFlags,
    pub screen_blend: [f32; 4],
    pub damage_blend: [f32; 4],
    pub fog: Fog,
    pub heightfog: HeightFog,
    pub entities: Vec<Entity>,
    pub dlights: Vec<DLight>,
    pub particles: Vec<Particle>,
    pub lightstyles: Vec<LightStyle>,
    /// Visible-area bitmask from the PVS; `None` means everything is visible.
    pub areabits: Option<Vec<u8>>,
    pub debug_lines: Vec<DebugLine>,
}

impl RefDef {
    pub fn world_visible(&self) -> bool {
        !self.rdflags.contains(RdFlags::NOWORLDMODEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_colour_keeps_red_in_low_byte() {
        let c = Color::rgba(0x11, 0x22, 0x33, 0x44);
        assert_eq!(c.to_u32(), 0x4433_2211);
        assert_eq!(Color::from_u32(0x4433_2211), c);
    }

    #[test]
    fn alpha_scale_clamps() {
        let c = Color::rgba(255, 0, 0, 255);
        assert_eq!(c.to_f32(0.5)[3], 0.5);
        assert_eq!(c.to_f32(3.0)[3], 1.0);
        assert_eq!(c.to_f32(f32::NAN)[3], 1.0);
    }
}
