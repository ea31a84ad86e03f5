// SPDX-License-Identifier: CEPL-1.0
//! Per-frame snapshot of the scene plus the switches derived from it.

use bytemuck::{Pod, Zeroable};
use refresh_core::RenderConfig;
use refresh_math::{angle_vectors, angles_to_axis, model_matrix, Mat4, Vec3};
use refresh_render::{DLight, Entity, RdFlags, RefDef, RenderFlags};

use crate::pipeline::Features;

pub const MAX_DLIGHTS: usize = 32;
const DLIGHT_CUTOFF: f32 = 64.0;
const INV_LIGHT_INTENSITY: f32 = 1.0 / 255.0;
const Z_NEAR: f32 = 4.0;
const Z_FAR: f32 = 8192.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostToggles {
    pub waterwarp: bool,
    pub bloom: bool,
    pub overlay: bool,
}

impl PostToggles {
    pub fn any(&self) -> bool {
        self.waterwarp || self.bloom || self.overlay
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSettings {
    /// Only the fog bits of [`Features`].
    pub fog: Features,
    pub dynamic_lights: bool,
    pub per_pixel_lighting: bool,
    pub post: PostToggles,
}

impl FrameSettings {
    pub fn evaluate(config: &RenderConfig, fd: &RefDef) -> Self {
        let mut fog = Features::empty();
        if config.fog_enabled() {
            if fd.fog.density > 0.0 {
                fog |= Features::FOG_GLOBAL;
            }
            if fd.heightfog.density > 0.0 && fd.heightfog.falloff > 0.0 {
                fog |= Features::FOG_HEIGHT;
            }
            if fd.fog.sky_factor > 0.0 {
                fog |= Features::FOG_SKY;
            }
        }

        let dynamic_lights = config.dynamic_lights_allowed() && config.per_pixel_lighting_allowed();
        let post = PostToggles {
            waterwarp: config.waterwarp_enabled() && fd.rdflags.contains(RdFlags::UNDERWATER),
            bloom: config.bloom_enabled() && fd.world_visible(),
            overlay: config.polyblend_enabled() && (fd.screen_blend[3] > 0.0 || fd.damage_blend[3] > 0.0),
        };
        FrameSettings { fog, dynamic_lights, per_pixel_lighting: dynamic_lights, post }
    }

    /// Feature bits for this frame's pipelines.
    pub fn features(&self, has_dlights: bool) -> Features {
        let mut features = self.fog;
        if self.per_pixel_lighting {
            features |= Features::PPL;
        }
        if self.dynamic_lights && has_dlights {
            features |= Features::DLIGHTS;
        }
        features
    }
}

/// Camera derived from a [`RefDef`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewParams {
    pub origin: Vec3,
    /// Forward, left, up.
    pub axis: [Vec3; 3],
    pub view_proj: Mat4,
}

impl Default for ViewParams {
    fn default() -> Self {
        ViewParams { origin: Vec3::ZERO, axis: [Vec3::X, Vec3::Y, Vec3::Z], view_proj: Mat4::IDENTITY }
    }
}

impl ViewParams {
    pub fn from_refdef(fd: &RefDef) -> Self {
        let (forward, _, up) = angle_vectors(fd.viewangles);
        let view = Mat4::look_to_rh(fd.vieworg, forward, up);
        let aspect = if fd.width > 0 && fd.height > 0 { fd.width as f32 / fd.height as f32 } else { 4.0 / 3.0 };
        let fov_y = if fd.fov_y > 0.0 && fd.fov_y < 180.0 { fd.fov_y } else { 73.7 };
        let mut proj = Mat4::perspective_rh(fov_y.to_radians(), aspect, Z_NEAR, Z_FAR);
        // Vulkan clip space points y down.
        proj.y_axis.y = -proj.y_axis.y;
        ViewParams { origin: fd.vieworg, axis: angles_to_axis(fd.viewangles), view_proj: proj * view }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FrameState {
    pub refdef: RefDef,
    pub settings: FrameSettings,
    pub dlights: Vec<DLight>,
    pub view: ViewParams,
    pub has_refdef: bool,
}

impl FrameState {
    pub fn prepare(config: &RenderConfig, fd: &RefDef) -> Self {
        let settings = FrameSettings::evaluate(config, fd);
        let dlights = if settings.dynamic_lights {
            fd.dlights.iter().take(MAX_DLIGHTS).copied().collect()
        } else {
            Vec::new()
        };
        FrameState {
            refdef: fd.clone(),
            settings,
            dlights,
            view: ViewParams::from_refdef(fd),
            has_refdef: true,
        }
    }

    pub fn features(&self) -> Features {
        self.settings.features(!self.dlights.is_empty())
    }

    /// Light at `origin` from this frame's dynamic lights, on top of full bright.
    pub fn light_point(&self, origin: Vec3) -> Vec3 {
        let mut light = Vec3::ONE;
        if !self.has_refdef {
            return light;
        }
        for dl in &self.dlights {
            let contribution = dl.radius - DLIGHT_CUTOFF - origin.distance(dl.origin);
            if contribution > 0.0 {
                light += dl.color * (contribution * INV_LIGHT_INTENSITY * dl.intensity);
            }
        }
        light
    }
}

/// Push-constant block shared by every pipeline.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DrawConstants {
    pub mvp: [[f32; 4]; 4],
    pub color: [f32; 4],
    pub light: [f32; 4],
    /// backlerp, then unused.
    pub lerp: [f32; 4],
    /// frame, oldframe, render flags, unused.
    pub ints: [u32; 4],
}

impl DrawConstants {
    pub fn with_matrix(mvp: Mat4) -> Self {
        DrawConstants {
            mvp: mvp.to_cols_array_2d(),
            color: [1.0; 4],
            light: [1.0; 4],
            lerp: [0.0; 4],
            ints: [0; 4],
        }
    }

    pub fn for_entity(entity: &Entity, view_proj: Mat4, light: Vec3) -> Self {
        let model = model_matrix(entity.origin, entity.angles, entity.scale);
        let alpha = if entity.flags.contains(RenderFlags::TRANSLUCENT) {
            if entity.alpha.is_finite() { entity.alpha.clamp(0.0, 1.0) } else { 1.0 }
        } else {
            1.0
        };
        DrawConstants {
            mvp: (view_proj * model).to_cols_array_2d(),
            color: [1.0, 1.0, 1.0, alpha],
            light: [light.x, light.y, light.z, 1.0],
            lerp: [entity.backlerp, 0.0, 0.0, 0.0],
            ints: [entity.frame as u32, entity.old_frame as u32, entity.flags.bits(), 0],
        }
    }
}

/// Counters for the frame being recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draw_calls: u32,
    pub pipelines_bound: u32,
    pub beams: u32,
    pub particles: u32,
    pub flares: u32,
    pub debug_lines: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use refresh_core::Toggle;
    use refresh_render::{Fog, HeightFog};

    #[test]
    fn fog_bits_follow_scene_and_toggle() {
        let mut cfg = RenderConfig::default();
        let fd = RefDef {
            fog: Fog { density: 0.1, sky_factor: 0.5, ..Default::default() },
            heightfog: HeightFog { density: 0.2, falloff: 0.0, ..Default::default() },
            ..Default::default()
        };
        let s = FrameSettings::evaluate(&cfg, &fd);
        assert_eq!(s.fog, Features::FOG_GLOBAL | Features::FOG_SKY);

        cfg.fog = Toggle::Off;
        assert!(FrameSettings::evaluate(&cfg, &fd).fog.is_empty());

        cfg.fog = Toggle::Auto;
        cfg.legacy.gl_fog = Some(false);
        assert!(FrameSettings::evaluate(&cfg, &fd).fog.is_empty());
    }

    #[test]
    fn dynamic_lighting_needs_both_switches() {
        let mut cfg = RenderConfig::default();
        cfg.per_pixel_lighting = Toggle::Off;
        let fd = RefDef {
            dlights: vec![DLight { radius: 200.0, color: Vec3::ONE, intensity: 1.0, ..Default::default() }],
            ..Default::default()
        };
        let state = FrameState::prepare(&cfg, &fd);
        assert!(!state.settings.dynamic_lights);
        assert!(!state.settings.per_pixel_lighting);
        assert!(state.dlights.is_empty());
        assert_eq!(state.light_point(Vec3::ZERO), Vec3::ONE);
    }

    #[test]
    fn dlights_are_capped() {
        let fd = RefDef { dlights: vec![DLight::default(); 40], ..Default::default() };
        let state = FrameState::prepare(&RenderConfig::default(), &fd);
        assert_eq!(state.dlights.len(), MAX_DLIGHTS);
    }

    #[test]
    fn light_point_adds_in_range_lights() {
        let fd = RefDef {
            dlights: vec![
                DLight { origin: Vec3::ZERO, radius: 64.0 + 255.0, color: Vec3::new(1.0, 0.5, 0.0), intensity: 1.0, cone: [0.0; 4] },
                DLight { origin: Vec3::new(1000.0, 0.0, 0.0), radius: 100.0, color: Vec3::ONE, intensity: 1.0, cone: [0.0; 4] },
            ],
            ..Default::default()
        };
        let state = FrameState::prepare(&RenderConfig::default(), &fd);
        let light = state.light_point(Vec3::ZERO);
        assert!((light - Vec3::new(2.0, 1.5, 1.0)).length() < 1e-5);
        assert_eq!(FrameState::default().light_point(Vec3::ZERO), Vec3::ONE);
    }

    #[test]
    fn post_toggles() {
        let cfg = RenderConfig::default();
        let mut fd = RefDef { rdflags: RdFlags::UNDERWATER | RdFlags::NOWORLDMODEL, ..Default::default() };
        let post = FrameSettings::evaluate(&cfg, &fd).post;
        assert!(post.waterwarp && !post.bloom && !post.overlay);

        fd.rdflags = RdFlags::empty();
        fd.damage_blend = [1.0, 0.0, 0.0, 0.3];
        let post = FrameSettings::evaluate(&cfg, &fd).post;
        assert!(!post.waterwarp && post.bloom && post.overlay);
    }

    #[test]
    fn translucent_alpha_is_clamped_into_push_constants() {
        let mut e = Entity { flags: RenderFlags::TRANSLUCENT, alpha: 1.7, ..Default::default() };
        assert_eq!(DrawConstants::for_entity(&e, Mat4::IDENTITY, Vec3::ONE).color[3], 1.0);
        e.alpha = 0.25;
        assert_eq!(DrawConstants::for_entity(&e, Mat4::IDENTITY, Vec3::ONE).color[3], 0.25);
        e.flags = RenderFlags::empty();
        assert_eq!(DrawConstants::for_entity(&e, Mat4::IDENTITY, Vec3::ONE).color[3], 1.0);
        assert_eq!(std::mem::size_of::<DrawConstants>(), 128);
    }
}
