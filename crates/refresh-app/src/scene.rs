// SPDX-License-Identifier: CEPL-1.0
//! Synthetic scene: an orbiting camera around a ring of cubes plus one of
//! each effect kind the renderer knows how to draw.

use refresh_math::{angle_vectors, Vec3};
use refresh_render::{
    Color, DLight, DebugLine, Entity, Fog, ImageHandle, ModelHandle, Particle, ParticleColor, RefDef, RenderFlags,
};

const RING: usize = 8;
const RING_RADIUS: f32 = 96.0;
const ORBIT_RADIUS: f32 = 220.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct DemoModels {
    pub cube: ModelHandle,
    pub flare: ModelHandle,
    pub skin: ImageHandle,
}

fn cube(model: ModelHandle, skin: ImageHandle, origin: Vec3, yaw: f32) -> Entity {
    Entity {
        model,
        origin,
        old_origin: origin,
        angles: Vec3::new(0.0, yaw, 0.0),
        scale: Vec3::ONE,
        skin,
        alpha: 1.0,
        ..Default::default()
    }
}

/// Builds the view for time `t` seconds at `width`x`height` pixels.
pub fn build(models: &DemoModels, t: f32, width: u32, height: u32) -> RefDef {
    let orbit = t * 0.25;
    let vieworg = Vec3::new(orbit.cos() * ORBIT_RADIUS, orbit.sin() * ORBIT_RADIUS, 64.0);
    let to_center = -vieworg;
    let yaw = to_center.y.atan2(to_center.x).to_degrees();
    let pitch = -(to_center.z.atan2(to_center.truncate().length())).to_degrees();
    let viewangles = Vec3::new(pitch, yaw, 0.0);

    let fov_x = 90.0f32;
    let aspect = height.max(1) as f32 / width.max(1) as f32;
    let fov_y = (2.0 * ((fov_x.to_radians() / 2.0).tan() * aspect).atan()).to_degrees();

    let mut entities = Vec::with_capacity(RING + 4);
    for i in 0..RING {
        let a = i as f32 / RING as f32 * std::f32::consts::TAU;
        let origin = Vec3::new(a.cos() * RING_RADIUS, a.sin() * RING_RADIUS, 0.0);
        entities.push(cube(models.cube, models.skin, origin, t * 40.0 + i as f32 * 45.0));
    }

    let mut glass = cube(models.cube, models.skin, Vec3::new(0.0, 0.0, 24.0), -t * 30.0);
    glass.flags = RenderFlags::TRANSLUCENT;
    glass.alpha = 0.4;
    entities.push(glass);

    let (forward, right, up) = angle_vectors(viewangles);
    let mut weapon = cube(models.cube, models.skin, vieworg + forward * 40.0 + right * 12.0 - up * 14.0, yaw);
    weapon.flags = RenderFlags::WEAPONMODEL | RenderFlags::MINLIGHT;
    weapon.scale = Vec3::splat(0.25);
    entities.push(weapon);

    entities.push(Entity {
        origin: Vec3::new(-RING_RADIUS, 0.0, 48.0),
        old_origin: Vec3::new(RING_RADIUS, 0.0, 48.0),
        frame: 4,
        flags: RenderFlags::BEAM,
        alpha: 0.6,
        rgba: Color::rgba(80, 160, 255, 255),
        ..Default::default()
    });

    entities.push(Entity {
        model: models.flare,
        origin: Vec3::new(0.0, 0.0, 96.0),
        old_origin: Vec3::new(0.0, 0.0, 96.0),
        scale: Vec3::ONE,
        flags: RenderFlags::FLARE,
        alpha: 1.0,
        rgba: Color::rgba(255, 220, 160, 255),
        ..Default::default()
    });

    let pulse = 0.75 + 0.25 * (t * 3.0).sin();
    let dlights = vec![
        DLight {
            origin: Vec3::new(0.0, 0.0, 64.0),
            radius: 200.0 * pulse,
            color: Vec3::new(1.0, 0.6, 0.3),
            intensity: 1.0,
            cone: [0.0; 4],
        },
        DLight {
            origin: Vec3::new(RING_RADIUS, 0.0, 32.0),
            radius: 120.0,
            color: Vec3::new(0.3, 0.5, 1.0),
            intensity: 1.0,
            cone: [0.0; 4],
        },
    ];

    let particles = (0..64)
        .map(|i| {
            let a = i as f32 * 0.7 + t;
            let h = (t * 20.0 + i as f32 * 3.0) % 96.0;
            Particle {
                origin: Vec3::new(a.cos() * 24.0, a.sin() * 24.0, h),
                color: ParticleColor::Index(0xe0 + (i % 8) as u8),
                alpha: 1.0 - h / 96.0,
                scale: 1.0,
            }
        })
        .collect();

    let debug_lines = vec![
        DebugLine { start: Vec3::ZERO, end: Vec3::X * 32.0, color: Color::rgba(255, 0, 0, 255), depth_test: true },
        DebugLine { start: Vec3::ZERO, end: Vec3::Y * 32.0, color: Color::rgba(0, 255, 0, 255), depth_test: true },
        DebugLine { start: Vec3::ZERO, end: Vec3::Z * 32.0, color: Color::rgba(0, 0, 255, 255), depth_test: false },
    ];

    RefDef {
        width,
        height,
        fov_x,
        fov_y,
        vieworg,
        viewangles,
        time: t,
        fog: Fog { color: Vec3::new(0.2, 0.22, 0.28), density: 0.0015, sky_factor: 0.0 },
        entities,
        dlights,
        particles,
        debug_lines,
        ..Default::default()
    }
}
