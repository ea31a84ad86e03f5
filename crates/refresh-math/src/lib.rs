// SPDX-License-Identifier: CEPL-1.0
//! Vector helpers shared by the renderer crates.
//!
//! Angles follow the game convention: `[pitch, yaw, roll]` in degrees.

pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

pub const PITCH: usize = 0;
pub const YAW: usize = 1;
pub const ROLL: usize = 2;

/// Forward, right and up vectors for a set of view angles.
pub fn angle_vectors(angles: Vec3) -> (Vec3, Vec3, Vec3) {
    let (sy, cy) = angles[YAW].to_radians().sin_cos();
    let (sp, cp) = angles[PITCH].to_radians().sin_cos();
    let (sr, cr) = angles[ROLL].to_radians().sin_cos();

    let forward = Vec3::new(cp * cy, cp * sy, -sp);
    let right = Vec3::new(
        -sr * sp * cy + cr * sy,
        -sr * sp * sy - cr * cy,
        -sr * cp,
    );
    let up = Vec3::new(cr * sp * cy + sr * sy, cr * sp * sy - sr * cy, cr * cp);
    (forward, right, up)
}

/// Orientation axes (forward, left, up) for an entity.
pub fn angles_to_axis(angles: Vec3) -> [Vec3; 3] {
    let (forward, right, up) = angle_vectors(angles);
    [forward, -right, up]
}

/// Right and up vectors completing an orthonormal basis around `forward`.
pub fn make_normal_vectors(forward: Vec3) -> (Vec3, Vec3) {
    // Rotate the components so `right` cannot start parallel to `forward`.
    let seed = Vec3::new(forward.z, -forward.x, forward.y);
    let right = (seed - forward * seed.dot(forward)).normalize_or_zero();
    let up = right.cross(forward);
    (right, up)
}

/// Rotates `point` about the unit axis `dir` by `degrees`.
pub fn rotate_point_around_vector(dir: Vec3, point: Vec3, degrees: f32) -> Vec3 {
    Quat::from_axis_angle(dir, degrees.to_radians()) * point
}

/// Object-to-world transform. A zero scale component counts as 1.
pub fn model_matrix(origin: Vec3, angles: Vec3, scale: Vec3) -> Mat4 {
    let axis = angles_to_axis(angles);
    let s = Vec3::select(scale.cmpeq(Vec3::ZERO), Vec3::ONE, scale);
    Mat4::from_cols(
        (axis[0] * s.x).extend(0.0),
        (axis[1] * s.y).extend(0.0),
        (axis[2] * s.z).extend(0.0),
        origin.extend(1.0),
    )
}
