// SPDX-License-Identifier: CEPL-1.0
//! Procedural stand-ins for the asset layer: a few generated pictures, a
//! glyph atlas and two models, so the demo runs without game data.

use refresh_render::{
    AliasFrame, AssetLoader, DecodedImage, DecodedModel, ImageFlags, ImageType, MeshData, MeshVertex, ModelKind,
    SkinRef, SpriteFrame,
};
use refresh_math::Vec3;
use tracing::debug;

pub const CHECKER: &str = "pics/checker.pcx";
pub const CONCHARS: &str = "pics/conchars.pcx";
pub const BACKTILE: &str = "pics/backtile.pcx";
pub const CUBE_SKIN: &str = "models/cube/skin.pcx";
pub const FLARE_SKIN: &str = "sprites/flare.pcx";
pub const CUBE: &str = "models/cube/tris.md2";
pub const FLARE: &str = "sprites/flare.sp2";

const GLYPH: u32 = 8;

#[derive(Default)]
pub struct ProceduralAssets;

fn image(name: &str, ty: ImageType, mut flags: ImageFlags, width: u32, height: u32, pixels: Vec<u8>) -> DecodedImage {
    if pixels.chunks_exact(4).any(|p| p[3] < 255) {
        flags |= ImageFlags::TRANSPARENT;
    }
    DecodedImage {
        name: Some(name.to_string()),
        ty,
        flags,
        width,
        height,
        upload_width: width,
        upload_height: height,
        pixels,
    }
}

fn checker(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let odd = ((x / cell) + (y / cell)) % 2 == 1;
            pixels.extend_from_slice(if odd { &b } else { &a });
        }
    }
    pixels
}

/// 16x16 cells of 8x8 glyphs. Each printable glyph is a box whose inner
/// pattern comes from the character code, enough to tell strings apart.
fn glyph_atlas() -> Vec<u8> {
    let size = GLYPH * 16;
    let mut pixels = vec![0u8; (size * size * 4) as usize];
    for ch in 33u32..127 {
        let (cx, cy) = ((ch % 16) * GLYPH, (ch / 16) * GLYPH);
        for y in 1..GLYPH - 1 {
            for x in 1..GLYPH - 2 {
                let edge = y == 1 || y == GLYPH - 2 || x == 1 || x == GLYPH - 3;
                let bit = (ch >> ((x + y) % 7)) & 1 == 1;
                if edge || bit {
                    let i = (((cy + y) * size + cx + x) * 4) as usize;
                    pixels[i..i + 4].copy_from_slice(&[255, 255, 255, 255]);
                }
            }
        }
    }
    pixels
}

fn radial(size: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    let half = size as f32 / 2.0;
    for y in 0..size {
        for x in 0..size {
            let d = ((x as f32 + 0.5 - half).hypot(y as f32 + 0.5 - half) / half).min(1.0);
            let a = ((1.0 - d) * 255.0) as u8;
            pixels.extend_from_slice(&[255, 220, 160, a]);
        }
    }
    pixels
}

fn cube_mesh() -> MeshData {
    let faces = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::NEG_Y, Vec3::Z),
        (Vec3::Y, Vec3::NEG_X, Vec3::Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::X, Vec3::NEG_Y),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u16;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let p = (normal + u * su + v * sv) * 16.0;
            vertices.push(MeshVertex {
                position: p.to_array(),
                normal: normal.to_array(),
                uv: [(su + 1.0) / 2.0, (1.0 - sv) / 2.0],
            });
        }
        indices.extend([0, 1, 2, 0, 2, 3].map(|i| base + i));
    }
    MeshData {
        vertices,
        indices,
        skins: vec![SkinRef { name: CUBE_SKIN.into(), ty: ImageType::Skin, flags: ImageFlags::empty() }],
    }
}

fn flare_mesh() -> MeshData {
    let corners = [(-1.0f32, -1.0f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    let vertices = corners
        .iter()
        .map(|&(x, y)| MeshVertex {
            position: [0.0, x * 8.0, y * 8.0],
            normal: [1.0, 0.0, 0.0],
            uv: [(x + 1.0) / 2.0, (1.0 - y) / 2.0],
        })
        .collect();
    MeshData {
        vertices,
        indices: vec![0, 1, 2, 0, 2, 3],
        skins: vec![SkinRef { name: FLARE_SKIN.into(), ty: ImageType::Sprite, flags: ImageFlags::empty() }],
    }
}

impl AssetLoader for ProceduralAssets {
    fn load_image(&mut self, name: &str, ty: ImageType, flags: ImageFlags) -> Option<DecodedImage> {
        debug!("generating image {name}");
        let decoded = match name {
            CHECKER => image(name, ty, flags, 64, 64, checker(64, 8, [200, 200, 200, 255], [60, 60, 70, 255])),
            BACKTILE => image(name, ty, flags | ImageFlags::REPEAT, 64, 64, checker(64, 4, [40, 40, 48, 255], [30, 30, 36, 255])),
            CUBE_SKIN => image(name, ty, flags, 32, 32, checker(32, 8, [180, 90, 40, 255], [90, 40, 20, 255])),
            CONCHARS => image(name, ty, flags | ImageFlags::NEAREST, GLYPH * 16, GLYPH * 16, glyph_atlas()),
            FLARE_SKIN => image(name, ty, flags, 32, 32, radial(32)),
            _ => return None,
        };
        Some(decoded)
    }

    fn load_model(&mut self, name: &str) -> Option<DecodedModel> {
        debug!("generating model {name}");
        match name {
            CUBE => {
                let bounds = [Vec3::splat(-16.0), Vec3::splat(16.0)];
                let frame = AliasFrame { bounds, scale: Vec3::ONE, translate: Vec3::ZERO, radius: 27.7 };
                Some(DecodedModel {
                    kind: ModelKind::Alias,
                    alias_frames: vec![frame],
                    sprite_frames: Vec::new(),
                    meshes: vec![cube_mesh()],
                })
            }
            FLARE => Some(DecodedModel {
                kind: ModelKind::Sprite,
                alias_frames: Vec::new(),
                sprite_frames: vec![SpriteFrame { width: 16, height: 16, origin_x: 8, origin_y: 8 }],
                meshes: vec![flare_mesh()],
            }),
            _ => None,
        }
    }
}
