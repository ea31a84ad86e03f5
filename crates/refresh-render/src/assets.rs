// SPDX-License-Identifier: CEPL-1.0
//! Interface to the asset layer that decodes images and models.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use refresh_math::Vec3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageType {
    #[default]
    Pic,
    Font,
    Skin,
    Sprite,
    Wall,
    Sky,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ImageFlags: u32 {
        const PERMANENT   = 1 << 0;
        const TRANSPARENT = 1 << 1;
        const PALETTED    = 1 << 2;
        const UPSCALED    = 1 << 3;
        const SCRAP       = 1 << 4;
        const TURBULENT   = 1 << 5;
        const REPEAT      = 1 << 6;
        const NEAREST     = 1 << 7;
        const OPAQUE      = 1 << 8;
        const SPECIAL     = 1 << 9;
    }
}

/// RGBA8 pixels produced by the image decoder.
#[derive(Clone, Debug, Default)]
pub struct DecodedImage {
    /// Canonical name after extension fallback; aliases resolve to it.
    pub name: Option<String>,
    pub ty: ImageType,
    pub flags: ImageFlags,
    pub width: u32,
    pub height: u32,
    pub upload_width: u32,
    pub upload_height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Alias,
    Sprite,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AliasFrame {
    pub bounds: [Vec3; 2],
    pub scale: Vec3,
    pub translate: Vec3,
    pub radius: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpriteFrame {
    pub width: i32,
    pub height: i32,
    pub origin_x: i32,
    pub origin_y: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

#[derive(Clone, Debug)]
pub struct SkinRef {
    pub name: String,
    pub ty: ImageType,
    pub flags: ImageFlags,
}

#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u16>,
    pub skins: Vec<SkinRef>,
}

#[derive(Clone, Debug)]
pub struct DecodedModel {
    pub kind: ModelKind,
    pub alias_frames: Vec<AliasFrame>,
    pub sprite_frames: Vec<SpriteFrame>,
    pub meshes: Vec<MeshData>,
}

impl DecodedModel {
    pub fn frame_count(&self) -> usize {
        match self.kind {
            ModelKind::Alias => self.alias_frames.len(),
            ModelKind::Sprite => self.sprite_frames.len(),
        }
    }
}

/// Decodes assets on behalf of the renderer. `None` means the asset could
/// not be found or decoded.
pub trait AssetLoader {
    fn load_image(&mut self, name: &str, ty: ImageType, flags: ImageFlags) -> Option<DecodedImage>;
    fn load_model(&mut self, name: &str) -> Option<DecodedModel>;
}
