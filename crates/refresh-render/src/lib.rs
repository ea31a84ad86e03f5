// SPDX-License-Identifier: CEPL-1.0
//! Backend-neutral renderer interface: scene description, resource handles,
//! asset-loader seam and the traits a backend implements.

use anyhow::Result;
use bitflags::bitflags;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use refresh_core::RenderConfig;
use refresh_math::Vec3;

pub mod assets;
pub mod handles;
pub mod scene;

pub use assets::{
    AliasFrame, AssetLoader, DecodedImage, DecodedModel, ImageFlags, ImageType, MeshData, MeshVertex,
    ModelKind, SkinRef, SpriteFrame,
};
pub use handles::{ImageHandle, ModelHandle, ModelRef, INLINE_MASK};
pub use scene::{
    Color, DLight, DebugLine, Entity, Fog, HeightFog, LightStyle, Particle, ParticleColor, RdFlags, RefDef,
    RenderFlags,
};

#[derive(Clone, Copy, Debug)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

/// Clip rectangle in virtual (unscaled) 2D coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CharFlags: u32 {
        const ALTCOLOR   = 1 << 0;
        const DROPSHADOW = 1 << 1;
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: RenderConfig,
        loader: Box<dyn AssetLoader>,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn set_config(&mut self, config: RenderConfig);

    fn begin_registration(&mut self, map: &str);
    fn register_model(&mut self, name: &str) -> ModelHandle;
    fn register_image(&mut self, name: &str, ty: ImageType, flags: ImageFlags) -> ImageHandle;
    fn end_registration(&mut self);
    /// Width, height and transparency of a registered image.
    fn image_size(&self, pic: ImageHandle) -> Option<(u32, u32, bool)>;

    /// Starts a frame. `Ok(false)` means the frame was dropped (surface
    /// rebuilt) and nothing should be drawn until the next call.
    fn begin_frame(&mut self) -> Result<bool>;
    fn render_frame(&mut self, fd: &RefDef);
    fn end_frame(&mut self) -> Result<()>;

    fn light_point(&self, origin: Vec3) -> Vec3;
    /// False while the last submitted frame is still on the GPU.
    fn video_sync(&self) -> bool;
}

/// 2D drawing in virtual coordinates, scaled by the current UI scale.
pub trait Draw2D {
    fn set_clip_rect(&mut self, clip: Option<ClipRect>);
    fn set_scale(&mut self, scale: f32);
    fn auto_scale(&self) -> i32;

    fn draw_pic(&mut self, x: i32, y: i32, color: Color, pic: ImageHandle);
    fn draw_stretch_pic(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color, pic: ImageHandle);
    #[allow(clippy::too_many_arguments)]
    fn draw_stretch_rotate_pic(
        &mut self,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        color: Color,
        angle: f32,
        pivot_x: i32,
        pivot_y: i32,
        pic: ImageHandle,
    );
    fn draw_keep_aspect_pic(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color, pic: ImageHandle);
    fn draw_char(&mut self, x: i32, y: i32, flags: CharFlags, ch: u8, color: Color, font: ImageHandle);
    /// Returns the x coordinate after the last drawn glyph.
    #[allow(clippy::too_many_arguments)]
    fn draw_string(
        &mut self,
        x: i32,
        y: i32,
        flags: CharFlags,
        max_chars: usize,
        text: &str,
        color: Color,
        font: ImageHandle,
    ) -> i32;
    fn tile_clear(&mut self, x: i32, y: i32, w: i32, h: i32, pic: ImageHandle);
    fn draw_fill8(&mut self, x: i32, y: i32, w: i32, h: i32, index: u8);
    fn draw_fill32(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color);
    /// Replaces the cinematic frame; an empty picture releases it.
    fn update_raw_pic(&mut self, width: u32, height: u32, pixels: &[u32]);
    fn draw_stretch_raw(&mut self, x: i32, y: i32, w: i32, h: i32);
}
