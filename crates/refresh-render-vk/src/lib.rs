// SPDX-License-Identifier: CEPL-1.0
//! Vulkan frame renderer.
//!
//! [`VkRenderer`] is the application-facing type. The frame logic lives in
//! [`renderer::RendererCore`], generic over the [`gpu::Gpu`] seam so it can be
//! exercised without a device; [`vulkan::AshGpu`] is the `ash` device.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use refresh_core::RenderConfig;
use refresh_math::Vec3;
use refresh_render::{
    AssetLoader, CharFlags, ClipRect, Color, Draw2D, ImageFlags, ImageHandle, ImageType, ModelHandle, RefDef,
    RenderSize, Renderer,
};
use tracing::info;

pub mod draw2d;
pub mod effects;
mod error;
pub mod frame;
pub mod frame_state;
pub mod gpu;
pub mod palette;
pub mod pipeline;
pub mod postprocess;
pub mod queues;
pub mod renderer;
pub mod resources;
pub mod swapchain;
pub mod vulkan;

#[cfg(test)]
mod testing;

pub use error::{VkError, VkResult};
pub use frame_state::FrameStats;
pub use palette::Palette;

use crate::pipeline::ShaderDir;
use crate::renderer::RendererCore;
use crate::resources::ResourceStore;
use crate::vulkan::AshGpu;

pub struct VkRenderer {
    core: RendererCore<AshGpu>,
}

impl VkRenderer {
    pub fn stats(&self) -> FrameStats {
        self.core.stats()
    }

    /// Stage labels recorded during the last frame.
    pub fn command_log(&self) -> &[String] {
        self.core.command_log()
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.core.set_palette(palette);
    }

    /// Destroys every GPU object now instead of at drop.
    pub fn shutdown(&mut self) {
        self.core.shutdown();
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: RenderConfig,
        loader: Box<dyn AssetLoader>,
    ) -> Result<Self> {
        let gpu = AshGpu::new(window, display).context("create Vulkan device")?;
        let extent = vk::Extent2D { width: size.width, height: size.height };
        let shaders = Box::new(ShaderDir::new(config.shader_dir.clone()));
        let core = RendererCore::new(gpu, extent, config, ResourceStore::new(loader), shaders)
            .context("create swapchain")?;
        info!("Vulkan renderer ready ({}x{})", size.width, size.height);
        Ok(VkRenderer { core })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.core.resize(size.width, size.height).context("rebuild swapchain")?;
        Ok(())
    }

    fn set_config(&mut self, config: RenderConfig) {
        self.core.set_config(config);
    }

    fn begin_registration(&mut self, map: &str) {
        self.core.begin_registration(map);
    }

    fn register_model(&mut self, name: &str) -> ModelHandle {
        self.core.register_model(name)
    }

    fn register_image(&mut self, name: &str, ty: ImageType, flags: ImageFlags) -> ImageHandle {
        self.core.register_image(name, ty, flags)
    }

    fn end_registration(&mut self) {
        self.core.end_registration();
    }

    fn image_size(&self, pic: ImageHandle) -> Option<(u32, u32, bool)> {
        self.core.image_size(pic)
    }

    fn begin_frame(&mut self) -> Result<bool> {
        Ok(self.core.begin_frame().context("begin_frame")?)
    }

    fn render_frame(&mut self, fd: &RefDef) {
        self.core.render_frame(fd);
    }

    fn end_frame(&mut self) -> Result<()> {
        self.core.end_frame().context("end_frame")?;
        Ok(())
    }

    fn light_point(&self, origin: Vec3) -> Vec3 {
        self.core.light_point(origin)
    }

    fn video_sync(&self) -> bool {
        self.core.video_sync()
    }
}

impl Draw2D for VkRenderer {
    fn set_clip_rect(&mut self, clip: Option<ClipRect>) {
        self.core.set_clip_rect(clip);
    }

    fn set_scale(&mut self, scale: f32) {
        self.core.set_scale(scale);
    }

    fn auto_scale(&self) -> i32 {
        self.core.auto_scale()
    }

    fn draw_pic(&mut self, x: i32, y: i32, color: Color, pic: ImageHandle) {
        self.core.draw_pic(x, y, color, pic);
    }

    fn draw_stretch_pic(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color, pic: ImageHandle) {
        self.core.draw_stretch_pic(x, y, w, h, color, pic);
    }

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
    ) {
        self.core.draw_stretch_rotate_pic(x, y, w, h, color, angle, pivot_x, pivot_y, pic);
    }

    fn draw_keep_aspect_pic(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color, pic: ImageHandle) {
        self.core.draw_keep_aspect_pic(x, y, w, h, color, pic);
    }

    fn draw_char(&mut self, x: i32, y: i32, flags: CharFlags, ch: u8, color: Color, font: ImageHandle) {
        self.core.draw_char(x, y, flags, ch, color, font);
    }

    fn draw_string(
        &mut self,
        x: i32,
        y: i32,
        flags: CharFlags,
        max_chars: usize,
        text: &str,
        color: Color,
        font: ImageHandle,
    ) -> i32 {
        self.core.draw_string(x, y, flags, max_chars, text, color, font)
    }

    fn tile_clear(&mut self, x: i32, y: i32, w: i32, h: i32, pic: ImageHandle) {
        self.core.tile_clear(x, y, w, h, pic);
    }

    fn draw_fill8(&mut self, x: i32, y: i32, w: i32, h: i32, index: u8) {
        self.core.draw_fill8(x, y, w, h, index);
    }

    fn draw_fill32(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color) {
        self.core.draw_fill32(x, y, w, h, color);
    }

    fn update_raw_pic(&mut self, width: u32, height: u32, pixels: &[u32]) {
        self.core.update_raw_pic(width, height, pixels);
    }

    fn draw_stretch_raw(&mut self, x: i32, y: i32, w: i32, h: i32) {
        self.core.draw_stretch_raw(x, y, w, h);
    }
}
