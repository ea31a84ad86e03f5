// SPDX-License-Identifier: CEPL-1.0
//! The seam between frame logic and the Vulkan device.
//!
//! Everything above this trait (swapchain policy, frame slots, resource
//! lifetimes, queue building, batching) is plain Rust driven through it; the
//! `ash` implementation lives in [`crate::vulkan`]. Handles are raw `vk`
//! handles so the logic can hand them around without wrapping.

use ash::vk;

use crate::error::VkResult;
use crate::pipeline::PipelineDesc;

#[derive(Clone, Debug, Default)]
pub struct SurfaceInfo {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepthTarget {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// Everything that depends on the surface and is rebuilt with it.
#[derive(Clone, Debug, Default)]
pub struct SwapchainTargets {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    /// Clears colour and depth; the per-frame main pass.
    pub render_pass: vk::RenderPass,
    /// Loads existing colour; resumes drawing after a post-process blit.
    pub load_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub depth: DepthTarget,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotSync {
    pub cmd: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Present {
    Presented,
    /// Out of date or suboptimal; the surface needs a rebuild.
    Stale,
}

#[derive(Clone, Copy, Debug)]
pub struct PassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8.
    pub pixels: &'a [u8],
    pub repeat: bool,
    pub nearest: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuTexture {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub set: vk::DescriptorSet,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuMesh {
    pub vertex_buffer: vk::Buffer,
    pub vertex_memory: vk::DeviceMemory,
    pub index_buffer: vk::Buffer,
    pub index_memory: vk::DeviceMemory,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Storage-buffer view of the vertices.
    pub set: vk::DescriptorSet,
}

/// A colour target the scene can render into and blit from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffscreenTarget {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Transient geometry drawn from the slot's stream arena. An empty index
/// list draws `vertex_count` vertices unindexed.
#[derive(Clone, Copy, Debug)]
pub struct StreamDraw<'a> {
    pub vertices: &'a [u8],
    pub vertex_count: u32,
    pub indices: &'a [u16],
}

pub trait Gpu {
    fn surface_info(&self) -> VkResult<SurfaceInfo>;
    /// Graphics and present queue families differ.
    fn concurrent_sharing(&self) -> bool;
    fn create_swapchain(&mut self, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> VkResult<SwapchainTargets>;
    fn destroy_swapchain(&mut self, targets: SwapchainTargets);
    fn wait_idle(&mut self);

    fn create_frame_slot(&mut self) -> VkResult<SlotSync>;
    fn destroy_frame_slot(&mut self, slot: SlotSync);
    fn wait_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> VkResult<Acquire>;
    fn begin_commands(&mut self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_commands(&mut self, cmd: vk::CommandBuffer) -> VkResult<()>;
    /// Waits on `image_available` at colour output, signals `render_finished` and the fence.
    fn submit(&mut self, slot: &SlotSync) -> VkResult<()>;
    fn present(&mut self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<Present>;

    fn begin_render_pass(&mut self, cmd: vk::CommandBuffer, pass: &PassBegin);
    fn end_render_pass(&mut self, cmd: vk::CommandBuffer);
    fn set_viewport(&mut self, cmd: vk::CommandBuffer, rect: vk::Rect2D);
    fn set_scissor(&mut self, cmd: vk::CommandBuffer, rect: vk::Rect2D);
    fn bind_pipeline(&mut self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn push_constants(&mut self, cmd: vk::CommandBuffer, bytes: &[u8]);
    fn bind_texture(&mut self, cmd: vk::CommandBuffer, set: vk::DescriptorSet);
    fn draw_mesh(&mut self, cmd: vk::CommandBuffer, mesh: &GpuMesh);
    /// Recycles the stream arena of `slot`; only valid once its fence signalled.
    fn reset_streams(&mut self, slot: usize);
    fn draw_stream(&mut self, cmd: vk::CommandBuffer, slot: usize, draw: StreamDraw<'_>) -> VkResult<()>;
    /// Copies `src` into the swapchain image with a linear filter.
    fn blit_to_swapchain(&mut self, cmd: vk::CommandBuffer, src: &OffscreenTarget, dst: vk::Image, extent: vk::Extent2D);
    /// Linear-filtered copy between offscreen targets. Both are left in
    /// colour-attachment layout.
    fn downsample(&mut self, cmd: vk::CommandBuffer, src: &OffscreenTarget, dst: &OffscreenTarget);

    fn upload_texture(&mut self, desc: &TextureDesc<'_>) -> VkResult<GpuTexture>;
    fn destroy_texture(&mut self, texture: GpuTexture);
    fn upload_mesh(&mut self, vertices: &[u8], vertex_count: u32, indices: &[u16]) -> VkResult<GpuMesh>;
    fn destroy_mesh(&mut self, mesh: GpuMesh);

    fn create_offscreen_target(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        depth: Option<&DepthTarget>,
    ) -> VkResult<OffscreenTarget>;
    fn destroy_offscreen_target(&mut self, target: OffscreenTarget);

    fn create_pipeline(
        &mut self,
        desc: &PipelineDesc,
        vert: &[u32],
        frag: &[u32],
        render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline);
}
