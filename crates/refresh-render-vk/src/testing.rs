// SPDX-License-Identifier: CEPL-1.0
//! Recording stand-in for the device, used by unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use ash::vk::{self, Handle};
use refresh_render::{AssetLoader, DecodedImage, DecodedModel, ImageFlags, ImageType};

use crate::error::{VkError, VkResult};
use crate::gpu::*;
use crate::pipeline::PipelineDesc;

pub struct MockGpu {
    next_handle: u64,
    /// Raw values of every handle created and not yet destroyed.
    pub live: HashSet<u64>,
    pub calls: Vec<String>,
    fences: HashMap<u64, bool>,

    pub surface: SurfaceInfo,
    pub concurrent: bool,
    pub acquire_script: VecDeque<Acquire>,
    pub present_script: VecDeque<Present>,
    next_image: u32,

    pub fail_swapchain: bool,
    pub fail_textures: bool,
    pub fail_meshes: bool,
    pub fail_pipelines: bool,
    pub fail_offscreen: bool,
    pub fail_begin_commands: bool,
    pub fail_submit: bool,

    pub swapchains_created: usize,
    pub last_swapchain: Option<SwapchainDesc>,
    pub textures_uploaded: Vec<(String, u32, u32)>,
    pub meshes_uploaded: usize,
    pub pipelines_created: usize,
    pub pipelines_destroyed: usize,
    pub pipeline_names: Vec<String>,
    /// Fences that were still unsignalled when waited on.
    pub blocking_waits: usize,
    pub stream_draws: Vec<(usize, u32, usize)>,
    pub bound_textures: Vec<vk::DescriptorSet>,
    pub pushes: Vec<Vec<u8>>,
    pub scissors: Vec<vk::Rect2D>,
}

impl MockGpu {
    pub fn new() -> Self {
        MockGpu {
            next_handle: 0x1000,
            live: HashSet::new(),
            calls: Vec::new(),
            fences: HashMap::new(),
            surface: SurfaceInfo {
                caps: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 3,
                    current_extent: vk::Extent2D { width: 800, height: 600 },
                    min_image_extent: vk::Extent2D { width: 1, height: 1 },
                    max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                    ..Default::default()
                },
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            },
            concurrent: false,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            next_image: 0,
            fail_swapchain: false,
            fail_textures: false,
            fail_meshes: false,
            fail_pipelines: false,
            fail_offscreen: false,
            fail_begin_commands: false,
            fail_submit: false,
            swapchains_created: 0,
            last_swapchain: None,
            textures_uploaded: Vec::new(),
            meshes_uploaded: 0,
            pipelines_created: 0,
            pipelines_destroyed: 0,
            pipeline_names: Vec::new(),
            blocking_waits: 0,
            stream_draws: Vec::new(),
            bound_textures: Vec::new(),
            pushes: Vec::new(),
            scissors: Vec::new(),
        }
    }

    fn make<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        H::from_raw(self.next_handle)
    }

    fn release<H: Handle>(&mut self, handle: H) {
        let raw = handle.as_raw();
        assert!(raw == 0 || self.live.remove(&raw), "destroyed unknown or dead handle {raw:#x}");
    }

    pub fn fake_render_pass(&mut self) -> vk::RenderPass {
        self.make()
    }

    pub fn is_live<H: Handle>(&self, handle: H) -> bool {
        self.live.contains(&handle.as_raw())
    }

    /// Lets the "GPU" finish everything submitted so far.
    pub fn complete_all(&mut self) {
        for signaled in self.fences.values_mut() {
            *signaled = true;
        }
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls.iter().position(|c| c.starts_with(prefix))
    }
}

impl Gpu for MockGpu {
    fn surface_info(&self) -> VkResult<SurfaceInfo> {
        Ok(self.surface.clone())
    }

    fn concurrent_sharing(&self) -> bool {
        self.concurrent
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc, _old: vk::SwapchainKHR) -> VkResult<SwapchainTargets> {
        self.calls.push("create_swapchain".into());
        if self.fail_swapchain {
            return Err(VkError::Swapchain("mock failure".into()));
        }
        self.swapchains_created += 1;
        self.last_swapchain = Some(*desc);
        let count = desc.image_count as usize;
        let images: Vec<vk::Image> = (0..count).map(|_| self.make()).collect();
        let views: Vec<vk::ImageView> = (0..count).map(|_| self.make()).collect();
        let framebuffers: Vec<vk::Framebuffer> = (0..count).map(|_| self.make()).collect();
        Ok(SwapchainTargets {
            swapchain: self.make(),
            images,
            views,
            render_pass: self.make(),
            load_pass: self.make(),
            framebuffers,
            depth: DepthTarget {
                image: self.make(),
                memory: self.make(),
                view: self.make(),
                format: vk::Format::D32_SFLOAT,
            },
            format: desc.format.format,
            extent: desc.extent,
            present_mode: desc.present_mode,
        })
    }

    fn destroy_swapchain(&mut self, targets: SwapchainTargets) {
        self.calls.push("destroy_swapchain".into());
        for fb in targets.framebuffers {
            self.release(fb);
        }
        for view in targets.views {
            self.release(view);
        }
        for image in targets.images {
            self.release(image);
        }
        self.release(targets.render_pass);
        self.release(targets.load_pass);
        self.release(targets.depth.view);
        self.release(targets.depth.image);
        self.release(targets.depth.memory);
        self.release(targets.swapchain);
    }

    fn wait_idle(&mut self) {
        self.calls.push("wait_idle".into());
        self.complete_all();
    }

    fn create_frame_slot(&mut self) -> VkResult<SlotSync> {
        let slot = SlotSync {
            cmd: self.make(),
            image_available: self.make(),
            render_finished: self.make(),
            in_flight: self.make(),
        };
        self.fences.insert(slot.in_flight.as_raw(), true);
        Ok(slot)
    }

    fn destroy_frame_slot(&mut self, slot: SlotSync) {
        self.fences.remove(&slot.in_flight.as_raw());
        self.release(slot.cmd);
        self.release(slot.image_available);
        self.release(slot.render_finished);
        self.release(slot.in_flight);
    }

    fn wait_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        self.calls.push(format!("wait_fence:{:#x}", fence.as_raw()));
        let signaled = self.fences.entry(fence.as_raw()).or_insert(true);
        if !*signaled {
            self.blocking_waits += 1;
            *signaled = true;
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        self.calls.push(format!("reset_fence:{:#x}", fence.as_raw()));
        self.fences.insert(fence.as_raw(), false);
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.fences.get(&fence.as_raw()).copied().unwrap_or(true))
    }

    fn acquire_next_image(&mut self, _swapchain: vk::SwapchainKHR, _signal: vk::Semaphore) -> VkResult<Acquire> {
        self.calls.push("acquire".into());
        if let Some(scripted) = self.acquire_script.pop_front() {
            return Ok(scripted);
        }
        let count = self.last_swapchain.map(|d| d.image_count).unwrap_or(1).max(1);
        let index = self.next_image % count;
        self.next_image += 1;
        Ok(Acquire::Image { index, suboptimal: false })
    }

    fn begin_commands(&mut self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.calls.push(format!("begin_commands:{:#x}", cmd.as_raw()));
        if self.fail_begin_commands {
            return Err(VkError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        }
        Ok(())
    }

    fn end_commands(&mut self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.calls.push("end_commands".into());
        Ok(())
    }

    fn submit(&mut self, slot: &SlotSync) -> VkResult<()> {
        self.calls.push(format!("submit:{:#x}", slot.in_flight.as_raw()));
        if self.fail_submit {
            return Err(VkError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        self.fences.insert(slot.in_flight.as_raw(), false);
        Ok(())
    }

    fn present(&mut self, _swapchain: vk::SwapchainKHR, image_index: u32, _wait: vk::Semaphore) -> VkResult<Present> {
        self.calls.push(format!("present:{image_index}"));
        Ok(self.present_script.pop_front().unwrap_or(Present::Presented))
    }

    fn begin_render_pass(&mut self, _cmd: vk::CommandBuffer, pass: &PassBegin) {
        self.calls.push(format!(
            "begin_pass:{:#x}:{}x{}",
            pass.render_pass.as_raw(),
            pass.extent.width,
            pass.extent.height
        ));
    }

    fn end_render_pass(&mut self, _cmd: vk::CommandBuffer) {
        self.calls.push("end_pass".into());
    }

    fn set_viewport(&mut self, _cmd: vk::CommandBuffer, _rect: vk::Rect2D) {
        self.calls.push("viewport".into());
    }

    fn set_scissor(&mut self, _cmd: vk::CommandBuffer, rect: vk::Rect2D) {
        self.calls.push("scissor".into());
        self.scissors.push(rect);
    }

    fn bind_pipeline(&mut self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.calls.push(format!("bind_pipeline:{:#x}", pipeline.as_raw()));
    }

    fn push_constants(&mut self, _cmd: vk::CommandBuffer, bytes: &[u8]) {
        self.pushes.push(bytes.to_vec());
    }

    fn bind_texture(&mut self, _cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        self.bound_textures.push(set);
    }

    fn draw_mesh(&mut self, _cmd: vk::CommandBuffer, mesh: &GpuMesh) {
        self.calls.push(format!("draw_mesh:{}", mesh.index_count));
    }

    fn reset_streams(&mut self, slot: usize) {
        self.calls.push(format!("reset_streams:{slot}"));
    }

    fn draw_stream(&mut self, _cmd: vk::CommandBuffer, slot: usize, draw: StreamDraw<'_>) -> VkResult<()> {
        self.calls.push(format!("draw_stream:{}/{}", draw.vertex_count, draw.indices.len()));
        self.stream_draws.push((slot, draw.vertex_count, draw.indices.len()));
        Ok(())
    }

    fn blit_to_swapchain(&mut self, _cmd: vk::CommandBuffer, src: &OffscreenTarget, _dst: vk::Image, extent: vk::Extent2D) {
        self.calls.push(format!(
            "blit:{}x{}->{}x{}",
            src.extent.width, src.extent.height, extent.width, extent.height
        ));
    }

    fn downsample(&mut self, _cmd: vk::CommandBuffer, src: &OffscreenTarget, dst: &OffscreenTarget) {
        self.calls.push(format!(
            "downsample:{}x{}->{}x{}",
            src.extent.width, src.extent.height, dst.extent.width, dst.extent.height
        ));
    }

    fn upload_texture(&mut self, desc: &TextureDesc<'_>) -> VkResult<GpuTexture> {
        if self.fail_textures {
            return Err(VkError::Upload(format!("mock refused {}", desc.name)));
        }
        self.textures_uploaded.push((desc.name.to_string(), desc.width, desc.height));
        Ok(GpuTexture {
            image: self.make(),
            memory: self.make(),
            view: self.make(),
            sampler: self.make(),
            set: self.make(),
        })
    }

    fn destroy_texture(&mut self, texture: GpuTexture) {
        self.release(texture.set);
        self.release(texture.sampler);
        self.release(texture.view);
        self.release(texture.image);
        self.release(texture.memory);
    }

    fn upload_mesh(&mut self, _vertices: &[u8], vertex_count: u32, indices: &[u16]) -> VkResult<GpuMesh> {
        if self.fail_meshes {
            return Err(VkError::Upload("mock refused mesh".into()));
        }
        self.meshes_uploaded += 1;
        Ok(GpuMesh {
            vertex_buffer: self.make(),
            vertex_memory: self.make(),
            index_buffer: self.make(),
            index_memory: self.make(),
            vertex_count,
            index_count: indices.len() as u32,
            set: self.make(),
        })
    }

    fn destroy_mesh(&mut self, mesh: GpuMesh) {
        self.release(mesh.set);
        self.release(mesh.vertex_buffer);
        self.release(mesh.vertex_memory);
        self.release(mesh.index_buffer);
        self.release(mesh.index_memory);
    }

    fn create_offscreen_target(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        _depth: Option<&DepthTarget>,
    ) -> VkResult<OffscreenTarget> {
        self.calls.push(format!("create_offscreen:{}x{}", extent.width, extent.height));
        if self.fail_offscreen {
            return Err(VkError::Upload("mock refused offscreen target".into()));
        }
        Ok(OffscreenTarget {
            image: self.make(),
            memory: self.make(),
            view: self.make(),
            render_pass: self.make(),
            framebuffer: self.make(),
            extent,
            format,
        })
    }

    fn destroy_offscreen_target(&mut self, target: OffscreenTarget) {
        self.calls.push("destroy_offscreen".into());
        self.release(target.framebuffer);
        self.release(target.render_pass);
        self.release(target.view);
        self.release(target.image);
        self.release(target.memory);
    }

    fn create_pipeline(
        &mut self,
        desc: &PipelineDesc,
        _vert: &[u32],
        _frag: &[u32],
        _render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline> {
        if self.fail_pipelines {
            return Err(VkError::Pipeline(format!("mock refused {}", desc.name)));
        }
        self.pipelines_created += 1;
        self.pipeline_names.push(desc.name.clone());
        Ok(self.make())
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.pipelines_destroyed += 1;
        self.release(pipeline);
    }
}

#[derive(Default)]
struct LoaderState {
    images: HashMap<String, DecodedImage>,
    models: HashMap<String, DecodedModel>,
    image_loads: usize,
    model_loads: usize,
}

/// Asset loader over in-memory tables. Clones share state, so a test can
/// keep one to add assets and count decodes after boxing another.
#[derive(Clone, Default)]
pub struct MemoryLoader(Rc<RefCell<LoaderState>>);

impl MemoryLoader {
    pub fn insert_image(&self, name: &str, image: DecodedImage) {
        self.0.borrow_mut().images.insert(name.to_owned(), image);
    }

    pub fn add_image(&self, name: &str, width: u32, height: u32, flags: ImageFlags) {
        self.insert_image(
            name,
            DecodedImage {
                name: None,
                ty: ImageType::Pic,
                flags,
                width,
                height,
                upload_width: width,
                upload_height: height,
                pixels: vec![255; (width * height * 4) as usize],
            },
        );
    }

    /// `requested` decodes to an image whose canonical name is `canonical`.
    pub fn add_alias(&self, requested: &str, canonical: &str, width: u32, height: u32) {
        self.add_image(requested, width, height, ImageFlags::empty());
        if let Some(image) = self.0.borrow_mut().images.get_mut(requested) {
            image.name = Some(canonical.to_owned());
        }
    }

    pub fn add_model(&self, name: &str, model: DecodedModel) {
        self.0.borrow_mut().models.insert(name.to_owned(), model);
    }

    pub fn image_loads(&self) -> usize {
        self.0.borrow().image_loads
    }

    pub fn model_loads(&self) -> usize {
        self.0.borrow().model_loads
    }
}

impl AssetLoader for MemoryLoader {
    fn load_image(&mut self, name: &str, ty: ImageType, _flags: ImageFlags) -> Option<DecodedImage> {
        let mut state = self.0.borrow_mut();
        state.image_loads += 1;
        let mut image = state.images.get(name).cloned()?;
        image.ty = ty;
        Some(image)
    }

    fn load_model(&mut self, name: &str) -> Option<DecodedModel> {
        let mut state = self.0.borrow_mut();
        state.model_loads += 1;
        state.models.get(name).cloned()
    }
}
