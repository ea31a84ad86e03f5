// SPDX-License-Identifier: CEPL-1.0
//! The `ash` device behind [`Gpu`].
//!
//! STRICT ORDER at creation: instance, surface, physical device (checked
//! against the surface), logical device, pools and layouts. Teardown runs in
//! reverse after a device-idle wait. Objects handed out through the trait are
//! destroyed through the trait before this type drops.

use std::ffi::{c_void, CStr};

use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use refresh_render::MeshVertex;
use tracing::{debug, error, info, warn};

use crate::draw2d::Vertex2D;
use crate::effects::{EffectVertex, LineVertex};
use crate::error::{VkError, VkResult};
use crate::gpu::*;
use crate::pipeline::{BlendMode, PipelineDesc, Topology, VertexLayout};

const PUSH_CONSTANT_SIZE: u32 = 128;
const STREAM_CHUNK_SIZE: vk::DeviceSize = 4 * 1024 * 1024;
const STREAM_ALIGN: vk::DeviceSize = 16;
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

/// First graphics family, and a present family that matches it when
/// possible.
pub fn choose_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let graphics = families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;
    let present = if supports_present(graphics) {
        graphics
    } else {
        (0..families.len() as u32).find(|&i| supports_present(i))?
    };
    Some(QueueFamilies { graphics, present })
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> VkResult<u32> {
    (0..props.memory_type_count)
        .find(|&i| (type_bits & (1 << i)) != 0 && props.memory_types[i as usize].property_flags.contains(flags))
        .ok_or(VkError::NoMemoryType { type_bits, flags })
}

fn align_up(value: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    value.div_ceil(align) * align
}

/// Binding and attributes for one of the vertex formats.
pub fn vertex_input(
    layout: VertexLayout,
) -> (vk::VertexInputBindingDescription, Vec<vk::VertexInputAttributeDescription>) {
    use std::mem::{offset_of, size_of};
    let attr = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };
    let (stride, attrs) = match layout {
        VertexLayout::Mesh => (
            size_of::<MeshVertex>(),
            vec![
                attr(0, vk::Format::R32G32B32_SFLOAT, offset_of!(MeshVertex, position)),
                attr(1, vk::Format::R32G32B32_SFLOAT, offset_of!(MeshVertex, normal)),
                attr(2, vk::Format::R32G32_SFLOAT, offset_of!(MeshVertex, uv)),
            ],
        ),
        VertexLayout::Quad2D => (
            size_of::<Vertex2D>(),
            vec![
                attr(0, vk::Format::R32G32_SFLOAT, offset_of!(Vertex2D, position)),
                attr(1, vk::Format::R32G32_SFLOAT, offset_of!(Vertex2D, uv)),
                attr(2, vk::Format::R8G8B8A8_UNORM, offset_of!(Vertex2D, color)),
            ],
        ),
        VertexLayout::Effect => (
            size_of::<EffectVertex>(),
            vec![
                attr(0, vk::Format::R32G32B32_SFLOAT, offset_of!(EffectVertex, position)),
                attr(1, vk::Format::R32G32_SFLOAT, offset_of!(EffectVertex, uv)),
                attr(2, vk::Format::R8G8B8A8_UNORM, offset_of!(EffectVertex, color)),
            ],
        ),
        VertexLayout::Line => (
            size_of::<LineVertex>(),
            vec![
                attr(0, vk::Format::R32G32B32_SFLOAT, offset_of!(LineVertex, position)),
                attr(1, vk::Format::R8G8B8A8_UNORM, offset_of!(LineVertex, color)),
            ],
        ),
    };
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: stride as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    (binding, attrs)
}

pub fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let write_all = vk::ColorComponentFlags::R
        | vk::ColorComponentFlags::G
        | vk::ColorComponentFlags::B
        | vk::ColorComponentFlags::A;
    let dst = match mode {
        BlendMode::None => {
            return vk::PipelineColorBlendAttachmentState {
                color_write_mask: write_all,
                blend_enable: vk::FALSE,
                ..Default::default()
            }
        }
        BlendMode::Alpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendMode::Additive => vk::BlendFactor::ONE,
    };
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: dst,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: dst,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: write_all,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassKind {
    /// Clears; leaves the swapchain image ready to present.
    Clear,
    /// Keeps the presented contents; used after a blit.
    Load,
    /// Clears; leaves the image as a colour attachment for the blit.
    Offscreen,
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn image_barrier<'a>(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'a> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask,
        dst_access_mask,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: color_range(),
        ..Default::default()
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> VkResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader.create_debug_utils_messenger(&ci, None)?;
    Ok((loader, messenger))
}

unsafe fn has_layer(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == name)
}

unsafe fn has_instance_extension(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == name)
}

unsafe fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    validation: bool,
    debug_ext: bool,
) -> VkResult<Instance> {
    let app = c"refresh";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_2,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display)?.to_vec();
    if debug_ext {
        extensions.push(debug_utils::NAME.as_ptr());
    }
    let layers = [VALIDATION_LAYER.as_ptr()];
    let layer_count = if validation { layers.len() as u32 } else { 0 };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layer_count,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    Ok(entry.create_instance(&create_info, None)?)
}

unsafe fn pick_device(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> VkResult<(vk::PhysicalDevice, QueueFamilies)> {
    for phys in instance.enumerate_physical_devices()? {
        let has_swapchain = instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default()
            .iter()
            .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
        if !has_swapchain {
            continue;
        }
        let families = instance.get_physical_device_queue_family_properties(phys);
        let present = |i: u32| surf_i.get_physical_device_surface_support(phys, i, surface).unwrap_or(false);
        if let Some(found) = choose_queue_families(&families, present) {
            return Ok((phys, found));
        }
    }
    Err(VkError::NoSuitableDevice)
}

unsafe fn create_device(instance: &Instance, phys: vk::PhysicalDevice, families: QueueFamilies) -> VkResult<ash::Device> {
    let priorities = [1.0_f32];
    let mut unique = vec![families.graphics];
    if families.present != families.graphics {
        unique.push(families.present);
    }
    let queue_infos: Vec<_> = unique
        .iter()
        .map(|&family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();
    let extensions = [swapchain::NAME.as_ptr()];
    let features = vk::PhysicalDeviceFeatures::default();
    let ci = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };
    Ok(instance.create_device(phys, &ci, None)?)
}

unsafe fn pick_depth_format(instance: &Instance, phys: vk::PhysicalDevice) -> vk::Format {
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D16_UNORM,
    ];
    for &fmt in &candidates {
        let props = instance.get_physical_device_format_properties(phys, fmt);
        if props.optimal_tiling_features.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT) {
            return fmt;
        }
    }
    vk::Format::D32_SFLOAT
}

unsafe fn create_descriptor_pool(device: &ash::Device) -> VkResult<vk::DescriptorPool> {
    let sizes = [
        vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 128 },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count: 256 },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 64 },
    ];
    let ci = vk::DescriptorPoolCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
        flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        max_sets: 512,
        pool_size_count: sizes.len() as u32,
        p_pool_sizes: sizes.as_ptr(),
        ..Default::default()
    };
    Ok(device.create_descriptor_pool(&ci, None)?)
}

unsafe fn create_set_layout(
    device: &ash::Device,
    ty: vk::DescriptorType,
    stage: vk::ShaderStageFlags,
) -> VkResult<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: ty,
        descriptor_count: 1,
        stage_flags: stage,
        ..Default::default()
    };
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: 1,
        p_bindings: &binding,
        ..Default::default()
    };
    Ok(device.create_descriptor_set_layout(&ci, None)?)
}

/// Set 0 is the texture, set 1 the mesh storage buffer, plus one push range.
unsafe fn create_pipeline_layout(
    device: &ash::Device,
    sets: &[vk::DescriptorSetLayout],
) -> VkResult<vk::PipelineLayout> {
    let range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: PUSH_CONSTANT_SIZE,
    };
    let ci = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: sets.len() as u32,
        p_set_layouts: sets.as_ptr(),
        push_constant_range_count: 1,
        p_push_constant_ranges: &range,
        ..Default::default()
    };
    Ok(device.create_pipeline_layout(&ci, None)?)
}

unsafe fn create_render_pass(
    device: &ash::Device,
    color: vk::Format,
    depth: Option<vk::Format>,
    kind: PassKind,
) -> VkResult<vk::RenderPass> {
    let (load_op, initial, final_layout) = match kind {
        PassKind::Clear => (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR),
        PassKind::Load => (
            vk::AttachmentLoadOp::LOAD,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ),
        PassKind::Offscreen => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ),
    };
    let mut attachments = vec![vk::AttachmentDescription {
        format: color,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: initial,
        final_layout,
        ..Default::default()
    }];
    if let Some(format) = depth {
        attachments.push(vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: if kind == PassKind::Load { vk::AttachmentLoadOp::DONT_CARE } else { vk::AttachmentLoadOp::CLEAR },
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    }
    let color_ref = vk::AttachmentReference { attachment: 0, layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL };
    let depth_ref = vk::AttachmentReference { attachment: 1, layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: if depth.is_some() { &depth_ref } else { std::ptr::null() },
        ..Default::default()
    };
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let writes = vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages,
        dst_stage_mask: stages,
        src_access_mask: writes,
        dst_access_mask: writes | vk::AccessFlags::COLOR_ATTACHMENT_READ,
        ..Default::default()
    };
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    Ok(device.create_render_pass(&ci, None)?)
}

struct StreamChunk {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    size: vk::DeviceSize,
    used: vk::DeviceSize,
}

/// Host-visible chunks that transient geometry for one frame slot is
/// written into. Recycled when the slot's fence has signalled.
#[derive(Default)]
struct StreamArena {
    chunks: Vec<StreamChunk>,
    current: usize,
}

impl StreamArena {
    fn reserve(&mut self, size: vk::DeviceSize) -> Option<(usize, vk::DeviceSize)> {
        while let Some(chunk) = self.chunks.get_mut(self.current) {
            let offset = align_up(chunk.used, STREAM_ALIGN);
            if offset + size <= chunk.size {
                chunk.used = offset + size;
                return Some((self.current, offset));
            }
            self.current += 1;
        }
        None
    }

    fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.used = 0;
        }
        self.current = 0;
    }
}

pub struct AshGpu {
    _entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    memory: vk::PhysicalDeviceMemoryProperties,
    families: QueueFamilies,
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    swapchain_loader: swapchain::Device,
    depth_format: vk::Format,
    cmd_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    texture_layout: vk::DescriptorSetLayout,
    mesh_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline_cache: vk::PipelineCache,
    streams: Vec<StreamArena>,
}

impl AshGpu {
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> VkResult<Self> {
        let dh = display.display_handle().map_err(|e| VkError::Surface(e.to_string()))?.as_raw();
        let wh = window.window_handle().map_err(|e| VkError::Surface(e.to_string()))?.as_raw();

        unsafe {
            let entry = Entry::linked();
            let validation = cfg!(debug_assertions) && has_layer(&entry, VALIDATION_LAYER);
            let debug_ext = cfg!(debug_assertions) && has_instance_extension(&entry, debug_utils::NAME);
            let instance = create_instance(&entry, dh, validation, debug_ext)?;
            let debug = if debug_ext { Some(create_debug_messenger(&entry, &instance)?) } else { None };

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)?;

            let (phys, families) = pick_device(&instance, &surface_loader, surface)?;
            let props = instance.get_physical_device_properties(phys);
            info!(
                "GPU: {} (graphics family {}, present family {}, validation {})",
                CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy(),
                families.graphics,
                families.present,
                validation
            );

            let device = create_device(&instance, phys, families)?;
            let graphics_queue = device.get_device_queue(families.graphics, 0);
            let present_queue = device.get_device_queue(families.present, 0);
            let swapchain_loader = swapchain::Device::new(&instance, &device);
            let memory = instance.get_physical_device_memory_properties(phys);
            let depth_format = pick_depth_format(&instance, phys);

            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: families.graphics,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let cmd_pool = device.create_command_pool(&pool_info, None)?;
            let descriptor_pool = create_descriptor_pool(&device)?;
            let texture_layout = create_set_layout(
                &device,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )?;
            let mesh_layout =
                create_set_layout(&device, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::VERTEX)?;
            let pipeline_layout = create_pipeline_layout(&device, &[texture_layout, mesh_layout])?;
            let pipeline_cache = device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?;

            Ok(AshGpu {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                memory,
                families,
                device,
                graphics_queue,
                present_queue,
                swapchain_loader,
                depth_format,
                cmd_pool,
                descriptor_pool,
                texture_layout,
                mesh_layout,
                pipeline_layout,
                pipeline_cache,
                streams: Vec::new(),
            })
        }
    }

    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> VkResult<(vk::Buffer, vk::DeviceMemory)> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buf = self.device.create_buffer(&bci, None)?;
        let req = self.device.get_buffer_memory_requirements(buf);
        let memory = find_memory_type(&self.memory, req.memory_type_bits, props).and_then(|memory_type_index| {
            let mai = vk::MemoryAllocateInfo {
                s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                allocation_size: req.size,
                memory_type_index,
                ..Default::default()
            };
            Ok(self.device.allocate_memory(&mai, None)?)
        });
        let memory = match memory {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_buffer(buf, None);
                return Err(e);
            }
        };
        if let Err(e) = self.device.bind_buffer_memory(buf, memory, 0) {
            self.device.destroy_buffer(buf, None);
            self.device.free_memory(memory, None);
            return Err(e.into());
        }
        Ok((buf, memory))
    }

    unsafe fn staging_buffer(&self, bytes: &[u8]) -> VkResult<(vk::Buffer, vk::DeviceMemory)> {
        let size = bytes.len() as vk::DeviceSize;
        let (buf, mem) = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        match self.device.map_memory(mem, 0, size, vk::MemoryMapFlags::empty()) {
            Ok(ptr) => {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
                self.device.unmap_memory(mem);
                Ok((buf, mem))
            }
            Err(e) => {
                self.device.destroy_buffer(buf, None);
                self.device.free_memory(mem, None);
                Err(e.into())
            }
        }
    }

    unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> VkResult<(vk::Image, vk::DeviceMemory)> {
        let ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = self.device.create_image(&ci, None)?;
        let req = self.device.get_image_memory_requirements(image);
        let memory = find_memory_type(&self.memory, req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .and_then(|memory_type_index| {
                let mai = vk::MemoryAllocateInfo {
                    s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                    allocation_size: req.size,
                    memory_type_index,
                    ..Default::default()
                };
                Ok(self.device.allocate_memory(&mai, None)?)
            });
        let memory = match memory {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_image(image, None);
                return Err(e);
            }
        };
        if let Err(e) = self.device.bind_image_memory(image, memory, 0) {
            self.device.destroy_image(image, None);
            self.device.free_memory(memory, None);
            return Err(e.into());
        }
        Ok((image, memory))
    }

    unsafe fn create_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange { aspect_mask, ..color_range() },
            ..Default::default()
        };
        Ok(self.device.create_image_view(&ci, None)?)
    }

    unsafe fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let ci = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        Ok(self.device.create_framebuffer(&ci, None)?)
    }

    unsafe fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet> {
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &layout,
            ..Default::default()
        };
        self.device
            .allocate_descriptor_sets(&ai)?
            .into_iter()
            .next()
            .ok_or_else(|| VkError::Upload("descriptor pool returned no set".into()))
    }

    /// One-shot command buffer on the graphics queue; waits until it has run.
    unsafe fn submit_and_wait(&self, record: impl FnOnce(vk::CommandBuffer)) -> VkResult<()> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = self
            .device
            .allocate_command_buffers(&ai)?
            .into_iter()
            .next()
            .ok_or_else(|| VkError::Upload("command pool returned no buffer".into()))?;
        let result = self.run_one_shot(cmd, record);
        self.device.free_command_buffers(self.cmd_pool, std::slice::from_ref(&cmd));
        result
    }

    unsafe fn run_one_shot(&self, cmd: vk::CommandBuffer, record: impl FnOnce(vk::CommandBuffer)) -> VkResult<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        self.device.begin_command_buffer(cmd, &bi)?;
        record(cmd);
        self.device.end_command_buffer(cmd)?;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        self.device.queue_submit(self.graphics_queue, std::slice::from_ref(&si), vk::Fence::null())?;
        self.device.queue_wait_idle(self.graphics_queue)?;
        Ok(())
    }

    /// Uploads `bytes` into a new device-local buffer.
    unsafe fn device_buffer(
        &self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VkResult<(vk::Buffer, vk::DeviceMemory)> {
        let size = bytes.len() as vk::DeviceSize;
        let (dst, dst_mem) = self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let copied = self.staging_buffer(bytes).and_then(|(staging, staging_mem)| {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            let result = self.submit_and_wait(|cmd| {
                self.device.cmd_copy_buffer(cmd, staging, dst, std::slice::from_ref(&region));
            });
            self.device.destroy_buffer(staging, None);
            self.device.free_memory(staging_mem, None);
            result
        });
        if let Err(e) = copied {
            self.device.destroy_buffer(dst, None);
            self.device.free_memory(dst_mem, None);
            return Err(e);
        }
        Ok((dst, dst_mem))
    }

    unsafe fn fill_texture(&self, tex: &mut GpuTexture, desc: &TextureDesc<'_>) -> VkResult<()> {
        let extent = vk::Extent2D { width: desc.width, height: desc.height };
        let format = vk::Format::R8G8B8A8_UNORM;
        let (image, memory) = self.create_image(
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;
        tex.image = image;
        tex.memory = memory;

        let (staging, staging_mem) = self.staging_buffer(desc.pixels)?;
        let copy = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: color_layers(),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D { width: desc.width, height: desc.height, depth: 1 },
        };
        let result = self.submit_and_wait(|cmd| {
            let to_dst = image_barrier(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            );
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_dst),
            );
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&copy),
            );
            let to_read = image_barrier(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            );
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_read),
            );
        });
        self.device.destroy_buffer(staging, None);
        self.device.free_memory(staging_mem, None);
        result?;

        tex.view = self.create_view(image, format, vk::ImageAspectFlags::COLOR)?;

        let filter = if desc.nearest { vk::Filter::NEAREST } else { vk::Filter::LINEAR };
        let address = if desc.repeat {
            vk::SamplerAddressMode::REPEAT
        } else {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        };
        let sci = vk::SamplerCreateInfo {
            s_type: vk::StructureType::SAMPLER_CREATE_INFO,
            mag_filter: filter,
            min_filter: filter,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            max_lod: 0.0,
            ..Default::default()
        };
        tex.sampler = self.device.create_sampler(&sci, None)?;

        tex.set = self.allocate_set(self.texture_layout)?;
        let info = vk::DescriptorImageInfo {
            sampler: tex.sampler,
            image_view: tex.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: tex.set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &info,
            ..Default::default()
        };
        self.device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        Ok(())
    }

    unsafe fn fill_mesh(&self, mesh: &mut GpuMesh, vertices: &[u8], indices: &[u16]) -> VkResult<()> {
        let (vb, vmem) = self.device_buffer(
            vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        mesh.vertex_buffer = vb;
        mesh.vertex_memory = vmem;
        if !indices.is_empty() {
            let (ib, imem) = self.device_buffer(bytemuck::cast_slice(indices), vk::BufferUsageFlags::INDEX_BUFFER)?;
            mesh.index_buffer = ib;
            mesh.index_memory = imem;
        }

        mesh.set = self.allocate_set(self.mesh_layout)?;
        let info = vk::DescriptorBufferInfo { buffer: vb, offset: 0, range: vk::WHOLE_SIZE };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: mesh.set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            p_buffer_info: &info,
            ..Default::default()
        };
        self.device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        Ok(())
    }

    unsafe fn fill_offscreen(&self, target: &mut OffscreenTarget, depth: Option<&DepthTarget>) -> VkResult<()> {
        let (image, memory) = self.create_image(
            target.extent,
            target.format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        target.image = image;
        target.memory = memory;
        target.view = self.create_view(image, target.format, vk::ImageAspectFlags::COLOR)?;
        target.render_pass =
            create_render_pass(&self.device, target.format, depth.map(|d| d.format), PassKind::Offscreen)?;
        let mut attachments = vec![target.view];
        if let Some(d) = depth {
            attachments.push(d.view);
        }
        target.framebuffer = self.create_framebuffer(target.render_pass, &attachments, target.extent)?;
        Ok(())
    }

    unsafe fn fill_swapchain(
        &self,
        targets: &mut SwapchainTargets,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> VkResult<()> {
        let caps = self.surface_loader.get_physical_device_surface_capabilities(self.phys, self.surface)?;
        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if caps.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        } else {
            warn!("swapchain images cannot be blit targets");
        }
        let indices = [self.families.graphics, self.families.present];
        let (sharing, index_count) = if self.concurrent_sharing() {
            (vk::SharingMode::CONCURRENT, indices.len() as u32)
        } else {
            (vk::SharingMode::EXCLUSIVE, 0)
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface,
            min_image_count: desc.image_count,
            image_format: desc.format.format,
            image_color_space: desc.format.color_space,
            image_extent: desc.extent,
            image_array_layers: 1,
            image_usage: usage,
            image_sharing_mode: sharing,
            queue_family_index_count: index_count,
            p_queue_family_indices: indices.as_ptr(),
            pre_transform: desc.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: desc.present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        targets.swapchain = self
            .swapchain_loader
            .create_swapchain(&swap_info, None)
            .map_err(|e| VkError::Swapchain(format!("vkCreateSwapchainKHR: {e}")))?;
        targets.images = self.swapchain_loader.get_swapchain_images(targets.swapchain)?;
        for &image in &targets.images {
            let view = self.create_view(image, targets.format, vk::ImageAspectFlags::COLOR)?;
            targets.views.push(view);
        }

        let (image, memory) = self.create_image(
            desc.extent,
            self.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        targets.depth = DepthTarget { image, memory, format: self.depth_format, view: vk::ImageView::null() };
        targets.depth.view = self.create_view(image, self.depth_format, vk::ImageAspectFlags::DEPTH)?;

        targets.render_pass =
            create_render_pass(&self.device, targets.format, Some(self.depth_format), PassKind::Clear)?;
        targets.load_pass = create_render_pass(&self.device, targets.format, Some(self.depth_format), PassKind::Load)?;
        for view in targets.views.clone() {
            let fb = self.create_framebuffer(targets.render_pass, &[view, targets.depth.view], desc.extent)?;
            targets.framebuffers.push(fb);
        }
        Ok(())
    }

    unsafe fn fill_frame_slot(&self, slot: &mut SlotSync) -> VkResult<()> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        slot.cmd = self
            .device
            .allocate_command_buffers(&ai)?
            .into_iter()
            .next()
            .ok_or_else(|| VkError::Swapchain("command pool returned no buffer".into()))?;
        let sem_ci = vk::SemaphoreCreateInfo::default();
        slot.image_available = self.device.create_semaphore(&sem_ci, None)?;
        slot.render_finished = self.device.create_semaphore(&sem_ci, None)?;
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        slot.in_flight = self.device.create_fence(&fence_ci, None)?;
        Ok(())
    }

    unsafe fn create_stream_chunk(&self, size: vk::DeviceSize) -> VkResult<StreamChunk> {
        let (buffer, memory) = self.create_buffer(
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        match self.device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) {
            Ok(ptr) => {
                debug!("stream chunk allocated ({} KiB)", size / 1024);
                Ok(StreamChunk { buffer, memory, mapped: ptr as *mut u8, size, used: 0 })
            }
            Err(e) => {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
                Err(e.into())
            }
        }
    }

    /// Copies `bytes` into the slot's arena, growing it when full.
    unsafe fn stream_write(&mut self, slot: usize, bytes: &[u8]) -> VkResult<(vk::Buffer, vk::DeviceSize)> {
        if self.streams.len() <= slot {
            self.streams.resize_with(slot + 1, StreamArena::default);
        }
        let size = bytes.len() as vk::DeviceSize;
        let (index, offset) = match self.streams[slot].reserve(size) {
            Some(found) => found,
            None => {
                let chunk = self.create_stream_chunk(size.max(STREAM_CHUNK_SIZE))?;
                let arena = &mut self.streams[slot];
                arena.chunks.push(chunk);
                arena.current = arena.chunks.len() - 1;
                arena
                    .reserve(size)
                    .ok_or_else(|| VkError::Upload(format!("stream chunk cannot hold {size} bytes")))?
            }
        };
        let chunk = &self.streams[slot].chunks[index];
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), chunk.mapped.add(offset as usize), bytes.len());
        Ok((chunk.buffer, offset))
    }

    unsafe fn shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            p_code: code.as_ptr(),
            code_size: std::mem::size_of_val(code),
            ..Default::default()
        };
        Ok(self.device.create_shader_module(&ci, None)?)
    }

    unsafe fn build_pipeline(
        &self,
        desc: &PipelineDesc,
        vs: vk::ShaderModule,
        fs: vk::ShaderModule,
        render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline> {
        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];

        let (binding, attrs) = vertex_input(desc.vertex_layout);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: 1,
            p_vertex_binding_descriptions: &binding,
            vertex_attribute_description_count: attrs.len() as u32,
            p_vertex_attribute_descriptions: attrs.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: match desc.topology {
                Topology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
                Topology::Lines => vk::PrimitiveTopology::LINE_LIST,
            },
            ..Default::default()
        };
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        // Billboards, 2D and lines are drawn double-sided.
        let cull_mode = if desc.depth_write { vk::CullModeFlags::BACK } else { vk::CullModeFlags::NONE };
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: desc.depth_test.into(),
            depth_write_enable: desc.depth_write.into(),
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            ..Default::default()
        };
        let blend = blend_attachment(desc.blend);
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &blend,
            ..Default::default()
        };

        let info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout: self.pipeline_layout,
            render_pass,
            subpass: 0,
            ..Default::default()
        };
        let pipelines = self
            .device
            .create_graphics_pipelines(self.pipeline_cache, std::slice::from_ref(&info), None)
            .map_err(|(_, e)| VkError::Pipeline(format!("{}: {e}", desc.name)))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| VkError::Pipeline(format!("{}: driver returned no pipeline", desc.name)))
    }
}

impl Gpu for AshGpu {
    fn surface_info(&self) -> VkResult<SurfaceInfo> {
        unsafe {
            Ok(SurfaceInfo {
                caps: self.surface_loader.get_physical_device_surface_capabilities(self.phys, self.surface)?,
                formats: self.surface_loader.get_physical_device_surface_formats(self.phys, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.phys, self.surface)?,
            })
        }
    }

    fn concurrent_sharing(&self) -> bool {
        self.families.graphics != self.families.present
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> VkResult<SwapchainTargets> {
        let mut targets = SwapchainTargets {
            format: desc.format.format,
            extent: desc.extent,
            present_mode: desc.present_mode,
            ..Default::default()
        };
        match unsafe { self.fill_swapchain(&mut targets, desc, old) } {
            Ok(()) => Ok(targets),
            Err(e) => {
                self.destroy_swapchain(targets);
                Err(e)
            }
        }
    }

    fn destroy_swapchain(&mut self, targets: SwapchainTargets) {
        unsafe {
            let d = &self.device;
            for &fb in &targets.framebuffers {
                d.destroy_framebuffer(fb, None);
            }
            d.destroy_render_pass(targets.load_pass, None);
            d.destroy_render_pass(targets.render_pass, None);
            d.destroy_image_view(targets.depth.view, None);
            d.destroy_image(targets.depth.image, None);
            d.free_memory(targets.depth.memory, None);
            for &view in &targets.views {
                d.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(targets.swapchain, None);
        }
    }

    fn wait_idle(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            warn!("device_wait_idle failed: {e}");
        }
    }

    fn create_frame_slot(&mut self) -> VkResult<SlotSync> {
        let mut slot = SlotSync::default();
        match unsafe { self.fill_frame_slot(&mut slot) } {
            Ok(()) => Ok(slot),
            Err(e) => {
                self.destroy_frame_slot(slot);
                Err(e)
            }
        }
    }

    fn destroy_frame_slot(&mut self, slot: SlotSync) {
        unsafe {
            if slot.cmd != vk::CommandBuffer::null() {
                self.device.free_command_buffers(self.cmd_pool, std::slice::from_ref(&slot.cmd));
            }
            self.device.destroy_semaphore(slot.image_available, None);
            self.device.destroy_semaphore(slot.render_finished, None);
            self.device.destroy_fence(slot.in_flight, None);
        }
    }

    fn wait_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { Ok(self.device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)?) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { Ok(self.device.reset_fences(std::slice::from_ref(&fence))?) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { Ok(self.device.get_fence_status(fence)?) }
    }

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> VkResult<Acquire> {
        let result =
            unsafe { self.swapchain_loader.acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null()) };
        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn begin_commands(&mut self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &bi)?;
        }
        Ok(())
    }

    fn end_commands(&mut self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { Ok(self.device.end_command_buffer(cmd)?) }
    }

    fn submit(&mut self, slot: &SlotSync) -> VkResult<()> {
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &slot.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &slot.cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &slot.render_finished,
            ..Default::default()
        };
        unsafe { Ok(self.device.queue_submit(self.graphics_queue, std::slice::from_ref(&si), slot.in_flight)?) }
    }

    fn present(&mut self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<Present> {
        let pi = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        match unsafe { self.swapchain_loader.queue_present(self.present_queue, &pi) } {
            Ok(false) => Ok(Present::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::Stale),
            Err(e) => Err(e.into()),
        }
    }

    fn begin_render_pass(&mut self, cmd: vk::CommandBuffer, pass: &PassBegin) {
        let clears = [
            vk::ClearValue { color: vk::ClearColorValue { float32: pass.clear_color } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
        ];
        let info = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: pass.render_pass,
            framebuffer: pass.framebuffer,
            render_area: vk::Rect2D { offset: vk::Offset2D::default(), extent: pass.extent },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        unsafe { self.device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE) }
    }

    fn end_render_pass(&mut self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn set_viewport(&mut self, cmd: vk::CommandBuffer, rect: vk::Rect2D) {
        let viewport = vk::Viewport {
            x: rect.offset.x as f32,
            y: rect.offset.y as f32,
            width: rect.extent.width as f32,
            height: rect.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport)) }
    }

    fn set_scissor(&mut self, cmd: vk::CommandBuffer, rect: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&rect)) }
    }

    fn bind_pipeline(&mut self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline) }
    }

    fn push_constants(&mut self, cmd: vk::CommandBuffer, bytes: &[u8]) {
        let len = bytes.len().min(PUSH_CONSTANT_SIZE as usize);
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                &bytes[..len],
            )
        }
    }

    fn bind_texture(&mut self, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        if set == vk::DescriptorSet::null() {
            return;
        }
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                std::slice::from_ref(&set),
                &[],
            )
        }
    }

    fn draw_mesh(&mut self, cmd: vk::CommandBuffer, mesh: &GpuMesh) {
        unsafe {
            let d = &self.device;
            if mesh.set != vk::DescriptorSet::null() {
                d.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    1,
                    std::slice::from_ref(&mesh.set),
                    &[],
                );
            }
            d.cmd_bind_vertex_buffers(cmd, 0, std::slice::from_ref(&mesh.vertex_buffer), &[0]);
            if mesh.index_count > 0 {
                d.cmd_bind_index_buffer(cmd, mesh.index_buffer, 0, vk::IndexType::UINT16);
                d.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
            } else {
                d.cmd_draw(cmd, mesh.vertex_count, 1, 0, 0);
            }
        }
    }

    fn reset_streams(&mut self, slot: usize) {
        if let Some(arena) = self.streams.get_mut(slot) {
            arena.reset();
        }
    }

    fn draw_stream(&mut self, cmd: vk::CommandBuffer, slot: usize, draw: StreamDraw<'_>) -> VkResult<()> {
        if draw.vertex_count == 0 || draw.vertices.is_empty() {
            return Ok(());
        }
        unsafe {
            let (vb, voff) = self.stream_write(slot, draw.vertices)?;
            if draw.indices.is_empty() {
                self.device.cmd_bind_vertex_buffers(cmd, 0, &[vb], &[voff]);
                self.device.cmd_draw(cmd, draw.vertex_count, 1, 0, 0);
            } else {
                let (ib, ioff) = self.stream_write(slot, bytemuck::cast_slice(draw.indices))?;
                self.device.cmd_bind_vertex_buffers(cmd, 0, &[vb], &[voff]);
                self.device.cmd_bind_index_buffer(cmd, ib, ioff, vk::IndexType::UINT16);
                self.device.cmd_draw_indexed(cmd, draw.indices.len() as u32, 1, 0, 0, 0);
            }
        }
        Ok(())
    }

    fn blit_to_swapchain(&mut self, cmd: vk::CommandBuffer, src: &OffscreenTarget, dst: vk::Image, extent: vk::Extent2D) {
        let to_transfer = [
            image_barrier(
                src.image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
            image_barrier(
                dst,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ];
        let corner = |e: vk::Extent2D| vk::Offset3D { x: e.width as i32, y: e.height as i32, z: 1 };
        let region = vk::ImageBlit {
            src_subresource: color_layers(),
            src_offsets: [vk::Offset3D::default(), corner(src.extent)],
            dst_subresource: color_layers(),
            dst_offsets: [vk::Offset3D::default(), corner(extent)],
        };
        let to_present = image_barrier(
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        unsafe {
            let d = &self.device;
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_transfer,
            );
            d.cmd_blit_image(
                cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
                vk::Filter::LINEAR,
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_present),
            );
        }
    }

    fn downsample(&mut self, cmd: vk::CommandBuffer, src: &OffscreenTarget, dst: &OffscreenTarget) {
        let to_transfer = [
            image_barrier(
                src.image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
            // Previous contents are overwritten.
            image_barrier(
                dst.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ];
        let corner = |e: vk::Extent2D| vk::Offset3D { x: e.width as i32, y: e.height as i32, z: 1 };
        let region = vk::ImageBlit {
            src_subresource: color_layers(),
            src_offsets: [vk::Offset3D::default(), corner(src.extent)],
            dst_subresource: color_layers(),
            dst_offsets: [vk::Offset3D::default(), corner(dst.extent)],
        };
        let back = [
            image_barrier(
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            image_barrier(
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::TRANSFER_READ,
            ),
        ];
        unsafe {
            let d = &self.device;
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_transfer,
            );
            d.cmd_blit_image(
                cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
                vk::Filter::LINEAR,
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &back,
            );
        }
    }
    fn upload_texture(&mut self, desc: &TextureDesc<'_>) -> VkResult<GpuTexture> {
        let expected = desc.width as usize * desc.height as usize * 4;
        if desc.width == 0 || desc.height == 0 || desc.pixels.len() != expected {
            return Err(VkError::Upload(format!(
                "{}: {}x{} needs {expected} bytes, got {}",
                desc.name,
                desc.width,
                desc.height,
                desc.pixels.len()
            )));
        }
        let mut tex = GpuTexture::default();
        match unsafe { self.fill_texture(&mut tex, desc) } {
            Ok(()) => Ok(tex),
            Err(e) => {
                self.destroy_texture(tex);
                Err(e)
            }
        }
    }

    fn destroy_texture(&mut self, texture: GpuTexture) {
        unsafe {
            let d = &self.device;
            if texture.set != vk::DescriptorSet::null() {
                if let Err(e) = d.free_descriptor_sets(self.descriptor_pool, std::slice::from_ref(&texture.set)) {
                    warn!("free_descriptor_sets failed: {e}");
                }
            }
            d.destroy_sampler(texture.sampler, None);
            d.destroy_image_view(texture.view, None);
            d.destroy_image(texture.image, None);
            d.free_memory(texture.memory, None);
        }
    }

    fn upload_mesh(&mut self, vertices: &[u8], vertex_count: u32, indices: &[u16]) -> VkResult<GpuMesh> {
        if vertices.is_empty() || vertex_count == 0 {
            return Err(VkError::Upload("mesh without vertices".into()));
        }
        let mut mesh = GpuMesh { vertex_count, index_count: indices.len() as u32, ..Default::default() };
        match unsafe { self.fill_mesh(&mut mesh, vertices, indices) } {
            Ok(()) => Ok(mesh),
            Err(e) => {
                self.destroy_mesh(mesh);
                Err(e)
            }
        }
    }

    fn destroy_mesh(&mut self, mesh: GpuMesh) {
        unsafe {
            let d = &self.device;
            if mesh.set != vk::DescriptorSet::null() {
                if let Err(e) = d.free_descriptor_sets(self.descriptor_pool, std::slice::from_ref(&mesh.set)) {
                    warn!("free_descriptor_sets failed: {e}");
                }
            }
            d.destroy_buffer(mesh.index_buffer, None);
            d.free_memory(mesh.index_memory, None);
            d.destroy_buffer(mesh.vertex_buffer, None);
            d.free_memory(mesh.vertex_memory, None);
        }
    }

    fn create_offscreen_target(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        depth: Option<&DepthTarget>,
    ) -> VkResult<OffscreenTarget> {
        let mut target = OffscreenTarget { extent, format, ..Default::default() };
        match unsafe { self.fill_offscreen(&mut target, depth) } {
            Ok(()) => Ok(target),
            Err(e) => {
                self.destroy_offscreen_target(target);
                Err(e)
            }
        }
    }

    fn destroy_offscreen_target(&mut self, target: OffscreenTarget) {
        unsafe {
            let d = &self.device;
            d.destroy_framebuffer(target.framebuffer, None);
            d.destroy_render_pass(target.render_pass, None);
            d.destroy_image_view(target.view, None);
            d.destroy_image(target.image, None);
            d.free_memory(target.memory, None);
        }
    }

    fn create_pipeline(
        &mut self,
        desc: &PipelineDesc,
        vert: &[u32],
        frag: &[u32],
        render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline> {
        unsafe {
            let vs = self.shader_module(vert)?;
            let fs = match self.shader_module(frag) {
                Ok(fs) => fs,
                Err(e) => {
                    self.device.destroy_shader_module(vs, None);
                    return Err(e);
                }
            };
            let result = self.build_pipeline(desc, vs, fs, render_pass);
            self.device.destroy_shader_module(vs, None);
            self.device.destroy_shader_module(fs, None);
            result
        }
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }
}

// Teardown order: streams, layouts and pools, device, surface, messenger,
// instance last.
impl Drop for AshGpu {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;
            d.device_wait_idle().ok();
            for arena in self.streams.drain(..) {
                for chunk in arena.chunks {
                    d.destroy_buffer(chunk.buffer, None);
                    d.free_memory(chunk.memory, None);
                }
            }
            d.destroy_pipeline_cache(self.pipeline_cache, None);
            d.destroy_pipeline_layout(self.pipeline_layout, None);
            d.destroy_descriptor_set_layout(self.mesh_layout, None);
            d.destroy_descriptor_set_layout(self.texture_layout, None);
            d.destroy_descriptor_pool(self.descriptor_pool, None);
            d.destroy_command_pool(self.cmd_pool, None);
            d.destroy_device(None);

            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
