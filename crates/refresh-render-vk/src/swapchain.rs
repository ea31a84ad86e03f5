// SPDX-License-Identifier: CEPL-1.0
//! Swapchain policy and lifetime.

use ash::vk;
use tracing::info;

use crate::error::{VkError, VkResult};
use crate::gpu::{Gpu, SwapchainDesc, SwapchainTargets};

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    // A lone UNDEFINED entry means the surface takes anything.
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        return Some(preferred);
    }
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
}

/// `interval` 0 disables vsync; N > 1 asks for every Nth vblank.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], interval: u32) -> vk::PresentModeKHR {
    use vk::PresentModeKHR as M;
    let order: &[M] = match interval {
        0 => &[M::MAILBOX, M::IMMEDIATE, M::FIFO_RELAXED],
        1 => &[M::FIFO, M::FIFO_RELAXED],
        _ => &[M::FIFO_RELAXED, M::FIFO],
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .or_else(|| modes.first().copied())
        .unwrap_or(M::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub struct SwapchainManager {
    targets: Option<SwapchainTargets>,
    requested: vk::Extent2D,
    swap_interval: u32,
    rebuilds: u64,
}

impl SwapchainManager {
    pub fn new(requested: vk::Extent2D, swap_interval: u32) -> Self {
        SwapchainManager { targets: None, requested, swap_interval, rebuilds: 0 }
    }

    pub fn targets(&self) -> Option<&SwapchainTargets> {
        self.targets.as_ref()
    }

    pub fn swap_interval(&self) -> u32 {
        self.swap_interval
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn set_requested_extent(&mut self, extent: vk::Extent2D) {
        self.requested = extent;
    }

    /// Creates the swapchain and its targets. A surface with a zero extent
    /// (minimised window) leaves the manager empty without error.
    pub fn create<G: Gpu>(&mut self, gpu: &mut G) -> VkResult<()> {
        let info = gpu.surface_info()?;
        let format = choose_surface_format(&info.formats)
            .ok_or_else(|| VkError::Swapchain("surface reports no formats".into()))?;
        let extent = choose_extent(&info.caps, self.requested);
        if extent.width == 0 || extent.height == 0 {
            info!("surface extent is 0x0, swapchain deferred");
            return Ok(());
        }
        let desc = SwapchainDesc {
            format,
            present_mode: choose_present_mode(&info.present_modes, self.swap_interval),
            extent,
            image_count: choose_image_count(&info.caps),
            pre_transform: info.caps.current_transform,
        };
        let old = self.targets.as_ref().map(|t| t.swapchain).unwrap_or_default();
        let targets = gpu.create_swapchain(&desc, old)?;
        info!(
            "swapchain ready ({}x{}, {:?}, {:?}, {} images)",
            targets.extent.width,
            targets.extent.height,
            targets.format,
            targets.present_mode,
            targets.images.len()
        );
        self.targets = Some(targets);
        Ok(())
    }

    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        if let Some(targets) = self.targets.take() {
            gpu.destroy_swapchain(targets);
        }
    }

    /// Device-idle, tear down, recreate. Safe to call back to back.
    pub fn rebuild<G: Gpu>(&mut self, gpu: &mut G) -> VkResult<()> {
        gpu.wait_idle();
        self.destroy(gpu);
        self.rebuilds += 1;
        self.create(gpu)
    }

    /// Records a new interval; returns whether it differs from the current one.
    pub fn refresh_swap_interval(&mut self, interval: u32) -> bool {
        if interval == self.swap_interval {
            return false;
        }
        info!("swap interval {} -> {}", self.swap_interval, interval);
        self.swap_interval = interval;
        true
    }
}
