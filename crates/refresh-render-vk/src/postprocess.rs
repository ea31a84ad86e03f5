// SPDX-License-Identifier: CEPL-1.0
//! Offscreen scene target and the post-process ordering around it.

use ash::vk;
use tracing::{info, warn};

use crate::error::VkResult;
use crate::frame_state::PostToggles;
use crate::gpu::{Gpu, OffscreenTarget, SwapchainTargets};

/// Bloom targets are this many times smaller than the swapchain.
const BLOOM_DOWNSCALE: u32 = 4;
const BLOOM_TARGETS: usize = 2;

pub fn bloom_extent(extent: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width / BLOOM_DOWNSCALE).max(1),
        height: (extent.height / BLOOM_DOWNSCALE).max(1),
    }
}

/// Stage labels for the active effects, in the order they run.
pub fn stage_labels(toggles: PostToggles) -> Vec<&'static str> {
    let mut labels = Vec::new();
    if toggles.waterwarp {
        labels.push("post.waterwarp");
    }
    if toggles.bloom {
        labels.push("post.bloom");
    }
    if toggles.overlay {
        labels.push("overlay.blend");
    }
    labels
}

#[derive(Default)]
pub struct PostProcess {
    scene: Option<OffscreenTarget>,
    bloom: Vec<OffscreenTarget>,
}

impl PostProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets exist and the scene can be redirected.
    pub fn available(&self) -> bool {
        self.scene.is_some()
    }

    pub fn scene_target(&self) -> Option<&OffscreenTarget> {
        self.scene.as_ref()
    }

    pub fn bloom_targets(&self) -> &[OffscreenTarget] {
        &self.bloom
    }

    /// Builds the targets for `targets`. A failure leaves post-processing
    /// off until the next rebuild.
    pub fn create<G: Gpu>(&mut self, gpu: &mut G, targets: &SwapchainTargets) {
        if let Err(e) = self.try_create(gpu, targets) {
            warn!("post-processing disabled: {e}");
            self.destroy(gpu);
        }
    }

    fn try_create<G: Gpu>(&mut self, gpu: &mut G, targets: &SwapchainTargets) -> VkResult<()> {
        let scene = gpu.create_offscreen_target(targets.extent, targets.format, Some(&targets.depth))?;
        self.scene = Some(scene);
        let small = bloom_extent(targets.extent);
        for _ in 0..BLOOM_TARGETS {
            let target = gpu.create_offscreen_target(small, targets.format, None)?;
            self.bloom.push(target);
        }
        info!(
            "post-process targets ready ({}x{}, bloom {}x{})",
            targets.extent.width, targets.extent.height, small.width, small.height
        );
        Ok(())
    }

    /// Downsamples the scene through the bloom chain. Does nothing without
    /// targets.
    pub fn record_bloom<G: Gpu>(&self, gpu: &mut G, cmd: vk::CommandBuffer) -> bool {
        let Some(scene) = &self.scene else {
            return false;
        };
        if self.bloom.is_empty() {
            return false;
        }
        let mut src = scene;
        for dst in &self.bloom {
            gpu.downsample(cmd, src, dst);
            src = dst;
        }
        true
    }

    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        for target in self.bloom.drain(..) {
            gpu.destroy_offscreen_target(target);
        }
        if let Some(scene) = self.scene.take() {
            gpu.destroy_offscreen_target(scene);
        }
    }
}
