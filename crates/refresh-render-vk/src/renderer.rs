// SPDX-License-Identifier: CEPL-1.0
//! Per-frame orchestration over a [`Gpu`].
//!
//! `RendererCore` ties the swapchain, frame slots, resource store, pipeline
//! cache, queues, effect streams, 2D batcher and post-process targets
//! together. It records everything on the caller's thread; the only blocking
//! points are the slot fence at the top of `begin_frame`, one-shot uploads
//! and the idle wait of a rebuild.

use std::path::PathBuf;

use ash::vk;
use refresh_core::{LogOnce, RenderConfig};
use refresh_math::{Mat4, Vec3};
use refresh_render::{
    CharFlags, ClipRect, Color, Draw2D, Entity, ImageFlags, ImageHandle, ImageType, ModelHandle, RefDef,
    RenderFlags,
};
use tracing::{debug, info, warn};

use crate::draw2d::{self, Batch, Batcher2D, Quad, FULL_UVS};
use crate::effects::{BeamPrimitive, EffectBuffers, FlarePrimitive};
use crate::error::VkResult;
use crate::frame::{ActiveFrame, Begin, End, FrameScheduler};
use crate::frame_state::{DrawConstants, FrameState, FrameStats};
use crate::gpu::{Gpu, PassBegin, StreamDraw};
use crate::palette::Palette;
use crate::pipeline::{DrawKind, PipelineCache, PipelineKey, ShaderDir, ShaderSource};
use crate::postprocess::{stage_labels, PostProcess};
use crate::queues::RenderQueues;
use crate::resources::{ModelRecord, ResourceStore};
use crate::swapchain::SwapchainManager;

const CHAR_SIZE: i32 = 8;

/// The device plus the state draw recording touches, split off so the 2D
/// flush sink can borrow it while the batcher is borrowed too.
struct Recorder<G: Gpu> {
    gpu: G,
    pipelines: PipelineCache,
    resources: ResourceStore,
    stats: FrameStats,
    log: Vec<String>,
}

impl<G: Gpu> Recorder<G> {
    fn bind_pipeline(&mut self, cmd: vk::CommandBuffer, key: PipelineKey, render_pass: vk::RenderPass) -> bool {
        let Some(pipeline) = self.pipelines.ensure(&mut self.gpu, key, render_pass) else {
            return false;
        };
        self.gpu.bind_pipeline(cmd, pipeline);
        self.stats.pipelines_bound += 1;
        self.log.push(format!("bind.pipeline.{}", key.debug_name()));
        true
    }

    fn draw_batch(&mut self, frame: ActiveFrame, render_pass: vk::RenderPass, extent: vk::Extent2D, batch: Batch<'_>) {
        let key = PipelineKey::new(DrawKind::Draw2D, Default::default());
        if !self.bind_pipeline(frame.cmd, key, render_pass) {
            return;
        }
        let ortho = Mat4::orthographic_rh(0.0, extent.width as f32, 0.0, extent.height as f32, -1.0, 1.0);
        self.gpu.push_constants(frame.cmd, bytemuck::bytes_of(&DrawConstants::with_matrix(ortho)));
        let set = self.resources.texture_set(batch.texture);
        self.gpu.bind_texture(frame.cmd, set);
        let draw = StreamDraw {
            vertices: bytemuck::cast_slice(batch.vertices),
            vertex_count: batch.vertices.len() as u32,
            indices: batch.indices,
        };
        match self.gpu.draw_stream(frame.cmd, frame.slot, draw) {
            Ok(()) => self.stats.draw_calls += 1,
            Err(e) => warn!("2D batch dropped: {e}"),
        }
    }
}

fn entity_kind(entity: &Entity, model: &ModelRecord) -> DrawKind {
    if entity.flags.contains(RenderFlags::WEAPONMODEL) {
        DrawKind::Weapon
    } else if model.is_sprite() {
        DrawKind::Sprite
    } else {
        DrawKind::Alias
    }
}

/// Skin override, else the model's skin by number (out of range -> 0),
/// else white.
fn select_skin(entity: &Entity, skins: &[ImageHandle], resources: &ResourceStore) -> ImageHandle {
    if !entity.skin.is_null() && resources.image(entity.skin).is_some() {
        return entity.skin;
    }
    let index = usize::try_from(entity.skin_num).ok().filter(|&i| i < skins.len()).unwrap_or(0);
    skins.get(index).copied().unwrap_or(resources.white())
}

fn view_rect(fd: &RefDef, extent: vk::Extent2D) -> vk::Rect2D {
    let x = fd.x.clamp(0, extent.width as i32);
    let y = fd.y.clamp(0, extent.height as i32);
    let max_w = extent.width - x as u32;
    let max_h = extent.height - y as u32;
    let w = if fd.width == 0 { max_w } else { fd.width.min(max_w) };
    let h = if fd.height == 0 { max_h } else { fd.height.min(max_h) };
    if w == 0 || h == 0 {
        return draw2d::full_rect(extent);
    }
    vk::Rect2D { offset: vk::Offset2D { x, y }, extent: vk::Extent2D { width: w, height: h } }
}

pub struct RendererCore<G: Gpu> {
    rec: Recorder<G>,
    config: RenderConfig,
    swapchain: SwapchainManager,
    frames: FrameScheduler,
    post: PostProcess,
    palette: Palette,
    queues: RenderQueues,
    effects: EffectBuffers,
    batcher: Batcher2D,
    frame: FrameState,
    active: Option<ActiveFrame>,
    pass_open: bool,
    scale: f32,
    clip: Option<ClipRect>,
    resize_pending: bool,
    pipeline_format: vk::Format,
    /// Directory the pipeline cache currently loads from.
    shader_dir: PathBuf,
    misuse: LogOnce,
    shut_down: bool,
}

impl<G: Gpu> RendererCore<G> {
    pub fn new(
        mut gpu: G,
        extent: vk::Extent2D,
        config: RenderConfig,
        resources: ResourceStore,
        shaders: Box<dyn ShaderSource>,
    ) -> VkResult<Self> {
        let mut swapchain = SwapchainManager::new(extent, config.swap_interval());
        swapchain.create(&mut gpu)?;

        let shader_dir = config.shader_dir.clone();
        let mut core = RendererCore {
            rec: Recorder {
                gpu,
                pipelines: PipelineCache::new(shaders),
                resources,
                stats: FrameStats::default(),
                log: Vec::new(),
            },
            config,
            swapchain,
            frames: FrameScheduler::new(),
            post: PostProcess::new(),
            palette: Palette::default(),
            queues: RenderQueues::default(),
            effects: EffectBuffers::default(),
            batcher: Batcher2D::new(),
            frame: FrameState::default(),
            active: None,
            pass_open: false,
            scale: 1.0,
            clip: None,
            resize_pending: false,
            pipeline_format: vk::Format::UNDEFINED,
            shader_dir,
            misuse: LogOnce::new(),
            shut_down: false,
        };
        core.create_surface_dependents()?;
        core.rec.resources.ensure_white_texture(&mut core.rec.gpu);
        Ok(core)
    }

    pub fn gpu(&self) -> &G {
        &self.rec.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.rec.gpu
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.rec.resources
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.rec.pipelines
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn frames(&self) -> &FrameScheduler {
        &self.frames
    }

    pub fn post(&self) -> &PostProcess {
        &self.post
    }

    pub fn queues(&self) -> &RenderQueues {
        &self.queues
    }

    pub fn stats(&self) -> FrameStats {
        self.rec.stats
    }

    /// Stage labels of the current (or last finished) frame.
    pub fn command_log(&self) -> &[String] {
        &self.rec.log
    }

    pub fn in_frame(&self) -> bool {
        self.active.is_some()
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = palette;
    }

    /// A new shader directory takes effect immediately between frames and
    /// at `end_frame` otherwise.
    pub fn set_config(&mut self, config: RenderConfig) {
        self.config = config;
        if self.active.is_none() {
            self.apply_shader_dir();
        }
    }

    fn apply_shader_dir(&mut self) {
        if self.config.shader_dir == self.shader_dir {
            return;
        }
        info!("shader directory now {}", self.config.shader_dir.display());
        self.rec.gpu.wait_idle();
        self.rec.pipelines.clear(&mut self.rec.gpu);
        self.rec.pipelines.set_shader_source(Box::new(ShaderDir::new(&self.config.shader_dir)));
        self.shader_dir = self.config.shader_dir.clone();
    }

    fn create_surface_dependents(&mut self) -> VkResult<()> {
        let Some(targets) = self.swapchain.targets() else {
            return Ok(());
        };
        if targets.format != self.pipeline_format {
            if self.pipeline_format != vk::Format::UNDEFINED {
                debug!("surface format changed, dropping pipelines");
            }
            self.rec.pipelines.clear(&mut self.rec.gpu);
            self.pipeline_format = targets.format;
        }
        self.frames.create(&mut self.rec.gpu, targets.images.len())?;
        self.post.create(&mut self.rec.gpu, targets);
        Ok(())
    }

    /// Tears down and recreates everything tied to the surface.
    pub fn rebuild(&mut self) -> VkResult<()> {
        self.rec.gpu.wait_idle();
        self.post.destroy(&mut self.rec.gpu);
        self.frames.destroy(&mut self.rec.gpu);
        self.active = None;
        self.pass_open = false;
        self.resize_pending = false;
        self.swapchain.rebuild(&mut self.rec.gpu)?;
        self.create_surface_dependents()
    }

    pub fn resize(&mut self, width: u32, height: u32) -> VkResult<()> {
        self.swapchain.set_requested_extent(vk::Extent2D { width, height });
        if self.active.is_some() {
            self.resize_pending = true;
            return Ok(());
        }
        self.rebuild()
    }

    fn main_pass(&self, image_index: u32, load: bool) -> Option<PassBegin> {
        let targets = self.swapchain.targets()?;
        Some(PassBegin {
            render_pass: if load { targets.load_pass } else { targets.render_pass },
            framebuffer: *targets.framebuffers.get(image_index as usize)?,
            extent: targets.extent,
            clear_color: self.config.clear_color,
        })
    }

    fn extent(&self) -> vk::Extent2D {
        self.swapchain.targets().map(|t| t.extent).unwrap_or_default()
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.targets().map(|t| t.render_pass).unwrap_or_default()
    }

    fn open_pass(&mut self, cmd: vk::CommandBuffer, pass: &PassBegin) {
        self.rec.gpu.begin_render_pass(cmd, pass);
        let full = draw2d::full_rect(pass.extent);
        self.rec.gpu.set_viewport(cmd, full);
        self.rec.gpu.set_scissor(cmd, full);
        self.pass_open = true;
    }

    fn close_pass(&mut self, cmd: vk::CommandBuffer) {
        if self.pass_open {
            self.rec.gpu.end_render_pass(cmd);
            self.pass_open = false;
        }
    }

    /// `Ok(false)` when no frame was started: minimised window, stale
    /// surface (rebuilt) or a frame already in progress.
    pub fn begin_frame(&mut self) -> VkResult<bool> {
        if self.active.is_some() {
            if self.misuse.first("begin_frame") {
                warn!("begin_frame called twice");
            }
            return Ok(false);
        }
        if self.swapchain.refresh_swap_interval(self.config.swap_interval()) && self.swapchain.targets().is_some() {
            self.rebuild()?;
        }
        let Some(targets) = self.swapchain.targets() else {
            return Ok(false);
        };

        let frame = match self.frames.begin(&mut self.rec.gpu, targets)? {
            Begin::Frame(frame) => frame,
            Begin::Stale => {
                self.rebuild()?;
                return Ok(false);
            }
            Begin::Busy => return Ok(false),
        };
        self.rec.resources.release_retired(&mut self.rec.gpu, self.frames.frames_submitted());
        self.rec.log.clear();
        self.rec.stats = FrameStats::default();
        self.frame = FrameState::default();
        self.active = Some(frame);
        self.rec.log.push("frame.begin".into());

        let Some(pass) = self.main_pass(frame.image_index, false) else {
            return Ok(true);
        };
        self.open_pass(frame.cmd, &pass);
        self.apply_clip(frame);
        self.batcher.begin();
        Ok(true)
    }

    pub fn render_frame(&mut self, fd: &RefDef) {
        let Some(frame) = self.active else {
            if self.misuse.first("render_frame") {
                warn!("render_frame outside begin_frame/end_frame");
            }
            return;
        };
        let Some(targets) = self.swapchain.targets() else {
            return;
        };
        let extent = targets.extent;
        let swap_image = targets.images.get(frame.image_index as usize).copied();
        let render_pass = targets.render_pass;
        let cmd = frame.cmd;

        // Anything drawn in 2D so far belongs under the scene.
        self.flush_2d(frame);
        self.frame = FrameState::prepare(&self.config, fd);

        let scene_target = if self.frame.settings.post.any() { self.post.scene_target().copied() } else { None };
        if let Some(target) = &scene_target {
            self.close_pass(cmd);
            let pass = PassBegin {
                render_pass: target.render_pass,
                framebuffer: target.framebuffer,
                extent: target.extent,
                clear_color: self.config.clear_color,
            };
            self.open_pass(cmd, &pass);
        }
        let rect = view_rect(fd, extent);
        self.rec.gpu.set_viewport(cmd, rect);
        self.rec.gpu.set_scissor(cmd, rect);

        if fd.world_visible() {
            self.rec.log.push("world.draw".into());
        }

        let mut queues = std::mem::take(&mut self.queues);
        queues.classify(&self.frame.refdef.entities, self.config.draw_order_threshold);
        queues.sort_transparent(&self.frame.refdef.entities, self.frame.view.origin);

        self.draw_entities(cmd, render_pass, &queues.bmodels, "entities.inline");
        self.draw_entities(cmd, render_pass, &queues.opaque, "entities.opaque");
        let back: Vec<usize> = queues.alpha_back_order().collect();
        self.draw_entities(cmd, render_pass, &back, "entities.alpha_back");
        self.draw_effects(frame, render_pass, &queues);
        let front: Vec<usize> = queues.alpha_front_order().collect();
        self.draw_entities(cmd, render_pass, &front, "entities.alpha_front");
        self.draw_debug_lines(frame, render_pass);
        self.queues = queues;

        if let (Some(target), Some(image)) = (scene_target, swap_image) {
            self.close_pass(cmd);
            for label in stage_labels(self.frame.settings.post) {
                self.rec.log.push(label.into());
            }
            if self.frame.settings.post.bloom {
                self.post.record_bloom(&mut self.rec.gpu, cmd);
            }
            self.rec.gpu.blit_to_swapchain(cmd, &target, image, extent);
            if let Some(pass) = self.main_pass(frame.image_index, true) {
                self.open_pass(cmd, &pass);
            }
        } else {
            let full = draw2d::full_rect(extent);
            self.rec.gpu.set_viewport(cmd, full);
            self.rec.gpu.set_scissor(cmd, full);
        }
        self.apply_clip(frame);
    }

    fn draw_entities(&mut self, cmd: vk::CommandBuffer, render_pass: vk::RenderPass, order: &[usize], label: &str) {
        if order.is_empty() {
            return;
        }
        self.rec.log.push(label.into());
        let features = self.frame.features();
        let mut bound: Option<(PipelineKey, bool)> = None;

        for &index in order {
            let Some(entity) = self.frame.refdef.entities.get(index) else {
                continue;
            };
            let resources = &self.rec.resources;
            let Some(model) = resources.model(entity.model) else {
                continue;
            };
            if model.meshes.is_empty() {
                continue;
            }
            let key = PipelineKey::new(entity_kind(entity, model), features);
            let draws: Vec<_> = model
                .meshes
                .iter()
                .map(|m| (m.mesh, resources.texture_set(select_skin(entity, &m.skins, resources))))
                .collect();
            let name = model.name.clone();
            let light = self.frame.light_point(entity.origin);
            let constants = DrawConstants::for_entity(entity, self.frame.view.view_proj, light);

            if bound.map(|(k, _)| k) != Some(key) {
                let ok = self.rec.bind_pipeline(cmd, key, render_pass);
                bound = Some((key, ok));
            }
            if bound.is_some_and(|(_, ok)| !ok) {
                continue;
            }

            self.rec.gpu.push_constants(cmd, bytemuck::bytes_of(&constants));
            for (n, (mesh, set)) in draws.iter().enumerate() {
                self.rec.gpu.bind_texture(cmd, *set);
                self.rec.gpu.draw_mesh(cmd, mesh);
                self.rec.stats.draw_calls += 1;
                self.rec.log.push(format!("draw.model.{name}#{n}"));
            }
        }
    }

    fn draw_effects(&mut self, frame: ActiveFrame, render_pass: vk::RenderPass, queues: &RenderQueues) {
        let mut fx = std::mem::take(&mut self.effects);
        fx.clear();
        let view = self.frame.view;
        let entities = &self.frame.refdef.entities;

        let cylinder = self.config.beam_style != 0;
        for &i in &queues.beams {
            fx.push_beam(&BeamPrimitive::from_entity(&entities[i]), &view, cylinder);
        }
        for p in &self.frame.refdef.particles {
            fx.push_particle(p, &self.palette, &view, self.config.part_scale);
        }
        if self.config.flares {
            for &i in &queues.flares {
                fx.push_flare(&FlarePrimitive::from_entity(&entities[i]), &view);
            }
        }
        for line in &self.frame.refdef.debug_lines {
            fx.push_line(line);
        }

        self.rec.stats.beams = fx.counts.beams;
        self.rec.stats.particles = fx.counts.particles;
        self.rec.stats.flares = fx.counts.flares;
        self.rec.stats.debug_lines = fx.counts.lines;

        let beam_kind = if cylinder { DrawKind::BeamCylinder } else { DrawKind::BeamSimple };
        let particle_kind = if self.config.particle_style != 0 { DrawKind::ParticleAdd } else { DrawKind::ParticleAlpha };
        self.draw_stream(
            frame,
            render_pass,
            beam_kind,
            "fx.beams",
            bytemuck::cast_slice(&fx.beams.vertices),
            fx.beams.vertices.len(),
            &fx.beams.indices,
        );
        self.draw_stream(
            frame,
            render_pass,
            particle_kind,
            "fx.particles",
            bytemuck::cast_slice(&fx.particles.vertices),
            fx.particles.vertices.len(),
            &fx.particles.indices,
        );
        if self.config.flares {
            self.draw_stream(
                frame,
                render_pass,
                DrawKind::Flare,
                "fx.flares",
                bytemuck::cast_slice(&fx.flares.vertices),
                fx.flares.vertices.len(),
                &fx.flares.indices,
            );
        }
        self.effects = fx;
    }

    fn draw_debug_lines(&mut self, frame: ActiveFrame, render_pass: vk::RenderPass) {
        let fx = std::mem::take(&mut self.effects);
        self.draw_stream(
            frame,
            render_pass,
            DrawKind::DebugLineDepth,
            "debug.lines.depth",
            bytemuck::cast_slice(&fx.lines_depth),
            fx.lines_depth.len(),
            &[],
        );
        self.draw_stream(
            frame,
            render_pass,
            DrawKind::DebugLineNoDepth,
            "debug.lines.nodepth",
            bytemuck::cast_slice(&fx.lines_nodepth),
            fx.lines_nodepth.len(),
            &[],
        );
        self.effects = fx;
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_stream(
        &mut self,
        frame: ActiveFrame,
        render_pass: vk::RenderPass,
        kind: DrawKind,
        label: &str,
        vertices: &[u8],
        vertex_count: usize,
        indices: &[u16],
    ) {
        if vertex_count == 0 {
            return;
        }
        self.rec.log.push(label.into());
        let key = PipelineKey::new(kind, self.frame.features());
        if !self.rec.bind_pipeline(frame.cmd, key, render_pass) {
            return;
        }
        let constants = DrawConstants::with_matrix(self.frame.view.view_proj);
        self.rec.gpu.push_constants(frame.cmd, bytemuck::bytes_of(&constants));
        let white = self.rec.resources.texture_set(self.rec.resources.white());
        self.rec.gpu.bind_texture(frame.cmd, white);
        let draw = StreamDraw { vertices, vertex_count: vertex_count as u32, indices };
        match self.rec.gpu.draw_stream(frame.cmd, frame.slot, draw) {
            Ok(()) => self.rec.stats.draw_calls += 1,
            Err(e) => {
                if self.misuse.first(label) {
                    warn!("{label} dropped: {e}");
                }
            }
        }
    }

    pub fn end_frame(&mut self) -> VkResult<()> {
        let Some(frame) = self.active else {
            if self.misuse.first("end_frame") {
                warn!("end_frame without begin_frame");
            }
            return Ok(());
        };
        self.end_2d(frame);
        self.close_pass(frame.cmd);
        self.active = None;
        self.rec.log.push("frame.end".into());

        let Some(targets) = self.swapchain.targets() else {
            self.apply_shader_dir();
            return Ok(());
        };
        let presented = self.frames.end(&mut self.rec.gpu, targets);
        self.apply_shader_dir();
        let presented = presented?;
        if presented == End::Stale || self.resize_pending {
            self.rebuild()?;
        }
        Ok(())
    }

    pub fn light_point(&self, origin: Vec3) -> Vec3 {
        self.frame.light_point(origin)
    }

    pub fn video_sync(&self) -> bool {
        self.frames.video_sync(&self.rec.gpu)
    }

    pub fn begin_registration(&mut self, map: &str) {
        self.rec.resources.begin_registration(map);
    }

    pub fn register_model(&mut self, name: &str) -> ModelHandle {
        self.rec.resources.register_model(&mut self.rec.gpu, name)
    }

    pub fn register_image(&mut self, name: &str, ty: ImageType, flags: ImageFlags) -> ImageHandle {
        self.rec.resources.register_image(&mut self.rec.gpu, name, ty, flags)
    }

    pub fn end_registration(&mut self) {
        if self.active.is_some() {
            warn!("end_registration during a frame ignored");
            return;
        }
        self.rec.resources.end_registration(&mut self.rec.gpu);
        self.rec.resources.ensure_white_texture(&mut self.rec.gpu);
    }

    pub fn image_size(&self, pic: ImageHandle) -> Option<(u32, u32, bool)> {
        self.rec.resources.image_size(pic)
    }

    fn flush_2d(&mut self, frame: ActiveFrame) {
        let render_pass = self.render_pass();
        let extent = self.extent();
        let rec = &mut self.rec;
        self.batcher.flush(&mut |batch| rec.draw_batch(frame, render_pass, extent, batch));
    }

    fn end_2d(&mut self, frame: ActiveFrame) {
        let render_pass = self.render_pass();
        let extent = self.extent();
        let rec = &mut self.rec;
        self.batcher.end(&mut |batch| rec.draw_batch(frame, render_pass, extent, batch));
    }

    fn apply_clip(&mut self, frame: ActiveFrame) {
        let extent = self.extent();
        let rect = self
            .clip
            .and_then(|clip| draw2d::scale_clip(&clip, self.scale, extent))
            .unwrap_or_else(|| draw2d::full_rect(extent));
        self.rec.gpu.set_scissor(frame.cmd, rect);
    }

    fn submit_quad(&mut self, quad: Quad) {
        let Some(frame) = self.active else {
            if self.misuse.first("draw2d") {
                warn!("2D draw outside a frame ignored");
            }
            return;
        };
        let render_pass = self.render_pass();
        let extent = self.extent();
        let rec = &mut self.rec;
        self.batcher.submit_quad(&quad, &mut |batch| rec.draw_batch(frame, render_pass, extent, batch));
    }

    fn stretch(&mut self, x: f32, y: f32, w: f32, h: f32, uvs: [[f32; 2]; 4], color: Color, texture: ImageHandle) {
        let positions = draw2d::make_quad(x, y, w, h, self.scale);
        self.submit_quad(Quad { positions, uvs, color, texture });
    }

    fn white(&self) -> ImageHandle {
        self.rec.resources.white()
    }
}

impl<G: Gpu> Draw2D for RendererCore<G> {
    fn set_clip_rect(&mut self, clip: Option<ClipRect>) {
        if let Some(frame) = self.active {
            self.flush_2d(frame);
            self.clip = clip;
            self.apply_clip(frame);
        } else {
            self.clip = clip;
        }
    }

    fn set_scale(&mut self, scale: f32) {
        let scale = draw2d::clamp_scale(scale);
        if scale == self.scale {
            return;
        }
        if let Some(frame) = self.active {
            self.flush_2d(frame);
            self.scale = scale;
            self.apply_clip(frame);
        } else {
            self.scale = scale;
        }
    }

    fn auto_scale(&self) -> i32 {
        let extent = self.extent();
        draw2d::auto_scale(extent.width, extent.height)
    }

    fn draw_pic(&mut self, x: i32, y: i32, color: Color, pic: ImageHandle) {
        let Some((w, h, _)) = self.image_size(pic) else {
            if self.misuse.first(format!("pic:{}", pic.0)) {
                warn!("draw_pic with unknown image {}", pic.0);
            }
            return;
        };
        self.draw_stretch_pic(x, y, w as i32, h as i32, color, pic);
    }

    fn draw_stretch_pic(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color, pic: ImageHandle) {
        self.stretch(x as f32, y as f32, w as f32, h as f32, FULL_UVS, color, pic);
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
        let positions = draw2d::rotated_quad(
            x as f32,
            y as f32,
            w as f32,
            h as f32,
            angle,
            pivot_x as f32,
            pivot_y as f32,
            self.scale,
        );
        self.submit_quad(Quad { positions, uvs: FULL_UVS, color, texture: pic });
    }

    fn draw_keep_aspect_pic(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color, pic: ImageHandle) {
        let uvs = match self.image_size(pic) {
            Some((iw, ih, _)) => draw2d::keep_aspect_uvs(w as f32, h as f32, iw, ih),
            None => FULL_UVS,
        };
        self.stretch(x as f32, y as f32, w as f32, h as f32, uvs, color, pic);
    }

    fn draw_char(&mut self, x: i32, y: i32, flags: CharFlags, ch: u8, color: Color, font: ImageHandle) {
        let ch = if flags.contains(CharFlags::ALTCOLOR) { ch | 0x80 } else { ch };
        if ch & 0x7f == b' ' {
            return;
        }
        let size = CHAR_SIZE as f32;
        let uvs = draw2d::glyph_uvs(ch);
        if flags.contains(CharFlags::DROPSHADOW) {
            let shadow = Color::rgba(0, 0, 0, color.alpha());
            self.stretch((x + 1) as f32, (y + 1) as f32, size, size, uvs, shadow, font);
        }
        self.stretch(x as f32, y as f32, size, size, uvs, color, font);
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
        let mut x = x;
        for ch in text.bytes().take(max_chars) {
            self.draw_char(x, y, flags, ch, color, font);
            x += CHAR_SIZE;
        }
        x
    }

    fn tile_clear(&mut self, x: i32, y: i32, w: i32, h: i32, pic: ImageHandle) {
        let (x, y, w, h) = (x as f32, y as f32, w as f32, h as f32);
        self.stretch(x, y, w, h, draw2d::tile_uvs(x, y, w, h), Color::WHITE, pic);
    }

    fn draw_fill8(&mut self, x: i32, y: i32, w: i32, h: i32, index: u8) {
        let color = self.palette.get(index);
        self.draw_fill32(x, y, w, h, color);
    }

    fn draw_fill32(&mut self, x: i32, y: i32, w: i32, h: i32, color: Color) {
        let white = self.white();
        self.stretch(x as f32, y as f32, w as f32, h as f32, FULL_UVS, color, white);
    }

    fn update_raw_pic(&mut self, width: u32, height: u32, pixels: &[u32]) {
        if let Some(frame) = self.active {
            self.flush_2d(frame);
        }
        let submitted = self.frames.frames_submitted();
        self.rec.resources.update_raw(&mut self.rec.gpu, width, height, pixels, submitted);
    }

    fn draw_stretch_raw(&mut self, x: i32, y: i32, w: i32, h: i32) {
        let raw = self.rec.resources.raw();
        if raw.is_null() {
            return;
        }
        self.stretch(x as f32, y as f32, w as f32, h as f32, FULL_UVS, Color::WHITE, raw);
    }
}

impl<G: Gpu> RendererCore<G> {
    /// Waits for the device and destroys every object created through it.
    /// Runs on drop; calling it earlier is harmless.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.active = None;
        let gpu = &mut self.rec.gpu;
        gpu.wait_idle();
        self.post.destroy(gpu);
        self.frames.destroy(gpu);
        self.rec.pipelines.clear(gpu);
        self.rec.resources.destroy_all(gpu);
        self.swapchain.destroy(gpu);
        info!("renderer shut down");
    }
}

impl<G: Gpu> Drop for RendererCore<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::MemoryShaders;
    use crate::testing::{MemoryLoader, MockGpu};
    use refresh_core::Toggle;
    use refresh_render::{
        DecodedModel, DebugLine, MeshData, MeshVertex, ModelKind, Particle, RdFlags, RenderFlags, SkinRef,
    };

    fn core_with(gpu: MockGpu, config: RenderConfig) -> (RendererCore<MockGpu>, MemoryLoader) {
        let loader = MemoryLoader::default();
        let resources = ResourceStore::new(Box::new(loader.clone()));
        let extent = vk::Extent2D { width: 800, height: 600 };
        let core = RendererCore::new(gpu, extent, config, resources, Box::new(MemoryShaders::all())).unwrap();
        (core, loader)
    }

    fn core() -> (RendererCore<MockGpu>, MemoryLoader) {
        core_with(MockGpu::new(), RenderConfig::default())
    }

    fn model(loader: &MemoryLoader, name: &str) {
        loader.add_model(
            name,
            DecodedModel {
                kind: ModelKind::Alias,
                alias_frames: Vec::new(),
                sprite_frames: Vec::new(),
                meshes: vec![MeshData {
                    vertices: vec![MeshVertex::default(); 3],
                    indices: vec![0, 1, 2],
                    skins: vec![SkinRef { name: "skin".into(), ty: ImageType::Skin, flags: ImageFlags::empty() }],
                }],
            },
        );
    }

    fn at(m: ModelHandle, x: f32, flags: RenderFlags, alpha: f32) -> Entity {
        Entity { model: m, origin: Vec3::new(x, 0.0, 0.0), flags, alpha, ..Default::default() }
    }

    fn stage_order(log: &[String]) -> Vec<&str> {
        log.iter().map(String::as_str).filter(|l| !l.starts_with("bind.") && !l.starts_with("draw.")).collect()
    }

    #[test]
    fn frame_runs_stages_in_order() {
        let (mut r, loader) = core();
        model(&loader, "models/a.md2");
        let m = r.register_model("models/a.md2");
        let fd = RefDef {
            width: 800,
            height: 600,
            entities: vec![
                at(m, 100.0, RenderFlags::empty(), 1.0),
                at(m, 200.0, RenderFlags::TRANSLUCENT, 0.9),
                at(m, 50.0, RenderFlags::TRANSLUCENT | RenderFlags::WEAPONMODEL, 0.9),
                Entity { model: ModelHandle::inline(1), ..Default::default() },
                Entity { flags: RenderFlags::BEAM, frame: 4, old_origin: Vec3::new(0.0, 0.0, 64.0), ..Default::default() },
            ],
            particles: vec![Particle { origin: Vec3::new(300.0, 0.0, 0.0), ..Default::default() }],
            debug_lines: vec![DebugLine { start: Vec3::ZERO, end: Vec3::X, color: Color::WHITE, depth_test: true }],
            ..Default::default()
        };
        assert!(r.begin_frame().unwrap());
        r.render_frame(&fd);
        r.end_frame().unwrap();

        assert_eq!(
            stage_order(r.command_log()),
            vec![
                "frame.begin",
                "world.draw",
                "entities.inline",
                "entities.opaque",
                "entities.alpha_back",
                "fx.beams",
                "fx.particles",
                "entities.alpha_front",
                "debug.lines.depth",
                "post.bloom",
                "frame.end",
            ]
        );
        let stats = r.stats();
        assert_eq!(stats.beams, 1);
        assert_eq!(stats.particles, 1);
        assert_eq!(stats.debug_lines, 1);
        assert_eq!(r.gpu().count("present:"), 1);
        assert_eq!(r.frames().frames_submitted(), 1);
    }

    #[test]
    fn pipeline_rebinds_only_on_key_change() {
        let (mut r, loader) = core();
        model(&loader, "models/a.md2");
        let m = r.register_model("models/a.md2");
        let fd = RefDef { entities: vec![at(m, 10.0, RenderFlags::empty(), 1.0); 3], ..Default::default() };
        r.begin_frame().unwrap();
        r.render_frame(&fd);
        r.end_frame().unwrap();
        let binds: Vec<&String> = r.command_log().iter().filter(|l| l.starts_with("bind.pipeline.alias")).collect();
        assert_eq!(binds.len(), 1);
        assert_eq!(r.gpu().count("draw_mesh"), 3);
        assert_eq!(r.stats().draw_calls, 3);
    }

    #[test]
    fn missing_models_are_skipped() {
        let (mut r, _) = core();
        let fd = RefDef {
            entities: vec![at(ModelHandle(4242), 10.0, RenderFlags::empty(), 1.0), at(ModelHandle::NULL, 0.0, RenderFlags::empty(), 1.0)],
            ..Default::default()
        };
        r.begin_frame().unwrap();
        r.render_frame(&fd);
        r.end_frame().unwrap();
        assert_eq!(r.gpu().count("draw_mesh"), 0);
    }

    #[test]
    fn unavailable_pipeline_skips_draws_without_retrying() {
        let mut gpu = MockGpu::new();
        gpu.fail_pipelines = true;
        let (mut r, loader) = core_with(gpu, RenderConfig::default());
        model(&loader, "models/a.md2");
        let m = r.register_model("models/a.md2");
        let fd = RefDef { entities: vec![at(m, 10.0, RenderFlags::empty(), 1.0)], ..Default::default() };
        for _ in 0..3 {
            r.begin_frame().unwrap();
            r.render_frame(&fd);
            r.end_frame().unwrap();
        }
        assert_eq!(r.gpu().count("draw_mesh"), 0);
        assert_eq!(r.pipelines().builds(), 1);
    }

    #[test]
    fn resize_rebuilds_and_next_frame_uses_new_extent() {
        let (mut r, _) = core();
        r.begin_frame().unwrap();
        r.end_frame().unwrap();
        let old = r.swapchain().targets().unwrap().clone();

        r.gpu_mut().surface.caps.current_extent = vk::Extent2D { width: 1024, height: 768 };
        r.resize(1024, 768).unwrap();
        r.resize(1024, 768).unwrap();

        for fb in &old.framebuffers {
            assert!(!r.gpu().is_live(*fb));
        }
        assert!(!r.gpu().is_live(old.swapchain));
        assert!(r.begin_frame().unwrap());
        r.end_frame().unwrap();
        let t = r.swapchain().targets().unwrap();
        assert_eq!(t.extent, vk::Extent2D { width: 1024, height: 768 });
        assert!(r.gpu().calls.iter().any(|c| c.ends_with(":1024x768") && c.starts_with("begin_pass")));
        assert_eq!(r.post().scene_target().unwrap().extent.width, 1024);
    }

    #[test]
    fn stale_acquire_abandons_frame_and_rebuilds() {
        let (mut r, _) = core();
        r.gpu_mut().acquire_script.push_back(crate::gpu::Acquire::OutOfDate);
        assert!(!r.begin_frame().unwrap());
        assert_eq!(r.swapchain().rebuilds(), 1);
        assert_eq!(r.gpu().count("submit"), 0);
        assert!(r.begin_frame().unwrap());
        r.end_frame().unwrap();
        assert_eq!(r.gpu().count("submit"), 1);
    }

    #[test]
    fn stale_present_rebuilds_after_submit() {
        let (mut r, _) = core();
        r.gpu_mut().present_script.push_back(crate::gpu::Present::Stale);
        r.begin_frame().unwrap();
        r.end_frame().unwrap();
        assert_eq!(r.swapchain().rebuilds(), 1);
        assert!(r.begin_frame().unwrap());
        r.end_frame().unwrap();
    }

    #[test]
    fn swap_interval_change_rebuilds_on_next_frame() {
        let (mut r, _) = core();
        let mut cfg = r.config().clone();
        cfg.swap_interval = 0;
        r.set_config(cfg);
        r.begin_frame().unwrap();
        r.end_frame().unwrap();
        assert_eq!(r.swapchain().rebuilds(), 1);
        assert_eq!(r.gpu().last_swapchain.unwrap().present_mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn shader_dir_change_mid_frame_lands_at_end_frame() {
        let (mut r, loader) = core();
        model(&loader, "models/a.md2");
        let m = r.register_model("models/a.md2");
        assert!(r.begin_frame().unwrap());
        let fd = RefDef { width: 800, height: 600, entities: vec![at(m, 100.0, RenderFlags::empty(), 1.0)], ..Default::default() };
        r.render_frame(&fd);
        assert!(!r.pipelines().is_empty());

        let mut cfg = r.config().clone();
        cfg.shader_dir = PathBuf::from("other-shaders");
        r.set_config(cfg);
        assert!(!r.pipelines().is_empty());
        assert_eq!(r.gpu().pipelines_destroyed, 0);

        r.end_frame().unwrap();
        assert!(r.pipelines().is_empty());
        assert!(r.gpu().pipelines_destroyed > 0);
    }

    #[test]
    fn failed_submit_does_not_stall_later_frames() {
        let (mut r, _) = core();
        assert!(r.begin_frame().unwrap());
        r.gpu_mut().fail_submit = true;
        assert!(r.end_frame().is_err());
        r.gpu_mut().fail_submit = false;
        assert!(!r.in_frame());
        for _ in 0..3 {
            assert!(r.begin_frame().unwrap());
            r.end_frame().unwrap();
        }
    }

    #[test]
    fn post_process_redirects_and_blits() {
        let (mut r, _) = core();
        let fd = RefDef { rdflags: RdFlags::UNDERWATER, screen_blend: [0.0, 0.0, 1.0, 0.5], ..Default::default() };
        r.begin_frame().unwrap();
        r.render_frame(&fd);
        r.draw_fill32(0, 0, 10, 10, Color::BLACK);
        r.end_frame().unwrap();

        let log = stage_order(r.command_log());
        assert_eq!(log, vec!["frame.begin", "world.draw", "post.waterwarp", "post.bloom", "overlay.blend", "frame.end"]);
        let calls = &r.gpu().calls;
        let blit = r.gpu().position("blit:800x600->800x600").unwrap();
        assert_eq!(r.gpu().count("downsample"), 2);
        assert!(r.gpu().position("downsample").unwrap() < blit);
        let draw2d = calls.iter().rposition(|c| c.starts_with("draw_stream")).unwrap();
        assert!(blit < draw2d);
        assert_eq!(r.gpu().count("begin_pass"), 3);
    }

    #[test]
    fn post_process_off_draws_straight_to_swapchain() {
        let mut cfg = RenderConfig::default();
        cfg.bloom = Toggle::Off;
        let (mut r, _) = core_with(MockGpu::new(), cfg);
        r.begin_frame().unwrap();
        r.render_frame(&RefDef::default());
        r.end_frame().unwrap();
        assert_eq!(r.gpu().count("blit"), 0);
        assert_eq!(r.gpu().count("begin_pass"), 1);
    }

    #[test]
    fn twod_batches_and_misuse() {
        let (mut r, _) = core();
        r.draw_fill32(0, 0, 4, 4, Color::WHITE);
        assert!(r.gpu().stream_draws.is_empty());

        r.begin_frame().unwrap();
        let white = r.resources().white();
        r.draw_fill32(0, 0, 4, 4, Color::WHITE);
        r.draw_fill8(4, 0, 4, 4, 3);
        r.draw_stretch_pic(0, 0, 4, 4, Color::WHITE, ImageHandle(77));
        r.draw_stretch_pic(0, 0, 4, 4, Color::WHITE, white);
        r.end_frame().unwrap();
        assert_eq!(r.gpu().stream_draws.len(), 3);
        assert_eq!(r.gpu().stream_draws[0].1, 8);
    }

    #[test]
    fn clip_and_scale_changes_flush() {
        let (mut r, _) = core();
        r.begin_frame().unwrap();
        r.set_scale(2.0);
        r.draw_fill32(0, 0, 4, 4, Color::WHITE);
        r.set_clip_rect(Some(ClipRect { left: 10, top: 10, right: 20, bottom: 30 }));
        assert_eq!(r.gpu().stream_draws.len(), 1);
        let scissor = *r.gpu().scissors.last().unwrap();
        assert_eq!(scissor.offset, vk::Offset2D { x: 20, y: 20 });
        assert_eq!(scissor.extent, vk::Extent2D { width: 20, height: 40 });
        r.draw_fill32(0, 0, 4, 4, Color::WHITE);
        r.set_scale(2.0);
        assert_eq!(r.gpu().stream_draws.len(), 1);
        r.end_frame().unwrap();
        assert_eq!(r.gpu().stream_draws.len(), 2);
        assert_eq!(r.auto_scale(), 1);
    }

    #[test]
    fn draw_string_advances_and_skips_spaces() {
        let (mut r, _) = core();
        r.begin_frame().unwrap();
        let font = r.resources().white();
        let end = r.draw_string(10, 10, CharFlags::DROPSHADOW, 4, "a b cdef", Color::WHITE, font);
        r.end_frame().unwrap();
        assert_eq!(end, 10 + 4 * CHAR_SIZE);
        // Two glyphs with shadows, one batch.
        assert_eq!(r.gpu().stream_draws, vec![(0, 16, 24)]);
    }

    #[test]
    fn misuse_is_ignored() {
        let (mut r, _) = core();
        r.render_frame(&RefDef::default());
        r.end_frame().unwrap();
        assert!(r.begin_frame().unwrap());
        assert!(!r.begin_frame().unwrap());
        r.end_frame().unwrap();
        assert_eq!(r.gpu().count("submit"), 1);
    }

    #[test]
    fn light_point_uses_the_last_scene() {
        let (mut r, _) = core();
        let fd = RefDef {
            dlights: vec![refresh_render::DLight {
                origin: Vec3::ZERO,
                radius: 64.0 + 255.0,
                color: Vec3::ONE,
                intensity: 1.0,
                cone: [0.0; 4],
            }],
            ..Default::default()
        };
        r.begin_frame().unwrap();
        r.render_frame(&fd);
        r.end_frame().unwrap();
        assert!((r.light_point(Vec3::ZERO) - Vec3::splat(2.0)).length() < 1e-5);
        assert!(!r.video_sync());
        r.gpu_mut().complete_all();
        assert!(r.video_sync());
    }

    #[test]
    fn shutdown_releases_every_handle() {
        let (mut r, loader) = core();
        model(&loader, "models/a.md2");
        let m = r.register_model("models/a.md2");
        r.begin_frame().unwrap();
        r.render_frame(&RefDef { entities: vec![at(m, 10.0, RenderFlags::empty(), 1.0)], ..Default::default() });
        r.update_raw_pic(2, 2, &[0; 4]);
        r.draw_stretch_raw(0, 0, 2, 2);
        r.update_raw_pic(2, 2, &[1; 4]);
        r.end_frame().unwrap();
        assert!(!r.gpu().live.is_empty());
        r.shutdown();
        assert!(r.gpu().live.is_empty());
        assert!(!r.in_frame());
    }
}
