// SPDX-License-Identifier: CEPL-1.0
//! Pipeline permutations keyed by draw kind and render features.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use ash::vk;
use bitflags::bitflags;
use tracing::{debug, warn};

use crate::error::{VkError, VkResult};
use crate::gpu::Gpu;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DrawKind {
    InlineBsp,
    Alias,
    Sprite,
    Weapon,
    Draw2D,
    BeamSimple,
    BeamCylinder,
    ParticleAlpha,
    ParticleAdd,
    Flare,
    DebugLineDepth,
    DebugLineNoDepth,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Features: u8 {
        const FOG_GLOBAL = 1 << 0;
        const FOG_HEIGHT = 1 << 1;
        const FOG_SKY    = 1 << 2;
        const PPL        = 1 << 3;
        const DLIGHTS    = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    None,
    Alpha,
    Additive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Triangles,
    Lines,
}

/// Vertex formats the backend knows how to feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexLayout {
    /// `refresh_render::MeshVertex`
    Mesh,
    /// `draw2d::Vertex2D`
    Quad2D,
    /// `effects::EffectVertex`
    Effect,
    /// `effects::LineVertex`
    Line,
}

impl DrawKind {
    pub const ALL: [DrawKind; 12] = [
        DrawKind::InlineBsp,
        DrawKind::Alias,
        DrawKind::Sprite,
        DrawKind::Weapon,
        DrawKind::Draw2D,
        DrawKind::BeamSimple,
        DrawKind::BeamCylinder,
        DrawKind::ParticleAlpha,
        DrawKind::ParticleAdd,
        DrawKind::Flare,
        DrawKind::DebugLineDepth,
        DrawKind::DebugLineNoDepth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DrawKind::InlineBsp => "inline_bsp",
            DrawKind::Alias => "alias",
            DrawKind::Sprite => "sprite",
            DrawKind::Weapon => "weapon",
            DrawKind::Draw2D => "draw2d",
            DrawKind::BeamSimple => "beam.simple",
            DrawKind::BeamCylinder => "beam.cylinder",
            DrawKind::ParticleAlpha => "particle.alpha",
            DrawKind::ParticleAdd => "particle.add",
            DrawKind::Flare => "flare",
            DrawKind::DebugLineDepth => "debug.line.depth",
            DrawKind::DebugLineNoDepth => "debug.line.nodepth",
        }
    }

    /// Feature bits this kind has shader variants for.
    pub fn accepted_features(self) -> Features {
        match self {
            DrawKind::InlineBsp => Features::all(),
            DrawKind::Alias | DrawKind::Sprite | DrawKind::Weapon => {
                Features::FOG_GLOBAL | Features::FOG_HEIGHT | Features::PPL | Features::DLIGHTS
            }
            _ => Features::empty(),
        }
    }

    /// Fixed-function state: blend, depth test, depth write, topology, vertex layout.
    fn fixed_function(self) -> (BlendMode, bool, bool, Topology, VertexLayout) {
        use BlendMode::{Additive, Alpha};
        match self {
            DrawKind::InlineBsp | DrawKind::Alias | DrawKind::Sprite | DrawKind::Weapon => {
                (BlendMode::None, true, true, Topology::Triangles, VertexLayout::Mesh)
            }
            DrawKind::Draw2D => (Alpha, false, false, Topology::Triangles, VertexLayout::Quad2D),
            DrawKind::BeamSimple | DrawKind::BeamCylinder | DrawKind::ParticleAlpha => {
                (Alpha, true, false, Topology::Triangles, VertexLayout::Effect)
            }
            DrawKind::ParticleAdd => (Additive, true, false, Topology::Triangles, VertexLayout::Effect),
            DrawKind::Flare => (Additive, false, false, Topology::Triangles, VertexLayout::Effect),
            DrawKind::DebugLineDepth => (Alpha, true, false, Topology::Lines, VertexLayout::Line),
            DrawKind::DebugLineNoDepth => (Alpha, false, false, Topology::Lines, VertexLayout::Line),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey {
    pub kind: DrawKind,
    pub features: Features,
}

impl PipelineKey {
    /// Drops feature bits the kind has no variant for, so equal draws share a key.
    pub fn new(kind: DrawKind, features: Features) -> Self {
        PipelineKey { kind, features: features & kind.accepted_features() }
    }

    pub fn debug_name(&self) -> String {
        let mut name = self.kind.name().to_string();
        let mut fog = Vec::new();
        if self.features.contains(Features::FOG_GLOBAL) {
            fog.push("global");
        }
        if self.features.contains(Features::FOG_HEIGHT) {
            fog.push("height");
        }
        if !fog.is_empty() {
            name.push_str(&format!(".fog({})", fog.join("|")));
        }
        if self.features.contains(Features::FOG_SKY) {
            name.push_str(".sky(sky)");
        }
        if self.features.contains(Features::PPL) {
            name.push_str(".ppl");
        }
        if self.features.contains(Features::DLIGHTS) {
            name.push_str(".dl");
        }
        name
    }

    pub fn desc(&self) -> PipelineDesc {
        let (blend, depth_test, depth_write, topology, vertex_layout) = self.kind.fixed_function();
        PipelineDesc { name: self.debug_name(), blend, depth_test, depth_write, topology, vertex_layout }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDesc {
    pub name: String,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub topology: Topology,
    pub vertex_layout: VertexLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert.spv",
            ShaderStage::Fragment => "frag.spv",
        }
    }
}

/// Where SPIR-V comes from.
pub trait ShaderSource {
    fn load(&self, name: &str, stage: ShaderStage) -> VkResult<Vec<u32>>;
}

/// Precompiled shaders on disk: `<dir>/vk/<name>.<stage>.spv`, falling back
/// to `<dir>/<name>.<stage>.spv`.
pub struct ShaderDir {
    root: PathBuf,
}

impl ShaderDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ShaderDir { root: root.into() }
    }

    pub fn candidates(&self, name: &str, stage: ShaderStage) -> [PathBuf; 2] {
        let file = format!("{name}.{}", stage.extension());
        [self.root.join("vk").join(&file), self.root.join(file)]
    }
}

fn read_spirv(path: &Path) -> VkResult<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|source| VkError::Shader { path: path.to_path_buf(), source })?;
    ash::util::read_spv(&mut Cursor::new(&bytes[..]))
        .map_err(|source| VkError::Shader { path: path.to_path_buf(), source })
}

impl ShaderSource for ShaderDir {
    fn load(&self, name: &str, stage: ShaderStage) -> VkResult<Vec<u32>> {
        let [primary, fallback] = self.candidates(name, stage);
        if primary.is_file() {
            return read_spirv(&primary);
        }
        read_spirv(&fallback)
    }
}

/// Lazily built pipelines. Failures are cached as `None` and never retried.
pub struct PipelineCache {
    shaders: Box<dyn ShaderSource>,
    entries: HashMap<PipelineKey, Option<vk::Pipeline>>,
    builds: usize,
}

impl PipelineCache {
    pub fn new(shaders: Box<dyn ShaderSource>) -> Self {
        PipelineCache { shaders, entries: HashMap::new(), builds: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of build attempts, successful or not.
    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn set_shader_source(&mut self, shaders: Box<dyn ShaderSource>) {
        self.shaders = shaders;
    }

    pub fn ensure<G: Gpu>(&mut self, gpu: &mut G, key: PipelineKey, render_pass: vk::RenderPass) -> Option<vk::Pipeline> {
        if let Some(cached) = self.entries.get(&key) {
            return *cached;
        }
        self.builds += 1;
        let desc = key.desc();
        let built = self.build(gpu, &desc, render_pass);
        let entry = match built {
            Ok(pipeline) => {
                debug!("pipeline {} ready", desc.name);
                Some(pipeline)
            }
            Err(e) => {
                warn!("pipeline {} unavailable: {e}", desc.name);
                None
            }
        };
        self.entries.insert(key, entry);
        entry
    }

    fn build<G: Gpu>(&self, gpu: &mut G, desc: &PipelineDesc, render_pass: vk::RenderPass) -> VkResult<vk::Pipeline> {
        let vert = self.shaders.load(&desc.name, ShaderStage::Vertex)?;
        let frag = self.shaders.load(&desc.name, ShaderStage::Fragment)?;
        gpu.create_pipeline(desc, &vert, &frag, render_pass)
    }

    /// Destroys every pipeline. Only used on device teardown or when the
    /// swapchain format changes.
    pub fn clear<G: Gpu>(&mut self, gpu: &mut G) {
        for pipeline in self.entries.drain().filter_map(|(_, p)| p) {
            gpu.destroy_pipeline(pipeline);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::testing::MockGpu;

    /// Serves a tiny valid blob for every name except those listed as missing.
    pub(crate) struct MemoryShaders {
        pub missing: Vec<String>,
        pub loads: Rc<Cell<usize>>,
    }

    impl MemoryShaders {
        pub(crate) fn all() -> Self {
            MemoryShaders { missing: Vec::new(), loads: Rc::new(Cell::new(0)) }
        }
    }

    impl ShaderSource for MemoryShaders {
        fn load(&self, name: &str, _stage: ShaderStage) -> VkResult<Vec<u32>> {
            self.loads.set(self.loads.get() + 1);
            if self.missing.iter().any(|m| m == name) {
                return Err(VkError::Shader {
                    path: PathBuf::from(name),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(vec![0x0723_0203, 0, 0, 0, 0])
        }
    }

    #[test]
    fn debug_names_follow_active_bits() {
        let all = Features::all();
        assert_eq!(
            PipelineKey::new(DrawKind::InlineBsp, all).debug_name(),
            "inline_bsp.fog(global|height).sky(sky).ppl.dl"
        );
        assert_eq!(
            PipelineKey::new(DrawKind::Alias, Features::FOG_HEIGHT | Features::FOG_SKY).debug_name(),
            "alias.fog(height)"
        );
        assert_eq!(PipelineKey::new(DrawKind::Flare, all).debug_name(), "flare");
    }

    #[test]
    fn kinds_without_variants_share_one_key() {
        let a = PipelineKey::new(DrawKind::ParticleAdd, Features::PPL);
        let b = PipelineKey::new(DrawKind::ParticleAdd, Features::empty());
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_function_table() {
        let ui = PipelineKey::new(DrawKind::Draw2D, Features::empty()).desc();
        assert!(!ui.depth_test && !ui.depth_write);
        let flare = PipelineKey::new(DrawKind::Flare, Features::empty()).desc();
        assert_eq!(flare.blend, BlendMode::Additive);
        assert!(!flare.depth_test);
        let beam = PipelineKey::new(DrawKind::BeamCylinder, Features::empty()).desc();
        assert!(beam.depth_test && !beam.depth_write);
        let line = PipelineKey::new(DrawKind::DebugLineNoDepth, Features::empty()).desc();
        assert_eq!(line.topology, Topology::Lines);
        assert!(!line.depth_test);
    }

    #[test]
    fn every_kind_has_its_own_name() {
        let mut names: Vec<_> = DrawKind::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DrawKind::ALL.len());
    }

    #[test]
    fn repeated_requests_hit_the_same_pipeline() {
        let mut gpu = MockGpu::new();
        let mut cache = PipelineCache::new(Box::new(MemoryShaders::all()));
        let key = PipelineKey::new(DrawKind::Alias, Features::PPL | Features::DLIGHTS);
        let pass = gpu.fake_render_pass();
        let first = cache.ensure(&mut gpu, key, pass);
        let second = cache.ensure(&mut gpu, key, pass);
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(gpu.pipelines_created, 1);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn failed_key_is_not_retried() {
        let mut gpu = MockGpu::new();
        let shaders = MemoryShaders { missing: vec!["flare".into()], loads: Rc::new(Cell::new(0)) };
        let loads = shaders.loads.clone();
        let mut cache = PipelineCache::new(Box::new(shaders));
        let key = PipelineKey::new(DrawKind::Flare, Features::empty());
        let pass = gpu.fake_render_pass();
        for _ in 0..5 {
            assert_eq!(cache.ensure(&mut gpu, key, pass), None);
        }
        assert_eq!(cache.builds(), 1);
        assert_eq!(loads.get(), 1);
        assert_eq!(gpu.pipelines_created, 0);
    }

    #[test]
    fn gpu_failure_is_cached_as_unavailable() {
        let mut gpu = MockGpu::new();
        gpu.fail_pipelines = true;
        let mut cache = PipelineCache::new(Box::new(MemoryShaders::all()));
        let key = PipelineKey::new(DrawKind::Sprite, Features::empty());
        let pass = gpu.fake_render_pass();
        assert_eq!(cache.ensure(&mut gpu, key, pass), None);
        gpu.fail_pipelines = false;
        assert_eq!(cache.ensure(&mut gpu, key, pass), None);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn shader_dir_prefers_vk_subdirectory() {
        let dir = ShaderDir::new("shaders");
        let [primary, fallback] = dir.candidates("alias.ppl", ShaderStage::Vertex);
        assert_eq!(primary, PathBuf::from("shaders/vk/alias.ppl.vert.spv"));
        assert_eq!(fallback, PathBuf::from("shaders/alias.ppl.vert.spv"));
    }

    #[test]
    fn clear_destroys_built_pipelines() {
        let mut gpu = MockGpu::new();
        let mut cache = PipelineCache::new(Box::new(MemoryShaders::all()));
        let pass = gpu.fake_render_pass();
        for kind in [DrawKind::Alias, DrawKind::Draw2D] {
            cache.ensure(&mut gpu, PipelineKey::new(kind, Features::empty()), pass);
        }
        cache.clear(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.pipelines_destroyed, 2);
    }
}
