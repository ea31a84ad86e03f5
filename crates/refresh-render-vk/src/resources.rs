// SPDX-License-Identifier: CEPL-1.0
//! Handle-addressed image and model records with generation-based cleanup.
//!
//! Records live in tables keyed by handle; name lookups map both the
//! requested and the canonical (decoded) name to the same handle. Handles
//! come from a counter that only grows, so a handle that outlived its record
//! simply fails to resolve.

use std::collections::HashMap;

use ash::vk;
use refresh_core::LogOnce;
use refresh_render::{
    AliasFrame, AssetLoader, DecodedImage, ImageFlags, ImageHandle, ImageType, ModelHandle, ModelKind,
    SpriteFrame,
};
use tracing::{debug, info, warn};

use crate::error::{VkError, VkResult};
use crate::gpu::{GpuMesh, GpuTexture, Gpu, TextureDesc};
use crate::frame::MAX_FRAMES_IN_FLIGHT;

pub const WHITE_TEXTURE: &str = "__white";
const RAW_TEXTURE: &str = "__raw";
const SPRITE_SUFFIXES: [&str; 3] = [".sp2", ".spr", ".sprite"];

#[derive(Clone, Debug)]
pub struct ImageRecord {
    pub handle: ImageHandle,
    pub name: String,
    pub ty: ImageType,
    pub flags: ImageFlags,
    pub width: u32,
    pub height: u32,
    pub upload_width: u32,
    pub upload_height: u32,
    pub transparent: bool,
    pub sequence: u32,
    pub texture: GpuTexture,
}

#[derive(Clone, Debug)]
pub struct MeshRecord {
    pub mesh: GpuMesh,
    /// Never null; failed skins point at the white texture.
    pub skins: Vec<ImageHandle>,
}

#[derive(Clone, Debug)]
pub struct ModelRecord {
    pub handle: ModelHandle,
    pub name: String,
    pub kind: ModelKind,
    pub frame_count: usize,
    pub alias_frames: Vec<AliasFrame>,
    pub sprite_frames: Vec<SpriteFrame>,
    pub meshes: Vec<MeshRecord>,
    pub sequence: u32,
}

impl ModelRecord {
    pub fn is_sprite(&self) -> bool {
        self.kind == ModelKind::Sprite
    }
}

pub fn is_sprite_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SPRITE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// `*N` names an inline brush model.
fn parse_inline(name: &str) -> Option<Option<ModelHandle>> {
    let index = name.strip_prefix('*')?;
    Some(index.parse::<u32>().ok().filter(|&i| i < i32::MAX as u32).map(ModelHandle::inline))
}

pub struct ResourceStore {
    loader: Box<dyn AssetLoader>,
    images: HashMap<i32, ImageRecord>,
    image_names: HashMap<String, i32>,
    models: HashMap<i32, ModelRecord>,
    model_names: HashMap<String, i32>,
    next_handle: i32,
    sequence: u32,
    map: String,
    white: ImageHandle,
    raw: ImageHandle,
    /// Textures replaced mid-frame, with the submission count they become free at.
    retired: Vec<(u64, GpuTexture)>,
    failures: LogOnce,
}

impl ResourceStore {
    pub fn new(loader: Box<dyn AssetLoader>) -> Self {
        ResourceStore {
            loader,
            images: HashMap::new(),
            image_names: HashMap::new(),
            models: HashMap::new(),
            model_names: HashMap::new(),
            next_handle: 1,
            sequence: 0,
            map: String::new(),
            white: ImageHandle::NULL,
            raw: ImageHandle::NULL,
            retired: Vec::new(),
            failures: LogOnce::new(),
        }
    }

    fn alloc_handle(&mut self) -> i32 {
        let h = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        h
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn map_name(&self) -> &str {
        &self.map
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn image(&self, handle: ImageHandle) -> Option<&ImageRecord> {
        self.images.get(&handle.0)
    }

    pub fn model(&self, handle: ModelHandle) -> Option<&ModelRecord> {
        if handle.is_null() || handle.is_inline() {
            return None;
        }
        self.models.get(&handle.0)
    }

    pub fn white(&self) -> ImageHandle {
        self.white
    }

    pub fn raw(&self) -> ImageHandle {
        self.raw
    }

    /// Descriptor set for `handle`, falling back to the white texture.
    pub fn texture_set(&self, handle: ImageHandle) -> vk::DescriptorSet {
        self.image(handle)
            .or_else(|| self.image(self.white))
            .map(|r| r.texture.set)
            .unwrap_or_default()
    }

    pub fn image_size(&self, handle: ImageHandle) -> Option<(u32, u32, bool)> {
        self.image(handle).map(|r| (r.width, r.height, r.transparent))
    }

    pub fn begin_registration(&mut self, map: &str) {
        self.sequence = self.sequence.wrapping_add(1);
        self.map = map.to_owned();
        info!("registration {} started for {map}", self.sequence);
    }

    /// Frees every record not touched since [`Self::begin_registration`].
    pub fn end_registration<G: Gpu>(&mut self, gpu: &mut G) {
        let sequence = self.sequence;
        let stale_models: Vec<i32> =
            self.models.iter().filter(|(_, m)| m.sequence != sequence).map(|(&h, _)| h).collect();
        let stale_images: Vec<i32> = self
            .images
            .iter()
            .filter(|(_, i)| i.sequence != sequence && !i.flags.contains(ImageFlags::PERMANENT))
            .map(|(&h, _)| h)
            .collect();
        if stale_models.is_empty() && stale_images.is_empty() {
            return;
        }

        gpu.wait_idle();
        for h in &stale_models {
            if let Some(model) = self.models.remove(h) {
                for mesh in model.meshes {
                    gpu.destroy_mesh(mesh.mesh);
                }
            }
        }
        for h in &stale_images {
            if let Some(image) = self.images.remove(h) {
                gpu.destroy_texture(image.texture);
            }
        }
        self.model_names.retain(|_, h| self.models.contains_key(h));
        self.image_names.retain(|_, h| self.images.contains_key(h));
        if !self.images.contains_key(&self.raw.0) {
            self.raw = ImageHandle::NULL;
        }
        info!("registration {sequence}: freed {} models, {} images", stale_models.len(), stale_images.len());
    }

    /// 1x1 white texture used wherever a draw has no usable image.
    pub fn ensure_white_texture<G: Gpu>(&mut self, gpu: &mut G) -> ImageHandle {
        if self.images.contains_key(&self.white.0) {
            return self.white;
        }
        let decoded = DecodedImage {
            name: None,
            ty: ImageType::Pic,
            flags: ImageFlags::SPECIAL | ImageFlags::PERMANENT,
            width: 1,
            height: 1,
            upload_width: 1,
            upload_height: 1,
            pixels: vec![255; 4],
        };
        self.white = self.insert_image(gpu, WHITE_TEXTURE, &decoded).unwrap_or(ImageHandle::NULL);
        self.white
    }

    pub fn register_image<G: Gpu>(&mut self, gpu: &mut G, name: &str, ty: ImageType, flags: ImageFlags) -> ImageHandle {
        if name.is_empty() {
            return ImageHandle::NULL;
        }
        if let Some(h) = self.touch_image(name) {
            return h;
        }

        let Some(decoded) = self.loader.load_image(name, ty, flags) else {
            if self.failures.first(format!("image:{name}")) {
                warn!("image {name} could not be loaded");
            }
            return ImageHandle::NULL;
        };

        let canonical = decoded.name.clone().unwrap_or_else(|| name.to_owned());
        if canonical != name {
            if let Some(h) = self.touch_image(&canonical) {
                self.image_names.insert(name.to_owned(), h.0);
                return h;
            }
        }

        match self.insert_image(gpu, &canonical, &decoded) {
            Ok(h) => {
                self.image_names.insert(name.to_owned(), h.0);
                h
            }
            Err(e) => {
                if self.failures.first(format!("upload:{canonical}")) {
                    warn!("image {canonical} upload failed: {e}");
                }
                ImageHandle::NULL
            }
        }
    }

    /// Looks up a live image by name and marks it used by this generation.
    fn touch_image(&mut self, name: &str) -> Option<ImageHandle> {
        let h = *self.image_names.get(name)?;
        let record = self.images.get_mut(&h)?;
        record.sequence = self.sequence;
        Some(record.handle)
    }

    fn insert_image<G: Gpu>(&mut self, gpu: &mut G, name: &str, decoded: &DecodedImage) -> VkResult<ImageHandle> {
        let (w, h) = if decoded.upload_width > 0 && decoded.upload_height > 0 {
            (decoded.upload_width, decoded.upload_height)
        } else {
            (decoded.width, decoded.height)
        };
        if w == 0 || h == 0 || decoded.pixels.len() != (w as usize) * (h as usize) * 4 {
            return Err(VkError::Upload(format!(
                "{name}: {} bytes for {w}x{h}",
                decoded.pixels.len()
            )));
        }
        let texture = gpu.upload_texture(&TextureDesc {
            name,
            width: w,
            height: h,
            pixels: &decoded.pixels,
            repeat: decoded.flags.contains(ImageFlags::REPEAT) || decoded.ty == ImageType::Wall,
            nearest: decoded.flags.contains(ImageFlags::NEAREST),
        })?;

        let handle = ImageHandle(self.alloc_handle());
        debug!("image {name} -> {} ({}x{})", handle.0, decoded.width, decoded.height);
        self.images.insert(
            handle.0,
            ImageRecord {
                handle,
                name: name.to_owned(),
                ty: decoded.ty,
                flags: decoded.flags,
                width: if decoded.width > 0 { decoded.width } else { w },
                height: if decoded.height > 0 { decoded.height } else { h },
                upload_width: w,
                upload_height: h,
                transparent: decoded.flags.contains(ImageFlags::TRANSPARENT),
                sequence: self.sequence,
                texture,
            },
        );
        self.image_names.insert(name.to_owned(), handle.0);
        Ok(handle)
    }

    pub fn register_model<G: Gpu>(&mut self, gpu: &mut G, name: &str) -> ModelHandle {
        if name.is_empty() {
            return ModelHandle::NULL;
        }
        if let Some(inline) = parse_inline(name) {
            return inline.unwrap_or_else(|| {
                warn!("bad inline model name {name}");
                ModelHandle::NULL
            });
        }

        if let Some(&h) = self.model_names.get(name) {
            if let Some(model) = self.models.get_mut(&h) {
                model.sequence = self.sequence;
                let skins: Vec<ImageHandle> = model.meshes.iter().flat_map(|m| m.skins.iter().copied()).collect();
                for skin in skins {
                    if let Some(image) = self.images.get_mut(&skin.0) {
                        image.sequence = self.sequence;
                    }
                }
                return ModelHandle(h);
            }
        }

        let Some(decoded) = self.loader.load_model(name) else {
            if self.failures.first(format!("model:{name}")) {
                warn!("model {name} could not be loaded");
            }
            return ModelHandle::NULL;
        };

        let mut meshes: Vec<MeshRecord> = Vec::with_capacity(decoded.meshes.len());
        for data in &decoded.meshes {
            if data.vertices.is_empty() {
                continue;
            }
            let uploaded =
                gpu.upload_mesh(bytemuck::cast_slice(&data.vertices), data.vertices.len() as u32, &data.indices);
            let mesh = match uploaded {
                Ok(mesh) => mesh,
                Err(e) => {
                    if self.failures.first(format!("mesh:{name}")) {
                        warn!("model {name} upload failed: {e}");
                    }
                    for done in meshes.drain(..) {
                        gpu.destroy_mesh(done.mesh);
                    }
                    return ModelHandle::NULL;
                }
            };
            let white = self.ensure_white_texture(gpu);
            let skins = data
                .skins
                .iter()
                .map(|skin| {
                    let h = self.register_image(gpu, &skin.name, skin.ty, skin.flags);
                    if h.is_null() { white } else { h }
                })
                .collect();
            meshes.push(MeshRecord { mesh, skins });
        }

        let kind = if is_sprite_name(name) { ModelKind::Sprite } else { decoded.kind };
        let handle = ModelHandle(self.alloc_handle());
        debug!("model {name} -> {} ({} meshes, {} frames)", handle.0, meshes.len(), decoded.frame_count());
        self.models.insert(
            handle.0,
            ModelRecord {
                handle,
                name: name.to_owned(),
                kind,
                frame_count: decoded.frame_count(),
                alias_frames: decoded.alias_frames,
                sprite_frames: decoded.sprite_frames,
                meshes,
                sequence: self.sequence,
            },
        );
        self.model_names.insert(name.to_owned(), handle.0);
        handle
    }

    /// Replaces the raw (cinematic) picture. `frames_submitted` dates the old
    /// texture so it is only destroyed once no frame in flight can use it.
    pub fn update_raw<G: Gpu>(&mut self, gpu: &mut G, width: u32, height: u32, pixels: &[u32], frames_submitted: u64) {
        let old = self.images.remove(&self.raw.0);
        if let Some(old) = old {
            self.image_names.remove(RAW_TEXTURE);
            self.retired.push((frames_submitted + MAX_FRAMES_IN_FLIGHT as u64, old.texture));
        }
        self.raw = ImageHandle::NULL;
        if width == 0 || height == 0 || pixels.len() != (width as usize) * (height as usize) {
            return;
        }

        let decoded = DecodedImage {
            name: None,
            ty: ImageType::Pic,
            flags: ImageFlags::SPECIAL | ImageFlags::PERMANENT,
            width,
            height,
            upload_width: width,
            upload_height: height,
            pixels: bytemuck::cast_slice(pixels).to_vec(),
        };
        match self.insert_image(gpu, RAW_TEXTURE, &decoded) {
            Ok(h) => self.raw = h,
            Err(e) => {
                if self.failures.first("upload:raw") {
                    warn!("raw picture upload failed: {e}");
                }
            }
        }
    }

    /// Destroys replaced textures whose last possible user has completed.
    pub fn release_retired<G: Gpu>(&mut self, gpu: &mut G, frames_submitted: u64) {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(|(free_at, _)| *free_at <= frames_submitted);
        self.retired = waiting;
        for (_, texture) in ready {
            gpu.destroy_texture(texture);
        }
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Destroys every GPU object. The device must be idle.
    pub fn destroy_all<G: Gpu>(&mut self, gpu: &mut G) {
        for (_, model) in self.models.drain() {
            for mesh in model.meshes {
                gpu.destroy_mesh(mesh.mesh);
            }
        }
        for (_, image) in self.images.drain() {
            gpu.destroy_texture(image.texture);
        }
        for (_, texture) in self.retired.drain(..) {
            gpu.destroy_texture(texture);
        }
        self.model_names.clear();
        self.image_names.clear();
        self.white = ImageHandle::NULL;
        self.raw = ImageHandle::NULL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryLoader, MockGpu};
    use refresh_render::{MeshData, MeshVertex, ModelRef, SkinRef};

    fn store() -> (MockGpu, ResourceStore, MemoryLoader) {
        let loader = MemoryLoader::default();
        let handle = loader.clone();
        (MockGpu::new(), ResourceStore::new(Box::new(loader)), handle)
    }

    fn quad_model(skin: &str) -> refresh_render::DecodedModel {
        refresh_render::DecodedModel {
            kind: ModelKind::Alias,
            alias_frames: vec![AliasFrame::default(); 3],
            sprite_frames: Vec::new(),
            meshes: vec![MeshData {
                vertices: vec![MeshVertex::default(); 4],
                indices: vec![0, 1, 2, 0, 2, 3],
                skins: vec![SkinRef { name: skin.into(), ty: ImageType::Skin, flags: ImageFlags::empty() }],
            }],
        }
    }

    #[test]
    fn same_name_same_handle_single_upload() {
        let (mut gpu, mut rs, loader) = store();
        loader.add_image("pics/conback", 32, 16, ImageFlags::empty());
        rs.begin_registration("base1");
        let a = rs.register_image(&mut gpu, "pics/conback", ImageType::Pic, ImageFlags::empty());
        let b = rs.register_image(&mut gpu, "pics/conback", ImageType::Pic, ImageFlags::empty());
        assert!(!a.is_null());
        assert_eq!(a, b);
        assert_eq!(loader.image_loads(), 1);
        assert_eq!(gpu.textures_uploaded.len(), 1);

        loader.add_model("models/box.md2", quad_model("models/box.pcx"));
        loader.add_image("models/box.pcx", 8, 8, ImageFlags::empty());
        let m1 = rs.register_model(&mut gpu, "models/box.md2");
        let m2 = rs.register_model(&mut gpu, "models/box.md2");
        assert_eq!(m1, m2);
        assert_eq!(loader.model_loads(), 1);
        assert_eq!(gpu.meshes_uploaded, 1);
    }

    #[test]
    fn aliases_share_the_canonical_record() {
        let (mut gpu, mut rs, loader) = store();
        loader.add_alias("pics/a", "pics/a.png", 4, 4);
        loader.add_alias("pics/a.pcx", "pics/a.png", 4, 4);
        let a = rs.register_image(&mut gpu, "pics/a", ImageType::Pic, ImageFlags::empty());
        let b = rs.register_image(&mut gpu, "pics/a.pcx", ImageType::Pic, ImageFlags::empty());
        assert_eq!(a, b);
        assert_eq!(gpu.textures_uploaded.len(), 1);
        assert_eq!(gpu.textures_uploaded[0].0, "pics/a.png");
    }

    #[test]
    fn end_registration_frees_exactly_the_stale_set() {
        let (mut gpu, mut rs, loader) = store();
        for name in ["keep", "drop"] {
            loader.add_image(name, 2, 2, ImageFlags::empty());
        }
        loader.add_model("models/old.md2", quad_model("missing_skin"));
        let white = rs.ensure_white_texture(&mut gpu);

        rs.begin_registration("base1");
        let keep = rs.register_image(&mut gpu, "keep", ImageType::Pic, ImageFlags::empty());
        let drop = rs.register_image(&mut gpu, "drop", ImageType::Pic, ImageFlags::empty());
        let model = rs.register_model(&mut gpu, "models/old.md2");
        rs.end_registration(&mut gpu);
        assert!(rs.image(drop).is_some());

        rs.begin_registration("base2");
        assert_eq!(rs.register_image(&mut gpu, "keep", ImageType::Pic, ImageFlags::empty()), keep);
        let drop_texture = rs.image(drop).unwrap().texture;
        rs.end_registration(&mut gpu);

        assert!(rs.image(keep).is_some());
        assert!(rs.image(drop).is_none());
        assert!(rs.image_size(drop).is_none());
        assert!(rs.model(model).is_none());
        assert!(rs.image(white).is_some());
        assert!(!gpu.is_live(drop_texture.image));
        assert_eq!(rs.image_count(), 2);

        let again = rs.register_image(&mut gpu, "drop", ImageType::Pic, ImageFlags::empty());
        assert_ne!(again, drop);
        assert_eq!(loader.image_loads(), 4);
    }

    #[test]
    fn model_reregistration_keeps_its_skins_alive() {
        let (mut gpu, mut rs, loader) = store();
        loader.add_model("models/box.md2", quad_model("models/box.pcx"));
        loader.add_image("models/box.pcx", 8, 8, ImageFlags::empty());
        rs.begin_registration("a");
        let m = rs.register_model(&mut gpu, "models/box.md2");
        let skin = rs.model(m).unwrap().meshes[0].skins[0];
        rs.begin_registration("b");
        rs.register_model(&mut gpu, "models/box.md2");
        rs.end_registration(&mut gpu);
        assert!(rs.image(skin).is_some());
        assert_eq!(rs.model(m).unwrap().frame_count, 3);
    }

    #[test]
    fn inline_models_skip_the_loader() {
        let (mut gpu, mut rs, loader) = store();
        let h = rs.register_model(&mut gpu, "*7");
        assert_eq!(h.resolve(), ModelRef::Inline(7));
        assert!(rs.register_model(&mut gpu, "*x").is_null());
        assert_eq!(loader.model_loads(), 0);
        assert!(rs.model(h).is_none());
    }

    #[test]
    fn failures_return_null_handles() {
        let (mut gpu, mut rs, loader) = store();
        assert!(rs.register_image(&mut gpu, "nowhere", ImageType::Pic, ImageFlags::empty()).is_null());
        assert!(rs.register_model(&mut gpu, "nowhere.md2").is_null());
        assert!(rs.register_image(&mut gpu, "", ImageType::Pic, ImageFlags::empty()).is_null());

        loader.add_image("ok", 2, 2, ImageFlags::empty());
        gpu.fail_textures = true;
        assert!(rs.register_image(&mut gpu, "ok", ImageType::Pic, ImageFlags::empty()).is_null());
        assert_eq!(rs.image_count(), 0);
        gpu.fail_textures = false;
        assert!(!rs.register_image(&mut gpu, "ok", ImageType::Pic, ImageFlags::empty()).is_null());

        loader.add_model("models/box.md2", quad_model("ok"));
        gpu.fail_meshes = true;
        assert!(rs.register_model(&mut gpu, "models/box.md2").is_null());
        assert_eq!(rs.model_count(), 0);
    }

    #[test]
    fn short_pixel_payload_is_rejected() {
        let (mut gpu, mut rs, loader) = store();
        loader.insert_image(
            "bad",
            DecodedImage { width: 4, height: 4, pixels: vec![0; 12], ..Default::default() },
        );
        assert!(rs.register_image(&mut gpu, "bad", ImageType::Pic, ImageFlags::empty()).is_null());
        assert!(gpu.textures_uploaded.is_empty());
    }

    #[test]
    fn image_size_reports_decoded_values() {
        let (mut gpu, mut rs, loader) = store();
        loader.insert_image(
            "pics/scaled",
            DecodedImage {
                flags: ImageFlags::TRANSPARENT,
                width: 24,
                height: 12,
                upload_width: 32,
                upload_height: 16,
                pixels: vec![0; 32 * 16 * 4],
                ..Default::default()
            },
        );
        let h = rs.register_image(&mut gpu, "pics/scaled", ImageType::Pic, ImageFlags::empty());
        assert_eq!(rs.image_size(h), Some((24, 12, true)));
        assert_eq!(gpu.textures_uploaded[0], ("pics/scaled".to_string(), 32, 16));
    }

    #[test]
    fn missing_skins_fall_back_to_white() {
        let (mut gpu, mut rs, loader) = store();
        loader.add_model("models/box.md2", quad_model("nope.pcx"));
        let m = rs.register_model(&mut gpu, "models/box.md2");
        assert_eq!(rs.model(m).unwrap().meshes[0].skins, vec![rs.white()]);
        assert_eq!(rs.texture_set(ImageHandle(999)), rs.image(rs.white()).unwrap().texture.set);
    }

    #[test]
    fn sprite_names_pick_the_sprite_kind() {
        let (mut gpu, mut rs, loader) = store();
        loader.add_model("sprites/s_bubble.sp2", quad_model("x"));
        let m = rs.register_model(&mut gpu, "sprites/s_bubble.sp2");
        assert!(rs.model(m).unwrap().is_sprite());
        assert!(is_sprite_name("A.SPR"));
        assert!(!is_sprite_name("a.md2"));
    }

    #[test]
    fn raw_picture_retires_old_textures_after_frames_in_flight() {
        let (mut gpu, mut rs, _) = store();
        rs.update_raw(&mut gpu, 2, 2, &[0xffff_ffff; 4], 10);
        let first = rs.image(rs.raw()).unwrap().texture;
        rs.update_raw(&mut gpu, 2, 2, &[0; 4], 10);
        assert_eq!(rs.retired_len(), 1);
        rs.release_retired(&mut gpu, 11);
        assert!(gpu.is_live(first.image));
        rs.release_retired(&mut gpu, 12);
        assert!(!gpu.is_live(first.image));

        rs.update_raw(&mut gpu, 0, 0, &[], 12);
        assert!(rs.raw().is_null());
        rs.destroy_all(&mut gpu);
        assert!(gpu.live.is_empty());
    }
}
