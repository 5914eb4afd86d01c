// src/renderer/storage/mod.rs
//! The GPU resource store.
//!
//! Owns every texture, shader, material, mesh, multimesh, skeleton, light and
//! render target the rasterizer can reference. Resources are addressed by
//! slotmap handles; GPU-side objects are created through the [`GpuContext`]
//! passed into each call. Changes that need an upload are queued and flushed
//! once per frame by [`RasterStorage::update_dirty_resources`].

mod buffer_pool;
mod light;
mod material;
mod mesh;
mod render_target;
mod texture;

use slotmap::SlotMap;

use crate::error::RasterResult;
use crate::gpu::{BufferKind, GpuContext, TextureFormat};

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use light::{DirectionalShadowMode, Light, LightKind};
pub use material::{
    DepthDrawMode, DiffuseModel, Material, Shader, ShaderDesc, ShaderFlags, SpecularModel,
    TextureDecl, TextureHint, UniformDecl,
};
pub use mesh::{Aabb, Mesh, MultiMesh, Skeleton, Surface, SurfaceData, VertexFormat};
pub use render_target::{EffectBuffers, RenderTarget, RenderTargetFlags};
pub use texture::{Texture, TextureData};

slotmap::new_key_type! {
    pub struct TextureHandle;
    pub struct ShaderHandle;
    pub struct MaterialHandle;
    pub struct MeshHandle;
    pub struct MultiMeshHandle;
    pub struct SkeletonHandle;
    pub struct LightHandle;
    pub struct RenderTargetHandle;
}

/// Textures every frame can fall back on when a material leaves a slot empty.
#[derive(Debug, Clone, Copy)]
pub struct DefaultTextures {
    pub white: TextureHandle,
    pub black: TextureHandle,
    pub normal: TextureHandle,
}

#[derive(Default)]
pub struct RasterStorage {
    pub(crate) textures: SlotMap<TextureHandle, Texture>,
    pub(crate) shaders: SlotMap<ShaderHandle, Shader>,
    pub(crate) materials: SlotMap<MaterialHandle, Material>,
    pub(crate) meshes: SlotMap<MeshHandle, Mesh>,
    pub(crate) multimeshes: SlotMap<MultiMeshHandle, MultiMesh>,
    pub(crate) skeletons: SlotMap<SkeletonHandle, Skeleton>,
    pub(crate) lights: SlotMap<LightHandle, Light>,
    pub(crate) render_targets: SlotMap<RenderTargetHandle, RenderTarget>,
    pub(crate) buffers: BufferPool,
    pub(crate) defaults: Option<DefaultTextures>,

    dirty_skeletons: Vec<SkeletonHandle>,
    dirty_multimeshes: Vec<MultiMeshHandle>,
    dirty_materials: Vec<MaterialHandle>,
}

impl RasterStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the 1x1 fallback textures.
    pub fn initialize(&mut self, ctx: &mut dyn GpuContext) -> RasterResult<()> {
        let white = self.solid_texture(ctx, [255, 255, 255, 255])?;
        let black = self.solid_texture(ctx, [0, 0, 0, 255])?;
        let normal = self.solid_texture(ctx, [128, 128, 255, 255])?;
        self.defaults = Some(DefaultTextures {
            white,
            black,
            normal,
        });
        log::debug!("Resource store initialized");
        Ok(())
    }

    pub fn defaults(&self) -> Option<DefaultTextures> {
        self.defaults
    }

    fn solid_texture(
        &mut self,
        ctx: &mut dyn GpuContext,
        rgba: [u8; 4],
    ) -> RasterResult<TextureHandle> {
        let handle = self.texture_create();
        self.texture_allocate(ctx, handle, 1, 1, TextureFormat::Rgba8Unorm, Default::default());
        self.try_texture_set_data(ctx, handle, TextureData::Bytes(&rgba))?;
        Ok(handle)
    }

    /// Uploads every resource changed since the previous flush. Runs once per
    /// frame before the render list is filled.
    pub fn update_dirty_resources(&mut self, ctx: &mut dyn GpuContext) {
        for handle in std::mem::take(&mut self.dirty_skeletons) {
            if let Err(err) = self.flush_skeleton(ctx, handle) {
                log::error!("Skeleton upload failed: {}", err);
            }
        }

        for handle in std::mem::take(&mut self.dirty_multimeshes) {
            if let Err(err) = self.flush_multimesh(ctx, handle) {
                log::error!("Multimesh upload failed: {}", err);
            }
        }

        for handle in std::mem::take(&mut self.dirty_materials) {
            self.flush_material(handle);
        }
    }

    /// Hands out a pooled buffer of at least `size` bytes, rounded up to the
    /// next power of two.
    pub fn buffer_create(
        &mut self,
        ctx: &mut dyn GpuContext,
        kind: BufferKind,
        size: u64,
    ) -> RasterResult<PooledBuffer> {
        self.buffers.acquire(ctx, kind, size)
    }

    pub fn buffer_release(&mut self, buffer: PooledBuffer) {
        self.buffers.release(buffer);
    }

    /// Returns buffers released this frame to the reuse pool.
    pub fn end_frame(&mut self) {
        self.buffers.end_frame();
        for target in self.render_targets.values_mut() {
            target.used_this_frame = false;
        }
    }

    pub(crate) fn mark_skeleton_dirty(&mut self, handle: SkeletonHandle) {
        if !self.dirty_skeletons.contains(&handle) {
            self.dirty_skeletons.push(handle);
        }
    }

    pub(crate) fn mark_multimesh_dirty(&mut self, handle: MultiMeshHandle) {
        if !self.dirty_multimeshes.contains(&handle) {
            self.dirty_multimeshes.push(handle);
        }
    }

    pub(crate) fn mark_material_dirty(&mut self, handle: MaterialHandle) {
        if !self.dirty_materials.contains(&handle) {
            self.dirty_materials.push(handle);
        }
    }

    pub fn pending_updates(&self) -> usize {
        self.dirty_skeletons.len() + self.dirty_multimeshes.len() + self.dirty_materials.len()
    }
}
