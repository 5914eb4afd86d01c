// src/renderer/storage/texture.rs
use half::f16;

use super::{RasterStorage, TextureHandle};
use crate::error::{RasterError, RasterResult};
use crate::gpu::{GpuContext, TextureDesc, TextureFilter, TextureFormat, TextureId};

#[derive(Debug, Clone, Default)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub format: Option<TextureFormat>,
    pub filter: TextureFilter,
    pub(crate) gpu: Option<TextureId>,
    /// Set once the texture has been allocated with a supported format.
    pub(crate) active: bool,
    pub(crate) render_target: bool,
}

impl Texture {
    pub fn is_valid(&self) -> bool {
        self.active && self.gpu.is_some()
    }

    pub fn gpu_id(&self) -> Option<TextureId> {
        if self.active {
            self.gpu
        } else {
            None
        }
    }
}

/// Pixel payload for [`RasterStorage::texture_set_data`].
#[derive(Debug, Clone, Copy)]
pub enum TextureData<'a> {
    Bytes(&'a [u8]),
    /// Float texels. Converted to half floats for `Rgba16Float` targets.
    Floats(&'a [f32]),
}

impl RasterStorage {
    pub fn texture_create(&mut self) -> TextureHandle {
        self.textures.insert(Texture::default())
    }

    /// Allocates GPU storage. An unsupported format leaves the texture
    /// invalid; callers check [`Texture::is_valid`] before use.
    pub fn texture_allocate(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: TextureHandle,
        width: u32,
        height: u32,
        format: TextureFormat,
        filter: TextureFilter,
    ) {
        let Some(texture) = self.textures.get_mut(handle) else {
            log::warn!("texture_allocate on unknown texture");
            return;
        };

        if let Some(old) = texture.gpu.take() {
            ctx.delete_texture(old);
        }
        texture.active = false;
        texture.width = width;
        texture.height = height;
        texture.format = Some(format);
        texture.filter = filter;

        if width == 0 || height == 0 {
            log::error!("Cannot allocate a {}x{} texture", width, height);
            return;
        }

        let desc = TextureDesc {
            width,
            height,
            format,
            filter,
            render_target: texture.render_target,
        };

        match ctx.create_texture(&desc) {
            Ok(id) => {
                texture.gpu = Some(id);
                texture.active = true;
            }
            Err(err) => log::error!("Texture allocation failed: {}", err),
        }
    }

    /// Uploads texels, logging and ignoring malformed data.
    pub fn texture_set_data(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: TextureHandle,
        data: TextureData<'_>,
    ) {
        if let Err(err) = self.try_texture_set_data(ctx, handle, data) {
            log::error!("texture_set_data: {}", err);
        }
    }

    pub(crate) fn try_texture_set_data(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: TextureHandle,
        data: TextureData<'_>,
    ) -> RasterResult<()> {
        let texture = self
            .textures
            .get(handle)
            .ok_or(RasterError::UnknownResource("texture"))?;
        let (Some(id), Some(format)) = (texture.gpu_id(), texture.format) else {
            return Err(RasterError::UnknownResource("allocated texture"));
        };

        match data {
            TextureData::Bytes(bytes) => ctx.write_texture(id, bytes),
            TextureData::Floats(floats) => match format {
                TextureFormat::Rgba16Float => {
                    let halves: Vec<f16> = floats.iter().map(|v| f16::from_f32(*v)).collect();
                    ctx.write_texture(id, bytemuck::cast_slice(&halves))
                }
                TextureFormat::Rgba32Float | TextureFormat::Depth32Float => {
                    ctx.write_texture(id, bytemuck::cast_slice(floats))
                }
                other => {
                    let bytes: Vec<u8> = floats
                        .iter()
                        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                        .collect();
                    if other.is_compressed() {
                        return Err(RasterError::UnsupportedTextureFormat(other));
                    }
                    ctx.write_texture(id, &bytes)
                }
            },
        }
    }

    pub fn texture_free(&mut self, ctx: &mut dyn GpuContext, handle: TextureHandle) {
        if let Some(texture) = self.textures.remove(handle) {
            if let Some(id) = texture.gpu {
                ctx.delete_texture(id);
            }
        }
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle)
    }

    /// GPU texture behind a handle, if it is valid.
    pub fn texture_gpu(&self, handle: TextureHandle) -> Option<TextureId> {
        self.textures.get(handle).and_then(Texture::gpu_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;

    #[test]
    fn unsupported_format_leaves_texture_invalid() {
        let mut ctx = HeadlessContext::new(16, 16);
        let mut storage = RasterStorage::new();
        let handle = storage.texture_create();

        storage.texture_allocate(
            &mut ctx,
            handle,
            64,
            64,
            TextureFormat::Etc2Rgb8Unorm,
            TextureFilter::Linear,
        );

        let texture = storage.texture(handle).expect("texture exists");
        assert!(!texture.is_valid(), "unsupported formats must stay invalid");
        assert_eq!(storage.texture_gpu(handle), None);

        // Uploads to an invalid texture are absorbed.
        storage.texture_set_data(&mut ctx, handle, TextureData::Bytes(&[0u8; 16]));
    }

    #[test]
    fn half_float_upload_is_converted() {
        let mut ctx = HeadlessContext::new(16, 16);
        let mut storage = RasterStorage::new();
        let handle = storage.texture_create();
        storage.texture_allocate(
            &mut ctx,
            handle,
            2,
            1,
            TextureFormat::Rgba16Float,
            TextureFilter::Linear,
        );

        let texels = [0.5f32; 8];
        storage
            .try_texture_set_data(&mut ctx, handle, TextureData::Floats(&texels))
            .expect("eight floats fill a 2x1 half float texture");
    }

    #[test]
    fn reallocation_replaces_gpu_texture() {
        let mut ctx = HeadlessContext::new(16, 16);
        let mut storage = RasterStorage::new();
        let handle = storage.texture_create();
        storage.texture_allocate(&mut ctx, handle, 4, 4, TextureFormat::Rgba8Unorm, TextureFilter::Linear);
        storage.texture_allocate(&mut ctx, handle, 8, 8, TextureFormat::Rgba8Unorm, TextureFilter::Linear);

        assert_eq!(ctx.live_textures(), 1);
        storage.texture_free(&mut ctx, handle);
        assert_eq!(ctx.live_textures(), 0);
    }
}
