// src/renderer/storage/render_target.rs
use bitflags::bitflags;
use glam::Vec4;

use super::{RasterStorage, RenderTargetHandle};
use crate::error::RasterResult;
use crate::gpu::{
    FramebufferDesc, FramebufferId, GpuContext, TextureDesc, TextureFilter, TextureFormat,
    TextureId,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderTargetFlags: u32 {
        const TRANSPARENT = 1 << 0;
        /// Skips post-processing even when the environment asks for it.
        const NO_3D_EFFECTS = 1 << 1;
        /// Renders straight into the presentation surface.
        const DIRECT_TO_SCREEN = 1 << 2;
    }
}

/// Intermediate buffers used when post effects are active: the scene renders
/// into `scene_*`, the effect chain ping-pongs between `color[0]` and
/// `color[1]`.
#[derive(Debug, Clone, Copy)]
pub struct EffectBuffers {
    pub scene_color: TextureId,
    pub scene_depth: TextureId,
    pub scene_framebuffer: FramebufferId,
    pub color: [TextureId; 2],
    pub framebuffers: [FramebufferId; 2],
}

#[derive(Debug, Clone, Default)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    pub flags: RenderTargetFlags,
    pub clear_color: Vec4,
    pub(crate) used_this_frame: bool,
    pub(crate) color: Option<TextureId>,
    pub(crate) depth: Option<TextureId>,
    pub(crate) framebuffer: Option<FramebufferId>,
    pub(crate) effects: Option<EffectBuffers>,
}

impl RenderTarget {
    pub fn is_used_this_frame(&self) -> bool {
        self.used_this_frame
    }

    /// Color texture holding the rendered image, for off-screen targets.
    pub fn color_texture(&self) -> Option<TextureId> {
        self.color
    }

    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.framebuffer
    }

    pub fn effects(&self) -> Option<&EffectBuffers> {
        self.effects.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.framebuffer.is_some() || self.flags.contains(RenderTargetFlags::DIRECT_TO_SCREEN)
    }
}

impl RasterStorage {
    pub fn render_target_create(&mut self, width: u32, height: u32) -> RenderTargetHandle {
        self.render_targets.insert(RenderTarget {
            width,
            height,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            ..RenderTarget::default()
        })
    }

    pub fn render_target(&self, handle: RenderTargetHandle) -> Option<&RenderTarget> {
        self.render_targets.get(handle)
    }

    /// Resizes, dropping GPU storage so it is recreated on next use.
    pub fn render_target_set_size(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: RenderTargetHandle,
        width: u32,
        height: u32,
    ) {
        let Some(target) = self.render_targets.get_mut(handle) else {
            return;
        };
        if target.width == width && target.height == height {
            return;
        }
        release_target(ctx, target);
        target.width = width;
        target.height = height;
    }

    pub fn render_target_set_flag(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: RenderTargetHandle,
        flag: RenderTargetFlags,
        enabled: bool,
    ) {
        let Some(target) = self.render_targets.get_mut(handle) else {
            return;
        };
        if target.flags.contains(flag) == enabled {
            return;
        }
        release_target(ctx, target);
        target.flags.set(flag, enabled);
    }

    pub fn render_target_set_clear_color(&mut self, handle: RenderTargetHandle, color: Vec4) {
        if let Some(target) = self.render_targets.get_mut(handle) {
            target.clear_color = color;
        }
    }

    pub fn render_target_was_used(&self, handle: RenderTargetHandle) -> bool {
        self.render_targets
            .get(handle)
            .is_some_and(|target| target.used_this_frame)
    }

    pub fn render_target_clear_used(&mut self, handle: RenderTargetHandle) {
        if let Some(target) = self.render_targets.get_mut(handle) {
            target.used_this_frame = false;
        }
    }

    /// Lazily creates the target's framebuffer and, when `with_effects` is
    /// set, the intermediate effect buffers. Marks the target used.
    pub(crate) fn render_target_prepare(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: RenderTargetHandle,
        with_effects: bool,
    ) -> RasterResult<()> {
        let Some(target) = self.render_targets.get_mut(handle) else {
            return Err(crate::error::RasterError::UnknownResource("render target"));
        };
        target.used_this_frame = true;
        let (width, height) = (target.width.max(1), target.height.max(1));

        if !target.flags.contains(RenderTargetFlags::DIRECT_TO_SCREEN) && target.framebuffer.is_none()
        {
            let color = ctx.create_texture(&TextureDesc {
                width,
                height,
                format: TextureFormat::Rgba8Unorm,
                filter: TextureFilter::Linear,
                render_target: true,
            })?;
            let depth = ctx.create_texture(&depth_desc(width, height))?;
            target.framebuffer = Some(ctx.create_framebuffer(&FramebufferDesc {
                color: Some(color),
                depth: Some(depth),
            })?);
            target.color = Some(color);
            target.depth = Some(depth);
        }

        if with_effects && target.effects.is_none() {
            target.effects = Some(create_effect_buffers(ctx, width, height)?);
        }
        Ok(())
    }
}

fn depth_desc(width: u32, height: u32) -> TextureDesc {
    TextureDesc {
        width,
        height,
        format: TextureFormat::Depth32Float,
        filter: TextureFilter::Nearest,
        render_target: true,
    }
}

fn create_effect_buffers(
    ctx: &mut dyn GpuContext,
    width: u32,
    height: u32,
) -> RasterResult<EffectBuffers> {
    let hdr = |ctx: &mut dyn GpuContext| {
        ctx.create_texture(&TextureDesc {
            width,
            height,
            format: TextureFormat::Rgba16Float,
            filter: TextureFilter::Linear,
            render_target: true,
        })
    };

    let scene_color = hdr(ctx)?;
    let scene_depth = ctx.create_texture(&depth_desc(width, height))?;
    let scene_framebuffer = ctx.create_framebuffer(&FramebufferDesc {
        color: Some(scene_color),
        depth: Some(scene_depth),
    })?;

    let color = [hdr(ctx)?, hdr(ctx)?];
    let framebuffers = [
        ctx.create_framebuffer(&FramebufferDesc {
            color: Some(color[0]),
            depth: None,
        })?,
        ctx.create_framebuffer(&FramebufferDesc {
            color: Some(color[1]),
            depth: None,
        })?,
    ];

    log::debug!("Created {}x{} effect buffers", width, height);
    Ok(EffectBuffers {
        scene_color,
        scene_depth,
        scene_framebuffer,
        color,
        framebuffers,
    })
}

fn release_target(ctx: &mut dyn GpuContext, target: &mut RenderTarget) {
    if let Some(fb) = target.framebuffer.take() {
        ctx.delete_framebuffer(fb);
    }
    for texture in [target.color.take(), target.depth.take()].into_iter().flatten() {
        ctx.delete_texture(texture);
    }
    if let Some(effects) = target.effects.take() {
        ctx.delete_framebuffer(effects.scene_framebuffer);
        for fb in effects.framebuffers {
            ctx.delete_framebuffer(fb);
        }
        ctx.delete_texture(effects.scene_color);
        ctx.delete_texture(effects.scene_depth);
        for texture in effects.color {
            ctx.delete_texture(texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;

    #[test]
    fn prepare_allocates_lazily_and_resize_releases() {
        let mut ctx = HeadlessContext::new(64, 64);
        let mut storage = RasterStorage::new();
        let target = storage.render_target_create(32, 32);

        assert!(!storage.render_target(target).is_some_and(RenderTarget::is_allocated));
        storage
            .render_target_prepare(&mut ctx, target, true)
            .expect("allocation succeeds");
        assert!(storage.render_target_was_used(target));
        assert_eq!(
            ctx.live_textures(),
            6,
            "color, depth, scene color, scene depth, two effect buffers"
        );

        storage.render_target_set_size(&mut ctx, target, 16, 16);
        assert_eq!(ctx.live_textures(), 0);

        storage.end_frame();
        assert!(!storage.render_target_was_used(target));
    }

    #[test]
    fn direct_to_screen_targets_skip_framebuffer_creation() {
        let mut ctx = HeadlessContext::new(64, 64);
        let mut storage = RasterStorage::new();
        let target = storage.render_target_create(64, 64);
        storage.render_target_set_flag(&mut ctx, target, RenderTargetFlags::DIRECT_TO_SCREEN, true);

        storage
            .render_target_prepare(&mut ctx, target, false)
            .expect("nothing to allocate");
        let target = storage.render_target(target).expect("exists");
        assert!(target.is_allocated());
        assert!(target.framebuffer().is_none());
    }
}
