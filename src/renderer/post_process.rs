// src/renderer/post_process.rs
//! Full-screen effect chain run after the transparent pass: depth of field
//! (far, then near), glow, then a final composite that applies glow and
//! brightness/contrast/saturation while copying to the output.

use glam::{Vec2, Vec4};

use super::scene_raster::{FrameOutput, SceneRasterizer};
use super::storage::{EffectBuffers, RenderTargetHandle};
use crate::gpu::{DrawCall, FramebufferId, GpuContext, PipelineState, TextureId, Viewport};

pub(crate) const EFFECTS_TEMPLATE: &str = include_str!("shaders/effects.glsl");

const SOURCE_UNIT: u32 = 0;
const GLOW_UNIT: u32 = 1;
const DEPTH_UNIT: u32 = 13;

/// One color buffer of the chain and the framebuffer that writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Buffer {
    texture: TextureId,
    framebuffer: Option<FramebufferId>,
}

/// A single full-screen draw of the effects program.
struct EffectPass<'a> {
    defines: &'a [&'static str],
    source: TextureId,
    glow: Option<TextureId>,
    depth: Option<TextureId>,
    target: Option<FramebufferId>,
    direction: Vec2,
}

impl SceneRasterizer {
    pub(crate) fn post_process(&mut self, ctx: &mut dyn GpuContext, target: RenderTargetHandle, output: &FrameOutput) {
        let Some(effects) = self
            .storage
            .render_target(target)
            .and_then(|target| target.effects())
            .copied()
        else {
            return;
        };
        let EffectBuffers {
            scene_color,
            scene_depth,
            scene_framebuffer,
            color,
            framebuffers,
        } = effects;
        let scene = Buffer {
            texture: scene_color,
            framebuffer: Some(scene_framebuffer),
        };
        let ping = Buffer {
            texture: color[0],
            framebuffer: Some(framebuffers[0]),
        };
        let pong = Buffer {
            texture: color[1],
            framebuffer: Some(framebuffers[1]),
        };

        let environment = self.frame.environment.clone();
        let camera = self.frame.camera;
        ctx.set_viewport(Viewport::new(0, 0, output.width, output.height));
        self.begin_pass();

        let dof = environment.dof;
        let texel = Vec2::new(1.0 / output.width as f32, 1.0 / output.height as f32);
        self.uniforms.set(
            "dof_params",
            Vec4::new(
                dof.far_distance,
                dof.far_distance + dof.far_transition,
                (dof.near_distance - dof.near_transition).max(0.0),
                dof.near_distance,
            ),
        );
        self.uniforms.set(
            "camera_params",
            Vec4::new(
                camera.z_near,
                camera.z_far,
                dof.amount,
                if camera.orthographic { 1.0 } else { 0.0 },
            ),
        );
        let glow = environment.glow;
        self.uniforms.set(
            "glow_params",
            Vec4::new(glow.intensity, glow.strength, glow.bloom, glow.hdr_threshold),
        );
        let adjust = environment.adjustments;
        self.uniforms.set(
            "bcs",
            Vec4::new(adjust.brightness, adjust.contrast, adjust.saturation, 0.0),
        );

        // The scene buffer owns the depth attachment sampled by the blurs, so
        // depth of field only ever writes the two ping-pong buffers.
        let mut current = scene;
        for (enabled, define) in [
            (dof.far_enabled, "DOF_FAR_BLUR"),
            (dof.near_enabled, "DOF_NEAR_BLUR"),
        ] {
            if !enabled {
                continue;
            }
            let defines = ["BLUR", define];
            self.effect_pass(ctx, texel, EffectPass {
                defines: &defines,
                source: current.texture,
                glow: None,
                depth: Some(scene_depth),
                target: ping.framebuffer,
                direction: Vec2::X,
            });
            self.effect_pass(ctx, texel, EffectPass {
                defines: &defines,
                source: ping.texture,
                glow: None,
                depth: Some(scene_depth),
                target: pong.framebuffer,
                direction: Vec2::Y,
            });
            current = pong;
        }

        let glow_texture = if glow.enabled {
            let scratch = if current == scene { pong } else { scene };
            self.effect_pass(ctx, texel, EffectPass {
                defines: &["GLOW_BRIGHT_PASS"],
                source: current.texture,
                glow: None,
                depth: None,
                target: ping.framebuffer,
                direction: Vec2::ZERO,
            });
            self.effect_pass(ctx, texel, EffectPass {
                defines: &["BLUR"],
                source: ping.texture,
                glow: None,
                depth: None,
                target: scratch.framebuffer,
                direction: Vec2::X,
            });
            self.effect_pass(ctx, texel, EffectPass {
                defines: &["BLUR"],
                source: scratch.texture,
                glow: None,
                depth: None,
                target: ping.framebuffer,
                direction: Vec2::Y,
            });
            Some(ping.texture)
        } else {
            None
        };

        let defines: &[&'static str] = match (glow_texture.is_some(), adjust.enabled) {
            (true, true) => &["USE_GLOW", "USE_BCS"],
            (true, false) => &["USE_GLOW"],
            (false, true) => &["USE_BCS"],
            (false, false) => &[],
        };
        self.effect_pass(ctx, texel, EffectPass {
            defines,
            source: current.texture,
            glow: glow_texture,
            depth: None,
            target: output.final_framebuffer,
            direction: Vec2::ZERO,
        });
    }

    fn effect_pass(&mut self, ctx: &mut dyn GpuContext, texel: Vec2, pass: EffectPass<'_>) {
        let Some(program) = self.internal.get(ctx, "effects", EFFECTS_TEMPLATE, pass.defines) else {
            return;
        };
        ctx.bind_framebuffer(pass.target);
        if self.pipeline.use_program(ctx, program.id) {
            self.uniforms.mark_all_dirty();
        }
        self.pipeline.apply(ctx, PipelineState::fullscreen());

        self.uniforms.set("pixel_size", texel.extend(pass.direction.x).extend(pass.direction.y));
        self.textures.bind(ctx, SOURCE_UNIT, Some(pass.source));
        if pass.glow.is_some() {
            self.textures.bind(ctx, GLOW_UNIT, pass.glow);
        }
        if pass.depth.is_some() {
            self.textures.bind(ctx, DEPTH_UNIT, pass.depth);
        }
        self.uniforms.flush(ctx, &program);
        ctx.draw(&DrawCall::fullscreen_triangle());
        self.stats.draw_calls += 1;
    }
}
