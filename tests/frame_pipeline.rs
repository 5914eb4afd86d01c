use std::collections::HashMap;

use glam::{Mat4, Vec3, Vec4};
use scene_raster::environment::Environment;
use scene_raster::gpu::{GpuCommand, HeadlessContext, TextureFilter, TextureFormat};
use scene_raster::renderer::primitives;
use scene_raster::renderer::storage::{
    DirectionalShadowMode, LightKind, MeshHandle, RenderTargetHandle, ShaderDesc, ShaderFlags,
    TextureData,
};
use scene_raster::renderer::{EnvironmentHandle, LightInstanceHandle, SceneRasterizer};
use scene_raster::scene::{CameraSetup, VisibleInstance};
use scene_raster::settings::RasterSettings;
use scene_raster::time::ManualTicks;
use scene_raster::RenderStats;

struct Frame {
    ctx: HeadlessContext,
    raster: SceneRasterizer,
    clock: ManualTicks,
    target: RenderTargetHandle,
    cube: MeshHandle,
    ground: MeshHandle,
}

impl Frame {
    fn new(settings: RasterSettings) -> Self {
        scene_raster::init_logging();
        let clock = ManualTicks::new(0);
        let mut ctx = HeadlessContext::new(32, 32);
        let mut raster = SceneRasterizer::new(settings, Box::new(clock.clone()));
        raster.initialize(&mut ctx).expect("rasterizer initializes");

        let storage = raster.storage_mut();
        let target = storage.render_target_create(32, 32);
        let cube = storage.mesh_create();
        storage
            .mesh_add_surface(&mut ctx, cube, primitives::cube())
            .expect("cube uploads");
        let ground = storage.mesh_create();
        storage
            .mesh_add_surface(&mut ctx, ground, primitives::plane(10.0))
            .expect("plane uploads");

        Self {
            ctx,
            raster,
            clock,
            target,
            cube,
            ground,
        }
    }

    fn small() -> Self {
        Self::new(RasterSettings {
            shadow_atlas_size: 1024,
            directional_shadow_size: 512,
            ..RasterSettings::default()
        })
    }

    fn camera() -> CameraSetup {
        CameraSetup::look_at(
            Vec3::new(0.0, 3.0, 6.0),
            Vec3::ZERO,
            Vec3::Y,
            60f32.to_radians(),
            1.0,
            0.1,
            100.0,
        )
    }

    fn instances(&self, lights: Vec<LightInstanceHandle>) -> Vec<VisibleInstance> {
        vec![
            VisibleInstance::mesh(self.ground, Mat4::IDENTITY).with_lights(lights.clone()),
            VisibleInstance::mesh(self.cube, Mat4::from_translation(Vec3::new(0.0, 0.5, 0.0)))
                .with_lights(lights),
        ]
    }

    fn light(&mut self, kind: LightKind, transform: Mat4, configure: impl FnOnce(&mut scene_raster::renderer::storage::Light)) -> LightInstanceHandle {
        let storage = self.raster.storage_mut();
        let light = storage.light_create(kind);
        if let Some(resource) = storage.light_mut(light) {
            configure(resource);
        }
        let instance = self
            .raster
            .light_instance_create(light)
            .expect("light resource exists");
        self.raster.light_instance_set_transform(instance, transform);
        instance
    }

    fn render(
        &mut self,
        instances: &[VisibleInstance],
        lights: &[LightInstanceHandle],
        environment: Option<EnvironmentHandle>,
        atlas: Option<scene_raster::renderer::ShadowAtlasHandle>,
    ) -> RenderStats {
        let stats = self.raster.render_scene(
            &mut self.ctx,
            &Self::camera(),
            instances,
            lights,
            environment,
            atlas,
            self.target,
        );
        self.raster.end_frame();
        stats
    }

    fn environment(&mut self, environment: Environment) -> EnvironmentHandle {
        let handle = self.raster.environment_create();
        *self.raster.environment_mut(handle).expect("environment exists") = environment;
        handle
    }
}

fn sun_transform() -> Mat4 {
    Mat4::from_rotation_x(-1.0)
}

#[test]
fn directional_splits_render_one_pass_each() {
    for (mode, expected) in [
        (DirectionalShadowMode::Orthogonal, 1),
        (DirectionalShadowMode::Parallel2Splits, 2),
        (DirectionalShadowMode::Parallel4Splits, 4),
    ] {
        let mut frame = Frame::small();
        let sun = frame.light(LightKind::Directional, sun_transform(), |light| {
            light.shadow = true;
            light.directional_shadow_mode = mode;
        });
        let instances = frame.instances(Vec::new());

        let stats = frame.render(&instances, &[sun], None, None);
        assert_eq!(stats.shadow_passes, expected, "{mode:?}");
        assert_eq!(stats.opaque_elements, 2);
    }
}

#[test]
fn unshadowed_lights_skip_shadow_passes() {
    let mut frame = Frame::small();
    let sun = frame.light(LightKind::Directional, sun_transform(), |_| {});
    let instances = frame.instances(Vec::new());

    let stats = frame.render(&instances, &[sun], None, None);
    assert_eq!(stats.shadow_passes, 0);
    assert_eq!(stats.draw_calls, 2);
}

#[test]
fn omni_shadow_is_cached_until_the_light_changes() {
    let mut frame = Frame::small();
    let atlas = frame.raster.shadow_atlas_create_configured(&mut frame.ctx);
    let lamp = frame.light(
        LightKind::Omni,
        Mat4::from_translation(Vec3::new(0.0, 2.5, 0.0)),
        |light| {
            light.shadow = true;
            light.range = 6.0;
        },
    );
    let instances = frame.instances(vec![lamp]);

    let first = frame.render(&instances, &[lamp], None, Some(atlas));
    assert_eq!(first.shadow_passes, 2, "both paraboloid halves render");

    frame.clock.advance(16);
    let second = frame.render(&instances, &[lamp], None, Some(atlas));
    assert_eq!(second.shadow_passes, 0);

    let resource = frame
        .raster
        .lights()
        .light_instance(lamp)
        .expect("instance exists")
        .light;
    frame
        .raster
        .storage_mut()
        .light_mut(resource)
        .expect("light exists")
        .energy = 3.0;
    frame.clock.advance(16);
    let third = frame.render(&instances, &[lamp], None, Some(atlas));
    assert_eq!(third.shadow_passes, 2);
}

#[test]
fn local_shadows_need_an_atlas() {
    let mut frame = Frame::small();
    let spot = frame.light(
        LightKind::Spot,
        Mat4::look_at_rh(Vec3::new(0.0, 3.0, 0.0), Vec3::ZERO, Vec3::Z).inverse(),
        |light| light.shadow = true,
    );
    let instances = frame.instances(vec![spot]);

    let stats = frame.render(&instances, &[spot], None, None);
    assert_eq!(stats.shadow_passes, 0);
    assert_eq!(stats.opaque_elements, 2, "one lit element per surface");
}

#[test]
fn post_chain_adds_one_draw_per_effect_pass() {
    let mut frame = Frame::small();
    let instances = frame.instances(Vec::new());
    let plain = frame.render(&instances, &[], None, None);

    let mut glow = Environment::new(Vec4::new(0.1, 0.1, 0.1, 1.0));
    glow.glow.enabled = true;
    let glow = frame.environment(glow);
    let with_glow = frame.render(&instances, &[], Some(glow), None);
    assert_eq!(with_glow.draw_calls, plain.draw_calls + 4);

    let mut everything = Environment::new(Vec4::new(0.1, 0.1, 0.1, 1.0));
    everything.glow.enabled = true;
    everything.dof.far_enabled = true;
    everything.dof.near_enabled = true;
    everything.adjustments.enabled = true;
    let everything = frame.environment(everything);
    frame.ctx.take_commands();
    let full = frame.render(&instances, &[], Some(everything), None);
    assert_eq!(full.draw_calls, plain.draw_calls + 8);

    let output = frame
        .raster
        .storage()
        .render_target(frame.target)
        .and_then(|target| target.framebuffer());
    let last_target = frame.ctx.commands().iter().rev().find_map(|command| match command {
        GpuCommand::BindFramebuffer(target) => Some(*target),
        _ => None,
    });
    assert_eq!(last_target, Some(output), "the composite writes the render target");
}

#[test]
fn sky_draws_after_the_opaque_pass() {
    let mut frame = Frame::small();
    let storage = frame.raster.storage_mut();
    let radiance = storage.texture_create();
    storage.texture_allocate(&mut frame.ctx, radiance, 4, 2, TextureFormat::Rgba16Float, TextureFilter::Linear);
    storage.texture_set_data(&mut frame.ctx, radiance, TextureData::Floats(&[0.5; 4 * 2 * 4]));

    let instances = frame.instances(Vec::new());
    let color = frame.environment(Environment::new(Vec4::new(0.2, 0.3, 0.4, 1.0)));
    let sky = frame.environment(Environment::new(Vec4::ONE).with_sky(radiance));

    let without = frame.render(&instances, &[], Some(color), None);
    let with = frame.render(&instances, &[], Some(sky), None);
    assert_eq!(with.draw_calls, without.draw_calls + 1);
}

#[test]
fn depth_prepass_draws_opaque_geometry_twice() {
    let mut frame = Frame::new(RasterSettings {
        use_depth_prepass: true,
        ..RasterSettings::default()
    });
    let instances = frame.instances(Vec::new());
    let stats = frame.render(&instances, &[], None, None);
    assert_eq!(stats.opaque_elements, 2);
    assert_eq!(stats.draw_calls, 4);
}

#[test]
fn unknown_render_target_degrades_to_an_empty_frame() {
    let mut frame = Frame::small();
    let instances = frame.instances(Vec::new());
    frame.target = RenderTargetHandle::default();

    let stats = frame.render(&instances, &[], None, None);
    assert_eq!(stats.draw_calls, 0);
}

/// Uniform writes issued before each draw, in draw order.
fn uniforms_per_draw(commands: &[GpuCommand]) -> Vec<usize> {
    let mut counts = Vec::new();
    let mut pending = 0;
    for command in commands {
        match command {
            GpuCommand::SetUniform { .. } => pending += 1,
            GpuCommand::Draw(_) => {
                counts.push(pending);
                pending = 0;
            }
            _ => {}
        }
    }
    counts
}

#[test]
fn broken_material_is_skipped_and_the_frame_completes() {
    let mut frame = Frame::small();
    let storage = frame.raster.storage_mut();
    let shader = storage.shader_create(ShaderDesc {
        fragment_code: "albedo = vec3(1.0 +;\n}}".to_string(),
        ..ShaderDesc::default()
    });
    let broken = storage.material_create(shader, HashMap::new());

    let instances = [
        VisibleInstance::mesh(frame.ground, Mat4::IDENTITY),
        VisibleInstance::mesh(frame.cube, Mat4::IDENTITY).with_material_override(broken),
    ];
    let stats = frame.render(&instances, &[], None, None);
    assert_eq!(stats.skipped_elements, 1);
    assert_eq!(stats.draw_calls, 1, "the ground still draws");
}

#[test]
fn full_render_list_drops_the_overflow() {
    let mut frame = Frame::new(RasterSettings {
        render_list_capacity: 2,
        ..RasterSettings::default()
    });
    let sun = frame.light(LightKind::Directional, sun_transform(), |_| {});
    let instances: Vec<_> = (0..3)
        .map(|i| {
            VisibleInstance::mesh(
                frame.cube,
                Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.5, 0.0)),
            )
        })
        .collect();

    let stats = frame.render(&instances, &[sun], None, None);
    assert_eq!(stats.dropped_elements, 1);
    assert_eq!(stats.opaque_elements, 2);
    assert_eq!(stats.draw_calls, 2);
}

#[test]
fn identical_draws_reuse_bound_state() {
    let mut frame = Frame::small();
    let instances: Vec<_> = (0..4)
        .map(|_| VisibleInstance::mesh(frame.cube, Mat4::IDENTITY))
        .collect();
    frame.ctx.take_commands();

    let stats = frame.render(&instances, &[], None, None);
    assert_eq!(stats.draw_calls, 4);
    assert_eq!(stats.program_binds, 1);
    assert_eq!(stats.shader_rebinds, 1);

    let counts = uniforms_per_draw(frame.ctx.commands());
    assert_eq!(counts.len(), 4);
    assert!(counts[0] > 0, "the first draw uploads its uniforms");
    assert_eq!(&counts[1..], &[0, 0, 0]);
    let uses = frame
        .ctx
        .commands()
        .iter()
        .filter(|command| matches!(command, GpuCommand::UseProgram(_)))
        .count();
    assert_eq!(uses, 1);
}

#[test]
fn switching_programs_uploads_everything_again() {
    let mut frame = Frame::small();
    let base = frame.raster.default_material().expect("initialized");
    let storage = frame.raster.storage_mut();
    let shader = storage.material(base).expect("default material exists").shader;
    let mut desc = storage.shader(shader).expect("default shader exists").desc.clone();
    desc.flags |= ShaderFlags::UNSHADED;
    let flat_shader = storage.shader_create(desc);
    let flat = storage.material_create(flat_shader, HashMap::new());

    let instances: Vec<_> = (0..4)
        .map(|i| {
            let instance = VisibleInstance::mesh(frame.cube, Mat4::IDENTITY);
            if i % 2 == 0 {
                instance.with_material_override(flat)
            } else {
                instance
            }
        })
        .collect();
    frame.ctx.take_commands();

    let stats = frame.render(&instances, &[], None, None);
    assert_eq!(stats.draw_calls, 4);
    assert_eq!(stats.program_binds, 2);
    assert_eq!(stats.shader_rebinds, 2);

    let counts = uniforms_per_draw(frame.ctx.commands());
    assert_eq!(counts.len(), 4);
    assert!(counts[0] > 0 && counts[2] > 0, "each new program gets a full upload");
    assert_eq!((counts[1], counts[3]), (0, 0));
}
