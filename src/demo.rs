// src/demo.rs
//! A small animated scene driven through [`SceneRasterizer`]: a ground
//! plane, a scatter of spinning props, a sun with split shadows and a few
//! orbiting omni and spot lights. Entities live in a `hecs` world and are
//! turned into [`VisibleInstance`]s every frame.

use std::path::Path;

use glam::{Mat4, Quat, Vec3, Vec4};
use hecs::World;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::environment::{BackgroundMode, Environment};
use crate::gpu::{GpuContext, TextureFilter, TextureFormat};
use crate::renderer::primitives;
use crate::renderer::storage::{
    DirectionalShadowMode, LightKind, MaterialHandle, MeshHandle, RenderTargetFlags,
    RenderTargetHandle, SurfaceData, TextureData, TextureHandle,
};
use crate::renderer::{
    EnvironmentHandle, LightInstanceHandle, MaterialDescriptor, MaterialFeature, SceneRasterizer,
    ShadowAtlasHandle,
};
use crate::scene::{CameraSetup, ShadowCasting, VisibleInstance};

const PROP_COUNT: usize = 24;
const SCATTER_RADIUS: f32 = 9.0;

#[derive(Debug, Clone, Copy)]
pub struct Renderable {
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub radius: f32,
    pub casting: ShadowCasting,
}

#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Placement {
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Spin {
    pub axis: Vec3,
    pub speed: f32,
}

/// An omni or spot light circling the origin.
#[derive(Debug, Clone, Copy)]
pub struct OrbitingLight {
    pub instance: LightInstanceHandle,
    pub range: f32,
    pub radius: f32,
    pub height: f32,
    pub speed: f32,
    pub phase: f32,
}

pub struct DemoScene {
    world: World,
    sun: LightInstanceHandle,
    environment: EnvironmentHandle,
    atlas: ShadowAtlasHandle,
    target: RenderTargetHandle,
    elapsed: f32,
    aspect: f32,
}

impl DemoScene {
    /// Builds the scene. The sky uses `radiance_path` when it loads, and a
    /// generated gradient otherwise.
    pub fn new(
        ctx: &mut dyn GpuContext,
        raster: &mut SceneRasterizer,
        radiance_path: Option<&Path>,
        seed: u64,
    ) -> Self {
        let (width, height) = ctx.screen_size();
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut world = World::new();

        let checker = upload_checker(ctx, raster, 256, 32);
        let radiance = radiance_path
            .and_then(|path| load_radiance(ctx, raster, path))
            .unwrap_or_else(|| upload_gradient_sky(ctx, raster, 128, 64));

        let ground_material = raster.material_create_from_descriptor(
            ctx,
            &MaterialDescriptor::new([MaterialFeature::AlbedoTexture])
                .with_texture("albedo_texture", checker)
                .with_param("albedo_color", Vec4::new(0.8, 0.8, 0.8, 1.0)),
        );
        let ground = mesh_from(ctx, raster, primitives::plane(2.0 * SCATTER_RADIUS + 6.0));
        let sphere = mesh_from(ctx, raster, primitives::sphere(32, 16));
        let cube = mesh_from(ctx, raster, primitives::cube());

        if let (Some(mesh), Some(material)) = (ground, ground_material) {
            world.spawn((
                Renderable {
                    mesh,
                    material,
                    radius: SCATTER_RADIUS + 3.0,
                    casting: ShadowCasting::Off,
                },
                Placement {
                    position: Vec3::ZERO,
                    rotation: Quat::IDENTITY,
                    scale: Vec3::ONE,
                },
            ));
        }

        for index in 0..PROP_COUNT {
            let color = Vec4::new(rng.gen_range(0.2..1.0), rng.gen_range(0.2..1.0), rng.gen_range(0.2..1.0), 1.0);
            let translucent = index % 6 == 5;
            let mut features = vec![MaterialFeature::Rim];
            if translucent {
                features.push(MaterialFeature::AlphaBlend);
            }
            let alpha = if translucent { 0.5 } else { 1.0 };
            let material = raster.material_create_from_descriptor(
                ctx,
                &MaterialDescriptor::new(features)
                    .with_param("albedo_color", color.truncate().extend(alpha))
                    .with_param("roughness_value", rng.gen_range(0.1f32..0.9)),
            );
            let mesh = if index % 2 == 0 { sphere } else { cube };
            let (Some(mesh), Some(material)) = (mesh, material) else {
                continue;
            };

            let angle = rng.gen_range(0.0..std::f32::consts::TAU);
            let distance = rng.gen_range(2.0..SCATTER_RADIUS);
            let scale = rng.gen_range(0.5f32..1.4);
            world.spawn((
                Renderable {
                    mesh,
                    material,
                    radius: scale,
                    casting: if translucent { ShadowCasting::Off } else { ShadowCasting::On },
                },
                Placement {
                    position: Vec3::new(angle.cos() * distance, scale * 0.5, angle.sin() * distance),
                    rotation: Quat::from_rotation_y(angle),
                    scale: Vec3::splat(scale),
                },
                Spin {
                    axis: Vec3::new(rng.gen_range(-1.0..1.0), 1.0, rng.gen_range(-1.0..1.0)).normalize(),
                    speed: rng.gen_range(0.2..1.5),
                },
            ));
        }

        let storage = raster.storage_mut();
        let sun_light = storage.light_create(LightKind::Directional);
        if let Some(light) = storage.light_mut(sun_light) {
            light.color = Vec3::new(1.0, 0.95, 0.85);
            light.energy = 1.2;
            light.shadow = true;
            light.directional_shadow_mode = DirectionalShadowMode::Parallel4Splits;
            light.shadow_max_distance = 60.0;
        }
        let sun = raster
            .light_instance_create(sun_light)
            .unwrap_or_default();
        raster.light_instance_set_transform(
            sun,
            Mat4::from_quat(Quat::from_rotation_y(0.6) * Quat::from_rotation_x(-0.9)),
        );

        let mut spawn_orbiter = |raster: &mut SceneRasterizer, kind: LightKind, color: Vec3, orbit: OrbitingLight| {
            let storage = raster.storage_mut();
            let handle = storage.light_create(kind);
            if let Some(light) = storage.light_mut(handle) {
                light.color = color;
                light.energy = 2.0;
                light.range = orbit.range;
                light.shadow = true;
                light.spot_angle = 35.0;
            }
            if let Some(instance) = raster.light_instance_create(handle) {
                world.spawn((OrbitingLight { instance, ..orbit },));
            }
        };
        for (index, color) in [Vec3::new(1.0, 0.3, 0.2), Vec3::new(0.2, 0.5, 1.0), Vec3::new(0.3, 1.0, 0.4)]
            .into_iter()
            .enumerate()
        {
            let orbit = OrbitingLight {
                instance: LightInstanceHandle::default(),
                range: 6.0,
                radius: 4.0 + index as f32 * 2.0,
                height: 1.5 + index as f32 * 0.5,
                speed: 0.4 + index as f32 * 0.15,
                phase: index as f32 * 2.1,
            };
            let kind = if index == 2 { LightKind::Spot } else { LightKind::Omni };
            spawn_orbiter(raster, kind, color, orbit);
        }

        let mut environment = Environment::new(Vec4::new(0.05, 0.06, 0.09, 1.0)).with_sky(radiance);
        environment.background = BackgroundMode::Sky;
        environment.sky.energy = 1.0;
        environment.ambient.color = Vec3::new(0.15, 0.17, 0.22);
        environment.glow.enabled = true;
        environment.glow.hdr_threshold = 0.9;
        environment.adjustments.enabled = true;
        environment.adjustments.saturation = 1.1;
        let environment_handle = raster.environment_create();
        if let Some(slot) = raster.environment_mut(environment_handle) {
            *slot = environment;
        }

        let atlas = raster.shadow_atlas_create_configured(ctx);
        let target = raster.storage_mut().render_target_create(width, height);
        raster
            .storage_mut()
            .render_target_set_flag(ctx, target, RenderTargetFlags::DIRECT_TO_SCREEN, true);

        log::info!("Demo scene: {} entities", world.len());

        Self {
            world,
            sun,
            environment: environment_handle,
            atlas,
            target,
            elapsed: 0.0,
            aspect: width as f32 / height.max(1) as f32,
        }
    }

    pub fn resize(&mut self, ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer, width: u32, height: u32) {
        self.aspect = width as f32 / height.max(1) as f32;
        raster
            .storage_mut()
            .render_target_set_size(ctx, self.target, width, height);
    }

    pub fn update(&mut self, raster: &mut SceneRasterizer, dt: f32) {
        self.elapsed += dt;

        for (_entity, (placement, spin)) in self.world.query_mut::<(&mut Placement, &Spin)>() {
            placement.rotation = (Quat::from_axis_angle(spin.axis, spin.speed * dt) * placement.rotation).normalize();
        }

        for (_entity, orbit) in self.world.query_mut::<&OrbitingLight>() {
            let angle = orbit.phase + self.elapsed * orbit.speed;
            let position = Vec3::new(angle.cos() * orbit.radius, orbit.height, angle.sin() * orbit.radius);
            let transform = Mat4::look_at_rh(position, Vec3::new(0.0, 0.0, 0.0), Vec3::Y).inverse();
            raster.light_instance_set_transform(orbit.instance, transform);
        }
    }

    pub fn camera(&self) -> CameraSetup {
        let angle = self.elapsed * 0.1;
        let eye = Vec3::new(angle.cos() * 16.0, 7.0, angle.sin() * 16.0);
        CameraSetup::look_at(eye, Vec3::ZERO, Vec3::Y, 55f32.to_radians(), self.aspect, 0.1, 200.0)
    }

    /// Every renderable, with the local lights whose range reaches it.
    pub fn visible_instances(&self, raster: &SceneRasterizer) -> Vec<VisibleInstance> {
        let local_lights: Vec<(LightInstanceHandle, Vec3, f32)> = self
            .world
            .query::<&OrbitingLight>()
            .iter()
            .filter_map(|(_entity, orbit)| {
                let instance = raster.lights().light_instance(orbit.instance)?;
                Some((orbit.instance, instance.position(), orbit.range))
            })
            .collect();

        self.world
            .query::<(&Renderable, &Placement)>()
            .iter()
            .map(|(_entity, (renderable, placement))| {
                let lights = local_lights
                    .iter()
                    .filter(|(_, position, range)| {
                        position.distance(placement.position) < range + renderable.radius
                    })
                    .map(|(handle, _, _)| *handle)
                    .collect();
                let mut instance = VisibleInstance::mesh(renderable.mesh, placement.matrix())
                    .with_material_override(renderable.material)
                    .with_lights(lights);
                instance.cast_shadows = renderable.casting;
                instance
            })
            .collect()
    }

    pub fn visible_lights(&self) -> Vec<LightInstanceHandle> {
        std::iter::once(self.sun)
            .chain(self.world.query::<&OrbitingLight>().iter().map(|(_entity, orbit)| orbit.instance))
            .collect()
    }

    pub fn render(&mut self, ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer) -> crate::RenderStats {
        let camera = self.camera();
        let instances = self.visible_instances(raster);
        let lights = self.visible_lights();
        let stats = raster.render_scene(
            ctx,
            &camera,
            &instances,
            &lights,
            Some(self.environment),
            Some(self.atlas),
            self.target,
        );
        raster.end_frame();
        stats
    }

    pub fn world(&self) -> &World {
        &self.world
    }
}

fn mesh_from(ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer, data: SurfaceData) -> Option<MeshHandle> {
    let storage = raster.storage_mut();
    let mesh = storage.mesh_create();
    match storage.mesh_add_surface(ctx, mesh, data) {
        Ok(_) => Some(mesh),
        Err(err) => {
            log::error!("Failed to upload demo mesh: {}", err);
            None
        }
    }
}

/// Two-tone checkerboard with `cell`-pixel squares.
pub fn checker_image(size: u32, cell: u32) -> image::RgbaImage {
    let cell = cell.max(1);
    image::RgbaImage::from_fn(size, size, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            image::Rgba([220, 220, 220, 255])
        } else {
            image::Rgba([90, 90, 100, 255])
        }
    })
}

/// Equirectangular sky: horizon haze fading to a deep zenith, dark below.
pub fn gradient_sky_image(width: u32, height: u32) -> image::Rgba32FImage {
    let zenith = Vec3::new(0.15, 0.3, 0.75);
    let horizon = Vec3::new(0.8, 0.85, 0.9);
    let ground = Vec3::new(0.12, 0.1, 0.08);
    image::Rgba32FImage::from_fn(width, height, |_, y| {
        let elevation = 1.0 - 2.0 * (y as f32 + 0.5) / height as f32;
        let color = if elevation >= 0.0 {
            horizon.lerp(zenith, elevation.sqrt())
        } else {
            horizon.lerp(ground, (-elevation).sqrt())
        };
        image::Rgba([color.x, color.y, color.z, 1.0])
    })
}

fn upload_checker(ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer, size: u32, cell: u32) -> TextureHandle {
    let image = checker_image(size, cell);
    let storage = raster.storage_mut();
    let texture = storage.texture_create();
    storage.texture_allocate(ctx, texture, size, size, TextureFormat::Rgba8UnormSrgb, TextureFilter::Linear);
    storage.texture_set_data(ctx, texture, TextureData::Bytes(image.as_raw()));
    texture
}

fn upload_radiance(ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer, image: &image::Rgba32FImage) -> TextureHandle {
    let storage = raster.storage_mut();
    let texture = storage.texture_create();
    storage.texture_allocate(
        ctx,
        texture,
        image.width(),
        image.height(),
        TextureFormat::Rgba16Float,
        TextureFilter::Linear,
    );
    storage.texture_set_data(ctx, texture, TextureData::Floats(image.as_raw()));
    texture
}

fn upload_gradient_sky(ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer, width: u32, height: u32) -> TextureHandle {
    upload_radiance(ctx, raster, &gradient_sky_image(width, height))
}

fn load_radiance(ctx: &mut dyn GpuContext, raster: &mut SceneRasterizer, path: &Path) -> Option<TextureHandle> {
    match image::open(path) {
        Ok(image) => {
            log::info!("Loaded sky radiance from {:?}", path);
            Some(upload_radiance(ctx, raster, &image.into_rgba32f()))
        }
        Err(err) => {
            log::warn!("Failed to load sky radiance {:?}: {}", path, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checker_alternates_by_cell() {
        let image = checker_image(8, 2);
        assert_eq!(image.get_pixel(0, 0), image.get_pixel(1, 1));
        assert_ne!(image.get_pixel(0, 0), image.get_pixel(2, 0));
        assert_eq!(image.get_pixel(0, 0), image.get_pixel(2, 2));
    }

    #[test]
    fn gradient_sky_is_brighter_above_the_horizon() {
        let sky = gradient_sky_image(4, 16);
        let top = sky.get_pixel(0, 0)[2];
        let bottom = sky.get_pixel(0, 15)[2];
        assert!(top > bottom);
        assert_eq!(sky.get_pixel(0, 8)[3], 1.0);
    }
}
