// src/renderer/scene_raster.rs
//! The forward scene rasterizer.
//!
//! A frame runs `FillList -> ShadowPasses -> Opaque -> Sky -> Transparent ->
//! PostProcess`. Every draw goes through the uniform, texture and pipeline
//! caches, so draws must be issued in exactly the sorted list order.

use std::collections::{HashMap, HashSet};

use glam::{Mat4, Vec3, Vec4};
use slotmap::SlotMap;

use super::light_instance::{LightInstance, LightInstanceHandle, LightRegistry, ShadowAtlasHandle};
use super::material_base::{default_shader_desc, MaterialBaseCache, MaterialDescriptor};
use super::render_list::{
    key_index, BatchSortKey, DepthSortKey, ElementGeometry, LightMode, LightType, LocalLightType,
    RenderElement, RenderList,
};
use super::shader_variants::{InternalPrograms, ShaderFeatures, ShaderVariantCache, MATERIAL_TEXTURE_UNITS};
use super::shadow_atlas::{create_shadow_targets, release_shadow_targets, AtlasTargets};
use super::state_cache::{PipelineStateTracker, TextureCache, UniformCache};
use super::storage::{
    DepthDrawMode, Light, LightHandle, LightKind, MaterialHandle, MeshHandle, RasterStorage,
    RenderTargetFlags, RenderTargetHandle, ShaderFlags, TextureHint, VertexFormat,
};
use crate::environment::{BackgroundMode, Environment};
use crate::error::{RasterError, RasterResult};
use crate::gpu::{
    BlendMode, ClearRequest, CullMode, DepthFunc, DrawCall, FramebufferId, GpuContext,
    InstanceBinding, PipelineState, TextureId, Viewport,
};
use crate::scene::{CameraSetup, InstanceGeometry, ShadowCasting, VisibleInstance};
use crate::settings::RasterSettings;
use crate::time::TickSource;

pub(crate) const CLEAR_TEMPLATE: &str = include_str!("shaders/clear.glsl");
pub(crate) const SKY_TEMPLATE: &str = include_str!("shaders/sky.glsl");

pub const LIGHTMAP_UNIT: u32 = 7;
pub const SHADOW_ATLAS_UNIT: u32 = 8;
pub const DIRECTIONAL_SHADOW_UNIT: u32 = 9;
pub const RADIANCE_UNIT: u32 = 10;
pub const SKELETON_UNIT: u32 = 12;

/// Longest `next_pass` chain followed for one surface.
const MAX_MATERIAL_PASSES: usize = 8;

slotmap::new_key_type! {
    pub struct EnvironmentHandle;
}

/// Counters for the most recent `render_scene` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub draw_calls: usize,
    /// Rebinds forced by a change in unshaded, base pass, light, lightmap,
    /// prepass, instancing or skeleton state.
    pub shader_rebinds: usize,
    pub program_binds: usize,
    pub uniform_uploads: usize,
    pub texture_binds: usize,
    pub shadow_passes: usize,
    pub dropped_elements: usize,
    /// Elements skipped because their program did not compile.
    pub skipped_elements: usize,
    pub opaque_elements: usize,
    pub alpha_elements: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassKind {
    DepthPrepass,
    Opaque,
    Transparent,
    Shadow { dual_paraboloid: bool },
}

impl PassKind {
    fn depth_only(self) -> bool {
        matches!(self, PassKind::DepthPrepass | PassKind::Shadow { .. })
    }
}

/// Everything a lit draw needs to sample a light's shadow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShadowBinding {
    pub texture: TextureId,
    pub unit: u32,
    pub matrices: [Mat4; 4],
    pub splits: usize,
    pub split_offsets: Vec4,
    pub atlas_rect: Vec4,
    pub pixel_size: Vec4,
}

/// State whose change forces a program rebind and a full cache refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindState {
    unshaded: bool,
    base_pass: bool,
    light: Option<LightInstanceHandle>,
    light_kind: Option<LightKind>,
    lightmap: bool,
    depth_prepass: bool,
    instancing: bool,
    skeleton: bool,
}

pub(crate) struct FrameContext {
    pub camera: CameraSetup,
    pub view: Mat4,
    pub environment: Environment,
    pub shadows: HashMap<LightInstanceHandle, ShadowBinding>,
    pub time: f32,
}

impl Default for FrameContext {
    fn default() -> Self {
        Self {
            camera: CameraSetup::default(),
            view: Mat4::IDENTITY,
            environment: Environment::default(),
            shadows: HashMap::new(),
            time: 0.0,
        }
    }
}

/// Where the scene passes draw and whether post effects follow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameOutput {
    pub scene_framebuffer: Option<FramebufferId>,
    pub final_framebuffer: Option<FramebufferId>,
    pub width: u32,
    pub height: u32,
    pub post_process: bool,
    pub transparent: bool,
}

pub struct SceneRasterizer {
    pub(crate) settings: RasterSettings,
    pub(crate) storage: RasterStorage,
    pub(crate) lights: LightRegistry,
    pub(crate) variants: ShaderVariantCache,
    pub(crate) internal: InternalPrograms,
    pub(crate) material_bases: MaterialBaseCache,
    pub(crate) render_list: RenderList,
    pub(crate) shadow_list: RenderList,
    pub(crate) uniforms: UniformCache,
    pub(crate) textures: TextureCache,
    pub(crate) pipeline: PipelineStateTracker,
    pub(crate) environments: SlotMap<EnvironmentHandle, Environment>,
    pub(crate) directional_shadow: Option<AtlasTargets>,
    pub(crate) default_material: Option<MaterialHandle>,
    pub(crate) frame: FrameContext,
    pub(crate) stats: RenderStats,
}

impl SceneRasterizer {
    pub fn new(settings: RasterSettings, ticks: Box<dyn TickSource>) -> Self {
        let settings = settings.validate();
        let capacity = settings.render_list_capacity;
        Self {
            lights: LightRegistry::new(ticks, settings.shadow_reallocation_tolerance_ms),
            storage: RasterStorage::new(),
            variants: ShaderVariantCache::new(),
            internal: InternalPrograms::default(),
            material_bases: MaterialBaseCache::new(),
            render_list: RenderList::new(capacity),
            shadow_list: RenderList::new(capacity),
            uniforms: UniformCache::new(),
            textures: TextureCache::new(),
            pipeline: PipelineStateTracker::default(),
            environments: SlotMap::with_key(),
            directional_shadow: None,
            default_material: None,
            frame: FrameContext::default(),
            stats: RenderStats::default(),
            settings,
        }
    }

    /// Replaces the material base cache, e.g. to share one between tests.
    pub fn with_material_cache(mut self, cache: MaterialBaseCache) -> Self {
        self.material_bases = cache;
        self
    }

    /// Creates fallback textures, the default material and the directional
    /// shadow map.
    pub fn initialize(&mut self, ctx: &mut dyn GpuContext) -> RasterResult<()> {
        self.storage.initialize(ctx)?;

        let shader = self.storage.shader_create(default_shader_desc());
        self.default_material = Some(self.storage.material_create(shader, HashMap::new()));

        if let Some(previous) = self.directional_shadow.take() {
            release_shadow_targets(ctx, previous);
        }
        let size = self.settings.directional_shadow_size;
        self.directional_shadow = Some(create_shadow_targets(ctx, size, self.settings.use_rgba_shadows)?);

        log::info!(
            "Scene rasterizer initialized: list capacity {}, directional shadow {}",
            self.render_list.capacity(),
            size
        );
        Ok(())
    }

    pub fn settings(&self) -> &RasterSettings {
        &self.settings
    }

    pub fn storage(&self) -> &RasterStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut RasterStorage {
        &mut self.storage
    }

    pub fn lights(&self) -> &LightRegistry {
        &self.lights
    }

    pub fn variants(&self) -> &ShaderVariantCache {
        &self.variants
    }

    pub fn render_list(&self) -> &RenderList {
        &self.render_list
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn default_material(&self) -> Option<MaterialHandle> {
        self.default_material
    }

    pub fn environment_create(&mut self) -> EnvironmentHandle {
        self.environments.insert(Environment::default())
    }

    pub fn environment(&self, handle: EnvironmentHandle) -> Option<&Environment> {
        self.environments.get(handle)
    }

    pub fn environment_mut(&mut self, handle: EnvironmentHandle) -> Option<&mut Environment> {
        self.environments.get_mut(handle)
    }

    pub fn environment_free(&mut self, handle: EnvironmentHandle) {
        self.environments.remove(handle);
    }

    pub fn material_create_from_descriptor(
        &mut self,
        ctx: &mut dyn GpuContext,
        descriptor: &MaterialDescriptor,
    ) -> Option<MaterialHandle> {
        self.material_bases.material_create_from_descriptor(
            ctx,
            &mut self.storage,
            &mut self.variants,
            descriptor,
            self.default_material,
        )
    }

    pub fn light_instance_create(&mut self, light: LightHandle) -> Option<LightInstanceHandle> {
        self.lights.light_instance_create(&self.storage, light)
    }

    pub fn light_instance_set_transform(&mut self, light: LightInstanceHandle, transform: Mat4) {
        self.lights.light_instance_set_transform(light, transform);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn light_instance_set_shadow_transform(
        &mut self,
        light: LightInstanceHandle,
        camera: Mat4,
        transform: Mat4,
        farplane: f32,
        split: f32,
        pass: usize,
        bias_scale: f32,
    ) {
        self.lights
            .light_instance_set_shadow_transform(light, camera, transform, farplane, split, pass, bias_scale);
    }

    pub fn light_instance_mark_visible(&mut self, light: LightInstanceHandle) {
        self.lights.light_instance_mark_visible(light);
    }

    pub fn light_instance_free(&mut self, light: LightInstanceHandle) {
        self.lights.light_instance_free(light);
    }

    pub fn shadow_atlas_create(&mut self) -> ShadowAtlasHandle {
        self.lights.shadow_atlas_create()
    }

    pub fn shadow_atlas_set_size(&mut self, ctx: &mut dyn GpuContext, atlas: ShadowAtlasHandle, size: u32) {
        self.lights.shadow_atlas_set_size(ctx, atlas, size);
    }

    pub fn shadow_atlas_set_quadrant_subdivision(&mut self, atlas: ShadowAtlasHandle, quadrant: usize, count: u32) {
        self.lights.shadow_atlas_set_quadrant_subdivision(atlas, quadrant, count);
    }

    pub fn shadow_atlas_update_light(
        &mut self,
        atlas: ShadowAtlasHandle,
        light: LightInstanceHandle,
        coverage: f32,
        light_version: u64,
    ) -> bool {
        self.lights.shadow_atlas_update_light(atlas, light, coverage, light_version)
    }

    /// Creates an atlas sized and subdivided from the settings.
    pub fn shadow_atlas_create_configured(&mut self, ctx: &mut dyn GpuContext) -> ShadowAtlasHandle {
        let atlas = self.shadow_atlas_create();
        self.shadow_atlas_set_size(ctx, atlas, self.settings.shadow_atlas_size);
        let subdivisions = self.settings.shadow_atlas_quadrant_subdivisions;
        for (quadrant, count) in subdivisions.into_iter().enumerate() {
            self.shadow_atlas_set_quadrant_subdivision(atlas, quadrant, count);
        }
        atlas
    }

    /// Returns per-frame buffers to the pools. Call once after every viewport
    /// of the frame has been rendered.
    pub fn end_frame(&mut self) {
        self.storage.end_frame();
    }

    /// Renders one camera view of the visible instances into `target`.
    /// Failures along the way are logged and degrade the image; the frame
    /// always completes.
    #[allow(clippy::too_many_arguments)]
    pub fn render_scene(
        &mut self,
        ctx: &mut dyn GpuContext,
        camera: &CameraSetup,
        instances: &[VisibleInstance],
        visible_lights: &[LightInstanceHandle],
        environment: Option<EnvironmentHandle>,
        shadow_atlas: Option<ShadowAtlasHandle>,
        target: RenderTargetHandle,
    ) -> RenderStats {
        self.begin_frame_stats();
        self.storage.update_dirty_resources(ctx);

        let environment = environment
            .and_then(|handle| self.environments.get(handle))
            .cloned()
            .unwrap_or_default();
        self.lights.begin_scene_pass();

        let mut directional = Vec::new();
        for (index, &light) in visible_lights.iter().enumerate() {
            self.lights.light_instance_mark_visible(light);
            self.lights.light_instance_set_index(light, index as u32);
            if self
                .lights
                .light_instance(light)
                .is_some_and(|instance| instance.kind == LightKind::Directional)
            {
                directional.push(light);
            }
        }

        self.frame = FrameContext {
            camera: *camera,
            view: camera.view(),
            environment,
            shadows: HashMap::new(),
            time: self.lights.now_ms() as f32 / 1000.0,
        };

        self.fill_render_list(instances, &directional);
        self.render_list.sort_by_key(false);
        self.render_list.sort_by_reverse_depth_and_priority(true);

        self.render_shadow_passes(ctx, instances, visible_lights, shadow_atlas);

        let output = match self.prepare_output(ctx, target) {
            Ok(output) => output,
            Err(err) => {
                log::error!("Render target unavailable: {}", err);
                return self.finish_frame_stats();
            }
        };

        ctx.bind_framebuffer(output.scene_framebuffer);
        ctx.set_viewport(Viewport::new(0, 0, output.width, output.height));
        ctx.clear(self.background_clear(target, &output));

        if self.settings.use_depth_prepass {
            self.draw_list(ctx, instances, PassKind::DepthPrepass);
        }
        self.draw_list(ctx, instances, PassKind::Opaque);
        self.draw_sky(ctx);
        self.draw_list(ctx, instances, PassKind::Transparent);

        if output.post_process {
            self.post_process(ctx, target, &output);
        }

        self.finish_frame_stats()
    }

    fn begin_frame_stats(&mut self) {
        self.stats = RenderStats::default();
        self.uniforms.reset_stats();
        self.textures.reset_stats();
        self.pipeline.reset_stats();
    }

    fn finish_frame_stats(&mut self) -> RenderStats {
        self.stats.program_binds = self.pipeline.program_binds();
        self.stats.uniform_uploads = self.uniforms.uploads();
        self.stats.texture_binds = self.textures.binds();
        self.stats.opaque_elements = self.render_list.element_count();
        self.stats.alpha_elements = self.render_list.alpha_element_count();
        self.stats.dropped_elements += self.render_list.dropped();

        if self.stats.dropped_elements > 0 {
            log::warn!(
                "Render list full, {} elements dropped this frame",
                self.stats.dropped_elements
            );
        }
        log::trace!("Frame stats: {:?}", self.stats);
        self.stats
    }

    fn prepare_output(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: RenderTargetHandle,
    ) -> RasterResult<FrameOutput> {
        let target = self
            .storage
            .render_target(handle)
            .ok_or(RasterError::UnknownResource("render target"))?;
        let post_process = self.frame.environment.wants_post_process()
            && !target.flags.contains(RenderTargetFlags::NO_3D_EFFECTS)
            && target.width >= 4
            && target.height >= 4;

        self.storage.render_target_prepare(ctx, handle, post_process)?;
        let target = self
            .storage
            .render_target(handle)
            .ok_or(RasterError::UnknownResource("render target"))?;

        let final_framebuffer = if target.flags.contains(RenderTargetFlags::DIRECT_TO_SCREEN) {
            None
        } else {
            target.framebuffer()
        };
        let scene_framebuffer = match (post_process, target.effects()) {
            (true, Some(effects)) => Some(effects.scene_framebuffer),
            _ => final_framebuffer,
        };

        Ok(FrameOutput {
            scene_framebuffer,
            final_framebuffer,
            width: target.width.max(1),
            height: target.height.max(1),
            post_process: post_process && target.effects().is_some(),
            transparent: target.flags.contains(RenderTargetFlags::TRANSPARENT),
        })
    }

    fn background_clear(&self, target: RenderTargetHandle, output: &FrameOutput) -> ClearRequest {
        let environment = &self.frame.environment;
        let color = match environment.background {
            BackgroundMode::ClearColor => self
                .storage
                .render_target(target)
                .map(|target| target.clear_color),
            BackgroundMode::Color | BackgroundMode::Sky => Some(
                (environment.bg_color.truncate() * environment.bg_energy).extend(environment.bg_color.w),
            ),
            BackgroundMode::Canvas | BackgroundMode::CameraFeed | BackgroundMode::Keep => None,
        };
        let color = match color {
            Some(color) if output.transparent => Some(color.truncate().extend(0.0)),
            None if output.post_process => Some(Vec4::ZERO),
            other => other,
        };
        ClearRequest {
            color: color.map(|c| c.to_array()),
            depth: Some(1.0),
        }
    }

    /// Material for one surface: override, then per-instance, then the
    /// surface default, then the fallback material.
    pub(crate) fn resolve_material(
        &self,
        instance: &VisibleInstance,
        mesh: MeshHandle,
        surface: usize,
    ) -> Option<MaterialHandle> {
        let surface_default = self
            .storage
            .mesh(mesh)
            .and_then(|mesh| mesh.surfaces.get(surface))
            .and_then(|surface| surface.material);
        [
            instance.material_override,
            instance.surface_materials.get(surface).copied().flatten(),
            surface_default,
            self.default_material,
        ]
        .into_iter()
        .flatten()
        .find(|material| self.storage.material(*material).is_some())
    }

    fn fill_render_list(&mut self, instances: &[VisibleInstance], directional: &[LightInstanceHandle]) {
        self.render_list.clear();
        let camera = self.frame.camera;

        for (index, instance) in instances.iter().enumerate() {
            if !instance.renders_in_scene() {
                continue;
            }
            let Some(mesh) = instance.mesh_handle(&self.storage) else {
                continue;
            };
            let Some(surface_count) = self.storage.mesh(mesh).map(|mesh| mesh.surfaces.len()) else {
                continue;
            };
            let multimesh = match instance.geometry {
                InstanceGeometry::MultiMesh(handle) => Some(handle),
                InstanceGeometry::Mesh(_) => None,
            };
            let center = instance
                .world_aabb(&self.storage)
                .map_or(instance.transform.w_axis.truncate(), |aabb| aabb.center());
            let depth = camera.depth_of(center);

            for surface in 0..surface_count {
                let geometry = ElementGeometry {
                    mesh,
                    surface,
                    multimesh,
                };
                let mut next = self.resolve_material(instance, mesh, surface);
                let mut passes = 0;
                while let Some(material) = next {
                    if !self.add_geometry(index, instance, geometry, material, depth, directional) {
                        return;
                    }
                    passes += 1;
                    if passes >= MAX_MATERIAL_PASSES {
                        log::warn!("Material pass chain longer than {} ignored", MAX_MATERIAL_PASSES);
                        break;
                    }
                    next = self.storage.material(material).and_then(|m| m.next_pass);
                }
            }
        }
    }

    /// Adds one element per light affecting the surface, all sharing one
    /// accumulation group. Returns `false` once the list is full.
    fn add_geometry(
        &mut self,
        index: usize,
        instance: &VisibleInstance,
        geometry: ElementGeometry,
        material_handle: MaterialHandle,
        depth: f32,
        directional: &[LightInstanceHandle],
    ) -> bool {
        let Some(material) = self.storage.material(material_handle) else {
            return true;
        };
        let Some(shader) = self.storage.shader(material.shader) else {
            return true;
        };
        let alpha = material.is_alpha() || shader.desc.flags.contains(ShaderFlags::USES_DEPTH_TEXTURE);
        let unshaded = shader.is_unshaded();
        let light_mode = if unshaded {
            LightMode::Unshaded
        } else if instance.lightmap.is_some() {
            LightMode::Lightmap
        } else {
            LightMode::Normal
        };

        let base = RenderElement {
            instance: index,
            geometry,
            material: material_handle,
            skeleton: instance.skeleton,
            light: None,
            front_facing: !instance.mirror,
            depth,
            depth_key: DepthSortKey {
                layer: instance.depth_layer,
                priority: material.render_priority,
            },
            batch_key: BatchSortKey {
                geometry: (key_index(geometry.mesh) << 4) | (geometry.surface as u32 & 0xf),
                skeleton: instance.skeleton.map_or(0, key_index),
                material: key_index(material_handle),
                light_mode,
                ..BatchSortKey::default()
            },
            accum_group: 0,
        };

        let mut lights: Vec<(LightInstanceHandle, &LightInstance)> = Vec::new();
        if !unshaded {
            let scene_pass = self.lights.scene_pass();
            let local = instance.lights.iter().filter_map(|&handle| {
                let light = self.lights.light_instance(handle)?;
                (light.kind != LightKind::Directional && light.last_scene_pass == scene_pass)
                    .then_some((handle, light))
            });
            lights = directional
                .iter()
                .filter_map(|&handle| Some((handle, self.lights.light_instance(handle)?)))
                .chain(local)
                .take(self.settings.max_lights_per_object)
                .collect();
        }

        let group = self.render_list.new_accum_group();
        if lights.is_empty() {
            let element = RenderElement {
                accum_group: group,
                batch_key: BatchSortKey {
                    light_mode: LightMode::Unshaded,
                    ..base.batch_key
                },
                ..base
            };
            return push_element(&mut self.render_list, alpha, element);
        }

        for (handle, light) in lights {
            let (light_type1, light_type2) = match light.kind {
                LightKind::Directional => (LightType::Directional, LocalLightType::Omni),
                LightKind::Omni => (LightType::Local, LocalLightType::Omni),
                LightKind::Spot => (LightType::Local, LocalLightType::Spot),
            };
            let element = RenderElement {
                light: Some(handle),
                accum_group: group,
                batch_key: BatchSortKey {
                    light_index: light.light_index,
                    light_type1,
                    light_type2,
                    ..base.batch_key
                },
                ..base
            };
            if !push_element(&mut self.render_list, alpha, element) {
                return false;
            }
        }
        true
    }

    /// Marks every cached value dirty; the render target or viewport may
    /// have changed since the last pass.
    pub(crate) fn begin_pass(&mut self) {
        self.uniforms.mark_all_dirty();
        self.textures.mark_all_dirty();
        self.pipeline.invalidate();
    }

    pub(crate) fn set_camera_uniforms(&mut self, projection: Mat4, camera_transform: Mat4, z_near: f32, z_far: f32) {
        self.uniforms.set("projection_matrix", projection);
        self.uniforms.set("camera_inverse_matrix", camera_transform.inverse());
        self.uniforms.set("camera_matrix", camera_transform);
        self.uniforms.set("z_near", z_near);
        self.uniforms.set("z_far", z_far);
        self.uniforms.set("time", self.frame.time);
    }

    fn set_environment_uniforms(&mut self) {
        let environment = &self.frame.environment;
        let ambient = (environment.ambient.color * environment.ambient.energy).extend(1.0);
        let fog = environment.fog;
        self.uniforms.set("ambient_light_color", ambient);
        self.uniforms.set("fog_color_base", fog.color.extend(1.0));
        self.uniforms.set(
            "fog_depth_params",
            Vec4::new(fog.depth_begin, fog.depth_end, fog.depth_curve, 0.0),
        );
        self.uniforms.set(
            "fog_height_params",
            Vec4::new(fog.height_min, fog.height_max, fog.height_curve, 0.0),
        );
    }

    /// Draws one partition of the scene list.
    fn draw_list(&mut self, ctx: &mut dyn GpuContext, instances: &[VisibleInstance], pass: PassKind) {
        self.begin_pass();
        let camera = self.frame.camera;
        self.set_camera_uniforms(camera.projection, camera.transform, camera.z_near, camera.z_far);
        self.set_environment_uniforms();

        let alpha = pass == PassKind::Transparent;
        let count = if alpha {
            self.render_list.alpha_element_count()
        } else {
            self.render_list.element_count()
        };

        let mut bound = None;
        let mut prepassed = HashSet::new();
        for i in 0..count {
            let element = if alpha {
                self.render_list.alpha()[i]
            } else {
                self.render_list.opaque()[i]
            };
            if pass == PassKind::DepthPrepass && !prepassed.insert(element.accum_group) {
                continue;
            }
            let accum_used = self.render_list.accum_used(element.accum_group);
            if self.draw_element(ctx, instances, element, pass, accum_used, &mut bound)
                && element.light.is_some()
                && !pass.depth_only()
            {
                self.render_list.set_accum_used(element.accum_group);
            }
        }
    }

    /// Resolves state for one element and issues its draw. Returns whether a
    /// draw was issued.
    pub(crate) fn draw_element(
        &mut self,
        ctx: &mut dyn GpuContext,
        instances: &[VisibleInstance],
        element: RenderElement,
        pass: PassKind,
        accum_used: bool,
        bound: &mut Option<BindState>,
    ) -> bool {
        let Some(instance) = instances.get(element.instance) else {
            return false;
        };
        let storage = &self.storage;
        let Some(material) = storage.material(element.material) else {
            return false;
        };
        let Some(shader) = storage.shader(material.shader) else {
            return false;
        };
        let Some(surface) = storage
            .mesh(element.geometry.mesh)
            .and_then(|mesh| mesh.surfaces.get(element.geometry.surface))
        else {
            return false;
        };

        let instancing = match element.geometry.multimesh {
            Some(handle) => {
                let Some(multimesh) = storage.multimesh(handle) else {
                    return false;
                };
                let count = multimesh.draw_count();
                match multimesh.buffer {
                    Some(buffer) if count > 0 => Some(InstanceBinding {
                        buffer: buffer.id,
                        count: count as u32,
                    }),
                    _ => return false,
                }
            }
            None => None,
        };

        let depth_only = pass.depth_only();
        let accum = !depth_only && element.light.is_some() && accum_used;
        let base_pass = !depth_only && !accum;
        let unshaded = shader.is_unshaded();
        let flags = shader.desc.flags;

        let light = if depth_only {
            None
        } else {
            element
                .light
                .and_then(|handle| self.lights.light_instance(handle))
                .and_then(|instance| Some((instance, storage.light(instance.light)?)))
        };
        let shadow = match (light, element.light) {
            (Some(_), Some(handle)) if !flags.contains(ShaderFlags::DONT_RECEIVE_SHADOWS) => {
                self.frame.shadows.get(&handle).copied()
            }
            _ => None,
        };

        let skinned = surface.format.contains(VertexFormat::BONES | VertexFormat::WEIGHTS);
        let skeleton = element
            .skeleton
            .and_then(|handle| storage.skeleton(handle))
            .filter(|_| skinned);
        let skeleton_texture = skeleton
            .filter(|skeleton| !skeleton.uses_software_skinning())
            .and_then(|skeleton| skeleton.texture());

        let lightmap = if base_pass && surface.format.contains(VertexFormat::TEX_UV2) {
            instance.lightmap.and_then(|texture| storage.texture_gpu(texture))
        } else {
            None
        };

        let mut features = if depth_only {
            ShaderFeatures::RENDER_DEPTH
        } else {
            ShaderFeatures::from_shader(shader)
        };
        features |= surface_features(surface.format);
        features.set(ShaderFeatures::USE_INSTANCING, instancing.is_some());
        if skeleton.is_some() {
            features |= if skeleton_texture.is_some() {
                ShaderFeatures::USE_SKELETON
            } else {
                ShaderFeatures::USE_SKELETON_SOFTWARE
            };
        }
        match pass {
            PassKind::DepthPrepass => features |= ShaderFeatures::USE_DEPTH_PREPASS,
            PassKind::Shadow { dual_paraboloid } => {
                features.set(ShaderFeatures::USE_RGBA_SHADOWS, self.settings.use_rgba_shadows);
                features.set(ShaderFeatures::RENDER_DEPTH_DUAL_PARABOLOID, dual_paraboloid);
            }
            PassKind::Opaque | PassKind::Transparent => {
                features.set(ShaderFeatures::BASE_PASS, base_pass);
                features.set(ShaderFeatures::USE_LIGHTMAP, lightmap.is_some());
                let fog = self.frame.environment.fog;
                features.set(ShaderFeatures::FOG_DEPTH_ENABLED, fog.depth_enabled);
                features.set(ShaderFeatures::FOG_HEIGHT_ENABLED, fog.height_enabled);
                if !unshaded {
                    if let Some((instance, _)) = light {
                        features |= light_features(instance.kind);
                    }
                    if let Some(shadow) = shadow {
                        features |= ShaderFeatures::USE_SHADOW;
                        features.set(ShaderFeatures::USE_RGBA_SHADOWS, self.settings.use_rgba_shadows);
                        features.set(ShaderFeatures::LIGHT_USE_PSSM2, shadow.splits == 2);
                        features.set(ShaderFeatures::LIGHT_USE_PSSM4, shadow.splits == 4);
                    }
                }
            }
        }

        let state = BindState {
            unshaded,
            base_pass,
            light: if depth_only { None } else { element.light },
            light_kind: light.map(|(instance, _)| instance.kind),
            lightmap: lightmap.is_some(),
            depth_prepass: pass == PassKind::DepthPrepass,
            instancing: instancing.is_some(),
            skeleton: skeleton.is_some(),
        };

        let Some(program) = self
            .variants
            .get_shader_variant(ctx, storage, element.material, features)
        else {
            self.stats.skipped_elements += 1;
            return false;
        };

        if *bound != Some(state) {
            self.stats.shader_rebinds += 1;
            self.uniforms.mark_all_dirty();
            self.textures.mark_all_dirty();
            *bound = Some(state);
        }
        if self.pipeline.use_program(ctx, program.id) {
            self.uniforms.mark_all_dirty();
        }

        let cull = match pass {
            PassKind::Shadow { dual_paraboloid: true } => CullMode::Disabled,
            PassKind::Shadow { .. } if instance.cast_shadows == ShadowCasting::DoubleSided => {
                CullMode::Disabled
            }
            _ => shader.desc.cull,
        };
        let blend = match pass {
            _ if depth_only => BlendMode::Disabled,
            _ if accum => BlendMode::Add,
            PassKind::Transparent if shader.desc.blend == BlendMode::Disabled => BlendMode::Mix,
            PassKind::Transparent => shader.desc.blend,
            _ => BlendMode::Disabled,
        };
        let depth_write = match pass {
            PassKind::DepthPrepass | PassKind::Shadow { .. } => true,
            PassKind::Opaque => !accum && shader.desc.depth_draw != DepthDrawMode::Never,
            PassKind::Transparent => !accum && shader.desc.depth_draw == DepthDrawMode::Always,
        };
        self.pipeline.apply(
            ctx,
            PipelineState {
                blend,
                cull,
                front_face_ccw: element.front_facing,
                depth_test: depth_only || !flags.contains(ShaderFlags::NO_DEPTH_TEST),
                depth_write,
                depth_func: DepthFunc::LessEqual,
                color_write: pass != PassKind::DepthPrepass,
            },
        );

        self.uniforms.set("world_transform", instance.transform);
        for decl in &shader.desc.uniforms {
            let value = material
                .params
                .get(&decl.name)
                .copied()
                .filter(|value| value.kind() == decl.kind)
                .unwrap_or(decl.default);
            self.uniforms.set(&decl.name, value);
        }

        let defaults = storage.defaults();
        for (unit, decl) in shader.desc.textures.iter().take(MATERIAL_TEXTURE_UNITS).enumerate() {
            let fallback = defaults.map(|defaults| match decl.hint {
                TextureHint::White => defaults.white,
                TextureHint::Black => defaults.black,
                TextureHint::Normal => defaults.normal,
            });
            let texture = material
                .textures
                .get(&decl.name)
                .and_then(|texture| storage.texture_gpu(*texture))
                .or_else(|| fallback.and_then(|texture| storage.texture_gpu(texture)));
            self.textures.bind(ctx, unit as u32, texture);
        }

        if let Some(texture) = lightmap {
            self.textures.bind(ctx, LIGHTMAP_UNIT, Some(texture));
            self.uniforms
                .set("lightmap_params", Vec4::new(instance.lightmap_energy, 0.0, 0.0, 0.0));
        }
        if let Some(texture) = skeleton_texture {
            self.textures.bind(ctx, SKELETON_UNIT, Some(texture));
        }
        if let Some((light_instance, light)) = light {
            set_light_uniforms(&mut self.uniforms, light, light_instance, &self.frame.view);
        }
        if let Some(shadow) = shadow {
            set_shadow_uniforms(&mut self.uniforms, &shadow);
            self.textures.bind(ctx, shadow.unit, Some(shadow.texture));
        }

        self.uniforms.flush(ctx, &program);
        ctx.draw(&DrawCall {
            vertex_buffer: Some(surface.vertex_buffer),
            vertex_count: surface.vertex_count,
            index: surface.index,
            instances: instancing,
            topology: surface.primitive,
        });
        self.stats.draw_calls += 1;
        true
    }

    fn draw_sky(&mut self, ctx: &mut dyn GpuContext) {
        let environment = &self.frame.environment;
        if environment.background != BackgroundMode::Sky {
            return;
        }
        let Some(radiance) = environment
            .sky_radiance()
            .and_then(|texture| self.storage.texture_gpu(texture))
        else {
            log::debug!("Sky background without a valid radiance map, using the background color");
            return;
        };
        let Some(program) = self.internal.get(ctx, "sky", SKY_TEMPLATE, &[]) else {
            return;
        };

        let camera = self.frame.camera;
        let sky = environment.sky;
        let projection = if sky.custom_fov > 0.0 && !camera.orthographic {
            let aspect = camera.projection.y_axis.y / camera.projection.x_axis.x;
            Mat4::perspective_rh(sky.custom_fov.to_radians(), aspect, camera.z_near, camera.z_far)
        } else {
            camera.projection
        };
        let (_, rotation, _) = camera.transform.to_scale_rotation_translation();
        let sky_transform = Mat4::from_quat(rotation) * projection.inverse();

        self.begin_pass();
        self.pipeline.use_program(ctx, program.id);
        self.pipeline.apply(
            ctx,
            PipelineState {
                cull: CullMode::Disabled,
                depth_write: false,
                ..PipelineState::default()
            },
        );
        self.uniforms.set("sky_transform", sky_transform);
        self.uniforms.set("sky_params", Vec4::new(sky.energy, 0.0, 0.0, 0.0));
        self.textures.bind(ctx, RADIANCE_UNIT, Some(radiance));
        self.uniforms.flush(ctx, &program);
        ctx.draw(&DrawCall::fullscreen_triangle());
        self.stats.draw_calls += 1;
    }

    /// Fills the current viewport with a color and depth using a draw, so
    /// only that rectangle is touched.
    pub(crate) fn clear_viewport(&mut self, ctx: &mut dyn GpuContext, color: Vec4, depth: f32) {
        let Some(program) = self.internal.get(ctx, "clear", CLEAR_TEMPLATE, &[]) else {
            return;
        };
        if self.pipeline.use_program(ctx, program.id) {
            self.uniforms.mark_all_dirty();
        }
        self.pipeline.apply(
            ctx,
            PipelineState {
                cull: CullMode::Disabled,
                depth_func: DepthFunc::Always,
                ..PipelineState::default()
            },
        );
        self.uniforms.set("clear_color", color);
        self.uniforms.set("clear_depth", depth);
        self.uniforms.flush(ctx, &program);
        ctx.draw(&DrawCall::fullscreen_triangle());
        self.stats.draw_calls += 1;
    }
}

fn push_element(list: &mut RenderList, alpha: bool, element: RenderElement) -> bool {
    let added = if alpha {
        list.add_alpha_element(element)
    } else {
        list.add_element(element)
    };
    added.is_some()
}

fn surface_features(format: VertexFormat) -> ShaderFeatures {
    let mut features = ShaderFeatures::empty();
    features.set(ShaderFeatures::ENABLE_COLOR_INTERP, format.contains(VertexFormat::COLOR));
    features.set(ShaderFeatures::ENABLE_UV_INTERP, format.contains(VertexFormat::TEX_UV));
    features.set(ShaderFeatures::ENABLE_UV2_INTERP, format.contains(VertexFormat::TEX_UV2));
    features.set(
        ShaderFeatures::ENABLE_TANGENT_INTERP,
        format.contains(VertexFormat::TANGENT),
    );
    features
}

fn light_features(kind: LightKind) -> ShaderFeatures {
    match kind {
        LightKind::Directional => ShaderFeatures::LIGHT_MODE_DIRECTIONAL,
        LightKind::Omni => ShaderFeatures::LIGHT_MODE_OMNI,
        LightKind::Spot => ShaderFeatures::LIGHT_MODE_SPOT,
    }
}

/// Light parameters in view space.
fn set_light_uniforms(uniforms: &mut UniformCache, light: &Light, instance: &LightInstance, view: &Mat4) {
    let sign = if light.negative { -1.0 } else { 1.0 };
    let direction = view.transform_vector3(instance.light_direction).normalize_or_zero();
    let position = view.transform_point3(instance.position());

    uniforms.set("light_color", (light.color * light.energy * sign).extend(light.specular));
    uniforms.set("light_direction", direction.extend(0.0));
    uniforms.set("light_position", position.extend(light.range));
    uniforms.set(
        "light_params",
        Vec4::new(
            light.attenuation,
            light.spot_angle.to_radians().cos(),
            light.spot_attenuation,
            0.0,
        ),
    );
    uniforms.set("shadow_color", light.shadow_color.extend(light.shadow_bias));
}

fn set_shadow_uniforms(uniforms: &mut UniformCache, shadow: &ShadowBinding) {
    const NAMES: [&str; 4] = [
        "light_shadow_matrix1",
        "light_shadow_matrix2",
        "light_shadow_matrix3",
        "light_shadow_matrix4",
    ];
    for (name, matrix) in NAMES.iter().zip(shadow.matrices) {
        uniforms.set(name, matrix);
    }
    uniforms.set("shadow_split_offsets", shadow.split_offsets);
    uniforms.set("shadow_atlas_rect", shadow.atlas_rect);
    uniforms.set("shadow_pixel_size", shadow.pixel_size);
}

/// Camera position helper used by shadow coverage estimates.
pub(crate) fn distance_to_camera(camera: &CameraSetup, point: Vec3) -> f32 {
    (point - camera.position()).length()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuCommand, HeadlessContext};
    use crate::renderer::storage::SurfaceData;
    use crate::renderer::vertex::Vertex;
    use crate::time::ManualTicks;

    fn triangle() -> SurfaceData {
        SurfaceData {
            vertices: vec![
                Vertex {
                    pos: [0.0, 0.0, 0.0],
                    ..Vertex::default()
                },
                Vertex {
                    pos: [1.0, 0.0, 0.0],
                    ..Vertex::default()
                },
                Vertex {
                    pos: [0.0, 1.0, 0.0],
                    ..Vertex::default()
                },
            ],
            indices: None,
            format: VertexFormat::VERTEX | VertexFormat::NORMAL,
            primitive: Default::default(),
            material: None,
        }
    }

    fn rasterizer(ctx: &mut HeadlessContext) -> (SceneRasterizer, RenderTargetHandle, MeshHandle) {
        let settings = RasterSettings {
            render_list_capacity: 64,
            directional_shadow_size: 256,
            ..RasterSettings::default()
        };
        let mut raster = SceneRasterizer::new(settings, Box::new(ManualTicks::new(0)));
        raster.initialize(ctx).expect("initializes");
        let target = raster.storage_mut().render_target_create(32, 32);
        let mesh = raster.storage_mut().mesh_create();
        raster
            .storage_mut()
            .mesh_add_surface(ctx, mesh, triangle())
            .expect("surface uploads");
        (raster, target, mesh)
    }

    #[test]
    fn unlit_instance_draws_once_with_default_material() {
        let mut ctx = HeadlessContext::new(32, 32);
        let (mut raster, target, mesh) = rasterizer(&mut ctx);
        let instances = [VisibleInstance::mesh(mesh, Mat4::IDENTITY)];

        let stats = raster.render_scene(
            &mut ctx,
            &CameraSetup::default(),
            &instances,
            &[],
            None,
            None,
            target,
        );

        assert_eq!(stats.opaque_elements, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.skipped_elements, 0);
    }

    #[test]
    fn each_light_adds_an_additive_pass() {
        let mut ctx = HeadlessContext::new(32, 32);
        let (mut raster, target, mesh) = rasterizer(&mut ctx);
        let sun = raster.storage_mut().light_create(LightKind::Directional);
        let lamp = raster.storage_mut().light_create(LightKind::Omni);
        let sun = raster.light_instance_create(sun).expect("light exists");
        let lamp = raster.light_instance_create(lamp).expect("light exists");
        let instances = [VisibleInstance::mesh(mesh, Mat4::IDENTITY).with_lights(vec![lamp])];

        ctx.take_commands();
        let stats = raster.render_scene(
            &mut ctx,
            &CameraSetup::default(),
            &instances,
            &[sun, lamp],
            None,
            None,
            target,
        );

        assert_eq!(stats.opaque_elements, 2);
        assert_eq!(stats.draw_calls, 2);
        let blends: Vec<BlendMode> = ctx
            .commands()
            .iter()
            .filter_map(|command| match command {
                GpuCommand::ApplyPipelineState(state) => Some(state.blend),
                _ => None,
            })
            .collect();
        assert_eq!(blends.first(), Some(&BlendMode::Disabled));
        assert_eq!(blends.last(), Some(&BlendMode::Add));
    }

    #[test]
    fn next_pass_materials_add_elements() {
        let mut ctx = HeadlessContext::new(32, 32);
        let (mut raster, target, mesh) = rasterizer(&mut ctx);
        let base = raster.default_material().expect("initialized");
        let overlay = raster
            .storage_mut()
            .material_duplicate(base)
            .expect("duplicates");
        let first = raster
            .storage_mut()
            .material_duplicate(base)
            .expect("duplicates");
        raster.storage_mut().material_set_next_pass(first, Some(overlay));

        let instances = [VisibleInstance::mesh(mesh, Mat4::IDENTITY).with_material_override(first)];
        let stats = raster.render_scene(
            &mut ctx,
            &CameraSetup::default(),
            &instances,
            &[],
            None,
            None,
            target,
        );
        assert_eq!(stats.opaque_elements, 2);
    }

    #[test]
    fn shadow_only_instances_stay_out_of_the_scene_list() {
        let mut ctx = HeadlessContext::new(32, 32);
        let (mut raster, target, mesh) = rasterizer(&mut ctx);
        let mut caster = VisibleInstance::mesh(mesh, Mat4::IDENTITY);
        caster.cast_shadows = ShadowCasting::ShadowsOnly;

        let stats = raster.render_scene(
            &mut ctx,
            &CameraSetup::default(),
            &[caster],
            &[],
            None,
            None,
            target,
        );
        assert_eq!(stats.opaque_elements, 0);
        assert_eq!(stats.draw_calls, 0);
    }
}
