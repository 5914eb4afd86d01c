// src/renderer/light_instance.rs
//! Light instances and the registry that pairs them with shadow atlases.
//!
//! Lights and atlases reference each other through handles only: an atlas
//! maps each owning light to its slot key, and each light keeps the set of
//! atlases it occupies. Both sides are updated together so eviction never
//! has to search.

use std::collections::HashSet;

use glam::{Mat4, Vec3};
use slotmap::SlotMap;

use super::shadow_atlas::{ShadowAtlas, ShadowRequest};
use super::storage::{LightHandle, LightKind, RasterStorage};
use crate::gpu::{GpuContext, Viewport};
use crate::time::TickSource;

slotmap::new_key_type! {
    pub struct LightInstanceHandle;
    pub struct ShadowAtlasHandle;
}

/// Camera used to render one cascade or face of a light's shadow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowTransform {
    pub camera: Mat4,
    /// Light-to-world transform for this face.
    pub transform: Mat4,
    pub farplane: f32,
    pub split: f32,
    pub bias_scale: f32,
}

impl Default for ShadowTransform {
    fn default() -> Self {
        Self {
            camera: Mat4::IDENTITY,
            transform: Mat4::IDENTITY,
            farplane: 0.0,
            split: 0.0,
            bias_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LightInstance {
    pub light: LightHandle,
    pub kind: LightKind,
    pub transform: Mat4,
    pub shadow_transforms: [ShadowTransform; 4],
    /// World-space direction the light points in (-Z of its transform).
    pub light_direction: Vec3,
    pub spot_direction: Vec3,
    pub last_scene_pass: u64,
    pub last_scene_shadow_pass: u64,
    /// Index into the frame's visible light list, assigned during fill.
    pub light_index: u32,
    /// Sub-rectangle of the directional shadow texture, once assigned.
    pub directional_rect: Option<Viewport>,
    /// Bumped when the shadow this light casts has to be redrawn.
    pub version: u64,
    pub(crate) shadow_atlases: HashSet<ShadowAtlasHandle>,
}

impl LightInstance {
    fn new(light: LightHandle, kind: LightKind) -> Self {
        Self {
            light,
            kind,
            transform: Mat4::IDENTITY,
            shadow_transforms: [ShadowTransform::default(); 4],
            light_direction: Vec3::NEG_Z,
            spot_direction: Vec3::NEG_Z,
            last_scene_pass: 0,
            last_scene_shadow_pass: 0,
            light_index: 0,
            directional_rect: None,
            version: 1,
            shadow_atlases: HashSet::new(),
        }
    }

    pub fn position(&self) -> Vec3 {
        self.transform.w_axis.truncate()
    }

    pub fn shadow_atlases(&self) -> impl Iterator<Item = ShadowAtlasHandle> + '_ {
        self.shadow_atlases.iter().copied()
    }
}

/// Owns light instances, shadow atlases and the clock that ages atlas slots.
pub struct LightRegistry {
    pub(crate) lights: SlotMap<LightInstanceHandle, LightInstance>,
    pub(crate) atlases: SlotMap<ShadowAtlasHandle, ShadowAtlas>,
    ticks: Box<dyn TickSource>,
    tolerance_ms: u64,
    scene_pass: u64,
}

impl LightRegistry {
    pub fn new(ticks: Box<dyn TickSource>, tolerance_ms: u64) -> Self {
        Self {
            lights: SlotMap::with_key(),
            atlases: SlotMap::with_key(),
            ticks,
            tolerance_ms,
            scene_pass: 0,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.ticks.now_ms()
    }

    pub fn scene_pass(&self) -> u64 {
        self.scene_pass
    }

    /// Starts a new scene pass; lights marked visible from now on count as
    /// in use for eviction purposes.
    pub fn begin_scene_pass(&mut self) -> u64 {
        self.scene_pass += 1;
        self.scene_pass
    }

    pub fn light_instance_create(
        &mut self,
        storage: &RasterStorage,
        light: LightHandle,
    ) -> Option<LightInstanceHandle> {
        let Some(resource) = storage.light(light) else {
            log::warn!("light_instance_create with unknown light");
            return None;
        };
        Some(self.lights.insert(LightInstance::new(light, resource.kind)))
    }

    pub fn light_instance(&self, handle: LightInstanceHandle) -> Option<&LightInstance> {
        self.lights.get(handle)
    }

    pub fn light_instance_set_transform(&mut self, handle: LightInstanceHandle, transform: Mat4) {
        let Some(instance) = self.lights.get_mut(handle) else {
            return;
        };
        if instance.transform != transform {
            instance.version += 1;
        }
        instance.transform = transform;
        let forward = transform.transform_vector3(Vec3::NEG_Z).normalize_or_zero();
        instance.light_direction = forward;
        instance.spot_direction = forward;
    }

    /// Stores the shadow camera for one cascade (directional) or face.
    /// Only directional lights have more than one slot; other kinds always
    /// write slot 0.
    #[allow(clippy::too_many_arguments)]
    pub fn light_instance_set_shadow_transform(
        &mut self,
        handle: LightInstanceHandle,
        camera: Mat4,
        transform: Mat4,
        farplane: f32,
        split: f32,
        pass: usize,
        bias_scale: f32,
    ) {
        let Some(instance) = self.lights.get_mut(handle) else {
            return;
        };
        let pass = if instance.kind == LightKind::Directional {
            pass.min(3)
        } else {
            0
        };
        instance.shadow_transforms[pass] = ShadowTransform {
            camera,
            transform,
            farplane,
            split,
            bias_scale,
        };
    }

    pub fn light_instance_mark_visible(&mut self, handle: LightInstanceHandle) {
        let pass = self.scene_pass;
        if let Some(instance) = self.lights.get_mut(handle) {
            instance.last_scene_pass = pass;
        }
    }

    /// Forces the light's shadow to be redrawn, e.g. after a caster moved.
    pub fn light_instance_mark_shadow_dirty(&mut self, handle: LightInstanceHandle) {
        if let Some(instance) = self.lights.get_mut(handle) {
            instance.version += 1;
        }
    }

    pub(crate) fn light_instance_set_index(&mut self, handle: LightInstanceHandle, index: u32) {
        if let Some(instance) = self.lights.get_mut(handle) {
            instance.light_index = index;
        }
    }

    pub(crate) fn light_instance_set_directional_rect(
        &mut self,
        handle: LightInstanceHandle,
        rect: Option<Viewport>,
    ) {
        if let Some(instance) = self.lights.get_mut(handle) {
            instance.directional_rect = rect;
        }
    }

    pub(crate) fn light_instance_mark_shadow_pass(&mut self, handle: LightInstanceHandle) {
        let pass = self.scene_pass;
        if let Some(instance) = self.lights.get_mut(handle) {
            instance.last_scene_shadow_pass = pass;
        }
    }

    /// Releases every atlas slot the light holds, then drops it.
    pub fn light_instance_free(&mut self, handle: LightInstanceHandle) {
        let Some(instance) = self.lights.remove(handle) else {
            return;
        };
        for atlas in instance.shadow_atlases {
            if let Some(atlas) = self.atlases.get_mut(atlas) {
                atlas.release_owner(handle);
            }
        }
    }

    pub fn shadow_atlas_create(&mut self) -> ShadowAtlasHandle {
        self.atlases.insert(ShadowAtlas::new())
    }

    pub fn shadow_atlas(&self, handle: ShadowAtlasHandle) -> Option<&ShadowAtlas> {
        self.atlases.get(handle)
    }

    pub(crate) fn shadow_atlas_mut(&mut self, handle: ShadowAtlasHandle) -> Option<&mut ShadowAtlas> {
        self.atlases.get_mut(handle)
    }

    /// Resizes the atlas (rounded up to a power of two), dropping every
    /// assignment and the GPU storage. Storage is recreated lazily.
    pub fn shadow_atlas_set_size(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: ShadowAtlasHandle,
        size: u32,
    ) {
        let Some(atlas) = self.atlases.get_mut(handle) else {
            return;
        };
        let size = if size == 0 { 0 } else { size.next_power_of_two() };
        if atlas.size == size {
            return;
        }
        for owner in atlas.reset(size) {
            if let Some(light) = self.lights.get_mut(owner) {
                light.shadow_atlases.remove(&handle);
            }
        }
        atlas.release_gpu(ctx);
        log::info!("Shadow atlas resized to {}", size);
    }

    pub fn shadow_atlas_set_quadrant_subdivision(
        &mut self,
        handle: ShadowAtlasHandle,
        quadrant: usize,
        subdivision: u32,
    ) {
        let Some(atlas) = self.atlases.get_mut(handle) else {
            return;
        };
        if quadrant >= 4 {
            log::warn!("Shadow atlas quadrant {} out of range", quadrant);
            return;
        }
        for owner in atlas.set_quadrant_subdivision(quadrant, subdivision) {
            if let Some(light) = self.lights.get_mut(owner) {
                light.shadow_atlases.remove(&handle);
            }
        }
    }

    /// Finds or keeps a slot for `light`. Returns whether its shadow has to
    /// be redrawn this frame; `false` also covers "no slot available".
    pub fn shadow_atlas_update_light(
        &mut self,
        atlas: ShadowAtlasHandle,
        light: LightInstanceHandle,
        coverage: f32,
        light_version: u64,
    ) -> bool {
        let request = ShadowRequest {
            coverage,
            light_version,
            now_ms: self.ticks.now_ms(),
            scene_pass: self.scene_pass,
            tolerance_ms: self.tolerance_ms,
        };
        let Some(shadow_atlas) = self.atlases.get_mut(atlas) else {
            return false;
        };
        shadow_atlas.update_light(atlas, light, &mut self.lights, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualTicks;

    fn registry_with_light(kind: LightKind) -> (LightRegistry, LightInstanceHandle) {
        let mut storage = RasterStorage::new();
        let light = storage.light_create(kind);
        let mut registry = LightRegistry::new(Box::new(ManualTicks::new(0)), 500);
        let instance = registry
            .light_instance_create(&storage, light)
            .expect("light exists");
        (registry, instance)
    }

    #[test]
    fn non_directional_cascade_index_is_normalized() {
        let (mut registry, omni) = registry_with_light(LightKind::Omni);
        let camera = Mat4::from_scale(Vec3::splat(2.0));
        registry.light_instance_set_shadow_transform(omni, camera, Mat4::IDENTITY, 10.0, 0.0, 3, 1.0);

        let instance = registry.light_instance(omni).expect("instance exists");
        assert_eq!(instance.shadow_transforms[0].camera, camera);
        assert_eq!(instance.shadow_transforms[3].camera, Mat4::IDENTITY);
    }

    #[test]
    fn transform_updates_cached_direction() {
        let (mut registry, light) = registry_with_light(LightKind::Spot);
        registry.light_instance_set_transform(light, Mat4::from_rotation_x(-std::f32::consts::FRAC_PI_2));

        let direction = registry.light_instance(light).expect("exists").light_direction;
        assert!((direction - Vec3::NEG_Y).length() < 1e-5, "got {direction:?}");
    }

    #[test]
    fn freeing_a_light_releases_its_slot() {
        let (mut registry, light) = registry_with_light(LightKind::Spot);
        let atlas = registry.shadow_atlas_create();
        let mut ctx = crate::gpu::HeadlessContext::new(8, 8);
        registry.shadow_atlas_set_size(&mut ctx, atlas, 1024);
        registry.shadow_atlas_set_quadrant_subdivision(atlas, 0, 4);

        assert!(registry.shadow_atlas_update_light(atlas, light, 0.5, 1));
        registry.light_instance_free(light);

        let atlas = registry.shadow_atlas(atlas).expect("atlas exists");
        assert_eq!(atlas.owner_count(), 0);
        assert_eq!(atlas.occupied_slots(), 0);
    }
}
