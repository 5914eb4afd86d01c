// src/scene/instance.rs
//! Per-frame visibility results handed to the rasterizer.

use glam::Mat4;

use crate::renderer::light_instance::LightInstanceHandle;
use crate::renderer::storage::{
    Aabb, MaterialHandle, MeshHandle, MultiMeshHandle, RasterStorage, SkeletonHandle,
    TextureHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceGeometry {
    Mesh(MeshHandle),
    MultiMesh(MultiMeshHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowCasting {
    Off,
    #[default]
    On,
    /// Casts with back faces as well.
    DoubleSided,
    /// Only rendered into shadow maps.
    ShadowsOnly,
}

/// One visible geometry instance.
#[derive(Debug, Clone)]
pub struct VisibleInstance {
    pub geometry: InstanceGeometry,
    pub transform: Mat4,
    /// Replaces every surface material when set.
    pub material_override: Option<MaterialHandle>,
    /// Per-surface materials; `None` falls back to the surface default.
    pub surface_materials: Vec<Option<MaterialHandle>>,
    pub lightmap: Option<TextureHandle>,
    pub lightmap_energy: f32,
    pub skeleton: Option<SkeletonHandle>,
    /// Omni and spot lights touching this instance.
    pub lights: Vec<LightInstanceHandle>,
    pub depth_layer: i32,
    pub cast_shadows: ShadowCasting,
    /// Set when the transform flips handedness.
    pub mirror: bool,
}

impl VisibleInstance {
    pub fn new(geometry: InstanceGeometry, transform: Mat4) -> Self {
        Self {
            geometry,
            transform,
            material_override: None,
            surface_materials: Vec::new(),
            lightmap: None,
            lightmap_energy: 1.0,
            skeleton: None,
            lights: Vec::new(),
            depth_layer: 0,
            cast_shadows: ShadowCasting::default(),
            mirror: transform.determinant() < 0.0,
        }
    }

    pub fn mesh(mesh: MeshHandle, transform: Mat4) -> Self {
        Self::new(InstanceGeometry::Mesh(mesh), transform)
    }

    pub fn multimesh(multimesh: MultiMeshHandle, transform: Mat4) -> Self {
        Self::new(InstanceGeometry::MultiMesh(multimesh), transform)
    }

    pub fn with_material_override(mut self, material: MaterialHandle) -> Self {
        self.material_override = Some(material);
        self
    }

    pub fn with_lights(mut self, lights: Vec<LightInstanceHandle>) -> Self {
        self.lights = lights;
        self
    }

    pub fn with_skeleton(mut self, skeleton: SkeletonHandle) -> Self {
        self.skeleton = Some(skeleton);
        self
    }

    /// The mesh drawn for this instance, if it still exists.
    pub fn mesh_handle(&self, storage: &RasterStorage) -> Option<MeshHandle> {
        match self.geometry {
            InstanceGeometry::Mesh(mesh) => Some(mesh),
            InstanceGeometry::MultiMesh(multimesh) => storage.multimesh(multimesh)?.mesh,
        }
    }

    /// World-space bounds of the instance's mesh.
    pub fn world_aabb(&self, storage: &RasterStorage) -> Option<Aabb> {
        let mesh = storage.mesh(self.mesh_handle(storage)?)?;
        Some(mesh.bounds().transformed(&self.transform))
    }

    pub fn casts_shadows(&self) -> bool {
        self.cast_shadows != ShadowCasting::Off
    }

    pub fn renders_in_scene(&self) -> bool {
        self.cast_shadows != ShadowCasting::ShadowsOnly
    }
}
