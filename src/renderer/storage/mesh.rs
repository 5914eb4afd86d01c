// src/renderer/storage/mesh.rs
use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};

use super::{
    MaterialHandle, MeshHandle, MultiMeshHandle, PooledBuffer, RasterStorage, SkeletonHandle,
};
use crate::error::{RasterError, RasterResult};
use crate::gpu::{
    BufferId, BufferKind, GpuContext, IndexBinding, IndexFormat, TextureDesc, TextureFilter,
    TextureFormat, TextureId, Topology,
};
use crate::renderer::vertex::{InstanceData, Vertex};

bitflags! {
    /// Vertex arrays a surface actually provides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VertexFormat: u32 {
        const VERTEX = 1 << 0;
        const NORMAL = 1 << 1;
        const TANGENT = 1 << 2;
        const COLOR = 1 << 3;
        const TEX_UV = 1 << 4;
        const TEX_UV2 = 1 << 5;
        const BONES = 1 << 6;
        const WEIGHTS = 1 << 7;
        const INDEX = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return Self::default();
        };
        iter.fold(Self { min: first, max: first }, |aabb, p| Self {
            min: aabb.min.min(p),
            max: aabb.max.max(p),
        })
    }

    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn transformed(&self, transform: &Mat4) -> Aabb {
        let corners = (0..8).map(|i| {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            transform.transform_point3(corner)
        });
        Aabb::from_points(corners)
    }
}

/// CPU-side description of a surface to upload.
#[derive(Debug, Clone, Default)]
pub struct SurfaceData {
    pub vertices: Vec<Vertex>,
    pub indices: Option<Vec<u32>>,
    pub format: VertexFormat,
    pub primitive: Topology,
    pub material: Option<MaterialHandle>,
}

#[derive(Debug, Clone)]
pub struct Surface {
    pub format: VertexFormat,
    pub primitive: Topology,
    pub vertex_buffer: BufferId,
    pub vertex_count: u32,
    pub index: Option<IndexBinding>,
    pub aabb: Aabb,
    pub material: Option<MaterialHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub surfaces: Vec<Surface>,
    pub aabb: Aabb,
    pub custom_aabb: Option<Aabb>,
}

impl Mesh {
    pub fn bounds(&self) -> Aabb {
        self.custom_aabb.unwrap_or(self.aabb)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MultiMesh {
    pub mesh: Option<MeshHandle>,
    pub instances: Vec<InstanceData>,
    /// Draws only the first `n` instances when set.
    pub visible_instances: Option<usize>,
    pub(crate) buffer: Option<PooledBuffer>,
}

impl MultiMesh {
    pub fn draw_count(&self) -> usize {
        self.visible_instances
            .map_or(self.instances.len(), |n| n.min(self.instances.len()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    pub bones: Vec<Mat4>,
    pub(crate) texture: Option<TextureId>,
    pub(crate) texture_width: u32,
    /// Set when the context cannot hold float textures.
    pub(crate) use_software: bool,
}

impl Skeleton {
    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub fn uses_software_skinning(&self) -> bool {
        self.use_software
    }
}

impl RasterStorage {
    pub fn mesh_create(&mut self) -> MeshHandle {
        self.meshes.insert(Mesh::default())
    }

    /// Uploads a surface and returns its index within the mesh.
    pub fn mesh_add_surface(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: MeshHandle,
        data: SurfaceData,
    ) -> RasterResult<usize> {
        if !self.meshes.contains_key(handle) {
            return Err(RasterError::UnknownResource("mesh"));
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        let vertex_buffer = ctx.create_buffer(BufferKind::Vertex, vertex_bytes.len().max(4) as u64)?;
        ctx.write_buffer(vertex_buffer, 0, vertex_bytes)?;

        let mut format = data.format | VertexFormat::VERTEX;
        let index = match data.indices.as_ref() {
            Some(indices) if !indices.is_empty() => {
                format |= VertexFormat::INDEX;
                let (bytes, index_format) = if data.vertices.len() <= u16::MAX as usize {
                    let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
                    (bytemuck::cast_slice::<u16, u8>(&narrow).to_vec(), IndexFormat::U16)
                } else {
                    (bytemuck::cast_slice::<u32, u8>(indices).to_vec(), IndexFormat::U32)
                };
                // Index writes must stay 4-byte aligned.
                let size = (bytes.len() as u64).div_ceil(4) * 4;
                let buffer = ctx.create_buffer(BufferKind::Index, size)?;
                let mut padded = bytes;
                padded.resize(size as usize, 0);
                ctx.write_buffer(buffer, 0, &padded)?;
                Some(IndexBinding {
                    buffer,
                    format: index_format,
                    count: indices.len() as u32,
                })
            }
            _ => None,
        };

        let aabb = Aabb::from_points(data.vertices.iter().map(|v| Vec3::from(v.pos)));
        let surface = Surface {
            format,
            primitive: data.primitive,
            vertex_buffer,
            vertex_count: data.vertices.len() as u32,
            index,
            aabb,
            material: data.material,
        };

        let mesh = self
            .meshes
            .get_mut(handle)
            .ok_or(RasterError::UnknownResource("mesh"))?;
        mesh.aabb = if mesh.surfaces.is_empty() {
            aabb
        } else {
            mesh.aabb.merge(&aabb)
        };
        mesh.surfaces.push(surface);
        Ok(mesh.surfaces.len() - 1)
    }

    pub fn mesh_surface_set_material(
        &mut self,
        handle: MeshHandle,
        surface: usize,
        material: Option<MaterialHandle>,
    ) {
        let Some(surface) = self
            .meshes
            .get_mut(handle)
            .and_then(|mesh| mesh.surfaces.get_mut(surface))
        else {
            log::warn!("mesh_surface_set_material: no surface {}", surface);
            return;
        };
        surface.material = material;
    }

    pub fn mesh_set_custom_aabb(&mut self, handle: MeshHandle, aabb: Option<Aabb>) {
        if let Some(mesh) = self.meshes.get_mut(handle) {
            mesh.custom_aabb = aabb;
        }
    }

    pub fn mesh(&self, handle: MeshHandle) -> Option<&Mesh> {
        self.meshes.get(handle)
    }

    pub fn mesh_clear(&mut self, ctx: &mut dyn GpuContext, handle: MeshHandle) {
        let Some(mesh) = self.meshes.get_mut(handle) else {
            return;
        };
        for surface in mesh.surfaces.drain(..) {
            ctx.delete_buffer(surface.vertex_buffer);
            if let Some(index) = surface.index {
                ctx.delete_buffer(index.buffer);
            }
        }
        mesh.aabb = Aabb::default();
    }

    pub fn mesh_free(&mut self, ctx: &mut dyn GpuContext, handle: MeshHandle) {
        self.mesh_clear(ctx, handle);
        self.meshes.remove(handle);
    }

    pub fn multimesh_create(&mut self) -> MultiMeshHandle {
        self.multimeshes.insert(MultiMesh::default())
    }

    pub fn multimesh_allocate(&mut self, handle: MultiMeshHandle, instances: usize) {
        let Some(multimesh) = self.multimeshes.get_mut(handle) else {
            return;
        };
        multimesh.instances = vec![InstanceData::new(Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO); instances];
        self.mark_multimesh_dirty(handle);
    }

    pub fn multimesh_set_mesh(&mut self, handle: MultiMeshHandle, mesh: Option<MeshHandle>) {
        if let Some(multimesh) = self.multimeshes.get_mut(handle) {
            multimesh.mesh = mesh;
        }
    }

    pub fn multimesh_instance_set_transform(
        &mut self,
        handle: MultiMeshHandle,
        index: usize,
        transform: Mat4,
    ) {
        let Some(instance) = self
            .multimeshes
            .get_mut(handle)
            .and_then(|mm| mm.instances.get_mut(index))
        else {
            return;
        };
        let updated = InstanceData::new(transform, Vec4::from(instance.color), Vec4::from(instance.custom));
        *instance = updated;
        self.mark_multimesh_dirty(handle);
    }

    pub fn multimesh_instance_set_color(&mut self, handle: MultiMeshHandle, index: usize, color: Vec4) {
        let Some(instance) = self
            .multimeshes
            .get_mut(handle)
            .and_then(|mm| mm.instances.get_mut(index))
        else {
            return;
        };
        instance.color = color.to_array();
        self.mark_multimesh_dirty(handle);
    }

    pub fn multimesh_instance_set_custom_data(
        &mut self,
        handle: MultiMeshHandle,
        index: usize,
        custom: Vec4,
    ) {
        let Some(instance) = self
            .multimeshes
            .get_mut(handle)
            .and_then(|mm| mm.instances.get_mut(index))
        else {
            return;
        };
        instance.custom = custom.to_array();
        self.mark_multimesh_dirty(handle);
    }

    pub fn multimesh_set_visible_instances(&mut self, handle: MultiMeshHandle, visible: Option<usize>) {
        if let Some(multimesh) = self.multimeshes.get_mut(handle) {
            multimesh.visible_instances = visible;
        }
    }

    pub fn multimesh(&self, handle: MultiMeshHandle) -> Option<&MultiMesh> {
        self.multimeshes.get(handle)
    }

    pub fn multimesh_free(&mut self, handle: MultiMeshHandle) {
        if let Some(multimesh) = self.multimeshes.remove(handle) {
            if let Some(buffer) = multimesh.buffer {
                self.buffers.release(buffer);
            }
        }
    }

    pub(crate) fn flush_multimesh(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: MultiMeshHandle,
    ) -> RasterResult<()> {
        let Some(multimesh) = self.multimeshes.get_mut(handle) else {
            return Ok(());
        };
        if multimesh.instances.is_empty() {
            if let Some(buffer) = multimesh.buffer.take() {
                self.buffers.release(buffer);
            }
            return Ok(());
        }

        let needed = (multimesh.instances.len() as u64) * InstanceData::STRIDE;
        let current = multimesh.buffer;
        let buffer = match current {
            Some(buffer) if buffer.size >= needed => buffer,
            previous => {
                if let Some(old) = previous {
                    self.buffers.release(old);
                }
                let fresh = self.buffers.acquire(ctx, BufferKind::Instance, needed)?;
                multimesh.buffer = Some(fresh);
                fresh
            }
        };
        ctx.write_buffer(buffer.id, 0, bytemuck::cast_slice(&multimesh.instances))
    }

    pub fn skeleton_create(&mut self) -> SkeletonHandle {
        self.skeletons.insert(Skeleton::default())
    }

    pub fn skeleton_allocate(&mut self, handle: SkeletonHandle, bones: usize) {
        let Some(skeleton) = self.skeletons.get_mut(handle) else {
            return;
        };
        skeleton.bones = vec![Mat4::IDENTITY; bones];
        self.mark_skeleton_dirty(handle);
    }

    pub fn skeleton_bone_set_transform(&mut self, handle: SkeletonHandle, bone: usize, transform: Mat4) {
        let Some(slot) = self
            .skeletons
            .get_mut(handle)
            .and_then(|skeleton| skeleton.bones.get_mut(bone))
        else {
            return;
        };
        *slot = transform;
        self.mark_skeleton_dirty(handle);
    }

    pub fn skeleton(&self, handle: SkeletonHandle) -> Option<&Skeleton> {
        self.skeletons.get(handle)
    }

    pub fn skeleton_free(&mut self, ctx: &mut dyn GpuContext, handle: SkeletonHandle) {
        if let Some(skeleton) = self.skeletons.remove(handle) {
            if let Some(texture) = skeleton.texture {
                ctx.delete_texture(texture);
            }
        }
    }

    /// Packs bones as three RGBA32F texels each (rows of a 3x4 matrix).
    pub(crate) fn flush_skeleton(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: SkeletonHandle,
    ) -> RasterResult<()> {
        let Some(skeleton) = self.skeletons.get_mut(handle) else {
            return Ok(());
        };

        if !ctx.supports_format(TextureFormat::Rgba32Float) {
            if !skeleton.use_software {
                log::warn!("Float textures unavailable, skeletons fall back to software skinning");
            }
            skeleton.use_software = true;
            return Ok(());
        }

        let width = (skeleton.bones.len() as u32 * 3).max(1);
        if skeleton.texture.is_none() || skeleton.texture_width != width {
            if let Some(old) = skeleton.texture.take() {
                ctx.delete_texture(old);
            }
            let texture = ctx.create_texture(&TextureDesc {
                width,
                height: 1,
                format: TextureFormat::Rgba32Float,
                filter: TextureFilter::Nearest,
                render_target: false,
            })?;
            skeleton.texture = Some(texture);
            skeleton.texture_width = width;
        }

        let mut texels: Vec<f32> = Vec::with_capacity(width as usize * 4);
        for bone in &skeleton.bones {
            let rows = bone.transpose();
            texels.extend_from_slice(&rows.x_axis.to_array());
            texels.extend_from_slice(&rows.y_axis.to_array());
            texels.extend_from_slice(&rows.z_axis.to_array());
        }
        texels.resize(width as usize * 4, 0.0);

        match skeleton.texture {
            Some(texture) => ctx.write_texture(texture, bytemuck::cast_slice(&texels)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuCommand, HeadlessContext};
    use crate::renderer::vertex::v;

    fn triangle() -> SurfaceData {
        SurfaceData {
            vertices: vec![
                v([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
                v([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
                v([0.0, 2.0, -1.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
            ],
            indices: Some(vec![0, 1, 2]),
            format: VertexFormat::NORMAL | VertexFormat::TEX_UV,
            ..SurfaceData::default()
        }
    }

    #[test]
    fn surfaces_accumulate_bounds_and_index_format() {
        let mut ctx = HeadlessContext::new(8, 8);
        let mut storage = RasterStorage::new();
        let mesh = storage.mesh_create();

        let index = storage
            .mesh_add_surface(&mut ctx, mesh, triangle())
            .expect("upload succeeds");
        assert_eq!(index, 0);

        let mesh_ref = storage.mesh(mesh).expect("mesh exists");
        let surface = &mesh_ref.surfaces[0];
        assert!(surface.format.contains(VertexFormat::INDEX | VertexFormat::VERTEX));
        assert_eq!(surface.index.map(|i| i.format), Some(IndexFormat::U16));
        assert_eq!(mesh_ref.aabb.max, Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(mesh_ref.aabb.min, Vec3::new(0.0, 0.0, -1.0));

        storage.mesh_free(&mut ctx, mesh);
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn dirty_flush_uploads_multimesh_once() {
        let mut ctx = HeadlessContext::new(8, 8);
        let mut storage = RasterStorage::new();
        let multimesh = storage.multimesh_create();
        storage.multimesh_allocate(multimesh, 4);
        storage.multimesh_instance_set_color(multimesh, 1, Vec4::new(1.0, 0.0, 0.0, 1.0));
        storage.multimesh_instance_set_transform(multimesh, 2, Mat4::from_scale(Vec3::splat(2.0)));

        assert_eq!(storage.pending_updates(), 1, "repeated edits queue one flush");
        storage.update_dirty_resources(&mut ctx);
        assert_eq!(storage.pending_updates(), 0);

        let writes = ctx
            .log()
            .count(|cmd| matches!(cmd, GpuCommand::WriteBuffer { .. }));
        assert_eq!(writes, 1);
        assert!(storage.multimesh(multimesh).and_then(|mm| mm.buffer).is_some());
    }

    #[test]
    fn skeleton_flush_packs_three_texels_per_bone() {
        let mut ctx = HeadlessContext::new(8, 8);
        let mut storage = RasterStorage::new();
        let skeleton = storage.skeleton_create();
        storage.skeleton_allocate(skeleton, 5);
        storage.update_dirty_resources(&mut ctx);

        let texture = storage
            .skeleton(skeleton)
            .and_then(Skeleton::texture)
            .expect("float textures are supported headless");
        assert_eq!(ctx.texture_desc(texture).map(|d| d.width), Some(15));
    }

    #[test]
    fn skeleton_without_float_textures_uses_software() {
        let mut ctx = HeadlessContext::new(8, 8).with_unsupported_format(TextureFormat::Rgba32Float);
        let mut storage = RasterStorage::new();
        let skeleton = storage.skeleton_create();
        storage.skeleton_allocate(skeleton, 2);
        storage.update_dirty_resources(&mut ctx);

        let skeleton = storage.skeleton(skeleton).expect("exists");
        assert!(skeleton.uses_software_skinning());
        assert!(skeleton.texture().is_none());
    }
}
