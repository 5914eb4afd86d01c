// src/renderer/primitives.rs
//! Procedural surfaces used by the demo and the tests.

use std::f32::consts::PI;

use glam::Vec3;

use super::storage::{SurfaceData, VertexFormat};
use super::vertex::Vertex;
use crate::gpu::Topology;

const LIT_FORMAT: VertexFormat = VertexFormat::VERTEX
    .union(VertexFormat::NORMAL)
    .union(VertexFormat::TANGENT)
    .union(VertexFormat::TEX_UV)
    .union(VertexFormat::INDEX);

fn vertex(pos: Vec3, normal: Vec3, uv: [f32; 2], tangent: Vec3) -> Vertex {
    Vertex {
        pos: pos.to_array(),
        normal: normal.to_array(),
        uv,
        tangent: tangent.extend(1.0).to_array(),
        ..Vertex::default()
    }
}

fn surface(vertices: Vec<Vertex>, indices: Vec<u32>) -> SurfaceData {
    SurfaceData {
        vertices,
        indices: Some(indices),
        format: LIT_FORMAT,
        primitive: Topology::Triangles,
        material: None,
    }
}

/// Unit sphere centered on the origin.
pub fn sphere(segments: u32, rings: u32) -> SurfaceData {
    let segments = segments.max(3);
    let rings = rings.max(2);
    let mut vertices = Vec::with_capacity(((segments + 1) * (rings + 1)) as usize);
    for ring in 0..=rings {
        let phi = PI * ring as f32 / rings as f32;
        for segment in 0..=segments {
            let theta = 2.0 * PI * segment as f32 / segments as f32;
            let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
            let tangent = Vec3::new(-theta.sin(), 0.0, theta.cos());
            let uv = [segment as f32 / segments as f32, ring as f32 / rings as f32];
            vertices.push(vertex(normal, normal, uv, tangent));
        }
    }

    let mut indices = Vec::with_capacity((segments * rings * 6) as usize);
    for ring in 0..rings {
        for segment in 0..segments {
            let current = ring * (segments + 1) + segment;
            let next = current + segments + 1;
            indices.extend_from_slice(&[current, current + 1, next, current + 1, next + 1, next]);
        }
    }
    surface(vertices, indices)
}

/// Axis-aligned cube with unit edges.
pub fn cube() -> SurfaceData {
    let faces = [
        (Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_X, Vec3::Z),
        (Vec3::Y, Vec3::X),
        (Vec3::NEG_Y, Vec3::X),
        (Vec3::Z, Vec3::X),
        (Vec3::NEG_Z, Vec3::NEG_X),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, tangent) in faces {
        let bitangent = normal.cross(tangent);
        let base = vertices.len() as u32;
        for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            let pos = normal * 0.5 + tangent * (u - 0.5) + bitangent * (v - 0.5);
            vertices.push(vertex(pos, normal, [u, 1.0 - v], tangent));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    surface(vertices, indices)
}

/// Square in the XZ plane facing +Y.
pub fn plane(size: f32) -> SurfaceData {
    let half = size * 0.5;
    let corners = [(-half, half), (half, half), (half, -half), (-half, -half)];
    let vertices = corners
        .iter()
        .map(|&(x, z)| {
            let uv = [x / size + 0.5, z / size + 0.5];
            vertex(Vec3::new(x, 0.0, z), Vec3::Y, uv, Vec3::X)
        })
        .collect();
    surface(vertices, vec![0, 1, 2, 0, 2, 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normals_face_outwards(data: &SurfaceData) -> bool {
        let indices = data.indices.as_deref().unwrap_or_default();
        indices.chunks(3).all(|tri| {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(data.vertices[i as usize].pos));
            let face = (b - a).cross(c - a);
            let normal = Vec3::from(data.vertices[tri[0] as usize].normal);
            face.length_squared() < 1e-12 || face.dot(normal) > 0.0
        })
    }

    #[test]
    fn cube_winding_is_counter_clockwise() {
        let cube = cube();
        assert_eq!(cube.vertices.len(), 24);
        assert!(normals_face_outwards(&cube));
    }

    #[test]
    fn sphere_vertices_lie_on_the_unit_sphere() {
        let sphere = sphere(16, 8);
        assert!(sphere
            .vertices
            .iter()
            .all(|v| (Vec3::from(v.pos).length() - 1.0).abs() < 1e-5));
        assert!(normals_face_outwards(&sphere));
    }

    #[test]
    fn plane_faces_up() {
        assert!(normals_face_outwards(&plane(4.0)));
    }
}
