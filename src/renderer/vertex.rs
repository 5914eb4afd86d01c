use bytemuck::{Pod, Zeroable};
use std::mem;

/// Interleaved vertex shared by every surface. Arrays a surface does not
/// provide keep their defaults and are masked out by its format flags.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub color: [f32; 4],
    pub uv: [f32; 2],
    pub uv2: [f32; 2],
    pub bones: [f32; 4],
    pub weights: [f32; 4],
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            pos: [0.0; 3],
            normal: [0.0, 1.0, 0.0],
            tangent: [1.0, 0.0, 0.0, 1.0],
            color: [1.0; 4],
            uv: [0.0; 2],
            uv2: [0.0; 2],
            bones: [0.0; 4],
            weights: [0.0; 4],
        }
    }
}

impl Vertex {
    pub const ATTRS: [wgpu::VertexAttribute; 8] = wgpu::vertex_attr_array![
        0 => Float32x3,
        1 => Float32x3,
        2 => Float32x4,
        3 => Float32x4,
        4 => Float32x2,
        5 => Float32x2,
        6 => Float32x4,
        7 => Float32x4
    ];

    pub const STRIDE: u64 = mem::size_of::<Vertex>() as u64;
}

/// Per-instance data for multimesh draws: a 3x4 row-major transform plus
/// color and custom data.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct InstanceData {
    pub xform: [[f32; 4]; 3],
    pub color: [f32; 4],
    pub custom: [f32; 4],
}

impl InstanceData {
    pub const ATTRS: [wgpu::VertexAttribute; 5] = wgpu::vertex_attr_array![
        8 => Float32x4,
        9 => Float32x4,
        10 => Float32x4,
        11 => Float32x4,
        12 => Float32x4
    ];

    pub const STRIDE: u64 = mem::size_of::<InstanceData>() as u64;

    pub fn new(transform: glam::Mat4, color: glam::Vec4, custom: glam::Vec4) -> Self {
        let rows = transform.transpose();
        Self {
            xform: [
                rows.x_axis.to_array(),
                rows.y_axis.to_array(),
                rows.z_axis.to_array(),
            ],
            color: color.to_array(),
            custom: custom.to_array(),
        }
    }
}

#[inline]
pub fn v(pos: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Vertex {
    Vertex {
        pos,
        normal,
        uv,
        ..Vertex::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3, Vec4};

    #[test]
    fn vertex_stride_matches_attribute_span() {
        let last = Vertex::ATTRS[7];
        assert_eq!(Vertex::STRIDE, last.offset + 16);
        assert_eq!(InstanceData::STRIDE, 80);
    }

    #[test]
    fn instance_rows_carry_translation_in_w() {
        let data = InstanceData::new(
            Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            Vec4::ONE,
            Vec4::ZERO,
        );
        assert_eq!(data.xform[0][3], 1.0);
        assert_eq!(data.xform[1][3], 2.0);
        assert_eq!(data.xform[2][3], 3.0);
    }
}
