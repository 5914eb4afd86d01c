// src/gpu/mod.rs
//! The stateful graphics API the rasterizer drives.
//!
//! Everything the scene rasterizer needs from a GPU goes through
//! [`GpuContext`]: a small, GL-shaped state machine of programs, uniforms,
//! texture units, framebuffers and draw calls. [`HeadlessContext`] records the
//! command stream for inspection; [`WgpuContext`] replays it into wgpu passes.

pub mod compiler;
pub mod headless;
pub mod pipeline_builder;
pub mod recorder;
pub mod wgpu_backend;

use std::collections::BTreeMap;

use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::error::RasterResult;

pub use compiler::{compile_program_source, CompiledShader};
pub use headless::HeadlessContext;
pub use recorder::GpuCommand;
pub use wgpu_backend::WgpuContext;

/// Texture bindings at or above this index hold raw float data and are
/// read with `texelFetch` only.
pub const DATA_TEXTURE_BINDING_START: u32 = 12;
/// Highest texture binding a program may declare.
pub const MAX_TEXTURE_BINDINGS: u32 = 16;
/// Binding of the linear, repeating sampler in the texture group.
pub const LINEAR_SAMPLER_BINDING: u32 = 16;
/// Binding of the nearest, clamped sampler in the texture group.
pub const NEAREST_SAMPLER_BINDING: u32 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniformKind {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}

impl UniformKind {
    pub const fn size(self) -> usize {
        match self {
            UniformKind::Float | UniformKind::Int => 4,
            UniformKind::Vec2 => 8,
            UniformKind::Vec3 => 12,
            UniformKind::Vec4 => 16,
            UniformKind::Mat4 => 64,
        }
    }

    /// GLSL type name used when generating uniform blocks.
    pub const fn glsl_name(self) -> &'static str {
        match self {
            UniformKind::Float => "float",
            UniformKind::Int => "int",
            UniformKind::Vec2 => "vec2",
            UniformKind::Vec3 => "vec3",
            UniformKind::Vec4 => "vec4",
            UniformKind::Mat4 => "mat4",
        }
    }
}

/// A single uniform value as uploaded to a program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl UniformValue {
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::Int(_) => UniformKind::Int,
            UniformValue::Vec2(_) => UniformKind::Vec2,
            UniformValue::Vec3(_) => UniformKind::Vec3,
            UniformValue::Vec4(_) => UniformKind::Vec4,
            UniformValue::Mat4(_) => UniformKind::Mat4,
        }
    }

    /// Zero value of the given kind.
    pub fn zero(kind: UniformKind) -> Self {
        match kind {
            UniformKind::Float => UniformValue::Float(0.0),
            UniformKind::Int => UniformValue::Int(0),
            UniformKind::Vec2 => UniformValue::Vec2(Vec2::ZERO),
            UniformKind::Vec3 => UniformValue::Vec3(Vec3::ZERO),
            UniformKind::Vec4 => UniformValue::Vec4(Vec4::ZERO),
            UniformKind::Mat4 => UniformValue::Mat4(Mat4::ZERO),
        }
    }

    /// Component-wise comparison. Values of different kinds never match.
    pub fn approx_eq(&self, other: &UniformValue, epsilon: f32) -> bool {
        let close = |a: &[f32], b: &[f32]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= epsilon);
        match (self, other) {
            (UniformValue::Float(a), UniformValue::Float(b)) => (a - b).abs() <= epsilon,
            (UniformValue::Int(a), UniformValue::Int(b)) => a == b,
            (UniformValue::Vec2(a), UniformValue::Vec2(b)) => close(&a.to_array(), &b.to_array()),
            (UniformValue::Vec3(a), UniformValue::Vec3(b)) => close(&a.to_array(), &b.to_array()),
            (UniformValue::Vec4(a), UniformValue::Vec4(b)) => close(&a.to_array(), &b.to_array()),
            (UniformValue::Mat4(a), UniformValue::Mat4(b)) => {
                close(&a.to_cols_array(), &b.to_cols_array())
            }
            _ => false,
        }
    }

    /// Writes the value with std140 member layout into `dst`.
    pub fn write_bytes(&self, dst: &mut [u8]) {
        let size = self.kind().size().min(dst.len());
        match self {
            UniformValue::Float(v) => dst[..size].copy_from_slice(&bytemuck::bytes_of(v)[..size]),
            UniformValue::Int(v) => dst[..size].copy_from_slice(&bytemuck::bytes_of(v)[..size]),
            UniformValue::Vec2(v) => {
                dst[..size].copy_from_slice(&bytemuck::cast_slice::<f32, u8>(&v.to_array())[..size])
            }
            UniformValue::Vec3(v) => {
                dst[..size].copy_from_slice(&bytemuck::cast_slice::<f32, u8>(&v.to_array())[..size])
            }
            UniformValue::Vec4(v) => {
                dst[..size].copy_from_slice(&bytemuck::cast_slice::<f32, u8>(&v.to_array())[..size])
            }
            UniformValue::Mat4(v) => {
                dst[..size].copy_from_slice(&bytemuck::cast_slice::<f32, u8>(&v.to_cols_array())[..size])
            }
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        UniformValue::Vec4(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        UniformValue::Mat4(value)
    }
}

/// Byte offset and type of a member inside a program's uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation {
    pub offset: u32,
    pub kind: UniformKind,
}

/// What the compiler learned about a linked program.
#[derive(Debug, Clone, Default)]
pub struct ProgramReflection {
    pub block_size: u32,
    pub uniforms: BTreeMap<String, UniformLocation>,
    /// Texture name to texture unit (binding in the texture group).
    pub textures: BTreeMap<String, u32>,
    pub samplers: Vec<u32>,
    pub vertex_inputs: Vec<u32>,
}

impl ProgramReflection {
    pub fn uniform(&self, name: &str) -> Option<UniformLocation> {
        self.uniforms.get(name).copied()
    }

    pub fn texture_unit(&self, name: &str) -> Option<u32> {
        self.textures.get(name).copied()
    }
}

/// A linked program handle plus its reflection.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub id: ProgramId,
    pub reflection: ProgramReflection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    Bc1RgbaUnorm,
    Etc2Rgb8Unorm,
}

impl TextureFormat {
    pub const fn is_compressed(self) -> bool {
        matches!(self, TextureFormat::Bc1RgbaUnorm | TextureFormat::Etc2Rgb8Unorm)
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    /// Byte length of a full mip-0 upload at the given size.
    pub fn data_size(self, width: u32, height: u32) -> usize {
        let (width, height) = (width as usize, height as usize);
        match self {
            TextureFormat::R8Unorm => width * height,
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => width * height * 4,
            TextureFormat::Depth32Float => width * height * 4,
            TextureFormat::Rgba16Float => width * height * 8,
            TextureFormat::Rgba32Float => width * height * 16,
            TextureFormat::Bc1RgbaUnorm | TextureFormat::Etc2Rgb8Unorm => {
                width.div_ceil(4) * height.div_ceil(4) * 8
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureFilter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub filter: TextureFilter,
    pub render_target: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferDesc {
    pub color: Option<TextureId>,
    pub depth: Option<TextureId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearRequest {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Disabled,
    Mix,
    Add,
    Sub,
    Mul,
    PremultAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CullMode {
    Disabled,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthFunc {
    Less,
    #[default]
    LessEqual,
    Equal,
    Always,
}

bitflags! {
    /// Fields that differ between two [`PipelineState`] values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineChanges: u8 {
        const BLEND = 1 << 0;
        const CULL = 1 << 1;
        const FRONT_FACE = 1 << 2;
        const DEPTH_TEST = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_FUNC = 1 << 5;
        const COLOR_WRITE = 1 << 6;
    }
}

/// Fixed-function state for the next draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub blend: BlendMode,
    pub cull: CullMode,
    pub front_face_ccw: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: DepthFunc,
    pub color_write: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            blend: BlendMode::Disabled,
            cull: CullMode::Back,
            front_face_ccw: true,
            depth_test: true,
            depth_write: true,
            depth_func: DepthFunc::LessEqual,
            color_write: true,
        }
    }
}

impl PipelineState {
    /// Full-screen passes: no depth, no culling, opaque.
    pub const fn fullscreen() -> Self {
        Self {
            blend: BlendMode::Disabled,
            cull: CullMode::Disabled,
            front_face_ccw: true,
            depth_test: false,
            depth_write: false,
            depth_func: DepthFunc::Always,
            color_write: true,
        }
    }

    pub fn changes_from(&self, previous: &PipelineState) -> PipelineChanges {
        let mut changes = PipelineChanges::empty();
        changes.set(PipelineChanges::BLEND, self.blend != previous.blend);
        changes.set(PipelineChanges::CULL, self.cull != previous.cull);
        changes.set(
            PipelineChanges::FRONT_FACE,
            self.front_face_ccw != previous.front_face_ccw,
        );
        changes.set(
            PipelineChanges::DEPTH_TEST,
            self.depth_test != previous.depth_test,
        );
        changes.set(
            PipelineChanges::DEPTH_WRITE,
            self.depth_write != previous.depth_write,
        );
        changes.set(
            PipelineChanges::DEPTH_FUNC,
            self.depth_func != previous.depth_func,
        );
        changes.set(
            PipelineChanges::COLOR_WRITE,
            self.color_write != previous.color_write,
        );
        changes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Topology {
    Points,
    Lines,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBinding {
    pub buffer: BufferId,
    pub format: IndexFormat,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceBinding {
    pub buffer: BufferId,
    pub count: u32,
}

/// Geometry for one draw. Without a vertex buffer the draw is generated
/// entirely in the vertex shader from the vertex index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawCall {
    pub vertex_buffer: Option<BufferId>,
    pub vertex_count: u32,
    pub index: Option<IndexBinding>,
    pub instances: Option<InstanceBinding>,
    pub topology: Topology,
}

impl DrawCall {
    /// A single triangle covering the viewport.
    pub const fn fullscreen_triangle() -> Self {
        Self {
            vertex_buffer: None,
            vertex_count: 3,
            index: None,
            instances: None,
            topology: Topology::Triangles,
        }
    }
}

/// The GL-shaped command surface used by the rasterizer.
///
/// Calls are ordered: state set before a `draw` applies to that draw.
pub trait GpuContext {
    fn compile_program(&mut self, name: &str, source: &str) -> RasterResult<CompiledProgram>;
    fn delete_program(&mut self, program: ProgramId);
    fn use_program(&mut self, program: ProgramId);
    fn set_uniform(&mut self, location: UniformLocation, value: UniformValue);

    fn supports_format(&self, format: TextureFormat) -> bool;
    fn create_texture(&mut self, desc: &TextureDesc) -> RasterResult<TextureId>;
    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> RasterResult<()>;
    fn delete_texture(&mut self, texture: TextureId);
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>);

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RasterResult<BufferId>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RasterResult<()>;
    fn delete_buffer(&mut self, buffer: BufferId);

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RasterResult<FramebufferId>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);
    /// `None` selects the presentation surface.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);
    fn set_viewport(&mut self, viewport: Viewport);
    fn clear(&mut self, request: ClearRequest);
    fn apply_pipeline_state(&mut self, state: PipelineState);
    fn draw(&mut self, call: &DrawCall);

    fn screen_size(&self) -> (u32, u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_eq_respects_epsilon_per_component() {
        let a = UniformValue::Vec3(Vec3::new(1.0, 2.0, 3.0));
        let b = UniformValue::Vec3(Vec3::new(1.0, 2.0, 3.0 + 1e-9));
        let c = UniformValue::Vec3(Vec3::new(1.0, 2.001, 3.0));

        assert!(a.approx_eq(&b, 1e-8));
        assert!(!a.approx_eq(&c, 1e-8));
        assert!(!a.approx_eq(&UniformValue::Float(1.0), 1e-8));
    }

    #[test]
    fn mat4_writes_column_major_bytes() {
        let mut bytes = [0u8; 64];
        UniformValue::Mat4(Mat4::from_translation(Vec3::new(4.0, 5.0, 6.0))).write_bytes(&mut bytes);
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(&floats[12..15], &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn pipeline_changes_list_only_differing_fields() {
        let base = PipelineState::default();
        let blended = PipelineState {
            blend: BlendMode::Add,
            depth_write: false,
            ..base
        };

        let changes = blended.changes_from(&base);
        assert_eq!(changes, PipelineChanges::BLEND | PipelineChanges::DEPTH_WRITE);
        assert!(base.changes_from(&base).is_empty());
    }

    #[test]
    fn compressed_formats_use_block_sizes() {
        assert_eq!(TextureFormat::Bc1RgbaUnorm.data_size(8, 8), 32);
        assert_eq!(TextureFormat::Bc1RgbaUnorm.data_size(5, 5), 32);
        assert_eq!(TextureFormat::Rgba16Float.data_size(2, 2), 32);
    }
}
