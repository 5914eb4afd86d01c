// src/gpu/pipeline_builder.rs

use crate::gpu::{BlendMode, CullMode, DepthFunc, PipelineState, Topology};

/// Fluent construction of render pipelines for compiled programs.
///
/// Both stages come from separate modules with a `main` entry point, the
/// way the GLSL front end emits them.
pub struct PipelineBuilder<'a> {
    device: &'a wgpu::Device,
    label: Option<&'a str>,
    layout: &'a wgpu::PipelineLayout,
    vertex: &'a wgpu::ShaderModule,
    fragment: &'a wgpu::ShaderModule,
    vertex_buffers: Vec<wgpu::VertexBufferLayout<'a>>,
    color_targets: Vec<Option<wgpu::ColorTargetState>>,
    depth_stencil: Option<wgpu::DepthStencilState>,
    primitive: wgpu::PrimitiveState,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(
        device: &'a wgpu::Device,
        layout: &'a wgpu::PipelineLayout,
        vertex: &'a wgpu::ShaderModule,
        fragment: &'a wgpu::ShaderModule,
    ) -> Self {
        Self {
            device,
            label: None,
            layout,
            vertex,
            fragment,
            vertex_buffers: Vec::new(),
            color_targets: Vec::new(),
            depth_stencil: None,
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
                front_face: wgpu::FrontFace::Ccw,
                polygon_mode: wgpu::PolygonMode::Fill,
                ..Default::default()
            },
        }
    }

    pub fn with_label(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_vertex_buffer(mut self, layout: wgpu::VertexBufferLayout<'a>) -> Self {
        self.vertex_buffers.push(layout);
        self
    }

    /// Color attachment with the blend and write mask of `state`.
    pub fn with_color_target(mut self, format: wgpu::TextureFormat, state: &PipelineState) -> Self {
        self.color_targets.push(Some(wgpu::ColorTargetState {
            format,
            blend: blend_state(state.blend),
            write_mask: if state.color_write {
                wgpu::ColorWrites::ALL
            } else {
                wgpu::ColorWrites::empty()
            },
        }));
        self
    }

    /// Depth attachment tested and written as `state` asks.
    pub fn with_depth_stencil(mut self, format: wgpu::TextureFormat, state: &PipelineState) -> Self {
        let depth_compare = if state.depth_test {
            match state.depth_func {
                DepthFunc::Less => wgpu::CompareFunction::Less,
                DepthFunc::LessEqual => wgpu::CompareFunction::LessEqual,
                DepthFunc::Equal => wgpu::CompareFunction::Equal,
                DepthFunc::Always => wgpu::CompareFunction::Always,
            }
        } else {
            wgpu::CompareFunction::Always
        };
        self.depth_stencil = Some(wgpu::DepthStencilState {
            format,
            depth_write_enabled: state.depth_write,
            depth_compare,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });
        self
    }

    pub fn with_rasterizer(mut self, state: &PipelineState) -> Self {
        self.primitive.cull_mode = match state.cull {
            CullMode::Disabled => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        };
        self.primitive.front_face = if state.front_face_ccw {
            wgpu::FrontFace::Ccw
        } else {
            wgpu::FrontFace::Cw
        };
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.primitive.topology = match topology {
            Topology::Points => wgpu::PrimitiveTopology::PointList,
            Topology::Lines => wgpu::PrimitiveTopology::LineList,
            Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
            Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        };
        self
    }

    pub fn build(self) -> wgpu::RenderPipeline {
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: self.label,
            layout: Some(self.layout),
            vertex: wgpu::VertexState {
                module: self.vertex,
                entry_point: Some("main"),
                buffers: &self.vertex_buffers,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: self.fragment,
                entry_point: Some("main"),
                targets: &self.color_targets,
                compilation_options: Default::default(),
            }),
            primitive: self.primitive,
            depth_stencil: self.depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }
}

fn blend_state(mode: BlendMode) -> Option<wgpu::BlendState> {
    let component = |src, dst, operation| wgpu::BlendComponent {
        src_factor: src,
        dst_factor: dst,
        operation,
    };
    use wgpu::{BlendFactor as F, BlendOperation as Op};
    match mode {
        BlendMode::Disabled => None,
        BlendMode::Mix => Some(wgpu::BlendState::ALPHA_BLENDING),
        BlendMode::PremultAlpha => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        BlendMode::Add => Some(wgpu::BlendState {
            color: component(F::SrcAlpha, F::One, Op::Add),
            alpha: component(F::SrcAlpha, F::One, Op::Add),
        }),
        BlendMode::Sub => Some(wgpu::BlendState {
            color: component(F::SrcAlpha, F::One, Op::ReverseSubtract),
            alpha: component(F::SrcAlpha, F::One, Op::ReverseSubtract),
        }),
        BlendMode::Mul => Some(wgpu::BlendState {
            color: component(F::Dst, F::Zero, Op::Add),
            alpha: component(F::DstAlpha, F::Zero, Op::Add),
        }),
    }
}
