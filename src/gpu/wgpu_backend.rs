// src/gpu/wgpu_backend.rs
//! [`GpuContext`] on top of wgpu.
//!
//! State calls are recorded as they arrive: every draw captures its program,
//! pipeline state, viewport, bound texture units and a copy of the program's
//! uniform block. [`WgpuContext::present`] turns the recording into render
//! passes, one per framebuffer binding, and submits them in a single encoder.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU64;
use std::sync::Arc;

use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::error::{RasterError, RasterResult};
use crate::gpu::pipeline_builder::PipelineBuilder;
use crate::gpu::{
    compile_program_source, BufferId, BufferKind, ClearRequest, CompiledProgram, DrawCall,
    FramebufferDesc, FramebufferId, GpuContext, IndexFormat, PipelineState, ProgramId,
    ProgramReflection, TextureDesc, TextureFormat, TextureId, Topology,
    UniformLocation, UniformValue, Viewport, DATA_TEXTURE_BINDING_START, LINEAR_SAMPLER_BINDING,
    NEAREST_SAMPLER_BINDING,
};
use crate::renderer::vertex::{InstanceData, Vertex};
use crate::settings::RasterSettings;

const SCREEN_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
/// Vertex attribute locations at or above this come from the instance buffer.
const INSTANCE_LOCATION_START: u32 = 8;
const MIN_UNIFORM_BLOCK: u64 = 16;

struct GpuProgram {
    reflection: ProgramReflection,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// CPU copy of the uniform block, snapshotted into the ring per draw.
    block: Vec<u8>,
}

impl GpuProgram {
    fn uses_vertex_buffer(&self) -> bool {
        self.reflection
            .vertex_inputs
            .iter()
            .any(|&location| location < INSTANCE_LOCATION_START)
    }

    fn uses_instance_buffer(&self) -> bool {
        self.reflection
            .vertex_inputs
            .iter()
            .any(|&location| location >= INSTANCE_LOCATION_START)
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    state: PipelineState,
    color: Option<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    topology: Topology,
}

struct RecordedDraw {
    program: ProgramId,
    state: PipelineState,
    viewport: Option<Viewport>,
    uniform_offset: u32,
    textures: Vec<(u32, TextureId)>,
    call: DrawCall,
}

struct RecordedPass {
    target: Option<FramebufferId>,
    clear: ClearRequest,
    draws: Vec<RecordedDraw>,
}

/// Resolved attachments of one recorded pass.
struct PassTargets {
    color: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    depth: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    size: (u32, u32),
}

pub struct WgpuContext {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    screen_depth: wgpu::TextureView,

    uniform_layout: wgpu::BindGroupLayout,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    fallback_texture: wgpu::TextureView,

    next_id: u32,
    programs: HashMap<ProgramId, GpuProgram>,
    textures: HashMap<TextureId, GpuTexture>,
    buffers: HashMap<BufferId, GpuBuffer>,
    framebuffers: HashMap<FramebufferId, FramebufferDesc>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,

    current_program: Option<ProgramId>,
    state: PipelineState,
    viewport: Option<Viewport>,
    units: BTreeMap<u32, TextureId>,
    passes: Vec<RecordedPass>,
    uniform_data: Vec<u8>,
    uniform_buffer: Option<wgpu::Buffer>,
    uniform_alignment: u64,
    max_block: u64,
    /// Resources deleted mid-frame stay alive until the frame is submitted.
    retired_textures: Vec<GpuTexture>,
    retired_programs: Vec<GpuProgram>,
}

impl WgpuContext {
    pub async fn new(window: Arc<Window>, settings: &RasterSettings) -> RasterResult<Self> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let surface = instance
            .create_surface(window)
            .map_err(|err| RasterError::Backend(format!("surface: {err}")))?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| RasterError::Backend(format!("adapter: {err}")))?;

        let optional = wgpu::Features::TEXTURE_COMPRESSION_BC | wgpu::Features::TEXTURE_COMPRESSION_ETC2;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features: adapter.features() & optional,
                required_limits: wgpu::Limits::default(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| RasterError::Backend(format!("device: {err}")))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| RasterError::Backend("surface reports no formats".to_string()))?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: settings.present_mode(&caps.present_modes),
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        log::info!(
            "Surface configured: {:?} {}x{} {:?}",
            config.format,
            config.width,
            config.height,
            config.present_mode
        );

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("UniformBlockLayout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("LinearSampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("NearestSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let fallback = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("FallbackTexture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            fallback.as_image_copy(),
            &[255, 255, 255, 255],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );

        let screen_depth = create_screen_depth(&device, config.width, config.height);
        let uniform_alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment);

        Ok(Self {
            surface,
            screen_depth,
            uniform_layout,
            linear_sampler,
            nearest_sampler,
            fallback_texture: fallback.create_view(&wgpu::TextureViewDescriptor::default()),
            next_id: 1,
            programs: HashMap::new(),
            textures: HashMap::new(),
            buffers: HashMap::new(),
            framebuffers: HashMap::new(),
            pipelines: HashMap::new(),
            current_program: None,
            state: PipelineState::default(),
            viewport: None,
            units: BTreeMap::new(),
            passes: Vec::new(),
            uniform_data: Vec::new(),
            uniform_buffer: None,
            uniform_alignment,
            max_block: MIN_UNIFORM_BLOCK,
            retired_textures: Vec::new(),
            retired_programs: Vec::new(),
            device,
            queue,
            config,
        })
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        self.surface.configure(&self.device, &self.config);
        self.screen_depth = create_screen_depth(&self.device, new_size.width, new_size.height);
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn current_pass(&mut self) -> &mut RecordedPass {
        if self.passes.is_empty() {
            self.passes.push(RecordedPass {
                target: None,
                clear: ClearRequest::default(),
                draws: Vec::new(),
            });
        }
        let last = self.passes.len() - 1;
        &mut self.passes[last]
    }

    fn create_stage_module(
        &self,
        name: &str,
        module: &naga::Module,
        info: &naga::valid::ModuleInfo,
    ) -> RasterResult<wgpu::ShaderModule> {
        let wgsl = naga::back::wgsl::write_string(module, info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|err| RasterError::Backend(format!("`{name}` WGSL translation: {err}")))?;
        Ok(self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        }))
    }

    fn texture_layout(&self, name: &str, reflection: &ProgramReflection) -> wgpu::BindGroupLayout {
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = reflection
            .textures
            .values()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float {
                        filterable: binding < DATA_TEXTURE_BINDING_START,
                    },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        entries.extend(reflection.samplers.iter().map(|&binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Sampler(if binding == LINEAR_SAMPLER_BINDING {
                wgpu::SamplerBindingType::Filtering
            } else {
                wgpu::SamplerBindingType::NonFiltering
            }),
            count: None,
        }));
        self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        })
    }

    fn framebuffer_targets(&self, target: Option<FramebufferId>, screen: Option<&wgpu::TextureView>) -> Option<PassTargets> {
        let Some(id) = target else {
            return Some(PassTargets {
                color: screen.map(|view| (view.clone(), self.config.format)),
                depth: Some((self.screen_depth.clone(), SCREEN_DEPTH_FORMAT)),
                size: (self.config.width, self.config.height),
            });
        };
        let desc = self.framebuffers.get(&id)?;
        let attachment = |texture: Option<TextureId>| {
            texture
                .and_then(|texture| self.textures.get(&texture))
                .map(|texture| (texture.view.clone(), wgpu_format(texture.desc.format)))
        };
        let size = desc
            .color
            .or(desc.depth)
            .and_then(|texture| self.textures.get(&texture))
            .map(|texture| (texture.desc.width, texture.desc.height))?;
        Some(PassTargets {
            color: attachment(desc.color),
            depth: attachment(desc.depth),
            size,
        })
    }

    fn pipeline(&mut self, key: PipelineKey) -> Option<wgpu::RenderPipeline> {
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Some(pipeline.clone());
        }
        let program = self.programs.get(&key.program)?;

        let vertex_attrs: Vec<wgpu::VertexAttribute> = Vertex::ATTRS
            .iter()
            .copied()
            .filter(|attr| program.reflection.vertex_inputs.contains(&attr.shader_location))
            .collect();
        let instance_attrs: Vec<wgpu::VertexAttribute> = InstanceData::ATTRS
            .iter()
            .copied()
            .filter(|attr| program.reflection.vertex_inputs.contains(&attr.shader_location))
            .collect();

        let mut builder = PipelineBuilder::new(
            &self.device,
            &program.pipeline_layout,
            &program.vertex,
            &program.fragment,
        )
        .with_label("ProgramPipeline")
        .with_rasterizer(&key.state)
        .with_topology(key.topology);
        if program.uses_vertex_buffer() {
            builder = builder.with_vertex_buffer(wgpu::VertexBufferLayout {
                array_stride: Vertex::STRIDE,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &vertex_attrs,
            });
        }
        if program.uses_instance_buffer() {
            builder = builder.with_vertex_buffer(wgpu::VertexBufferLayout {
                array_stride: InstanceData::STRIDE,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &instance_attrs,
            });
        }
        if let Some(format) = key.color {
            builder = builder.with_color_target(format, &key.state);
        }
        if let Some(format) = key.depth {
            builder = builder.with_depth_stencil(format, &key.state);
        }
        let pipeline = builder.build();
        log::debug!("Created pipeline for {:?} ({} cached)", key.program, self.pipelines.len() + 1);
        self.pipelines.insert(key, pipeline.clone());
        Some(pipeline)
    }

    fn texture_bind_group(&self, program: &GpuProgram, bound: &[(u32, TextureId)]) -> wgpu::BindGroup {
        let views: Vec<(u32, &wgpu::TextureView)> = program
            .reflection
            .textures
            .values()
            .map(|&binding| {
                let view = bound
                    .iter()
                    .find(|(unit, _)| *unit == binding)
                    .and_then(|(_, texture)| self.textures.get(texture))
                    .map_or(&self.fallback_texture, |texture| &texture.view);
                (binding, view)
            })
            .collect();
        let mut entries: Vec<wgpu::BindGroupEntry> = views
            .iter()
            .map(|(binding, view)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect();
        entries.extend(program.reflection.samplers.iter().map(|&binding| wgpu::BindGroupEntry {
            binding,
            resource: wgpu::BindingResource::Sampler(if binding == NEAREST_SAMPLER_BINDING {
                &self.nearest_sampler
            } else {
                &self.linear_sampler
            }),
        }));
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("TextureUnits"),
            layout: &program.texture_layout,
            entries: &entries,
        })
    }

    /// Uploads this frame's uniform snapshots and returns the bind group
    /// that addresses them with dynamic offsets.
    fn upload_uniforms(&mut self) -> wgpu::BindGroup {
        let required = (self.uniform_data.len() as u64 + self.max_block).max(self.uniform_alignment);
        let too_small = self
            .uniform_buffer
            .as_ref()
            .is_none_or(|buffer| buffer.size() < required);
        if too_small {
            self.uniform_buffer = None;
        }
        let device = &self.device;
        let buffer = self.uniform_buffer.get_or_insert_with(|| {
            let size = required.next_power_of_two();
            log::debug!("Growing uniform ring to {} bytes", size);
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("UniformRing"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if !self.uniform_data.is_empty() {
            self.queue.write_buffer(buffer, 0, &self.uniform_data);
        }
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("UniformRingGroup"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: 0,
                    size: NonZeroU64::new(self.max_block),
                }),
            }],
        })
    }

    /// Replays everything recorded since the last call and presents the
    /// surface. Frames lost to a surface reconfiguration are dropped.
    pub fn present(&mut self) -> RasterResult<()> {
        let passes = std::mem::take(&mut self.passes);
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => Some(frame),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("Surface lost, reconfiguring");
                self.surface.configure(&self.device, &self.config);
                None
            }
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("Surface acquire timed out, skipping frame");
                None
            }
            Err(err) => {
                self.end_frame();
                return Err(RasterError::Backend(format!("surface: {err}")));
            }
        };
        let Some(frame) = frame else {
            self.end_frame();
            return Ok(());
        };
        let screen_view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let uniform_group = self.upload_uniforms();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("FrameEncoder"),
            });

        for pass in &passes {
            let Some(targets) = self.framebuffer_targets(pass.target, Some(&screen_view)) else {
                log::warn!("Skipping pass into deleted framebuffer {:?}", pass.target);
                continue;
            };
            let mut prepared = Vec::with_capacity(pass.draws.len());
            for draw in &pass.draws {
                let key = PipelineKey {
                    program: draw.program,
                    state: draw.state,
                    color: targets.color.as_ref().map(|(_, format)| *format),
                    depth: targets.depth.as_ref().map(|(_, format)| *format),
                    topology: draw.call.topology,
                };
                let Some(pipeline) = self.pipeline(key) else {
                    continue;
                };
                let Some(program) = self.programs.get(&draw.program) else {
                    continue;
                };
                let textures = self.texture_bind_group(program, &draw.textures);
                let vertex = program.uses_vertex_buffer();
                let instanced = program.uses_instance_buffer();
                prepared.push((draw, pipeline, textures, vertex, instanced));
            }

            let clear_color = pass.clear.color.map(|[r, g, b, a]| wgpu::Color {
                r: f64::from(r),
                g: f64::from(g),
                b: f64::from(b),
                a: f64::from(a),
            });
            let color_attachment = targets.color.as_ref().map(|(view, _)| wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: clear_color.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                },
            });
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("RecordedPass"),
                color_attachments: &[color_attachment],
                depth_stencil_attachment: targets.depth.as_ref().map(|(view, _)| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: pass.clear.depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let (width, height) = targets.size;
            for (draw, pipeline, textures, vertex, instanced) in &prepared {
                let viewport = draw
                    .viewport
                    .map(|v| clamp_viewport(v, width, height))
                    .unwrap_or(Viewport::new(0, 0, width, height));
                if viewport.width == 0 || viewport.height == 0 {
                    continue;
                }
                rpass.set_viewport(
                    viewport.x as f32,
                    viewport.y as f32,
                    viewport.width as f32,
                    viewport.height as f32,
                    0.0,
                    1.0,
                );
                rpass.set_pipeline(pipeline);
                rpass.set_bind_group(0, &uniform_group, &[draw.uniform_offset]);
                rpass.set_bind_group(1, textures, &[]);

                let mut slot = 0;
                if *vertex {
                    let Some(buffer) = draw.call.vertex_buffer.and_then(|id| self.buffers.get(&id)) else {
                        continue;
                    };
                    rpass.set_vertex_buffer(slot, buffer.buffer.slice(..));
                    slot += 1;
                }
                let mut instances = 0..1;
                if *instanced {
                    let Some((binding, buffer)) = draw
                        .call
                        .instances
                        .and_then(|binding| Some((binding, self.buffers.get(&binding.buffer)?)))
                    else {
                        continue;
                    };
                    rpass.set_vertex_buffer(slot, buffer.buffer.slice(..));
                    instances = 0..binding.count;
                }
                match draw.call.index {
                    Some(index) => {
                        let Some(buffer) = self.buffers.get(&index.buffer) else {
                            continue;
                        };
                        let format = match index.format {
                            IndexFormat::U16 => wgpu::IndexFormat::Uint16,
                            IndexFormat::U32 => wgpu::IndexFormat::Uint32,
                        };
                        rpass.set_index_buffer(buffer.buffer.slice(..), format);
                        rpass.draw_indexed(0..index.count, 0, instances);
                    }
                    None => rpass.draw(0..draw.call.vertex_count, instances),
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        frame.present();
        self.end_frame();
        Ok(())
    }

    fn end_frame(&mut self) {
        self.passes.clear();
        self.uniform_data.clear();
        self.retired_textures.clear();
        self.retired_programs.clear();
    }
}

impl GpuContext for WgpuContext {
    fn compile_program(&mut self, name: &str, source: &str) -> RasterResult<CompiledProgram> {
        let compiled = compile_program_source(name, source)?;
        let vertex = self.create_stage_module(name, &compiled.vertex, &compiled.vertex_info)?;
        let fragment = self.create_stage_module(name, &compiled.fragment, &compiled.fragment_info)?;
        let texture_layout = self.texture_layout(name, &compiled.reflection);
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&self.uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let block_len = u64::from(compiled.reflection.block_size)
            .max(MIN_UNIFORM_BLOCK)
            .next_multiple_of(MIN_UNIFORM_BLOCK);
        self.max_block = self.max_block.max(block_len);

        let id = ProgramId(self.allocate_id());
        self.programs.insert(
            id,
            GpuProgram {
                reflection: compiled.reflection.clone(),
                vertex,
                fragment,
                texture_layout,
                pipeline_layout,
                block: vec![0; block_len as usize],
            },
        );
        Ok(CompiledProgram {
            id,
            reflection: compiled.reflection,
        })
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.pipelines.retain(|key, _| key.program != program);
        if let Some(program) = self.programs.remove(&program) {
            self.retired_programs.push(program);
        }
    }

    fn use_program(&mut self, program: ProgramId) {
        self.current_program = Some(program);
    }

    fn set_uniform(&mut self, location: UniformLocation, value: UniformValue) {
        let Some(program) = self
            .current_program
            .and_then(|program| self.programs.get_mut(&program))
        else {
            return;
        };
        let start = location.offset as usize;
        let end = start + location.kind.size();
        if let Some(dst) = program.block.get_mut(start..end) {
            value.write_bytes(dst);
        }
    }

    fn supports_format(&self, format: TextureFormat) -> bool {
        let features = self.device.features();
        match format {
            TextureFormat::Bc1RgbaUnorm => features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC),
            TextureFormat::Etc2Rgb8Unorm => features.contains(wgpu::Features::TEXTURE_COMPRESSION_ETC2),
            _ => true,
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RasterResult<TextureId> {
        if !self.supports_format(desc.format) {
            return Err(RasterError::UnsupportedTextureFormat(desc.format));
        }
        let (width, height) = if desc.format.is_compressed() {
            (desc.width.max(1).next_multiple_of(4), desc.height.max(1).next_multiple_of(4))
        } else {
            (desc.width.max(1), desc.height.max(1))
        };
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if desc.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("RasterTexture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(desc.format),
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TextureId(self.allocate_id());
        self.textures.insert(id, GpuTexture { texture, view, desc: *desc });
        Ok(id)
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> RasterResult<()> {
        let gpu = self
            .textures
            .get(&texture)
            .ok_or(RasterError::UnknownResource("texture"))?;
        let desc = gpu.desc;
        let expected = desc.format.data_size(desc.width, desc.height);
        if data.len() != expected {
            return Err(RasterError::TextureDataSize {
                expected,
                actual: data.len(),
            });
        }
        let (bytes_per_row, rows) = if desc.format.is_compressed() {
            (desc.width.div_ceil(4) * 8, desc.height.div_ceil(4))
        } else {
            ((expected / desc.height.max(1) as usize) as u32, desc.height)
        };
        let size = gpu.texture.size();
        self.queue.write_texture(
            gpu.texture.as_image_copy(),
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(rows),
            },
            wgpu::Extent3d {
                width: size.width,
                height: size.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.units.retain(|_, bound| *bound != texture);
        if let Some(texture) = self.textures.remove(&texture) {
            self.retired_textures.push(texture);
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) {
        match texture {
            Some(texture) => {
                self.units.insert(unit, texture);
            }
            None => {
                self.units.remove(&unit);
            }
        }
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RasterResult<BufferId> {
        let usage = match kind {
            BufferKind::Vertex | BufferKind::Instance => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;
        let size = size.max(wgpu::COPY_BUFFER_ALIGNMENT).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("RasterBuffer"),
            size,
            usage,
            mapped_at_creation: false,
        });
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, GpuBuffer { buffer, size });
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RasterResult<()> {
        let gpu = self
            .buffers
            .get(&buffer)
            .ok_or(RasterError::UnknownResource("buffer"))?;
        let padded_len = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if offset + padded_len > gpu.size {
            return Err(RasterError::Backend(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                gpu.size
            )));
        }
        if padded_len == data.len() as u64 {
            self.queue.write_buffer(&gpu.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(padded_len as usize, 0);
            self.queue.write_buffer(&gpu.buffer, offset, &padded);
        }
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.buffer.destroy();
        }
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RasterResult<FramebufferId> {
        for texture in desc.color.iter().chain(desc.depth.iter()) {
            if !self.textures.contains_key(texture) {
                return Err(RasterError::UnknownResource("texture"));
            }
        }
        let id = FramebufferId(self.allocate_id());
        self.framebuffers.insert(id, *desc);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.passes.push(RecordedPass {
            target: framebuffer,
            clear: ClearRequest::default(),
            draws: Vec::new(),
        });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    fn clear(&mut self, request: ClearRequest) {
        let pass = self.current_pass();
        if pass.draws.is_empty() {
            pass.clear.color = request.color.or(pass.clear.color);
            pass.clear.depth = request.depth.or(pass.clear.depth);
            return;
        }
        let target = pass.target;
        self.passes.push(RecordedPass {
            target,
            clear: request,
            draws: Vec::new(),
        });
    }

    fn apply_pipeline_state(&mut self, state: PipelineState) {
        self.state = state;
    }

    fn draw(&mut self, call: &DrawCall) {
        let Some(program_id) = self.current_program else {
            log::warn!("Draw without a program");
            return;
        };
        let Some(program) = self.programs.get(&program_id) else {
            return;
        };

        let offset = (self.uniform_data.len() as u64).next_multiple_of(self.uniform_alignment);
        self.uniform_data.resize(offset as usize, 0);
        self.uniform_data.extend_from_slice(&program.block);

        let textures = self.units.iter().map(|(unit, texture)| (*unit, *texture)).collect();
        let draw = RecordedDraw {
            program: program_id,
            state: self.state,
            viewport: self.viewport,
            uniform_offset: offset as u32,
            textures,
            call: *call,
        };
        self.current_pass().draws.push(draw);
    }

    fn screen_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
        TextureFormat::Etc2Rgb8Unorm => wgpu::TextureFormat::Etc2Rgb8Unorm,
    }
}

fn create_screen_depth(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("ScreenDepth"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SCREEN_DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

fn clamp_viewport(viewport: Viewport, width: u32, height: u32) -> Viewport {
    let x = viewport.x.min(width);
    let y = viewport.y.min(height);
    Viewport::new(
        x,
        y,
        viewport.width.min(width - x),
        viewport.height.min(height - y),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewports_are_clamped_to_the_attachment() {
        let clamped = clamp_viewport(Viewport::new(900, 100, 400, 400), 1024, 256);
        assert_eq!(clamped, Viewport::new(900, 100, 124, 156));
        assert_eq!(clamp_viewport(Viewport::new(2000, 0, 10, 10), 1024, 1024).width, 0);
    }

    #[test]
    fn every_format_has_a_wgpu_counterpart() {
        assert_eq!(wgpu_format(TextureFormat::Depth32Float), SCREEN_DEPTH_FORMAT);
        assert!(wgpu_format(TextureFormat::Rgba8UnormSrgb).is_srgb());
    }
}
