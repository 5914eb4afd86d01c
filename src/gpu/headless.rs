// src/gpu/headless.rs
//! A context with no device behind it.
//!
//! Programs are compiled and linked for real, resources are tracked for
//! validation, and every state change or draw lands in a [`CommandLog`].

use std::collections::{HashMap, HashSet};

use crate::error::{RasterError, RasterResult};
use crate::gpu::{
    compile_program_source, recorder::CommandLog, BufferId, BufferKind, ClearRequest,
    CompiledProgram, DrawCall, FramebufferDesc, FramebufferId, GpuCommand, GpuContext,
    PipelineState, ProgramId, ProgramReflection, TextureDesc, TextureFormat, TextureId,
    UniformLocation, UniformValue, Viewport,
};

pub struct HeadlessContext {
    next_id: u32,
    screen: (u32, u32),
    unsupported_formats: HashSet<TextureFormat>,
    programs: HashMap<ProgramId, ProgramReflection>,
    textures: HashMap<TextureId, TextureDesc>,
    buffers: HashMap<BufferId, (BufferKind, u64)>,
    framebuffers: HashMap<FramebufferId, FramebufferDesc>,
    log: CommandLog,
}

impl HeadlessContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            next_id: 1,
            screen: (width, height),
            // Desktop-like defaults: no mobile block compression.
            unsupported_formats: HashSet::from([TextureFormat::Etc2Rgb8Unorm]),
            programs: HashMap::new(),
            textures: HashMap::new(),
            buffers: HashMap::new(),
            framebuffers: HashMap::new(),
            log: CommandLog::default(),
        }
    }

    pub fn with_unsupported_format(mut self, format: TextureFormat) -> Self {
        self.unsupported_formats.insert(format);
        self
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.screen = (width, height);
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub fn commands(&self) -> &[GpuCommand] {
        self.log.commands()
    }

    pub fn take_commands(&mut self) -> Vec<GpuCommand> {
        self.log.drain()
    }

    pub fn draw_count(&self) -> usize {
        self.log.draws().count()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn program(&self, program: ProgramId) -> Option<&ProgramReflection> {
        self.programs.get(&program)
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(&texture)
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl GpuContext for HeadlessContext {
    fn compile_program(&mut self, name: &str, source: &str) -> RasterResult<CompiledProgram> {
        let compiled = compile_program_source(name, source)?;
        let id = ProgramId(self.allocate_id());
        self.programs.insert(id, compiled.reflection.clone());
        Ok(CompiledProgram {
            id,
            reflection: compiled.reflection,
        })
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn use_program(&mut self, program: ProgramId) {
        self.log.push(GpuCommand::UseProgram(program));
    }

    fn set_uniform(&mut self, location: UniformLocation, value: UniformValue) {
        self.log.push(GpuCommand::SetUniform { location, value });
    }

    fn supports_format(&self, format: TextureFormat) -> bool {
        !self.unsupported_formats.contains(&format)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RasterResult<TextureId> {
        if !self.supports_format(desc.format) {
            return Err(RasterError::UnsupportedTextureFormat(desc.format));
        }
        let id = TextureId(self.allocate_id());
        self.textures.insert(id, *desc);
        Ok(id)
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> RasterResult<()> {
        let desc = self
            .textures
            .get(&texture)
            .ok_or(RasterError::UnknownResource("texture"))?;
        let expected = desc.format.data_size(desc.width, desc.height);
        if data.len() != expected {
            return Err(RasterError::TextureDataSize {
                expected,
                actual: data.len(),
            });
        }
        self.log.push(GpuCommand::WriteTexture {
            texture,
            len: data.len(),
        });
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) {
        self.log.push(GpuCommand::BindTexture { unit, texture });
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RasterResult<BufferId> {
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, (kind, size));
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RasterResult<()> {
        let (_, size) = self
            .buffers
            .get(&buffer)
            .ok_or(RasterError::UnknownResource("buffer"))?;
        if offset + data.len() as u64 > *size {
            return Err(RasterError::Backend(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                size
            )));
        }
        self.log.push(GpuCommand::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
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
        self.log.push(GpuCommand::BindFramebuffer(framebuffer));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.log.push(GpuCommand::SetViewport(viewport));
    }

    fn clear(&mut self, request: ClearRequest) {
        self.log.push(GpuCommand::Clear(request));
    }

    fn apply_pipeline_state(&mut self, state: PipelineState) {
        self.log.push(GpuCommand::ApplyPipelineState(state));
    }

    fn draw(&mut self, call: &DrawCall) {
        self.log.push(GpuCommand::Draw(*call));
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::TextureFilter;

    fn desc(format: TextureFormat) -> TextureDesc {
        TextureDesc {
            width: 4,
            height: 4,
            format,
            filter: TextureFilter::Linear,
            render_target: false,
        }
    }

    #[test]
    fn rejects_unsupported_formats() {
        let mut ctx = HeadlessContext::new(64, 64);
        assert!(matches!(
            ctx.create_texture(&desc(TextureFormat::Etc2Rgb8Unorm)),
            Err(RasterError::UnsupportedTextureFormat(_))
        ));
        assert_eq!(ctx.live_textures(), 0);
    }

    #[test]
    fn texture_writes_are_size_checked() {
        let mut ctx = HeadlessContext::new(64, 64);
        let texture = ctx
            .create_texture(&desc(TextureFormat::Rgba8Unorm))
            .expect("supported");

        assert!(ctx.write_texture(texture, &[0u8; 64]).is_ok());
        assert!(matches!(
            ctx.write_texture(texture, &[0u8; 10]),
            Err(RasterError::TextureDataSize {
                expected: 64,
                actual: 10
            })
        ));
    }
}
