// src/gpu/recorder.rs
use crate::gpu::{
    BufferId, ClearRequest, DrawCall, FramebufferId, PipelineState, ProgramId, TextureId,
    UniformLocation, UniformValue, Viewport,
};

/// One ordered state change or draw issued against a context.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    UseProgram(ProgramId),
    SetUniform {
        location: UniformLocation,
        value: UniformValue,
    },
    BindTexture {
        unit: u32,
        texture: Option<TextureId>,
    },
    BindFramebuffer(Option<FramebufferId>),
    SetViewport(Viewport),
    Clear(ClearRequest),
    ApplyPipelineState(PipelineState),
    Draw(DrawCall),
    WriteTexture {
        texture: TextureId,
        len: usize,
    },
    WriteBuffer {
        buffer: BufferId,
        offset: u64,
        len: usize,
    },
}

/// Append-only log of the commands issued since the last drain.
#[derive(Debug, Default)]
pub struct CommandLog {
    commands: Vec<GpuCommand>,
}

impl CommandLog {
    pub fn push(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn drain(&mut self) -> Vec<GpuCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawCall> + '_ {
        self.commands.iter().filter_map(|command| match command {
            GpuCommand::Draw(call) => Some(call),
            _ => None,
        })
    }

    pub fn count(&self, predicate: impl Fn(&GpuCommand) -> bool) -> usize {
        self.commands.iter().filter(|command| predicate(command)).count()
    }
}
