// src/renderer/state_cache.rs
//! Last-known GPU state, used to skip redundant driver calls.

use std::collections::HashMap;

use crate::gpu::{
    CompiledProgram, GpuContext, PipelineChanges, PipelineState, ProgramId, TextureId,
    UniformValue,
};

/// Two uniform values closer than this are treated as equal.
pub const UNIFORM_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone, Copy)]
struct UniformEntry {
    value: UniformValue,
    dirty: bool,
}

/// Uniform values by name. A value only becomes dirty when it differs from
/// the cached one by more than [`UNIFORM_EPSILON`]; dirty values are sent on
/// the next [`UniformCache::flush`].
#[derive(Debug, Default)]
pub struct UniformCache {
    entries: HashMap<String, UniformEntry>,
    uploads: usize,
}

impl UniformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether this call made the entry dirty.
    pub fn set(&mut self, name: &str, value: impl Into<UniformValue>) -> bool {
        let value = value.into();
        match self.entries.get_mut(name) {
            Some(entry) if entry.value.approx_eq(&value, UNIFORM_EPSILON) => false,
            Some(entry) => {
                entry.value = value;
                let newly_dirty = !entry.dirty;
                entry.dirty = true;
                newly_dirty
            }
            None => {
                self.entries
                    .insert(name.to_string(), UniformEntry { value, dirty: true });
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<UniformValue> {
        self.entries.get(name).map(|entry| entry.value)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|entry| entry.dirty)
    }

    /// Forces every known value to be sent again, e.g. after the render
    /// target or the bound program changed.
    pub fn mark_all_dirty(&mut self) {
        for entry in self.entries.values_mut() {
            entry.dirty = true;
        }
    }

    /// Forgets everything, for the start of a frame.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Uploads dirty values the program declares. Values the program does
    /// not know stay dirty for the next program that does.
    pub fn flush(&mut self, ctx: &mut dyn GpuContext, program: &CompiledProgram) -> usize {
        let mut sent = 0;
        for (name, entry) in &mut self.entries {
            if !entry.dirty {
                continue;
            }
            let Some(location) = program.reflection.uniform(name) else {
                continue;
            };
            if location.kind != entry.value.kind() {
                log::warn!(
                    "Uniform {} is {:?} in the program but set as {:?}",
                    name,
                    location.kind,
                    entry.value.kind()
                );
                entry.dirty = false;
                continue;
            }
            ctx.set_uniform(location, entry.value);
            entry.dirty = false;
            sent += 1;
        }
        self.uploads += sent;
        sent
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }

    pub fn reset_stats(&mut self) {
        self.uploads = 0;
    }
}

/// Texture bound per unit.
#[derive(Debug, Default)]
pub struct TextureCache {
    bound: HashMap<u32, Option<TextureId>>,
    binds: usize,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds unless the unit already holds `texture`. Returns whether a
    /// bind was issued.
    pub fn bind(&mut self, ctx: &mut dyn GpuContext, unit: u32, texture: Option<TextureId>) -> bool {
        if self.bound.get(&unit) == Some(&texture) {
            return false;
        }
        ctx.bind_texture(unit, texture);
        self.bound.insert(unit, texture);
        self.binds += 1;
        true
    }

    pub fn bound(&self, unit: u32) -> Option<TextureId> {
        self.bound.get(&unit).copied().flatten()
    }

    pub fn mark_all_dirty(&mut self) {
        self.bound.clear();
    }

    pub fn binds(&self) -> usize {
        self.binds
    }

    pub fn reset_stats(&mut self) {
        self.binds = 0;
    }
}

/// Current program and pipeline state.
#[derive(Debug, Default)]
pub struct PipelineStateTracker {
    program: Option<ProgramId>,
    state: Option<PipelineState>,
    program_binds: usize,
}

impl PipelineStateTracker {
    pub fn use_program(&mut self, ctx: &mut dyn GpuContext, program: ProgramId) -> bool {
        if self.program == Some(program) {
            return false;
        }
        ctx.use_program(program);
        self.program = Some(program);
        self.program_binds += 1;
        true
    }

    /// Applies `state` if any field differs from the last applied one.
    pub fn apply(&mut self, ctx: &mut dyn GpuContext, state: PipelineState) -> PipelineChanges {
        let changes = match &self.state {
            Some(previous) => state.changes_from(previous),
            None => PipelineChanges::all(),
        };
        if !changes.is_empty() {
            ctx.apply_pipeline_state(state);
            self.state = Some(state);
        }
        changes
    }

    pub fn current(&self) -> Option<PipelineState> {
        self.state
    }

    pub fn invalidate(&mut self) {
        self.program = None;
        self.state = None;
    }

    pub fn program_binds(&self) -> usize {
        self.program_binds
    }

    pub fn reset_stats(&mut self) {
        self.program_binds = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BlendMode, GpuCommand, HeadlessContext};
    use glam::Vec4;

    const PROGRAM: &str = r#"#version 450
layout(set = 0, binding = 0) uniform Data {
    vec4 tint;
    float fade;
};
#ifdef VERTEX
void main() {
    gl_Position = vec4(0.0, 0.0, 0.0, 1.0);
}
#endif
#ifdef FRAGMENT
layout(location = 0) out vec4 frag_color;
void main() {
    frag_color = tint * fade;
}
#endif
"#;

    #[test]
    fn repeated_values_dirty_once() {
        let mut cache = UniformCache::new();
        assert!(cache.set("fade", 0.5));
        assert!(!cache.set("fade", 0.5));
        assert!(!cache.set("fade", 0.5 + 1e-9));
        assert!(cache.is_dirty("fade"));
    }

    #[test]
    fn flush_uploads_only_changes() {
        let mut ctx = HeadlessContext::new(4, 4);
        let program = ctx.compile_program("cache", PROGRAM).expect("program compiles");
        let mut cache = UniformCache::new();

        cache.set("tint", Vec4::ONE);
        cache.set("fade", 1.0);
        assert_eq!(cache.flush(&mut ctx, &program), 2);

        cache.set("tint", Vec4::ONE);
        cache.set("fade", 0.25);
        assert_eq!(cache.flush(&mut ctx, &program), 1);

        cache.mark_all_dirty();
        assert_eq!(cache.flush(&mut ctx, &program), 2);
        assert_eq!(cache.uploads(), 5);
    }

    #[test]
    fn unknown_uniforms_wait_for_a_program_that_declares_them() {
        let mut ctx = HeadlessContext::new(4, 4);
        let program = ctx.compile_program("cache", PROGRAM).expect("program compiles");
        let mut cache = UniformCache::new();
        cache.set("light_color", Vec4::ONE);

        assert_eq!(cache.flush(&mut ctx, &program), 0);
        assert!(cache.is_dirty("light_color"));
    }

    #[test]
    fn texture_binds_compare_identity() {
        let mut ctx = HeadlessContext::new(4, 4);
        let mut cache = TextureCache::new();
        let texture = ctx
            .create_texture(&crate::gpu::TextureDesc {
                width: 1,
                height: 1,
                format: crate::gpu::TextureFormat::Rgba8Unorm,
                filter: Default::default(),
                render_target: false,
            })
            .expect("texture");

        assert!(cache.bind(&mut ctx, 0, Some(texture)));
        assert!(!cache.bind(&mut ctx, 0, Some(texture)));
        cache.mark_all_dirty();
        assert!(cache.bind(&mut ctx, 0, Some(texture)));

        let binds = ctx
            .commands()
            .iter()
            .filter(|command| matches!(command, GpuCommand::BindTexture { .. }))
            .count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn pipeline_state_applies_on_change_only() {
        let mut ctx = HeadlessContext::new(4, 4);
        let mut tracker = PipelineStateTracker::default();
        let opaque = PipelineState::default();
        let blended = PipelineState {
            blend: BlendMode::Mix,
            ..opaque
        };

        assert_eq!(tracker.apply(&mut ctx, opaque), PipelineChanges::all());
        assert!(tracker.apply(&mut ctx, opaque).is_empty());
        assert_eq!(tracker.apply(&mut ctx, blended), PipelineChanges::BLEND);
        assert_eq!(tracker.current(), Some(blended));
    }
}
