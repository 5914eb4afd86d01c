// src/renderer/storage/material.rs
use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::{MaterialHandle, RasterStorage, ShaderHandle, TextureHandle};
use crate::gpu::{BlendMode, CullMode, UniformKind, UniformValue};

bitflags! {
    /// Render-mode switches a shader declares about itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFlags: u32 {
        const UNSHADED = 1 << 0;
        const USES_SCREEN_TEXTURE = 1 << 1;
        const USES_DEPTH_TEXTURE = 1 << 2;
        const NO_DEPTH_TEST = 1 << 3;
        const USES_ALPHA = 1 << 4;
        const USES_DISCARD = 1 << 5;
        const DONT_RECEIVE_SHADOWS = 1 << 6;
        const USES_RIM = 1 << 7;
        const USES_VERTEX_COLOR = 1 << 8;
        const USES_UV2 = 1 << 9;
        const USES_TANGENT = 1 << 10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DepthDrawMode {
    #[default]
    Opaque,
    Always,
    Never,
    AlphaPrepass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiffuseModel {
    #[default]
    Burley,
    Lambert,
    LambertWrap,
    OrenNayar,
    Toon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpecularModel {
    #[default]
    SchlickGgx,
    Blinn,
    Phong,
    Toon,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniformDecl {
    pub name: String,
    pub kind: UniformKind,
    pub default: UniformValue,
}

impl UniformDecl {
    pub fn new(name: impl Into<String>, default: UniformValue) -> Self {
        Self {
            name: name.into(),
            kind: default.kind(),
            default,
        }
    }
}

/// What an unbound material texture samples as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureHint {
    #[default]
    White,
    Black,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDecl {
    pub name: String,
    pub hint: TextureHint,
}

/// Source and render modes for a shader resource.
///
/// `vertex_code` and `fragment_code` are GLSL statements spliced into the
/// scene template; they read and write the template's locals (`vertex`,
/// `normal`, `albedo`, `alpha`, `roughness`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShaderDesc {
    pub vertex_code: String,
    pub fragment_code: String,
    pub uniforms: Vec<UniformDecl>,
    pub textures: Vec<TextureDecl>,
    pub blend: BlendMode,
    pub depth_draw: DepthDrawMode,
    pub cull: CullMode,
    #[serde(skip)]
    pub flags: ShaderFlags,
    pub diffuse: DiffuseModel,
    pub specular: SpecularModel,
}

#[derive(Debug, Clone)]
pub struct Shader {
    pub desc: ShaderDesc,
    /// Bumped whenever the code changes so cached variants can be dropped.
    pub version: u64,
}

impl Shader {
    pub fn is_unshaded(&self) -> bool {
        self.desc.flags.contains(ShaderFlags::UNSHADED)
    }

    pub fn uses_alpha(&self) -> bool {
        self.desc.flags.contains(ShaderFlags::USES_ALPHA)
            || self.desc.flags.contains(ShaderFlags::USES_SCREEN_TEXTURE)
            || self.desc.blend != BlendMode::Disabled
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformDecl> {
        self.desc.uniforms.iter().find(|decl| decl.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct Material {
    pub shader: ShaderHandle,
    pub params: HashMap<String, UniformValue>,
    pub textures: HashMap<String, TextureHandle>,
    pub next_pass: Option<MaterialHandle>,
    pub render_priority: i32,
    /// The material this one was duplicated from.
    pub origin: Option<MaterialHandle>,
    pub(crate) can_cast_shadow: bool,
    pub(crate) is_alpha: bool,
}

impl Material {
    pub fn is_alpha(&self) -> bool {
        self.is_alpha
    }

    pub fn can_cast_shadow(&self) -> bool {
        self.can_cast_shadow
    }
}

impl RasterStorage {
    pub fn shader_create(&mut self, desc: ShaderDesc) -> ShaderHandle {
        self.shaders.insert(Shader { desc, version: 1 })
    }

    pub fn shader_set_code(&mut self, handle: ShaderHandle, desc: ShaderDesc) {
        let Some(shader) = self.shaders.get_mut(handle) else {
            log::warn!("shader_set_code on unknown shader");
            return;
        };
        shader.desc = desc;
        shader.version += 1;

        let dependents: Vec<MaterialHandle> = self
            .materials
            .iter()
            .filter(|(_, material)| material.shader == handle)
            .map(|(key, _)| key)
            .collect();
        for material in dependents {
            self.mark_material_dirty(material);
        }
    }

    pub fn shader(&self, handle: ShaderHandle) -> Option<&Shader> {
        self.shaders.get(handle)
    }

    pub fn shader_free(&mut self, handle: ShaderHandle) {
        self.shaders.remove(handle);
    }

    pub fn material_create(
        &mut self,
        shader: ShaderHandle,
        params: HashMap<String, UniformValue>,
    ) -> MaterialHandle {
        let handle = self.materials.insert(Material {
            shader,
            params,
            textures: HashMap::new(),
            next_pass: None,
            render_priority: 0,
            origin: None,
            can_cast_shadow: true,
            is_alpha: false,
        });
        self.flush_material(handle);
        handle
    }

    pub fn material(&self, handle: MaterialHandle) -> Option<&Material> {
        self.materials.get(handle)
    }

    pub fn material_set_param(&mut self, handle: MaterialHandle, name: &str, value: UniformValue) {
        let Some(material) = self.materials.get_mut(handle) else {
            return;
        };
        material.params.insert(name.to_string(), value);
        self.mark_material_dirty(handle);
    }

    /// Explicit value, else the shader's declared default.
    pub fn material_get_param(&self, handle: MaterialHandle, name: &str) -> Option<UniformValue> {
        let material = self.materials.get(handle)?;
        material.params.get(name).copied().or_else(|| {
            self.shaders
                .get(material.shader)
                .and_then(|shader| shader.uniform(name))
                .map(|decl| decl.default)
        })
    }

    pub fn material_set_texture(&mut self, handle: MaterialHandle, name: &str, texture: TextureHandle) {
        if let Some(material) = self.materials.get_mut(handle) {
            material.textures.insert(name.to_string(), texture);
        }
    }

    pub fn material_set_next_pass(&mut self, handle: MaterialHandle, next: Option<MaterialHandle>) {
        if next == Some(handle) {
            log::warn!("A material cannot be its own next pass");
            return;
        }
        if let Some(material) = self.materials.get_mut(handle) {
            material.next_pass = next;
        }
    }

    pub fn material_set_render_priority(&mut self, handle: MaterialHandle, priority: i32) {
        if let Some(material) = self.materials.get_mut(handle) {
            material.render_priority = priority.clamp(-128, 127);
        }
    }

    /// Copies params and textures into a new material sharing the shader.
    pub fn material_duplicate(&mut self, handle: MaterialHandle) -> Option<MaterialHandle> {
        let source = self.materials.get(handle)?.clone();
        let copy = Material {
            origin: Some(handle),
            ..source
        };
        Some(self.materials.insert(copy))
    }

    pub fn material_free(&mut self, handle: MaterialHandle) {
        self.materials.remove(handle);
    }

    pub(crate) fn flush_material(&mut self, handle: MaterialHandle) {
        let Some(material) = self.materials.get(handle) else {
            return;
        };
        let (is_alpha, can_cast_shadow) = match self.shaders.get(material.shader) {
            Some(shader) => (
                shader.uses_alpha(),
                !shader.uses_alpha() && shader.desc.depth_draw != DepthDrawMode::Never,
            ),
            None => (false, false),
        };
        if let Some(material) = self.materials.get_mut(handle) {
            material.is_alpha = is_alpha;
            material.can_cast_shadow = can_cast_shadow;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn tinted_shader(storage: &mut RasterStorage) -> ShaderHandle {
        storage.shader_create(ShaderDesc {
            fragment_code: "albedo = tint.rgb;".to_string(),
            uniforms: vec![UniformDecl::new("tint", UniformValue::Vec4(Vec4::ONE))],
            ..ShaderDesc::default()
        })
    }

    #[test]
    fn duplicate_has_independent_params_and_shared_shader() {
        let mut storage = RasterStorage::new();
        let shader = tinted_shader(&mut storage);
        let original = storage.material_create(shader, HashMap::new());
        let copy = storage.material_duplicate(original).expect("source exists");

        storage.material_set_param(copy, "tint", UniformValue::Vec4(Vec4::ZERO));

        assert_eq!(
            storage.material_get_param(original, "tint"),
            Some(UniformValue::Vec4(Vec4::ONE)),
            "original falls back to the declared default"
        );
        assert_eq!(
            storage.material_get_param(copy, "tint"),
            Some(UniformValue::Vec4(Vec4::ZERO))
        );
        assert_eq!(storage.material(copy).map(|m| m.shader), Some(shader));
        assert_eq!(storage.material(copy).and_then(|m| m.origin), Some(original));
    }

    #[test]
    fn blended_shaders_make_alpha_materials() {
        let mut storage = RasterStorage::new();
        let shader = storage.shader_create(ShaderDesc {
            blend: BlendMode::Mix,
            ..ShaderDesc::default()
        });
        let material = storage.material_create(shader, HashMap::new());
        let material = storage.material(material).expect("exists");

        assert!(material.is_alpha());
        assert!(!material.can_cast_shadow());
    }
}
