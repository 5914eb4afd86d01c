// src/renderer/shader_variants.rs
//! Feature-bitmask shader variants.
//!
//! Each material shader is compiled once per feature combination it is
//! drawn with. The define block for a combination comes from a static
//! table, so every feature bit has exactly one define name.

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;

use super::storage::{
    DiffuseModel, MaterialHandle, RasterStorage, Shader, ShaderDesc, ShaderFlags, ShaderHandle,
    SpecularModel,
};
use crate::gpu::{CompiledProgram, GpuContext};

const SCENE_TEMPLATE: &str = include_str!("shaders/scene.glsl");

/// Texture units available to material textures; higher units are taken
/// by the lightmap, shadow maps and data textures.
pub const MATERIAL_TEXTURE_UNITS: usize = 7;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFeatures: u64 {
        const UNSHADED = 1 << 0;
        const BASE_PASS = 1 << 1;
        const ENABLE_COLOR_INTERP = 1 << 2;
        const ENABLE_UV_INTERP = 1 << 3;
        const ENABLE_UV2_INTERP = 1 << 4;
        const ENABLE_TANGENT_INTERP = 1 << 5;
        const USE_SKELETON = 1 << 6;
        const USE_SKELETON_SOFTWARE = 1 << 7;
        const USE_INSTANCING = 1 << 8;
        const USE_LIGHTMAP = 1 << 9;
        const USE_SHADOW = 1 << 10;
        const USE_RGBA_SHADOWS = 1 << 11;
        const RENDER_DEPTH = 1 << 12;
        const USE_DEPTH_PREPASS = 1 << 13;
        const LIGHT_MODE_DIRECTIONAL = 1 << 14;
        const LIGHT_MODE_OMNI = 1 << 15;
        const LIGHT_MODE_SPOT = 1 << 16;
        const LIGHT_USE_PSSM2 = 1 << 17;
        const LIGHT_USE_PSSM4 = 1 << 18;
        const DIFFUSE_LAMBERT = 1 << 19;
        const DIFFUSE_LAMBERT_WRAP = 1 << 20;
        const DIFFUSE_OREN_NAYAR = 1 << 21;
        const DIFFUSE_BURLEY = 1 << 22;
        const DIFFUSE_TOON = 1 << 23;
        const SPECULAR_SCHLICK_GGX = 1 << 24;
        const SPECULAR_BLINN = 1 << 25;
        const SPECULAR_PHONG = 1 << 26;
        const SPECULAR_TOON = 1 << 27;
        const SPECULAR_DISABLED = 1 << 28;
        const FOG_DEPTH_ENABLED = 1 << 29;
        const FOG_HEIGHT_ENABLED = 1 << 30;
        const RENDER_DEPTH_DUAL_PARABOLOID = 1 << 31;
        const LIGHT_USE_RIM = 1 << 32;
    }
}

pub const FEATURE_DEFINES: &[(ShaderFeatures, &str)] = &[
    (ShaderFeatures::UNSHADED, "SHADELESS"),
    (ShaderFeatures::BASE_PASS, "BASE_PASS"),
    (ShaderFeatures::ENABLE_COLOR_INTERP, "ENABLE_COLOR_INTERP"),
    (ShaderFeatures::ENABLE_UV_INTERP, "ENABLE_UV_INTERP"),
    (ShaderFeatures::ENABLE_UV2_INTERP, "ENABLE_UV2_INTERP"),
    (ShaderFeatures::ENABLE_TANGENT_INTERP, "ENABLE_TANGENT_INTERP"),
    (ShaderFeatures::USE_SKELETON, "USE_SKELETON"),
    (ShaderFeatures::USE_SKELETON_SOFTWARE, "USE_SKELETON_SOFTWARE"),
    (ShaderFeatures::USE_INSTANCING, "USE_INSTANCING"),
    (ShaderFeatures::USE_LIGHTMAP, "USE_LIGHTMAP"),
    (ShaderFeatures::USE_SHADOW, "USE_SHADOW"),
    (ShaderFeatures::USE_RGBA_SHADOWS, "USE_RGBA_SHADOWS"),
    (ShaderFeatures::RENDER_DEPTH, "RENDER_DEPTH"),
    (ShaderFeatures::USE_DEPTH_PREPASS, "USE_DEPTH_PREPASS"),
    (ShaderFeatures::LIGHT_MODE_DIRECTIONAL, "LIGHT_MODE_DIRECTIONAL"),
    (ShaderFeatures::LIGHT_MODE_OMNI, "LIGHT_MODE_OMNI"),
    (ShaderFeatures::LIGHT_MODE_SPOT, "LIGHT_MODE_SPOT"),
    (ShaderFeatures::LIGHT_USE_PSSM2, "LIGHT_USE_PSSM2"),
    (ShaderFeatures::LIGHT_USE_PSSM4, "LIGHT_USE_PSSM4"),
    (ShaderFeatures::DIFFUSE_LAMBERT, "DIFFUSE_LAMBERT"),
    (ShaderFeatures::DIFFUSE_LAMBERT_WRAP, "DIFFUSE_LAMBERT_WRAP"),
    (ShaderFeatures::DIFFUSE_OREN_NAYAR, "DIFFUSE_OREN_NAYAR"),
    (ShaderFeatures::DIFFUSE_BURLEY, "DIFFUSE_BURLEY"),
    (ShaderFeatures::DIFFUSE_TOON, "DIFFUSE_TOON"),
    (ShaderFeatures::SPECULAR_SCHLICK_GGX, "SPECULAR_SCHLICK_GGX"),
    (ShaderFeatures::SPECULAR_BLINN, "SPECULAR_BLINN"),
    (ShaderFeatures::SPECULAR_PHONG, "SPECULAR_PHONG"),
    (ShaderFeatures::SPECULAR_TOON, "SPECULAR_TOON"),
    (ShaderFeatures::SPECULAR_DISABLED, "SPECULAR_DISABLED"),
    (ShaderFeatures::FOG_DEPTH_ENABLED, "FOG_DEPTH_ENABLED"),
    (ShaderFeatures::FOG_HEIGHT_ENABLED, "FOG_HEIGHT_ENABLED"),
    (ShaderFeatures::RENDER_DEPTH_DUAL_PARABOLOID, "RENDER_DEPTH_DUAL_PARABOLOID"),
    (ShaderFeatures::LIGHT_USE_RIM, "LIGHT_USE_RIM"),
];

const fn table_bits(table: &[(ShaderFeatures, &str)]) -> u64 {
    let mut bits = 0;
    let mut i = 0;
    while i < table.len() {
        bits |= table[i].0.bits();
        i += 1;
    }
    bits
}

const _: () = assert!(
    table_bits(FEATURE_DEFINES) == ShaderFeatures::all().bits(),
    "every shader feature needs a define"
);

impl ShaderFeatures {
    pub fn define_block(self) -> String {
        FEATURE_DEFINES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| format!("#define {}\n", name))
            .collect()
    }

    pub fn diffuse(model: DiffuseModel) -> Self {
        match model {
            DiffuseModel::Burley => Self::DIFFUSE_BURLEY,
            DiffuseModel::Lambert => Self::DIFFUSE_LAMBERT,
            DiffuseModel::LambertWrap => Self::DIFFUSE_LAMBERT_WRAP,
            DiffuseModel::OrenNayar => Self::DIFFUSE_OREN_NAYAR,
            DiffuseModel::Toon => Self::DIFFUSE_TOON,
        }
    }

    pub fn specular(model: SpecularModel) -> Self {
        match model {
            SpecularModel::SchlickGgx => Self::SPECULAR_SCHLICK_GGX,
            SpecularModel::Blinn => Self::SPECULAR_BLINN,
            SpecularModel::Phong => Self::SPECULAR_PHONG,
            SpecularModel::Toon => Self::SPECULAR_TOON,
            SpecularModel::Disabled => Self::SPECULAR_DISABLED,
        }
    }

    /// Features implied by the shader itself rather than by the draw.
    pub fn from_shader(shader: &Shader) -> Self {
        let flags = shader.desc.flags;
        if flags.contains(ShaderFlags::UNSHADED) {
            return Self::UNSHADED;
        }
        let mut features = Self::diffuse(shader.desc.diffuse) | Self::specular(shader.desc.specular);
        features.set(Self::LIGHT_USE_RIM, flags.contains(ShaderFlags::USES_RIM));
        features
    }
}

/// Assembles the full GLSL for one variant.
pub fn build_variant_source(desc: &ShaderDesc, features: ShaderFeatures) -> String {
    let uniforms: String = desc
        .uniforms
        .iter()
        .map(|decl| format!("    {} {};\n", decl.kind.glsl_name(), decl.name))
        .collect();

    if desc.textures.len() > MATERIAL_TEXTURE_UNITS {
        log::warn!(
            "Shader declares {} textures; only the first {} are bound",
            desc.textures.len(),
            MATERIAL_TEXTURE_UNITS
        );
    }
    let textures: String = desc
        .textures
        .iter()
        .take(MATERIAL_TEXTURE_UNITS)
        .enumerate()
        .map(|(unit, decl)| {
            format!(
                "layout(set = 1, binding = {}) uniform texture2D {};\n",
                unit, decl.name
            )
        })
        .collect();

    let mut source = String::with_capacity(SCENE_TEMPLATE.len() + 512);
    source.push_str("#version 450\n");
    source.push_str(&features.define_block());
    source.push_str(
        &SCENE_TEMPLATE
            .replace("//@MATERIAL_UNIFORMS", &uniforms)
            .replace("//@MATERIAL_TEXTURES", &textures)
            .replace("//@VERTEX_CODE", &desc.vertex_code)
            .replace("//@FRAGMENT_CODE", &desc.fragment_code),
    );
    source
}

/// Compiled variants memoized by (shader, features). Failed compiles are
/// memoized too, as `None`, so a broken shader is only reported once.
#[derive(Default)]
pub struct ShaderVariantCache {
    variants: HashMap<(ShaderHandle, ShaderFeatures), Option<Rc<CompiledProgram>>>,
    versions: HashMap<ShaderHandle, u64>,
    compiled: usize,
    failed: usize,
}

impl ShaderVariantCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiled(&self) -> usize {
        self.compiled
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// The material's shader compiled with `features`, or `None` when the
    /// material is unknown or the variant fails to build. Callers skip the
    /// draw on `None`.
    pub fn get_shader_variant(
        &mut self,
        ctx: &mut dyn GpuContext,
        storage: &RasterStorage,
        material: MaterialHandle,
        features: ShaderFeatures,
    ) -> Option<Rc<CompiledProgram>> {
        let shader_handle = storage.material(material)?.shader;
        let shader = storage.shader(shader_handle)?;
        self.variant_for_shader(ctx, shader_handle, shader, features)
    }

    pub fn variant_for_shader(
        &mut self,
        ctx: &mut dyn GpuContext,
        handle: ShaderHandle,
        shader: &Shader,
        features: ShaderFeatures,
    ) -> Option<Rc<CompiledProgram>> {
        if self.versions.get(&handle) != Some(&shader.version) {
            self.evict_shader(ctx, handle);
            self.versions.insert(handle, shader.version);
        }

        if let Some(variant) = self.variants.get(&(handle, features)) {
            return variant.clone();
        }

        let name = format!("{:?}[{:#x}]", handle, features.bits());
        let source = build_variant_source(&shader.desc, features);
        let variant = match ctx.compile_program(&name, &source) {
            Ok(program) => {
                self.compiled += 1;
                log::debug!("Compiled shader variant {}", name);
                Some(Rc::new(program))
            }
            Err(err) => {
                self.failed += 1;
                log::error!("Shader variant {} failed: {}", name, err);
                None
            }
        };
        self.variants.insert((handle, features), variant.clone());
        variant
    }

    /// Drops every variant of a shader, e.g. after its code changed.
    pub fn evict_shader(&mut self, ctx: &mut dyn GpuContext, handle: ShaderHandle) {
        self.variants.retain(|(shader, _), variant| {
            if *shader != handle {
                return true;
            }
            if let Some(program) = variant.take() {
                ctx.delete_program(program.id);
            }
            false
        });
    }

    pub fn clear(&mut self, ctx: &mut dyn GpuContext) {
        for (_, variant) in self.variants.drain() {
            if let Some(program) = variant {
                ctx.delete_program(program.id);
            }
        }
        self.versions.clear();
    }
}

/// Fixed-function programs (clear, sky, post effects) memoized by name and
/// define list.
#[derive(Default)]
pub struct InternalPrograms {
    programs: HashMap<(&'static str, Vec<&'static str>), Option<Rc<CompiledProgram>>>,
}

impl InternalPrograms {
    pub fn get(
        &mut self,
        ctx: &mut dyn GpuContext,
        name: &'static str,
        template: &'static str,
        defines: &[&'static str],
    ) -> Option<Rc<CompiledProgram>> {
        let key = (name, defines.to_vec());
        if let Some(program) = self.programs.get(&key) {
            return program.clone();
        }

        let mut source = String::from("#version 450\n");
        for define in defines {
            source.push_str("#define ");
            source.push_str(define);
            source.push('\n');
        }
        source.push_str(template);

        let program = match ctx.compile_program(name, &source) {
            Ok(program) => Some(Rc::new(program)),
            Err(err) => {
                log::error!("Built-in program {} failed: {}", name, err);
                None
            }
        };
        self.programs.insert(key, program.clone());
        program
    }
}
