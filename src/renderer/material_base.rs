// src/renderer/material_base.rs
//! Declarative materials.
//!
//! A [`MaterialDescriptor`] names a set of features plus lighting models.
//! Every distinct (features, diffuse, specular) combination generates one
//! base shader, memoized in a [`MaterialBaseCache`]; each descriptor then
//! gets its own material instance on top of that shader.

use std::collections::{BTreeSet, HashMap};

use glam::Vec4;
use serde::{Deserialize, Serialize};

use super::shader_variants::{ShaderFeatures, ShaderVariantCache};
use super::storage::{
    DiffuseModel, MaterialHandle, RasterStorage, ShaderDesc, ShaderFlags, ShaderHandle,
    SpecularModel, TextureDecl, TextureHandle, TextureHint, UniformDecl,
};
use crate::gpu::{BlendMode, CullMode, GpuContext, UniformValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MaterialFeature {
    AlbedoTexture,
    MetallicRoughnessTexture,
    NormalTexture,
    EmissionTexture,
    OcclusionTexture,
    Emission,
    VertexColorAlbedo,
    Rim,
    AlphaBlend,
    DoubleSided,
    Unshaded,
    NoDepthTest,
    DontReceiveShadows,
}

#[derive(Debug, Clone, Default)]
pub struct MaterialDescriptor {
    pub features: BTreeSet<MaterialFeature>,
    pub diffuse: DiffuseModel,
    pub specular: SpecularModel,
    pub params: HashMap<String, UniformValue>,
    pub textures: HashMap<String, TextureHandle>,
}

impl MaterialDescriptor {
    pub fn new(features: impl IntoIterator<Item = MaterialFeature>) -> Self {
        Self {
            features: features.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<UniformValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_texture(mut self, name: &str, texture: TextureHandle) -> Self {
        self.textures.insert(name.to_string(), texture);
        self
    }

    pub fn key(&self) -> MaterialBaseKey {
        MaterialBaseKey {
            features: self.features.iter().copied().collect(),
            diffuse: self.diffuse,
            specular: self.specular,
        }
    }
}

/// Identity of a generated base shader. `features` is sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialBaseKey {
    pub features: Vec<MaterialFeature>,
    pub diffuse: DiffuseModel,
    pub specular: SpecularModel,
}

/// Base shaders by key. `None` marks a combination whose shader failed to
/// build; descriptors with that key get the fallback material.
#[derive(Default)]
pub struct MaterialBaseCache {
    bases: HashMap<MaterialBaseKey, Option<ShaderHandle>>,
}

impl MaterialBaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    pub fn base_shader(&self, key: &MaterialBaseKey) -> Option<ShaderHandle> {
        self.bases.get(key).copied().flatten()
    }

    /// Returns a new material for `descriptor`, or `fallback` when the base
    /// shader for its feature set does not compile.
    pub fn material_create_from_descriptor(
        &mut self,
        ctx: &mut dyn GpuContext,
        storage: &mut RasterStorage,
        variants: &mut ShaderVariantCache,
        descriptor: &MaterialDescriptor,
        fallback: Option<MaterialHandle>,
    ) -> Option<MaterialHandle> {
        let key = descriptor.key();
        let base = match self.bases.get(&key) {
            Some(base) => *base,
            None => {
                let base = build_base_shader(ctx, storage, variants, &key);
                self.bases.insert(key.clone(), base);
                base
            }
        };

        let Some(shader) = base else {
            log::warn!("Material base {:?} unavailable, using the default material", key.features);
            return fallback;
        };

        let material = storage.material_create(shader, descriptor.params.clone());
        for (name, texture) in &descriptor.textures {
            storage.material_set_texture(material, name, *texture);
        }
        Some(material)
    }

    /// Frees every base shader; materials created from them keep dangling
    /// shader handles and stop drawing.
    pub fn clear(&mut self, ctx: &mut dyn GpuContext, storage: &mut RasterStorage, variants: &mut ShaderVariantCache) {
        for shader in self.bases.drain().filter_map(|(_, shader)| shader) {
            variants.evict_shader(ctx, shader);
            storage.shader_free(shader);
        }
    }
}

fn build_base_shader(
    ctx: &mut dyn GpuContext,
    storage: &mut RasterStorage,
    variants: &mut ShaderVariantCache,
    key: &MaterialBaseKey,
) -> Option<ShaderHandle> {
    let desc = generate_shader_desc(key);
    let handle = storage.shader_create(desc);
    let shader = storage.shader(handle)?.clone();

    // Probe the plainest lit variant so a broken combination is caught here
    // instead of on every draw.
    let probe = ShaderFeatures::from_shader(&shader) | ShaderFeatures::BASE_PASS;
    if variants.variant_for_shader(ctx, handle, &shader, probe).is_none() {
        variants.evict_shader(ctx, handle);
        storage.shader_free(handle);
        return None;
    }
    log::debug!("Created material base {:?}", key);
    Some(handle)
}

/// Declares a material texture and appends the code reading it, guarded by
/// the vertex arrays it needs.
fn sampled(
    textures: &mut Vec<TextureDecl>,
    fragment: &mut String,
    name: &str,
    hint: TextureHint,
    body: &str,
    needs: &str,
) {
    textures.push(TextureDecl {
        name: name.to_string(),
        hint,
    });
    fragment.push_str(&format!("#if {needs}\n{body}#endif\n"));
}

/// Shader resource for one feature combination.
pub fn generate_shader_desc(key: &MaterialBaseKey) -> ShaderDesc {
    let has = |feature: MaterialFeature| key.features.binary_search(&feature).is_ok();

    let mut uniforms = vec![
        UniformDecl::new("albedo_color", UniformValue::Vec4(Vec4::ONE)),
        UniformDecl::new("roughness_value", UniformValue::Float(1.0)),
        UniformDecl::new("metallic_value", UniformValue::Float(0.0)),
        UniformDecl::new("specular_value", UniformValue::Float(0.5)),
    ];
    let mut textures = Vec::new();
    let mut fragment = String::from(
        "    albedo = albedo_color.rgb;\n    alpha = albedo_color.a;\n    roughness = roughness_value;\n    metallic = metallic_value;\n    specular = specular_value;\n",
    );
    let mut flags = ShaderFlags::empty();

    if has(MaterialFeature::VertexColorAlbedo) {
        flags |= ShaderFlags::USES_VERTEX_COLOR;
        fragment.push_str("#ifdef ENABLE_COLOR_INTERP\n    albedo *= color.rgb;\n    alpha *= color.a;\n#endif\n");
    }

    if has(MaterialFeature::AlbedoTexture) {
        sampled(
            &mut textures,
            &mut fragment,
            "albedo_texture",
            TextureHint::White,
            "    vec4 albedo_tex = textureLod(sampler2D(albedo_texture, material_sampler), uv, 0.0);\n    albedo *= albedo_tex.rgb;\n    alpha *= albedo_tex.a;\n",
            "defined(ENABLE_UV_INTERP)",
        );
    }
    if has(MaterialFeature::MetallicRoughnessTexture) {
        sampled(
            &mut textures,
            &mut fragment,
            "metallic_roughness_texture",
            TextureHint::White,
            "    vec4 mr_tex = textureLod(sampler2D(metallic_roughness_texture, material_sampler), uv, 0.0);\n    roughness *= mr_tex.g;\n    metallic *= mr_tex.b;\n",
            "defined(ENABLE_UV_INTERP)",
        );
    }
    if has(MaterialFeature::NormalTexture) {
        flags |= ShaderFlags::USES_TANGENT;
        sampled(
            &mut textures,
            &mut fragment,
            "normal_texture",
            TextureHint::Normal,
            "    vec3 normal_tex = textureLod(sampler2D(normal_texture, material_sampler), uv, 0.0).xyz * 2.0 - 1.0;\n    normal = normalize(mat3(normalize(tangent_interp), normalize(binormal_interp), normal) * normal_tex);\n",
            "defined(ENABLE_UV_INTERP) && defined(ENABLE_TANGENT_INTERP)",
        );
    }
    if has(MaterialFeature::OcclusionTexture) {
        sampled(
            &mut textures,
            &mut fragment,
            "occlusion_texture",
            TextureHint::White,
            "    ao = textureLod(sampler2D(occlusion_texture, material_sampler), uv, 0.0).r;\n",
            "defined(ENABLE_UV_INTERP)",
        );
    }
    if has(MaterialFeature::Emission) || has(MaterialFeature::EmissionTexture) {
        uniforms.push(UniformDecl::new("emission_color", UniformValue::Vec4(Vec4::new(0.0, 0.0, 0.0, 1.0))));
        uniforms.push(UniformDecl::new("emission_energy", UniformValue::Float(1.0)));
        fragment.push_str("    emission = emission_color.rgb * emission_energy;\n");
    }
    if has(MaterialFeature::EmissionTexture) {
        sampled(
            &mut textures,
            &mut fragment,
            "emission_texture",
            TextureHint::Black,
            "    emission *= textureLod(sampler2D(emission_texture, material_sampler), uv, 0.0).rgb;\n",
            "defined(ENABLE_UV_INTERP)",
        );
    }
    if has(MaterialFeature::Rim) {
        flags |= ShaderFlags::USES_RIM;
        uniforms.push(UniformDecl::new("rim_amount", UniformValue::Float(0.5)));
        uniforms.push(UniformDecl::new("rim_tint_amount", UniformValue::Float(0.5)));
        fragment.push_str("    rim = rim_amount;\n    rim_tint = rim_tint_amount;\n");
    }

    let blend = if has(MaterialFeature::AlphaBlend) {
        flags |= ShaderFlags::USES_ALPHA;
        BlendMode::Mix
    } else {
        BlendMode::Disabled
    };
    flags.set(ShaderFlags::UNSHADED, has(MaterialFeature::Unshaded));
    flags.set(ShaderFlags::NO_DEPTH_TEST, has(MaterialFeature::NoDepthTest));
    flags.set(
        ShaderFlags::DONT_RECEIVE_SHADOWS,
        has(MaterialFeature::DontReceiveShadows),
    );

    ShaderDesc {
        vertex_code: String::new(),
        fragment_code: fragment,
        uniforms,
        textures,
        blend,
        cull: if has(MaterialFeature::DoubleSided) {
            CullMode::Disabled
        } else {
            CullMode::Back
        },
        flags,
        diffuse: key.diffuse,
        specular: key.specular,
        ..ShaderDesc::default()
    }
}

/// Plain lit material used when nothing else resolves.
pub fn default_shader_desc() -> ShaderDesc {
    ShaderDesc {
        fragment_code: "    albedo = albedo_color.rgb;\n".to_string(),
        uniforms: vec![UniformDecl::new(
            "albedo_color",
            UniformValue::Vec4(Vec4::new(0.8, 0.8, 0.8, 1.0)),
        )],
        ..ShaderDesc::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;

    struct Fixture {
        ctx: HeadlessContext,
        storage: RasterStorage,
        variants: ShaderVariantCache,
        cache: MaterialBaseCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ctx: HeadlessContext::new(16, 16),
                storage: RasterStorage::new(),
                variants: ShaderVariantCache::new(),
                cache: MaterialBaseCache::new(),
            }
        }

        fn create(&mut self, descriptor: &MaterialDescriptor) -> Option<MaterialHandle> {
            self.cache.material_create_from_descriptor(
                &mut self.ctx,
                &mut self.storage,
                &mut self.variants,
                descriptor,
                None,
            )
        }
    }

    #[test]
    fn feature_order_does_not_change_the_key() {
        let a = MaterialDescriptor::new([MaterialFeature::Rim, MaterialFeature::AlbedoTexture]);
        let b = MaterialDescriptor::new([MaterialFeature::AlbedoTexture, MaterialFeature::Rim]);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn one_base_shader_per_combination() {
        let mut fixture = Fixture::new();
        let red = MaterialDescriptor::new([MaterialFeature::AlbedoTexture])
            .with_param("albedo_color", Vec4::new(1.0, 0.0, 0.0, 1.0));
        let blue = MaterialDescriptor::new([MaterialFeature::AlbedoTexture])
            .with_param("albedo_color", Vec4::new(0.0, 0.0, 1.0, 1.0));

        let first = fixture.create(&red).expect("compiles");
        let second = fixture.create(&blue).expect("compiles");

        assert_ne!(first, second);
        assert_eq!(fixture.cache.len(), 1);
        let shader = |m| fixture.storage.material(m).map(|m| m.shader);
        assert_eq!(shader(first), shader(second));
        assert_eq!(
            fixture.storage.material_get_param(second, "albedo_color"),
            Some(UniformValue::Vec4(Vec4::new(0.0, 0.0, 1.0, 1.0)))
        );
    }

    #[test]
    fn every_feature_generates_compilable_code() {
        let mut fixture = Fixture::new();
        let all = MaterialDescriptor {
            features: [
                MaterialFeature::AlbedoTexture,
                MaterialFeature::MetallicRoughnessTexture,
                MaterialFeature::NormalTexture,
                MaterialFeature::EmissionTexture,
                MaterialFeature::OcclusionTexture,
                MaterialFeature::VertexColorAlbedo,
                MaterialFeature::Rim,
                MaterialFeature::DoubleSided,
            ]
            .into_iter()
            .collect(),
            diffuse: DiffuseModel::OrenNayar,
            specular: SpecularModel::Blinn,
            ..MaterialDescriptor::default()
        };
        let material = fixture.create(&all).expect("compiles");
        let shader_handle = fixture.storage.material(material).expect("exists").shader;
        let shader = fixture.storage.shader(shader_handle).expect("exists").clone();

        let textured = ShaderFeatures::from_shader(&shader)
            | ShaderFeatures::BASE_PASS
            | ShaderFeatures::ENABLE_UV_INTERP
            | ShaderFeatures::ENABLE_TANGENT_INTERP
            | ShaderFeatures::ENABLE_COLOR_INTERP
            | ShaderFeatures::LIGHT_MODE_OMNI;
        assert!(fixture
            .variants
            .variant_for_shader(&mut fixture.ctx, shader_handle, &shader, textured)
            .is_some());
    }

    #[test]
    fn alpha_blend_makes_alpha_materials() {
        let mut fixture = Fixture::new();
        let glass = fixture
            .create(&MaterialDescriptor::new([MaterialFeature::AlphaBlend]))
            .expect("compiles");
        assert!(fixture.storage.material(glass).expect("exists").is_alpha());
    }
}
