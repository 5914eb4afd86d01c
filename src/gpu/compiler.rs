// src/gpu/compiler.rs
//! GLSL program compilation through naga.
//!
//! A program is one GLSL 450 source with `#ifdef VERTEX` / `#ifdef FRAGMENT`
//! sections. Each stage is parsed and validated on its own, then the pair is
//! linked: fragment inputs must be fed by vertex outputs and the uniform block
//! must agree between stages.

use naga::{
    front::glsl,
    valid::{Capabilities, ModuleInfo, ValidationFlags, Validator},
    AddressSpace, Binding, ScalarKind, TypeInner, VectorSize,
};

use crate::error::{RasterError, RasterResult};
use crate::gpu::{ProgramReflection, ShaderStage, UniformKind, UniformLocation};

/// Validated naga modules for both stages plus the merged reflection.
pub struct CompiledShader {
    pub reflection: ProgramReflection,
    pub vertex: naga::Module,
    pub vertex_info: ModuleInfo,
    pub fragment: naga::Module,
    pub fragment_info: ModuleInfo,
}

pub fn compile_program_source(name: &str, source: &str) -> RasterResult<CompiledShader> {
    let (vertex, vertex_info) = compile_stage(name, source, ShaderStage::Vertex)?;
    let (fragment, fragment_info) = compile_stage(name, source, ShaderStage::Fragment)?;
    let reflection = link(name, &vertex, &fragment)?;

    Ok(CompiledShader {
        reflection,
        vertex,
        vertex_info,
        fragment,
        fragment_info,
    })
}

fn compile_stage(
    name: &str,
    source: &str,
    stage: ShaderStage,
) -> RasterResult<(naga::Module, ModuleInfo)> {
    let mut defines = naga::FastHashMap::default();
    let naga_stage = match stage {
        ShaderStage::Vertex => {
            defines.insert("VERTEX".to_string(), String::new());
            naga::ShaderStage::Vertex
        }
        ShaderStage::Fragment => {
            defines.insert("FRAGMENT".to_string(), String::new());
            naga::ShaderStage::Fragment
        }
    };

    let options = glsl::Options {
        stage: naga_stage,
        defines,
    };

    let mut frontend = glsl::Frontend::default();
    let module = frontend
        .parse(&options, source)
        .map_err(|errors| RasterError::ShaderCompile {
            name: name.to_string(),
            stage,
            log: format!("{errors}"),
        })?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|err| RasterError::ShaderCompile {
            name: name.to_string(),
            stage,
            log: format!("validation error: {err}"),
        })?;

    Ok((module, info))
}

fn link(
    name: &str,
    vertex: &naga::Module,
    fragment: &naga::Module,
) -> RasterResult<ProgramReflection> {
    let link_error = |reason: String| RasterError::ShaderLink {
        name: name.to_string(),
        reason,
    };

    let vs_entry = vertex
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga::ShaderStage::Vertex)
        .ok_or_else(|| link_error("no vertex entry point".to_string()))?;
    let fs_entry = fragment
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga::ShaderStage::Fragment)
        .ok_or_else(|| link_error("no fragment entry point".to_string()))?;

    let mut vertex_outputs = Vec::new();
    if let Some(result) = vs_entry.function.result.as_ref() {
        collect_locations(vertex, result.ty, result.binding.as_ref(), &mut vertex_outputs);
    }

    let mut fragment_inputs = Vec::new();
    for arg in &fs_entry.function.arguments {
        collect_locations(fragment, arg.ty, arg.binding.as_ref(), &mut fragment_inputs);
    }

    if let Some(missing) = fragment_inputs
        .iter()
        .find(|location| !vertex_outputs.contains(location))
    {
        return Err(link_error(format!(
            "fragment input at location {missing} has no matching vertex output"
        )));
    }

    let mut vertex_inputs = Vec::new();
    for arg in &vs_entry.function.arguments {
        collect_locations(vertex, arg.ty, arg.binding.as_ref(), &mut vertex_inputs);
    }
    vertex_inputs.sort_unstable();
    vertex_inputs.dedup();

    let mut reflection = ProgramReflection {
        vertex_inputs,
        ..ProgramReflection::default()
    };
    reflect_globals(vertex, &mut reflection);

    let mut fragment_reflection = ProgramReflection::default();
    reflect_globals(fragment, &mut fragment_reflection);

    for (uniform, location) in fragment_reflection.uniforms {
        match reflection.uniforms.get(&uniform) {
            Some(existing) if *existing != location => {
                return Err(link_error(format!(
                    "uniform `{uniform}` has a different layout in each stage"
                )));
            }
            Some(_) => {}
            None => {
                reflection.uniforms.insert(uniform, location);
            }
        }
    }
    reflection.block_size = reflection.block_size.max(fragment_reflection.block_size);
    reflection.textures.extend(fragment_reflection.textures);
    reflection.samplers.extend(fragment_reflection.samplers);
    reflection.samplers.sort_unstable();
    reflection.samplers.dedup();

    Ok(reflection)
}

fn collect_locations(
    module: &naga::Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&Binding>,
    out: &mut Vec<u32>,
) {
    match binding {
        Some(Binding::Location { location, .. }) => out.push(*location),
        Some(Binding::BuiltIn(_)) => {}
        None => {
            if let TypeInner::Struct { ref members, .. } = module.types[ty].inner {
                for member in members {
                    collect_locations(module, member.ty, member.binding.as_ref(), out);
                }
            }
        }
    }
}

fn reflect_globals(module: &naga::Module, reflection: &mut ProgramReflection) {
    for (_, var) in module.global_variables.iter() {
        match var.space {
            AddressSpace::Uniform => {
                let TypeInner::Struct { ref members, span } = module.types[var.ty].inner else {
                    continue;
                };
                reflection.block_size = reflection.block_size.max(span);
                for member in members {
                    let Some(name) = member.name.as_ref() else {
                        continue;
                    };
                    let Some(kind) = uniform_kind(&module.types[member.ty].inner) else {
                        log::debug!("Skipping uniform `{}` of unsupported type", name);
                        continue;
                    };
                    reflection.uniforms.insert(
                        name.clone(),
                        UniformLocation {
                            offset: member.offset,
                            kind,
                        },
                    );
                }
            }
            AddressSpace::Handle => {
                let Some(binding) = var.binding.as_ref() else {
                    continue;
                };
                match module.types[var.ty].inner {
                    TypeInner::Image { .. } => {
                        if let Some(name) = var.name.as_ref() {
                            reflection.textures.insert(name.clone(), binding.binding);
                        }
                    }
                    TypeInner::Sampler { .. } => reflection.samplers.push(binding.binding),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

fn uniform_kind(inner: &TypeInner) -> Option<UniformKind> {
    match *inner {
        TypeInner::Scalar(scalar) => match scalar.kind {
            ScalarKind::Float => Some(UniformKind::Float),
            ScalarKind::Sint => Some(UniformKind::Int),
            _ => None,
        },
        TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float => match size {
            VectorSize::Bi => Some(UniformKind::Vec2),
            VectorSize::Tri => Some(UniformKind::Vec3),
            VectorSize::Quad => Some(UniformKind::Vec4),
        },
        TypeInner::Matrix {
            columns: VectorSize::Quad,
            rows: VectorSize::Quad,
            ..
        } => Some(UniformKind::Mat4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINTED: &str = r#"#version 450
layout(set = 0, binding = 0) uniform TintBlock {
    mat4 world_transform;
    vec4 tint;
    float strength;
};
layout(set = 1, binding = 0) uniform texture2D albedo_texture;
layout(set = 1, binding = 16) uniform sampler material_sampler;

#ifdef VERTEX
layout(location = 0) in vec3 vertex_attrib;
layout(location = 4) in vec2 uv_attrib;
layout(location = 2) out vec2 uv_interp;
void main() {
    uv_interp = uv_attrib;
    gl_Position = world_transform * vec4(vertex_attrib, 1.0);
}
#endif

#ifdef FRAGMENT
layout(location = 2) in vec2 uv_interp;
layout(location = 0) out vec4 frag_color;
void main() {
    frag_color = texture(sampler2D(albedo_texture, material_sampler), uv_interp) * tint * strength;
}
#endif
"#;

    #[test]
    fn reflects_std140_offsets_and_texture_units() {
        let compiled = compile_program_source("tinted", TINTED).expect("valid program");
        let reflection = &compiled.reflection;

        assert_eq!(
            reflection.uniform("world_transform"),
            Some(UniformLocation {
                offset: 0,
                kind: UniformKind::Mat4
            })
        );
        assert_eq!(reflection.uniform("tint").map(|u| u.offset), Some(64));
        assert_eq!(reflection.uniform("strength").map(|u| u.offset), Some(80));
        assert_eq!(reflection.texture_unit("albedo_texture"), Some(0));
        assert!(reflection.samplers.contains(&16));
        assert_eq!(reflection.vertex_inputs, vec![0, 4]);
    }

    #[test]
    fn malformed_fragment_reports_fragment_stage() {
        let broken = TINTED.replace("frag_color = texture", "frag_color = undefined_fn(");
        let err = compile_program_source("broken", &broken)
            .err()
            .expect("malformed source must not compile");

        assert!(
            matches!(
                err,
                RasterError::ShaderCompile {
                    stage: ShaderStage::Fragment,
                    ..
                }
            ),
            "unexpected error {err}"
        );
    }

    #[test]
    fn unmatched_varying_fails_to_link() {
        let unmatched = TINTED.replace(
            "layout(location = 2) in vec2 uv_interp;",
            "layout(location = 5) in vec2 uv_interp;",
        );
        let err = compile_program_source("unmatched", &unmatched)
            .err()
            .expect("mismatched varyings must not link");

        assert!(matches!(err, RasterError::ShaderLink { .. }), "unexpected error {err}");
    }
}
