use thiserror::Error;

use crate::gpu::ShaderStage;

/// Failures raised inside the rasterizer core.
///
/// None of these cross the frame boundary: the per-frame entry points log
/// them and carry on with degraded output.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("{stage:?} shader `{name}` failed to compile:\n{log}")]
    ShaderCompile {
        name: String,
        stage: ShaderStage,
        log: String,
    },

    #[error("shader `{name}` failed to link: {reason}")]
    ShaderLink { name: String, reason: String },

    #[error("texture format {0:?} is not supported by this context")]
    UnsupportedTextureFormat(crate::gpu::TextureFormat),

    #[error("texture data is {actual} bytes, expected {expected}")]
    TextureDataSize { expected: usize, actual: usize },

    #[error("unknown {0} handle")]
    UnknownResource(&'static str),

    #[error("gpu backend error: {0}")]
    Backend(String),
}

pub type RasterResult<T> = Result<T, RasterError>;
