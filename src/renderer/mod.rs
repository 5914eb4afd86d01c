pub mod light_instance;
pub mod material_base;
pub mod post_process;
pub mod primitives;
pub mod render_list;
pub mod scene_raster;
pub mod shader_variants;
pub mod shadow_atlas;
pub mod shadows;
pub mod state_cache;
pub mod storage;
pub mod vertex;

pub use light_instance::{LightInstance, LightInstanceHandle, LightRegistry, ShadowAtlasHandle};
pub use material_base::{MaterialBaseCache, MaterialDescriptor, MaterialFeature};
pub use render_list::{RenderElement, RenderList};
pub use scene_raster::{EnvironmentHandle, RenderStats, SceneRasterizer};
pub use shader_variants::{ShaderFeatures, ShaderVariantCache};
pub use shadow_atlas::{ShadowAtlas, ShadowKey};
pub use storage::RasterStorage;
pub use vertex::{InstanceData, Vertex};
