// src/scene/mod.rs
//! Data handed to the rasterizer by the scene graph each frame.

pub mod camera;
pub mod instance;

pub use camera::CameraSetup;
pub use instance::{InstanceGeometry, ShadowCasting, VisibleInstance};
