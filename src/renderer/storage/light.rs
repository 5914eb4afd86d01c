// src/renderer/storage/light.rs
use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{LightHandle, RasterStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightKind {
    Directional,
    Omni,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionalShadowMode {
    #[default]
    Orthogonal,
    Parallel2Splits,
    Parallel4Splits,
}

impl DirectionalShadowMode {
    pub const fn split_count(self) -> usize {
        match self {
            DirectionalShadowMode::Orthogonal => 1,
            DirectionalShadowMode::Parallel2Splits => 2,
            DirectionalShadowMode::Parallel4Splits => 4,
        }
    }
}

/// Light resource parameters. Instances placed in the scene reference one of
/// these through a light instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub energy: f32,
    pub specular: f32,
    pub range: f32,
    pub attenuation: f32,
    /// Spot cone half-angle in degrees.
    pub spot_angle: f32,
    pub spot_attenuation: f32,
    pub negative: bool,
    pub shadow: bool,
    pub shadow_color: Vec3,
    pub shadow_bias: f32,
    pub directional_shadow_mode: DirectionalShadowMode,
    /// Split distances as fractions of `shadow_max_distance`.
    pub directional_splits: [f32; 3],
    pub shadow_max_distance: f32,
    /// Bumped on every mutation; shadow slots compare against it.
    #[serde(skip)]
    pub version: u64,
}

impl Light {
    pub fn new(kind: LightKind) -> Self {
        Self {
            kind,
            color: Vec3::ONE,
            energy: 1.0,
            specular: 0.5,
            range: 5.0,
            attenuation: 1.0,
            spot_angle: 45.0,
            spot_attenuation: 1.0,
            negative: false,
            shadow: false,
            shadow_color: Vec3::ZERO,
            shadow_bias: 0.1,
            directional_shadow_mode: DirectionalShadowMode::default(),
            directional_splits: [0.1, 0.2, 0.5],
            shadow_max_distance: 100.0,
            version: 1,
        }
    }

    pub fn casts_shadow(&self) -> bool {
        self.shadow
    }
}

impl RasterStorage {
    pub fn light_create(&mut self, kind: LightKind) -> LightHandle {
        self.lights.insert(Light::new(kind))
    }

    pub fn light(&self, handle: LightHandle) -> Option<&Light> {
        self.lights.get(handle)
    }

    /// Mutable access that bumps the light's version.
    pub fn light_mut(&mut self, handle: LightHandle) -> Option<&mut Light> {
        let light = self.lights.get_mut(handle)?;
        light.version += 1;
        Some(light)
    }

    pub fn light_free(&mut self, handle: LightHandle) {
        self.lights.remove(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_bumps_version() {
        let mut storage = RasterStorage::new();
        let handle = storage.light_create(LightKind::Spot);
        let before = storage.light(handle).map(|l| l.version);

        if let Some(light) = storage.light_mut(handle) {
            light.energy = 2.0;
        }

        let after = storage.light(handle).map(|l| l.version);
        assert_eq!(after, before.map(|v| v + 1));
    }
}
