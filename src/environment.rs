use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::renderer::storage::TextureHandle;

/// How the background of a frame is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackgroundMode {
    /// Clear with the render target's default clear color.
    #[default]
    ClearColor,
    /// Clear with [`Environment::bg_color`].
    Color,
    /// Draw the sky panorama after the opaque pass.
    Sky,
    /// Keep whatever 2D content is already in the target.
    Canvas,
    /// Camera feed passthrough, drawn like `Canvas` here.
    CameraFeed,
    /// Do not touch the color buffer.
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sky {
    /// Equirectangular radiance panorama.
    #[serde(skip)]
    pub radiance: Option<TextureHandle>,
    pub energy: f32,
    /// Overrides the camera FOV (degrees) for the sky pass when non-zero.
    pub custom_fov: f32,
}

impl Default for Sky {
    fn default() -> Self {
        Self {
            radiance: None,
            energy: 1.0,
            custom_fov: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ambient {
    pub color: Vec3,
    pub energy: f32,
    /// Fraction of ambient light taken from the sky instead of `color`.
    pub sky_contribution: f32,
}

impl Default for Ambient {
    fn default() -> Self {
        Self {
            color: Vec3::splat(0.1),
            energy: 1.0,
            sky_contribution: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fog {
    pub color: Vec3,
    pub sun_color: Vec3,
    pub sun_amount: f32,
    pub depth_enabled: bool,
    pub depth_begin: f32,
    pub depth_end: f32,
    pub depth_curve: f32,
    pub height_enabled: bool,
    pub height_min: f32,
    pub height_max: f32,
    pub height_curve: f32,
}

impl Default for Fog {
    fn default() -> Self {
        Self {
            color: Vec3::splat(0.5),
            sun_color: Vec3::ONE,
            sun_amount: 0.0,
            depth_enabled: false,
            depth_begin: 10.0,
            depth_end: 100.0,
            depth_curve: 1.0,
            height_enabled: false,
            height_min: 10.0,
            height_max: 0.0,
            height_curve: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthOfField {
    pub far_enabled: bool,
    pub far_distance: f32,
    pub far_transition: f32,
    pub near_enabled: bool,
    pub near_distance: f32,
    pub near_transition: f32,
    pub amount: f32,
}

impl Default for DepthOfField {
    fn default() -> Self {
        Self {
            far_enabled: false,
            far_distance: 10.0,
            far_transition: 5.0,
            near_enabled: false,
            near_distance: 2.0,
            near_transition: 1.0,
            amount: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Glow {
    pub enabled: bool,
    pub intensity: f32,
    pub strength: f32,
    pub bloom: f32,
    pub hdr_threshold: f32,
}

impl Default for Glow {
    fn default() -> Self {
        Self {
            enabled: false,
            intensity: 0.8,
            strength: 1.0,
            bloom: 0.0,
            hdr_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorAdjustment {
    pub enabled: bool,
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

impl Default for ColorAdjustment {
    fn default() -> Self {
        Self {
            enabled: false,
            brightness: 1.0,
            contrast: 1.0,
            saturation: 1.0,
        }
    }
}

/// Read-only per-frame description of background, ambient light, fog and
/// post effects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub background: BackgroundMode,
    pub bg_color: Vec4,
    pub bg_energy: f32,
    pub sky: Sky,
    pub ambient: Ambient,
    pub fog: Fog,
    pub dof: DepthOfField,
    pub glow: Glow,
    pub adjustments: ColorAdjustment,
}

impl Environment {
    /// Creates an environment that clears to `bg_color`.
    pub fn new(bg_color: Vec4) -> Self {
        Self {
            background: BackgroundMode::Color,
            bg_color,
            bg_energy: 1.0,
            ..Self::default()
        }
    }

    pub fn with_sky(mut self, radiance: TextureHandle) -> Self {
        self.background = BackgroundMode::Sky;
        self.sky.radiance = Some(radiance);
        self
    }

    pub fn with_fog(mut self, fog: Fog) -> Self {
        self.fog = fog;
        self
    }

    /// Radiance map used for the sky pass, if the background asks for one.
    pub fn sky_radiance(&self) -> Option<TextureHandle> {
        match self.background {
            BackgroundMode::Sky => self.sky.radiance,
            _ => None,
        }
    }

    /// Whether any post-process effect needs the intermediate buffers.
    pub fn wants_post_process(&self) -> bool {
        self.dof.far_enabled || self.dof.near_enabled || self.glow.enabled || self.adjustments.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::storage::RasterStorage;

    #[test]
    fn sky_radiance_only_flows_for_sky_backgrounds() {
        let mut storage = RasterStorage::new();
        let texture = storage.texture_create();
        let sky = Environment::new(Vec4::ONE).with_sky(texture);
        assert_eq!(sky.sky_radiance(), Some(texture));

        let mut color = sky.clone();
        color.background = BackgroundMode::Color;
        assert_eq!(color.sky_radiance(), None);
    }

    #[test]
    fn post_process_is_opt_in() {
        let mut env = Environment::default();
        assert!(!env.wants_post_process());
        env.glow.enabled = true;
        assert!(env.wants_post_process());
    }
}
