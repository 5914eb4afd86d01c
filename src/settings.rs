use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Tunables for the rasterizer core, loaded from `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterSettings {
    #[serde(default = "RasterSettings::default_render_list_capacity")]
    pub render_list_capacity: usize,
    #[serde(default = "RasterSettings::default_shadow_atlas_size")]
    pub shadow_atlas_size: u32,
    /// Requested shadow count per atlas quadrant.
    #[serde(default = "RasterSettings::default_quadrant_subdivisions")]
    pub shadow_atlas_quadrant_subdivisions: [u32; 4],
    #[serde(default = "RasterSettings::default_directional_shadow_size")]
    pub directional_shadow_size: u32,
    #[serde(default = "RasterSettings::default_reallocation_tolerance_ms")]
    pub shadow_reallocation_tolerance_ms: u64,
    #[serde(default = "RasterSettings::default_max_lights_per_object")]
    pub max_lights_per_object: usize,
    #[serde(default = "RasterSettings::default_true")]
    pub use_rgba_shadows: bool,
    #[serde(default)]
    pub use_depth_prepass: bool,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub present_mode: PresentModeSetting,
}

impl Default for RasterSettings {
    fn default() -> Self {
        Self {
            render_list_capacity: Self::default_render_list_capacity(),
            shadow_atlas_size: Self::default_shadow_atlas_size(),
            shadow_atlas_quadrant_subdivisions: Self::default_quadrant_subdivisions(),
            directional_shadow_size: Self::default_directional_shadow_size(),
            shadow_reallocation_tolerance_ms: Self::default_reallocation_tolerance_ms(),
            max_lights_per_object: Self::default_max_lights_per_object(),
            use_rgba_shadows: true,
            use_depth_prepass: false,
            resolution: Resolution::default(),
            present_mode: PresentModeSetting::default(),
        }
    }
}

impl RasterSettings {
    pub fn load() -> Self {
        Self::load_from_path("settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RasterSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded raster settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default raster settings.",
                        path, err
                    );
                    RasterSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Raster settings file {:?} not found. Using default settings.",
                    path
                );
                RasterSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default raster settings.",
                    path, err
                );
                RasterSettings::default()
            }
        }
    }

    pub fn validate(mut self) -> Self {
        if self.render_list_capacity == 0 {
            warn!("Render list capacity must be greater than zero. Using default value.");
            self.render_list_capacity = Self::default_render_list_capacity();
        }

        if self.shadow_atlas_size == 0 || !self.shadow_atlas_size.is_power_of_two() {
            warn!(
                "Shadow atlas size {} is not a non-zero power of two. Using default value.",
                self.shadow_atlas_size
            );
            self.shadow_atlas_size = Self::default_shadow_atlas_size();
        }

        if self.directional_shadow_size == 0 {
            warn!("Directional shadow size must be greater than zero. Using default value.");
            self.directional_shadow_size = Self::default_directional_shadow_size();
        }

        for subdivision in &mut self.shadow_atlas_quadrant_subdivisions {
            if *subdivision > 1024 {
                warn!("Quadrant shadow count {} exceeds 1024. Clamping.", subdivision);
                *subdivision = 1024;
            }
        }

        if self.max_lights_per_object == 0 {
            warn!("max_lights_per_object must be greater than zero. Using 1 instead.");
            self.max_lights_per_object = 1;
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        self
    }

    pub fn present_mode(&self, available: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        let desired = self.present_mode.to_wgpu();
        if available.contains(&desired) {
            return desired;
        }

        warn!(
            "Requested present mode {:?} is not supported. Falling back to FIFO.",
            desired
        );

        if available.contains(&wgpu::PresentMode::Fifo) {
            wgpu::PresentMode::Fifo
        } else {
            available
                .first()
                .copied()
                .unwrap_or(wgpu::PresentMode::Fifo)
        }
    }

    const fn default_render_list_capacity() -> usize {
        65536
    }

    const fn default_shadow_atlas_size() -> u32 {
        4096
    }

    const fn default_quadrant_subdivisions() -> [u32; 4] {
        [1, 4, 16, 64]
    }

    const fn default_directional_shadow_size() -> u32 {
        4096
    }

    const fn default_reallocation_tolerance_ms() -> u64 {
        500
    }

    const fn default_max_lights_per_object() -> usize {
        32
    }

    const fn default_true() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    #[default]
    Fifo,
    FifoRelaxed,
    Immediate,
    Mailbox,
    AutoVsync,
    AutoNoVsync,
}

impl PresentModeSetting {
    fn to_wgpu(&self) -> wgpu::PresentMode {
        match self {
            PresentModeSetting::Fifo => wgpu::PresentMode::Fifo,
            PresentModeSetting::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
            PresentModeSetting::Immediate => wgpu::PresentMode::Immediate,
            PresentModeSetting::Mailbox => wgpu::PresentMode::Mailbox,
            PresentModeSetting::AutoVsync => wgpu::PresentMode::AutoVsync,
            PresentModeSetting::AutoNoVsync => wgpu::PresentMode::AutoNoVsync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RasterSettings {
        RasterSettings {
            render_list_capacity: 0,
            shadow_atlas_size: 1000,
            shadow_atlas_quadrant_subdivisions: [1, 4, 16, 4096],
            directional_shadow_size: 0,
            shadow_reallocation_tolerance_ms: 0,
            max_lights_per_object: 0,
            use_rgba_shadows: false,
            use_depth_prepass: true,
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            present_mode: PresentModeSetting::Immediate,
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();
        let defaults = RasterSettings::default();

        assert_eq!(validated.render_list_capacity, defaults.render_list_capacity);
        assert_eq!(
            validated.shadow_atlas_size, defaults.shadow_atlas_size,
            "non power of two atlas sizes are rejected"
        );
        assert_eq!(validated.shadow_atlas_quadrant_subdivisions, [1, 4, 16, 1024]);
        assert_eq!(
            validated.directional_shadow_size,
            defaults.directional_shadow_size
        );
        assert_eq!(validated.max_lights_per_object, 1);
        assert_eq!(validated.resolution.width, Resolution::default().width);
    }

    #[test]
    fn partial_json_fills_missing_fields_with_defaults() {
        let json = r#"{ "shadow_atlas_size": 2048, "use_depth_prepass": true }"#;
        let settings: RasterSettings = serde_json::from_str(json).expect("valid json");

        assert_eq!(settings.shadow_atlas_size, 2048);
        assert!(settings.use_depth_prepass);
        assert_eq!(settings.render_list_capacity, 65536);
        assert_eq!(settings.shadow_reallocation_tolerance_ms, 500);
        assert_eq!(settings.shadow_atlas_quadrant_subdivisions, [1, 4, 16, 64]);
        assert!(settings.use_rgba_shadows);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = RasterSettings::load_from_path("definitely/not/here/settings.json");
        assert_eq!(settings.render_list_capacity, 65536);
    }

    #[test]
    fn present_mode_falls_back_to_fifo_when_desired_missing() {
        let settings = RasterSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RasterSettings::default()
        };

        let available = [wgpu::PresentMode::Fifo, wgpu::PresentMode::Immediate];

        assert_eq!(settings.present_mode(&available), wgpu::PresentMode::Fifo);
    }

    #[test]
    fn present_mode_uses_first_available_when_fifo_missing() {
        let settings = RasterSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RasterSettings::default()
        };

        let available = [wgpu::PresentMode::Immediate];

        assert_eq!(
            settings.present_mode(&available),
            wgpu::PresentMode::Immediate
        );
    }
}
