use glam::{Mat4, Vec3};

/// Camera placement and projection for one rendered view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraSetup {
    /// Camera-to-world transform.
    pub transform: Mat4,
    pub projection: Mat4,
    pub orthographic: bool,
    pub z_near: f32,
    pub z_far: f32,
}

impl CameraSetup {
    pub fn perspective(transform: Mat4, fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            transform,
            projection: Mat4::perspective_rh(fov_y_radians, aspect, near, far),
            orthographic: false,
            z_near: near,
            z_far: far,
        }
    }

    /// `size` is the full height of the view volume.
    pub fn orthographic(transform: Mat4, size: f32, aspect: f32, near: f32, far: f32) -> Self {
        let half_h = size * 0.5;
        let half_w = half_h * aspect;
        Self {
            transform,
            projection: Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far),
            orthographic: true,
            z_near: near,
            z_far: far,
        }
    }

    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, up);
        Self::perspective(view.inverse(), fov_y_radians, aspect, near, far)
    }

    /// World-to-camera transform.
    pub fn view(&self) -> Mat4 {
        self.transform.inverse()
    }

    pub fn view_proj(&self) -> Mat4 {
        self.projection * self.view()
    }

    pub fn position(&self) -> Vec3 {
        self.transform.w_axis.truncate()
    }

    pub fn forward(&self) -> Vec3 {
        self.transform.transform_vector3(Vec3::NEG_Z).normalize_or_zero()
    }

    /// Distance along the view direction, used as the sort depth.
    pub fn depth_of(&self, point: Vec3) -> f32 {
        (point - self.position()).dot(self.forward())
    }
}

impl Default for CameraSetup {
    fn default() -> Self {
        Self::look_at(
            Vec3::new(0.0, 0.0, 3.0),
            Vec3::ZERO,
            Vec3::Y,
            60f32.to_radians(),
            16.0 / 9.0,
            0.1,
            100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_places_target_in_front() {
        let camera = CameraSetup::default();
        assert!(camera.position().abs_diff_eq(Vec3::new(0.0, 0.0, 3.0), 1e-5));
        assert!((camera.depth_of(Vec3::ZERO) - 3.0).abs() < 1e-5);

        let clip = camera.view_proj() * Vec3::ZERO.extend(1.0);
        let ndc_z = clip.z / clip.w;
        assert!((0.0..=1.0).contains(&ndc_z), "depth range is zero to one, got {ndc_z}");
    }
}
