// src/renderer/shadows.rs
//! Shadow passes: directional split maps, spot perspective maps and omni
//! dual-paraboloid maps rendered into atlas slots.

use glam::{Mat4, Quat, Vec3, Vec4};

use super::light_instance::{LightInstanceHandle, ShadowAtlasHandle, ShadowTransform};
use super::render_list::{key_index, BatchSortKey, ElementGeometry, RenderElement};
use super::scene_raster::{
    distance_to_camera, PassKind, SceneRasterizer, ShadowBinding, DIRECTIONAL_SHADOW_UNIT,
    SHADOW_ATLAS_UNIT,
};
use super::shadow_atlas::AtlasTargets;
use super::storage::{Aabb, LightKind};
use crate::gpu::{GpuContext, Viewport};
use crate::scene::{CameraSetup, InstanceGeometry, VisibleInstance};

const SPOT_NEAR: f32 = 0.05;

/// Maps light clip space onto a pixel rectangle of a `size`-wide texture,
/// in texture coordinates with y pointing down.
pub fn atlas_uv_bias(rect: Viewport, size: f32) -> Mat4 {
    let half_w = rect.width as f32 * 0.5;
    let half_h = rect.height as f32 * 0.5;
    Mat4::from_cols(
        Vec4::new(half_w / size, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -half_h / size, 0.0, 0.0),
        Vec4::Z,
        Vec4::new(
            (rect.x as f32 + half_w) / size,
            (rect.y as f32 + half_h) / size,
            0.0,
            1.0,
        ),
    )
}

/// Cell of the directional shadow texture owned by light `index` out of
/// `count` shadowed directional lights.
pub fn directional_cell(size: u32, index: usize, count: usize) -> Viewport {
    let grid = (count.max(1) as f32).sqrt().ceil() as u32;
    let cell = size / grid.max(1);
    let index = index as u32;
    Viewport::new((index % grid) * cell, (index / grid) * cell, cell, cell)
}

/// Sub-rectangle of a directional cell used by one split. Two and four
/// splits both lay out as a 2x2 grid.
pub fn split_rect(cell: Viewport, splits: usize, pass: usize) -> Viewport {
    if splits <= 1 {
        return cell;
    }
    let half_w = cell.width / 2;
    let half_h = cell.height / 2;
    let pass = pass as u32;
    Viewport::new(
        cell.x + (pass % 2) * half_w,
        cell.y + (pass / 2) * half_h,
        half_w,
        half_h,
    )
}

/// Far distances of each split, in view depth.
pub fn split_distances(fractions: [f32; 3], splits: usize, max_distance: f32) -> Vec<f32> {
    let fractions: &[f32] = match splits {
        0 | 1 => &[1.0],
        2 => &[fractions[0], 1.0],
        _ => &[fractions[0], fractions[1], fractions[2], 1.0],
    };
    fractions.iter().map(|f| f.clamp(0.0, 1.0) * max_distance).collect()
}

/// Bounding sphere of the camera frustum between two view depths.
pub fn frustum_slice_sphere(camera: &CameraSetup, near: f32, far: f32) -> (Vec3, f32) {
    let projection = camera.projection;
    let mut corners = Vec::with_capacity(8);
    for depth in [near, far] {
        let (half_w, half_h) = if camera.orthographic {
            (1.0 / projection.x_axis.x, 1.0 / projection.y_axis.y)
        } else {
            (depth / projection.x_axis.x, depth / projection.y_axis.y)
        };
        for (sx, sy) in [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)] {
            let local = Vec3::new(sx * half_w, sy * half_h, -depth);
            corners.push(camera.transform.transform_point3(local));
        }
    }
    let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
    let radius = corners
        .iter()
        .map(|corner| corner.distance(center))
        .fold(0.0_f32, f32::max);
    (center, radius)
}

/// Fraction of the screen a local light's shadow is expected to cover.
pub fn local_light_coverage(camera: &CameraSetup, position: Vec3, range: f32) -> f32 {
    let distance = distance_to_camera(camera, position);
    if distance <= range {
        1.0
    } else {
        range / distance
    }
}

fn aabb_distance(aabb: &Aabb, point: Vec3) -> f32 {
    point.clamp(aabb.min, aabb.max).distance(point)
}

/// How casters are sorted and culled for one shadow view.
#[derive(Debug, Clone, Copy)]
struct CasterQuery {
    view: Mat4,
    reach: Option<(Vec3, f32)>,
    radial: bool,
}

impl SceneRasterizer {
    pub(crate) fn render_shadow_passes(
        &mut self,
        ctx: &mut dyn GpuContext,
        instances: &[VisibleInstance],
        visible_lights: &[LightInstanceHandle],
        atlas: Option<ShadowAtlasHandle>,
    ) {
        let mut directional = Vec::new();
        let mut local = Vec::new();
        for &light in visible_lights {
            let Some(instance) = self.lights.light_instance(light) else {
                continue;
            };
            let Some(resource) = self.storage.light(instance.light) else {
                continue;
            };
            if !resource.casts_shadow() {
                continue;
            }
            match instance.kind {
                LightKind::Directional => directional.push(light),
                LightKind::Omni | LightKind::Spot => local.push(light),
            }
        }

        let size = self.settings.directional_shadow_size;
        for (index, &light) in directional.iter().enumerate() {
            let cell = directional_cell(size, index, directional.len());
            self.lights.light_instance_set_directional_rect(light, Some(cell));
            let splits = self.setup_directional_shadow(light);
            for pass in 0..splits {
                self.render_shadow(ctx, light, None, pass, instances);
            }
            if let Some(binding) = self.directional_binding(light) {
                self.frame.shadows.insert(light, binding);
            }
        }

        if local.is_empty() {
            return;
        }
        let Some(atlas) = atlas else {
            log::debug!("{} shadowed local lights but no shadow atlas", local.len());
            return;
        };
        for light in local {
            self.render_local_shadow(ctx, light, atlas, instances);
        }
    }

    fn render_local_shadow(
        &mut self,
        ctx: &mut dyn GpuContext,
        light: LightInstanceHandle,
        atlas: ShadowAtlasHandle,
        instances: &[VisibleInstance],
    ) {
        let Some(instance) = self.lights.light_instance(light) else {
            return;
        };
        let Some(resource) = self.storage.light(instance.light) else {
            return;
        };
        let kind = instance.kind;
        let transform = instance.transform;
        let range = resource.range;
        let spot_angle = resource.spot_angle;
        let coverage = local_light_coverage(&self.frame.camera, instance.position(), range);
        let version = resource.version + instance.version;

        let redraw = self.lights.shadow_atlas_update_light(atlas, light, coverage, version);
        let slot = self
            .lights
            .shadow_atlas(atlas)
            .and_then(|shadow_atlas| shadow_atlas.slot_of(light));
        if slot.is_none() {
            log::debug!("No shadow atlas slot for light, drawing it unshadowed");
            return;
        }

        let camera = match kind {
            LightKind::Spot => Mat4::perspective_rh(
                (spot_angle * 2.0).clamp(1.0, 179.0).to_radians(),
                1.0,
                SPOT_NEAR,
                range.max(SPOT_NEAR * 2.0),
            ),
            _ => Mat4::IDENTITY,
        };
        self.lights
            .light_instance_set_shadow_transform(light, camera, transform, range, 0.0, 0, 1.0);

        if redraw {
            let faces = if kind == LightKind::Omni { 2 } else { 1 };
            for face in 0..faces {
                self.render_shadow(ctx, light, Some(atlas), face, instances);
            }
        }
        if let Some(binding) = self.local_binding(light, atlas) {
            self.frame.shadows.insert(light, binding);
        }
    }

    /// Fits one orthographic shadow camera around each split of the view
    /// frustum. Returns the number of splits.
    fn setup_directional_shadow(&mut self, light: LightInstanceHandle) -> usize {
        let Some(instance) = self.lights.light_instance(light) else {
            return 0;
        };
        let Some(resource) = self.storage.light(instance.light) else {
            return 0;
        };
        let Some(cell) = instance.directional_rect else {
            return 0;
        };
        let camera = self.frame.camera;
        let splits = resource.directional_shadow_mode.split_count();
        let max_distance = resource
            .shadow_max_distance
            .min(camera.z_far)
            .max(camera.z_near + 0.01);
        let (_, rotation, _) = instance.transform.to_scale_rotation_translation();
        let direction = instance.light_direction.try_normalize().unwrap_or(Vec3::NEG_Z);
        let fractions = resource.directional_splits;
        let reach = resource.shadow_max_distance;

        let mut near = camera.z_near;
        for (pass, far) in split_distances(fractions, splits, max_distance).into_iter().enumerate() {
            let far = far.max(near + 0.001);
            let (center, radius) = frustum_slice_sphere(&camera, near, far);
            let rect = split_rect(cell, splits, pass);
            let center = snap_to_texel(center, rotation, radius, rect.width);

            let pullback = radius + reach;
            let eye = center - direction * pullback;
            let transform = Mat4::from_rotation_translation(rotation, eye);
            let farplane = pullback + radius;
            let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, farplane);
            self.lights
                .light_instance_set_shadow_transform(light, projection, transform, farplane, far, pass, 1.0);
            near = far;
        }
        splits
    }

    fn directional_binding(&self, light: LightInstanceHandle) -> Option<ShadowBinding> {
        let instance = self.lights.light_instance(light)?;
        let resource = self.storage.light(instance.light)?;
        let targets = self.directional_shadow?;
        let cell = instance.directional_rect?;
        let splits = resource.directional_shadow_mode.split_count();
        let size = self.settings.directional_shadow_size as f32;

        let mut matrices = [Mat4::IDENTITY; 4];
        let mut offsets = [0.0; 4];
        for pass in 0..splits {
            let shadow = instance.shadow_transforms[pass];
            matrices[pass] = atlas_uv_bias(split_rect(cell, splits, pass), size)
                * shadow.camera
                * shadow.transform.inverse();
            offsets[pass] = shadow.split;
        }
        Some(ShadowBinding {
            texture: targets.color,
            unit: DIRECTIONAL_SHADOW_UNIT,
            matrices,
            splits,
            split_offsets: Vec4::from_array(offsets),
            atlas_rect: Vec4::ZERO,
            pixel_size: Vec4::new(1.0 / size, 1.0 / size, 0.0, 0.0),
        })
    }

    fn local_binding(&self, light: LightInstanceHandle, atlas: ShadowAtlasHandle) -> Option<ShadowBinding> {
        let instance = self.lights.light_instance(light)?;
        let shadow_atlas = self.lights.shadow_atlas(atlas)?;
        let targets = shadow_atlas.targets()?;
        let rect = shadow_atlas.slot_rect(shadow_atlas.slot_of(light)?)?;
        let size = shadow_atlas.size as f32;
        let shadow = instance.shadow_transforms[0];

        let (matrix, atlas_rect) = match instance.kind {
            LightKind::Omni => (
                shadow.transform.inverse(),
                Vec4::new(rect.x as f32, rect.y as f32, rect.width as f32, rect.height as f32) / size,
            ),
            _ => (
                atlas_uv_bias(rect, size) * shadow.camera * shadow.transform.inverse(),
                Vec4::ZERO,
            ),
        };
        Some(ShadowBinding {
            texture: targets.color,
            unit: SHADOW_ATLAS_UNIT,
            matrices: [matrix; 4],
            splits: 1,
            split_offsets: Vec4::ZERO,
            atlas_rect,
            pixel_size: Vec4::new(1.0 / size, 1.0 / size, 0.0, 0.0),
        })
    }

    /// Renders one split (directional) or face (omni) of a light's shadow
    /// using the shadow transform stored on the light instance. Local
    /// lights need a slot in `atlas` already. Returns whether anything was
    /// rendered.
    pub fn render_shadow(
        &mut self,
        ctx: &mut dyn GpuContext,
        light: LightInstanceHandle,
        atlas: Option<ShadowAtlasHandle>,
        pass: usize,
        instances: &[VisibleInstance],
    ) -> bool {
        let Some(instance) = self.lights.light_instance(light) else {
            return false;
        };
        let Some(resource) = self.storage.light(instance.light) else {
            return false;
        };
        let kind = instance.kind;
        let cell = instance.directional_rect;
        let range = resource.range;
        let splits = resource.directional_shadow_mode.split_count();
        let shadow = match kind {
            LightKind::Directional => instance.shadow_transforms[pass.min(3)],
            _ => instance.shadow_transforms[0],
        };

        let (targets, viewport, side) = match kind {
            LightKind::Directional => {
                let (Some(targets), Some(cell)) = (self.directional_shadow, cell) else {
                    return false;
                };
                if pass >= splits {
                    return false;
                }
                (targets, split_rect(cell, splits, pass), None)
            }
            LightKind::Omni | LightKind::Spot => {
                let faces = if kind == LightKind::Omni { 2 } else { 1 };
                if pass >= faces {
                    return false;
                }
                let Some((targets, rect)) = atlas.and_then(|atlas| self.atlas_slot_targets(ctx, atlas, light)) else {
                    return false;
                };
                if kind == LightKind::Omni {
                    let half = rect.height / 2;
                    let side = if pass == 0 { 1.0 } else { -1.0 };
                    let face = Viewport::new(rect.x, rect.y + pass as u32 * half, rect.width, half);
                    (targets, face, Some(side))
                } else {
                    (targets, rect, None)
                }
            }
        };

        let position = shadow.transform.w_axis.truncate();
        let query = CasterQuery {
            view: shadow.transform.inverse(),
            reach: (kind != LightKind::Directional).then_some((position, range)),
            radial: kind == LightKind::Omni,
        };
        self.fill_shadow_list(instances, query);

        ctx.bind_framebuffer(Some(targets.framebuffer));
        ctx.set_viewport(viewport);
        self.begin_pass();
        self.clear_viewport(ctx, Vec4::ONE, 1.0);
        self.draw_shadow_list(ctx, instances, &shadow, side);

        self.lights.light_instance_mark_shadow_pass(light);
        self.stats.shadow_passes += 1;
        self.stats.dropped_elements += self.shadow_list.dropped();
        true
    }

    fn atlas_slot_targets(
        &mut self,
        ctx: &mut dyn GpuContext,
        atlas: ShadowAtlasHandle,
        light: LightInstanceHandle,
    ) -> Option<(AtlasTargets, Viewport)> {
        let rgba = self.settings.use_rgba_shadows;
        let shadow_atlas = self.lights.shadow_atlas_mut(atlas)?;
        let rect = shadow_atlas.slot_rect(shadow_atlas.slot_of(light)?)?;
        match shadow_atlas.ensure_targets(ctx, rgba) {
            Ok(targets) => Some((targets, rect)),
            Err(err) => {
                log::error!("Shadow atlas storage unavailable: {}", err);
                None
            }
        }
    }

    fn fill_shadow_list(&mut self, instances: &[VisibleInstance], query: CasterQuery) {
        self.shadow_list.clear();

        'instances: for (index, instance) in instances.iter().enumerate() {
            if !instance.casts_shadows() {
                continue;
            }
            let Some(mesh) = instance.mesh_handle(&self.storage) else {
                continue;
            };
            let aabb = instance.world_aabb(&self.storage);
            if let (Some((origin, range)), Some(aabb)) = (query.reach, aabb.as_ref()) {
                if aabb_distance(aabb, origin) > range {
                    continue;
                }
            }
            let center = aabb.map_or(instance.transform.w_axis.truncate(), |aabb| aabb.center());
            let local = query.view.transform_point3(center);
            let depth = if query.radial { local.length() } else { -local.z };

            let multimesh = match instance.geometry {
                InstanceGeometry::MultiMesh(handle) => Some(handle),
                InstanceGeometry::Mesh(_) => None,
            };
            let surface_count = self.storage.mesh(mesh).map_or(0, |mesh| mesh.surfaces.len());
            for surface in 0..surface_count {
                let Some(material) = self.resolve_material(instance, mesh, surface) else {
                    continue;
                };
                if !self
                    .storage
                    .material(material)
                    .is_some_and(|material| material.can_cast_shadow())
                {
                    continue;
                }
                let element = RenderElement {
                    instance: index,
                    geometry: ElementGeometry {
                        mesh,
                        surface,
                        multimesh,
                    },
                    material,
                    skeleton: instance.skeleton,
                    front_facing: !instance.mirror,
                    depth,
                    batch_key: BatchSortKey {
                        geometry: (key_index(mesh) << 4) | (surface as u32 & 0xf),
                        material: key_index(material),
                        ..BatchSortKey::default()
                    },
                    ..RenderElement::default()
                };
                if self.shadow_list.add_element(element).is_none() {
                    break 'instances;
                }
            }
        }
        self.shadow_list.sort_by_depth(false);
    }

    fn draw_shadow_list(
        &mut self,
        ctx: &mut dyn GpuContext,
        instances: &[VisibleInstance],
        shadow: &ShadowTransform,
        side: Option<f32>,
    ) {
        self.set_camera_uniforms(shadow.camera, shadow.transform, 0.0, shadow.farplane);
        if let Some(side) = side {
            self.uniforms
                .set("dual_paraboloid", Vec4::new(side, shadow.farplane.max(0.001), 0.0, 0.0));
        }
        let pass = PassKind::Shadow {
            dual_paraboloid: side.is_some(),
        };
        let mut bound = None;
        for i in 0..self.shadow_list.element_count() {
            let element = self.shadow_list.opaque()[i];
            self.draw_element(ctx, instances, element, pass, false, &mut bound);
        }
    }
}

/// Moves a shadow camera center onto the texel grid of its shadow map, so
/// the map does not shimmer as the view moves.
fn snap_to_texel(center: Vec3, rotation: Quat, radius: f32, texels: u32) -> Vec3 {
    if texels == 0 || radius <= 0.0 {
        return center;
    }
    let texel = 2.0 * radius / texels as f32;
    let local = rotation.inverse() * center;
    let snapped = Vec3::new(
        (local.x / texel).floor() * texel,
        (local.y / texel).floor() * texel,
        local.z,
    );
    rotation * snapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uv_bias_maps_clip_corners_onto_the_rect() {
        let rect = Viewport::new(256, 0, 256, 256);
        let bias = atlas_uv_bias(rect, 1024.0);

        let top_left = bias * Vec4::new(-1.0, 1.0, 0.5, 1.0);
        let bottom_right = bias * Vec4::new(1.0, -1.0, 0.5, 1.0);
        assert!((top_left.x - 0.25).abs() < 1e-6);
        assert!(top_left.y.abs() < 1e-6);
        assert!((bottom_right.x - 0.5).abs() < 1e-6);
        assert!((bottom_right.y - 0.25).abs() < 1e-6);
        assert_eq!(top_left.z, 0.5);
    }

    #[test]
    fn directional_cells_tile_a_square_grid() {
        assert_eq!(directional_cell(1024, 0, 1), Viewport::new(0, 0, 1024, 1024));
        assert_eq!(directional_cell(1024, 1, 2), Viewport::new(512, 0, 512, 512));
        assert_eq!(directional_cell(1024, 4, 5), Viewport::new(341, 341, 341, 341));
    }

    #[test]
    fn splits_use_quarters_of_the_cell() {
        let cell = Viewport::new(0, 0, 512, 512);
        assert_eq!(split_rect(cell, 1, 0), cell);
        assert_eq!(split_rect(cell, 2, 1), Viewport::new(256, 0, 256, 256));
        assert_eq!(split_rect(cell, 4, 3), Viewport::new(256, 256, 256, 256));
    }

    #[test]
    fn split_distances_end_at_max_distance() {
        let fractions = [0.1, 0.2, 0.5];
        assert_eq!(split_distances(fractions, 1, 100.0), vec![100.0]);
        assert_eq!(split_distances(fractions, 2, 100.0), vec![10.0, 100.0]);
        assert_eq!(split_distances(fractions, 4, 100.0), vec![10.0, 20.0, 50.0, 100.0]);
    }

    #[test]
    fn slice_sphere_contains_both_planes() {
        let camera = CameraSetup::default();
        let (center, radius) = frustum_slice_sphere(&camera, 1.0, 10.0);
        let near_point = camera.transform.transform_point3(Vec3::new(0.0, 0.0, -1.0));
        let far_point = camera.transform.transform_point3(Vec3::new(0.0, 0.0, -10.0));
        assert!(center.distance(near_point) <= radius);
        assert!(center.distance(far_point) <= radius);
    }

    #[test]
    fn coverage_is_full_inside_the_light_range() {
        let camera = CameraSetup::default();
        let eye = camera.position();
        assert_eq!(local_light_coverage(&camera, eye + Vec3::X, 5.0), 1.0);
        let far = local_light_coverage(&camera, eye + Vec3::X * 20.0, 5.0);
        assert!((far - 0.25).abs() < 1e-6);
    }
}
