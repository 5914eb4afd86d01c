use std::collections::HashMap;

use glam::{Vec3, Vec4};
use scene_raster::gpu::{BufferKind, HeadlessContext, UniformValue};
use scene_raster::renderer::render_list::BatchSortKey;
use scene_raster::renderer::state_cache::UniformCache;
use scene_raster::renderer::storage::{LightKind, RenderTargetHandle, ShaderDesc};
use scene_raster::renderer::{
    LightInstanceHandle, RenderElement, RenderList, SceneRasterizer, ShaderFeatures,
    ShaderVariantCache, ShadowAtlasHandle,
};
use scene_raster::scene::CameraSetup;
use scene_raster::settings::RasterSettings;
use scene_raster::time::ManualTicks;

struct AtlasFixture {
    ctx: HeadlessContext,
    raster: SceneRasterizer,
    clock: ManualTicks,
    atlas: ShadowAtlasHandle,
    target: RenderTargetHandle,
}

impl AtlasFixture {
    fn new(size: u32, subdivisions: [u32; 4]) -> Self {
        let clock = ManualTicks::new(1_000);
        let mut ctx = HeadlessContext::new(64, 64);
        let mut raster = SceneRasterizer::new(RasterSettings::default(), Box::new(clock.clone()));
        raster.initialize(&mut ctx).expect("rasterizer initializes");
        let atlas = raster.shadow_atlas_create();
        raster.shadow_atlas_set_size(&mut ctx, atlas, size);
        for (quadrant, count) in subdivisions.into_iter().enumerate() {
            raster.shadow_atlas_set_quadrant_subdivision(atlas, quadrant, count);
        }
        let target = raster.storage_mut().render_target_create(16, 16);
        Self {
            ctx,
            raster,
            clock,
            atlas,
            target,
        }
    }

    /// Renders an empty frame so lights not drawn in it become evictable.
    fn next_frame(&mut self) {
        self.raster.render_scene(
            &mut self.ctx,
            &CameraSetup::default(),
            &[],
            &[],
            None,
            None,
            self.target,
        );
        self.raster.end_frame();
    }

    fn light(&mut self) -> LightInstanceHandle {
        let light = self.raster.storage_mut().light_create(LightKind::Omni);
        self.raster
            .light_instance_create(light)
            .expect("light resource exists")
    }

    fn owners(&self) -> usize {
        self.raster
            .lights()
            .shadow_atlas(self.atlas)
            .expect("atlas exists")
            .owner_count()
    }

    fn occupied(&self) -> usize {
        self.raster
            .lights()
            .shadow_atlas(self.atlas)
            .expect("atlas exists")
            .occupied_slots()
    }
}

#[test]
fn repeated_request_with_same_version_needs_no_redraw() {
    let mut fixture = AtlasFixture::new(1024, [16, 0, 0, 0]);
    let light = fixture.light();

    assert!(fixture.raster.shadow_atlas_update_light(fixture.atlas, light, 0.5, 7));
    let atlas = fixture.raster.lights().shadow_atlas(fixture.atlas).expect("atlas exists");
    assert_eq!(atlas.quadrants[0].slots.len(), 16);
    assert_eq!(atlas.slot_of(light).map(|key| key.quadrant()), Some(0));

    assert!(!fixture.raster.shadow_atlas_update_light(fixture.atlas, light, 0.5, 7));
    assert!(fixture.raster.shadow_atlas_update_light(fixture.atlas, light, 0.5, 8));
}

#[test]
fn one_slot_per_light_and_owner_map_matches_slots() {
    let mut fixture = AtlasFixture::new(2048, [1, 4, 16, 64]);
    let lights: Vec<_> = (0..12).map(|_| fixture.light()).collect();

    for round in 0..4u64 {
        for (index, &light) in lights.iter().enumerate() {
            let coverage = 0.05 + (index as f32 * 0.37 + round as f32 * 0.21) % 0.95;
            fixture
                .raster
                .shadow_atlas_update_light(fixture.atlas, light, coverage, round + 1);
        }
        fixture.clock.advance(600);
        fixture.next_frame();
        assert_eq!(fixture.owners(), fixture.occupied(), "round {round}");
    }

    let atlas = fixture.raster.lights().shadow_atlas(fixture.atlas).expect("atlas exists");
    for &light in &lights {
        let owned = atlas
            .quadrants
            .iter()
            .flat_map(|quadrant| quadrant.slots.iter())
            .filter(|slot| slot.owner == Some(light))
            .count();
        assert!(owned <= 1);
    }
}

#[test]
fn young_slots_are_never_stolen() {
    let mut fixture = AtlasFixture::new(1024, [1, 0, 0, 0]);
    let first = fixture.light();
    let second = fixture.light();

    assert!(fixture.raster.shadow_atlas_update_light(fixture.atlas, first, 1.0, 1));
    fixture.next_frame();
    for _ in 0..4 {
        fixture.clock.advance(100);
        assert!(!fixture.raster.shadow_atlas_update_light(fixture.atlas, second, 1.0, 1));
    }
    fixture.clock.advance(100);
    assert!(fixture.raster.shadow_atlas_update_light(fixture.atlas, second, 1.0, 1));
    assert_eq!(fixture.owners(), 1);
}

#[test]
fn resubdivision_yields_square_grid_of_free_slots() {
    let mut fixture = AtlasFixture::new(1024, [4, 16, 0, 0]);
    let light = fixture.light();
    fixture.raster.shadow_atlas_update_light(fixture.atlas, light, 0.1, 1);

    for (count, expected) in [(2, 1), (8, 4), (9, 16), (16, 16), (40, 64)] {
        fixture
            .raster
            .shadow_atlas_set_quadrant_subdivision(fixture.atlas, 1, count);
        let atlas = fixture.raster.lights().shadow_atlas(fixture.atlas).expect("atlas exists");
        assert_eq!(atlas.quadrants[1].slots.len(), expected, "count {count}");
        assert!(atlas.quadrants[1].slots.iter().all(|slot| slot.owner.is_none()));
        assert_eq!(
            atlas.smallest_subdivision,
            atlas.quadrants[0].subdivision.min(atlas.quadrants[1].subdivision)
        );
    }
}

#[test]
fn shared_capacity_rejects_the_fifth_element() {
    let mut list = RenderList::new(4);
    for _ in 0..3 {
        assert!(list.add_element(RenderElement::default()).is_some());
    }
    assert!(list.add_alpha_element(RenderElement::default()).is_some());
    assert!(list.add_alpha_element(RenderElement::default()).is_none());
    assert!(list.add_element(RenderElement::default()).is_none());

    assert_eq!(list.element_count(), 3);
    assert_eq!(list.alpha_element_count(), 1);
    assert_eq!(list.dropped(), 2);
}

#[test]
fn equal_depth_keys_sort_by_geometry() {
    let mut list = RenderList::new(8);
    for geometry in [2, 1] {
        list.add_element(RenderElement {
            batch_key: BatchSortKey {
                geometry,
                ..BatchSortKey::default()
            },
            ..RenderElement::default()
        });
    }
    list.sort_by_key(false);

    let order: Vec<u32> = list.opaque().iter().map(|e| e.batch_key.geometry).collect();
    assert_eq!(order, vec![1, 2]);
}

#[test]
fn malformed_fragment_yields_no_variant() {
    let mut ctx = HeadlessContext::new(8, 8);
    let mut raster = SceneRasterizer::new(RasterSettings::default(), Box::new(ManualTicks::new(0)));
    let storage = raster.storage_mut();
    let shader = storage.shader_create(ShaderDesc {
        fragment_code: "albedo = vec3(1.0 +;\n}}".to_string(),
        ..ShaderDesc::default()
    });
    let material = storage.material_create(shader, HashMap::new());

    let mut variants = ShaderVariantCache::new();
    let program = variants.get_shader_variant(&mut ctx, raster.storage(), material, ShaderFeatures::BASE_PASS);
    assert!(program.is_none());
}

#[test]
fn uniform_cache_dirties_on_first_set_only() {
    let mut cache = UniformCache::new();
    assert!(cache.set("light_color", Vec3::new(1.0, 0.5, 0.25)));
    assert!(!cache.set("light_color", Vec3::new(1.0, 0.5, 0.25)));
    assert!(
        !cache.set("light_color", Vec3::new(1.0, 0.5, 0.25 + 1e-9)),
        "changes under the epsilon are ignored"
    );
    assert!(cache.is_dirty("light_color"));
    assert!(
        !cache.set("light_color", Vec3::new(1.0, 0.5, 0.3)),
        "an entry waiting for upload is already dirty"
    );
    assert_eq!(
        cache.get("light_color"),
        Some(UniformValue::Vec3(Vec3::new(1.0, 0.5, 0.3)))
    );

    cache.set("albedo", Vec4::ONE);
    assert_eq!(cache.get("albedo"), Some(UniformValue::Vec4(Vec4::ONE)));
}

#[test]
fn released_buffers_come_back_after_the_frame() {
    let mut fixture = AtlasFixture::new(1024, [1, 0, 0, 0]);
    let storage = fixture.raster.storage_mut();
    let buffer = storage
        .buffer_create(&mut fixture.ctx, BufferKind::Vertex, 1000)
        .expect("buffer allocates");
    assert_eq!(buffer.size, 1024);
    storage.buffer_release(buffer);

    fixture.raster.end_frame();
    let reused = fixture
        .raster
        .storage_mut()
        .buffer_create(&mut fixture.ctx, BufferKind::Vertex, 700)
        .expect("buffer allocates");
    assert_eq!(reused.id, buffer.id);
}
