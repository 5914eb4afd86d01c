// src/renderer/shadow_atlas.rs
//! Quadrant-subdivided shadow map atlas.
//!
//! The atlas texture is split into four quadrants. Each quadrant holds an
//! N×N grid of equally sized slots. Lights ask for a slot sized after their
//! on-screen coverage; a slot that was assigned recently is never taken away
//! before the reallocation tolerance has elapsed.

use std::collections::HashMap;

use slotmap::SlotMap;

use super::light_instance::{LightInstance, LightInstanceHandle, ShadowAtlasHandle};
use crate::error::RasterResult;
use crate::gpu::{
    FramebufferDesc, FramebufferId, GpuContext, TextureDesc, TextureFilter, TextureFormat,
    TextureId, Viewport,
};

const QUADRANT_SHIFT: u32 = 30;
const SHADOW_INDEX_MASK: u32 = (1 << QUADRANT_SHIFT) - 1;

/// Location of a slot: quadrant in the top two bits, slot index below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowKey(u32);

impl ShadowKey {
    pub fn new(quadrant: usize, slot: usize) -> Self {
        Self(((quadrant as u32 & 0x3) << QUADRANT_SHIFT) | (slot as u32 & SHADOW_INDEX_MASK))
    }

    pub fn quadrant(self) -> usize {
        ((self.0 >> QUADRANT_SHIFT) & 0x3) as usize
    }

    pub fn slot(self) -> usize {
        (self.0 & SHADOW_INDEX_MASK) as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowSlot {
    pub owner: Option<LightInstanceHandle>,
    pub version: u64,
    pub alloc_tick: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Quadrant {
    /// Grid side length; zero disables the quadrant.
    pub subdivision: u32,
    pub slots: Vec<ShadowSlot>,
}

#[derive(Debug, Clone, Copy)]
pub struct AtlasTargets {
    pub color: TextureId,
    pub depth: TextureId,
    pub framebuffer: FramebufferId,
}

/// Inputs to one slot request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShadowRequest {
    pub coverage: f32,
    pub light_version: u64,
    pub now_ms: u64,
    pub scene_pass: u64,
    pub tolerance_ms: u64,
}

#[derive(Debug, Default)]
pub struct ShadowAtlas {
    pub size: u32,
    pub quadrants: [Quadrant; 4],
    /// Quadrant indices ordered by subdivision, finest first.
    pub size_order: [usize; 4],
    pub smallest_subdivision: u32,
    pub(crate) shadow_owners: HashMap<LightInstanceHandle, ShadowKey>,
    pub(crate) targets: Option<AtlasTargets>,
}

impl ShadowAtlas {
    pub fn new() -> Self {
        Self {
            size_order: [0, 1, 2, 3],
            ..Self::default()
        }
    }

    pub fn quadrant_size(&self) -> u32 {
        self.size >> 1
    }

    pub fn slot_of(&self, light: LightInstanceHandle) -> Option<ShadowKey> {
        self.shadow_owners.get(&light).copied()
    }

    pub fn owner_count(&self) -> usize {
        self.shadow_owners.len()
    }

    pub fn occupied_slots(&self) -> usize {
        self.quadrants
            .iter()
            .flat_map(|quadrant| quadrant.slots.iter())
            .filter(|slot| slot.owner.is_some())
            .count()
    }

    pub fn slot(&self, key: ShadowKey) -> Option<&ShadowSlot> {
        self.quadrants.get(key.quadrant())?.slots.get(key.slot())
    }

    /// Pixel rectangle of a slot inside the atlas texture.
    pub fn slot_rect(&self, key: ShadowKey) -> Option<Viewport> {
        let quadrant = self.quadrants.get(key.quadrant())?;
        if quadrant.subdivision == 0 || key.slot() >= quadrant.slots.len() {
            return None;
        }
        let quadrant_size = self.quadrant_size();
        let slot_size = quadrant_size / quadrant.subdivision;
        let q = key.quadrant() as u32;
        let s = key.slot() as u32;
        Some(Viewport::new(
            (q & 1) * quadrant_size + (s % quadrant.subdivision) * slot_size,
            (q >> 1) * quadrant_size + (s / quadrant.subdivision) * slot_size,
            slot_size,
            slot_size,
        ))
    }

    /// Drops every assignment and resizes the slot arrays, keeping the
    /// quadrant subdivisions. Returns the evicted owners.
    pub(crate) fn reset(&mut self, size: u32) -> Vec<LightInstanceHandle> {
        self.size = size;
        let owners: Vec<_> = self.shadow_owners.drain().map(|(owner, _)| owner).collect();
        for quadrant in &mut self.quadrants {
            let count = (quadrant.subdivision * quadrant.subdivision) as usize;
            quadrant.slots.clear();
            quadrant.slots.resize(count, ShadowSlot::default());
        }
        owners
    }

    /// Sets the grid of one quadrant from a requested shadow count. The grid
    /// side becomes `floor(sqrt(nearest_pow2(count)))`. Returns the owners
    /// evicted by the change.
    pub(crate) fn set_quadrant_subdivision(
        &mut self,
        quadrant: usize,
        count: u32,
    ) -> Vec<LightInstanceHandle> {
        let subdivision = if count == 0 {
            0
        } else {
            (count.next_power_of_two() as f64).sqrt().floor() as u32
        };
        if self.quadrants[quadrant].subdivision == subdivision {
            return Vec::new();
        }

        let evicted: Vec<_> = self.quadrants[quadrant]
            .slots
            .iter()
            .filter_map(|slot| slot.owner)
            .collect();
        for owner in &evicted {
            self.shadow_owners.remove(owner);
        }

        self.quadrants[quadrant] = Quadrant {
            subdivision,
            slots: vec![ShadowSlot::default(); (subdivision * subdivision) as usize],
        };
        self.smallest_subdivision = self
            .quadrants
            .iter()
            .map(|quadrant| quadrant.subdivision)
            .filter(|&subdivision| subdivision > 0)
            .min()
            .unwrap_or(0);
        self.sort_quadrants();

        log::debug!(
            "Shadow atlas quadrant {} subdivided {}x{}",
            quadrant,
            subdivision,
            subdivision
        );
        evicted
    }

    fn sort_quadrants(&mut self) {
        loop {
            let mut swaps = 0;
            for i in 0..3 {
                let a = self.quadrants[self.size_order[i]].subdivision;
                let b = self.quadrants[self.size_order[i + 1]].subdivision;
                if a < b {
                    self.size_order.swap(i, i + 1);
                    swaps += 1;
                }
            }
            if swaps == 0 {
                break;
            }
        }
    }

    pub(crate) fn release_owner(&mut self, light: LightInstanceHandle) {
        let Some(key) = self.shadow_owners.remove(&light) else {
            return;
        };
        if let Some(slot) = self.quadrants[key.quadrant()].slots.get_mut(key.slot()) {
            *slot = ShadowSlot::default();
        }
    }

    pub(crate) fn update_light(
        &mut self,
        atlas: ShadowAtlasHandle,
        light: LightInstanceHandle,
        lights: &mut SlotMap<LightInstanceHandle, LightInstance>,
        request: &ShadowRequest,
    ) -> bool {
        if self.size == 0 || self.smallest_subdivision == 0 {
            return false;
        }

        let quadrant_size = self.quadrant_size();
        let coverage_fit =
            ((quadrant_size as f32 * request.coverage.clamp(0.0, 1.0)) as u32).next_power_of_two();
        let desired_fit = (quadrant_size / self.smallest_subdivision).min(coverage_fit);

        let mut candidates = Vec::with_capacity(4);
        let mut best_size: Option<u32> = None;
        let mut best_subdivision = 0;
        for &q in &self.size_order {
            let subdivision = self.quadrants[q].subdivision;
            if subdivision == 0 {
                continue;
            }
            let max_fit = quadrant_size / subdivision;
            if best_size.is_some_and(|best| max_fit > best) {
                break;
            }
            candidates.push(q);
            best_subdivision = subdivision;
            if max_fit >= desired_fit {
                best_size = Some(max_fit);
            }
        }
        if candidates.is_empty() {
            return false;
        }

        if let Some(key) = self.shadow_owners.get(&light).copied() {
            let (q, s) = (key.quadrant(), key.slot());
            let current_subdivision = self.quadrants[q].subdivision;
            let slot = self.quadrants[q].slots[s];
            let should_realloc = current_subdivision != best_subdivision
                && request.now_ms.saturating_sub(slot.alloc_tick) > request.tolerance_ms;
            let should_redraw = slot.version != request.light_version;

            if should_realloc {
                if let Some((nq, ns)) =
                    self.find_slot(&candidates, Some(current_subdivision), lights, request)
                {
                    self.quadrants[q].slots[s] = ShadowSlot::default();
                    self.assign(atlas, light, nq, ns, lights, request);
                    return true;
                }
            }

            self.quadrants[q].slots[s].version = request.light_version;
            return should_redraw;
        }

        match self.find_slot(&candidates, None, lights, request) {
            Some((q, s)) => {
                self.assign(atlas, light, q, s, lights, request);
                true
            }
            None => {
                log::debug!("No shadow atlas slot free; light renders unshadowed this frame");
                false
            }
        }
    }

    /// Searches candidates coarse to fine for a free slot, else the least
    /// recently visible owner whose tolerance window has passed. Hitting the
    /// quadrant the light already lives in ends the search.
    fn find_slot(
        &self,
        candidates: &[usize],
        current_subdivision: Option<u32>,
        lights: &SlotMap<LightInstanceHandle, LightInstance>,
        request: &ShadowRequest,
    ) -> Option<(usize, usize)> {
        for &q in candidates.iter().rev() {
            let quadrant = &self.quadrants[q];
            if Some(quadrant.subdivision) == current_subdivision {
                return None;
            }

            let mut free = None;
            let mut least_recent: Option<(usize, u64)> = None;
            for (index, slot) in quadrant.slots.iter().enumerate() {
                let Some(owner) = slot.owner else {
                    free = Some(index);
                    break;
                };
                let Some(instance) = lights.get(owner) else {
                    free = Some(index);
                    break;
                };
                if instance.last_scene_pass == request.scene_pass {
                    continue;
                }
                if request.now_ms.saturating_sub(slot.alloc_tick) < request.tolerance_ms {
                    continue;
                }
                if least_recent.map_or(true, |(_, pass)| instance.last_scene_pass < pass) {
                    least_recent = Some((index, instance.last_scene_pass));
                }
            }

            if let Some(index) = free.or(least_recent.map(|(index, _)| index)) {
                return Some((q, index));
            }
        }
        None
    }

    fn assign(
        &mut self,
        atlas: ShadowAtlasHandle,
        light: LightInstanceHandle,
        quadrant: usize,
        index: usize,
        lights: &mut SlotMap<LightInstanceHandle, LightInstance>,
        request: &ShadowRequest,
    ) {
        let slot = &mut self.quadrants[quadrant].slots[index];
        if let Some(previous) = slot.owner.take() {
            self.shadow_owners.remove(&previous);
            if let Some(previous) = lights.get_mut(previous) {
                previous.shadow_atlases.remove(&atlas);
            }
        }
        *slot = ShadowSlot {
            owner: Some(light),
            version: request.light_version,
            alloc_tick: request.now_ms,
        };
        self.shadow_owners.insert(light, ShadowKey::new(quadrant, index));
        if let Some(instance) = lights.get_mut(light) {
            instance.shadow_atlases.insert(atlas);
        }
    }

    /// Creates the render targets on first use.
    pub(crate) fn ensure_targets(
        &mut self,
        ctx: &mut dyn GpuContext,
        rgba_depth: bool,
    ) -> RasterResult<AtlasTargets> {
        if let Some(targets) = self.targets {
            return Ok(targets);
        }
        let targets = create_shadow_targets(ctx, self.size, rgba_depth)?;
        self.targets = Some(targets);
        Ok(targets)
    }

    pub fn targets(&self) -> Option<AtlasTargets> {
        self.targets
    }

    pub(crate) fn release_gpu(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(targets) = self.targets.take() {
            release_shadow_targets(ctx, targets);
        }
    }
}

/// Color plus depth target for a shadow texture. Depth values are written
/// into the color attachment, packed into RGBA8 when `rgba_depth` is set.
pub(crate) fn create_shadow_targets(
    ctx: &mut dyn GpuContext,
    size: u32,
    rgba_depth: bool,
) -> RasterResult<AtlasTargets> {
    let color = ctx.create_texture(&TextureDesc {
        width: size,
        height: size,
        format: if rgba_depth {
            TextureFormat::Rgba8Unorm
        } else {
            TextureFormat::Rgba16Float
        },
        filter: TextureFilter::Nearest,
        render_target: true,
    })?;
    let depth = ctx.create_texture(&TextureDesc {
        width: size,
        height: size,
        format: TextureFormat::Depth32Float,
        filter: TextureFilter::Nearest,
        render_target: true,
    })?;
    let framebuffer = ctx.create_framebuffer(&FramebufferDesc {
        color: Some(color),
        depth: Some(depth),
    })?;
    Ok(AtlasTargets {
        color,
        depth,
        framebuffer,
    })
}

pub(crate) fn release_shadow_targets(ctx: &mut dyn GpuContext, targets: AtlasTargets) {
    ctx.delete_framebuffer(targets.framebuffer);
    ctx.delete_texture(targets.color);
    ctx.delete_texture(targets.depth);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;
    use crate::renderer::light_instance::LightRegistry;
    use crate::renderer::storage::{LightKind, RasterStorage};
    use crate::time::ManualTicks;

    struct Fixture {
        registry: LightRegistry,
        storage: RasterStorage,
        clock: ManualTicks,
        atlas: ShadowAtlasHandle,
    }

    impl Fixture {
        fn new(size: u32, subdivisions: [u32; 4]) -> Self {
            let clock = ManualTicks::new(0);
            let mut registry = LightRegistry::new(Box::new(clock.clone()), 500);
            let atlas = registry.shadow_atlas_create();
            let mut ctx = HeadlessContext::new(8, 8);
            registry.shadow_atlas_set_size(&mut ctx, atlas, size);
            for (quadrant, count) in subdivisions.into_iter().enumerate() {
                registry.shadow_atlas_set_quadrant_subdivision(atlas, quadrant, count);
            }
            Self {
                registry,
                storage: RasterStorage::new(),
                clock,
                atlas,
            }
        }

        fn light(&mut self) -> LightInstanceHandle {
            let light = self.storage.light_create(LightKind::Spot);
            self.registry
                .light_instance_create(&self.storage, light)
                .expect("light exists")
        }

        fn atlas(&self) -> &ShadowAtlas {
            self.registry.shadow_atlas(self.atlas).expect("atlas exists")
        }
    }

    #[test]
    fn key_layout_round_trips_quadrant_and_slot() {
        let key = ShadowKey::new(3, 1023);
        assert_eq!(key.quadrant(), 3);
        assert_eq!(key.slot(), 1023);
    }

    #[test]
    fn subdivision_rounds_to_square_grid() {
        let mut atlas = ShadowAtlas::new();
        atlas.reset(1024);
        for (count, side) in [(1, 1), (3, 2), (4, 2), (8, 2), (16, 4), (17, 5), (64, 8)] {
            atlas.set_quadrant_subdivision(0, count);
            assert_eq!(atlas.quadrants[0].subdivision, side, "count {count}");
            assert_eq!(atlas.quadrants[0].slots.len(), (side * side) as usize);
        }
    }

    #[test]
    fn quadrants_sort_finest_first_and_track_smallest() {
        let fixture = Fixture::new(1024, [1, 0, 64, 4]);
        let atlas = fixture.atlas();
        let order: Vec<u32> = atlas
            .size_order
            .iter()
            .map(|&q| atlas.quadrants[q].subdivision)
            .collect();
        assert_eq!(order, vec![8, 2, 1, 0]);
        assert_eq!(atlas.smallest_subdivision, 1);
    }

    #[test]
    fn slot_rects_tile_their_quadrant() {
        let fixture = Fixture::new(1024, [0, 0, 0, 16]);
        let rect = fixture
            .atlas()
            .slot_rect(ShadowKey::new(3, 5))
            .expect("slot exists");
        assert_eq!(rect, Viewport::new(512 + 128, 512 + 128, 128, 128));
    }

    #[test]
    fn recent_owner_survives_until_tolerance_elapses() {
        let mut fixture = Fixture::new(1024, [1, 0, 0, 0]);
        let first = fixture.light();
        let second = fixture.light();

        fixture.registry.begin_scene_pass();
        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, first, 1.0, 1));

        fixture.registry.begin_scene_pass();
        fixture.clock.advance(100);
        assert!(
            !fixture.registry.shadow_atlas_update_light(fixture.atlas, second, 1.0, 1),
            "slot is inside its tolerance window"
        );
        assert_eq!(fixture.atlas().slot_of(first).map(ShadowKey::quadrant), Some(0));

        fixture.clock.advance(500);
        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, second, 1.0, 1));
        assert_eq!(fixture.atlas().slot_of(first), None);
        assert_eq!(fixture.atlas().owner_count(), 1);
        let first = fixture.registry.light_instance(first).expect("instance exists");
        assert_eq!(first.shadow_atlases().count(), 0);
    }

    #[test]
    fn owners_visible_this_pass_are_never_evicted() {
        let mut fixture = Fixture::new(1024, [1, 0, 0, 0]);
        let first = fixture.light();
        let second = fixture.light();

        fixture.registry.begin_scene_pass();
        fixture.registry.light_instance_mark_visible(first);
        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, first, 1.0, 1));

        fixture.clock.advance(10_000);
        assert!(!fixture.registry.shadow_atlas_update_light(fixture.atlas, second, 1.0, 1));
    }

    #[test]
    fn version_change_requests_redraw_in_place() {
        let mut fixture = Fixture::new(1024, [4, 0, 0, 0]);
        let light = fixture.light();
        fixture.registry.begin_scene_pass();

        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, light, 0.5, 1));
        let key = fixture.atlas().slot_of(light);
        assert!(!fixture.registry.shadow_atlas_update_light(fixture.atlas, light, 0.5, 1));
        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, light, 0.5, 2));
        assert_eq!(fixture.atlas().slot_of(light), key);
    }

    #[test]
    fn stale_assignment_moves_to_better_fitting_quadrant() {
        let mut fixture = Fixture::new(1024, [1, 64, 0, 0]);
        let light = fixture.light();
        fixture.registry.begin_scene_pass();

        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, light, 1.0, 1));
        assert_eq!(fixture.atlas().slot_of(light).map(ShadowKey::quadrant), Some(0));

        fixture.clock.advance(1000);
        assert!(
            fixture.registry.shadow_atlas_update_light(fixture.atlas, light, 0.01, 1),
            "moving to a new slot always needs a redraw"
        );
        assert_eq!(fixture.atlas().slot_of(light).map(ShadowKey::quadrant), Some(1));
        assert_eq!(fixture.atlas().occupied_slots(), 1);
    }

    #[test]
    fn resubdividing_evicts_the_quadrant() {
        let mut fixture = Fixture::new(1024, [4, 0, 0, 0]);
        let light = fixture.light();
        assert!(fixture.registry.shadow_atlas_update_light(fixture.atlas, light, 0.5, 1));

        fixture
            .registry
            .shadow_atlas_set_quadrant_subdivision(fixture.atlas, 0, 16);
        assert_eq!(fixture.atlas().owner_count(), 0);
        assert_eq!(fixture.atlas().quadrants[0].slots.len(), 16);
        let light = fixture.registry.light_instance(light).expect("instance exists");
        assert_eq!(light.shadow_atlases().count(), 0);
    }
}
