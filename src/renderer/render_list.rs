// src/renderer/render_list.rs
//! Fixed-capacity list of draw elements.
//!
//! Opaque elements grow from the front of the backing array and alpha
//! elements from the back, so both partitions share one allocation. A full
//! list drops further elements instead of failing the frame.

use std::cmp::Ordering;

use slotmap::Key;

use super::light_instance::LightInstanceHandle;
use super::storage::{MaterialHandle, MeshHandle, MultiMeshHandle, SkeletonHandle};

/// Ordering within a depth layer; lower draws first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthSortKey {
    pub layer: i32,
    pub priority: i32,
}

impl DepthSortKey {
    pub fn value(self) -> i64 {
        i64::from(self.layer) + i64::from(self.priority)
    }
}

/// Light type bits carried in the batch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LightType {
    #[default]
    Directional = 0,
    Local = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LocalLightType {
    #[default]
    Omni = 0,
    Spot = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LightMode {
    #[default]
    Normal = 0,
    Unshaded = 1,
    Lightmap = 2,
}

/// Fields that decide how much GPU state two neighbouring draws share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSortKey {
    pub geometry: u32,
    pub skeleton: u32,
    pub material: u32,
    pub light_index: u32,
    pub light_type1: LightType,
    pub light_type2: LocalLightType,
    pub light_mode: LightMode,
}

impl BatchSortKey {
    /// Heuristic clustering weight: geometry 1, light index 2, skeleton 3,
    /// light type 4 and 5, light mode 6, material 7.
    pub fn weight(&self) -> u64 {
        u64::from(self.geometry)
            + u64::from(self.light_index) * 2
            + u64::from(self.skeleton) * 3
            + u64::from(self.light_type1 as u8) * 4
            + u64::from(self.light_type2 as u8) * 5
            + u64::from(self.light_mode as u8) * 6
            + u64::from(self.material) * 7
    }

    fn lexicographic(&self) -> (u32, u32, u32, u32, LightType, LocalLightType, LightMode) {
        (
            self.material,
            self.geometry,
            self.skeleton,
            self.light_index,
            self.light_type1,
            self.light_type2,
            self.light_mode,
        )
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.weight()
            .cmp(&other.weight())
            .then_with(|| self.lexicographic().cmp(&other.lexicographic()))
    }
}

/// Small, stable number for a slotmap handle, used inside sort keys.
pub fn key_index<K: Key>(key: K) -> u32 {
    key.data().as_ffi() as u32
}

/// What a render element draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementGeometry {
    pub mesh: MeshHandle,
    pub surface: usize,
    /// Set when the surface is drawn instanced from a multimesh.
    pub multimesh: Option<MultiMeshHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderElement {
    /// Index into the frame's visible instance list.
    pub instance: usize,
    pub geometry: ElementGeometry,
    pub material: MaterialHandle,
    pub skeleton: Option<SkeletonHandle>,
    pub light: Option<LightInstanceHandle>,
    pub front_facing: bool,
    /// Distance from the camera.
    pub depth: f32,
    pub depth_key: DepthSortKey,
    pub batch_key: BatchSortKey,
    /// Shared by every light copy of one surface; see
    /// [`RenderList::accum_used`].
    pub accum_group: u32,
}

pub struct RenderList {
    elements: Vec<RenderElement>,
    element_count: usize,
    alpha_element_count: usize,
    accum: Vec<bool>,
    dropped: usize,
}

impl RenderList {
    pub fn new(capacity: usize) -> Self {
        Self {
            elements: vec![RenderElement::default(); capacity],
            element_count: 0,
            alpha_element_count: 0,
            accum: Vec::new(),
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.elements.len()
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn alpha_element_count(&self) -> usize {
        self.alpha_element_count
    }

    /// Elements rejected since the last clear.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_full(&self) -> bool {
        self.element_count + self.alpha_element_count >= self.capacity()
    }

    /// Resets both partitions; the backing array is kept.
    pub fn clear(&mut self) {
        self.element_count = 0;
        self.alpha_element_count = 0;
        self.accum.clear();
        self.dropped = 0;
    }

    pub fn add_element(&mut self, element: RenderElement) -> Option<&mut RenderElement> {
        if self.is_full() {
            self.dropped += 1;
            return None;
        }
        let index = self.element_count;
        self.element_count += 1;
        self.elements[index] = element;
        Some(&mut self.elements[index])
    }

    pub fn add_alpha_element(&mut self, element: RenderElement) -> Option<&mut RenderElement> {
        if self.is_full() {
            self.dropped += 1;
            return None;
        }
        self.alpha_element_count += 1;
        let index = self.capacity() - self.alpha_element_count;
        self.elements[index] = element;
        Some(&mut self.elements[index])
    }

    pub fn opaque(&self) -> &[RenderElement] {
        &self.elements[..self.element_count]
    }

    /// Alpha elements in list order (the order they are drawn in).
    pub fn alpha(&self) -> &[RenderElement] {
        let start = self.capacity() - self.alpha_element_count;
        &self.elements[start..]
    }

    fn partition_mut(&mut self, alpha: bool) -> &mut [RenderElement] {
        if alpha {
            let start = self.capacity() - self.alpha_element_count;
            &mut self.elements[start..]
        } else {
            &mut self.elements[..self.element_count]
        }
    }

    /// Opaque ordering: depth layer plus priority, then the batch weight.
    pub fn sort_by_key(&mut self, alpha: bool) {
        self.partition_mut(alpha).sort_by(|a, b| {
            a.depth_key
                .value()
                .cmp(&b.depth_key.value())
                .then_with(|| a.batch_key.compare(&b.batch_key))
        });
    }

    /// Nearest first.
    pub fn sort_by_depth(&mut self, alpha: bool) {
        self.partition_mut(alpha)
            .sort_by(|a, b| a.depth.total_cmp(&b.depth));
    }

    /// Priority ascending, then farthest first within a priority.
    /// `depth` is the view-space distance and grows away from the camera, so
    /// larger depths draw first (back to front).
    pub fn sort_by_reverse_depth_and_priority(&mut self, alpha: bool) {
        self.partition_mut(alpha).sort_by(|a, b| {
            a.depth_key
                .priority
                .cmp(&b.depth_key.priority)
                .then_with(|| b.depth.total_cmp(&a.depth))
        });
    }

    /// Opens a new shared accumulation flag for one surface's light copies.
    pub fn new_accum_group(&mut self) -> u32 {
        self.accum.push(false);
        (self.accum.len() - 1) as u32
    }

    /// Whether a pass of this group has already been drawn, so the rest
    /// must blend additively.
    pub fn accum_used(&self, group: u32) -> bool {
        self.accum.get(group as usize).copied().unwrap_or(false)
    }

    pub fn set_accum_used(&mut self, group: u32) {
        if let Some(flag) = self.accum.get_mut(group as usize) {
            *flag = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(depth: f32, priority: i32) -> RenderElement {
        RenderElement {
            depth,
            depth_key: DepthSortKey { layer: 0, priority },
            ..RenderElement::default()
        }
    }

    #[test]
    fn partitions_share_capacity() {
        let mut list = RenderList::new(4);
        for _ in 0..3 {
            assert!(list.add_element(element(0.0, 0)).is_some());
        }
        assert!(list.add_alpha_element(element(0.0, 0)).is_some());
        assert!(list.add_alpha_element(element(0.0, 0)).is_none());
        assert!(list.add_element(element(0.0, 0)).is_none());

        assert_eq!(list.element_count() + list.alpha_element_count(), 4);
        assert_eq!(list.dropped(), 2);

        list.clear();
        assert_eq!(list.element_count(), 0);
        assert_eq!(list.alpha_element_count(), 0);
        assert_eq!(list.capacity(), 4);
    }

    #[test]
    fn depth_sorts_touch_only_their_partition() {
        let mut list = RenderList::new(8);
        list.add_element(element(5.0, 0));
        list.add_element(element(1.0, 0));
        list.add_alpha_element(element(2.0, 0));
        list.add_alpha_element(element(9.0, 0));

        list.sort_by_depth(false);
        let opaque: Vec<f32> = list.opaque().iter().map(|e| e.depth).collect();
        assert_eq!(opaque, vec![1.0, 5.0]);
        let alpha: Vec<f32> = list.alpha().iter().map(|e| e.depth).collect();
        assert_eq!(alpha, vec![9.0, 2.0], "alpha untouched, newest first");
    }

    #[test]
    fn transparent_order_honours_priority_then_distance() {
        let mut list = RenderList::new(8);
        list.add_alpha_element(element(1.0, 1));
        list.add_alpha_element(element(3.0, 0));
        list.add_alpha_element(element(8.0, 0));

        list.sort_by_reverse_depth_and_priority(true);
        let order: Vec<(i32, f32)> = list
            .alpha()
            .iter()
            .map(|e| (e.depth_key.priority, e.depth))
            .collect();
        assert_eq!(order, vec![(0, 8.0), (0, 3.0), (1, 1.0)]);
    }

    #[test]
    fn batch_weight_breaks_depth_ties() {
        let mut list = RenderList::new(8);
        let mut heavy = element(0.0, 0);
        heavy.batch_key.material = 3;
        let mut light = element(0.0, 0);
        light.batch_key.geometry = 5;
        let mut front = element(0.0, -1);
        front.batch_key.material = 100;

        list.add_element(heavy);
        list.add_element(light);
        list.add_element(front);
        list.sort_by_key(false);

        let materials: Vec<u32> = list.opaque().iter().map(|e| e.batch_key.material).collect();
        assert_eq!(materials, vec![100, 0, 3]);
    }

    #[test]
    fn accum_groups_are_shared_and_reset_on_clear() {
        let mut list = RenderList::new(4);
        let group = list.new_accum_group();
        assert!(!list.accum_used(group));
        list.set_accum_used(group);
        assert!(list.accum_used(group));

        list.clear();
        assert!(!list.accum_used(group));
    }
}
