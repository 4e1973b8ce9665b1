//! The volume tree: a sparse octree of attribute overrides plus the
//! operations every edit is built from.

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, AttributeRegistry, AttributeValue};
use crate::guide::{Guide, VisitInfo, VisitOutcome, Visitor};
use crate::node::Node;
use crate::region::Region;
use crate::spanner::{self, Spanner, SpannerId, SpannerSet};

/// Default cap on root doublings performed for one edit.
pub const DEFAULT_MAX_EXPANSIONS: u32 = 32;

// ---------------------------------------------------------------------------
// VolumeData
// ---------------------------------------------------------------------------

/// The serializable part of a tree: root cube and node hierarchy.
///
/// Equal data encodes to equal bytes, which makes it suitable for comparing
/// replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeData {
    minimum: Vec3,
    size: f32,
    root: Arc<Node>,
}

impl VolumeData {
    /// Empty data covering the cube at `minimum` with edge `size`.
    pub fn new(minimum: Vec3, size: f32) -> Self {
        Self::from_root(minimum, size, Node::empty())
    }

    /// Data with an existing hierarchy.
    pub fn from_root(minimum: Vec3, size: f32, root: Arc<Node>) -> Self {
        Self { minimum, size, root }
    }

    /// Root cube.
    pub fn bounds(&self) -> Region {
        Region::cube(self.minimum, self.size)
    }

    /// Root node.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Postcard encoding.
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Inverse of [`VolumeData::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Edge length of the smallest leaf.
    fn finest_leaf_size(&self) -> f32 {
        self.size / 2f32.powi(self.root.depth() as i32)
    }

    /// Registered attributes that are explicitly set somewhere in the data.
    fn grafted_attributes(&self, registry: &AttributeRegistry) -> Vec<AttributeId> {
        let mut attributes = Vec::new();
        self.root.collect_attributes(&mut attributes);
        attributes.retain(|attribute| {
            if !registry.contains(*attribute) {
                tracing::debug!(attribute = attribute.0, "unregistered attribute in grafted data skipped");
                return false;
            }
            !registry.get(*attribute).is_set_valued()
        });
        attributes.sort();
        attributes
    }

    /// Effective values over `region` if a single leaf covers it.
    fn uniform_values(
        &self,
        registry: &AttributeRegistry,
        region: &Region,
        attributes: &[AttributeId],
    ) -> Option<Vec<AttributeValue>> {
        if !self.bounds().contains(region) {
            return None;
        }
        let mut values: Vec<AttributeValue> =
            attributes.iter().map(|a| registry.default_value(*a).clone()).collect();
        let (mut node, mut minimum, mut size) = (&self.root, self.minimum, self.size);
        loop {
            overlay(node, attributes, &mut values);
            let Some(children) = node.children() else {
                return Some(values);
            };
            let half = size * 0.5;
            let octant = (0..8).find(|&octant| {
                Region::cube(Node::child_minimum(minimum, half, octant), half).contains(region)
            })?;
            node = &children[octant];
            minimum = Node::child_minimum(minimum, half, octant);
            size = half;
        }
    }

    /// Effective values at the leaf containing `point`.
    fn sample(&self, registry: &AttributeRegistry, point: Vec3, attributes: &[AttributeId]) -> Vec<AttributeValue> {
        let mut values: Vec<AttributeValue> =
            attributes.iter().map(|a| registry.default_value(*a).clone()).collect();
        let (mut node, mut minimum, mut size) = (&self.root, self.minimum, self.size);
        loop {
            overlay(node, attributes, &mut values);
            let Some(children) = node.children() else {
                return values;
            };
            let half = size * 0.5;
            let center = minimum + Vec3::splat(half);
            let octant = usize::from(point.x >= center.x)
                | usize::from(point.y >= center.y) << 1
                | usize::from(point.z >= center.z) << 2;
            node = &children[octant];
            minimum = Node::child_minimum(minimum, half, octant);
            size = half;
        }
    }
}

fn overlay(node: &Node, attributes: &[AttributeId], values: &mut [AttributeValue]) {
    for (attribute, value) in attributes.iter().zip(values.iter_mut()) {
        if let Some(explicit) = node.value(*attribute) {
            *value = explicit.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// VolumeTree
// ---------------------------------------------------------------------------

/// A volume tree bound to its attribute registry.
///
/// Cloning is O(1): nodes are shared, and every mutation replaces only the
/// touched branch, so clones act as isolated snapshots.
#[derive(Clone, Debug)]
pub struct VolumeTree {
    registry: Arc<AttributeRegistry>,
    data: VolumeData,
    max_expansions: u32,
}

impl VolumeTree {
    /// Empty tree whose root cube starts at `bounds.minimum` and spans the
    /// longest side of `bounds`.
    pub fn new(registry: Arc<AttributeRegistry>, bounds: Region) -> Self {
        Self::from_data(registry, VolumeData::new(bounds.minimum, bounds.longest_side()))
    }

    /// Tree over existing data.
    pub fn from_data(registry: Arc<AttributeRegistry>, data: VolumeData) -> Self {
        Self {
            registry,
            data,
            max_expansions: DEFAULT_MAX_EXPANSIONS,
        }
    }

    /// Builder-style cap on root doublings per [`VolumeTree::ensure_contains`].
    pub fn with_max_expansions(mut self, max_expansions: u32) -> Self {
        self.max_expansions = max_expansions;
        self
    }

    /// Attribute registry.
    pub fn registry(&self) -> &Arc<AttributeRegistry> {
        &self.registry
    }

    /// Serializable contents.
    pub fn data(&self) -> &VolumeData {
        &self.data
    }

    /// Root cube.
    pub fn bounds(&self) -> Region {
        self.data.bounds()
    }

    /// Root node.
    pub fn root(&self) -> &Arc<Node> {
        &self.data.root
    }

    // --- Expansion ---

    /// Double the coverage towards +x+y+z. The old root becomes octant 0.
    pub fn expand(&mut self) {
        self.expand_into(0);
    }

    /// Double the coverage towards the side `region` overflows on each axis.
    pub fn expand_toward(&mut self, region: &Region) {
        let bounds = self.bounds();
        let mut octant = 0;
        for axis in 0..3 {
            if region.minimum[axis] < bounds.minimum[axis] {
                octant |= 1 << axis;
            }
        }
        self.expand_into(octant);
    }

    /// Grow until the bounds contain `region`. Returns `false` for degenerate
    /// regions or when the expansion cap is reached first.
    pub fn ensure_contains(&mut self, region: &Region) -> bool {
        if region.is_degenerate() {
            tracing::warn!(?region, "refusing to expand towards a degenerate region");
            return false;
        }
        let mut expansions = 0;
        while !self.bounds().contains(region) {
            if expansions >= self.max_expansions {
                tracing::warn!(?region, bounds = ?self.bounds(), expansions, "expansion cap reached");
                return false;
            }
            self.expand_toward(region);
            expansions += 1;
        }
        true
    }

    /// Place the old root at `octant` of a new root twice its size.
    /// Set-valued attributes move up to the new root.
    fn expand_into(&mut self, octant: usize) {
        let size = self.data.size;
        let mut minimum = self.data.minimum;
        for axis in 0..3 {
            if octant & (1 << axis) != 0 {
                minimum[axis] -= size;
            }
        }

        let old_root = &self.data.root;
        let (lifted, kept): (Vec<_>, Vec<_>) = old_root
            .values()
            .iter()
            .map(|(attribute, value)| (*attribute, value.clone()))
            .partition(|(attribute, _)| self.registry.get(*attribute).is_set_valued());
        let old_root = if lifted.is_empty() {
            Arc::clone(old_root)
        } else {
            Arc::new(old_root.with_values(kept.into_iter().collect()))
        };

        let mut children = Node::empty_children();
        children[octant] = old_root;
        self.data.root = Arc::new(Node::coalesced(lifted.into_iter().collect(), children));
        self.data.minimum = minimum;
        self.data.size = size * 2.0;
        tracing::debug!(octant, size = self.data.size, "expanded volume root");
    }

    // --- Traversal ---

    /// Writable traversal. `outputs` should not name set-valued attributes;
    /// those are kept at root scope by [`VolumeTree::insert`] and friends.
    pub fn guide<V: Visitor + ?Sized>(&mut self, inputs: &[AttributeId], outputs: &[AttributeId], visitor: &mut V) {
        let registry = Arc::clone(&self.registry);
        let root = Guide::new(&registry, inputs, outputs, visitor, true).run(
            &self.data.root,
            self.data.minimum,
            self.data.size,
        );
        self.data.root = root;
    }

    /// Read-only traversal; never descends below an existing leaf.
    pub fn guide_read<V: Visitor + ?Sized>(&self, inputs: &[AttributeId], visitor: &mut V) {
        Guide::new(&self.registry, inputs, &[], visitor, false).run(&self.data.root, self.data.minimum, self.data.size);
    }

    /// Effective value of `attribute` at `point`; the default outside the bounds.
    pub fn value_at(&self, attribute: AttributeId, point: Vec3) -> AttributeValue {
        let mut found = self.registry.default_value(attribute).clone();
        let mut visitor = |info: &mut VisitInfo<'_>| {
            if !info.bounds().contains_point(point) {
                return VisitOutcome::StopRecursion;
            }
            if let Some(value) = info.input(attribute) {
                found = value.clone();
            }
            VisitOutcome::DefaultOrder
        };
        self.guide_read(&[attribute], &mut visitor);
        found
    }

    // --- Set-valued attributes ---

    fn is_set_attribute(&self, attribute: AttributeId) -> bool {
        let valid = self.registry.contains(attribute) && self.registry.get(attribute).is_set_valued();
        if !valid {
            tracing::warn!(attribute = attribute.0, "not a set-valued attribute");
        }
        valid
    }

    /// Every spanner held by a set-valued attribute.
    pub fn spanners(&self, attribute: AttributeId) -> SpannerSet {
        self.root_set(attribute)
    }

    fn root_set(&self, attribute: AttributeId) -> SpannerSet {
        self.data
            .root
            .value(attribute)
            .unwrap_or_else(|| self.registry.default_value(attribute))
            .as_spanners()
            .cloned()
            .unwrap_or_default()
    }

    fn set_root_set(&mut self, attribute: AttributeId, set: SpannerSet) {
        let mut values = self.data.root.values().clone();
        let value = AttributeValue::Spanners(set);
        let descriptor = self.registry.get(attribute);
        if descriptor.equal(&value, &descriptor.default) {
            values.remove(&attribute);
        } else {
            values.insert(attribute, value);
        }
        self.data.root = Arc::new(self.data.root.with_values(values));
    }

    fn revoxelize(&mut self, attribute: AttributeId, source: &Spanner, bounds: Region) {
        if attribute == AttributeId::SPANNERS {
            spanner::voxelize(self, source, bounds);
        }
    }

    /// Add `spanner` to a set-valued attribute and voxelize it. A spanner
    /// with the same id is replaced. Returns `false` if `attribute` is not
    /// set-valued.
    pub fn insert(&mut self, attribute: AttributeId, spanner: Arc<Spanner>) -> bool {
        if !self.is_set_attribute(attribute) {
            return false;
        }
        let mut set = self.root_set(attribute);
        let bounds = match set.get(spanner.id()) {
            Some(previous) => previous.bounds().union(&spanner.bounds()),
            None => spanner.bounds(),
        };
        set.insert(Arc::clone(&spanner));
        self.set_root_set(attribute, set);
        self.revoxelize(attribute, &spanner, bounds);
        true
    }

    /// Remove a spanner by id and re-voxelize its bounds. A missing id leaves
    /// the tree untouched.
    pub fn remove(&mut self, attribute: AttributeId, id: SpannerId) -> Option<Arc<Spanner>> {
        if !self.is_set_attribute(attribute) {
            return None;
        }
        let mut set = self.root_set(attribute);
        let removed = set.remove(id)?;
        self.set_root_set(attribute, set);
        self.revoxelize(attribute, &removed, removed.bounds());
        Some(removed)
    }

    /// Remove every spanner of the attribute, re-voxelizing each one's bounds.
    pub fn clear(&mut self, attribute: AttributeId) -> Vec<Arc<Spanner>> {
        if !self.is_set_attribute(attribute) {
            return Vec::new();
        }
        let mut set = self.root_set(attribute);
        let removed = set.drain();
        if removed.is_empty() {
            return removed;
        }
        self.set_root_set(attribute, set);
        for spanner in &removed {
            self.revoxelize(attribute, spanner, spanner.bounds());
        }
        removed
    }

    /// Swap `old` for `new` and re-voxelize the union of their bounds.
    /// Returns `false` if `old` is not in the set.
    pub fn replace(&mut self, attribute: AttributeId, old: &Spanner, new: Arc<Spanner>) -> bool {
        if !self.is_set_attribute(attribute) {
            return false;
        }
        let mut set = self.root_set(attribute);
        if set.remove(old.id()).is_none() {
            return false;
        }
        set.insert(Arc::clone(&new));
        self.set_root_set(attribute, set);
        self.revoxelize(attribute, &new, old.bounds().union(&new.bounds()));
        true
    }

    /// Append the spanners whose bounds intersect `region` to `out`, in
    /// ascending id order, skipping ids already present.
    pub fn get_intersecting(&self, attribute: AttributeId, region: &Region, out: &mut Vec<Arc<Spanner>>) {
        let set = self.root_set(attribute);
        for spanner in set.iter() {
            if spanner.bounds().intersects(region) && !out.iter().any(|seen| seen.id() == spanner.id()) {
                out.push(Arc::clone(spanner));
            }
        }
    }

    /// Spanners whose bounds intersect `region`, in ascending id order.
    pub fn intersecting(&self, attribute: AttributeId, region: &Region) -> Vec<Arc<Spanner>> {
        let mut out = Vec::new();
        self.get_intersecting(attribute, region, &mut out);
        out
    }

    // --- Grafting ---

    /// Copy `data` into the tree so that its root cube starts at `minimum`,
    /// overwriting or, with `blend`, merging through each attribute's blend
    /// at full weight. Set-valued attributes are not grafted. The tree is not
    /// expanded here; callers make room first.
    pub fn set(&mut self, minimum: Vec3, data: &VolumeData, blend: bool) {
        let attributes = data.grafted_attributes(&self.registry);
        if attributes.is_empty() {
            return;
        }
        let mut visitor = SetDataVisitor {
            data,
            destination: Region::cube(minimum, data.size),
            offset: data.minimum - minimum,
            attributes: &attributes,
            finest: data.finest_leaf_size(),
            blend,
        };
        self.guide(&attributes, &attributes, &mut visitor);
    }

    // --- Diagnostics ---

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.data.root.count()
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.data.root.leaf_count()
    }

    /// Height of the tree; 0 for a lone root leaf.
    pub fn depth(&self) -> u32 {
        self.data.root.depth()
    }

    /// Returns `true` if no node could be merged with its siblings.
    pub fn is_coalesced(&self) -> bool {
        self.data.root.is_coalesced()
    }
}

/// Grafts a [`VolumeData`] at an offset.
struct SetDataVisitor<'d> {
    data: &'d VolumeData,
    destination: Region,
    /// Destination space to source space.
    offset: Vec3,
    attributes: &'d [AttributeId],
    finest: f32,
    blend: bool,
}

impl SetDataVisitor<'_> {
    fn write(&self, info: &mut VisitInfo<'_>, values: Vec<AttributeValue>) {
        for (attribute, value) in self.attributes.iter().zip(values) {
            let value = if self.blend {
                match info.current(*attribute).cloned() {
                    Some(current) => info.registry().get(*attribute).blend(&current, &value, 1.0),
                    None => value,
                }
            } else {
                value
            };
            info.set_output(*attribute, value);
        }
    }
}

impl Visitor for SetDataVisitor<'_> {
    fn visit(&mut self, info: &mut VisitInfo<'_>) -> VisitOutcome {
        let cube = info.bounds();
        let Some(overlap) = cube.intersection(&self.destination) else {
            return VisitOutcome::StopRecursion;
        };
        let contained = self.destination.contains(&cube);
        if contained {
            let source = cube.translated(self.offset);
            if let Some(values) = self.data.uniform_values(info.registry(), &source, self.attributes) {
                self.write(info, values);
                return VisitOutcome::StopRecursion;
            }
        }
        if info.size > self.finest {
            return VisitOutcome::DefaultOrder;
        }
        // At source resolution: a partially covered node takes the source
        // value only when the graft covers most of it.
        if contained || overlap.volume() >= cube.volume() * 0.5 {
            let values = self.data.sample(info.registry(), overlap.center() + self.offset, self.attributes);
            self.write(info, values);
        }
        VisitOutcome::StopRecursion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{MaterialId, Rgba};

    fn registry() -> Arc<AttributeRegistry> {
        Arc::new(AttributeRegistry::new())
    }

    fn unit_tree() -> VolumeTree {
        VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 1.0))
    }

    fn red() -> AttributeValue {
        AttributeValue::Color(Rgba::opaque(255, 0, 0))
    }

    fn paint(tree: &mut VolumeTree, region: Region, value: AttributeValue) {
        let mut visitor = |info: &mut VisitInfo<'_>| {
            let cube = info.bounds();
            if cube.intersection(&region).is_none() {
                return VisitOutcome::StopRecursion;
            }
            if region.contains(&cube) {
                info.set_output(AttributeId::COLOR, value.clone());
                return VisitOutcome::StopRecursion;
            }
            VisitOutcome::DefaultOrder
        };
        tree.guide(&[AttributeId::COLOR], &[AttributeId::COLOR], &mut visitor);
    }

    fn cuboid(id: u32, region: Region) -> Arc<Spanner> {
        Arc::new(Spanner::cuboid(SpannerId(id), region, Rgba::opaque(0, 0, 255), MaterialId(4)))
    }

    #[test]
    fn test_new_tree_is_single_empty_leaf() {
        let tree = unit_tree();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.5)), AttributeValue::Color(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_expand_keeps_old_root_in_octant_zero() {
        let mut tree = unit_tree();
        paint(&mut tree, Region::cube(Vec3::ZERO, 1.0), red());
        tree.expand();
        assert_eq!(tree.bounds(), Region::cube(Vec3::ZERO, 2.0));
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.5)), red());
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(1.5)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
    }

    #[test]
    fn test_expand_toward_negative_region() {
        let mut tree = unit_tree();
        let target = Region::cube(Vec3::splat(-0.5), 0.25);
        assert!(tree.ensure_contains(&target));
        assert_eq!(tree.bounds(), Region::cube(Vec3::splat(-1.0), 2.0));
    }

    #[test]
    fn test_ensure_contains_refuses_degenerate_and_capped() {
        let mut tree = unit_tree().with_max_expansions(2);
        assert!(!tree.ensure_contains(&Region::cube(Vec3::ZERO, 0.0)));
        assert!(!tree.ensure_contains(&Region::cube(Vec3::splat(100.0), 1.0)));
        assert_eq!(tree.bounds().longest_side(), 4.0);
    }

    #[test]
    fn test_expand_then_insert() {
        let mut tree = unit_tree();
        let spanner = cuboid(1, Region::new(Vec3::splat(2.0), Vec3::splat(6.0)));
        assert!(tree.ensure_contains(&spanner.bounds()));
        assert_eq!(tree.bounds(), Region::cube(Vec3::ZERO, 8.0));
        assert!(tree.insert(AttributeId::SPANNERS, Arc::clone(&spanner)));

        let found = tree.intersecting(AttributeId::SPANNERS, &Region::cube(Vec3::splat(3.0), 1.0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), SpannerId(1));
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(4.0)),
            AttributeValue::Color(Rgba::opaque(0, 0, 255))
        );
        assert_eq!(tree.value_at(AttributeId::MATERIAL, Vec3::splat(4.0)), AttributeValue::Material(MaterialId(4)));
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(0.5)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
        assert!(tree.is_coalesced());
    }

    #[test]
    fn test_expansion_lifts_spanner_set_to_new_root() {
        let mut tree = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        tree.insert(AttributeId::SPANNERS, cuboid(1, Region::cube(Vec3::ZERO, 2.0)));
        tree.expand();
        assert!(tree.root().value(AttributeId::SPANNERS).is_some());
        let children = tree.root().children().unwrap();
        assert!(children[0].value(AttributeId::SPANNERS).is_none());
        assert_eq!(tree.intersecting(AttributeId::SPANNERS, &tree.bounds()).len(), 1);
    }

    #[test]
    fn test_remove_missing_id_is_noop() {
        let mut tree = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        tree.insert(AttributeId::SPANNERS, cuboid(1, Region::cube(Vec3::ZERO, 2.0)));
        let before = tree.data().encode().unwrap();
        let root = Arc::clone(tree.root());
        assert!(tree.remove(AttributeId::SPANNERS, SpannerId(99)).is_none());
        assert!(Arc::ptr_eq(&root, tree.root()));
        assert_eq!(before, tree.data().encode().unwrap());
    }

    #[test]
    fn test_remove_restores_defaults() {
        let mut tree = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        tree.insert(AttributeId::SPANNERS, cuboid(1, Region::cube(Vec3::ZERO, 2.0)));
        assert!(tree.remove(AttributeId::SPANNERS, SpannerId(1)).is_some());
        assert_eq!(tree.node_count(), 1);
        assert!(tree.root().values().is_empty());
    }

    #[test]
    fn test_remove_covering_spanner_keeps_smaller_one() {
        let small = Arc::new(Spanner::cuboid(
            SpannerId(1),
            Region::cube(Vec3::splat(1.1), 0.2),
            Rgba::opaque(255, 0, 0),
            MaterialId(5),
        ));
        let mut alone = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 8.0));
        alone.insert(AttributeId::SPANNERS, Arc::clone(&small));

        let mut cycled = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 8.0));
        cycled.insert(AttributeId::SPANNERS, small);
        cycled.insert(AttributeId::SPANNERS, cuboid(2, Region::cube(Vec3::ZERO, 8.0)));
        assert!(cycled.remove(AttributeId::SPANNERS, SpannerId(2)).is_some());

        let point = Vec3::splat(1.2);
        assert_eq!(
            cycled.value_at(AttributeId::COLOR, point),
            AttributeValue::Color(Rgba::opaque(255, 0, 0))
        );
        assert_eq!(cycled.value_at(AttributeId::MATERIAL, point), AttributeValue::Material(MaterialId(5)));
        assert_eq!(alone.data(), cycled.data());
        assert!(cycled.is_coalesced());
    }

    #[test]
    fn test_replace_large_spanner_keeps_neighbour_detail() {
        let small = Arc::new(Spanner::cuboid(
            SpannerId(1),
            Region::cube(Vec3::splat(1.1), 0.2),
            Rgba::opaque(255, 0, 0),
            MaterialId(5),
        ));
        let large = cuboid(2, Region::cube(Vec3::ZERO, 8.0));
        let mut tree = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 8.0));
        tree.insert(AttributeId::SPANNERS, small);
        tree.insert(AttributeId::SPANNERS, Arc::clone(&large));
        let shrunk = cuboid(2, Region::cube(Vec3::splat(4.0), 4.0));
        assert!(tree.replace(AttributeId::SPANNERS, &large, shrunk));

        assert_eq!(tree.value_at(AttributeId::MATERIAL, Vec3::splat(1.2)), AttributeValue::Material(MaterialId(5)));
        assert_eq!(tree.value_at(AttributeId::MATERIAL, Vec3::splat(6.0)), AttributeValue::Material(MaterialId(4)));
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(3.0)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
    }

    #[test]
    fn test_clear_then_reinsert_matches_fresh_insert() {
        let spanner = cuboid(1, Region::cube(Vec3::ZERO, 2.0));
        let mut fresh = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        fresh.insert(AttributeId::SPANNERS, Arc::clone(&spanner));

        let mut cycled = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        cycled.insert(AttributeId::SPANNERS, cuboid(2, Region::cube(Vec3::splat(1.0), 2.0)));
        assert_eq!(cycled.clear(AttributeId::SPANNERS).len(), 1);
        cycled.insert(AttributeId::SPANNERS, spanner);
        assert_eq!(fresh.data(), cycled.data());
    }

    #[test]
    fn test_replace_swaps_spanner() {
        let mut tree = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        let old = cuboid(1, Region::cube(Vec3::ZERO, 2.0));
        tree.insert(AttributeId::SPANNERS, Arc::clone(&old));
        let moved = cuboid(1, Region::cube(Vec3::splat(2.0), 2.0));
        assert!(tree.replace(AttributeId::SPANNERS, &old, moved));
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(1.0)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(3.0)),
            AttributeValue::Color(Rgba::opaque(0, 0, 255))
        );
        let stranger = cuboid(7, Region::cube(Vec3::ZERO, 1.0));
        assert!(!tree.replace(AttributeId::SPANNERS, &stranger, cuboid(8, Region::cube(Vec3::ZERO, 1.0))));
    }

    #[test]
    fn test_insert_rejects_scalar_attribute() {
        let mut tree = unit_tree();
        assert!(!tree.insert(AttributeId::COLOR, cuboid(1, Region::cube(Vec3::ZERO, 1.0))));
        assert!(tree.root().values().is_empty());
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut tree = unit_tree();
        let snapshot = tree.clone();
        paint(&mut tree, Region::cube(Vec3::ZERO, 0.5), red());
        assert_eq!(
            snapshot.value_at(AttributeId::COLOR, Vec3::splat(0.25)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.25)), red());
    }

    #[test]
    fn test_set_grafts_at_offset() {
        let mut source = unit_tree();
        paint(&mut source, Region::cube(Vec3::ZERO, 0.5), red());

        let mut tree = VolumeTree::new(registry(), Region::cube(Vec3::ZERO, 4.0));
        tree.set(Vec3::splat(2.0), source.data(), false);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(2.25)), red());
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(2.75)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
        assert_eq!(
            tree.value_at(AttributeId::COLOR, Vec3::splat(0.25)),
            AttributeValue::Color(Rgba::TRANSPARENT)
        );
        assert!(tree.is_coalesced());
    }

    #[test]
    fn test_set_with_blend_keeps_existing_under_transparent_source() {
        let mut source = unit_tree();
        paint(&mut source, Region::cube(Vec3::ZERO, 0.5), red());

        let mut tree = unit_tree();
        let white = AttributeValue::Color(Rgba::WHITE);
        paint(&mut tree, Region::cube(Vec3::ZERO, 1.0), white.clone());
        tree.set(Vec3::ZERO, source.data(), true);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.25)), red());
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.75)), white);
    }

    #[test]
    fn test_volume_data_encoding_roundtrip() {
        let mut tree = unit_tree();
        paint(&mut tree, Region::cube(Vec3::ZERO, 0.5), red());
        let bytes = tree.data().encode().unwrap();
        assert_eq!(&VolumeData::decode(&bytes).unwrap(), tree.data());
    }
}
