//! Edits: self-contained, replicable mutations of a [`VolumeTree`].
//!
//! Every edit is a plain data record. Applying it reads only the tree, the
//! object table and its own fields, so replicas that apply the same edits in
//! the same order end up with identical trees.

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::{AttributeId, AttributeKind, AttributeRegistry, AttributeValue, MaterialId, Rgba};
use crate::guide::{VisitInfo, VisitOutcome};
use crate::node::Node;
use crate::objects::ObjectRefTable;
use crate::region::Region;
use crate::spanner::{BlendSpannerVisitor, Spanner, SpannerId};
use crate::tree::{VolumeData, VolumeTree};

/// Spanners are searched in this multiple of the brush radius.
const PAINT_SEARCH_MARGIN: f32 = 1.1;

/// Reasons an edit is rejected before it is applied.
#[derive(Debug, Error, PartialEq)]
pub enum EditError {
    /// The attribute id is not registered.
    #[error("unknown attribute id {0:?}")]
    UnknownAttribute(AttributeId),
    /// The value does not have the attribute's kind.
    #[error("attribute {attribute:?} holds {expected:?} values, got {found:?}")]
    KindMismatch {
        /// Target attribute.
        attribute: AttributeId,
        /// Kind declared by the registry.
        expected: AttributeKind,
        /// Kind of the carried value.
        found: AttributeKind,
    },
    /// A value edit targets a set-valued attribute.
    #[error("attribute {0:?} is set-valued and cannot be assigned")]
    SetValuedTarget(AttributeId),
    /// A spanner edit targets an attribute that is not set-valued.
    #[error("attribute {0:?} is not set-valued")]
    NotSetValued(AttributeId),
    /// A spanner shape cannot be evaluated.
    #[error("malformed spanner {0:?}")]
    MalformedSpanner(SpannerId),
    /// A numeric parameter is out of range.
    #[error("invalid {0}")]
    InvalidParameter(&'static str),
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Assign a value over a box, rounding at `granularity`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxSetEdit {
    /// Target box.
    pub region: Region,
    /// Smallest node size the box is resolved to.
    pub granularity: f32,
    /// Target attribute.
    pub attribute: AttributeId,
    /// Value to assign.
    pub value: AttributeValue,
}

/// Assign a value to the whole volume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalSetEdit {
    /// Target attribute.
    pub attribute: AttributeId,
    /// Value to assign.
    pub value: AttributeValue,
}

/// Add a spanner to a set-valued attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertSpannerEdit {
    /// Set-valued attribute.
    pub attribute: AttributeId,
    /// Spanner to insert.
    pub spanner: Arc<Spanner>,
}

/// Remove a spanner by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoveSpannerEdit {
    /// Set-valued attribute.
    pub attribute: AttributeId,
    /// Spanner to remove.
    pub id: SpannerId,
}

/// Remove every spanner of a set-valued attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearSpannersEdit {
    /// Set-valued attribute.
    pub attribute: AttributeId,
}

/// Graft a volume at an offset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetDataEdit {
    /// Where the data's minimum corner lands.
    pub minimum: Vec3,
    /// Volume to graft.
    pub data: VolumeData,
    /// Blend into existing values instead of overwriting.
    pub blend: bool,
}

/// Raise or lower heightfields with a round brush.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaintHeightfieldHeightEdit {
    /// Brush center.
    pub position: Vec3,
    /// Brush radius.
    pub radius: f32,
    /// Height added at the center, in world units.
    pub height: f32,
}

/// Apply a material to spanners inside an editor shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetSpannerMaterialEdit {
    /// Editor shape.
    pub spanner: Arc<Spanner>,
    /// Material to apply.
    pub material: MaterialId,
    /// Average colour of the material.
    pub average_color: Rgba,
    /// Recolour surfaces only, leaving geometry alone.
    pub paint: bool,
}

/// Blend a spanner directly into the voxelized attributes without
/// registering it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetSpannerEdit {
    /// Spanner to stamp.
    pub spanner: Arc<Spanner>,
}

/// Every kind of edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Edit {
    /// See [`BoxSetEdit`].
    BoxSet(BoxSetEdit),
    /// See [`GlobalSetEdit`].
    GlobalSet(GlobalSetEdit),
    /// See [`InsertSpannerEdit`].
    InsertSpanner(InsertSpannerEdit),
    /// See [`RemoveSpannerEdit`].
    RemoveSpanner(RemoveSpannerEdit),
    /// See [`ClearSpannersEdit`].
    ClearSpanners(ClearSpannersEdit),
    /// See [`SetDataEdit`].
    SetData(SetDataEdit),
    /// See [`PaintHeightfieldHeightEdit`].
    PaintHeightfieldHeight(PaintHeightfieldHeightEdit),
    /// See [`SetSpannerMaterialEdit`].
    SetSpannerMaterial(SetSpannerMaterialEdit),
    /// See [`SetSpannerEdit`].
    SetSpanner(SetSpannerEdit),
}

impl Edit {
    /// Variant name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::BoxSet(_) => "BoxSet",
            Self::GlobalSet(_) => "GlobalSet",
            Self::InsertSpanner(_) => "InsertSpanner",
            Self::RemoveSpanner(_) => "RemoveSpanner",
            Self::ClearSpanners(_) => "ClearSpanners",
            Self::SetData(_) => "SetData",
            Self::PaintHeightfieldHeight(_) => "PaintHeightfieldHeight",
            Self::SetSpannerMaterial(_) => "SetSpannerMaterial",
            Self::SetSpanner(_) => "SetSpanner",
        }
    }

    /// Apply to `tree`, resolving spanner ids through `objects`.
    pub fn apply(&self, tree: &mut VolumeTree, objects: &ObjectRefTable) {
        tracing::trace!(kind = self.kind_name(), "applying edit");
        match self {
            Self::BoxSet(edit) => edit.apply(tree, objects),
            Self::GlobalSet(edit) => edit.apply(tree, objects),
            Self::InsertSpanner(edit) => edit.apply(tree, objects),
            Self::RemoveSpanner(edit) => edit.apply(tree, objects),
            Self::ClearSpanners(edit) => edit.apply(tree, objects),
            Self::SetData(edit) => edit.apply(tree, objects),
            Self::PaintHeightfieldHeight(edit) => edit.apply(tree, objects),
            Self::SetSpannerMaterial(edit) => edit.apply(tree, objects),
            Self::SetSpanner(edit) => edit.apply(tree, objects),
        }
    }

    /// Check attribute ids, value kinds and shapes against `registry`.
    ///
    /// # Errors
    ///
    /// Returns the first problem found; a valid edit can be applied without
    /// touching an unknown attribute.
    pub fn validate(&self, registry: &AttributeRegistry) -> Result<(), EditError> {
        match self {
            Self::BoxSet(edit) => {
                if !(edit.granularity.is_finite() && edit.granularity > 0.0) {
                    return Err(EditError::InvalidParameter("box set granularity"));
                }
                check_assignment(registry, edit.attribute, &edit.value)
            }
            Self::GlobalSet(edit) => check_assignment(registry, edit.attribute, &edit.value),
            Self::InsertSpanner(edit) => {
                check_set_valued(registry, edit.attribute)?;
                check_spanner(&edit.spanner)
            }
            Self::RemoveSpanner(RemoveSpannerEdit { attribute, .. })
            | Self::ClearSpanners(ClearSpannersEdit { attribute }) => check_set_valued(registry, *attribute),
            Self::SetData(edit) => {
                if !edit.minimum.is_finite() || edit.data.bounds().is_degenerate() {
                    return Err(EditError::InvalidParameter("set data bounds"));
                }
                check_node(registry, edit.data.root())
            }
            Self::PaintHeightfieldHeight(edit) => {
                if !(edit.position.is_finite() && edit.radius.is_finite() && edit.height.is_finite()) {
                    return Err(EditError::InvalidParameter("paint brush"));
                }
                Ok(())
            }
            Self::SetSpannerMaterial(SetSpannerMaterialEdit { spanner, .. })
            | Self::SetSpanner(SetSpannerEdit { spanner }) => check_spanner(spanner),
        }
    }
}

fn check_known(registry: &AttributeRegistry, attribute: AttributeId) -> Result<(), EditError> {
    if registry.contains(attribute) {
        Ok(())
    } else {
        Err(EditError::UnknownAttribute(attribute))
    }
}

fn check_kind(registry: &AttributeRegistry, attribute: AttributeId, value: &AttributeValue) -> Result<(), EditError> {
    check_known(registry, attribute)?;
    let expected = registry.get(attribute).kind();
    if value.kind() != expected {
        return Err(EditError::KindMismatch {
            attribute,
            expected,
            found: value.kind(),
        });
    }
    Ok(())
}

fn check_assignment(registry: &AttributeRegistry, attribute: AttributeId, value: &AttributeValue) -> Result<(), EditError> {
    check_kind(registry, attribute, value)?;
    if registry.get(attribute).is_set_valued() {
        return Err(EditError::SetValuedTarget(attribute));
    }
    Ok(())
}

fn check_set_valued(registry: &AttributeRegistry, attribute: AttributeId) -> Result<(), EditError> {
    check_known(registry, attribute)?;
    if registry.get(attribute).is_set_valued() {
        Ok(())
    } else {
        Err(EditError::NotSetValued(attribute))
    }
}

fn check_spanner(spanner: &Spanner) -> Result<(), EditError> {
    if spanner.is_well_formed() {
        Ok(())
    } else {
        Err(EditError::MalformedSpanner(spanner.id()))
    }
}

fn check_node(registry: &AttributeRegistry, node: &Node) -> Result<(), EditError> {
    for (attribute, value) in node.values() {
        check_kind(registry, *attribute, value)?;
    }
    for child in node.children().into_iter().flatten() {
        check_node(registry, child)?;
    }
    Ok(())
}

/// Local edits skip [`Edit::validate`]; an unusable one is dropped here.
fn usable(tree: &VolumeTree, result: Result<(), EditError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(bounds = ?tree.bounds(), "edit ignored: {err}");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

impl BoxSetEdit {
    /// Assign `value` to every node inside `region`. Nodes straddling the
    /// boundary are subdivided down to `granularity`, where they take the
    /// value iff at least half of them is covered.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        if self.region.is_degenerate() || !(self.granularity.is_finite() && self.granularity > 0.0) {
            return;
        }
        if !usable(tree, check_assignment(tree.registry(), self.attribute, &self.value)) {
            return;
        }
        tree.ensure_contains(&self.region);
        let region = self.region;
        let granularity = self.granularity;
        let attribute = self.attribute;
        let mut visitor = |info: &mut VisitInfo<'_>| {
            let cube = info.bounds();
            if cube.intersection(&region).is_none() {
                return VisitOutcome::StopRecursion;
            }
            if region.contains(&cube) {
                info.set_output(attribute, self.value.clone());
                return VisitOutcome::StopRecursion;
            }
            if info.size <= granularity {
                if cube.overlap_fraction(&region) >= 0.5 {
                    info.set_output(attribute, self.value.clone());
                }
                return VisitOutcome::StopRecursion;
            }
            VisitOutcome::DefaultOrder
        };
        tree.guide(&[attribute], &[attribute], &mut visitor);
    }
}

impl GlobalSetEdit {
    /// Assign `value` at the root, replacing every override below.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        if !usable(tree, check_assignment(tree.registry(), self.attribute, &self.value)) {
            return;
        }
        let attribute = self.attribute;
        let mut visitor = |info: &mut VisitInfo<'_>| {
            info.set_output(attribute, self.value.clone());
            VisitOutcome::StopRecursion
        };
        tree.guide(&[attribute], &[attribute], &mut visitor);
    }
}

impl InsertSpannerEdit {
    /// Grow the tree to cover the spanner, then insert and voxelize it.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        let checked = check_set_valued(tree.registry(), self.attribute).and_then(|()| check_spanner(&self.spanner));
        if !usable(tree, checked) {
            return;
        }
        tree.ensure_contains(&self.spanner.bounds());
        tree.insert(self.attribute, Arc::clone(&self.spanner));
    }
}

impl RemoveSpannerEdit {
    /// Remove the spanner if the object table still knows it.
    pub fn apply(&self, tree: &mut VolumeTree, objects: &ObjectRefTable) {
        let Some(spanner) = objects.resolve(self.id) else {
            tracing::debug!(id = self.id.0, "spanner to remove is not live; skipping");
            return;
        };
        if !usable(tree, check_set_valued(tree.registry(), self.attribute)) {
            return;
        }
        tree.remove(self.attribute, spanner.id());
    }
}

impl ClearSpannersEdit {
    /// Remove every spanner of the attribute.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        if !usable(tree, check_set_valued(tree.registry(), self.attribute)) {
            return;
        }
        tree.clear(self.attribute);
    }
}

impl SetDataEdit {
    /// Grow the tree to cover the destination, then graft.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        let destination = Region::cube(self.minimum, self.data.bounds().longest_side());
        if destination.is_degenerate() || !usable(tree, check_node(tree.registry(), self.data.root())) {
            return;
        }
        tree.ensure_contains(&destination);
        tree.set(self.minimum, &self.data, self.blend);
    }
}

impl PaintHeightfieldHeightEdit {
    /// Replace every intersected spanner whose heights the brush changes.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        if !(self.radius.is_finite() && self.radius > 0.0) || !self.position.is_finite() {
            return;
        }
        let extents = Vec3::splat(self.radius * PAINT_SEARCH_MARGIN);
        let search = Region::new(self.position - extents, self.position + extents);
        for spanner in tree.intersecting(AttributeId::SPANNERS, &search) {
            if let Some(painted) = spanner.paint_height(self.position, self.radius, self.height) {
                tree.replace(AttributeId::SPANNERS, &spanner, Arc::new(painted));
            }
        }
    }
}

/// Colour actually applied by a material edit.
///
/// Painting forces full opacity. Otherwise a mostly transparent colour means
/// "erase" and becomes fully transparent black.
pub fn material_edit_color(average_color: Rgba, paint: bool) -> Rgba {
    if paint {
        average_color.with_alpha_f(1.0)
    } else if average_color.alpha_f() < 0.5 {
        Rgba::TRANSPARENT
    } else {
        average_color
    }
}

impl SetSpannerMaterialEdit {
    /// Apply the material to every spanner the editor shape intersects.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        if !usable(tree, check_spanner(&self.spanner)) {
            return;
        }
        let color = material_edit_color(self.average_color, self.paint);
        let bounds = self.spanner.bounds();
        tree.ensure_contains(&bounds);
        for spanner in tree.intersecting(AttributeId::SPANNERS, &bounds) {
            if let Some(edited) = spanner.set_material(&self.spanner, self.material, color, self.paint) {
                tree.replace(AttributeId::SPANNERS, &spanner, Arc::new(edited));
            }
        }
    }
}

impl SetSpannerEdit {
    /// Blend the spanner into every node it intersects.
    pub fn apply(&self, tree: &mut VolumeTree, _objects: &ObjectRefTable) {
        if !usable(tree, check_spanner(&self.spanner)) {
            return;
        }
        tree.ensure_contains(&self.spanner.bounds());
        let attributes = self.spanner.voxelized_attributes();
        let mut visitor = BlendSpannerVisitor { spanner: &self.spanner };
        tree.guide(attributes, attributes, &mut visitor);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::message::EditMessage;
    use crate::spanner::Heightfield;

    fn tree() -> VolumeTree {
        VolumeTree::new(Arc::new(AttributeRegistry::new()), Region::cube(Vec3::ZERO, 1.0))
    }

    fn color(value: Rgba) -> AttributeValue {
        AttributeValue::Color(value)
    }

    fn red() -> AttributeValue {
        color(Rgba::opaque(255, 0, 0))
    }

    fn box_set(region: Region, granularity: f32, value: AttributeValue) -> Edit {
        Edit::BoxSet(BoxSetEdit {
            region,
            granularity,
            attribute: AttributeId::COLOR,
            value,
        })
    }

    fn terrain(id: u32) -> Arc<Spanner> {
        Arc::new(Spanner::heightfield(
            SpannerId(id),
            Heightfield::flat(Vec3::ZERO, 4.0, 2.0, 9, u16::MAX / 2, Rgba::opaque(0, 160, 0), MaterialId(2)),
        ))
    }

    #[test]
    fn test_global_set_is_idempotent() {
        let objects = ObjectRefTable::new();
        let edit = Edit::GlobalSet(GlobalSetEdit {
            attribute: AttributeId::COLOR,
            value: red(),
        });
        let mut once = tree();
        edit.apply(&mut once, &objects);
        let mut twice = once.clone();
        edit.apply(&mut twice, &objects);
        assert_eq!(once.data(), twice.data());
        assert!(once.root().is_leaf());
        assert_eq!(once.value_at(AttributeId::COLOR, Vec3::splat(0.9)), red());
    }

    #[test]
    fn test_global_set_replaces_box_set() {
        let objects = ObjectRefTable::new();
        let mut tree = tree();
        box_set(Region::cube(Vec3::ZERO, 0.25), 0.125, red()).apply(&mut tree, &objects);
        assert!(tree.depth() > 0);
        let white = color(Rgba::WHITE);
        Edit::GlobalSet(GlobalSetEdit {
            attribute: AttributeId::COLOR,
            value: white.clone(),
        })
        .apply(&mut tree, &objects);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.1)), white);
    }

    #[test]
    fn test_box_set_covers_exactly_aligned_region() {
        let objects = ObjectRefTable::new();
        let mut tree = tree();
        box_set(Region::cube(Vec3::ZERO, 0.5), 0.125, red()).apply(&mut tree, &objects);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.25)), red());
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.75)), color(Rgba::TRANSPARENT));
        assert_eq!(tree.depth(), 1);
        assert!(tree.is_coalesced());
    }

    #[test]
    fn test_box_set_rounds_at_granularity() {
        let objects = ObjectRefTable::new();
        // Covers 60% of the x extent of the lower half cube and all of y/z.
        let region = Region::new(Vec3::ZERO, Vec3::new(0.3, 1.0, 1.0));
        let mut tree = tree();
        box_set(region, 0.5, red()).apply(&mut tree, &objects);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::new(0.4, 0.5, 0.5)), red());
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::new(0.8, 0.5, 0.5)), color(Rgba::TRANSPARENT));

        // Below half coverage: nothing is written.
        let thin = Region::new(Vec3::ZERO, Vec3::new(0.2, 1.0, 1.0));
        let mut untouched = self::tree();
        box_set(thin, 0.5, red()).apply(&mut untouched, &objects);
        assert_eq!(untouched.node_count(), 1);
        assert!(untouched.root().values().is_empty());
    }

    #[test]
    fn test_box_set_then_clear_with_default() {
        let objects = ObjectRefTable::new();
        let region = Region::new(Vec3::splat(0.1), Vec3::splat(0.7));
        let mut tree = tree();
        box_set(region, 0.0625, red()).apply(&mut tree, &objects);
        assert!(tree.node_count() > 1);
        box_set(region, 0.0625, color(Rgba::TRANSPARENT)).apply(&mut tree, &objects);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.root().values().is_empty());
    }

    #[test]
    fn test_box_set_expands_tree() {
        let objects = ObjectRefTable::new();
        let mut tree = tree();
        box_set(Region::cube(Vec3::splat(1.0), 1.0), 0.5, red()).apply(&mut tree, &objects);
        assert_eq!(tree.bounds(), Region::cube(Vec3::ZERO, 2.0));
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(1.5)), red());
    }

    #[test]
    fn test_degenerate_box_is_noop() {
        let objects = ObjectRefTable::new();
        let mut tree = tree();
        box_set(Region::cube(Vec3::ZERO, 0.0), 0.5, red()).apply(&mut tree, &objects);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.root().values().is_empty());
    }

    #[test]
    fn test_kind_mismatch_is_ignored_locally() {
        let objects = ObjectRefTable::new();
        let mut tree = tree();
        let edit = Edit::GlobalSet(GlobalSetEdit {
            attribute: AttributeId::COLOR,
            value: AttributeValue::Float(1.0),
        });
        edit.apply(&mut tree, &objects);
        assert!(tree.root().values().is_empty());
        assert_eq!(
            edit.validate(tree.registry()),
            Err(EditError::KindMismatch {
                attribute: AttributeId::COLOR,
                expected: AttributeKind::Color,
                found: AttributeKind::Float,
            })
        );
    }

    #[test]
    fn test_validate_rejects_unknown_and_set_targets() {
        let registry = AttributeRegistry::new();
        let unknown = Edit::ClearSpanners(ClearSpannersEdit {
            attribute: AttributeId(42),
        });
        assert_eq!(unknown.validate(&registry), Err(EditError::UnknownAttribute(AttributeId(42))));

        let scalar = Edit::RemoveSpanner(RemoveSpannerEdit {
            attribute: AttributeId::COLOR,
            id: SpannerId(1),
        });
        assert_eq!(scalar.validate(&registry), Err(EditError::NotSetValued(AttributeId::COLOR)));

        let assign_set = Edit::GlobalSet(GlobalSetEdit {
            attribute: AttributeId::SPANNERS,
            value: AttributeValue::Spanners(Default::default()),
        });
        assert_eq!(assign_set.validate(&registry), Err(EditError::SetValuedTarget(AttributeId::SPANNERS)));

        let zero_granularity = box_set(Region::cube(Vec3::ZERO, 1.0), 0.0, red());
        assert!(matches!(zero_granularity.validate(&registry), Err(EditError::InvalidParameter(_))));
    }

    #[test]
    fn test_remove_unknown_object_is_noop() {
        let mut tree = tree();
        let objects = ObjectRefTable::new();
        let before = tree.data().encode().unwrap();
        Edit::RemoveSpanner(RemoveSpannerEdit {
            attribute: AttributeId::SPANNERS,
            id: SpannerId(5),
        })
        .apply(&mut tree, &objects);
        assert_eq!(before, tree.data().encode().unwrap());
    }

    #[test]
    fn test_insert_then_remove_through_object_table() {
        let mut tree = tree();
        let mut objects = ObjectRefTable::new();
        let spanner = Arc::new(Spanner::cuboid(
            SpannerId(1),
            Region::cube(Vec3::splat(2.0), 2.0),
            Rgba::WHITE,
            MaterialId(1),
        ));
        Edit::InsertSpanner(InsertSpannerEdit {
            attribute: AttributeId::SPANNERS,
            spanner,
        })
        .apply(&mut tree, &objects);
        assert_eq!(tree.bounds(), Region::cube(Vec3::ZERO, 4.0));
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(3.0)), color(Rgba::WHITE));

        objects.refresh_from(&tree);
        Edit::RemoveSpanner(RemoveSpannerEdit {
            attribute: AttributeId::SPANNERS,
            id: SpannerId(1),
        })
        .apply(&mut tree, &objects);
        assert!(tree.spanners(AttributeId::SPANNERS).is_empty());
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(3.0)), color(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_clear_spanners_edit() {
        let mut tree = VolumeTree::new(Arc::new(AttributeRegistry::new()), Region::cube(Vec3::ZERO, 4.0));
        let objects = ObjectRefTable::new();
        for id in 1..=3 {
            tree.insert(
                AttributeId::SPANNERS,
                Arc::new(Spanner::cuboid(
                    SpannerId(id),
                    Region::cube(Vec3::splat(id as f32 - 1.0), 1.0),
                    Rgba::WHITE,
                    MaterialId(1),
                )),
            );
        }
        Edit::ClearSpanners(ClearSpannersEdit {
            attribute: AttributeId::SPANNERS,
        })
        .apply(&mut tree, &objects);
        assert!(tree.spanners(AttributeId::SPANNERS).is_empty());
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_paint_height_replaces_heightfield() {
        let mut tree = VolumeTree::new(Arc::new(AttributeRegistry::new()), Region::cube(Vec3::ZERO, 4.0));
        let objects = ObjectRefTable::new();
        let original = terrain(1);
        tree.insert(AttributeId::SPANNERS, Arc::clone(&original));
        Edit::PaintHeightfieldHeight(PaintHeightfieldHeightEdit {
            position: Vec3::new(2.0, 1.0, 2.0),
            radius: 1.0,
            height: 0.5,
        })
        .apply(&mut tree, &objects);
        let set = tree.spanners(AttributeId::SPANNERS);
        let current = set.get(SpannerId(1)).unwrap();
        assert!(!Arc::ptr_eq(current, &original));
        assert_ne!(current.shape(), original.shape());
    }

    #[test]
    fn test_paint_height_far_away_keeps_spanner() {
        let mut tree = VolumeTree::new(Arc::new(AttributeRegistry::new()), Region::cube(Vec3::ZERO, 4.0));
        let objects = ObjectRefTable::new();
        let original = terrain(1);
        tree.insert(AttributeId::SPANNERS, Arc::clone(&original));
        let before = tree.data().clone();
        Edit::PaintHeightfieldHeight(PaintHeightfieldHeightEdit {
            position: Vec3::new(40.0, 0.0, 40.0),
            radius: 1.0,
            height: 0.5,
        })
        .apply(&mut tree, &objects);
        assert_eq!(&before, tree.data());
    }

    #[test]
    fn test_material_edit_color_policy() {
        let half_clear = Rgba([10, 20, 30, 100]);
        assert_eq!(material_edit_color(half_clear, true), Rgba([10, 20, 30, 255]));
        assert_eq!(material_edit_color(half_clear, false), Rgba::TRANSPARENT);
        let mostly_opaque = Rgba([10, 20, 30, 200]);
        assert_eq!(material_edit_color(mostly_opaque, false), mostly_opaque);
    }

    #[test]
    fn test_set_spanner_material_paints_terrain() {
        let mut tree = VolumeTree::new(Arc::new(AttributeRegistry::new()), Region::cube(Vec3::ZERO, 4.0));
        let objects = ObjectRefTable::new();
        tree.insert(AttributeId::SPANNERS, terrain(1));
        let editor = Arc::new(Spanner::cuboid(
            SpannerId(50),
            Region::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(2.0, 2.0, 2.0)),
            Rgba::TRANSPARENT,
            MaterialId::NONE,
        ));
        Edit::SetSpannerMaterial(SetSpannerMaterialEdit {
            spanner: editor,
            material: MaterialId(9),
            average_color: Rgba([200, 10, 10, 40]),
            paint: true,
        })
        .apply(&mut tree, &objects);
        let set = tree.spanners(AttributeId::SPANNERS);
        let crate::spanner::SpannerShape::Heightfield(field) = set.get(SpannerId(1)).unwrap().shape() else {
            panic!("expected heightfield");
        };
        assert_eq!(field.materials[0], MaterialId(9));
        assert_eq!(field.colors[0], Rgba([200, 10, 10, 255]));
        assert_eq!(*field.materials.last().unwrap(), MaterialId(2));
    }

    #[test]
    fn test_set_spanner_stamps_without_registering() {
        let mut tree = VolumeTree::new(Arc::new(AttributeRegistry::new()), Region::cube(Vec3::ZERO, 4.0));
        let objects = ObjectRefTable::new();
        let blue = Rgba::opaque(0, 0, 255);
        let stamp = Arc::new(
            Spanner::cuboid(SpannerId(8), Region::cube(Vec3::ZERO, 2.0), blue, MaterialId(6))
                .with_placement_granularity(0.5),
        );
        Edit::SetSpanner(SetSpannerEdit { spanner: stamp }).apply(&mut tree, &objects);
        assert!(tree.spanners(AttributeId::SPANNERS).is_empty());
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(1.0)), color(blue));
        assert_eq!(tree.value_at(AttributeId::MATERIAL, Vec3::splat(1.0)), AttributeValue::Material(MaterialId(6)));
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(3.0)), color(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_set_data_edit_expands_and_grafts() {
        let objects = ObjectRefTable::new();
        let mut source = tree();
        Edit::GlobalSet(GlobalSetEdit {
            attribute: AttributeId::COLOR,
            value: red(),
        })
        .apply(&mut source, &objects);

        let mut target = tree();
        Edit::SetData(SetDataEdit {
            minimum: Vec3::splat(1.0),
            data: source.data().clone(),
            blend: false,
        })
        .apply(&mut target, &objects);
        assert_eq!(target.bounds(), Region::cube(Vec3::ZERO, 2.0));
        assert_eq!(target.value_at(AttributeId::COLOR, Vec3::splat(1.5)), red());
        assert_eq!(target.value_at(AttributeId::COLOR, Vec3::splat(0.5)), color(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_set_data_with_wrong_kind_is_ignored_locally() {
        let objects = ObjectRefTable::new();
        let mut values = BTreeMap::new();
        values.insert(AttributeId::COLOR, AttributeValue::Float(3.0));
        let edit = Edit::SetData(SetDataEdit {
            minimum: Vec3::splat(1.0),
            data: VolumeData::from_root(Vec3::ZERO, 1.0, Arc::new(Node::leaf(values))),
            blend: false,
        });

        let mut tree = tree();
        assert!(matches!(
            edit.validate(tree.registry()),
            Err(EditError::KindMismatch { attribute: AttributeId::COLOR, .. })
        ));
        let before = tree.data().clone();
        edit.apply(&mut tree, &objects);
        assert_eq!(tree.data(), &before);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.5)), color(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_insert_spanner_outside_tree_expands_first() {
        let mut tree = tree();
        let objects = ObjectRefTable::new();
        let spanner = Arc::new(Spanner::cuboid(
            SpannerId(3),
            Region::new(Vec3::splat(2.0), Vec3::splat(6.0)),
            Rgba::WHITE,
            MaterialId(1),
        ));
        Edit::InsertSpanner(InsertSpannerEdit {
            attribute: AttributeId::SPANNERS,
            spanner,
        })
        .apply(&mut tree, &objects);

        assert_eq!(tree.bounds(), Region::cube(Vec3::ZERO, 8.0));
        let found = tree.intersecting(AttributeId::SPANNERS, &Region::cube(Vec3::splat(3.0), 1.0));
        assert_eq!(found.iter().map(|s| s.id()).collect::<Vec<_>>(), vec![SpannerId(3)]);
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(4.5)), color(Rgba::WHITE));
        assert_eq!(tree.value_at(AttributeId::COLOR, Vec3::splat(0.5)), color(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_replicas_with_unrelated_objects_converge() {
        let registry = Arc::new(AttributeRegistry::new());
        let mut local = VolumeTree::new(Arc::clone(&registry), Region::cube(Vec3::ZERO, 1.0));
        let mut remote = local.clone();
        let mut local_objects = ObjectRefTable::new();
        let mut remote_objects = ObjectRefTable::new();

        // Live on the remote side only, never part of either tree.
        let unrelated = Arc::new(Spanner::cuboid(
            SpannerId(50),
            Region::cube(Vec3::ZERO, 1.0),
            Rgba::opaque(9, 9, 9),
            MaterialId(9),
        ));
        remote_objects.register(&unrelated);

        let cuboid = |id: u32, minimum: f32| {
            Arc::new(Spanner::cuboid(
                SpannerId(id),
                Region::cube(Vec3::splat(minimum), 1.0),
                Rgba::WHITE,
                MaterialId(id as u16),
            ))
        };
        let edits = [
            Edit::InsertSpanner(InsertSpannerEdit {
                attribute: AttributeId::SPANNERS,
                spanner: cuboid(1, 0.0),
            }),
            Edit::InsertSpanner(InsertSpannerEdit {
                attribute: AttributeId::SPANNERS,
                spanner: cuboid(2, 1.0),
            }),
            Edit::RemoveSpanner(RemoveSpannerEdit {
                attribute: AttributeId::SPANNERS,
                id: SpannerId(1),
            }),
            Edit::RemoveSpanner(RemoveSpannerEdit {
                attribute: AttributeId::SPANNERS,
                id: SpannerId(50),
            }),
        ];
        for (sequence, edit) in edits.into_iter().enumerate() {
            let message = EditMessage::new(sequence as u64, edit);
            let received = EditMessage::decode(&message.encode().unwrap(), &registry).unwrap();

            message.apply(&mut local, &local_objects);
            local_objects.refresh_from(&local);
            received.apply(&mut remote, &remote_objects);
            remote_objects.refresh_from(&remote);
        }

        assert_eq!(local.data().encode().unwrap(), remote.data().encode().unwrap());
        let ids: Vec<_> = remote.spanners(AttributeId::SPANNERS).ids().collect();
        assert_eq!(ids, vec![SpannerId(2)]);
        assert!(remote_objects.resolve(SpannerId(50)).is_some());
        assert!(local_objects.resolve(SpannerId(50)).is_none());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(box_set(Region::cube(Vec3::ZERO, 1.0), 1.0, red()).kind_name(), "BoxSet");
        let clear = Edit::ClearSpanners(ClearSpannersEdit {
            attribute: AttributeId::SPANNERS,
        });
        assert_eq!(clear.kind_name(), "ClearSpanners");
    }
}
