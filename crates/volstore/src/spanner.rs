//! Spanners: identified objects whose extent covers many voxels.
//!
//! A spanner lives in the set-valued `spanners` attribute and is also
//! *voxelized*: its colour and material are rasterized into the ordinary
//! attributes down to a size threshold, so readers of those attributes need no
//! spanner-specific logic. Spanners are immutable once shared; edits that
//! modify one derive a copy with the same [`SpannerId`] and swap it in.

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, AttributeValue, MaterialId, Rgba};
use crate::guide::{VisitInfo, VisitOutcome, Visitor};
use crate::region::Region;
use crate::tree::VolumeTree;

/// Attributes every spanner shape rasterizes into.
const VOXELIZED: [AttributeId; 2] = [AttributeId::COLOR, AttributeId::MATERIAL];

/// Without an explicit placement granularity, blending stops at this fraction
/// of the spanner's longest side.
const DEFAULT_GRANULARITY_DIVISOR: f32 = 16.0;

/// Stable spanner identifier, shared by every replica of the same object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpannerId(pub u32);

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// Geometry and payload of a spanner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SpannerShape {
    /// Solid box of one colour and material.
    Cuboid {
        /// Extent of the box.
        bounds: Region,
        /// Colour contributed to the `color` attribute.
        color: Rgba,
        /// Material contributed to the `material` attribute.
        material: MaterialId,
    },
    /// Terrain tile.
    Heightfield(Heightfield),
}

/// Square grid of heights over a horizontal footprint.
///
/// Sample `(ix, iz)` lies at `translation + (ix, 0, iz) * spacing` where
/// `spacing = scale / (width - 1)`. A height of 0 is a hole; otherwise the
/// surface sits at `translation.y + height / u16::MAX * height_scale`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heightfield {
    /// Minimum corner of the tile.
    pub translation: Vec3,
    /// Horizontal edge length of the footprint.
    pub scale: f32,
    /// World height of the maximum sample value.
    pub height_scale: f32,
    /// Samples per side.
    pub width: u32,
    /// Row-major (`iz * width + ix`) heights.
    pub heights: Vec<u16>,
    /// Per-sample colour.
    pub colors: Vec<Rgba>,
    /// Per-sample material.
    pub materials: Vec<MaterialId>,
}

impl Heightfield {
    /// A flat tile where every sample has the same height, colour and material.
    pub fn flat(
        translation: Vec3,
        scale: f32,
        height_scale: f32,
        width: u32,
        height: u16,
        color: Rgba,
        material: MaterialId,
    ) -> Self {
        let count = (width as usize) * (width as usize);
        Self {
            translation,
            scale,
            height_scale,
            width,
            heights: vec![height; count],
            colors: vec![color; count],
            materials: vec![material; count],
        }
    }

    /// Returns `true` if the grid is at least 2×2 and every array matches it.
    pub fn is_well_formed(&self) -> bool {
        let count = (self.width as usize) * (self.width as usize);
        self.width >= 2
            && self.scale > 0.0
            && self.height_scale > 0.0
            && self.heights.len() == count
            && self.colors.len() == count
            && self.materials.len() == count
    }

    /// Tile bounds.
    pub fn bounds(&self) -> Region {
        Region::new(
            self.translation,
            self.translation + Vec3::new(self.scale, self.height_scale, self.scale),
        )
    }

    fn spacing(&self) -> f32 {
        self.scale / (self.width.saturating_sub(1).max(1)) as f32
    }

    fn index(&self, ix: u32, iz: u32) -> usize {
        iz as usize * self.width as usize + ix as usize
    }

    /// World position of sample `(ix, iz)` at the tile base.
    fn sample_position(&self, ix: u32, iz: u32) -> Vec3 {
        let spacing = self.spacing();
        self.translation + Vec3::new(ix as f32 * spacing, 0.0, iz as f32 * spacing)
    }

    /// Nearest sample to a horizontal position, clamped into the grid.
    fn nearest_sample(&self, x: f32, z: f32) -> (u32, u32) {
        let spacing = self.spacing();
        let last = self.width.saturating_sub(1) as f32;
        let ix = ((x - self.translation.x) / spacing).round().clamp(0.0, last);
        let iz = ((z - self.translation.z) / spacing).round().clamp(0.0, last);
        (ix as u32, iz as u32)
    }

    fn in_footprint(&self, x: f32, z: f32) -> bool {
        x >= self.translation.x
            && x <= self.translation.x + self.scale
            && z >= self.translation.z
            && z <= self.translation.z + self.scale
    }

    fn height_at(&self, index: usize) -> u16 {
        self.heights.get(index).copied().unwrap_or(0)
    }

    fn world_height(&self, value: u16) -> f32 {
        self.translation.y + f32::from(value) / f32::from(u16::MAX) * self.height_scale
    }

    fn sample_value(&self, world_y: f32) -> f32 {
        (world_y - self.translation.y) / self.height_scale * f32::from(u16::MAX)
    }

    /// Surface height at a horizontal position, or `None` outside the tile or over a hole.
    pub fn surface_at(&self, x: f32, z: f32) -> Option<f32> {
        if !self.in_footprint(x, z) {
            return None;
        }
        let (ix, iz) = self.nearest_sample(x, z);
        match self.height_at(self.index(ix, iz)) {
            0 => None,
            value => Some(self.world_height(value)),
        }
    }

    fn coverage(&self, cube: &Region) -> f32 {
        let footprint = Region::new(
            Vec3::new(self.translation.x, cube.minimum.y, self.translation.z),
            Vec3::new(self.translation.x + self.scale, cube.maximum.y, self.translation.z + self.scale),
        );
        let horizontal = cube.overlap_fraction(&footprint);
        if horizontal <= 0.0 {
            return 0.0;
        }
        let center = cube.center();
        let (x, z) = (
            center.x.clamp(footprint.minimum.x, footprint.maximum.x),
            center.z.clamp(footprint.minimum.z, footprint.maximum.z),
        );
        let Some(surface) = self.surface_at(x, z) else {
            return 0.0;
        };
        let height = cube.size().y;
        let vertical = ((surface - cube.minimum.y) / height).clamp(0.0, 1.0);
        horizontal * vertical
    }

    fn sample_payload(&self, cube: &Region) -> (Rgba, MaterialId) {
        let center = cube.center();
        let (ix, iz) = self.nearest_sample(center.x, center.z);
        let index = self.index(ix, iz);
        (
            self.colors.get(index).copied().unwrap_or(Rgba::TRANSPARENT),
            self.materials.get(index).copied().unwrap_or(MaterialId::NONE),
        )
    }

    /// Raise (or lower, for negative `height`) the surface inside a disc with
    /// a quadratic falloff. Holes stay holes; solid samples never drop to 0.
    fn paint_height(&self, position: Vec3, radius: f32, height: f32) -> Option<Self> {
        let spacing = self.spacing();
        let squared_radius = radius * radius;
        let scaled_height = height / self.height_scale * f32::from(u16::MAX);
        let last = self.width.saturating_sub(1) as f32;
        let local = position - self.translation;
        let x_range = (
            ((local.x - radius) / spacing).floor().clamp(0.0, last) as u32,
            ((local.x + radius) / spacing).ceil().clamp(0.0, last) as u32,
        );
        let z_range = (
            ((local.z - radius) / spacing).floor().clamp(0.0, last) as u32,
            ((local.z + radius) / spacing).ceil().clamp(0.0, last) as u32,
        );

        let mut heights = self.heights.clone();
        let mut changed = false;
        for iz in z_range.0..=z_range.1 {
            for ix in x_range.0..=x_range.1 {
                let sample = self.sample_position(ix, iz);
                let dx = sample.x - position.x;
                let dz = sample.z - position.z;
                let distance_squared = dx * dx + dz * dz;
                if distance_squared > squared_radius {
                    continue;
                }
                let index = self.index(ix, iz);
                let Some(value) = heights.get_mut(index) else {
                    continue;
                };
                if *value == 0 {
                    continue;
                }
                let delta = scaled_height * (squared_radius - distance_squared) / squared_radius;
                let painted = (f32::from(*value) + delta).round().clamp(1.0, f32::from(u16::MAX)) as u16;
                if painted != *value {
                    *value = painted;
                    changed = true;
                }
            }
        }
        changed.then(|| Self {
            heights,
            ..self.clone()
        })
    }

    /// Apply a material edit shaped by `editor`.
    ///
    /// Painting recolours solid samples whose surface point lies inside the
    /// editor. Otherwise a transparent colour erases the editor's volume and an
    /// opaque one fills it up to the editor's top.
    fn set_material(&self, editor: &Spanner, material: MaterialId, color: Rgba, paint: bool) -> Option<Self> {
        let editor_bounds = editor.bounds();
        let mut next = self.clone();
        let mut changed = false;
        for iz in 0..self.width {
            for ix in 0..self.width {
                let index = self.index(ix, iz);
                let base = self.sample_position(ix, iz);
                let value = self.height_at(index);
                if paint {
                    if value == 0 {
                        continue;
                    }
                    let surface = Vec3::new(base.x, self.world_height(value), base.z);
                    if !editor.contains_point(surface) {
                        continue;
                    }
                    changed |= assign(&mut next.colors, index, color);
                    changed |= assign(&mut next.materials, index, material);
                    continue;
                }

                let column = Vec3::new(base.x, editor_bounds.center().y, base.z);
                if !editor.contains_point(column) {
                    continue;
                }
                if color.0[3] == 0 {
                    if value == 0 || self.world_height(value) < editor_bounds.minimum.y {
                        continue;
                    }
                    let floor = self.sample_value(editor_bounds.minimum.y);
                    let lowered = if floor < 1.0 { 0 } else { floor.round().min(f32::from(u16::MAX)) as u16 };
                    changed |= assign(&mut next.heights, index, lowered);
                    changed |= assign(&mut next.materials, index, MaterialId::NONE);
                } else {
                    let top = self.sample_value(editor_bounds.maximum.y).round().clamp(1.0, f32::from(u16::MAX)) as u16;
                    if value < top {
                        changed |= assign(&mut next.heights, index, top);
                    }
                    changed |= assign(&mut next.colors, index, color);
                    changed |= assign(&mut next.materials, index, material);
                }
            }
        }
        changed.then_some(next)
    }
}

/// Store `value` at `index`, returning whether anything changed.
fn assign<T: PartialEq>(samples: &mut [T], index: usize, value: T) -> bool {
    match samples.get_mut(index) {
        Some(slot) if *slot != value => {
            *slot = value;
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Spanner
// ---------------------------------------------------------------------------

/// A shared, identified object spanning many voxels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spanner {
    id: SpannerId,
    placement_granularity: f32,
    shape: SpannerShape,
}

impl Spanner {
    /// Solid box spanner.
    pub fn cuboid(id: SpannerId, bounds: Region, color: Rgba, material: MaterialId) -> Self {
        Self {
            id,
            placement_granularity: 0.0,
            shape: SpannerShape::Cuboid {
                bounds,
                color,
                material,
            },
        }
    }

    /// Terrain tile spanner.
    pub fn heightfield(id: SpannerId, heightfield: Heightfield) -> Self {
        Self {
            id,
            placement_granularity: 0.0,
            shape: SpannerShape::Heightfield(heightfield),
        }
    }

    /// Builder-style placement granularity (minimum useful voxel size).
    pub fn with_placement_granularity(mut self, granularity: f32) -> Self {
        self.placement_granularity = granularity;
        self
    }

    /// Stable identifier.
    pub fn id(&self) -> SpannerId {
        self.id
    }

    /// Geometry and payload.
    pub fn shape(&self) -> &SpannerShape {
        &self.shape
    }

    /// Bounding region.
    pub fn bounds(&self) -> Region {
        match &self.shape {
            SpannerShape::Cuboid { bounds, .. } => *bounds,
            SpannerShape::Heightfield(heightfield) => heightfield.bounds(),
        }
    }

    /// Minimum useful voxel size as configured.
    pub fn placement_granularity(&self) -> f32 {
        self.placement_granularity
    }

    /// Granularity actually used to stop refinement: the configured one, or a
    /// fraction of the longest side when none is set.
    pub fn effective_granularity(&self) -> f32 {
        if self.placement_granularity > 0.0 {
            self.placement_granularity
        } else {
            self.bounds().longest_side() / DEFAULT_GRANULARITY_DIVISOR
        }
    }

    /// Ordinary attributes this spanner rasterizes into.
    pub fn voxelized_attributes(&self) -> &'static [AttributeId] {
        &VOXELIZED
    }

    /// Returns `false` for shapes a receiver cannot safely evaluate.
    pub fn is_well_formed(&self) -> bool {
        let granularity_ok = self.placement_granularity.is_finite() && self.placement_granularity >= 0.0;
        granularity_ok
            && match &self.shape {
                SpannerShape::Cuboid { bounds, .. } => !bounds.is_degenerate(),
                SpannerShape::Heightfield(heightfield) => heightfield.is_well_formed(),
            }
    }

    /// Returns `true` if the point lies inside the solid part of the spanner.
    pub fn contains_point(&self, point: Vec3) -> bool {
        match &self.shape {
            SpannerShape::Cuboid { bounds, .. } => bounds.contains_point(point),
            SpannerShape::Heightfield(heightfield) => {
                point.y >= heightfield.translation.y
                    && heightfield
                        .surface_at(point.x, point.z)
                        .is_some_and(|surface| point.y <= surface)
            }
        }
    }

    /// Fraction of `cube` occupied by the spanner, in `[0, 1]`.
    pub fn coverage(&self, cube: &Region) -> f32 {
        match &self.shape {
            SpannerShape::Cuboid { bounds, .. } => cube.overlap_fraction(bounds),
            SpannerShape::Heightfield(heightfield) => heightfield.coverage(cube),
        }
    }

    fn contribution(&self, attribute: AttributeId, cube: &Region) -> Option<AttributeValue> {
        let (color, material) = match &self.shape {
            SpannerShape::Cuboid { color, material, .. } => (*color, *material),
            SpannerShape::Heightfield(heightfield) => heightfield.sample_payload(cube),
        };
        match attribute {
            AttributeId::COLOR => Some(AttributeValue::Color(color)),
            AttributeId::MATERIAL => Some(AttributeValue::Material(material)),
            _ => None,
        }
    }

    /// Blend this spanner's contribution into the node described by `info`.
    ///
    /// Values are weighted by the covered fraction of the node. Called from a
    /// voxelization pass (`from_parent_pass`), the contribution is always
    /// written. Otherwise partially covered nodes above the granularity floor
    /// are left untouched and refinement is requested instead. Returns whether
    /// recursion beneath this node is still warranted.
    pub fn blend_attribute_values(&self, info: &mut VisitInfo<'_>, from_parent_pass: bool) -> bool {
        let cube = info.bounds();
        let coverage = self.coverage(&cube);
        if coverage <= 0.0 {
            return false;
        }
        let refine = coverage < 1.0 && info.size > self.effective_granularity();
        if refine && !from_parent_pass {
            return true;
        }
        for &attribute in self.voxelized_attributes() {
            let (Some(contribution), Some(current)) =
                (self.contribution(attribute, &cube), info.current(attribute).cloned())
            else {
                continue;
            };
            let blended = info.registry().get(attribute).blend(&current, &contribution, coverage);
            info.set_output(attribute, blended);
        }
        refine
    }

    /// Derive a copy whose heightfield is raised by `height` inside the disc of
    /// `radius` around `position`. `None` when nothing changes.
    pub fn paint_height(&self, position: Vec3, radius: f32, height: f32) -> Option<Self> {
        match &self.shape {
            SpannerShape::Heightfield(heightfield) => heightfield
                .paint_height(position, radius, height)
                .map(|painted| Self {
                    shape: SpannerShape::Heightfield(painted),
                    ..self.clone()
                }),
            SpannerShape::Cuboid { .. } => None,
        }
    }

    /// Derive a copy with `material` and `color` applied where `editor`
    /// overlaps this spanner. `None` when nothing changes.
    pub fn set_material(&self, editor: &Spanner, material: MaterialId, color: Rgba, paint: bool) -> Option<Self> {
        match &self.shape {
            SpannerShape::Heightfield(heightfield) => heightfield
                .set_material(editor, material, color, paint)
                .map(|edited| Self {
                    shape: SpannerShape::Heightfield(edited),
                    ..self.clone()
                }),
            SpannerShape::Cuboid { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SpannerSet
// ---------------------------------------------------------------------------

/// Set of spanner references keyed and ordered by id.
///
/// Iteration order is ascending id, which makes blending order deterministic
/// across replicas.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpannerSet(BTreeMap<SpannerId, Arc<Spanner>>);

impl SpannerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite by id. Returns `true` if the id was new.
    pub fn insert(&mut self, spanner: Arc<Spanner>) -> bool {
        self.0.insert(spanner.id(), spanner).is_none()
    }

    /// Remove by id.
    pub fn remove(&mut self, id: SpannerId) -> Option<Arc<Spanner>> {
        self.0.remove(&id)
    }

    /// Spanner with the given id.
    pub fn get(&self, id: SpannerId) -> Option<&Arc<Spanner>> {
        self.0.get(&id)
    }

    /// Returns `true` if the id is present.
    pub fn contains(&self, id: SpannerId) -> bool {
        self.0.contains_key(&id)
    }

    /// Spanners in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Spanner>> {
        self.0.values()
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = SpannerId> + '_ {
        self.0.keys().copied()
    }

    /// Number of spanners.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set holds no spanners.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union; entries of `other` win on id collisions.
    pub fn union(&self, other: &SpannerSet) -> SpannerSet {
        let mut merged = self.clone();
        for spanner in other.iter() {
            merged.insert(Arc::clone(spanner));
        }
        merged
    }

    /// Remove every entry, returning them in id order.
    pub fn drain(&mut self) -> Vec<Arc<Spanner>> {
        std::mem::take(&mut self.0).into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Voxelization
// ---------------------------------------------------------------------------

/// Resolution down to which `spanner` is voxelized.
fn voxelization_size(spanner: &Spanner, multiplier: f32) -> f32 {
    let granularity = spanner.effective_granularity();
    let extent = spanner.bounds().longest_side().max(granularity);
    (extent * 2.0 / multiplier).max(granularity)
}

/// Rasterizes the spanner set into the voxelized attributes over `bounds`.
///
/// A node is refined while it is coarser than the finest spanner overlapping
/// it, and written only where refinement stops, so the result depends on the
/// set alone and not on which update triggered the pass.
struct UpdateSpannerVisitor<'s> {
    spanners: &'s SpannerSet,
    bounds: Region,
    multiplier: f32,
    /// Resolution of the updated spanner; limits refinement of straddling nodes
    /// that no spanner overlaps.
    floor: f32,
}

impl UpdateSpannerVisitor<'_> {
    fn overlapping<'a>(&'a self, cube: &'a Region) -> impl Iterator<Item = &'a Arc<Spanner>> + 'a {
        self.spanners
            .iter()
            .filter(move |spanner| cube.intersection(&spanner.bounds()).is_some())
    }
}

impl Visitor for UpdateSpannerVisitor<'_> {
    fn visit(&mut self, info: &mut VisitInfo<'_>) -> VisitOutcome {
        let cube = info.bounds();
        if cube.intersection(&self.bounds).is_none() {
            return VisitOutcome::StopRecursion;
        }
        let threshold = self
            .overlapping(&cube)
            .map(|spanner| voxelization_size(spanner, self.multiplier))
            .reduce(f32::min);
        match threshold {
            Some(threshold) if info.size > threshold => return VisitOutcome::DefaultOrder,
            // Empty but straddling the update: clearing it here would wipe
            // untouched data outside the bounds.
            None if info.size > self.floor && !self.bounds.contains(&cube) => return VisitOutcome::DefaultOrder,
            _ => {}
        }

        for attribute in VOXELIZED {
            let default = info.registry().default_value(attribute).clone();
            info.set_output(attribute, default);
        }
        for spanner in self.overlapping(&cube) {
            spanner.blend_attribute_values(info, true);
        }
        VisitOutcome::StopRecursion
    }
}

/// Re-rasterize the current spanner set over `bounds`, the region touched by
/// a change to `source`.
pub(crate) fn voxelize(tree: &mut VolumeTree, source: &Spanner, bounds: Region) {
    if bounds.is_degenerate() {
        return;
    }
    let multiplier = tree.registry().spanners().lod_threshold_multiplier;
    // Sets live at the root only, so every ancestor pass sees this one set.
    let spanners = tree.spanners(AttributeId::SPANNERS);
    let mut visitor = UpdateSpannerVisitor {
        spanners: &spanners,
        bounds,
        multiplier,
        floor: voxelization_size(source, multiplier),
    };
    tree.guide(&VOXELIZED, &VOXELIZED, &mut visitor);
}

/// Blends one spanner into every node it intersects, refining only where
/// [`Spanner::blend_attribute_values`] asks for it.
pub(crate) struct BlendSpannerVisitor<'s> {
    pub(crate) spanner: &'s Spanner,
}

impl Visitor for BlendSpannerVisitor<'_> {
    fn visit(&mut self, info: &mut VisitInfo<'_>) -> VisitOutcome {
        if info.bounds().intersection(&self.spanner.bounds()).is_none() {
            return VisitOutcome::StopRecursion;
        }
        if self.spanner.blend_attribute_values(info, false) {
            VisitOutcome::DefaultOrder
        } else {
            VisitOutcome::StopRecursion
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
