//! Attribute registry: maps compact [`AttributeId`] values to [`AttributeDescriptor`]s.
//!
//! The registry is built once during startup and then shared read-only behind
//! an `Arc`. The built-in attributes are always registered first, in a fixed
//! order, so their ids are stable constants that can travel on the wire.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spanner::SpannerSet;

// ---------------------------------------------------------------------------
// Ids and values
// ---------------------------------------------------------------------------

/// Compact attribute identifier. Stable for a given registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeId(pub u16);

impl AttributeId {
    /// Set-valued attribute holding every spanner reference.
    pub const SPANNERS: Self = Self(0);
    /// RGBA colour, voxelized from spanners.
    pub const COLOR: Self = Self(1);
    /// Material identifier, voxelized from spanners.
    pub const MATERIAL: Self = Self(2);
    /// Scalar density (free for tools and generators).
    pub const DENSITY: Self = Self(3);
}

/// Identifier of a material definition owned by the material system.
///
/// `NONE` (0) is the absence of any material.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub u16);

impl MaterialId {
    /// No material.
    pub const NONE: Self = Self(0);
}

/// 8-bit RGBA colour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    /// Fully transparent black.
    pub const TRANSPARENT: Self = Self([0, 0, 0, 0]);
    /// Opaque white.
    pub const WHITE: Self = Self([255, 255, 255, 255]);

    /// Create an opaque colour.
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }

    /// Alpha in `[0, 1]`.
    pub fn alpha_f(self) -> f32 {
        f32::from(self.0[3]) / 255.0
    }

    /// Copy with alpha replaced by `alpha` (clamped to `[0, 1]`).
    pub fn with_alpha_f(self, alpha: f32) -> Self {
        let [r, g, b, _] = self.0;
        Self([r, g, b, unit_to_byte(alpha)])
    }

    /// Channel-wise linear interpolation, `w = 0` gives `self`.
    pub fn lerp(self, other: Self, w: f32) -> Self {
        let w = w.clamp(0.0, 1.0);
        let mut out = [0u8; 4];
        for (i, channel) in out.iter_mut().enumerate() {
            let a = f32::from(self.0[i]);
            let b = f32::from(other.0[i]);
            *channel = (a + (b - a) * w).round().clamp(0.0, 255.0) as u8;
        }
        Self(out)
    }
}

fn unit_to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Discriminant of an [`AttributeValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Scalar.
    Float,
    /// RGBA colour.
    Color,
    /// Material reference.
    Material,
    /// Set of spanner references; several values coexist.
    Spanners,
}

/// A typed attribute value stored at a tree node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Scalar value.
    Float(f32),
    /// RGBA colour.
    Color(Rgba),
    /// Material reference.
    Material(MaterialId),
    /// Spanner references ordered by id.
    Spanners(SpannerSet),
}

impl AttributeValue {
    /// Kind of this value.
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::Float(_) => AttributeKind::Float,
            Self::Color(_) => AttributeKind::Color,
            Self::Material(_) => AttributeKind::Material,
            Self::Spanners(_) => AttributeKind::Spanners,
        }
    }

    /// The spanner set, if this is a set-valued attribute.
    pub fn as_spanners(&self) -> Option<&SpannerSet> {
        match self {
            Self::Spanners(set) => Some(set),
            _ => None,
        }
    }

    /// The colour, if this is a colour value.
    pub fn as_color(&self) -> Option<Rgba> {
        match self {
            Self::Color(color) => Some(*color),
            _ => None,
        }
    }

    /// The material, if this is a material value.
    pub fn as_material(&self) -> Option<MaterialId> {
        match self {
            Self::Material(material) => Some(*material),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Blending
// ---------------------------------------------------------------------------

/// Combine `a` (existing) with `b` (incoming) given the weight of `b`.
pub type BlendFn = fn(&AttributeValue, &AttributeValue, f32) -> AttributeValue;

/// Blend used by the built-in attributes.
///
/// Scalars interpolate, colours interpolate by the weight scaled with the
/// incoming alpha, materials take the dominant side and spanner sets merge.
/// Values of different kinds resolve to the dominant side.
pub fn default_blend(a: &AttributeValue, b: &AttributeValue, weight: f32) -> AttributeValue {
    match (a, b) {
        (AttributeValue::Float(x), AttributeValue::Float(y)) => {
            AttributeValue::Float(x + (y - x) * weight.clamp(0.0, 1.0))
        }
        (AttributeValue::Color(x), AttributeValue::Color(y)) => {
            AttributeValue::Color(x.lerp(*y, weight * y.alpha_f()))
        }
        (AttributeValue::Spanners(x), AttributeValue::Spanners(y)) => {
            AttributeValue::Spanners(x.union(y))
        }
        _ => dominant(a, b, weight),
    }
}

fn dominant(a: &AttributeValue, b: &AttributeValue, weight: f32) -> AttributeValue {
    if weight >= 0.5 { b.clone() } else { a.clone() }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Full descriptor for an attribute.
#[derive(Clone, Debug)]
pub struct AttributeDescriptor {
    /// Unique name (e.g. "color", "spanners").
    pub name: String,
    /// Value of every point nobody has written.
    pub default: AttributeValue,
    /// Scales how deep spanner voxelization descends relative to spanner size.
    /// Read only on the set-valued attribute holding the spanners; reserved on
    /// the others.
    pub lod_threshold_multiplier: f32,
    /// Optional merge function; without one the dominant value wins.
    pub blend: Option<BlendFn>,
}

impl AttributeDescriptor {
    /// Descriptor with the default blend and a multiplier of 1.
    pub fn new(name: impl Into<String>, default: AttributeValue) -> Self {
        Self {
            name: name.into(),
            default,
            lod_threshold_multiplier: 1.0,
            blend: Some(default_blend),
        }
    }

    /// Builder-style LOD multiplier override.
    pub fn with_lod_threshold_multiplier(mut self, multiplier: f32) -> Self {
        self.lod_threshold_multiplier = multiplier;
        self
    }

    /// Kind of values this attribute holds.
    pub fn kind(&self) -> AttributeKind {
        self.default.kind()
    }

    /// Returns `true` if several independent values coexist in one slot.
    pub fn is_set_valued(&self) -> bool {
        self.kind() == AttributeKind::Spanners
    }

    /// Equality used when collapsing uniform subtrees.
    pub fn equal(&self, a: &AttributeValue, b: &AttributeValue) -> bool {
        a == b
    }

    /// Merge `b` into `a` where `dominant_weight` is the share of `b`.
    pub fn blend(&self, a: &AttributeValue, b: &AttributeValue, dominant_weight: f32) -> AttributeValue {
        match self.blend {
            Some(blend) => blend(a, b, dominant_weight),
            None => dominant(a, b, dominant_weight),
        }
    }
}

/// Errors that can occur during attribute registration.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    /// An attribute with the same name has already been registered.
    #[error("duplicate attribute name: {0}")]
    DuplicateName(String),
    /// All id slots are consumed.
    #[error("attribute registry is full (max 65536 attributes)")]
    RegistryFull,
    /// The LOD threshold multiplier is not a positive finite number.
    #[error("attribute {name}: invalid LOD threshold multiplier {multiplier}")]
    InvalidMultiplier {
        /// Attribute name.
        name: String,
        /// Rejected multiplier.
        multiplier: f32,
    },
}

/// LOD threshold multipliers of the built-in attributes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodMultipliers {
    /// `spanners`.
    pub spanners: f32,
    /// `color`.
    pub color: f32,
    /// `material`.
    pub material: f32,
    /// `density`.
    pub density: f32,
}

impl Default for LodMultipliers {
    fn default() -> Self {
        Self {
            spanners: 32.0,
            color: 1.0,
            material: 1.0,
            density: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps [`AttributeId`] → [`AttributeDescriptor`] with O(1) lookup by id and
/// by name.
#[derive(Debug)]
pub struct AttributeRegistry {
    /// Dense array where `index == AttributeId.0`.
    attributes: Vec<AttributeDescriptor>,
    name_to_id: FxHashMap<String, AttributeId>,
}

impl AttributeRegistry {
    /// Registry holding only the built-in attributes with default multipliers.
    pub fn new() -> Self {
        Self::with_builtins(LodMultipliers::default())
    }

    /// Registry holding the built-in attributes with the given multipliers.
    ///
    /// # Panics
    ///
    /// Panics if a multiplier is not positive and finite; see
    /// [`AttributeRegistry::try_with_builtins`] for the fallible version.
    pub fn with_builtins(multipliers: LodMultipliers) -> Self {
        match Self::try_with_builtins(multipliers) {
            Ok(registry) => registry,
            Err(err) => panic!("invalid built-in attribute: {err}"),
        }
    }

    /// Registry holding the built-in attributes with the given multipliers.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidMultiplier`] for a multiplier that is
    /// not positive and finite.
    pub fn try_with_builtins(multipliers: LodMultipliers) -> Result<Self, RegistryError> {
        let mut registry = Self {
            attributes: Vec::new(),
            name_to_id: FxHashMap::default(),
        };
        let builtins = [
            AttributeDescriptor::new("spanners", AttributeValue::Spanners(SpannerSet::new()))
                .with_lod_threshold_multiplier(multipliers.spanners),
            AttributeDescriptor::new("color", AttributeValue::Color(Rgba::TRANSPARENT))
                .with_lod_threshold_multiplier(multipliers.color),
            AttributeDescriptor::new("material", AttributeValue::Material(MaterialId::NONE))
                .with_lod_threshold_multiplier(multipliers.material),
            AttributeDescriptor::new("density", AttributeValue::Float(0.0))
                .with_lod_threshold_multiplier(multipliers.density),
        ];
        for descriptor in builtins {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Registers a new attribute and returns its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] for a repeated name,
    /// [`RegistryError::InvalidMultiplier`] for a malformed descriptor, or
    /// [`RegistryError::RegistryFull`] when every id is taken.
    pub fn register(&mut self, descriptor: AttributeDescriptor) -> Result<AttributeId, RegistryError> {
        if self.name_to_id.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        let multiplier = descriptor.lod_threshold_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(RegistryError::InvalidMultiplier {
                name: descriptor.name,
                multiplier,
            });
        }
        if self.attributes.len() > u16::MAX as usize {
            return Err(RegistryError::RegistryFull);
        }

        let id = AttributeId(self.attributes.len() as u16);
        self.name_to_id.insert(descriptor.name.clone(), id);
        self.attributes.push(descriptor);
        Ok(id)
    }

    /// Returns the descriptor for a given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was never registered. Ids come from static registration
    /// or from messages validated against this registry, so an unknown id is a
    /// programming error.
    pub fn get(&self, id: AttributeId) -> &AttributeDescriptor {
        match self.attributes.get(id.0 as usize) {
            Some(descriptor) => descriptor,
            None => panic!("unknown attribute id {}", id.0),
        }
    }

    /// Returns the descriptor for a name.
    ///
    /// # Panics
    ///
    /// Panics if the name was never registered.
    pub fn get_by_name(&self, name: &str) -> &AttributeDescriptor {
        match self.lookup(name) {
            Some(id) => self.get(id),
            None => panic!("unknown attribute name {name:?}"),
        }
    }

    /// Returns the id for a named attribute, or `None` if not found.
    pub fn lookup(&self, name: &str) -> Option<AttributeId> {
        self.name_to_id.get(name).copied()
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: AttributeId) -> bool {
        (id.0 as usize) < self.attributes.len()
    }

    /// Descriptor of the built-in spanners attribute.
    pub fn spanners(&self) -> &AttributeDescriptor {
        self.get(AttributeId::SPANNERS)
    }

    /// Default value of an attribute.
    pub fn default_value(&self, id: AttributeId) -> &AttributeValue {
        &self.get(id).default
    }

    /// Iterates over `(id, descriptor)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (AttributeId, &AttributeDescriptor)> {
        self.attributes
            .iter()
            .enumerate()
            .map(|(index, descriptor)| (AttributeId(index as u16), descriptor))
    }

    /// Total number of registered attributes (including built-ins).
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Always `false`: the built-ins are registered on construction.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl Default for AttributeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
