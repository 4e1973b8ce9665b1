//! Immutable octree nodes shared between tree snapshots.
//!
//! Nodes are never mutated once wrapped in an `Arc`; every write path builds
//! replacement nodes for the touched branch and reuses untouched siblings by
//! pointer, so cloning a tree is O(1) and published snapshots stay valid
//! while the writer moves on.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, AttributeValue};

/// Shared empty leaf, used for fresh octants and split leaves.
static EMPTY_LEAF: LazyLock<Arc<Node>> = LazyLock::new(|| Arc::new(Node::default()));

/// Children of an internal node, indexed by octant.
pub type Children = Box<[Arc<Node>; 8]>;

/// One cube of the octree.
///
/// `values` holds only explicit overrides; an attribute missing here is
/// inherited from the nearest ancestor that sets it, or from the registry
/// default. A node is a leaf iff `children` is `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    values: BTreeMap<AttributeId, AttributeValue>,
    children: Option<Children>,
}

impl Node {
    /// Leaf with the given explicit values.
    pub fn leaf(values: BTreeMap<AttributeId, AttributeValue>) -> Self {
        Self { values, children: None }
    }

    /// Internal node with the given explicit values and children.
    pub fn internal(values: BTreeMap<AttributeId, AttributeValue>, children: Children) -> Self {
        Self {
            values,
            children: Some(children),
        }
    }

    /// The shared empty leaf.
    pub fn empty() -> Arc<Node> {
        Arc::clone(&EMPTY_LEAF)
    }

    /// Eight empty leaves.
    pub fn empty_children() -> Children {
        Box::new(std::array::from_fn(|_| Node::empty()))
    }

    /// Returns `true` if the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Child nodes, if any.
    pub fn children(&self) -> Option<&[Arc<Node>; 8]> {
        self.children.as_deref()
    }

    /// Explicit overrides.
    pub fn values(&self) -> &BTreeMap<AttributeId, AttributeValue> {
        &self.values
    }

    /// Explicit value of one attribute.
    pub fn value(&self, attribute: AttributeId) -> Option<&AttributeValue> {
        self.values.get(&attribute)
    }

    /// Same children, different explicit values.
    pub fn with_values(&self, values: BTreeMap<AttributeId, AttributeValue>) -> Self {
        Self {
            values,
            children: self.children.clone(),
        }
    }

    /// Take the parts out of the node.
    pub fn into_parts(self) -> (BTreeMap<AttributeId, AttributeValue>, Option<Children>) {
        (self.values, self.children)
    }

    /// Minimum corner of child `octant` given the parent's corner and child size.
    ///
    /// Bit 0 of the octant selects +x, bit 1 +y, bit 2 +z.
    pub fn child_minimum(minimum: Vec3, child_size: f32, octant: usize) -> Vec3 {
        minimum
            + Vec3::new(
                (octant & 1) as f32,
                ((octant >> 1) & 1) as f32,
                ((octant >> 2) & 1) as f32,
            ) * child_size
    }

    /// Build a node, merging the children into it when they are eight leaves
    /// with identical explicit values.
    pub fn coalesced(mut values: BTreeMap<AttributeId, AttributeValue>, children: Children) -> Self {
        let first = &children[0];
        let uniform = children
            .iter()
            .all(|child| child.is_leaf() && (Arc::ptr_eq(child, first) || child.values == first.values));
        if !uniform {
            return Self::internal(values, children);
        }
        for (attribute, value) in &first.values {
            values.insert(*attribute, value.clone());
        }
        Self::leaf(values)
    }

    /// Copy of the subtree with the given attributes removed from every node.
    ///
    /// Returns the same `Arc` when nothing under `node` mentions them.
    pub fn without(node: &Arc<Node>, attributes: &[AttributeId]) -> Arc<Node> {
        let values_touched = attributes.iter().any(|a| node.values.contains_key(a));
        let Some(children) = node.children.as_deref() else {
            if !values_touched {
                return Arc::clone(node);
            }
            let mut values = node.values.clone();
            values.retain(|attribute, _| !attributes.contains(attribute));
            return Arc::new(Node::leaf(values));
        };

        let stripped: [Arc<Node>; 8] = std::array::from_fn(|i| Node::without(&children[i], attributes));
        let children_touched = stripped
            .iter()
            .zip(children.iter())
            .any(|(new, old)| !Arc::ptr_eq(new, old));
        if !values_touched && !children_touched {
            return Arc::clone(node);
        }
        let mut values = node.values.clone();
        values.retain(|attribute, _| !attributes.contains(attribute));
        Arc::new(Node::coalesced(values, Box::new(stripped)))
    }

    /// Number of nodes in the subtree, this one included.
    pub fn count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flat_map(|children| children.iter())
            .map(|child| child.count())
            .sum::<usize>()
    }

    /// Number of leaves in the subtree.
    pub fn leaf_count(&self) -> usize {
        match &self.children {
            None => 1,
            Some(children) => children.iter().map(|child| child.leaf_count()).sum(),
        }
    }

    /// Height of the subtree; a leaf has depth 0.
    pub fn depth(&self) -> u32 {
        match &self.children {
            None => 0,
            Some(children) => 1 + children.iter().map(|child| child.depth()).max().unwrap_or(0),
        }
    }

    /// Returns `true` if no internal node of the subtree could be merged.
    pub fn is_coalesced(&self) -> bool {
        let Some(children) = &self.children else {
            return true;
        };
        let first = &children[0];
        let mergeable = children
            .iter()
            .all(|child| child.is_leaf() && child.values == first.values);
        !mergeable && children.iter().all(|child| child.is_coalesced())
    }

    /// Ids of every attribute set anywhere in the subtree.
    pub fn collect_attributes(&self, into: &mut Vec<AttributeId>) {
        for attribute in self.values.keys() {
            if !into.contains(attribute) {
                into.push(*attribute);
            }
        }
        for child in self.children.iter().flat_map(|children| children.iter()) {
            child.collect_attributes(into);
        }
    }
}
