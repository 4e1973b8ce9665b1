//! Guided traversal: the single engine behind every read and write of the tree.
//!
//! A [`Visitor`] sees each node top-down with the effective values of its
//! input attributes and decides whether to recurse. Writable traversals let it
//! assign output values; the engine then rebuilds the touched branch,
//! normalizes values equal to what the node would inherit, and merges uniform
//! children so the tree stays canonical.

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::Vec3;

use crate::attribute::{AttributeId, AttributeRegistry, AttributeValue};
use crate::node::Node;
use crate::region::Region;

/// Hard limit on node depth below the root. Refinement requests past it are
/// treated as [`VisitOutcome::StopRecursion`].
pub const MAX_DEPTH: u32 = 24;

/// What the traversal does after a visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitOutcome {
    /// Do not visit the children. Outputs written here replace the values of
    /// the whole subtree.
    StopRecursion,
    /// Visit the eight children in octant order, splitting leaves on writable
    /// traversals.
    DefaultOrder,
}

/// Callback invoked for every visited node.
pub trait Visitor {
    /// Inspect `info` and optionally assign outputs.
    fn visit(&mut self, info: &mut VisitInfo<'_>) -> VisitOutcome;
}

impl<F> Visitor for F
where
    F: FnMut(&mut VisitInfo<'_>) -> VisitOutcome,
{
    fn visit(&mut self, info: &mut VisitInfo<'_>) -> VisitOutcome {
        self(info)
    }
}

/// Per-node state handed to a [`Visitor`].
#[derive(Debug)]
pub struct VisitInfo<'a> {
    registry: &'a AttributeRegistry,
    /// Minimum corner of the node cube.
    pub minimum: Vec3,
    /// Edge length of the node cube.
    pub size: f32,
    /// Whether the node currently has no children.
    pub is_leaf: bool,
    /// Distance from the root.
    pub depth: u32,
    inputs: &'a [AttributeId],
    input_values: Vec<AttributeValue>,
    outputs: &'a [AttributeId],
    output_values: Vec<Option<AttributeValue>>,
    parent: Option<&'a VisitInfo<'a>>,
}

impl<'a> VisitInfo<'a> {
    /// Registry the traversal runs against.
    pub fn registry(&self) -> &'a AttributeRegistry {
        self.registry
    }

    /// Node cube.
    pub fn bounds(&self) -> Region {
        Region::cube(self.minimum, self.size)
    }

    /// Effective value of an input attribute at this node.
    pub fn input(&self, attribute: AttributeId) -> Option<&AttributeValue> {
        self.inputs
            .iter()
            .position(|a| *a == attribute)
            .map(|index| &self.input_values[index])
    }

    /// Value assigned to an output so far, if any.
    pub fn output(&self, attribute: AttributeId) -> Option<&AttributeValue> {
        self.outputs
            .iter()
            .position(|a| *a == attribute)
            .and_then(|index| self.output_values[index].as_ref())
    }

    /// Output if assigned, otherwise the input value.
    pub fn current(&self, attribute: AttributeId) -> Option<&AttributeValue> {
        self.output(attribute).or_else(|| self.input(attribute))
    }

    /// Assign an output. Returns `false` if `attribute` is not an output of
    /// this traversal.
    pub fn set_output(&mut self, attribute: AttributeId, value: AttributeValue) -> bool {
        match self.outputs.iter().position(|a| *a == attribute) {
            Some(index) => {
                self.output_values[index] = Some(value);
                true
            }
            None => false,
        }
    }

    /// Visit info of the parent node; `None` at the root.
    pub fn parent(&self) -> Option<&'a VisitInfo<'a>> {
        self.parent
    }

    /// Ancestor `levels` above this node, clamped to the root.
    pub fn ancestor(&self, levels: usize) -> &VisitInfo<'a> {
        let mut info = self;
        for _ in 0..levels {
            match info.parent {
                Some(parent) => info = parent,
                None => break,
            }
        }
        info
    }
}

/// Runs one traversal and returns the (possibly new) root.
pub(crate) struct Guide<'g, V: ?Sized> {
    registry: &'g AttributeRegistry,
    inputs: &'g [AttributeId],
    outputs: &'g [AttributeId],
    /// Inputs and outputs, deduplicated; effective values are tracked per slot.
    tracked: Vec<AttributeId>,
    input_slots: Vec<usize>,
    output_slots: Vec<usize>,
    visitor: &'g mut V,
    writable: bool,
}

fn slot_of(tracked: &mut Vec<AttributeId>, attribute: AttributeId) -> usize {
    match tracked.iter().position(|a| *a == attribute) {
        Some(index) => index,
        None => {
            tracked.push(attribute);
            tracked.len() - 1
        }
    }
}

impl<'g, V: Visitor + ?Sized> Guide<'g, V> {
    pub(crate) fn new(
        registry: &'g AttributeRegistry,
        inputs: &'g [AttributeId],
        outputs: &'g [AttributeId],
        visitor: &'g mut V,
        writable: bool,
    ) -> Self {
        let mut tracked = Vec::with_capacity(inputs.len() + outputs.len());
        let input_slots = inputs.iter().map(|a| slot_of(&mut tracked, *a)).collect();
        let output_slots = outputs.iter().map(|a| slot_of(&mut tracked, *a)).collect();
        Self {
            registry,
            inputs,
            outputs,
            tracked,
            input_slots,
            output_slots,
            visitor,
            writable,
        }
    }

    /// Traverse from `root`, whose cube starts at `minimum` with edge `size`.
    pub(crate) fn run(&mut self, root: &Arc<Node>, minimum: Vec3, size: f32) -> Arc<Node> {
        let defaults: Vec<AttributeValue> = self
            .tracked
            .iter()
            .map(|a| self.registry.default_value(*a).clone())
            .collect();
        self.walk(root, minimum, size, 0, &defaults, None)
    }

    fn walk(
        &mut self,
        node: &Arc<Node>,
        minimum: Vec3,
        size: f32,
        depth: u32,
        inherited: &[AttributeValue],
        parent: Option<&VisitInfo<'_>>,
    ) -> Arc<Node> {
        let mut current: Vec<AttributeValue> = self
            .tracked
            .iter()
            .zip(inherited)
            .map(|(attribute, value)| node.value(*attribute).unwrap_or(value).clone())
            .collect();

        let outputs = self.outputs;
        let mut info = VisitInfo {
            registry: self.registry,
            minimum,
            size,
            is_leaf: node.is_leaf(),
            depth,
            inputs: self.inputs,
            input_values: self.input_slots.iter().map(|slot| current[*slot].clone()).collect(),
            outputs,
            output_values: vec![None; outputs.len()],
            parent,
        };
        let outcome = self.visitor.visit(&mut info);

        // Commit outputs, stored only where they differ from the inherited value.
        let mut values: Option<BTreeMap<AttributeId, AttributeValue>> = None;
        let mut written = Vec::new();
        for (index, attribute) in outputs.iter().enumerate() {
            let Some(value) = info.output_values[index].take() else {
                continue;
            };
            let slot = self.output_slots[index];
            let values = values.get_or_insert_with(|| node.values().clone());
            if self.registry.get(*attribute).equal(&value, &inherited[slot]) {
                values.remove(attribute);
            } else {
                values.insert(*attribute, value.clone());
            }
            current[slot] = value;
            written.push(*attribute);
        }
        let values_changed = values.as_ref().is_some_and(|values| values != node.values());

        let mut stop = outcome == VisitOutcome::StopRecursion || (!self.writable && node.is_leaf());
        if !stop && depth >= MAX_DEPTH {
            tracing::debug!(depth, size, "refinement past depth limit ignored");
            stop = true;
        }

        if stop {
            if written.is_empty() {
                return Arc::clone(node);
            }
            let values = values.unwrap_or_else(|| node.values().clone());
            let Some(children) = node.children() else {
                return if values_changed {
                    Arc::new(Node::leaf(values))
                } else {
                    Arc::clone(node)
                };
            };
            let stripped: [Arc<Node>; 8] = std::array::from_fn(|i| Node::without(&children[i], &written));
            let children_changed = stripped.iter().zip(children).any(|(new, old)| !Arc::ptr_eq(new, old));
            if !values_changed && !children_changed {
                return Arc::clone(node);
            }
            let merged = Node::coalesced(values, Box::new(stripped));
            return Arc::new(self.normalized(merged, inherited));
        }

        let source = node.children().cloned().unwrap_or_else(|| *Node::empty_children());
        let child_size = size * 0.5;
        let next: [Arc<Node>; 8] = std::array::from_fn(|octant| {
            self.walk(
                &source[octant],
                Node::child_minimum(minimum, child_size, octant),
                child_size,
                depth + 1,
                &current,
                Some(&info),
            )
        });

        let children_unchanged = node
            .children()
            .is_some_and(|old| old.iter().zip(&next).all(|(old, new)| Arc::ptr_eq(old, new)));
        if children_unchanged && !values_changed {
            return Arc::clone(node);
        }
        let values = values.unwrap_or_else(|| node.values().clone());
        let rebuilt = self.normalized(Node::coalesced(values, Box::new(next)), inherited);
        if node.is_leaf() && rebuilt == **node {
            return Arc::clone(node);
        }
        Arc::new(rebuilt)
    }

    /// Drop tracked values that merely repeat what the node inherits. Only
    /// needed after children were merged up into the node.
    fn normalized(&self, node: Node, inherited: &[AttributeValue]) -> Node {
        if !node.is_leaf() {
            return node;
        }
        let (mut values, _) = node.into_parts();
        for (attribute, inherited) in self.tracked.iter().zip(inherited) {
            if values
                .get(attribute)
                .is_some_and(|value| self.registry.get(*attribute).equal(value, inherited))
            {
                values.remove(attribute);
            }
        }
        Node::leaf(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Rgba;

    fn run_write<V: Visitor>(root: &Arc<Node>, outputs: &[AttributeId], visitor: &mut V) -> Arc<Node> {
        let registry = AttributeRegistry::new();
        Guide::new(&registry, outputs, outputs, visitor, true).run(root, Vec3::ZERO, 1.0)
    }

    fn red() -> AttributeValue {
        AttributeValue::Color(Rgba::opaque(255, 0, 0))
    }

    #[test]
    fn test_stop_at_root_writes_root() {
        let mut visitor = |info: &mut VisitInfo<'_>| {
            info.set_output(AttributeId::COLOR, red());
            VisitOutcome::StopRecursion
        };
        let root = run_write(&Node::empty(), &[AttributeId::COLOR], &mut visitor);
        assert!(root.is_leaf());
        assert_eq!(root.value(AttributeId::COLOR), Some(&red()));
    }

    #[test]
    fn test_default_value_write_is_normalized_away() {
        let mut visitor = |info: &mut VisitInfo<'_>| {
            info.set_output(AttributeId::COLOR, AttributeValue::Color(Rgba::TRANSPARENT));
            VisitOutcome::StopRecursion
        };
        let empty = Node::empty();
        let root = run_write(&empty, &[AttributeId::COLOR], &mut visitor);
        assert!(Arc::ptr_eq(&root, &empty));
    }

    #[test]
    fn test_single_octant_write_splits_once() {
        let mut visitor = |info: &mut VisitInfo<'_>| {
            if info.depth == 0 {
                return VisitOutcome::DefaultOrder;
            }
            if info.minimum == Vec3::ZERO {
                info.set_output(AttributeId::COLOR, red());
            }
            VisitOutcome::StopRecursion
        };
        let root = run_write(&Node::empty(), &[AttributeId::COLOR], &mut visitor);
        assert_eq!(root.depth(), 1);
        let children = root.children().unwrap();
        assert_eq!(children[0].value(AttributeId::COLOR), Some(&red()));
        assert!(children[1].values().is_empty());
    }

    #[test]
    fn test_uniform_writes_coalesce_to_leaf() {
        let mut visitor = |info: &mut VisitInfo<'_>| {
            if info.depth == 0 {
                return VisitOutcome::DefaultOrder;
            }
            info.set_output(AttributeId::COLOR, red());
            VisitOutcome::StopRecursion
        };
        let root = run_write(&Node::empty(), &[AttributeId::COLOR], &mut visitor);
        assert!(root.is_leaf());
        assert_eq!(root.value(AttributeId::COLOR), Some(&red()));
    }

    #[test]
    fn test_stop_strips_descendant_overrides() {
        let mut paint_corner = |info: &mut VisitInfo<'_>| {
            if info.depth < 2 {
                return VisitOutcome::DefaultOrder;
            }
            if info.minimum == Vec3::ZERO {
                info.set_output(AttributeId::COLOR, red());
            }
            VisitOutcome::StopRecursion
        };
        let painted = run_write(&Node::empty(), &[AttributeId::COLOR], &mut paint_corner);
        assert_eq!(painted.depth(), 2);

        let white = AttributeValue::Color(Rgba::WHITE);
        let mut fill = |info: &mut VisitInfo<'_>| {
            info.set_output(AttributeId::COLOR, white.clone());
            VisitOutcome::StopRecursion
        };
        let filled = run_write(&painted, &[AttributeId::COLOR], &mut fill);
        assert!(filled.is_leaf());
        assert_eq!(filled.value(AttributeId::COLOR), Some(&white));
    }

    #[test]
    fn test_read_only_never_descends_below_leaf() {
        let registry = AttributeRegistry::new();
        let mut visited = 0;
        let mut visitor = |_: &mut VisitInfo<'_>| {
            visited += 1;
            VisitOutcome::DefaultOrder
        };
        let root = Node::empty();
        let result = Guide::new(&registry, &[AttributeId::COLOR], &[], &mut visitor, false).run(
            &root,
            Vec3::ZERO,
            1.0,
        );
        assert_eq!(visited, 1);
        assert!(Arc::ptr_eq(&root, &result));
    }

    #[test]
    fn test_unbounded_refinement_stops_at_depth_limit() {
        let mut visitor = |info: &mut VisitInfo<'_>| {
            if info.minimum == Vec3::ZERO && info.depth == MAX_DEPTH {
                info.set_output(AttributeId::COLOR, red());
            }
            if info.minimum == Vec3::ZERO {
                VisitOutcome::DefaultOrder
            } else {
                VisitOutcome::StopRecursion
            }
        };
        let root = run_write(&Node::empty(), &[AttributeId::COLOR], &mut visitor);
        assert_eq!(root.depth(), MAX_DEPTH);
    }

    #[test]
    fn test_ancestor_clamps_to_root() {
        let registry = AttributeRegistry::new();
        let mut root_sizes = Vec::new();
        let mut visitor = |info: &mut VisitInfo<'_>| {
            if info.depth == 2 {
                root_sizes.push(info.ancestor(10).size);
                assert_eq!(info.ancestor(1).size, info.size * 2.0);
                return VisitOutcome::StopRecursion;
            }
            VisitOutcome::DefaultOrder
        };
        let outputs = [AttributeId::COLOR];
        Guide::new(&registry, &outputs, &outputs, &mut visitor, true).run(&Node::empty(), Vec3::ZERO, 4.0);
        assert_eq!(root_sizes.len(), 64);
        assert!(root_sizes.iter().all(|size| *size == 4.0));
    }
}
